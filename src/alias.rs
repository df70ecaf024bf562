//! Flow-sensitive may-alias approximation.
//!
//! Each tracked variable maps to the set of allocation sites its current
//! value may denote. Assignments are strong updates (the old binding is
//! gone); joins at CFG merge points union the sets, which is where the
//! may-alias over-approximation grows. A variable whose set would exceed the
//! configured limit degrades to untracked: it may alias anything, so releases
//! through it prove nothing. Over-approximation errs toward unreleased,
//! which is the sound direction for a leak detector.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis::SiteId;

#[derive(Debug, Clone, PartialEq, Eq)]
enum AliasEntry {
    Tracked(BTreeSet<SiteId>),
    Untracked,
}

/// Variable-to-site alias map at one program point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasMap {
    vars: BTreeMap<String, AliasEntry>,
}

impl AliasMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Strong update: `var` now denotes exactly this freshly acquired site.
    pub fn bind_site(&mut self, var: &str, site: SiteId) {
        let mut set = BTreeSet::new();
        set.insert(site);
        self.vars.insert(var.to_string(), AliasEntry::Tracked(set));
    }

    /// Strong update for `dst = src`: `dst` may denote whatever `src` may.
    pub fn bind_copy(&mut self, dst: &str, src: &str) {
        match self.vars.get(src).cloned() {
            Some(entry) => {
                self.vars.insert(dst.to_string(), entry);
            }
            None => {
                self.vars.remove(dst);
            }
        }
    }

    /// `var` was overwritten with a value that denotes no tracked resource.
    pub fn clear(&mut self, var: &str) {
        self.vars.remove(var);
    }

    /// Sites `var` may denote, when tracked. `None` for unbound or untracked
    /// variables; callers must not release or escape anything through those.
    #[must_use]
    pub fn sites_of(&self, var: &str) -> Option<&BTreeSet<SiteId>> {
        match self.vars.get(var) {
            Some(AliasEntry::Tracked(set)) => Some(set),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_untracked(&self, var: &str) -> bool {
        matches!(self.vars.get(var), Some(AliasEntry::Untracked))
    }

    /// True when `var` is provably the only remaining way to reach `site`:
    /// `var` tracks the site and no other variable (tracked or untracked)
    /// may denote it. Overwriting such a variable orphans the site.
    #[must_use]
    pub fn sole_alias_is(&self, var: &str, site: SiteId) -> bool {
        let Some(set) = self.sites_of(var) else {
            return false;
        };
        if !set.contains(&site) {
            return false;
        }
        self.vars.iter().all(|(name, entry)| {
            if name == var {
                return true;
            }
            match entry {
                AliasEntry::Tracked(other) => !other.contains(&site),
                AliasEntry::Untracked => false,
            }
        })
    }

    /// Join with the alias map of another predecessor. Per-variable union of
    /// tracked sets; untracked absorbs; a variable bound on only one side
    /// keeps that side's entry (it may alias those sites). `limit` bounds the
    /// unioned set size, 0 meaning unbounded.
    pub fn join(&mut self, other: &AliasMap, limit: usize) {
        for (var, entry) in &other.vars {
            match (self.vars.get_mut(var), entry) {
                (None, entry) => {
                    self.vars.insert(var.clone(), entry.clone());
                }
                (Some(AliasEntry::Untracked), _) => {}
                (Some(slot @ AliasEntry::Tracked(_)), AliasEntry::Untracked) => {
                    *slot = AliasEntry::Untracked;
                }
                (Some(AliasEntry::Tracked(mine)), AliasEntry::Tracked(theirs)) => {
                    mine.extend(theirs.iter().copied());
                    if limit > 0 && mine.len() > limit {
                        self.vars.insert(var.clone(), AliasEntry::Untracked);
                    }
                }
            }
        }
    }

    /// Tracked variables and their sites, in name order.
    pub fn tracked(&self) -> impl Iterator<Item = (&str, &BTreeSet<SiteId>)> {
        self.vars.iter().filter_map(|(name, entry)| match entry {
            AliasEntry::Tracked(set) => Some((name.as_str(), set)),
            AliasEntry::Untracked => None,
        })
    }
}
