//! Finding types and the per-function diagnostic aggregator.
//!
//! The analyzer hands over raw leak events keyed by allocation site; this
//! module folds them into deduplicated, deterministically ordered findings
//! with rendered messages, and carries the per-function skip diagnostics for
//! functions the analyzer could not finish.

use std::collections::BTreeSet;
use std::fmt;

use itertools::Itertools;
use serde::Serialize;

use crate::analysis::{FunctionAnalysis, SiteId};
use crate::ast::SourcePos;
use crate::cfg::EdgeKind;
use crate::resource::ResourceTable;

// ============================================================================
// Event Types
// ============================================================================

/// How sure the analysis is that the leak happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// Leaked on some, but not all, paths.
    Possible,
    /// Leaked on every path that reaches the report point.
    Definite,
}

impl Confidence {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Confidence::Possible => "possible",
            Confidence::Definite => "definite",
        }
    }
}

/// What kind of leak was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LeakKind {
    /// Still owed a release when the function exits.
    EndOfFunction,
    /// The last alias was overwritten while the resource was still live.
    Reassignment,
}

impl LeakKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LeakKind::EndOfFunction => "end_of_function",
            LeakKind::Reassignment => "reassignment",
        }
    }
}

/// One concrete path through the CFG demonstrating a leak: the blocks
/// visited and the kind of each edge taken between them.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct WitnessPath {
    pub blocks: Vec<usize>,
    pub kinds: Vec<EdgeKind>,
}

impl fmt::Display for WitnessPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, block) in self.blocks.iter().enumerate() {
            if i > 0 {
                write!(f, " -{}-> ", self.kinds[i - 1].as_str())?;
            }
            write!(f, "b{block}")?;
        }
        Ok(())
    }
}

impl Serialize for WitnessPath {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Raw leak observation produced by the analyzer, before aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeakEvent {
    pub site: SiteId,
    pub leak: LeakKind,
    pub confidence: Confidence,
    /// The acquisition for end-of-function leaks, the overwriting assignment
    /// for reassignment leaks.
    pub pos: SourcePos,
    pub witnesses: Vec<WitnessPath>,
}

// ============================================================================
// Skip Diagnostics
// ============================================================================

/// Why a function was skipped instead of analyzed to completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    MalformedControlFlow { detail: String },
    Timeout { iterations: usize },
    Cancelled { iterations: usize },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::MalformedControlFlow { detail } => write!(f, "{detail}"),
            SkipReason::Timeout { iterations } => {
                write!(f, "analysis timed out after {iterations} fixpoint iterations")
            }
            SkipReason::Cancelled { iterations } => {
                write!(f, "analysis cancelled after {iterations} fixpoint iterations")
            }
        }
    }
}

/// Per-function notice that no findings were produced and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalysisDiagnostic {
    pub function: String,
    #[serde(flatten)]
    pub reason: SkipReason,
}

impl fmt::Display for AnalysisDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "function `{}` skipped: {}", self.function, self.reason)
    }
}

// ============================================================================
// Findings
// ============================================================================

/// One reportable leak, aggregated and rendered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub function: String,
    pub resource_kind: String,
    /// Callee of the acquiring call.
    pub callee: String,
    pub allocation: SiteId,
    pub acquired_at: SourcePos,
    pub leak: LeakKind,
    pub confidence: Confidence,
    /// Where the report anchors: the acquisition for end-of-function leaks,
    /// the overwriting assignment for reassignment leaks.
    pub pos: SourcePos,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub witnesses: Vec<WitnessPath>,
    pub message: String,
}

/// Fold raw events into findings: drop the end-of-function echo of an
/// already-orphaned site, merge duplicate observations of the same leak,
/// and order the result by position then allocation site.
#[must_use]
pub fn aggregate(
    analysis: &FunctionAnalysis,
    table: &ResourceTable,
    function: &str,
) -> Vec<Finding> {
    let orphaned: BTreeSet<SiteId> = analysis
        .events
        .iter()
        .filter(|event| event.leak == LeakKind::Reassignment)
        .map(|event| event.site)
        .collect();

    let groups = analysis
        .events
        .iter()
        .filter(|event| !(event.leak == LeakKind::EndOfFunction && orphaned.contains(&event.site)))
        .map(|event| ((event.site, event.leak, event.pos), event))
        .into_group_map();

    let mut findings: Vec<Finding> = groups
        .into_iter()
        .map(|((site_id, leak, pos), events)| {
            let site = &analysis.sites[site_id.index()];
            let confidence = events
                .iter()
                .map(|event| event.confidence)
                .max()
                .unwrap_or(Confidence::Possible);
            let witnesses: Vec<WitnessPath> = events
                .iter()
                .flat_map(|event| event.witnesses.iter().cloned())
                .sorted()
                .dedup()
                .collect();
            let resource_kind = table.kind_name(site.kind).to_string();
            let message = render_message(
                &resource_kind,
                &site.callee,
                site.owner.as_deref(),
                leak,
                confidence,
                site.pos,
            );
            Finding {
                function: function.to_string(),
                resource_kind,
                callee: site.callee.clone(),
                allocation: site_id,
                acquired_at: site.pos,
                leak,
                confidence,
                pos,
                owner: site.owner.clone(),
                witnesses,
                message,
            }
        })
        .collect();

    findings.sort_by(|a, b| {
        (a.pos, a.allocation, a.leak).cmp(&(b.pos, b.allocation, b.leak))
    });
    findings
}

fn render_message(
    resource_kind: &str,
    callee: &str,
    owner: Option<&str>,
    leak: LeakKind,
    confidence: Confidence,
    acquired_at: SourcePos,
) -> String {
    let subject = match owner {
        Some(var) => format!("`{var}` (acquired from `{callee}`)"),
        None => format!("`{callee}` result"),
    };
    match (leak, confidence) {
        (LeakKind::EndOfFunction, Confidence::Definite) => format!(
            "{resource_kind} resource {subject} is never released before the function returns"
        ),
        (LeakKind::EndOfFunction, Confidence::Possible) => format!(
            "{resource_kind} resource {subject} may not be released on some path to the function exit"
        ),
        (LeakKind::Reassignment, Confidence::Definite) => format!(
            "{resource_kind} resource {subject} acquired at {acquired_at} loses its last reference before being released"
        ),
        (LeakKind::Reassignment, Confidence::Possible) => format!(
            "{resource_kind} resource {subject} acquired at {acquired_at} may lose its last reference before being released"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AllocationSite;

    fn heap_table() -> ResourceTable {
        ResourceTable::heap_defaults()
    }

    fn site(id: u32, line: usize, owner: Option<&str>) -> AllocationSite {
        let table = heap_table();
        let kind = table
            .kind_ids()
            .next()
            .expect("default table has one kind");
        AllocationSite {
            id: SiteId(id),
            kind,
            callee: "malloc".to_string(),
            pos: SourcePos::new(line, 5),
            owner: owner.map(str::to_string),
        }
    }

    fn path(blocks: &[usize], kinds: &[EdgeKind]) -> WitnessPath {
        WitnessPath {
            blocks: blocks.to_vec(),
            kinds: kinds.to_vec(),
        }
    }

    fn analysis_of(sites: Vec<AllocationSite>, events: Vec<LeakEvent>) -> FunctionAnalysis {
        FunctionAnalysis {
            sites,
            releases: vec![],
            events,
            iterations: 1,
        }
    }

    #[test]
    fn witness_path_renders_edges_between_blocks() {
        let rendered = path(&[0, 2, 1], &[EdgeKind::BranchFalse, EdgeKind::Return]).to_string();
        assert_eq!(rendered, "b0 -branch_false-> b2 -return-> b1");
    }

    #[test]
    fn duplicate_events_merge_their_witnesses() {
        let a = path(&[0, 1], &[EdgeKind::Return]);
        let b = path(&[0, 2, 1], &[EdgeKind::BranchTrue, EdgeKind::Return]);
        let event = |witness: WitnessPath| LeakEvent {
            site: SiteId(0),
            leak: LeakKind::EndOfFunction,
            confidence: Confidence::Definite,
            pos: SourcePos::new(2, 5),
            witnesses: vec![witness],
        };
        let analysis = analysis_of(
            vec![site(0, 2, Some("p"))],
            vec![event(a.clone()), event(b.clone()), event(a.clone())],
        );
        let findings = aggregate(&analysis, &heap_table(), "f");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].witnesses, vec![a, b]);
    }

    #[test]
    fn reassignment_suppresses_the_end_of_function_echo() {
        let analysis = analysis_of(
            vec![site(0, 2, Some("p"))],
            vec![
                LeakEvent {
                    site: SiteId(0),
                    leak: LeakKind::Reassignment,
                    confidence: Confidence::Definite,
                    pos: SourcePos::new(4, 5),
                    witnesses: vec![path(&[0], &[])],
                },
                LeakEvent {
                    site: SiteId(0),
                    leak: LeakKind::EndOfFunction,
                    confidence: Confidence::Definite,
                    pos: SourcePos::new(2, 5),
                    witnesses: vec![path(&[0, 1], &[EdgeKind::Return])],
                },
            ],
        );
        let findings = aggregate(&analysis, &heap_table(), "f");
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].leak, LeakKind::Reassignment);
        assert_eq!(findings[0].pos, SourcePos::new(4, 5));
        assert_eq!(findings[0].acquired_at, SourcePos::new(2, 5));
    }

    #[test]
    fn findings_sort_by_position_then_site() {
        let analysis = analysis_of(
            vec![site(0, 9, None), site(1, 3, None)],
            vec![
                LeakEvent {
                    site: SiteId(0),
                    leak: LeakKind::EndOfFunction,
                    confidence: Confidence::Definite,
                    pos: SourcePos::new(9, 5),
                    witnesses: vec![],
                },
                LeakEvent {
                    site: SiteId(1),
                    leak: LeakKind::EndOfFunction,
                    confidence: Confidence::Possible,
                    pos: SourcePos::new(3, 5),
                    witnesses: vec![],
                },
            ],
        );
        let findings = aggregate(&analysis, &heap_table(), "f");
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].allocation, SiteId(1));
        assert_eq!(findings[1].allocation, SiteId(0));
    }

    #[test]
    fn messages_name_the_owner_when_known() {
        let analysis = analysis_of(
            vec![site(0, 2, Some("buf"))],
            vec![LeakEvent {
                site: SiteId(0),
                leak: LeakKind::EndOfFunction,
                confidence: Confidence::Definite,
                pos: SourcePos::new(2, 5),
                witnesses: vec![],
            }],
        );
        let findings = aggregate(&analysis, &heap_table(), "f");
        assert!(findings[0].message.contains("`buf`"));
        assert!(findings[0].message.contains("`malloc`"));
        assert!(findings[0].message.contains("never released"));
    }
}
