//! Resource model: which callees acquire, release, or take over a resource.
//!
//! The table is built once from configuration, validated, and then shared
//! read-only with every function analysis. The analyzer never matches on
//! callee strings itself; every call site resolves to a [`CallRole`] through
//! one lookup here.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Validation failures in the resource-kind rules. All of these are fatal:
/// the run aborts before any function is analyzed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("resource kind `{kind}` needs both an acquire and a release rule")]
    UnknownResourceConfig { kind: String },

    #[error("resource kind name must not be empty")]
    EmptyKindName,

    #[error("resource kind `{kind}` is declared more than once")]
    DuplicateKind { kind: String },

    #[error("callee `{callee}` is claimed by kind `{first}` and again by kind `{second}`")]
    ConflictingCallee {
        callee: String,
        first: String,
        second: String,
    },

    #[error("transfer rule for `{callee}` lists no parameter positions")]
    EmptyTransferPositions { callee: String },
}

impl From<ConfigError> for crate::error::LeakLintError {
    fn from(err: ConfigError) -> Self {
        crate::error::LeakLintError::resource(err.to_string())
    }
}

// ============================================================================
// Kinds and Roles
// ============================================================================

/// Index of a resource kind in the table. Kinds are independent typed
/// classes: a release of kind A never satisfies an acquisition of kind B.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindId(u32);

impl KindId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Role a callee plays for some resource kind, resolved once per call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRole {
    /// The call produces a fresh instance of the kind.
    Acquire(KindId),
    /// The call releases whatever its operand aliases.
    Release(KindId),
    /// The call takes ownership of the arguments at `positions` (0-based).
    Transfer { kind: KindId, positions: Vec<usize> },
    /// No resource significance.
    Neutral,
}

const NEUTRAL: CallRole = CallRole::Neutral;

// ============================================================================
// Configuration-facing rule specs
// ============================================================================

/// One resource kind as written in `leaklint.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceKindSpec {
    pub kind_name: String,
    #[serde(default)]
    pub acquire_callees: Vec<String>,
    #[serde(default)]
    pub release_callees: Vec<String>,
    /// Callee name to the 0-based argument positions it takes ownership of.
    #[serde(default)]
    pub transfer_param_positions: BTreeMap<String, Vec<usize>>,
}

// ============================================================================
// Resource Table
// ============================================================================

/// Immutable callee classification table.
#[derive(Debug, Clone)]
pub struct ResourceTable {
    kinds: Vec<String>,
    roles: HashMap<String, CallRole>,
}

impl ResourceTable {
    /// Build and validate a table from configuration rules.
    ///
    /// Every kind must carry at least one acquire and one release callee, and
    /// a callee may play a role for at most one kind.
    pub fn from_specs(specs: &[ResourceKindSpec]) -> Result<Self, ConfigError> {
        let mut kinds: Vec<String> = Vec::with_capacity(specs.len());
        let mut roles: HashMap<String, CallRole> = HashMap::new();
        let mut owner_kind: HashMap<String, String> = HashMap::new();

        for spec in specs {
            if spec.kind_name.is_empty() {
                return Err(ConfigError::EmptyKindName);
            }
            if kinds.iter().any(|k| k == &spec.kind_name) {
                return Err(ConfigError::DuplicateKind {
                    kind: spec.kind_name.clone(),
                });
            }
            if spec.acquire_callees.is_empty() || spec.release_callees.is_empty() {
                return Err(ConfigError::UnknownResourceConfig {
                    kind: spec.kind_name.clone(),
                });
            }

            let kind = KindId(kinds.len() as u32);
            kinds.push(spec.kind_name.clone());

            for callee in &spec.acquire_callees {
                Self::claim(
                    &mut roles,
                    &mut owner_kind,
                    callee,
                    &spec.kind_name,
                    CallRole::Acquire(kind),
                )?;
            }
            for callee in &spec.release_callees {
                Self::claim(
                    &mut roles,
                    &mut owner_kind,
                    callee,
                    &spec.kind_name,
                    CallRole::Release(kind),
                )?;
            }
            for (callee, positions) in &spec.transfer_param_positions {
                if positions.is_empty() {
                    return Err(ConfigError::EmptyTransferPositions {
                        callee: callee.clone(),
                    });
                }
                Self::claim(
                    &mut roles,
                    &mut owner_kind,
                    callee,
                    &spec.kind_name,
                    CallRole::Transfer {
                        kind,
                        positions: positions.clone(),
                    },
                )?;
            }
        }

        Ok(Self { kinds, roles })
    }

    fn claim(
        roles: &mut HashMap<String, CallRole>,
        owner_kind: &mut HashMap<String, String>,
        callee: &str,
        kind_name: &str,
        role: CallRole,
    ) -> Result<(), ConfigError> {
        if let Some(first) = owner_kind.get(callee) {
            return Err(ConfigError::ConflictingCallee {
                callee: callee.to_string(),
                first: first.clone(),
                second: kind_name.to_string(),
            });
        }
        owner_kind.insert(callee.to_string(), kind_name.to_string());
        roles.insert(callee.to_string(), role);
        Ok(())
    }

    /// Table covering the C heap allocator family, so the fixture corpus
    /// analyzes with zero configuration.
    #[must_use]
    pub fn heap_defaults() -> Self {
        let spec = ResourceKindSpec {
            kind_name: "heap".to_string(),
            acquire_callees: vec!["malloc".to_string(), "calloc".to_string()],
            release_callees: vec!["free".to_string()],
            transfer_param_positions: BTreeMap::new(),
        };
        Self::from_specs(&[spec]).expect("built-in heap rules are well formed")
    }

    /// Resolve a callee to its role. Unregistered callees are [`CallRole::Neutral`].
    #[must_use]
    pub fn classify(&self, callee: &str) -> &CallRole {
        self.roles.get(callee).unwrap_or(&NEUTRAL)
    }

    #[must_use]
    pub fn kind_name(&self, kind: KindId) -> &str {
        &self.kinds[kind.index()]
    }

    /// Kind names in declaration order.
    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.kinds.iter().map(String::as_str)
    }

    /// Callees registered for a kind, split into (acquire, release, transfer)
    /// lists in sorted order. Used by the `list-kinds` command.
    #[must_use]
    pub fn rules_for(&self, kind: KindId) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
        let mut acquire = Vec::new();
        let mut release = Vec::new();
        let mut transfer = Vec::new();
        for (callee, role) in &self.roles {
            match role {
                CallRole::Acquire(k) if *k == kind => acquire.push(callee.as_str()),
                CallRole::Release(k) if *k == kind => release.push(callee.as_str()),
                CallRole::Transfer { kind: k, .. } if *k == kind => transfer.push(callee.as_str()),
                _ => {}
            }
        }
        acquire.sort_unstable();
        release.sort_unstable();
        transfer.sort_unstable();
        (acquire, release, transfer)
    }

    #[must_use]
    pub fn kind_ids(&self) -> impl Iterator<Item = KindId> {
        (0..self.kinds.len() as u32).map(KindId)
    }
}

impl Default for ResourceTable {
    fn default() -> Self {
        Self::heap_defaults()
    }
}
