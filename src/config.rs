use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::analysis::AnalysisOptions;
use crate::resource::{ConfigError, ResourceKindSpec, ResourceTable};

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LeakLintConfig {
    /// Resource kinds to track. Empty means the built-in heap rules.
    pub resource_kinds: Vec<ResourceKindSpec>,

    /// Per-function wall-clock bound in milliseconds. 0 disables it.
    pub analysis_timeout_ms: u64,

    /// Per-variable alias-set bound, 0 meaning unbounded.
    pub alias_depth_limit: usize,

    /// Hard cap on fixpoint sweeps per function.
    pub max_fixpoint_iterations: usize,
}

impl Default for LeakLintConfig {
    fn default() -> Self {
        let options = AnalysisOptions::default();
        Self {
            resource_kinds: Vec::new(),
            analysis_timeout_ms: 0,
            alias_depth_limit: options.alias_depth_limit,
            max_fixpoint_iterations: options.max_fixpoint_iterations,
        }
    }
}

impl LeakLintConfig {
    /// Build the resource table from the configured kinds, falling back to
    /// the built-in heap rules when none are given.
    pub fn resource_table(&self) -> std::result::Result<ResourceTable, ConfigError> {
        if self.resource_kinds.is_empty() {
            return Ok(ResourceTable::heap_defaults());
        }
        ResourceTable::from_specs(&self.resource_kinds)
    }

    #[must_use]
    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            timeout: (self.analysis_timeout_ms > 0)
                .then(|| Duration::from_millis(self.analysis_timeout_ms)),
            alias_depth_limit: self.alias_depth_limit,
            max_fixpoint_iterations: self.max_fixpoint_iterations,
        }
    }
}

pub const DEFAULT_CONFIG_FILE_NAME: &str = "leaklint.toml";

pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    let mut cur = Some(start_dir);
    while let Some(dir) = cur {
        let candidate = dir.join(DEFAULT_CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        cur = dir.parent();
    }
    None
}

pub fn load_config_file(path: &Path) -> Result<LeakLintConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let cfg: LeakLintConfig = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    Ok(cfg)
}

pub fn load_config(
    explicit_path: Option<&Path>,
    start_dir: &Path,
) -> Result<Option<(PathBuf, LeakLintConfig)>> {
    if let Some(p) = explicit_path {
        let cfg = load_config_file(p)?;
        return Ok(Some((p.to_path_buf(), cfg)));
    }

    let Some(p) = find_config_file(start_dir) else {
        return Ok(None);
    };
    let cfg = load_config_file(&p)?;
    Ok(Some((p, cfg)))
}
