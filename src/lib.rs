//! Core leak analysis engine.
//!
//! The crate exposes an `AnalysisEngine` that lowers function ASTs to
//! control-flow graphs and runs a path-sensitive release-obligation
//! analysis over them, reporting unreleased resources as findings.

pub mod alias;
pub mod analysis;
pub mod ast;
pub mod cfg;
pub mod cli;
pub mod config;
pub mod error;
pub mod findings;
pub mod resource;
pub mod telemetry;

use rayon::prelude::*;
use serde::Serialize;

use crate::analysis::{AnalysisOptions, CancelToken};
use crate::ast::{FunctionAst, ProgramAst};
use crate::cfg::Cfg;
use crate::config::LeakLintConfig;
use crate::error::{LeakLintError, LeakResult};
use crate::findings::{AnalysisDiagnostic, Finding, SkipReason, aggregate};
use crate::resource::ResourceTable;

/// Everything one engine run produced: findings from analyzed functions
/// plus a diagnostic per skipped function.
#[derive(Debug, Default, Serialize)]
pub struct ProgramReport {
    pub findings: Vec<Finding>,
    pub diagnostics: Vec<AnalysisDiagnostic>,
}

impl ProgramReport {
    pub fn merge(&mut self, other: ProgramReport) {
        self.findings.extend(other.findings);
        self.diagnostics.extend(other.diagnostics);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty() && self.diagnostics.is_empty()
    }
}

/// Engine orchestrates analysis by lowering each function to a CFG and
/// running the leak fixpoint over it.
pub struct AnalysisEngine {
    table: ResourceTable,
    options: AnalysisOptions,
}

impl AnalysisEngine {
    /// Create a new engine with default analysis options.
    pub fn new(table: ResourceTable) -> Self {
        Self {
            table,
            options: AnalysisOptions::default(),
        }
    }

    /// Create a new engine with explicit options (e.g. from config).
    pub fn new_with_options(table: ResourceTable, options: AnalysisOptions) -> Self {
        Self { table, options }
    }

    /// Build an engine from a loaded config file.
    pub fn from_config(config: &LeakLintConfig) -> LeakResult<Self> {
        let table = config.resource_table()?;
        Ok(Self::new_with_options(table, config.analysis_options()))
    }

    #[must_use]
    pub fn resource_table(&self) -> &ResourceTable {
        &self.table
    }

    /// Analyze one function: findings on success, the skip reason otherwise.
    pub fn analyze_function(
        &self,
        function: &FunctionAst,
        cancel: &CancelToken,
    ) -> Result<Vec<Finding>, SkipReason> {
        let cfg = Cfg::build(function)
            .and_then(|cfg| cfg.validate().map(|()| cfg))
            .map_err(|err| SkipReason::MalformedControlFlow {
                detail: err.to_string(),
            })?;
        let analysis = analysis::analyze(&cfg, &self.table, &self.options, cancel)?;
        Ok(aggregate(&analysis, &self.table, &function.name))
    }

    /// Analyze every function of a program, functions in parallel. One
    /// malformed or timed-out function becomes a diagnostic; the rest are
    /// still analyzed.
    pub fn analyze_program(&self, program: &ProgramAst, cancel: &CancelToken) -> ProgramReport {
        let results: Vec<(String, Result<Vec<Finding>, SkipReason>)> =
            instrument_block!("analyze", {
                program
                    .functions
                    .par_iter()
                    .map(|function| {
                        (
                            function.name.clone(),
                            self.analyze_function(function, cancel),
                        )
                    })
                    .collect()
            });

        let mut report = ProgramReport::default();
        for (function, result) in results {
            match result {
                Ok(findings) => report.findings.extend(findings),
                Err(reason) => report
                    .diagnostics
                    .push(AnalysisDiagnostic { function, reason }),
            }
        }
        // Report order is by source position across functions, not by the
        // order functions were analyzed.
        report.findings.sort_by(|a, b| {
            (a.pos, a.allocation, a.function.as_str())
                .cmp(&(b.pos, b.allocation, b.function.as_str()))
        });
        report.diagnostics.sort_by(|a, b| a.function.cmp(&b.function));
        report
    }

    /// Analyze a JSON-encoded program (the `{"functions": [...]}` form the
    /// CLI consumes).
    pub fn analyze_json(&self, source: &str) -> LeakResult<ProgramReport> {
        let program: ProgramAst = serde_json::from_str(source)
            .map_err(|err| LeakLintError::input(format!("invalid program JSON: {err}")))?;
        Ok(self.analyze_program(&program, &CancelToken::new()))
    }
}

/// Construct an `AnalysisEngine` with the built-in heap rules and default
/// options.
#[must_use]
pub fn create_default_engine() -> AnalysisEngine {
    AnalysisEngine::new(ResourceTable::heap_defaults())
}
