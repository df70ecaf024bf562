//! Path-sensitive leak analysis.
//!
//! Forward dataflow fixpoint over the CFG in reverse postorder. The abstract
//! state at a block maps every allocation site to its release state next to
//! the may-alias map; predecessor states are refined by branch guard facts,
//! joined per the four-state lattice, and pushed through each block's steps
//! until nothing changes. A check pass then reads leaks off the converged
//! states: end-of-function leaks from the synthetic exit block, reassignment
//! orphans from re-simulating each block once.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::alias::AliasMap;
use crate::ast::{AssignTarget, Expr, SourcePos};
use crate::cfg::{BlockId, Cfg, Edge, Step};
use crate::findings::{Confidence, LeakEvent, LeakKind, SkipReason, WitnessPath};
use crate::resource::{CallRole, KindId, ResourceTable};

// ============================================================================
// Sites
// ============================================================================

/// Dense per-function identifier of an allocation site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SiteId(pub u32);

impl SiteId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// One resource-acquiring call expression. Immutable after collection.
#[derive(Debug, Clone)]
pub struct AllocationSite {
    pub id: SiteId,
    pub kind: KindId,
    pub callee: String,
    pub pos: SourcePos,
    /// Variable the acquiring call is directly assigned to, if any.
    pub owner: Option<String>,
}

/// One resource-releasing call expression.
#[derive(Debug, Clone)]
pub struct ReleaseSite {
    pub id: u32,
    pub kind: KindId,
    pub callee: String,
    pub pos: SourcePos,
    /// The variable whose sites the call releases, when the operand is one.
    pub operand: Option<String>,
}

// ============================================================================
// Lattice
// ============================================================================

/// Release state of one allocation site at one program point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    Unreleased,
    Released,
    MaybeReleased,
    Escaped,
}

impl ResourceState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            ResourceState::Unreleased => "unreleased",
            ResourceState::Released => "released",
            ResourceState::MaybeReleased => "maybe_released",
            ResourceState::Escaped => "escaped",
        }
    }

    /// Lattice join at CFG merge points. Escaped is the identity element:
    /// ownership left on that path only, so the other path's obligation
    /// stands unchanged.
    #[must_use]
    pub fn join(self, other: Self) -> Self {
        use ResourceState::*;
        match (self, other) {
            (Escaped, s) | (s, Escaped) => s,
            (MaybeReleased, _) | (_, MaybeReleased) => MaybeReleased,
            (Unreleased, Unreleased) => Unreleased,
            (Released, Released) => Released,
            (Unreleased, Released) | (Released, Unreleased) => MaybeReleased,
        }
    }
}

// ============================================================================
// Options and Cancellation
// ============================================================================

/// Tunables for one engine run.
#[derive(Debug, Clone)]
pub struct AnalysisOptions {
    /// Per-function wall-clock bound. `None` disables the deadline.
    pub timeout: Option<Duration>,
    /// Per-variable alias-set bound, 0 meaning unbounded.
    pub alias_depth_limit: usize,
    /// Hard cap on fixpoint sweeps per function.
    pub max_fixpoint_iterations: usize,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            alias_depth_limit: 32,
            max_fixpoint_iterations: 10_000,
        }
    }
}

/// Caller-supplied cancellation flag, checked at fixpoint iteration
/// boundaries. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Abstract State
// ============================================================================

/// Abstract state at a block boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockState {
    pub sites: BTreeMap<SiteId, ResourceState>,
    pub aliases: AliasMap,
}

/// Converged result of one function's analysis.
#[derive(Debug)]
pub struct FunctionAnalysis {
    pub sites: Vec<AllocationSite>,
    pub releases: Vec<ReleaseSite>,
    pub events: Vec<LeakEvent>,
    pub iterations: usize,
}

// ============================================================================
// Fixpoint
// ============================================================================

/// Run the dataflow fixpoint and collect leak events for one function. The
/// CFG must have passed `validate()`.
pub fn analyze(
    cfg: &Cfg,
    table: &ResourceTable,
    options: &AnalysisOptions,
    cancel: &CancelToken,
) -> Result<FunctionAnalysis, SkipReason> {
    let ctx = LeakContext::collect(cfg, table, options);
    crate::trace_event!(
        debug,
        function = cfg.function_name(),
        sites = ctx.sites.len(),
        releases = ctx.releases.len(),
        "collected resource sites"
    );

    let rpo = cfg.reverse_postorder();
    let deadline = options.timeout.map(|t| Instant::now() + t);
    let mut states: Vec<Option<BlockState>> = vec![None; cfg.len()];
    let mut changed = true;
    let mut iterations = 0usize;

    while changed {
        if cancel.is_cancelled() {
            return Err(SkipReason::Cancelled { iterations });
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(SkipReason::Timeout { iterations });
        }
        if iterations >= options.max_fixpoint_iterations {
            crate::trace_event!(
                warn,
                function = cfg.function_name(),
                iterations,
                "fixpoint did not converge within the iteration cap"
            );
            return Err(SkipReason::Timeout { iterations });
        }
        iterations += 1;
        changed = false;
        for &block in &rpo {
            let mut state = ctx.merge_predecessors(block, &states);
            for (idx, step) in cfg.block(block).steps.iter().enumerate() {
                ctx.apply_step(block, idx, step, &mut state, None);
            }
            if states[block].as_ref() != Some(&state) {
                states[block] = Some(state);
                changed = true;
            }
        }
    }

    // Check pass: re-simulate each block once from its converged input to
    // record reassignment orphans exactly once.
    let mut reassigns: Vec<ReassignRecord> = Vec::new();
    for &block in &rpo {
        let mut state = ctx.merge_predecessors(block, &states);
        for (idx, step) in cfg.block(block).steps.iter().enumerate() {
            ctx.apply_step(block, idx, step, &mut state, Some(&mut reassigns));
        }
    }

    let parents = bfs_parents(cfg);
    let mut events: Vec<LeakEvent> = Vec::new();

    for rec in reassigns {
        events.push(LeakEvent {
            site: rec.site,
            leak: LeakKind::Reassignment,
            confidence: rec.confidence,
            pos: rec.pos,
            witnesses: vec![path_to(cfg, &parents, rec.block)],
        });
    }

    // End-of-function leaks: classification comes from the converged state
    // of the synthetic exit (the join over every return edge); witnesses
    // from each return edge whose path still owes a release.
    if let Some(exit_state) = states[cfg.exit()].as_ref() {
        for (&site, &state) in &exit_state.sites {
            let confidence = match state {
                ResourceState::Unreleased => Confidence::Definite,
                ResourceState::MaybeReleased => Confidence::Possible,
                ResourceState::Released | ResourceState::Escaped => continue,
            };
            let mut witnesses = Vec::new();
            for edge in cfg.pred_edges(cfg.exit()) {
                let Some(pred_state) = states[edge.from].as_ref() else {
                    continue;
                };
                if matches!(
                    pred_state.sites.get(&site),
                    Some(ResourceState::Unreleased | ResourceState::MaybeReleased)
                ) {
                    let mut path = path_to(cfg, &parents, edge.from);
                    path.kinds.push(edge.kind);
                    path.blocks.push(edge.to);
                    witnesses.push(path);
                }
            }
            witnesses.sort();
            witnesses.dedup();
            events.push(LeakEvent {
                site,
                leak: LeakKind::EndOfFunction,
                confidence,
                pos: ctx.sites[site.index()].pos,
                witnesses,
            });
        }
    }

    Ok(FunctionAnalysis {
        sites: ctx.sites,
        releases: ctx.releases,
        events,
        iterations,
    })
}

// ============================================================================
// Context and Transfer Function
// ============================================================================

struct ReassignRecord {
    site: SiteId,
    confidence: Confidence,
    pos: SourcePos,
    block: BlockId,
}

struct ExprEffects {
    /// Sites (re)introduced by acquire calls in this expression.
    introduced: Vec<SiteId>,
    /// The site of the root expression, when it is itself an acquire call.
    root_site: Option<SiteId>,
}

struct LeakContext<'a> {
    cfg: &'a Cfg,
    table: &'a ResourceTable,
    options: &'a AnalysisOptions,
    sites: Vec<AllocationSite>,
    releases: Vec<ReleaseSite>,
    /// (block, step, call ordinal within the step) to the site it acquires.
    site_map: HashMap<(BlockId, usize, usize), SiteId>,
}

impl<'a> LeakContext<'a> {
    /// Pre-scan every step for acquire and release calls. Ordinals are the
    /// call's position in evaluation order (arguments before the call), so
    /// the transfer function resolves the same site on every sweep.
    fn collect(cfg: &'a Cfg, table: &'a ResourceTable, options: &'a AnalysisOptions) -> Self {
        let mut sites: Vec<AllocationSite> = Vec::new();
        let mut releases: Vec<ReleaseSite> = Vec::new();
        let mut site_map: HashMap<(BlockId, usize, usize), SiteId> = HashMap::new();

        for block in 0..cfg.len() {
            for (idx, step) in cfg.block(block).steps.iter().enumerate() {
                let Some(root) = step_expr(step) else {
                    continue;
                };
                let mut counter = 0usize;
                walk_calls(root, &mut counter, &mut |ordinal, call| {
                    let Expr::Call { callee, args, pos } = call else {
                        return;
                    };
                    match table.classify(callee) {
                        CallRole::Acquire(kind) => {
                            let id = SiteId(sites.len() as u32);
                            let owner = match step {
                                Step::Assign {
                                    target: AssignTarget::Var { name },
                                    value,
                                    ..
                                } if std::ptr::eq(value, call) => Some(name.clone()),
                                _ => None,
                            };
                            sites.push(AllocationSite {
                                id,
                                kind: *kind,
                                callee: callee.clone(),
                                pos: *pos,
                                owner,
                            });
                            site_map.insert((block, idx, ordinal), id);
                        }
                        CallRole::Release(kind) => {
                            releases.push(ReleaseSite {
                                id: releases.len() as u32,
                                kind: *kind,
                                callee: callee.clone(),
                                pos: *pos,
                                operand: args.first().and_then(Expr::as_var).map(str::to_string),
                            });
                        }
                        CallRole::Transfer { .. } | CallRole::Neutral => {}
                    }
                });
            }
        }

        Self {
            cfg,
            table,
            options,
            sites,
            releases,
            site_map,
        }
    }

    fn merge_predecessors(&self, block: BlockId, states: &[Option<BlockState>]) -> BlockState {
        let mut merged: Option<BlockState> = None;
        for edge in self.cfg.pred_edges(block) {
            let Some(pred_state) = states[edge.from].as_ref() else {
                continue;
            };
            let refined = refine_for_edge(pred_state, edge);
            merged = Some(match merged {
                None => refined,
                Some(mut acc) => {
                    join_states(&mut acc, &refined, self.options.alias_depth_limit);
                    acc
                }
            });
        }
        merged.unwrap_or_default()
    }

    fn apply_step(
        &self,
        block: BlockId,
        idx: usize,
        step: &Step,
        state: &mut BlockState,
        reassigns: Option<&mut Vec<ReassignRecord>>,
    ) {
        match step {
            Step::Assign { target, value, pos } => {
                let effects = self.apply_expr_effects(block, idx, value, state);
                match target {
                    AssignTarget::Var { name } => {
                        if value.as_var() != Some(name.as_str()) {
                            self.record_orphans(
                                name,
                                &effects.introduced,
                                state,
                                *pos,
                                block,
                                reassigns,
                            );
                        }
                        if let Some(site) = effects.root_site {
                            state.aliases.bind_site(name, site);
                        } else if let Some(src) = value.as_var() {
                            state.aliases.bind_copy(name, src);
                        } else {
                            state.aliases.clear(name);
                        }
                    }
                    AssignTarget::Deref { .. } => {
                        // Writing a resource pointer into memory hands it to
                        // a longer-lived structure.
                        if let Some(src) = value.as_var() {
                            escape_all(state, src);
                        } else if let Some(site) = effects.root_site {
                            state.sites.insert(site, ResourceState::Escaped);
                        }
                    }
                }
            }
            Step::Eval { expr, .. } => {
                self.apply_expr_effects(block, idx, expr, state);
            }
            Step::Return { value, .. } => {
                if let Some(value) = value {
                    let effects = self.apply_expr_effects(block, idx, value, state);
                    if let Some(src) = value.as_var() {
                        escape_all(state, src);
                    } else if let Some(site) = effects.root_site {
                        state.sites.insert(site, ResourceState::Escaped);
                    }
                }
            }
        }
    }

    /// Resource effects of the calls inside one expression, in evaluation
    /// order.
    fn apply_expr_effects(
        &self,
        block: BlockId,
        idx: usize,
        root: &Expr,
        state: &mut BlockState,
    ) -> ExprEffects {
        let mut effects = ExprEffects {
            introduced: Vec::new(),
            root_site: None,
        };
        let mut by_ptr: HashMap<usize, SiteId> = HashMap::new();
        let mut counter = 0usize;
        walk_calls(root, &mut counter, &mut |ordinal, call| {
            let Expr::Call { callee, args, .. } = call else {
                return;
            };
            match self.table.classify(callee) {
                CallRole::Acquire(_) => {
                    let Some(&site) = self.site_map.get(&(block, idx, ordinal)) else {
                        return;
                    };
                    let next = match state.sites.get(&site) {
                        // A prior loop iteration's instance may still dangle.
                        Some(ResourceState::Unreleased | ResourceState::MaybeReleased) => {
                            ResourceState::MaybeReleased
                        }
                        _ => ResourceState::Unreleased,
                    };
                    state.sites.insert(site, next);
                    effects.introduced.push(site);
                    by_ptr.insert(call as *const Expr as usize, site);
                    if std::ptr::eq(call, root) {
                        effects.root_site = Some(site);
                    }
                }
                CallRole::Release(kind) => {
                    if let Some(operand) = args.first().and_then(Expr::as_var) {
                        release_sites(&self.sites, state, operand, *kind);
                    }
                }
                CallRole::Transfer { kind, positions } => {
                    for &p in positions {
                        let Some(arg) = args.get(p) else {
                            continue;
                        };
                        if let Some(var) = arg.as_var() {
                            escape_kind(&self.sites, state, var, *kind);
                        } else if let Some(&site) = by_ptr.get(&(arg as *const Expr as usize)) {
                            state.sites.insert(site, ResourceState::Escaped);
                        }
                    }
                }
                CallRole::Neutral => {}
            }
        });
        effects
    }

    /// Overwriting the sole remaining alias of a live site orphans it. Only
    /// recorded during the check pass; sites the same step just introduced
    /// are excluded (re-acquisition is modeled on the site state instead).
    fn record_orphans(
        &self,
        var: &str,
        introduced: &[SiteId],
        state: &BlockState,
        pos: SourcePos,
        block: BlockId,
        reassigns: Option<&mut Vec<ReassignRecord>>,
    ) {
        let Some(reassigns) = reassigns else { return };
        let Some(set) = state.aliases.sites_of(var) else {
            return;
        };
        let candidates: Vec<SiteId> = set.iter().copied().collect();
        for site in candidates {
            if introduced.contains(&site) {
                continue;
            }
            let confidence = match state.sites.get(&site) {
                Some(ResourceState::Unreleased) => Confidence::Definite,
                Some(ResourceState::MaybeReleased) => Confidence::Possible,
                _ => continue,
            };
            if state.aliases.sole_alias_is(var, site) {
                reassigns.push(ReassignRecord {
                    site,
                    confidence,
                    pos,
                    block,
                });
            }
        }
    }
}

// ============================================================================
// State Helpers
// ============================================================================

fn step_expr(step: &Step) -> Option<&Expr> {
    match step {
        Step::Assign { value, .. } => Some(value),
        Step::Eval { expr, .. } => Some(expr),
        Step::Return { value, .. } => value.as_ref(),
    }
}

/// Visit every call in evaluation order (arguments before the call itself),
/// handing each its ordinal within the walk.
fn walk_calls<'e>(expr: &'e Expr, counter: &mut usize, f: &mut dyn FnMut(usize, &'e Expr)) {
    match expr {
        Expr::Call { args, .. } => {
            for arg in args {
                walk_calls(arg, counter, f);
            }
            let ordinal = *counter;
            *counter += 1;
            f(ordinal, expr);
        }
        Expr::Unary { operand, .. } => walk_calls(operand, counter, f),
        Expr::Binary { lhs, rhs, .. } => {
            walk_calls(lhs, counter, f);
            walk_calls(rhs, counter, f);
        }
        Expr::Var { .. } | Expr::IntLit { .. } | Expr::BoolLit { .. } | Expr::Null { .. } => {}
    }
}

/// Carry a predecessor's state across an edge, applying its guard fact. On
/// an edge proving the tested variable null, its sites' acquisitions failed
/// on this path, so no release is owed.
fn refine_for_edge(pred: &BlockState, edge: &Edge) -> BlockState {
    let mut state = pred.clone();
    if let Some(guard) = &edge.guard {
        if guard.is_null {
            if let Some(set) = state.aliases.sites_of(&guard.var) {
                let voided: Vec<SiteId> = set.iter().copied().collect();
                for site in voided {
                    state.sites.insert(site, ResourceState::Escaped);
                }
            }
            state.aliases.clear(&guard.var);
        }
    }
    state
}

fn join_states(into: &mut BlockState, other: &BlockState, alias_limit: usize) {
    for (&site, &theirs) in &other.sites {
        let joined = match into.sites.get(&site) {
            Some(&mine) => mine.join(theirs),
            None => theirs,
        };
        into.sites.insert(site, joined);
    }
    into.aliases.join(&other.aliases, alias_limit);
}

fn release_sites(sites: &[AllocationSite], state: &mut BlockState, var: &str, kind: KindId) {
    let Some(set) = state.aliases.sites_of(var) else {
        return;
    };
    let targets: Vec<SiteId> = set.iter().copied().collect();
    for site in targets {
        if sites[site.index()].kind != kind {
            continue;
        }
        if let Some(current) = state.sites.get(&site).copied() {
            let next = match current {
                ResourceState::Unreleased => ResourceState::Released,
                // MaybeReleased stays: an instance lost on some path cannot
                // be recovered by this release. Escaped is absorbing.
                other => other,
            };
            state.sites.insert(site, next);
        }
    }
}

fn escape_kind(sites: &[AllocationSite], state: &mut BlockState, var: &str, kind: KindId) {
    let Some(set) = state.aliases.sites_of(var) else {
        return;
    };
    let targets: Vec<SiteId> = set.iter().copied().collect();
    for site in targets {
        if sites[site.index()].kind == kind {
            state.sites.insert(site, ResourceState::Escaped);
        }
    }
}

fn escape_all(state: &mut BlockState, var: &str) {
    let Some(set) = state.aliases.sites_of(var) else {
        return;
    };
    let targets: Vec<SiteId> = set.iter().copied().collect();
    for site in targets {
        state.sites.insert(site, ResourceState::Escaped);
    }
}

// ============================================================================
// Witness Paths
// ============================================================================

/// BFS parent edge per block, giving one shortest path from entry to every
/// reachable block. Deterministic because successor lists are ordered.
fn bfs_parents(cfg: &Cfg) -> Vec<Option<usize>> {
    let mut parent: Vec<Option<usize>> = vec![None; cfg.len()];
    let mut visited = vec![false; cfg.len()];
    visited[cfg.entry()] = true;
    let mut queue = VecDeque::from([cfg.entry()]);
    while let Some(block) = queue.pop_front() {
        for &edge_idx in &cfg.block(block).succs {
            let to = cfg.edges()[edge_idx].to;
            if !visited[to] {
                visited[to] = true;
                parent[to] = Some(edge_idx);
                queue.push_back(to);
            }
        }
    }
    parent
}

fn path_to(cfg: &Cfg, parents: &[Option<usize>], target: BlockId) -> WitnessPath {
    let mut blocks = vec![target];
    let mut kinds = Vec::new();
    let mut cursor = target;
    while let Some(edge_idx) = parents[cursor] {
        let edge = &cfg.edges()[edge_idx];
        kinds.push(edge.kind);
        cursor = edge.from;
        blocks.push(cursor);
    }
    blocks.reverse();
    kinds.reverse();
    WitnessPath { blocks, kinds }
}
