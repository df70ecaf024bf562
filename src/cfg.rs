//! Control-flow graph construction.
//!
//! Lowers a function's statement tree into basic blocks of straight-line
//! [`Step`]s joined by kinded edges. The graph has the entry at block 0 and a
//! single synthetic exit; every `return` takes its own edge there, so an early
//! return nested in a loop inside a conditional stays a distinct path and
//! never merges with the loop's normal exit. Branch edges carry an optional
//! null-test [`GuardFact`] which the analyzer uses to drop release
//! obligations on allocation-failure paths.

use serde::Serialize;
use thiserror::Error;

use crate::ast::{AssignTarget, BinaryOp, Expr, FunctionAst, SourcePos, Stmt};

pub type BlockId = usize;

// ============================================================================
// Error Types
// ============================================================================

/// Structural defects in a function's control flow. The function is skipped
/// with a diagnostic; other functions are still analyzed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MalformedControlFlow {
    #[error("`break` outside of a loop at {pos}")]
    BreakOutsideLoop { pos: SourcePos },

    #[error("`continue` outside of a loop at {pos}")]
    ContinueOutsideLoop { pos: SourcePos },

    #[error("function exit is unreachable from entry")]
    UnreachableExit,

    #[error("block b{block} is unreachable from entry")]
    UnreachableBlock { block: BlockId },
}

// ============================================================================
// Graph Types
// ============================================================================

/// One straight-line operation inside a basic block.
#[derive(Debug, Clone)]
pub enum Step {
    /// `target = value` (vardec initializers lower to this as well).
    Assign {
        target: AssignTarget,
        value: Expr,
        pos: SourcePos,
    },
    /// Expression evaluated for effect (expression statements, conditions).
    Eval { expr: Expr, pos: SourcePos },
    /// `return value?`; always the last step of its block.
    Return {
        value: Option<Expr>,
        pos: SourcePos,
    },
}

impl Step {
    #[must_use]
    pub fn pos(&self) -> SourcePos {
        match self {
            Step::Assign { pos, .. } | Step::Eval { pos, .. } | Step::Return { pos, .. } => *pos,
        }
    }
}

/// How control moves from one block to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Fallthrough,
    BranchTrue,
    BranchFalse,
    LoopBack,
    LoopExit,
    Return,
}

impl EdgeKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            EdgeKind::Fallthrough => "fallthrough",
            EdgeKind::BranchTrue => "branch_true",
            EdgeKind::BranchFalse => "branch_false",
            EdgeKind::LoopBack => "loop_back",
            EdgeKind::LoopExit => "loop_exit",
            EdgeKind::Return => "return",
        }
    }
}

/// Null-test refinement carried on a branch edge: on this edge, `var` is
/// proven null (`is_null`) or proven non-null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardFact {
    pub var: String,
    pub is_null: bool,
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: BlockId,
    pub to: BlockId,
    pub kind: EdgeKind,
    pub guard: Option<GuardFact>,
}

#[derive(Debug, Clone, Default)]
pub struct BasicBlock {
    pub steps: Vec<Step>,
    /// Indices into the CFG's edge list.
    pub preds: Vec<usize>,
    pub succs: Vec<usize>,
}

/// Control-flow graph of one function. Entry is block 0; `exit` is synthetic
/// and holds no steps.
#[derive(Debug, Clone)]
pub struct Cfg {
    function: String,
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    entry: BlockId,
    exit: BlockId,
}

impl Cfg {
    /// Lower a function body into a CFG, pruning blocks made unreachable by
    /// early returns.
    pub fn build(func: &FunctionAst) -> Result<Self, MalformedControlFlow> {
        Builder::new(func.name.clone()).run(func)
    }

    #[must_use]
    pub fn entry(&self) -> BlockId {
        self.entry
    }

    #[must_use]
    pub fn exit(&self) -> BlockId {
        self.exit
    }

    #[must_use]
    pub fn function_name(&self) -> &str {
        &self.function
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    #[must_use]
    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id]
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn pred_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.blocks[id].preds.iter().map(|&e| &self.edges[e])
    }

    pub fn succ_edges(&self, id: BlockId) -> impl Iterator<Item = &Edge> {
        self.blocks[id].succs.iter().map(|&e| &self.edges[e])
    }

    /// Blocks in reverse postorder from entry. Drives the dataflow fixpoint:
    /// predecessors come before successors except across back-edges.
    #[must_use]
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::with_capacity(self.blocks.len());
        let mut stack: Vec<(BlockId, usize)> = vec![(self.entry, 0)];
        visited[self.entry] = true;
        while let Some((block, child)) = stack.last_mut() {
            let succs = &self.blocks[*block].succs;
            if *child < succs.len() {
                let to = self.edges[succs[*child]].to;
                *child += 1;
                if !visited[to] {
                    visited[to] = true;
                    stack.push((to, 0));
                }
            } else {
                order.push(*block);
                stack.pop();
            }
        }
        order.reverse();
        order
    }

    /// Re-check the reachability invariants. Exit must be reachable from
    /// entry (a function that can never terminate has no path to analyze) and
    /// no retained block may be unreachable.
    pub fn validate(&self) -> Result<(), MalformedControlFlow> {
        let mut reachable = vec![false; self.blocks.len()];
        let mut stack = vec![self.entry];
        reachable[self.entry] = true;
        while let Some(block) = stack.pop() {
            for edge in self.succ_edges(block) {
                if !reachable[edge.to] {
                    reachable[edge.to] = true;
                    stack.push(edge.to);
                }
            }
        }
        if !reachable[self.exit] {
            return Err(MalformedControlFlow::UnreachableExit);
        }
        if let Some(block) = reachable.iter().position(|r| !r) {
            return Err(MalformedControlFlow::UnreachableBlock { block });
        }
        Ok(())
    }

    /// Text dump of the graph, one block per paragraph. Used by `dump_cfg`.
    #[must_use]
    pub fn render(&self) -> String {
        use std::fmt::Write as _;

        let mut out = String::new();
        let _ = writeln!(
            out,
            "fn {} (entry b{}, exit b{})",
            self.function, self.entry, self.exit
        );
        for (id, block) in self.blocks.iter().enumerate() {
            let _ = writeln!(out, "b{id}:");
            for step in &block.steps {
                match step {
                    Step::Assign { target, value, .. } => {
                        let _ = writeln!(out, "  {target} = {value}");
                    }
                    Step::Eval { expr, .. } => {
                        let _ = writeln!(out, "  eval {expr}");
                    }
                    Step::Return { value: Some(v), .. } => {
                        let _ = writeln!(out, "  return {v}");
                    }
                    Step::Return { value: None, .. } => {
                        let _ = writeln!(out, "  return");
                    }
                }
            }
            for edge in self.succ_edges(id) {
                match &edge.guard {
                    Some(g) => {
                        let _ = writeln!(
                            out,
                            "  -> b{} [{}] ({} {} null)",
                            edge.to,
                            edge.kind.as_str(),
                            g.var,
                            if g.is_null { "==" } else { "!=" }
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  -> b{} [{}]", edge.to, edge.kind.as_str());
                    }
                }
            }
        }
        out
    }
}

// ============================================================================
// Builder
// ============================================================================

struct LoopFrame {
    continue_target: BlockId,
    break_target: BlockId,
}

struct Builder {
    function: String,
    blocks: Vec<BasicBlock>,
    edges: Vec<Edge>,
    exit: BlockId,
    current: BlockId,
    sealed: bool,
    loops: Vec<LoopFrame>,
}

impl Builder {
    fn new(function: String) -> Self {
        // Block 0 is the entry, block 1 the synthetic exit.
        let blocks = vec![BasicBlock::default(), BasicBlock::default()];
        Self {
            function,
            blocks,
            edges: Vec::new(),
            exit: 1,
            current: 0,
            sealed: false,
            loops: Vec::new(),
        }
    }

    fn run(mut self, func: &FunctionAst) -> Result<Cfg, MalformedControlFlow> {
        self.lower_body(&func.body)?;
        if !self.sealed {
            // Falling off the end of the body is an implicit return.
            self.add_edge(self.current, self.exit, EdgeKind::Return, None);
        }
        Ok(self.finish())
    }

    fn new_block(&mut self) -> BlockId {
        self.blocks.push(BasicBlock::default());
        self.blocks.len() - 1
    }

    fn enter(&mut self, block: BlockId) {
        self.current = block;
        self.sealed = false;
    }

    fn push_step(&mut self, step: Step) {
        self.blocks[self.current].steps.push(step);
    }

    fn add_edge(&mut self, from: BlockId, to: BlockId, kind: EdgeKind, guard: Option<GuardFact>) {
        self.edges.push(Edge {
            from,
            to,
            kind,
            guard,
        });
    }

    fn lower_body(&mut self, body: &[Stmt]) -> Result<(), MalformedControlFlow> {
        for stmt in body {
            self.lower_stmt(stmt)?;
        }
        Ok(())
    }

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), MalformedControlFlow> {
        if self.sealed {
            // Statements after a return/break/continue are unreachable. They
            // are still lowered (structural errors in dead code must surface)
            // into a detached block that pruning removes.
            let dead = self.new_block();
            self.enter(dead);
        }
        match stmt {
            Stmt::Vardec { name, init, pos } => {
                if let Some(init) = init {
                    self.push_step(Step::Assign {
                        target: AssignTarget::Var { name: name.clone() },
                        value: init.clone(),
                        pos: *pos,
                    });
                }
                Ok(())
            }
            Stmt::Assign { target, value, pos } => {
                self.push_step(Step::Assign {
                    target: target.clone(),
                    value: value.clone(),
                    pos: *pos,
                });
                Ok(())
            }
            Stmt::Expr { expr, pos } => {
                self.push_step(Step::Eval {
                    expr: expr.clone(),
                    pos: *pos,
                });
                Ok(())
            }
            Stmt::Return { value, pos } => {
                self.push_step(Step::Return {
                    value: value.clone(),
                    pos: *pos,
                });
                self.add_edge(self.current, self.exit, EdgeKind::Return, None);
                self.sealed = true;
                Ok(())
            }
            Stmt::Break { pos } => {
                let Some(frame) = self.loops.last() else {
                    return Err(MalformedControlFlow::BreakOutsideLoop { pos: *pos });
                };
                self.add_edge(self.current, frame.break_target, EdgeKind::LoopExit, None);
                self.sealed = true;
                Ok(())
            }
            Stmt::Continue { pos } => {
                let Some(frame) = self.loops.last() else {
                    return Err(MalformedControlFlow::ContinueOutsideLoop { pos: *pos });
                };
                self.add_edge(self.current, frame.continue_target, EdgeKind::LoopBack, None);
                self.sealed = true;
                Ok(())
            }
            Stmt::Block { body, .. } => self.lower_body(body),
            Stmt::If {
                cond,
                then_body,
                else_body,
                ..
            } => self.lower_if(cond, then_body, else_body),
            Stmt::While { cond, body, .. } => self.lower_while(cond, body),
            Stmt::For {
                init,
                cond,
                step,
                body,
                ..
            } => self.lower_for(init.as_deref(), cond.as_ref(), step.as_deref(), body),
        }
    }

    fn lower_if(
        &mut self,
        cond: &Expr,
        then_body: &[Stmt],
        else_body: &[Stmt],
    ) -> Result<(), MalformedControlFlow> {
        self.push_step(Step::Eval {
            expr: cond.clone(),
            pos: cond.pos(),
        });
        let (guard_true, mut guard_false) = null_guards(cond);
        let cond_block = self.current;

        let then_block = self.new_block();
        self.add_edge(cond_block, then_block, EdgeKind::BranchTrue, guard_true);
        self.enter(then_block);
        self.lower_body(then_body)?;
        let then_end = (!self.sealed).then_some(self.current);

        let else_end = if else_body.is_empty() {
            None
        } else {
            let else_block = self.new_block();
            self.add_edge(
                cond_block,
                else_block,
                EdgeKind::BranchFalse,
                guard_false.take(),
            );
            self.enter(else_block);
            self.lower_body(else_body)?;
            (!self.sealed).then_some(self.current)
        };

        let join = self.new_block();
        if let Some(end) = then_end {
            self.add_edge(end, join, EdgeKind::Fallthrough, None);
        }
        if else_body.is_empty() {
            // No else arm: the false edge skips straight to the join and
            // still carries its refinement.
            self.add_edge(cond_block, join, EdgeKind::BranchFalse, guard_false.take());
        } else if let Some(end) = else_end {
            self.add_edge(end, join, EdgeKind::Fallthrough, None);
        }
        self.enter(join);
        Ok(())
    }

    fn lower_while(&mut self, cond: &Expr, body: &[Stmt]) -> Result<(), MalformedControlFlow> {
        let header = self.new_block();
        self.add_edge(self.current, header, EdgeKind::Fallthrough, None);
        self.enter(header);
        self.push_step(Step::Eval {
            expr: cond.clone(),
            pos: cond.pos(),
        });
        let (guard_true, guard_false) = null_guards(cond);

        let body_block = self.new_block();
        let exit_block = self.new_block();
        self.add_edge(header, body_block, EdgeKind::BranchTrue, guard_true);
        self.add_edge(header, exit_block, EdgeKind::LoopExit, guard_false);

        self.loops.push(LoopFrame {
            continue_target: header,
            break_target: exit_block,
        });
        self.enter(body_block);
        self.lower_body(body)?;
        if !self.sealed {
            self.add_edge(self.current, header, EdgeKind::LoopBack, None);
        }
        self.loops.pop();

        self.enter(exit_block);
        Ok(())
    }

    fn lower_for(
        &mut self,
        init: Option<&Stmt>,
        cond: Option<&Expr>,
        step: Option<&Stmt>,
        body: &[Stmt],
    ) -> Result<(), MalformedControlFlow> {
        if let Some(init) = init {
            self.lower_stmt(init)?;
        }

        let header = self.new_block();
        self.add_edge(self.current, header, EdgeKind::Fallthrough, None);
        self.enter(header);

        let body_block = self.new_block();
        let exit_block = self.new_block();
        match cond {
            Some(cond) => {
                self.push_step(Step::Eval {
                    expr: cond.clone(),
                    pos: cond.pos(),
                });
                let (guard_true, guard_false) = null_guards(cond);
                self.add_edge(header, body_block, EdgeKind::BranchTrue, guard_true);
                self.add_edge(header, exit_block, EdgeKind::LoopExit, guard_false);
            }
            None => {
                // `for (;;)`: only a break can leave the loop.
                self.add_edge(header, body_block, EdgeKind::Fallthrough, None);
            }
        }

        // `continue` must run the step expression before re-testing.
        let step_block = step.map(|_| self.new_block());
        self.loops.push(LoopFrame {
            continue_target: step_block.unwrap_or(header),
            break_target: exit_block,
        });
        self.enter(body_block);
        self.lower_body(body)?;
        if !self.sealed {
            match step_block {
                Some(sb) => self.add_edge(self.current, sb, EdgeKind::Fallthrough, None),
                None => self.add_edge(self.current, header, EdgeKind::LoopBack, None),
            }
        }
        self.loops.pop();

        if let (Some(sb), Some(step)) = (step_block, step) {
            self.enter(sb);
            self.lower_stmt(step)?;
            if !self.sealed {
                self.add_edge(self.current, header, EdgeKind::LoopBack, None);
            }
        }

        self.enter(exit_block);
        Ok(())
    }

    /// Drop blocks unreachable from entry, remap ids, and wire pred/succ
    /// lists. The exit block is kept even when unreachable so `validate()`
    /// can report it.
    fn finish(self) -> Cfg {
        let mut reachable = vec![false; self.blocks.len()];
        reachable[0] = true;
        let mut stack = vec![0usize];
        while let Some(block) = stack.pop() {
            for edge in &self.edges {
                if edge.from == block && !reachable[edge.to] {
                    reachable[edge.to] = true;
                    stack.push(edge.to);
                }
            }
        }
        reachable[self.exit] = true;

        let mut remap = vec![usize::MAX; self.blocks.len()];
        let mut blocks = Vec::new();
        for (old, block) in self.blocks.into_iter().enumerate() {
            if reachable[old] {
                remap[old] = blocks.len();
                blocks.push(BasicBlock {
                    steps: block.steps,
                    preds: Vec::new(),
                    succs: Vec::new(),
                });
            }
        }

        let mut edges = Vec::new();
        for edge in self.edges {
            if remap[edge.from] != usize::MAX && remap[edge.to] != usize::MAX {
                edges.push(Edge {
                    from: remap[edge.from],
                    to: remap[edge.to],
                    kind: edge.kind,
                    guard: edge.guard,
                });
            }
        }
        for (i, edge) in edges.iter().enumerate() {
            blocks[edge.from].succs.push(i);
            blocks[edge.to].preds.push(i);
        }

        Cfg {
            function: self.function,
            blocks,
            edges,
            entry: 0,
            exit: remap[self.exit],
        }
    }
}

/// Guard facts for the (true, false) edges of a branch on `cond`, when the
/// condition is a direct null comparison of a variable.
fn null_guards(cond: &Expr) -> (Option<GuardFact>, Option<GuardFact>) {
    let tested = |lhs: &Expr, rhs: &Expr| -> Option<String> {
        match (lhs, rhs) {
            (Expr::Var { name, .. }, Expr::Null { .. })
            | (Expr::Null { .. }, Expr::Var { name, .. }) => Some(name.clone()),
            _ => None,
        }
    };
    match cond {
        Expr::Binary {
            op: BinaryOp::Eq,
            lhs,
            rhs,
            ..
        } => match tested(lhs, rhs) {
            Some(var) => (
                Some(GuardFact {
                    var: var.clone(),
                    is_null: true,
                }),
                Some(GuardFact {
                    var,
                    is_null: false,
                }),
            ),
            None => (None, None),
        },
        Expr::Binary {
            op: BinaryOp::Ne,
            lhs,
            rhs,
            ..
        } => match tested(lhs, rhs) {
            Some(var) => (
                Some(GuardFact {
                    var: var.clone(),
                    is_null: false,
                }),
                Some(GuardFact { var, is_null: true }),
            ),
            None => (None, None),
        },
        _ => (None, None),
    }
}
