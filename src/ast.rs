//! Input AST handed over by the external parser.
//!
//! leaklint does not lex or parse source itself: a collaborator produces this
//! typed statement tree (in-process or as JSON via the CLI) and the engine
//! lowers it into a CFG. The shapes cover the C-like surface the fixture
//! corpus uses: vardecs, assignments (including through a pointer), if/else,
//! while/for loops, break/continue, and returns.

use serde::{Deserialize, Serialize};

/// Single position in a source file (1-based line/column).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct SourcePos {
    pub line: usize,
    pub column: usize,
}

impl SourcePos {
    #[must_use]
    pub const fn new(line: usize, column: usize) -> Self {
        Self { line, column }
    }
}

impl std::fmt::Display for SourcePos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// One function definition from the external parser.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionAst {
    pub name: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub body: Vec<Stmt>,
    #[serde(default)]
    pub pos: SourcePos,
}

/// Assignment destination. Writing through a pointer (`*p = v`) does not
/// rebind `p`, so the two forms are distinguished here rather than guessed at
/// later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum AssignTarget {
    Var { name: String },
    Deref { name: String },
}

/// One statement of the C-like surface language.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "stmt", rename_all = "snake_case")]
pub enum Stmt {
    Vardec {
        name: String,
        init: Option<Expr>,
        pos: SourcePos,
    },
    Assign {
        target: AssignTarget,
        value: Expr,
        pos: SourcePos,
    },
    If {
        cond: Expr,
        then_body: Vec<Stmt>,
        #[serde(default)]
        else_body: Vec<Stmt>,
        pos: SourcePos,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
        pos: SourcePos,
    },
    For {
        init: Option<Box<Stmt>>,
        cond: Option<Expr>,
        step: Option<Box<Stmt>>,
        body: Vec<Stmt>,
        pos: SourcePos,
    },
    Break {
        pos: SourcePos,
    },
    Continue {
        pos: SourcePos,
    },
    Return {
        value: Option<Expr>,
        pos: SourcePos,
    },
    Expr {
        expr: Expr,
        pos: SourcePos,
    },
    Block {
        body: Vec<Stmt>,
        pos: SourcePos,
    },
}

impl Stmt {
    #[must_use]
    pub fn pos(&self) -> SourcePos {
        match self {
            Stmt::Vardec { pos, .. }
            | Stmt::Assign { pos, .. }
            | Stmt::If { pos, .. }
            | Stmt::While { pos, .. }
            | Stmt::For { pos, .. }
            | Stmt::Break { pos }
            | Stmt::Continue { pos }
            | Stmt::Return { pos, .. }
            | Stmt::Expr { pos, .. }
            | Stmt::Block { pos, .. } => *pos,
        }
    }
}

/// One expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "expr", rename_all = "snake_case")]
pub enum Expr {
    Var {
        name: String,
        pos: SourcePos,
    },
    IntLit {
        value: i64,
        pos: SourcePos,
    },
    BoolLit {
        value: bool,
        pos: SourcePos,
    },
    Null {
        pos: SourcePos,
    },
    Call {
        callee: String,
        args: Vec<Expr>,
        pos: SourcePos,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
        pos: SourcePos,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        pos: SourcePos,
    },
}

impl Expr {
    #[must_use]
    pub fn pos(&self) -> SourcePos {
        match self {
            Expr::Var { pos, .. }
            | Expr::IntLit { pos, .. }
            | Expr::BoolLit { pos, .. }
            | Expr::Null { pos }
            | Expr::Call { pos, .. }
            | Expr::Unary { pos, .. }
            | Expr::Binary { pos, .. } => *pos,
        }
    }

    /// Variable name if this expression is a bare variable reference.
    #[must_use]
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Expr::Var { name, .. } => Some(name.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnaryOp {
    Not,
    Neg,
    Deref,
}

impl UnaryOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            UnaryOp::Not => "!",
            UnaryOp::Neg => "-",
            UnaryOp::Deref => "*",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl std::fmt::Display for AssignTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignTarget::Var { name } => write!(f, "{name}"),
            AssignTarget::Deref { name } => write!(f, "*{name}"),
        }
    }
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Var { name, .. } => write!(f, "{name}"),
            Expr::IntLit { value, .. } => write!(f, "{value}"),
            Expr::BoolLit { value, .. } => write!(f, "{value}"),
            Expr::Null { .. } => write!(f, "null"),
            Expr::Call { callee, args, .. } => {
                write!(f, "{callee}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                write!(f, ")")
            }
            Expr::Unary { op, operand, .. } => write!(f, "{}{operand}", op.as_str()),
            Expr::Binary { op, lhs, rhs, .. } => write!(f, "({lhs} {} {rhs})", op.as_str()),
        }
    }
}

/// Top-level container for a parser JSON dump: `{"functions": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramAst {
    pub functions: Vec<FunctionAst>,
}
