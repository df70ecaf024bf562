#![allow(dead_code)]

use leaklint::ast::{AssignTarget, BinaryOp, Expr, FunctionAst, SourcePos, Stmt};

pub fn pos(line: usize) -> SourcePos {
    SourcePos::new(line, 5)
}

pub fn var(name: &str, line: usize) -> Expr {
    Expr::Var {
        name: name.to_string(),
        pos: pos(line),
    }
}

pub fn int(value: i64, line: usize) -> Expr {
    Expr::IntLit {
        value,
        pos: pos(line),
    }
}

pub fn null(line: usize) -> Expr {
    Expr::Null { pos: pos(line) }
}

pub fn call(callee: &str, args: Vec<Expr>, line: usize) -> Expr {
    Expr::Call {
        callee: callee.to_string(),
        args,
        pos: pos(line),
    }
}

/// `name == null`
pub fn eq_null(name: &str, line: usize) -> Expr {
    Expr::Binary {
        op: BinaryOp::Eq,
        lhs: Box::new(var(name, line)),
        rhs: Box::new(null(line)),
        pos: pos(line),
    }
}

/// `name != null`
pub fn ne_null(name: &str, line: usize) -> Expr {
    Expr::Binary {
        op: BinaryOp::Ne,
        lhs: Box::new(var(name, line)),
        rhs: Box::new(null(line)),
        pos: pos(line),
    }
}

pub fn lt(lhs: Expr, rhs: Expr, line: usize) -> Expr {
    Expr::Binary {
        op: BinaryOp::Lt,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        pos: pos(line),
    }
}

pub fn vardec(name: &str, init: Expr, line: usize) -> Stmt {
    Stmt::Vardec {
        name: name.to_string(),
        init: Some(init),
        pos: pos(line),
    }
}

pub fn assign(name: &str, value: Expr, line: usize) -> Stmt {
    Stmt::Assign {
        target: AssignTarget::Var {
            name: name.to_string(),
        },
        value,
        pos: pos(line),
    }
}

/// `*name = value`
pub fn deref_assign(name: &str, value: Expr, line: usize) -> Stmt {
    Stmt::Assign {
        target: AssignTarget::Deref {
            name: name.to_string(),
        },
        value,
        pos: pos(line),
    }
}

pub fn expr_stmt(expr: Expr, line: usize) -> Stmt {
    Stmt::Expr {
        expr,
        pos: pos(line),
    }
}

pub fn ret(value: Option<Expr>, line: usize) -> Stmt {
    Stmt::Return {
        value,
        pos: pos(line),
    }
}

pub fn if_stmt(cond: Expr, then_body: Vec<Stmt>, else_body: Vec<Stmt>, line: usize) -> Stmt {
    Stmt::If {
        cond,
        then_body,
        else_body,
        pos: pos(line),
    }
}

pub fn while_stmt(cond: Expr, body: Vec<Stmt>, line: usize) -> Stmt {
    Stmt::While {
        cond,
        body,
        pos: pos(line),
    }
}

pub fn func(name: &str, body: Vec<Stmt>) -> FunctionAst {
    FunctionAst {
        name: name.to_string(),
        params: vec![],
        body,
        pos: pos(1),
    }
}

/// `name = malloc(8)` as a declaration.
pub fn malloc_into(name: &str, line: usize) -> Stmt {
    vardec(name, call("malloc", vec![int(8, line)], line), line)
}

/// `free(name);`
pub fn free_stmt(name: &str, line: usize) -> Stmt {
    expr_stmt(call("free", vec![var(name, line)], line), line)
}
