//! Expression traversal over kernel bodies.
//!
//! Every expression reachable from a statement list is visited, including
//! the arguments of instrumentation macros.

use super::{Expr, Macro, Stmt};

/// Visit every expression, parents before children.
pub fn for_each_expr<'a, F: FnMut(&'a Expr)>(stmts: &'a [Stmt], f: &mut F) {
    for stmt in stmts {
        match stmt {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } => visit_expr(value, f),
            Stmt::Store { index, value, .. } => {
                if let Some(index) = index {
                    visit_expr(index, f);
                }
                visit_expr(value, f);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                visit_expr(cond, f);
                for_each_expr(then, f);
                for_each_expr(otherwise, f);
            }
            Stmt::For {
                start, end, body, ..
            } => {
                visit_expr(start, f);
                visit_expr(end, f);
                for_each_expr(body, f);
            }
            Stmt::While { cond, body } => {
                visit_expr(cond, f);
                for_each_expr(body, f);
            }
            Stmt::Block(body) => for_each_expr(body, f),
            Stmt::Expr(expr) => visit_expr(expr, f),
            Stmt::Return(value) => {
                if let Some(value) = value {
                    visit_expr(value, f);
                }
            }
            Stmt::Macro(Macro::Print { args, .. }) => args.iter().for_each(|a| visit_expr(a, f)),
            Stmt::Macro(Macro::Show { expr, .. }) => visit_expr(expr, f),
            Stmt::Macro(Macro::Cycles { body, .. }) => for_each_expr(body, f),
        }
    }
}

pub fn visit_expr<'a, F: FnMut(&'a Expr)>(expr: &'a Expr, f: &mut F) {
    f(expr);
    match expr {
        Expr::Const(_)
        | Expr::Str(_)
        | Expr::Local(_)
        | Expr::Field(_)
        | Expr::Global(_)
        | Expr::Len(_) => {}
        Expr::Index { index, .. } => visit_expr(index, f),
        Expr::Unary { operand, .. } => visit_expr(operand, f),
        Expr::Binary { lhs, rhs, .. } => {
            visit_expr(lhs, f);
            visit_expr(rhs, f);
        }
        Expr::Cast { expr, .. } => visit_expr(expr, f),
        Expr::Select {
            cond,
            then,
            otherwise,
        } => {
            visit_expr(cond, f);
            visit_expr(then, f);
            visit_expr(otherwise, f);
        }
        Expr::Call(call) => call.args.iter().for_each(|a| visit_expr(a, f)),
        Expr::Alloc { len, .. } => visit_expr(len, f),
    }
}

/// Visit every expression mutably, children before parents.
pub fn for_each_expr_mut<F: FnMut(&mut Expr)>(stmts: &mut [Stmt], f: &mut F) {
    for stmt in stmts {
        match stmt {
            Stmt::Let { value, .. } | Stmt::Assign { value, .. } => visit_expr_mut(value, f),
            Stmt::Store { index, value, .. } => {
                if let Some(index) = index {
                    visit_expr_mut(index, f);
                }
                visit_expr_mut(value, f);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                visit_expr_mut(cond, f);
                for_each_expr_mut(then, f);
                for_each_expr_mut(otherwise, f);
            }
            Stmt::For {
                start, end, body, ..
            } => {
                visit_expr_mut(start, f);
                visit_expr_mut(end, f);
                for_each_expr_mut(body, f);
            }
            Stmt::While { cond, body } => {
                visit_expr_mut(cond, f);
                for_each_expr_mut(body, f);
            }
            Stmt::Block(body) => for_each_expr_mut(body, f),
            Stmt::Expr(expr) => visit_expr_mut(expr, f),
            Stmt::Return(value) => {
                if let Some(value) = value {
                    visit_expr_mut(value, f);
                }
            }
            Stmt::Macro(Macro::Print { args, .. }) => args.iter_mut().for_each(|a| visit_expr_mut(a, f)),
            Stmt::Macro(Macro::Show { expr, .. }) => visit_expr_mut(expr, f),
            Stmt::Macro(Macro::Cycles { body, .. }) => for_each_expr_mut(body, f),
        }
    }
}

pub fn visit_expr_mut<F: FnMut(&mut Expr)>(expr: &mut Expr, f: &mut F) {
    match expr {
        Expr::Const(_)
        | Expr::Str(_)
        | Expr::Local(_)
        | Expr::Field(_)
        | Expr::Global(_)
        | Expr::Len(_) => {}
        Expr::Index { index, .. } => visit_expr_mut(index, f),
        Expr::Unary { operand, .. } => visit_expr_mut(operand, f),
        Expr::Binary { lhs, rhs, .. } => {
            visit_expr_mut(lhs, f);
            visit_expr_mut(rhs, f);
        }
        Expr::Cast { expr, .. } => visit_expr_mut(expr, f),
        Expr::Select {
            cond,
            then,
            otherwise,
        } => {
            visit_expr_mut(cond, f);
            visit_expr_mut(then, f);
            visit_expr_mut(otherwise, f);
        }
        Expr::Call(call) => call.args.iter_mut().for_each(|a| visit_expr_mut(a, f)),
        Expr::Alloc { len, .. } => visit_expr_mut(len, f),
    }
    f(expr);
}
