// This module prints a KernelSpec in the text format the parser reads. The output is
// canonical: captures appear in name order, every nested binary expression is
// parenthesised, floats use the shortest representation that reads back to the same bits,
// and typed literals keep their suffix. The codelet identity hashes exactly this text, so
// two specs print identically if and only if they would generate the same code.

//! Canonical text form of kernels.

use std::fmt::{self, Write};

use super::{
    ArrayRef, Call, Callee, Capture, Expr, FieldShape, HelperFn, KernelSpec, Literal, Macro, Scalar, Stmt,
    UnaryOp,
};
use crate::intrinsics::Intrinsic;

const INDENT: &str = "    ";

impl fmt::Display for KernelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, capture) in &self.captures {
            match capture {
                Capture::Constant(value) => {
                    writeln!(f, "const {}: {} = {}", name, value.elem(), untyped(*value))?
                }
                Capture::ConstArray { elem, values } => {
                    write!(f, "const {}: [{}] = [", name, elem)?;
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            f.write_str(", ")?;
                        }
                        f.write_str(&untyped(*value))?;
                    }
                    writeln!(f, "]")?;
                }
                Capture::Mutable { elem } => writeln!(f, "extern mut {}: {}", name, elem)?,
            }
        }
        if !self.captures.is_empty() {
            writeln!(f)?;
        }

        for helper in &self.helpers {
            write_helper(f, helper)?;
            writeln!(f)?;
        }

        write!(f, "codelet {}(", self.name)?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match field.shape {
                FieldShape::Vector => write!(f, "{}: {} [{}]", field.name, field.direction, field.elem)?,
                FieldShape::Scalar => write!(f, "{}: {} {}", field.name, field.direction, field.elem)?,
            }
        }
        writeln!(f, ") {{")?;
        write_stmts(f, &self.body, 1)?;
        writeln!(f, "}}")
    }
}

fn write_helper(f: &mut fmt::Formatter<'_>, helper: &HelperFn) -> fmt::Result {
    write!(f, "fn {}(", helper.name)?;
    for (i, param) in helper.params.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        match param.ty {
            Some(ty) => write!(f, "{}: {}", param.name, ty)?,
            None => f.write_str(&param.name)?,
        }
    }
    writeln!(f, ") {{")?;
    write_stmts(f, &helper.body, 1)?;
    writeln!(f, "}}")
}

fn write_stmts(f: &mut fmt::Formatter<'_>, stmts: &[Stmt], depth: usize) -> fmt::Result {
    for stmt in stmts {
        write_stmt(f, stmt, depth)?;
    }
    Ok(())
}

fn write_stmt(f: &mut fmt::Formatter<'_>, stmt: &Stmt, depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    match stmt {
        Stmt::Let { name, ty, value } => match ty {
            Some(ty) => writeln!(f, "{}let {}: {} = {}", pad, name, ty, ExprText(value)),
            None => writeln!(f, "{}let {} = {}", pad, name, ExprText(value)),
        },
        Stmt::Assign { name, value } => writeln!(f, "{}{} = {}", pad, name, ExprText(value)),
        Stmt::Store { field, index, value } => match index {
            Some(index) => writeln!(f, "{}{}[{}] = {}", pad, field, ExprText(index), ExprText(value)),
            None => writeln!(f, "{}{} = {}", pad, field, ExprText(value)),
        },
        Stmt::If {
            cond,
            then,
            otherwise,
        } => {
            write!(f, "{}", pad)?;
            write_if(f, cond, then, otherwise, depth)
        }
        Stmt::For {
            var,
            start,
            end,
            body,
        } => {
            writeln!(f, "{}for {} in {} .. {} {{", pad, var, ExprText(start), ExprText(end))?;
            write_stmts(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::While { cond, body } => {
            writeln!(f, "{}while {} {{", pad, ExprText(cond))?;
            write_stmts(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Block(body) => {
            writeln!(f, "{}{{", pad)?;
            write_stmts(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
        Stmt::Expr(expr) => writeln!(f, "{}{}", pad, ExprText(expr)),
        Stmt::Return(None) => writeln!(f, "{}return", pad),
        Stmt::Return(Some(value)) => writeln!(f, "{}return {}", pad, ExprText(value)),
        Stmt::Macro(Macro::Print { args, newline }) => {
            let name = if *newline { "println" } else { "print" };
            writeln!(f, "{}@{}({})", pad, name, ArgsText(args))
        }
        Stmt::Macro(Macro::Show { expr, text }) => {
            let printed = ExprText(expr).to_string();
            if *text == printed {
                writeln!(f, "{}@show({})", pad, printed)
            } else {
                writeln!(f, "{}@show({}, {})", pad, quoted(text), printed)
            }
        }
        Stmt::Macro(Macro::Cycles { label, body }) => {
            writeln!(f, "{}@cycles {} {{", pad, quoted(label))?;
            write_stmts(f, body, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
    }
}

fn write_if(f: &mut fmt::Formatter<'_>, cond: &Expr, then: &[Stmt], otherwise: &[Stmt], depth: usize) -> fmt::Result {
    let pad = INDENT.repeat(depth);
    writeln!(f, "if {} {{", ExprText(cond))?;
    write_stmts(f, then, depth + 1)?;
    match otherwise {
        [] => writeln!(f, "{}}}", pad),
        [Stmt::If {
            cond,
            then,
            otherwise,
        }] => {
            write!(f, "{}}} else ", pad)?;
            write_if(f, cond, then, otherwise, depth)
        }
        _ => {
            writeln!(f, "{}}} else {{", pad)?;
            write_stmts(f, otherwise, depth + 1)?;
            writeln!(f, "{}}}", pad)
        }
    }
}

/// Displays one expression in canonical form.
pub struct ExprText<'a>(pub &'a Expr);

impl fmt::Display for ExprText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_expr(f, self.0)
    }
}

struct ArgsText<'a>(&'a [Expr]);

impl fmt::Display for ArgsText<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write_expr(f, arg)?;
        }
        Ok(())
    }
}

fn write_expr(f: &mut fmt::Formatter<'_>, expr: &Expr) -> fmt::Result {
    match expr {
        Expr::Const(literal) => f.write_str(&literal_text(*literal)),
        Expr::Str(text) => f.write_str(&quoted(text)),
        Expr::Local(name) | Expr::Field(name) | Expr::Global(name) => f.write_str(name),
        Expr::Index { base, index } => {
            let name = match base {
                ArrayRef::Field(name) | ArrayRef::Global(name) => name,
            };
            write!(f, "{}[", name)?;
            write_expr(f, index)?;
            f.write_str("]")
        }
        Expr::Len(field) => write!(f, "len({})", field),
        Expr::Unary { op, operand } => {
            f.write_str(match op {
                UnaryOp::Neg => "-",
                UnaryOp::Not => "!",
            })?;
            let wrap = matches!(
                **operand,
                Expr::Binary { .. } | Expr::Cast { .. } | Expr::Const(_)
            );
            write_operand(f, operand, wrap)
        }
        Expr::Binary { op, lhs, rhs } => {
            write_operand(f, lhs, matches!(**lhs, Expr::Binary { .. }))?;
            write!(f, " {} ", op.symbol())?;
            write_operand(f, rhs, matches!(**rhs, Expr::Binary { .. }))
        }
        Expr::Cast { expr, to } => {
            write_operand(f, expr, matches!(**expr, Expr::Binary { .. }))?;
            write!(f, " as {}", to)
        }
        Expr::Select {
            cond,
            then,
            otherwise,
        } => {
            f.write_str("select(")?;
            write_expr(f, cond)?;
            f.write_str(", ")?;
            write_expr(f, then)?;
            f.write_str(", ")?;
            write_expr(f, otherwise)?;
            f.write_str(")")
        }
        Expr::Call(call) => write_call(f, call),
        Expr::Alloc { elem, len } => {
            write!(f, "new [{}; ", elem)?;
            write_expr(f, len)?;
            f.write_str("]")
        }
    }
}

fn write_operand(f: &mut fmt::Formatter<'_>, expr: &Expr, wrap: bool) -> fmt::Result {
    if wrap {
        f.write_str("(")?;
        write_expr(f, expr)?;
        f.write_str(")")
    } else {
        write_expr(f, expr)
    }
}

fn write_call(f: &mut fmt::Formatter<'_>, call: &Call) -> fmt::Result {
    match &call.callee {
        Callee::Static(name) | Callee::Library(name) | Callee::Runtime(name) => {
            if matches!(call.callee, Callee::Runtime(_)) {
                f.write_str("runtime::")?;
            }
            write!(f, "{}(", name)?;
            if let Some(ty) = call.type_arg {
                write!(f, "{}", ty)?;
                if !call.args.is_empty() {
                    f.write_str(", ")?;
                }
            }
            write!(f, "{})", ArgsText(&call.args))
        }
        Callee::Intrinsic(intrinsic) => {
            let surface = match intrinsic {
                Intrinsic::RandF32 => "rand(f32",
                Intrinsic::RandU32 => "rand(u32",
                Intrinsic::RandU64 => "rand(u64",
                other => {
                    return write!(f, "{}({})", other.name(), ArgsText(&call.args));
                }
            };
            write!(f, "{})", surface)
        }
        Callee::Foreign { library, symbol } => {
            write!(f, "{}::{}({})", library, symbol, ArgsText(&call.args))
        }
        Callee::Dynamic { method } => match call.args.split_first() {
            Some((receiver, rest)) => {
                let wrap = !matches!(
                    receiver,
                    Expr::Local(_) | Expr::Field(_) | Expr::Global(_) | Expr::Index { .. } | Expr::Call(_)
                );
                write_operand(f, receiver, wrap)?;
                write!(f, ".{}({})", method, ArgsText(rest))
            }
            None => write!(f, "().{}()", method),
        },
    }
}

fn literal_text(literal: Literal) -> String {
    match literal {
        Literal::Int(value) => value.to_string(),
        Literal::Float(value) => float_text(value),
        Literal::Typed(Scalar::Bool(b)) => b.to_string(),
        Literal::Typed(Scalar::F32(v)) => format!("{:?}f32", v),
        Literal::Typed(scalar) => format!("{}{}", scalar.as_i128(), scalar.elem()),
    }
}

/// Constant value without a suffix; its type comes from the declaration.
fn untyped(value: Scalar) -> String {
    match value {
        Scalar::Bool(b) => b.to_string(),
        Scalar::F32(v) => format!("{:?}", v),
        other => other.as_i128().to_string(),
    }
}

fn float_text(value: f64) -> String {
    let mut text = format!("{:?}", value);
    if !text.contains(['.', 'e', 'E']) && value.is_finite() {
        text.push_str(".0");
    }
    text
}

/// Quote `text` as a string literal of the text format.
pub fn quoted(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// The canonical text hashed for codelet identity.
pub fn canonical_text(spec: &KernelSpec) -> String {
    let mut text = String::new();
    // Writing into a String cannot fail.
    let _ = write!(text, "{}", spec);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{BinaryOp, ElemType, Expr, Stmt};

    #[test]
    fn nested_binaries_are_parenthesised() {
        let e = (Expr::local("a") + Expr::local("b")) * Expr::local("c");
        assert_eq!(ExprText(&e).to_string(), "(a + b) * c");
        let e = Expr::local("a") - (Expr::local("b") - Expr::local("c"));
        assert_eq!(ExprText(&e).to_string(), "a - (b - c)");
    }

    #[test]
    fn literals_keep_their_type() {
        assert_eq!(ExprText(&Expr::float(2.0)).to_string(), "2.0");
        assert_eq!(ExprText(&Expr::scalar(Scalar::U32(7))).to_string(), "7u32");
        assert_eq!(ExprText(&Expr::scalar(Scalar::F32(0.5))).to_string(), "0.5f32");
        assert_eq!(ExprText(&Expr::scalar(Scalar::F32(3.0))).to_string(), "3.0f32");
        assert_eq!(
            ExprText(&Expr::unary(UnaryOp::Neg, Expr::int(3))).to_string(),
            "-(3)"
        );
    }

    #[test]
    fn prints_full_codelet() {
        let spec = KernelSpec::builder("Scale")
            .input("x", ElemType::F32)
            .output("y", ElemType::F32)
            .constant("S", Scalar::F32(2.0))
            .body(vec![Stmt::for_range(
                "i",
                Expr::int(0),
                Expr::len("x"),
                vec![Stmt::store(
                    "y",
                    Expr::local("i"),
                    Expr::binary(BinaryOp::Mul, Expr::index("x", Expr::local("i")), Expr::global("S")),
                )],
            )])
            .build()
            .unwrap();

        let expected = "\
const S: f32 = 2.0

codelet Scale(x: in [f32], y: out [f32]) {
    for i in 0 .. len(x) {
        y[i] = x[i] * S
    }
}
";
        assert_eq!(spec.to_string(), expected);
    }

    #[test]
    fn escapes_strings() {
        assert_eq!(quoted("a \"b\"\n"), "\"a \\\"b\\\"\\n\"");
    }
}
