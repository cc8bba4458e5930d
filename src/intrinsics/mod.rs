//! Intrinsic binding layer.
//!
//! Kernel bodies name a small fixed set of device operations through generic
//! call shapes (`rand(f32)`, `tile_id()`, `print(..)`, `sqrt(x)`, ...). [`bind`]
//! substitutes those shapes with [`Intrinsic`] callees before verification, so
//! the verifier never sees a library call that has a device binding.
//! Instrumentation macros stay structured until code generation, where
//! [`elaborate`] expands them (or, with print disabled, removes them so
//! nothing at all is emitted). [`lower`] maps each intrinsic onto its
//! Colossus instruction sequence.

use std::fmt;

use crate::kernel::visit::for_each_expr_mut;
use crate::kernel::{Call, Callee, ElemType, Expr, HelperFn, KernelSpec, Macro, Stmt};

pub mod sim;

/// Device operations with a native binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Intrinsic {
    /// Uniform `f32` in `[0, 1)`.
    RandF32,
    RandU32,
    RandU64,
    /// Low 32 bits of the tile-local cycle counter.
    CycleCount,
    TileId,
    Print { newline: bool },
    Math(MathFn),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MathFn {
    Sqrt,
    Exp,
    Log,
    Sin,
    Cos,
    Fabs,
    Floor,
    Ceil,
}

impl MathFn {
    pub const ALL: [MathFn; 8] = [
        MathFn::Sqrt,
        MathFn::Exp,
        MathFn::Log,
        MathFn::Sin,
        MathFn::Cos,
        MathFn::Fabs,
        MathFn::Floor,
        MathFn::Ceil,
    ];

    pub fn name(self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Exp => "exp",
            MathFn::Log => "log",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Fabs => "fabs",
            MathFn::Floor => "floor",
            MathFn::Ceil => "ceil",
        }
    }

    pub fn apply(self, x: f32) -> f32 {
        match self {
            MathFn::Sqrt => x.sqrt(),
            MathFn::Exp => x.exp(),
            MathFn::Log => x.ln(),
            MathFn::Sin => x.sin(),
            MathFn::Cos => x.cos(),
            MathFn::Fabs => x.abs(),
            MathFn::Floor => x.floor(),
            MathFn::Ceil => x.ceil(),
        }
    }
}

impl Intrinsic {
    pub fn name(self) -> &'static str {
        match self {
            Intrinsic::RandF32 => "rand_f32",
            Intrinsic::RandU32 => "rand_u32",
            Intrinsic::RandU64 => "rand_u64",
            Intrinsic::CycleCount => "cycle_count",
            Intrinsic::TileId => "tile_id",
            Intrinsic::Print { newline: false } => "print",
            Intrinsic::Print { newline: true } => "println",
            Intrinsic::Math(f) => f.name(),
        }
    }

    /// Type of the value produced; `None` for print, which yields nothing.
    pub fn result_type(self) -> Option<ElemType> {
        match self {
            Intrinsic::RandF32 | Intrinsic::Math(_) => Some(ElemType::F32),
            Intrinsic::RandU32 | Intrinsic::CycleCount | Intrinsic::TileId => Some(ElemType::U32),
            Intrinsic::RandU64 => Some(ElemType::U64),
            Intrinsic::Print { .. } => None,
        }
    }

    pub fn is_print(self) -> bool {
        matches!(self, Intrinsic::Print { .. })
    }

    /// Resolve a library call shape.
    pub fn resolve(name: &str, type_arg: Option<ElemType>, argc: usize) -> Option<Intrinsic> {
        let intrinsic = match (name, type_arg, argc) {
            ("rand", None | Some(ElemType::F32), 0) => Intrinsic::RandF32,
            ("rand", Some(ElemType::U32), 0) => Intrinsic::RandU32,
            ("rand", Some(ElemType::U64), 0) => Intrinsic::RandU64,
            ("cycle_count" | "get_scount_l", None, 0) => Intrinsic::CycleCount,
            ("tile_id" | "get_tile_id", None, 0) => Intrinsic::TileId,
            ("print", None, _) => Intrinsic::Print { newline: false },
            ("println", None, _) => Intrinsic::Print { newline: true },
            (name, None, 1) => Intrinsic::Math(MathFn::ALL.into_iter().find(|f| f.name() == name)?),
            _ => return None,
        };
        Some(intrinsic)
    }
}

impl fmt::Display for Intrinsic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Substitute every library call shape that has a device binding.
///
/// Calls without a binding are left untouched for the verifier to reject.
pub fn bind(spec: &mut KernelSpec) {
    for_each_expr_mut(&mut spec.body, &mut bind_call);
    for helper in &mut spec.helpers {
        for_each_expr_mut(&mut helper.body, &mut bind_call);
    }
}

fn bind_call(expr: &mut Expr) {
    let Expr::Call(call) = expr else { return };
    if let Callee::Library(name) = &call.callee {
        if let Some(intrinsic) = Intrinsic::resolve(name, call.type_arg, call.args.len()) {
            log::trace!("bound `{}` to intrinsic {}", name, intrinsic);
            call.callee = Callee::Intrinsic(intrinsic);
            call.type_arg = None;
        }
    }
}

/// Expand instrumentation macros into intrinsic sequences.
///
/// With `print` false every print call in statement position and every macro
/// disappears; `@cycles` blocks keep only their body.
pub fn elaborate(spec: &KernelSpec, print: bool) -> KernelSpec {
    let mut expander = Expander { print, next_id: 0 };
    let mut out = spec.clone();
    out.body = expander.stmts(&spec.body);
    out.helpers = spec
        .helpers
        .iter()
        .map(|h| HelperFn {
            body: expander.stmts(&h.body),
            ..h.clone()
        })
        .collect();
    out
}

/// Drop all print and benchmark instrumentation in place.
pub fn elide_instrumentation(spec: &mut KernelSpec) {
    *spec = elaborate(spec, false);
}

struct Expander {
    print: bool,
    next_id: u32,
}

impl Expander {
    fn stmts(&mut self, stmts: &[Stmt]) -> Vec<Stmt> {
        let mut out = Vec::with_capacity(stmts.len());
        for stmt in stmts {
            self.stmt(stmt, &mut out);
        }
        out
    }

    fn stmt(&mut self, stmt: &Stmt, out: &mut Vec<Stmt>) {
        match stmt {
            Stmt::Expr(Expr::Call(Call {
                callee: Callee::Intrinsic(i),
                ..
            })) if i.is_print() && !self.print => {}
            Stmt::Macro(m) if !self.print => {
                if let Macro::Cycles { body, .. } = m {
                    out.push(Stmt::Block(self.stmts(body)));
                }
            }
            Stmt::Macro(Macro::Print { args, newline }) => out.push(print_stmt(args.clone(), *newline)),
            Stmt::Macro(Macro::Show { expr, text }) => {
                out.push(print_stmt(vec![Expr::Str(format!("{} = ", text)), expr.clone()], true))
            }
            Stmt::Macro(Macro::Cycles { label, body }) => {
                let id = self.next_id;
                self.next_id += 1;
                let start = format!("__cycles_start{}", id);
                let end = format!("__cycles_end{}", id);
                let counter = || {
                    Expr::Call(Call {
                        callee: Callee::Intrinsic(Intrinsic::CycleCount),
                        type_arg: None,
                        args: Vec::new(),
                    })
                };
                out.push(Stmt::let_typed(&start, ElemType::U32, counter()));
                out.push(Stmt::Block(self.stmts(body)));
                out.push(Stmt::let_typed(&end, ElemType::U32, counter()));
                out.push(print_stmt(
                    vec![
                        Expr::Str(format!("{}: ", label)),
                        Expr::local(&end) - Expr::local(&start),
                        Expr::Str(" cycles".to_string()),
                    ],
                    true,
                ));
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => out.push(Stmt::If {
                cond: cond.clone(),
                then: self.stmts(then),
                otherwise: self.stmts(otherwise),
            }),
            Stmt::For {
                var,
                start,
                end,
                body,
            } => out.push(Stmt::For {
                var: var.clone(),
                start: start.clone(),
                end: end.clone(),
                body: self.stmts(body),
            }),
            Stmt::While { cond, body } => out.push(Stmt::While {
                cond: cond.clone(),
                body: self.stmts(body),
            }),
            Stmt::Block(body) => out.push(Stmt::Block(self.stmts(body))),
            other => out.push(other.clone()),
        }
    }
}

fn print_stmt(args: Vec<Expr>, newline: bool) -> Stmt {
    Stmt::Expr(Expr::Call(Call {
        callee: Callee::Intrinsic(Intrinsic::Print { newline }),
        type_arg: None,
        args,
    }))
}

/// An intrinsic argument after lowering.
#[derive(Debug, Clone)]
pub enum LoweredArg {
    /// Literal text, only accepted by print.
    Text(String),
    /// An SSA value or immediate with its type.
    Value(String, ElemType),
}

/// What [`lower`] needs from the function being emitted.
pub trait InstructionSink {
    /// A fresh SSA register name, including the `%`.
    fn fresh(&mut self) -> String;
    fn emit(&mut self, instruction: String);
    /// Add a module-level declaration, deduplicated by the sink.
    fn declare(&mut self, declaration: &str);
    /// Add a NUL-terminated private string constant and return its symbol.
    fn string_constant(&mut self, text: &str) -> String;
    fn note_intrinsic(&mut self, _intrinsic: Intrinsic) {}
}

const DECL_URAND32: &str = "declare i32 @llvm.colossus.urand32()";
const DECL_URAND64: &str = "declare i64 @llvm.colossus.urand64()";
const DECL_SCOUNT: &str = "declare i32 @llvm.colossus.get.scount.l()";
const DECL_TILE_ID: &str = "declare i32 @llvm.colossus.get.tile.id()";
const DECL_PRINTF: &str = "declare i32 @printf(ptr, ...)";

/// 2^-24 as an LLVM hexadecimal float immediate.
const TWO_POW_MINUS_24: &str = "0x3E70000000000000";

/// Emit the instruction sequence of `intrinsic`.
///
/// Returns the produced value, or `None` for print.
pub fn lower<S: InstructionSink>(
    sink: &mut S,
    intrinsic: Intrinsic,
    args: &[LoweredArg],
) -> Result<Option<(String, ElemType)>, String> {
    sink.note_intrinsic(intrinsic);
    let expected_args = match intrinsic {
        Intrinsic::Print { .. } => None,
        Intrinsic::Math(_) => Some(1),
        _ => Some(0),
    };
    if let Some(expected) = expected_args {
        if args.len() != expected {
            return Err(format!("{} takes {} argument(s), got {}", intrinsic, expected, args.len()));
        }
    }

    let value = match intrinsic {
        Intrinsic::RandU32 => {
            sink.declare(DECL_URAND32);
            let r = sink.fresh();
            sink.emit(format!("{} = call i32 @llvm.colossus.urand32()", r));
            (r, ElemType::U32)
        }
        Intrinsic::RandU64 => {
            sink.declare(DECL_URAND64);
            let r = sink.fresh();
            sink.emit(format!("{} = call i64 @llvm.colossus.urand64()", r));
            (r, ElemType::U64)
        }
        Intrinsic::RandF32 => {
            // Top 24 bits of a 32-bit draw, scaled by 2^-24: exactly representable, never 1.0.
            sink.declare(DECL_URAND32);
            let bits = sink.fresh();
            sink.emit(format!("{} = call i32 @llvm.colossus.urand32()", bits));
            let mantissa = sink.fresh();
            sink.emit(format!("{} = lshr i32 {}, 8", mantissa, bits));
            let float = sink.fresh();
            sink.emit(format!("{} = uitofp i32 {} to float", float, mantissa));
            let r = sink.fresh();
            sink.emit(format!("{} = fmul float {}, {}", r, float, TWO_POW_MINUS_24));
            (r, ElemType::F32)
        }
        Intrinsic::CycleCount => {
            sink.declare(DECL_SCOUNT);
            let r = sink.fresh();
            sink.emit(format!("{} = call i32 @llvm.colossus.get.scount.l()", r));
            (r, ElemType::U32)
        }
        Intrinsic::TileId => {
            sink.declare(DECL_TILE_ID);
            let r = sink.fresh();
            sink.emit(format!("{} = call i32 @llvm.colossus.get.tile.id()", r));
            (r, ElemType::U32)
        }
        Intrinsic::Math(f) => {
            let (operand, ty) = match &args[0] {
                LoweredArg::Value(v, ElemType::F32) => (v.clone(), ElemType::F32),
                LoweredArg::Value(_, other) => return Err(format!("{} expects f32, got {}", f.name(), other)),
                LoweredArg::Text(_) => return Err(format!("{} expects f32, got a string", f.name())),
            };
            let callee = format!("llvm.{}.f32", f.name());
            sink.declare(&format!("declare float @{}(float)", callee));
            let r = sink.fresh();
            sink.emit(format!("{} = call float @{}(float {})", r, callee, operand));
            (r, ty)
        }
        Intrinsic::Print { newline } => {
            lower_print(sink, args, newline)?;
            return Ok(None);
        }
    };
    Ok(Some(value))
}

fn lower_print<S: InstructionSink>(sink: &mut S, args: &[LoweredArg], newline: bool) -> Result<(), String> {
    let mut format = String::new();
    let mut operands = Vec::new();

    for arg in args {
        match arg {
            LoweredArg::Text(text) => format.push_str(&text.replace('%', "%%")),
            LoweredArg::Value(value, ty) => match ty {
                ElemType::Bool => {
                    let widened = sink.fresh();
                    sink.emit(format!("{} = zext i1 {} to i32", widened, value));
                    format.push_str("%d");
                    operands.push(format!("i32 {}", widened));
                }
                ElemType::I32 => {
                    format.push_str("%d");
                    operands.push(format!("i32 {}", value));
                }
                ElemType::U32 => {
                    format.push_str("%u");
                    operands.push(format!("i32 {}", value));
                }
                ElemType::I64 => {
                    format.push_str("%lld");
                    operands.push(format!("i64 {}", value));
                }
                ElemType::U64 => {
                    format.push_str("%llu");
                    operands.push(format!("i64 {}", value));
                }
                ElemType::F32 => {
                    // C varargs promote float to double.
                    let widened = sink.fresh();
                    sink.emit(format!("{} = fpext float {} to double", widened, value));
                    format.push_str("%f");
                    operands.push(format!("double {}", widened));
                }
            },
        }
    }
    if newline {
        format.push('\n');
    }
    if format.is_empty() {
        return Ok(());
    }

    sink.declare(DECL_PRINTF);
    let text = sink.string_constant(&format);
    let r = sink.fresh();
    let mut call = format!("{} = call i32 (ptr, ...) @printf(ptr {}", r, text);
    for operand in &operands {
        call.push_str(", ");
        call.push_str(operand);
    }
    call.push(')');
    sink.emit(call);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        next: u32,
        lines: Vec<String>,
        decls: Vec<String>,
        strings: Vec<String>,
    }

    impl InstructionSink for Recorder {
        fn fresh(&mut self) -> String {
            self.next += 1;
            format!("%t{}", self.next)
        }

        fn emit(&mut self, instruction: String) {
            self.lines.push(instruction);
        }

        fn declare(&mut self, declaration: &str) {
            if !self.decls.iter().any(|d| d == declaration) {
                self.decls.push(declaration.to_string());
            }
        }

        fn string_constant(&mut self, text: &str) -> String {
            self.strings.push(text.to_string());
            format!("@.str.{}", self.strings.len() - 1)
        }
    }

    #[test]
    fn resolves_call_shapes() {
        assert_eq!(Intrinsic::resolve("rand", Some(ElemType::F32), 0), Some(Intrinsic::RandF32));
        assert_eq!(Intrinsic::resolve("rand", Some(ElemType::U64), 0), Some(Intrinsic::RandU64));
        assert_eq!(Intrinsic::resolve("rand", Some(ElemType::I32), 0), None);
        assert_eq!(Intrinsic::resolve("tile_id", None, 0), Some(Intrinsic::TileId));
        assert_eq!(Intrinsic::resolve("sqrt", None, 1), Some(Intrinsic::Math(MathFn::Sqrt)));
        assert_eq!(Intrinsic::resolve("sqrt", None, 2), None);
        assert_eq!(Intrinsic::resolve("sinh", None, 1), None);
    }

    #[test]
    fn bind_rewrites_nested_calls() {
        let mut spec = KernelSpec::builder("K")
            .output("y", ElemType::F32)
            .body(vec![Stmt::store(
                "y",
                Expr::int(0),
                Expr::library("sqrt", vec![Expr::rand(ElemType::F32)]),
            )])
            .build()
            .unwrap();
        bind(&mut spec);

        let Stmt::Store { value, .. } = &spec.body()[0] else {
            panic!("expected store");
        };
        let Expr::Call(outer) = value else { panic!("expected call") };
        assert_eq!(outer.callee, Callee::Intrinsic(Intrinsic::Math(MathFn::Sqrt)));
        assert_eq!(
            outer.args[0],
            Expr::call(Callee::Intrinsic(Intrinsic::RandF32), vec![])
        );
    }

    #[test]
    fn rand_f32_lowers_to_scaled_draw() {
        let mut sink = Recorder::default();
        let (value, ty) = lower(&mut sink, Intrinsic::RandF32, &[]).unwrap().unwrap();
        assert_eq!(ty, ElemType::F32);
        assert_eq!(value, "%t4");
        assert_eq!(sink.lines[0], "%t1 = call i32 @llvm.colossus.urand32()");
        assert_eq!(sink.lines[1], "%t2 = lshr i32 %t1, 8");
        assert_eq!(sink.decls, vec![DECL_URAND32]);
    }

    #[test]
    fn print_builds_format_string() {
        let mut sink = Recorder::default();
        let args = [
            LoweredArg::Text("100% of ".into()),
            LoweredArg::Value("%x".into(), ElemType::U32),
            LoweredArg::Text(" is ".into()),
            LoweredArg::Value("%y".into(), ElemType::F32),
        ];
        assert!(lower(&mut sink, Intrinsic::Print { newline: true }, &args).unwrap().is_none());
        assert_eq!(sink.strings, vec!["100%% of %u is %f\n"]);
        assert!(sink.lines.last().unwrap().contains("@printf(ptr @.str.0, i32 %x, double %t1)"));
    }

    #[test]
    fn elaborate_without_print_keeps_only_bodies() {
        let mut spec = KernelSpec::builder("K")
            .output("y", ElemType::U32)
            .body(vec![
                Stmt::println(vec![Expr::str("hello")]),
                Stmt::cycles("store", vec![Stmt::store("y", Expr::int(0), Expr::int(1))]),
                Stmt::Expr(Expr::library("print", vec![Expr::str("x")])),
            ])
            .build()
            .unwrap();
        bind(&mut spec);

        let quiet = elaborate(&spec, false);
        assert_eq!(
            quiet.body(),
            &[Stmt::Block(vec![Stmt::store("y", Expr::int(0), Expr::int(1))])]
        );

        let loud = elaborate(&spec, true);
        assert_eq!(loud.body().len(), 6);
        assert!(matches!(&loud.body()[1], Stmt::Let { name, .. } if name == "__cycles_start0"));
    }
}
