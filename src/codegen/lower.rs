// This module lowers a verified, elaborated KernelSpec to textual LLVM IR. ModuleBuilder owns
// the module-level state: declarations, string constants, constant tables and the helper
// specialisations, keyed by helper name and concrete argument types so every generic helper
// is emitted once per type tuple. FunctionBuilder lowers one function body: locals live in
// entry-block allocas, control flow is built from labelled blocks, untyped literals adopt the
// type of their peer operand, and signedness selects the integer instruction variants. Every
// construct that cannot be expressed on a tile is reported as a LoweringError naming the
// construct. Output ordering depends only on the input, never on hashing or addresses.

//! Lowering of kernel bodies to LLVM IR text.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::codegen::target::TargetDesc;
use crate::core::error::LoweringError;
use crate::core::session::CompilationSession;
use crate::intrinsics::{self, InstructionSink, Intrinsic, LoweredArg};
use crate::kernel::display::ExprText;
use crate::kernel::{
    ArrayRef, BinaryOp, Call, Callee, Capture, ElemType, Expr, FieldDecl, FieldShape, KernelSpec, Literal,
    Scalar, Stmt, UnaryOp,
};

type LResult<T> = Result<T, LoweringError>;

/// Result of lowering one codelet.
pub(crate) struct LoweredModule {
    pub text: String,
    /// Every function defined by the module, helpers first.
    pub defined: Vec<String>,
}

/// Itanium-mangled symbol of `bool <name>::compute()`.
pub fn compute_symbol(codelet: &str) -> String {
    format!("_ZN{}{}7computeEv", codelet.len(), codelet)
}

/// LLVM name of the vertex state struct type.
pub fn state_type(codelet: &str) -> String {
    format!("%{}.state", codelet)
}

/// LLVM immediate of a typed constant.
pub fn immediate(value: Scalar) -> String {
    match value {
        Scalar::Bool(b) => b.to_string(),
        Scalar::I32(v) => v.to_string(),
        Scalar::U32(v) => (v as i32).to_string(),
        Scalar::I64(v) => v.to_string(),
        Scalar::U64(v) => (v as i64).to_string(),
        Scalar::F32(v) => float_immediate(v),
    }
}

/// Floats are written as the hex bits of the equivalent double, which LLVM
/// requires to be exactly representable as `float`.
pub fn float_immediate(value: f32) -> String {
    format!("0x{:016X}", (value as f64).to_bits())
}

pub(crate) fn lower_module(
    spec: &KernelSpec,
    target: &TargetDesc,
    session: &CompilationSession<'_>,
) -> LResult<LoweredModule> {
    let mut module = ModuleBuilder {
        spec,
        session,
        declarations: Vec::new(),
        strings: Vec::new(),
        tables: Vec::new(),
        functions: Vec::new(),
        defined: Vec::new(),
        specializations: BTreeMap::new(),
        in_progress: Vec::new(),
    };

    let symbol = compute_symbol(spec.name());
    session.set_current_function(&symbol);
    let mut fb = FunctionBuilder::new(&mut module, symbol.clone(), ReturnKind::Compute);
    fb.load_fields()?;
    fb.block(spec.body())?;
    let compute = fb.finish(&format!(
        "define zeroext i1 @{}(ptr noundef %this) nounwind",
        symbol
    ));
    module.functions.push(compute);
    module.defined.push(symbol);

    Ok(module.assemble(target))
}

#[derive(Debug, Clone, Copy)]
struct Specialization<'arena> {
    symbol: &'arena str,
    ret: Option<ElemType>,
}

struct ModuleBuilder<'s, 'arena> {
    spec: &'s KernelSpec,
    session: &'s CompilationSession<'arena>,
    declarations: Vec<String>,
    /// String constants in first-use order; index is the symbol suffix.
    strings: Vec<String>,
    /// Constant tables referenced so far, in first-use order.
    tables: Vec<String>,
    functions: Vec<String>,
    defined: Vec<String>,
    specializations: BTreeMap<(String, Vec<ElemType>), Specialization<'arena>>,
    in_progress: Vec<String>,
}

impl<'s, 'arena> ModuleBuilder<'s, 'arena> {
    fn error(&self, construct: impl Into<String>, reason: impl Into<String>) -> LoweringError {
        LoweringError {
            codelet: self.spec.name().to_string(),
            construct: construct.into(),
            reason: reason.into(),
        }
    }

    fn declare(&mut self, declaration: &str) {
        if !self.declarations.iter().any(|d| d == declaration) {
            self.declarations.push(declaration.to_string());
        }
    }

    fn string_constant(&mut self, text: &str) -> String {
        let index = match self.strings.iter().position(|s| s == text) {
            Some(index) => index,
            None => {
                self.strings.push(text.to_string());
                self.strings.len() - 1
            }
        };
        format!("@.str.{}", index)
    }

    /// Symbol, element type and length of a captured constant table.
    fn table(&mut self, name: &str) -> LResult<(String, ElemType, usize)> {
        let spec: &'s KernelSpec = self.spec;
        match spec.captures().get(name) {
            Some(Capture::ConstArray { elem, values }) => {
                if !self.tables.iter().any(|t| t == name) {
                    self.tables.push(name.to_string());
                }
                Ok((format!("@{}.{}", spec.name(), name), *elem, values.len()))
            }
            Some(Capture::Constant(_)) => Err(self.error(format!("`{}[..]`", name), "constant is not a table")),
            _ => Err(self.error(format!("`{}`", name), "reference to uncaptured host data")),
        }
    }

    /// Emit (once) the specialisation of helper `name` for `arg_types`.
    fn specialize(&mut self, name: &str, arg_types: Vec<ElemType>) -> LResult<Specialization<'arena>> {
        let key = (name.to_string(), arg_types);
        if let Some(existing) = self.specializations.get(&key) {
            return Ok(*existing);
        }
        if self.in_progress.iter().any(|n| n == name) {
            return Err(self.error(
                format!("call to `{}`", name),
                format!("recursion through {} -> {}", self.in_progress.join(" -> "), name),
            ));
        }

        let spec: &'s KernelSpec = self.spec;
        let helper = spec
            .helper(name)
            .ok_or_else(|| self.error(format!("call to `{}`", name), "no such helper"))?;
        let arg_types = &key.1;

        // Helpers live under the codelet's name, next to its tables, so no
        // helper name can clash with a declared intrinsic or libc symbol.
        let mut symbol = format!("{}.{}", spec.name(), name);
        for ty in arg_types {
            symbol.push('.');
            symbol.push_str(ty.name());
        }
        let symbol = self.session.intern_str(&symbol);
        log::trace!("specialising `{}` as {}", name, symbol);

        self.in_progress.push(name.to_string());
        let mut fb = FunctionBuilder::new(self, symbol.to_string(), ReturnKind::Helper(None));
        let mut params = Vec::with_capacity(helper.params.len());
        let mut scope = BTreeMap::new();
        for (i, (param, ty)) in helper.params.iter().zip(arg_types).enumerate() {
            let incoming = format!("%arg{}", i);
            params.push(format!("{} {}", ty.llvm(), incoming));
            let slot = fb.alloca(&param.name, *ty);
            fb.emit(format!("store {} {}, ptr {}", ty.llvm(), incoming, slot));
            scope.insert(param.name.clone(), Local { ptr: slot, ty: *ty });
        }
        fb.scopes.push(scope);
        let lowered = fb.block(&helper.body);
        let ret = match fb.ret {
            ReturnKind::Helper(ret) => ret.flatten(),
            ReturnKind::Compute => None,
        };
        let header = format!(
            "define internal {} @{}({}) nounwind",
            ret.map_or("void", |t| t.llvm()),
            symbol,
            params.join(", ")
        );
        let text = fb.finish(&header);
        self.in_progress.pop();
        lowered?;

        self.session.record_specialization();
        self.functions.push(text);
        self.defined.push(symbol.to_string());
        let specialization = Specialization { symbol, ret };
        self.specializations.insert(key, specialization);
        Ok(specialization)
    }

    fn assemble(self, target: &TargetDesc) -> LoweredModule {
        let spec = self.spec;
        let mut out = String::new();

        // Writing into a String cannot fail.
        let _ = writeln!(out, "; ModuleID = '{}'", spec.name());
        let _ = writeln!(out, "source_filename = \"{}\"", spec.name());
        let _ = writeln!(out, "target datalayout = \"{}\"", target.data_layout);
        let _ = writeln!(out, "target triple = \"{}\"", target.triple);
        let _ = writeln!(out);

        let slots: Vec<&str> = spec
            .fields()
            .iter()
            .map(|f| match f.shape {
                FieldShape::Vector => "{ ptr, i32 }",
                FieldShape::Scalar => "ptr",
            })
            .collect();
        let _ = writeln!(out, "{} = type {{ {} }}", state_type(spec.name()), slots.join(", "));
        let _ = writeln!(out);

        for name in &self.tables {
            if let Some(Capture::ConstArray { elem, values }) = spec.captures().get(name) {
                let storage = elem.llvm_storage();
                let items: Vec<String> = values
                    .iter()
                    .map(|v| match v {
                        Scalar::Bool(b) => format!("i8 {}", *b as u8),
                        other => format!("{} {}", storage, immediate(*other)),
                    })
                    .collect();
                let _ = writeln!(
                    out,
                    "@{}.{} = private unnamed_addr constant [{} x {}] [{}]",
                    spec.name(),
                    name,
                    values.len(),
                    storage,
                    items.join(", ")
                );
            }
        }
        for (i, text) in self.strings.iter().enumerate() {
            let _ = writeln!(
                out,
                "@.str.{} = private unnamed_addr constant [{} x i8] c\"{}\"",
                i,
                text.len() + 1,
                escape_bytes(text)
            );
        }
        if !self.tables.is_empty() || !self.strings.is_empty() {
            let _ = writeln!(out);
        }

        for function in &self.functions {
            out.push_str(function);
            out.push('\n');
        }

        for declaration in &self.declarations {
            let _ = writeln!(out, "{}", declaration);
        }

        LoweredModule {
            text: out,
            defined: self.defined,
        }
    }
}

fn escape_bytes(text: &str) -> String {
    let mut out = String::new();
    for byte in text.bytes().chain(std::iter::once(0)) {
        if (0x20..0x7f).contains(&byte) && byte != b'"' && byte != b'\\' {
            out.push(byte as char);
        } else {
            let _ = write!(out, "\\{:02X}", byte);
        }
    }
    out
}

#[derive(Debug, Clone)]
struct Value {
    repr: String,
    ty: ElemType,
}

#[derive(Debug, Clone)]
struct Local {
    ptr: String,
    ty: ElemType,
}

struct FieldSlot {
    decl: FieldDecl,
    /// Pointer to the first element (vector) or to the value (scalar).
    base: String,
    len: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum ReturnKind {
    Compute,
    /// `None` until the first `return`; then `Some(None)` for void.
    Helper(Option<Option<ElemType>>),
}

struct FunctionBuilder<'m, 's, 'arena> {
    module: &'m mut ModuleBuilder<'s, 'arena>,
    symbol: String,
    allocas: Vec<String>,
    lines: Vec<String>,
    next_reg: u32,
    next_label: u32,
    next_local: u32,
    scopes: Vec<BTreeMap<String, Local>>,
    fields: BTreeMap<String, FieldSlot>,
    ret: ReturnKind,
    current_block: String,
    terminated: bool,
    instructions: usize,
}

impl<'m, 's, 'arena> FunctionBuilder<'m, 's, 'arena> {
    fn new(module: &'m mut ModuleBuilder<'s, 'arena>, symbol: String, ret: ReturnKind) -> Self {
        Self {
            module,
            symbol,
            allocas: Vec::new(),
            lines: Vec::new(),
            next_reg: 0,
            next_label: 0,
            next_local: 0,
            scopes: Vec::new(),
            fields: BTreeMap::new(),
            ret,
            current_block: "entry".to_string(),
            terminated: false,
            instructions: 0,
        }
    }

    fn error(&self, construct: impl Into<String>, reason: impl Into<String>) -> LoweringError {
        self.module.error(construct, reason)
    }

    fn label(&mut self, prefix: &str) -> String {
        self.next_label += 1;
        format!("{}{}", prefix, self.next_label)
    }

    fn start_block(&mut self, label: String) {
        self.lines.push(format!("{}:", label));
        self.current_block = label;
        self.terminated = false;
    }

    fn terminate(&mut self, instruction: String) {
        self.emit(instruction);
        self.terminated = true;
    }

    fn alloca(&mut self, name: &str, ty: ElemType) -> String {
        let ptr = format!("%{}.{}", name, self.next_local);
        self.next_local += 1;
        self.allocas.push(format!("  {} = alloca {}", ptr, ty.llvm()));
        ptr
    }

    fn lookup(&self, name: &str) -> Option<&Local> {
        self.scopes.iter().rev().find_map(|scope| scope.get(name))
    }

    fn finish(mut self, header: &str) -> String {
        if !self.terminated {
            let ret = match self.ret {
                ReturnKind::Compute => "ret i1 true".to_string(),
                ReturnKind::Helper(None) | ReturnKind::Helper(Some(None)) => "ret void".to_string(),
                ReturnKind::Helper(Some(Some(ty))) => format!("ret {} {}", ty.llvm(), immediate(Scalar::zero(ty))),
            };
            self.terminate(ret);
        }

        let mut text = String::new();
        let _ = writeln!(text, "{} {{", header);
        let _ = writeln!(text, "entry:");
        for line in self.allocas.iter().chain(&self.lines) {
            let _ = writeln!(text, "{}", line);
        }
        let _ = writeln!(text, "}}");

        self.module
            .session
            .record_function_emitted(&self.symbol, self.instructions + self.allocas.len());
        text
    }

    /// Load the field pointers and lengths out of the vertex state.
    fn load_fields(&mut self) -> LResult<()> {
        let spec: &'s KernelSpec = self.module.spec;
        let state = state_type(spec.name());
        for (slot, field) in spec.fields().iter().enumerate() {
            let (base, len) = match field.shape {
                FieldShape::Vector => {
                    let base_addr = format!("%{}.base.addr", field.name);
                    let len_addr = format!("%{}.len.addr", field.name);
                    let base = format!("%{}.base", field.name);
                    let len = format!("%{}.len", field.name);
                    self.emit(format!(
                        "{} = getelementptr inbounds {}, ptr %this, i32 0, i32 {}, i32 0",
                        base_addr, state, slot
                    ));
                    self.emit(format!("{} = load ptr, ptr {}", base, base_addr));
                    self.emit(format!(
                        "{} = getelementptr inbounds {}, ptr %this, i32 0, i32 {}, i32 1",
                        len_addr, state, slot
                    ));
                    self.emit(format!("{} = load i32, ptr {}", len, len_addr));
                    (base, Some(len))
                }
                FieldShape::Scalar => {
                    let addr = format!("%{}.addr", field.name);
                    let base = format!("%{}.ptr", field.name);
                    self.emit(format!(
                        "{} = getelementptr inbounds {}, ptr %this, i32 0, i32 {}",
                        addr, state, slot
                    ));
                    self.emit(format!("{} = load ptr, ptr {}", base, addr));
                    (base, None)
                }
            };
            self.fields.insert(
                field.name.clone(),
                FieldSlot {
                    decl: field.clone(),
                    base,
                    len,
                },
            );
        }
        Ok(())
    }

    fn field(&self, name: &str) -> LResult<&FieldSlot> {
        match self.fields.get(name) {
            Some(slot) => Ok(slot),
            None if matches!(self.ret, ReturnKind::Helper(_)) => Err(self.error(
                format!("`{}`", name),
                "fields are only accessible from the codelet body",
            )),
            None => Err(self.error(format!("`{}`", name), "no such field")),
        }
    }

    // ---- Statements --------------------------------------------------------

    fn block(&mut self, stmts: &[Stmt]) -> LResult<()> {
        self.scopes.push(BTreeMap::new());
        let result = stmts.iter().try_for_each(|stmt| self.stmt(stmt));
        self.scopes.pop();
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> LResult<()> {
        match stmt {
            Stmt::Let { name, ty, value } => {
                let v = self.value(value, *ty)?;
                if let Some(ty) = ty {
                    self.check_type(value, *ty, v.ty)?;
                }
                let ptr = self.alloca(name, v.ty);
                self.emit(format!("store {} {}, ptr {}", v.ty.llvm(), v.repr, ptr));
                if let Some(scope) = self.scopes.last_mut() {
                    scope.insert(name.clone(), Local { ptr, ty: v.ty });
                }
                Ok(())
            }
            Stmt::Assign { name, value } => {
                let local = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| self.error(format!("assignment to `{}`", name), "no such local"))?;
                let v = self.value(value, Some(local.ty))?;
                self.check_type(value, local.ty, v.ty)?;
                self.emit(format!("store {} {}, ptr {}", v.ty.llvm(), v.repr, local.ptr));
                Ok(())
            }
            Stmt::Store { field, index, value } => self.store(field, index.as_ref(), value),
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let c = self.condition(cond)?;
                let then_label = self.label("if.then");
                let end_label = self.label("if.end");
                let else_label = if otherwise.is_empty() {
                    end_label.clone()
                } else {
                    self.label("if.else")
                };
                self.terminate(format!("br i1 {}, label %{}, label %{}", c.repr, then_label, else_label));

                self.start_block(then_label);
                self.block(then)?;
                self.terminate(format!("br label %{}", end_label));

                if !otherwise.is_empty() {
                    self.start_block(else_label);
                    self.block(otherwise)?;
                    self.terminate(format!("br label %{}", end_label));
                }
                self.start_block(end_label);
                Ok(())
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                let (first, last) = self.peers(start, end, None)?;
                if !first.ty.is_integer() {
                    return Err(self.error(
                        format!("for {} in {} .. {}", var, ExprText(start), ExprText(end)),
                        format!("loop counter must be an integer, not {}", first.ty),
                    ));
                }
                let ty = first.ty;
                let counter = self.alloca(var, ty);
                self.emit(format!("store {} {}, ptr {}", ty.llvm(), first.repr, counter));

                let cond_label = self.label("for.cond");
                let body_label = self.label("for.body");
                let step_label = self.label("for.step");
                let exit_label = self.label("for.end");
                self.terminate(format!("br label %{}", cond_label));

                self.start_block(cond_label.clone());
                let current = self.fresh();
                self.emit(format!("{} = load {}, ptr {}", current, ty.llvm(), counter));
                let keep_going = self.fresh();
                let cmp = if ty.is_signed() { "slt" } else { "ult" };
                self.emit(format!(
                    "{} = icmp {} {} {}, {}",
                    keep_going,
                    cmp,
                    ty.llvm(),
                    current,
                    last.repr
                ));
                self.terminate(format!("br i1 {}, label %{}, label %{}", keep_going, body_label, exit_label));

                self.start_block(body_label);
                let mut scope = BTreeMap::new();
                scope.insert(var.clone(), Local { ptr: counter.clone(), ty });
                self.scopes.push(scope);
                let lowered = self.block(body);
                self.scopes.pop();
                lowered?;
                self.terminate(format!("br label %{}", step_label));

                self.start_block(step_label);
                let current = self.fresh();
                self.emit(format!("{} = load {}, ptr {}", current, ty.llvm(), counter));
                let next = self.fresh();
                self.emit(format!("{} = add {} {}, 1", next, ty.llvm(), current));
                self.emit(format!("store {} {}, ptr {}", ty.llvm(), next, counter));
                self.terminate(format!("br label %{}", cond_label));

                self.start_block(exit_label);
                Ok(())
            }
            Stmt::While { cond, body } => {
                let cond_label = self.label("while.cond");
                let body_label = self.label("while.body");
                let exit_label = self.label("while.end");
                self.terminate(format!("br label %{}", cond_label));

                self.start_block(cond_label.clone());
                let c = self.condition(cond)?;
                self.terminate(format!("br i1 {}, label %{}, label %{}", c.repr, body_label, exit_label));

                self.start_block(body_label);
                self.block(body)?;
                self.terminate(format!("br label %{}", cond_label));

                self.start_block(exit_label);
                Ok(())
            }
            Stmt::Block(body) => self.block(body),
            Stmt::Expr(expr) => self.value_or_void(expr, None).map(|_| ()),
            Stmt::Return(value) => self.ret(value.as_ref()),
            Stmt::Macro(_) => Err(self.error("instrumentation macro", "macros must be elaborated before lowering")),
        }
    }

    fn store(&mut self, name: &str, index: Option<&Expr>, value: &Expr) -> LResult<()> {
        let construct = match index {
            Some(index) => format!("store to `{}[{}]`", name, ExprText(index)),
            None => format!("store to `{}`", name),
        };
        let (decl, base) = {
            let slot = self.field(name).map_err(|_| {
                self.error(construct.clone(), format!("`{}` is not a field of the codelet", name))
            })?;
            (slot.decl.clone(), slot.base.clone())
        };
        if !decl.direction.is_writable() {
            return Err(self.error(construct, format!("field `{}` is an input", name)));
        }

        let ptr = match (index, decl.shape) {
            (Some(index), FieldShape::Vector) => {
                let idx = self.index(index)?;
                let ptr = self.fresh();
                self.emit(format!(
                    "{} = getelementptr inbounds {}, ptr {}, i32 {}",
                    ptr,
                    decl.elem.llvm_storage(),
                    base,
                    idx
                ));
                ptr
            }
            (None, FieldShape::Scalar) => base,
            (Some(_), FieldShape::Scalar) => {
                return Err(self.error(construct, format!("scalar field `{}` cannot be indexed", name)))
            }
            (None, FieldShape::Vector) => {
                return Err(self.error(construct, format!("vector field `{}` needs an index", name)))
            }
        };

        let v = self.value(value, Some(decl.elem))?;
        self.check_type(value, decl.elem, v.ty)?;
        let stored = self.to_storage(v);
        self.emit(format!("store {} {}, ptr {}", decl.elem.llvm_storage(), stored, ptr));
        Ok(())
    }

    fn ret(&mut self, value: Option<&Expr>) -> LResult<()> {
        match (self.ret, value) {
            (ReturnKind::Compute, None) => {
                self.terminate("ret i1 true".to_string());
                Ok(())
            }
            (ReturnKind::Compute, Some(value)) => Err(self.error(
                format!("return {}", ExprText(value)),
                "the codelet body cannot return a value",
            )),
            (ReturnKind::Helper(declared), None) => match declared {
                None | Some(None) => {
                    self.ret = ReturnKind::Helper(Some(None));
                    self.terminate("ret void".to_string());
                    Ok(())
                }
                Some(Some(ty)) => Err(self.error("return", format!("helper already returns {}", ty))),
            },
            (ReturnKind::Helper(declared), Some(value)) => {
                let hint = declared.flatten();
                let v = self.value(value, hint)?;
                match declared {
                    Some(None) => {
                        return Err(self.error(
                            format!("return {}", ExprText(value)),
                            "helper already returns nothing",
                        ))
                    }
                    Some(Some(ty)) => self.check_type(value, ty, v.ty)?,
                    None => self.ret = ReturnKind::Helper(Some(Some(v.ty))),
                }
                self.terminate(format!("ret {} {}", v.ty.llvm(), v.repr));
                Ok(())
            }
        }
    }

    // ---- Expressions -------------------------------------------------------

    fn check_type(&self, expr: &Expr, expected: ElemType, found: ElemType) -> LResult<()> {
        if expected == found {
            Ok(())
        } else {
            Err(self.error(
                format!("`{}`", ExprText(expr)),
                format!("expected {}, found {}", expected, found),
            ))
        }
    }

    fn condition(&mut self, expr: &Expr) -> LResult<Value> {
        let v = self.value(expr, Some(ElemType::Bool))?;
        self.check_type(expr, ElemType::Bool, v.ty)?;
        Ok(v)
    }

    fn value(&mut self, expr: &Expr, expected: Option<ElemType>) -> LResult<Value> {
        self.value_or_void(expr, expected)?.ok_or_else(|| {
            self.error(format!("`{}`", ExprText(expr)), "produces no value")
        })
    }

    /// Lower two operands that must share a type; an untyped literal on
    /// either side adopts the type of the other.
    fn peers(&mut self, lhs: &Expr, rhs: &Expr, hint: Option<ElemType>) -> LResult<(Value, Value)> {
        let (l, r) = if is_untyped(lhs) && !is_untyped(rhs) {
            let r = self.value(rhs, hint)?;
            let l = self.value(lhs, Some(r.ty))?;
            (l, r)
        } else {
            let l = self.value(lhs, hint)?;
            let r = self.value(rhs, Some(l.ty))?;
            (l, r)
        };
        if l.ty != r.ty {
            return Err(self.error(
                format!("`{}` and `{}`", ExprText(lhs), ExprText(rhs)),
                format!("operand types differ: {} and {}", l.ty, r.ty),
            ));
        }
        Ok((l, r))
    }

    fn value_or_void(&mut self, expr: &Expr, expected: Option<ElemType>) -> LResult<Option<Value>> {
        let value = match expr {
            Expr::Const(literal) => self.literal(expr, *literal, expected)?,
            Expr::Str(_) => {
                return Err(self.error(
                    format!("`{}`", ExprText(expr)),
                    "string literals are only allowed as print arguments",
                ))
            }
            Expr::Local(name) => {
                let local = self
                    .lookup(name)
                    .cloned()
                    .ok_or_else(|| self.error(format!("`{}`", name), "no such local"))?;
                let r = self.fresh();
                self.emit(format!("{} = load {}, ptr {}", r, local.ty.llvm(), local.ptr));
                Value { repr: r, ty: local.ty }
            }
            Expr::Field(name) => {
                let (decl, base) = {
                    let slot = self.field(name)?;
                    (slot.decl.clone(), slot.base.clone())
                };
                if decl.shape != FieldShape::Scalar {
                    return Err(self.error(
                        format!("`{}`", name),
                        "vector field used as a value; index it or take len()",
                    ));
                }
                self.load_element(&base, decl.elem)
            }
            Expr::Global(name) => match self.module.spec.captures().get(name) {
                Some(Capture::Constant(value)) => Value {
                    repr: immediate(*value),
                    ty: value.elem(),
                },
                Some(Capture::ConstArray { .. }) => {
                    return Err(self.error(format!("`{}`", name), "constant table used as a value"))
                }
                _ => return Err(self.error(format!("`{}`", name), "reference to uncaptured host data")),
            },
            Expr::Index { base, index } => self.load_index(base, index)?,
            Expr::Len(name) => {
                let len = self.field(name)?.len.clone();
                match len {
                    Some(len) => Value {
                        repr: len,
                        ty: ElemType::U32,
                    },
                    None => return Err(self.error(format!("len({})", name), "scalar fields have no length")),
                }
            }
            Expr::Unary { op, operand } => self.unary(*op, operand, expected)?,
            Expr::Binary { op, lhs, rhs } => self.binary(expr, *op, lhs, rhs, expected)?,
            Expr::Cast { expr: inner, to } => {
                let hint = if is_untyped(inner) && (to.is_float() || !has_float_literal(inner)) {
                    Some(*to)
                } else {
                    None
                };
                let v = self.value(inner, hint)?;
                self.convert(v, *to)
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                let c = self.condition(cond)?;
                let (a, b) = self.peers(then, otherwise, expected)?;
                let r = self.fresh();
                self.emit(format!(
                    "{} = select i1 {}, {} {}, {} {}",
                    r,
                    c.repr,
                    a.ty.llvm(),
                    a.repr,
                    b.ty.llvm(),
                    b.repr
                ));
                Value { repr: r, ty: a.ty }
            }
            Expr::Call(call) => return self.call(expr, call),
            Expr::Alloc { .. } => {
                return Err(self.error(format!("`{}`", ExprText(expr)), "heap allocation on a tile"))
            }
        };
        Ok(Some(value))
    }

    fn literal(&self, expr: &Expr, literal: Literal, expected: Option<ElemType>) -> LResult<Value> {
        let scalar = match literal {
            Literal::Typed(value) => value,
            Literal::Int(v) => {
                let ty = match expected {
                    Some(t) if t.is_numeric() => t,
                    _ => ElemType::I32,
                };
                if !ty.can_hold(v) {
                    return Err(self.error(format!("`{}`", ExprText(expr)), format!("literal does not fit {}", ty)));
                }
                Scalar::from_i128(ty, v)
            }
            Literal::Float(v) => match expected {
                None | Some(ElemType::F32) => Scalar::F32(v as f32),
                Some(other) => {
                    return Err(self.error(
                        format!("`{}`", ExprText(expr)),
                        format!("float literal used as {}", other),
                    ))
                }
            },
        };
        Ok(Value {
            repr: immediate(scalar),
            ty: scalar.elem(),
        })
    }

    fn load_element(&mut self, ptr: &str, elem: ElemType) -> Value {
        let r = self.fresh();
        self.emit(format!("{} = load {}, ptr {}", r, elem.llvm_storage(), ptr));
        if elem == ElemType::Bool {
            let b = self.fresh();
            self.emit(format!("{} = icmp ne i8 {}, 0", b, r));
            return Value { repr: b, ty: elem };
        }
        Value { repr: r, ty: elem }
    }

    fn to_storage(&mut self, v: Value) -> String {
        if v.ty != ElemType::Bool {
            return v.repr;
        }
        let r = self.fresh();
        self.emit(format!("{} = zext i1 {} to i8", r, v.repr));
        r
    }

    /// Lower an index expression to an `i32` offset.
    fn index(&mut self, index: &Expr) -> LResult<String> {
        let v = self.value(index, None)?;
        if !v.ty.is_integer() {
            return Err(self.error(
                format!("`{}`", ExprText(index)),
                format!("index must be an integer, not {}", v.ty),
            ));
        }
        Ok(self.convert(v, ElemType::I32).repr)
    }

    fn load_index(&mut self, base: &ArrayRef, index: &Expr) -> LResult<Value> {
        match base {
            ArrayRef::Field(name) => {
                let (decl, base_ptr) = {
                    let slot = self.field(name)?;
                    (slot.decl.clone(), slot.base.clone())
                };
                if decl.shape != FieldShape::Vector {
                    return Err(self.error(format!("`{}[..]`", name), "scalar field cannot be indexed"));
                }
                let idx = self.index(index)?;
                let ptr = self.fresh();
                self.emit(format!(
                    "{} = getelementptr inbounds {}, ptr {}, i32 {}",
                    ptr,
                    decl.elem.llvm_storage(),
                    base_ptr,
                    idx
                ));
                Ok(self.load_element(&ptr, decl.elem))
            }
            ArrayRef::Global(name) => {
                let (symbol, elem, len) = self.module.table(name)?;
                let idx = self.index(index)?;
                let ptr = self.fresh();
                self.emit(format!(
                    "{} = getelementptr inbounds [{} x {}], ptr {}, i32 0, i32 {}",
                    ptr,
                    len,
                    elem.llvm_storage(),
                    symbol,
                    idx
                ));
                Ok(self.load_element(&ptr, elem))
            }
        }
    }

    fn unary(&mut self, op: UnaryOp, operand: &Expr, expected: Option<ElemType>) -> LResult<Value> {
        let v = self.value(operand, expected)?;
        let r = self.fresh();
        let line = match (op, v.ty) {
            (UnaryOp::Neg, ElemType::F32) => format!("{} = fneg float {}", r, v.repr),
            (UnaryOp::Neg, ty) if ty.is_integer() => format!("{} = sub {} 0, {}", r, ty.llvm(), v.repr),
            (UnaryOp::Not, ElemType::Bool) => format!("{} = xor i1 {}, true", r, v.repr),
            (UnaryOp::Not, ty) if ty.is_integer() => format!("{} = xor {} {}, -1", r, ty.llvm(), v.repr),
            (op, ty) => {
                return Err(self.error(
                    format!("`{}`", ExprText(operand)),
                    format!("operator {:?} does not apply to {}", op, ty),
                ))
            }
        };
        self.emit(line);
        Ok(Value { repr: r, ty: v.ty })
    }

    fn binary(
        &mut self,
        whole: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        expected: Option<ElemType>,
    ) -> LResult<Value> {
        if op.is_logical() {
            return self.logical(op, lhs, rhs);
        }

        let hint = if op.is_comparison() { None } else { expected };
        let (l, r) = self.peers(lhs, rhs, hint)?;
        let ty = l.ty;
        let llvm = ty.llvm();

        let unsupported = || {
            self.error(
                format!("`{}`", ExprText(whole)),
                format!("operator `{}` does not apply to {}", op.symbol(), ty),
            )
        };

        let (opcode, result_ty) = if op.is_comparison() {
            let predicate = if ty.is_float() {
                match op {
                    BinaryOp::Eq => "fcmp oeq",
                    BinaryOp::Ne => "fcmp une",
                    BinaryOp::Lt => "fcmp olt",
                    BinaryOp::Le => "fcmp ole",
                    BinaryOp::Gt => "fcmp ogt",
                    _ => "fcmp oge",
                }
            } else {
                let signed = ty.is_signed();
                match op {
                    BinaryOp::Eq => "icmp eq",
                    BinaryOp::Ne => "icmp ne",
                    BinaryOp::Lt if signed => "icmp slt",
                    BinaryOp::Lt => "icmp ult",
                    BinaryOp::Le if signed => "icmp sle",
                    BinaryOp::Le => "icmp ule",
                    BinaryOp::Gt if signed => "icmp sgt",
                    BinaryOp::Gt => "icmp ugt",
                    _ if signed => "icmp sge",
                    _ => "icmp uge",
                }
            };
            if ty == ElemType::Bool && !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                return Err(unsupported());
            }
            (predicate, ElemType::Bool)
        } else if ty.is_float() {
            let opcode = match op {
                BinaryOp::Add => "fadd",
                BinaryOp::Sub => "fsub",
                BinaryOp::Mul => "fmul",
                BinaryOp::Div => "fdiv",
                BinaryOp::Rem => "frem",
                _ => return Err(unsupported()),
            };
            (opcode, ty)
        } else if ty == ElemType::Bool {
            let opcode = match op {
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
                _ => return Err(unsupported()),
            };
            (opcode, ty)
        } else {
            let signed = ty.is_signed();
            let opcode = match op {
                BinaryOp::Add => "add",
                BinaryOp::Sub => "sub",
                BinaryOp::Mul => "mul",
                BinaryOp::Div if signed => "sdiv",
                BinaryOp::Div => "udiv",
                BinaryOp::Rem if signed => "srem",
                BinaryOp::Rem => "urem",
                BinaryOp::And => "and",
                BinaryOp::Or => "or",
                BinaryOp::Xor => "xor",
                BinaryOp::Shl => "shl",
                BinaryOp::Shr if signed => "ashr",
                BinaryOp::Shr => "lshr",
                _ => return Err(unsupported()),
            };
            (opcode, ty)
        };

        let result = self.fresh();
        self.emit(format!("{} = {} {} {}, {}", result, opcode, llvm, l.repr, r.repr));
        Ok(Value {
            repr: result,
            ty: result_ty,
        })
    }

    /// Short-circuit `&&` and `||`.
    fn logical(&mut self, op: BinaryOp, lhs: &Expr, rhs: &Expr) -> LResult<Value> {
        let l = self.condition(lhs)?;
        let lhs_block = self.current_block.clone();
        let rhs_label = self.label("logic.rhs");
        let end_label = self.label("logic.end");
        let (short_value, branch) = match op {
            BinaryOp::LogicalAnd => (
                "false",
                format!("br i1 {}, label %{}, label %{}", l.repr, rhs_label, end_label),
            ),
            _ => (
                "true",
                format!("br i1 {}, label %{}, label %{}", l.repr, end_label, rhs_label),
            ),
        };
        self.terminate(branch);

        self.start_block(rhs_label);
        let r = self.condition(rhs)?;
        let rhs_block = self.current_block.clone();
        self.terminate(format!("br label %{}", end_label));

        self.start_block(end_label);
        let result = self.fresh();
        self.emit(format!(
            "{} = phi i1 [ {}, %{} ], [ {}, %{} ]",
            result, short_value, lhs_block, r.repr, rhs_block
        ));
        Ok(Value {
            repr: result,
            ty: ElemType::Bool,
        })
    }

    /// Convert like an `as` cast.
    fn convert(&mut self, v: Value, to: ElemType) -> Value {
        let from = v.ty;
        if from == to {
            return v;
        }
        if from.is_integer() && to.is_integer() && from.bits() == to.bits() {
            return Value { repr: v.repr, ty: to };
        }

        let r = self.fresh();
        let line = match (from, to) {
            (ElemType::Bool, ElemType::F32) => format!("{} = uitofp i1 {} to float", r, v.repr),
            (ElemType::Bool, t) => format!("{} = zext i1 {} to {}", r, v.repr, t.llvm()),
            (ElemType::F32, ElemType::Bool) => format!("{} = fcmp une float {}, 0.0", r, v.repr),
            (f, ElemType::Bool) => format!("{} = icmp ne {} {}, 0", r, f.llvm(), v.repr),
            (ElemType::F32, t) => {
                let op = if t.is_signed() { "fptosi" } else { "fptoui" };
                format!("{} = {} float {} to {}", r, op, v.repr, t.llvm())
            }
            (f, ElemType::F32) => {
                let op = if f.is_signed() { "sitofp" } else { "uitofp" };
                format!("{} = {} {} {} to float", r, op, f.llvm(), v.repr)
            }
            (f, t) if f.bits() > t.bits() => format!("{} = trunc {} {} to {}", r, f.llvm(), v.repr, t.llvm()),
            (f, t) => {
                let op = if f.is_signed() { "sext" } else { "zext" };
                format!("{} = {} {} {} to {}", r, op, f.llvm(), v.repr, t.llvm())
            }
        };
        self.emit(line);
        Value { repr: r, ty: to }
    }

    fn call(&mut self, expr: &Expr, call: &Call) -> LResult<Option<Value>> {
        match &call.callee {
            Callee::Intrinsic(intrinsic) => {
                let hint = match intrinsic {
                    Intrinsic::Math(_) => Some(ElemType::F32),
                    _ => None,
                };
                let mut args = Vec::with_capacity(call.args.len());
                for arg in &call.args {
                    match arg {
                        Expr::Str(text) if intrinsic.is_print() => args.push(LoweredArg::Text(text.clone())),
                        other => {
                            let v = self.value(other, hint)?;
                            args.push(LoweredArg::Value(v.repr, v.ty));
                        }
                    }
                }
                let lowered = intrinsics::lower(self, *intrinsic, &args);
                lowered
                    .map(|value| value.map(|(repr, ty)| Value { repr, ty }))
                    .map_err(|reason| self.error(format!("call to {}", intrinsic), reason))
            }
            Callee::Static(name) => {
                let spec: &'s KernelSpec = self.module.spec;
                let helper = spec
                    .helper(name)
                    .ok_or_else(|| self.error(format!("call to `{}`", name), "no such helper"))?;
                if helper.params.len() != call.args.len() {
                    return Err(self.error(
                        format!("`{}`", ExprText(expr)),
                        format!("`{}` takes {} argument(s), got {}", name, helper.params.len(), call.args.len()),
                    ));
                }

                let mut values = Vec::with_capacity(call.args.len());
                for (param, arg) in helper.params.iter().zip(&call.args) {
                    let v = self.value(arg, param.ty)?;
                    if let Some(ty) = param.ty {
                        self.check_type(arg, ty, v.ty)?;
                    }
                    values.push(v);
                }

                let types = values.iter().map(|v| v.ty).collect();
                let specialization = self.module.specialize(name, types)?;
                let args: Vec<String> = values.iter().map(|v| format!("{} {}", v.ty.llvm(), v.repr)).collect();
                match specialization.ret {
                    None => {
                        self.emit(format!("call void @{}({})", specialization.symbol, args.join(", ")));
                        Ok(None)
                    }
                    Some(ty) => {
                        let r = self.fresh();
                        self.emit(format!(
                            "{} = call {} @{}({})",
                            r,
                            ty.llvm(),
                            specialization.symbol,
                            args.join(", ")
                        ));
                        Ok(Some(Value { repr: r, ty }))
                    }
                }
            }
            _ => Err(self.error(
                format!("`{}`", ExprText(expr)),
                "call cannot be compiled for a tile",
            )),
        }
    }
}

impl InstructionSink for FunctionBuilder<'_, '_, '_> {
    fn fresh(&mut self) -> String {
        self.next_reg += 1;
        format!("%t{}", self.next_reg)
    }

    fn emit(&mut self, instruction: String) {
        if self.terminated {
            // Code after a terminator gets its own unreachable block.
            let dead = self.label("dead");
            self.start_block(dead);
        }
        log::trace!("{}: {}", self.symbol, instruction);
        self.lines.push(format!("  {}", instruction));
        self.instructions += 1;
        self.module.session.record_instruction();
    }

    fn declare(&mut self, declaration: &str) {
        self.module.declare(declaration);
    }

    fn string_constant(&mut self, text: &str) -> String {
        self.module.string_constant(text)
    }

    fn note_intrinsic(&mut self, intrinsic: Intrinsic) {
        self.module.session.record_intrinsic(intrinsic.name());
    }
}

/// Whether `expr` has no type of its own and adopts the one it is used at.
pub(crate) fn is_untyped(expr: &Expr) -> bool {
    match expr {
        Expr::Const(Literal::Int(_) | Literal::Float(_)) => true,
        Expr::Unary {
            op: UnaryOp::Neg,
            operand,
        } => is_untyped(operand),
        Expr::Binary { op, lhs, rhs } if !op.is_comparison() && !op.is_logical() => {
            is_untyped(lhs) && is_untyped(rhs)
        }
        _ => false,
    }
}

fn has_float_literal(expr: &Expr) -> bool {
    let mut found = false;
    crate::kernel::visit::visit_expr(expr, &mut |e| {
        found |= matches!(e, Expr::Const(Literal::Float(_)));
    });
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mangles_compute() {
        assert_eq!(compute_symbol("Scale"), "_ZN5Scale7computeEv");
        assert_eq!(compute_symbol("AxpyKernel"), "_ZN10AxpyKernel7computeEv");
    }

    #[test]
    fn immediates() {
        assert_eq!(immediate(Scalar::U32(u32::MAX)), "-1");
        assert_eq!(immediate(Scalar::F32(1.0)), "0x3FF0000000000000");
        assert_eq!(immediate(Scalar::F32(0.1)), float_immediate(0.1));
        assert_eq!(immediate(Scalar::Bool(true)), "true");
    }

    #[test]
    fn escapes_string_constants() {
        assert_eq!(escape_bytes("a\"b\n"), "a\\22b\\0A\\00");
    }
}
