// This module is the host emulator. It executes a verified codelet directly on host data the
// way an IPUModel tile would: instrumentation is elaborated exactly as for code generation,
// field data is handed in as vectors of typed scalars, untyped literals adopt the type of
// their peer operand, integer arithmetic wraps at the width of its type and random numbers
// come from the host model of the tile generator. The tile cycle counter is modelled as one
// cycle per executed statement, so `@cycles` blocks report deterministic counts. Printed
// output is collected in a buffer with the formatting printf applies on the device.

//! Host execution of codelets.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::codegen::lower::is_untyped;
use crate::codelet::Codelet;
use crate::core::error::ExecutionError;
use crate::intrinsics::sim::DeviceRng;
use crate::intrinsics::{self, Intrinsic};
use crate::kernel::{
    ArrayRef, BinaryOp, Callee, Capture, Direction, ElemType, Expr, FieldShape, KernelSpec, Literal, Scalar,
    Stmt, UnaryOp,
};

type EResult<T> = Result<T, ExecutionError>;

/// Field data keyed by field name.
pub type FieldData = BTreeMap<String, Vec<Scalar>>;

/// `f32` values as field data.
pub fn f32_data(values: &[f32]) -> Vec<Scalar> {
    values.iter().map(|&v| Scalar::F32(v)).collect()
}

/// `u32` values as field data.
pub fn u32_data(values: &[u32]) -> Vec<Scalar> {
    values.iter().map(|&v| Scalar::U32(v)).collect()
}

/// Read back `f32` field data; `None` if any element has another type.
pub fn as_f32(values: &[Scalar]) -> Option<Vec<f32>> {
    values
        .iter()
        .map(|v| match v {
            Scalar::F32(x) => Some(*x),
            _ => None,
        })
        .collect()
}

const DEFAULT_STEP_LIMIT: u64 = 100_000_000;

pub struct Emulator {
    tile: u32,
    rng: DeviceRng,
    print: bool,
    cycles: u32,
    steps: u64,
    step_limit: u64,
    output: String,
}

impl Emulator {
    /// Emulate `tile`; the generator is seeded with the tile id.
    pub fn new(tile: u32) -> Self {
        Self {
            tile,
            rng: DeviceRng::new(tile as u64),
            print: true,
            cycles: 0,
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
            output: String::new(),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = DeviceRng::new(seed);
        self
    }

    pub fn print(mut self, print: bool) -> Self {
        self.print = print;
        self
    }

    pub fn step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Text printed so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Current value of the modelled cycle counter.
    pub fn cycles(&self) -> u32 {
        self.cycles
    }

    /// Run `codelet` once over `data`. Writable fields are updated in place.
    pub fn run(&mut self, codelet: &Codelet, data: &mut FieldData) -> EResult<()> {
        let spec = intrinsics::elaborate(codelet.spec(), self.print);
        check_data(&spec, data)?;
        log::debug!("emulating `{}` on tile {}", spec.name(), self.tile);

        let mut frame = Frame {
            spec: &spec,
            data: Some(data),
            scopes: vec![BTreeMap::new()],
            depth: 0,
        };
        self.block(&mut frame, spec.body())?;
        Ok(())
    }

    fn tick(&mut self) -> EResult<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(ExecutionError::StepLimit(self.step_limit));
        }
        self.cycles = self.cycles.wrapping_add(1);
        Ok(())
    }

    fn block(&mut self, frame: &mut Frame<'_, '_>, stmts: &[Stmt]) -> EResult<Flow> {
        frame.scopes.push(BTreeMap::new());
        let mut flow = Ok(Flow::Next);
        for stmt in stmts {
            flow = self.stmt(frame, stmt);
            if !matches!(flow, Ok(Flow::Next)) {
                break;
            }
        }
        frame.scopes.pop();
        flow
    }

    fn stmt(&mut self, frame: &mut Frame<'_, '_>, stmt: &Stmt) -> EResult<Flow> {
        self.tick()?;
        match stmt {
            Stmt::Let { name, ty, value } => {
                let v = self.eval(frame, value, *ty)?;
                if let Some(ty) = ty {
                    expect_type(value, *ty, v)?;
                }
                if let Some(scope) = frame.scopes.last_mut() {
                    scope.insert(name.clone(), v);
                }
            }
            Stmt::Assign { name, value } => {
                let current = frame.local(name)?;
                let v = self.eval(frame, value, Some(current.elem()))?;
                expect_type(value, current.elem(), v)?;
                frame.set_local(name, v)?;
            }
            Stmt::Store { field, index, value } => {
                let index = match index {
                    Some(index) => Some(self.eval_index(frame, index)?),
                    None => None,
                };
                let elem = frame.field_elem(field)?;
                let v = self.eval(frame, value, Some(elem))?;
                expect_type(value, elem, v)?;
                frame.store(field, index, v)?;
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let taken = if self.condition(frame, cond)? { then } else { otherwise };
                return self.block(frame, taken);
            }
            Stmt::For {
                var,
                start,
                end,
                body,
            } => {
                let (first, last) = self.peers(frame, start, end, None)?;
                if !first.elem().is_integer() {
                    return Err(unsupported(start, "loop counter must be an integer"));
                }
                let mut i = first.as_i128();
                let last = last.as_i128();
                while i < last {
                    frame.scopes.push(BTreeMap::from([(var.clone(), Scalar::from_i128(first.elem(), i))]));
                    let flow = self.block(frame, body);
                    // The body may have assigned the counter.
                    let counter = frame.scopes.pop().and_then(|scope| scope.get(var.as_str()).copied());
                    if let Flow::Return(v) = flow? {
                        return Ok(Flow::Return(v));
                    }
                    i = counter.map_or(i, Scalar::as_i128) + 1;
                    self.tick()?;
                }
            }
            Stmt::While { cond, body } => {
                while self.condition(frame, cond)? {
                    if let Flow::Return(v) = self.block(frame, body)? {
                        return Ok(Flow::Return(v));
                    }
                    self.tick()?;
                }
            }
            Stmt::Block(body) => return self.block(frame, body),
            Stmt::Expr(expr) => {
                self.eval_or_void(frame, expr, None)?;
            }
            Stmt::Return(value) => {
                let v = match value {
                    Some(value) => Some(self.eval(frame, value, None)?),
                    None => None,
                };
                return Ok(Flow::Return(v));
            }
            Stmt::Macro(_) => {
                return Err(ExecutionError::Unsupported {
                    construct: "instrumentation macro".into(),
                    reason: "macros must be elaborated before execution".into(),
                })
            }
        }
        Ok(Flow::Next)
    }

    fn condition(&mut self, frame: &mut Frame<'_, '_>, expr: &Expr) -> EResult<bool> {
        match self.eval(frame, expr, Some(ElemType::Bool))? {
            Scalar::Bool(b) => Ok(b),
            other => Err(type_error(expr, ElemType::Bool, other.elem())),
        }
    }

    fn eval_index(&mut self, frame: &mut Frame<'_, '_>, expr: &Expr) -> EResult<i128> {
        let v = self.eval(frame, expr, None)?;
        if !v.elem().is_integer() {
            return Err(unsupported(expr, "index must be an integer"));
        }
        Ok(v.as_i128())
    }

    fn eval(&mut self, frame: &mut Frame<'_, '_>, expr: &Expr, expected: Option<ElemType>) -> EResult<Scalar> {
        self.eval_or_void(frame, expr, expected)?
            .ok_or_else(|| unsupported(expr, "produces no value"))
    }

    fn peers(
        &mut self,
        frame: &mut Frame<'_, '_>,
        lhs: &Expr,
        rhs: &Expr,
        hint: Option<ElemType>,
    ) -> EResult<(Scalar, Scalar)> {
        let (l, r) = if is_untyped(lhs) && !is_untyped(rhs) {
            let r = self.eval(frame, rhs, hint)?;
            (self.eval(frame, lhs, Some(r.elem()))?, r)
        } else {
            let l = self.eval(frame, lhs, hint)?;
            let r = self.eval(frame, rhs, Some(l.elem()))?;
            (l, r)
        };
        if l.elem() != r.elem() {
            return Err(type_error(rhs, l.elem(), r.elem()));
        }
        Ok((l, r))
    }

    fn eval_or_void(
        &mut self,
        frame: &mut Frame<'_, '_>,
        expr: &Expr,
        expected: Option<ElemType>,
    ) -> EResult<Option<Scalar>> {
        let value = match expr {
            Expr::Const(literal) => literal_value(expr, *literal, expected)?,
            Expr::Str(_) => return Err(unsupported(expr, "string literals are only allowed as print arguments")),
            Expr::Local(name) => frame.local(name)?,
            Expr::Field(name) => {
                if frame.spec.field(name).is_some_and(|f| f.shape == FieldShape::Vector) {
                    return Err(unsupported(expr, "vector field used as a value"));
                }
                frame.load(name, None)?
            }
            Expr::Global(name) => match frame.spec.captures().get(name) {
                Some(Capture::Constant(value)) => *value,
                _ => return Err(unsupported(expr, "not a captured constant")),
            },
            Expr::Index { base, index } => {
                let i = self.eval_index(frame, index)?;
                match base {
                    ArrayRef::Field(name) => frame.load(name, Some(i))?,
                    ArrayRef::Global(name) => match frame.spec.captures().get(name) {
                        Some(Capture::ConstArray { values, .. }) => element(name, values, i)?,
                        _ => return Err(unsupported(expr, "not a captured constant table")),
                    },
                }
            }
            Expr::Len(name) => Scalar::U32(frame.field_len(name)? as u32),
            Expr::Unary { op, operand } => {
                let v = self.eval(frame, operand, expected)?;
                match (op, v) {
                    (UnaryOp::Neg, Scalar::F32(x)) => Scalar::F32(-x),
                    (UnaryOp::Neg, v) if v.elem().is_integer() => Scalar::from_i128(v.elem(), v.as_i128().wrapping_neg()),
                    (UnaryOp::Not, Scalar::Bool(b)) => Scalar::Bool(!b),
                    (UnaryOp::Not, v) if v.elem().is_integer() => Scalar::from_i128(v.elem(), !v.as_i128()),
                    _ => return Err(unsupported(expr, format!("operator does not apply to {}", v.elem()))),
                }
            }
            Expr::Binary { op, lhs, rhs } => self.binary(frame, expr, *op, lhs, rhs, expected)?,
            Expr::Cast { expr: inner, to } => {
                let hint = if is_untyped(inner) && (to.is_float() || !matches!(**inner, Expr::Const(Literal::Float(_)))) {
                    Some(*to)
                } else {
                    None
                };
                self.eval(frame, inner, hint)?.cast(*to)
            }
            Expr::Select {
                cond,
                then,
                otherwise,
            } => {
                let c = self.condition(frame, cond)?;
                let (a, b) = self.peers(frame, then, otherwise, expected)?;
                if c {
                    a
                } else {
                    b
                }
            }
            Expr::Call(call) => match &call.callee {
                Callee::Intrinsic(intrinsic) => return self.intrinsic(frame, expr, *intrinsic, &call.args),
                Callee::Static(name) => return self.call_helper(frame, expr, name, &call.args),
                _ => return Err(unsupported(expr, "call cannot run on a tile")),
            },
            Expr::Alloc { .. } => return Err(unsupported(expr, "heap allocation on a tile")),
        };
        Ok(Some(value))
    }

    fn binary(
        &mut self,
        frame: &mut Frame<'_, '_>,
        whole: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        expected: Option<ElemType>,
    ) -> EResult<Scalar> {
        match op {
            BinaryOp::LogicalAnd => {
                return Ok(Scalar::Bool(self.condition(frame, lhs)? && self.condition(frame, rhs)?))
            }
            BinaryOp::LogicalOr => {
                return Ok(Scalar::Bool(self.condition(frame, lhs)? || self.condition(frame, rhs)?))
            }
            _ => {}
        }

        let hint = if op.is_comparison() { None } else { expected };
        let (l, r) = self.peers(frame, lhs, rhs, hint)?;
        let elem = l.elem();

        if op.is_comparison() {
            if elem == ElemType::Bool && !matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
                return Err(unsupported(whole, "bool values are not ordered"));
            }
            let ordering = match (l, r) {
                (Scalar::F32(a), Scalar::F32(b)) => a.partial_cmp(&b),
                (a, b) => Some(a.as_i128().cmp(&b.as_i128())),
            };
            let result = match ordering {
                // Unordered: only `!=` holds.
                None => op == BinaryOp::Ne,
                Some(o) => match op {
                    BinaryOp::Eq => o.is_eq(),
                    BinaryOp::Ne => o.is_ne(),
                    BinaryOp::Lt => o.is_lt(),
                    BinaryOp::Le => o.is_le(),
                    BinaryOp::Gt => o.is_gt(),
                    _ => o.is_ge(),
                },
            };
            return Ok(Scalar::Bool(result));
        }

        if let (Scalar::F32(a), Scalar::F32(b)) = (l, r) {
            let v = match op {
                BinaryOp::Add => a + b,
                BinaryOp::Sub => a - b,
                BinaryOp::Mul => a * b,
                BinaryOp::Div => a / b,
                BinaryOp::Rem => a % b,
                _ => return Err(unsupported(whole, format!("operator `{}` does not apply to f32", op.symbol()))),
            };
            return Ok(Scalar::F32(v));
        }

        if let (Scalar::Bool(a), Scalar::Bool(b)) = (l, r) {
            let v = match op {
                BinaryOp::And => a & b,
                BinaryOp::Or => a | b,
                BinaryOp::Xor => a ^ b,
                _ => return Err(unsupported(whole, format!("operator `{}` does not apply to bool", op.symbol()))),
            };
            return Ok(Scalar::Bool(v));
        }

        // Integers: exact in i128, then wrapped to the operand width.
        let (a, b) = (l.as_i128(), r.as_i128());
        let v = match op {
            BinaryOp::Add => a.wrapping_add(b),
            BinaryOp::Sub => a.wrapping_sub(b),
            BinaryOp::Mul => a.wrapping_mul(b),
            BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                return Err(ExecutionError::Arithmetic(format!("division by zero in `{}`", whole_text(whole))))
            }
            BinaryOp::Div => a / b,
            BinaryOp::Rem => a % b,
            BinaryOp::And => a & b,
            BinaryOp::Or => a | b,
            BinaryOp::Xor => a ^ b,
            BinaryOp::Shl | BinaryOp::Shr if b < 0 || b >= elem.bits() as i128 => {
                return Err(ExecutionError::Arithmetic(format!(
                    "shift by {} out of range for {} in `{}`",
                    b,
                    elem,
                    whole_text(whole)
                )))
            }
            BinaryOp::Shl => a << b,
            BinaryOp::Shr => a >> b,
            _ => return Err(unsupported(whole, format!("operator `{}` does not apply to {}", op.symbol(), elem))),
        };
        Ok(Scalar::from_i128(elem, v))
    }

    fn intrinsic(
        &mut self,
        frame: &mut Frame<'_, '_>,
        expr: &Expr,
        intrinsic: Intrinsic,
        args: &[Expr],
    ) -> EResult<Option<Scalar>> {
        let value = match intrinsic {
            Intrinsic::RandF32 => Scalar::F32(self.rng.next_f32()),
            Intrinsic::RandU32 => Scalar::U32(self.rng.next_u32()),
            Intrinsic::RandU64 => Scalar::U64(self.rng.next_u64()),
            Intrinsic::CycleCount => Scalar::U32(self.cycles),
            Intrinsic::TileId => Scalar::U32(self.tile),
            Intrinsic::Math(f) => {
                let [arg] = args else {
                    return Err(unsupported(expr, format!("{} takes one argument", f.name())));
                };
                match self.eval(frame, arg, Some(ElemType::F32))? {
                    Scalar::F32(x) => Scalar::F32(f.apply(x)),
                    other => return Err(type_error(arg, ElemType::F32, other.elem())),
                }
            }
            Intrinsic::Print { newline } => {
                let mut text = String::new();
                for arg in args {
                    match arg {
                        Expr::Str(s) => text.push_str(s),
                        other => {
                            let v = self.eval(frame, other, None)?;
                            format_value(&mut text, v);
                        }
                    }
                }
                if newline {
                    text.push('\n');
                }
                self.output.push_str(&text);
                return Ok(None);
            }
        };
        Ok(Some(value))
    }

    fn call_helper(
        &mut self,
        frame: &mut Frame<'_, '_>,
        expr: &Expr,
        name: &str,
        args: &[Expr],
    ) -> EResult<Option<Scalar>> {
        let spec = frame.spec;
        let helper = spec
            .helper(name)
            .ok_or_else(|| unsupported(expr, format!("no helper named `{}`", name)))?;
        if helper.params.len() != args.len() {
            return Err(unsupported(
                expr,
                format!("`{}` takes {} argument(s), got {}", name, helper.params.len(), args.len()),
            ));
        }
        if frame.depth >= MAX_CALL_DEPTH {
            return Err(unsupported(expr, "helper recursion"));
        }

        let mut scope = BTreeMap::new();
        for (param, arg) in helper.params.iter().zip(args) {
            let v = self.eval(frame, arg, param.ty)?;
            if let Some(ty) = param.ty {
                expect_type(arg, ty, v)?;
            }
            scope.insert(param.name.clone(), v);
        }

        let mut callee = Frame {
            spec,
            data: None,
            scopes: vec![scope],
            depth: frame.depth + 1,
        };
        match self.block(&mut callee, &helper.body)? {
            Flow::Return(v) => Ok(v),
            Flow::Next => Ok(None),
        }
    }
}

const MAX_CALL_DEPTH: u32 = 64;

enum Flow {
    Next,
    Return(Option<Scalar>),
}

struct Frame<'s, 'd> {
    spec: &'s KernelSpec,
    /// Field data; `None` inside helpers.
    data: Option<&'d mut FieldData>,
    scopes: Vec<BTreeMap<String, Scalar>>,
    depth: u32,
}

impl Frame<'_, '_> {
    fn local(&self, name: &str) -> EResult<Scalar> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name).copied())
            .ok_or_else(|| ExecutionError::Unsupported {
                construct: format!("`{}`", name),
                reason: "no such local".into(),
            })
    }

    fn set_local(&mut self, name: &str, value: Scalar) -> EResult<()> {
        match self.scopes.iter_mut().rev().find_map(|scope| scope.get_mut(name)) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ExecutionError::Unsupported {
                construct: format!("assignment to `{}`", name),
                reason: "no such local".into(),
            }),
        }
    }

    fn field_values(&self, name: &str) -> EResult<&Vec<Scalar>> {
        self.data
            .as_deref()
            .and_then(|data| data.get(name))
            .ok_or_else(|| ExecutionError::MissingField { field: name.to_string() })
    }

    fn field_elem(&self, name: &str) -> EResult<ElemType> {
        self.spec
            .field(name)
            .map(|f| f.elem)
            .ok_or_else(|| ExecutionError::MissingField { field: name.to_string() })
    }

    fn field_len(&self, name: &str) -> EResult<usize> {
        self.field_values(name).map(Vec::len)
    }

    fn load(&self, name: &str, index: Option<i128>) -> EResult<Scalar> {
        let values = self.field_values(name)?;
        element(name, values, index.unwrap_or(0))
    }

    fn store(&mut self, name: &str, index: Option<i128>, value: Scalar) -> EResult<()> {
        let writable = self.spec.field(name).is_some_and(|f| f.direction.is_writable());
        if !writable {
            return Err(ExecutionError::Unsupported {
                construct: format!("store to `{}`", name),
                reason: "not a writable field".into(),
            });
        }
        let values = self
            .data
            .as_deref_mut()
            .and_then(|data| data.get_mut(name))
            .ok_or_else(|| ExecutionError::MissingField { field: name.to_string() })?;
        let index = index.unwrap_or(0);
        let len = values.len();
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| values.get_mut(i))
            .ok_or_else(|| ExecutionError::OutOfBounds {
                name: name.to_string(),
                index,
                len,
            })?;
        *slot = value;
        Ok(())
    }
}

fn check_data(spec: &KernelSpec, data: &FieldData) -> EResult<()> {
    for field in spec.fields() {
        let values = data
            .get(&field.name)
            .ok_or_else(|| ExecutionError::MissingField {
                field: field.name.clone(),
            })?;
        if let Some(bad) = values.iter().find(|v| v.elem() != field.elem) {
            return Err(ExecutionError::FieldType {
                field: field.name.clone(),
                expected: field.elem,
                found: bad.elem(),
            });
        }
        if field.shape == FieldShape::Scalar && values.len() != 1 {
            return Err(ExecutionError::FieldShape {
                field: field.name.clone(),
                len: values.len(),
            });
        }
        if field.direction == Direction::Output {
            log::trace!("output field `{}` starts with {} element(s)", field.name, values.len());
        }
    }
    Ok(())
}

fn element(name: &str, values: &[Scalar], index: i128) -> EResult<Scalar> {
    usize::try_from(index)
        .ok()
        .and_then(|i| values.get(i).copied())
        .ok_or_else(|| ExecutionError::OutOfBounds {
            name: name.to_string(),
            index,
            len: values.len(),
        })
}

fn literal_value(expr: &Expr, literal: Literal, expected: Option<ElemType>) -> EResult<Scalar> {
    match literal {
        Literal::Typed(value) => Ok(value),
        Literal::Int(v) => {
            let ty = match expected {
                Some(t) if t.is_numeric() => t,
                _ => ElemType::I32,
            };
            if !ty.can_hold(v) {
                return Err(unsupported(expr, format!("literal does not fit {}", ty)));
            }
            Ok(Scalar::from_i128(ty, v))
        }
        Literal::Float(v) => match expected {
            None | Some(ElemType::F32) => Ok(Scalar::F32(v as f32)),
            Some(other) => Err(type_error(expr, other, ElemType::F32)),
        },
    }
}

/// Append `value` the way the device printf renders it.
fn format_value(out: &mut String, value: Scalar) {
    let _ = match value {
        Scalar::Bool(b) => write!(out, "{}", b as i32),
        Scalar::F32(x) => write!(out, "{:.6}", x as f64),
        Scalar::I32(v) => write!(out, "{}", v),
        Scalar::U32(v) => write!(out, "{}", v),
        Scalar::I64(v) => write!(out, "{}", v),
        Scalar::U64(v) => write!(out, "{}", v),
    };
}

fn whole_text(expr: &Expr) -> String {
    crate::kernel::display::ExprText(expr).to_string()
}

fn expect_type(expr: &Expr, expected: ElemType, found: Scalar) -> EResult<()> {
    if found.elem() == expected {
        Ok(())
    } else {
        Err(type_error(expr, expected, found.elem()))
    }
}

fn type_error(expr: &Expr, expected: ElemType, found: ElemType) -> ExecutionError {
    unsupported(expr, format!("expected {}, found {}", expected, found))
}

fn unsupported(expr: &Expr, reason: impl Into<String>) -> ExecutionError {
    ExecutionError::Unsupported {
        construct: format!("`{}`", whole_text(expr)),
        reason: reason.into(),
    }
}
