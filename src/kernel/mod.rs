//! Kernel intermediate representation.
//!
//! A [`KernelSpec`] describes one codelet: its typed, directioned fields, the
//! host constants it captures, the helper functions it may call and a body
//! built from a closed set of statement and expression kinds. The set is
//! closed on purpose so the verifier can enumerate every rejected shape.
//!
//! Kernels are created with [`KernelSpec::builder`] or parsed from the text
//! format (see [`parser`]):
//!
//! ```text
//! ; Comments start with semicolon
//! const SCALE: f32 = 2.0
//!
//! codelet Scale(x: in [f32], y: out [f32]) {
//!     for i in 0 .. len(x) {
//!         y[i] = x[i] * SCALE
//!     }
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::ops;

use crate::core::error::{Rule, VerificationError};
use crate::intrinsics::Intrinsic;

pub mod display;
pub mod parser;
pub mod visit;

pub use parser::{parse_codelet, parse_codelets};

/// Element type of fields, locals and constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElemType {
    Bool,
    I32,
    U32,
    I64,
    U64,
    F32,
}

impl ElemType {
    pub const ALL: [ElemType; 6] = [
        ElemType::Bool,
        ElemType::I32,
        ElemType::U32,
        ElemType::I64,
        ElemType::U64,
        ElemType::F32,
    ];

    pub fn name(self) -> &'static str {
        match self {
            ElemType::Bool => "bool",
            ElemType::I32 => "i32",
            ElemType::U32 => "u32",
            ElemType::I64 => "i64",
            ElemType::U64 => "u64",
            ElemType::F32 => "f32",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        ElemType::ALL.into_iter().find(|t| t.name() == name)
    }

    /// LLVM type of a value held in a register.
    pub fn llvm(self) -> &'static str {
        match self {
            ElemType::Bool => "i1",
            ElemType::I32 | ElemType::U32 => "i32",
            ElemType::I64 | ElemType::U64 => "i64",
            ElemType::F32 => "float",
        }
    }

    /// LLVM type of a value held in tile memory.
    pub fn llvm_storage(self) -> &'static str {
        match self {
            ElemType::Bool => "i8",
            other => other.llvm(),
        }
    }

    /// C++ spelling used in the Poplar vertex declaration.
    pub fn poplar(self) -> &'static str {
        match self {
            ElemType::Bool => "bool",
            ElemType::I32 => "int",
            ElemType::U32 => "unsigned int",
            ElemType::I64 => "long long",
            ElemType::U64 => "unsigned long long",
            ElemType::F32 => "float",
        }
    }

    pub fn size_bytes(self) -> u32 {
        match self {
            ElemType::Bool => 1,
            ElemType::I32 | ElemType::U32 | ElemType::F32 => 4,
            ElemType::I64 | ElemType::U64 => 8,
        }
    }

    pub fn bits(self) -> u32 {
        match self {
            ElemType::Bool => 1,
            other => other.size_bytes() * 8,
        }
    }

    pub fn is_float(self) -> bool {
        self == ElemType::F32
    }

    /// Integer types, excluding `bool`.
    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElemType::I32 | ElemType::U32 | ElemType::I64 | ElemType::U64
        )
    }

    pub fn is_signed(self) -> bool {
        matches!(self, ElemType::I32 | ElemType::I64 | ElemType::F32)
    }

    pub fn is_numeric(self) -> bool {
        self.is_integer() || self.is_float()
    }

    /// Whether the integer `value` is representable without wrapping.
    pub fn can_hold(self, value: i128) -> bool {
        match self {
            ElemType::Bool => value == 0 || value == 1,
            ElemType::I32 => i32::try_from(value).is_ok(),
            ElemType::U32 => u32::try_from(value).is_ok(),
            ElemType::I64 => i64::try_from(value).is_ok(),
            ElemType::U64 => u64::try_from(value).is_ok(),
            ElemType::F32 => true,
        }
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which way data flows through a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Input,
    Output,
    InOut,
}

impl Direction {
    /// Keyword in the text format.
    pub fn keyword(self) -> &'static str {
        match self {
            Direction::Input => "in",
            Direction::Output => "out",
            Direction::InOut => "inout",
        }
    }

    pub fn from_keyword(word: &str) -> Option<Self> {
        match word {
            "in" => Some(Direction::Input),
            "out" => Some(Direction::Output),
            "inout" => Some(Direction::InOut),
            _ => None,
        }
    }

    /// Poplar field wrapper template.
    pub fn poplar(self) -> &'static str {
        match self {
            Direction::Input => "poplar::Input",
            Direction::Output => "poplar::Output",
            Direction::InOut => "poplar::InOut",
        }
    }

    pub fn is_writable(self) -> bool {
        self != Direction::Input
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldShape {
    /// A span of elements: pointer plus 32-bit length.
    Vector,
    /// One element.
    Scalar,
}

impl fmt::Display for FieldShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldShape::Vector => f.write_str("vector"),
            FieldShape::Scalar => f.write_str("scalar"),
        }
    }
}

/// One parameter of a codelet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub direction: Direction,
    pub shape: FieldShape,
    pub elem: ElemType,
}

/// A typed constant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Bool(bool),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
}

impl Scalar {
    pub fn elem(self) -> ElemType {
        match self {
            Scalar::Bool(_) => ElemType::Bool,
            Scalar::I32(_) => ElemType::I32,
            Scalar::U32(_) => ElemType::U32,
            Scalar::I64(_) => ElemType::I64,
            Scalar::U64(_) => ElemType::U64,
            Scalar::F32(_) => ElemType::F32,
        }
    }

    pub fn zero(elem: ElemType) -> Self {
        Scalar::from_i128(elem, 0)
    }

    /// Convert an integer into `elem`, wrapping like an LLVM `trunc`.
    pub fn from_i128(elem: ElemType, value: i128) -> Self {
        match elem {
            ElemType::Bool => Scalar::Bool(value != 0),
            ElemType::I32 => Scalar::I32(value as i32),
            ElemType::U32 => Scalar::U32(value as u32),
            ElemType::I64 => Scalar::I64(value as i64),
            ElemType::U64 => Scalar::U64(value as u64),
            ElemType::F32 => Scalar::F32(value as f32),
        }
    }

    pub fn from_f64(elem: ElemType, value: f64) -> Self {
        match elem {
            ElemType::F32 => Scalar::F32(value as f32),
            ElemType::Bool => Scalar::Bool(value != 0.0),
            other => Scalar::from_i128(other, value as i128),
        }
    }

    pub fn as_i128(self) -> i128 {
        match self {
            Scalar::Bool(b) => b as i128,
            Scalar::I32(v) => v as i128,
            Scalar::U32(v) => v as i128,
            Scalar::I64(v) => v as i128,
            Scalar::U64(v) => v as i128,
            Scalar::F32(v) => v as i128,
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Scalar::F32(v) => v as f64,
            other => other.as_i128() as f64,
        }
    }

    /// Convert to `elem` the way an `as` cast does.
    pub fn cast(self, elem: ElemType) -> Self {
        match self {
            Scalar::F32(v) => Scalar::from_f64(elem, v as f64),
            other => Scalar::from_i128(elem, other.as_i128()),
        }
    }
}

/// Literal as written in a kernel body.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Literal {
    /// Integer without suffix; adopts the type it is used at, `i32` otherwise.
    Int(i128),
    /// Float without suffix; adopts the float type it is used at, `f32` otherwise.
    Float(f64),
    Typed(Scalar),
}

/// A host binding captured explicitly by a kernel.
#[derive(Debug, Clone, PartialEq)]
pub enum Capture {
    /// Interpolated into the generated code as an immediate.
    Constant(Scalar),
    /// Interpolated as a private constant table in tile memory.
    ConstArray { elem: ElemType, values: Vec<Scalar> },
    /// A mutable host variable. Any reference from device code is rejected.
    Mutable { elem: ElemType },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    LogicalAnd,
    LogicalOr,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        use BinaryOp::*;
        match self {
            Add => "+",
            Sub => "-",
            Mul => "*",
            Div => "/",
            Rem => "%",
            And => "&",
            Or => "|",
            Xor => "^",
            Shl => "<<",
            Shr => ">>",
            Eq => "==",
            Ne => "!=",
            Lt => "<",
            Le => "<=",
            Gt => ">",
            Ge => ">=",
            LogicalAnd => "&&",
            LogicalOr => "||",
        }
    }

    /// Binding strength; higher binds tighter.
    pub fn precedence(self) -> u8 {
        use BinaryOp::*;
        match self {
            LogicalOr => 1,
            LogicalAnd => 2,
            Eq | Ne | Lt | Le | Gt | Ge => 3,
            Or => 4,
            Xor => 5,
            And => 6,
            Shl | Shr => 7,
            Add | Sub => 8,
            Mul | Div | Rem => 9,
        }
    }

    pub fn is_comparison(self) -> bool {
        use BinaryOp::*;
        matches!(self, Eq | Ne | Lt | Le | Gt | Ge)
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::LogicalAnd | BinaryOp::LogicalOr)
    }

    pub fn is_bitwise(self) -> bool {
        use BinaryOp::*;
        matches!(self, And | Or | Xor | Shl | Shr)
    }
}

/// Something that can be indexed.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayRef {
    Field(String),
    Global(String),
}

impl ArrayRef {
    pub fn name(&self) -> &str {
        match self {
            ArrayRef::Field(name) | ArrayRef::Global(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Literal),
    /// String literal; only meaningful as a print argument.
    Str(String),
    Local(String),
    /// Scalar field read.
    Field(String),
    /// Captured host binding.
    Global(String),
    Index {
        base: ArrayRef,
        index: Box<Expr>,
    },
    /// Length of a vector field, as `u32`.
    Len(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Cast {
        expr: Box<Expr>,
        to: ElemType,
    },
    Select {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Call(Call),
    /// Heap allocation of `len` elements.
    Alloc {
        elem: ElemType,
        len: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub callee: Callee,
    /// Type argument of call shapes such as `rand(f32)`.
    pub type_arg: Option<ElemType>,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Callee {
    /// A helper function defined alongside the kernel.
    Static(String),
    /// A device operation substituted by the intrinsic binding layer.
    Intrinsic(Intrinsic),
    /// A generic library routine named in the body, to be bound.
    Library(String),
    /// A symbol of an external native library.
    Foreign { library: String, symbol: String },
    /// A routine of a general-purpose host runtime.
    Runtime(String),
    /// Method resolved by the runtime type of the first argument.
    Dynamic { method: String },
}

impl Expr {
    pub fn int(value: i128) -> Self {
        Expr::Const(Literal::Int(value))
    }

    pub fn float(value: f64) -> Self {
        Expr::Const(Literal::Float(value))
    }

    pub fn scalar(value: Scalar) -> Self {
        Expr::Const(Literal::Typed(value))
    }

    pub fn bool(value: bool) -> Self {
        Expr::scalar(Scalar::Bool(value))
    }

    pub fn str(text: impl Into<String>) -> Self {
        Expr::Str(text.into())
    }

    pub fn local(name: impl Into<String>) -> Self {
        Expr::Local(name.into())
    }

    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn global(name: impl Into<String>) -> Self {
        Expr::Global(name.into())
    }

    pub fn index(field: impl Into<String>, index: Expr) -> Self {
        Expr::Index {
            base: ArrayRef::Field(field.into()),
            index: Box::new(index),
        }
    }

    pub fn index_global(name: impl Into<String>, index: Expr) -> Self {
        Expr::Index {
            base: ArrayRef::Global(name.into()),
            index: Box::new(index),
        }
    }

    pub fn len(field: impl Into<String>) -> Self {
        Expr::Len(field.into())
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Expr) -> Self {
        Expr::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn cast(self, to: ElemType) -> Self {
        Expr::Cast {
            expr: Box::new(self),
            to,
        }
    }

    pub fn select(cond: Expr, then: Expr, otherwise: Expr) -> Self {
        Expr::Select {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn call(callee: Callee, args: Vec<Expr>) -> Self {
        Expr::Call(Call {
            callee,
            type_arg: None,
            args,
        })
    }

    /// Call of a helper function.
    pub fn helper(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::call(Callee::Static(name.into()), args)
    }

    /// Call of a library routine by name, e.g. `tile_id` or `sqrt`.
    pub fn library(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::call(Callee::Library(name.into()), args)
    }

    /// `rand(elem)`.
    pub fn rand(elem: ElemType) -> Self {
        Expr::Call(Call {
            callee: Callee::Library("rand".to_string()),
            type_arg: Some(elem),
            args: Vec::new(),
        })
    }

    pub fn alloc(elem: ElemType, len: Expr) -> Self {
        Expr::Alloc {
            elem,
            len: Box::new(len),
        }
    }

    pub fn lt(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, self, rhs)
    }

    pub fn eq(self, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, self, rhs)
    }
}

macro_rules! impl_expr_op {
    ($trait:ident, $method:ident, $op:expr) => {
        impl ops::$trait for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                Expr::binary($op, self, rhs)
            }
        }
    };
}

impl_expr_op!(Add, add, BinaryOp::Add);
impl_expr_op!(Sub, sub, BinaryOp::Sub);
impl_expr_op!(Mul, mul, BinaryOp::Mul);
impl_expr_op!(Div, div, BinaryOp::Div);
impl_expr_op!(Rem, rem, BinaryOp::Rem);

/// Instrumentation macros, elaborated by the intrinsic binding layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Macro {
    /// `@print(..)` / `@println(..)`.
    Print { args: Vec<Expr>, newline: bool },
    /// `@show(expr)`: prints the source text and the value.
    Show { expr: Expr, text: String },
    /// `@cycles "label" { .. }`: prints the cycles the body took.
    Cycles { label: String, body: Vec<Stmt> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stmt {
    Let {
        name: String,
        ty: Option<ElemType>,
        value: Expr,
    },
    Assign {
        name: String,
        value: Expr,
    },
    /// Write to a field; `index` is `None` for scalar fields.
    Store {
        field: String,
        index: Option<Expr>,
        value: Expr,
    },
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    /// Loop over the half-open range `start..end`.
    For {
        var: String,
        start: Expr,
        end: Expr,
        body: Vec<Stmt>,
    },
    While {
        cond: Expr,
        body: Vec<Stmt>,
    },
    /// Nested scope.
    Block(Vec<Stmt>),
    Expr(Expr),
    Return(Option<Expr>),
    Macro(Macro),
}

impl Stmt {
    pub fn let_(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            ty: None,
            value,
        }
    }

    pub fn let_typed(name: impl Into<String>, ty: ElemType, value: Expr) -> Self {
        Stmt::Let {
            name: name.into(),
            ty: Some(ty),
            value,
        }
    }

    pub fn assign(name: impl Into<String>, value: Expr) -> Self {
        Stmt::Assign {
            name: name.into(),
            value,
        }
    }

    pub fn store(field: impl Into<String>, index: Expr, value: Expr) -> Self {
        Stmt::Store {
            field: field.into(),
            index: Some(index),
            value,
        }
    }

    pub fn store_scalar(field: impl Into<String>, value: Expr) -> Self {
        Stmt::Store {
            field: field.into(),
            index: None,
            value,
        }
    }

    pub fn for_range(var: impl Into<String>, start: Expr, end: Expr, body: Vec<Stmt>) -> Self {
        Stmt::For {
            var: var.into(),
            start,
            end,
            body,
        }
    }

    pub fn if_(cond: Expr, then: Vec<Stmt>, otherwise: Vec<Stmt>) -> Self {
        Stmt::If {
            cond,
            then,
            otherwise,
        }
    }

    pub fn print(args: Vec<Expr>) -> Self {
        Stmt::Macro(Macro::Print {
            args,
            newline: false,
        })
    }

    pub fn println(args: Vec<Expr>) -> Self {
        Stmt::Macro(Macro::Print {
            args,
            newline: true,
        })
    }

    pub fn cycles(label: impl Into<String>, body: Vec<Stmt>) -> Self {
        Stmt::Macro(Macro::Cycles {
            label: label.into(),
            body,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub name: String,
    /// `None` makes the parameter generic; it is specialised per call site.
    pub ty: Option<ElemType>,
}

/// A device function callable from the kernel body.
#[derive(Debug, Clone, PartialEq)]
pub struct HelperFn {
    pub name: String,
    pub params: Vec<Param>,
    pub body: Vec<Stmt>,
}

impl HelperFn {
    pub fn new(name: impl Into<String>, params: Vec<Param>, body: Vec<Stmt>) -> Self {
        Self {
            name: name.into(),
            params,
            body,
        }
    }
}

impl Param {
    pub fn typed(name: impl Into<String>, ty: ElemType) -> Self {
        Self {
            name: name.into(),
            ty: Some(ty),
        }
    }

    pub fn generic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: None,
        }
    }
}

/// Words that cannot be used as names.
pub const RESERVED: &[&str] = &[
    "codelet", "fn", "const", "extern", "mut", "let", "if", "else", "for", "in", "out", "inout",
    "while", "return", "as", "true", "false", "new", "select", "len", "runtime", "bool", "i32",
    "u32", "i64", "u64", "f32",
];

/// Prefix of locals introduced by macro elaboration; unavailable to user code.
pub const GENERATED_PREFIX: &str = "__";

pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// A codelet definition: signature, captures, helpers and body.
#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpec {
    pub(crate) name: String,
    pub(crate) fields: Vec<FieldDecl>,
    pub(crate) captures: BTreeMap<String, Capture>,
    pub(crate) helpers: Vec<HelperFn>,
    pub(crate) body: Vec<Stmt>,
}

impl KernelSpec {
    pub fn builder(name: impl Into<String>) -> KernelSpecBuilder {
        KernelSpecBuilder {
            name: name.into(),
            fields: Vec::new(),
            captures: Vec::new(),
            helpers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldDecl] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn captures(&self) -> &BTreeMap<String, Capture> {
        &self.captures
    }

    pub fn helpers(&self) -> &[HelperFn] {
        &self.helpers
    }

    pub fn helper(&self, name: &str) -> Option<&HelperFn> {
        self.helpers.iter().find(|h| h.name == name)
    }

    pub fn body(&self) -> &[Stmt] {
        &self.body
    }
}

pub struct KernelSpecBuilder {
    name: String,
    fields: Vec<FieldDecl>,
    captures: Vec<(String, Capture)>,
    helpers: Vec<HelperFn>,
    body: Vec<Stmt>,
}

impl KernelSpecBuilder {
    pub fn field(mut self, field: FieldDecl) -> Self {
        self.fields.push(field);
        self
    }

    fn vector(self, name: impl Into<String>, direction: Direction, elem: ElemType) -> Self {
        self.field(FieldDecl {
            name: name.into(),
            direction,
            shape: FieldShape::Vector,
            elem,
        })
    }

    pub fn input(self, name: impl Into<String>, elem: ElemType) -> Self {
        self.vector(name, Direction::Input, elem)
    }

    pub fn output(self, name: impl Into<String>, elem: ElemType) -> Self {
        self.vector(name, Direction::Output, elem)
    }

    pub fn inout(self, name: impl Into<String>, elem: ElemType) -> Self {
        self.vector(name, Direction::InOut, elem)
    }

    pub fn scalar(self, name: impl Into<String>, direction: Direction, elem: ElemType) -> Self {
        self.field(FieldDecl {
            name: name.into(),
            direction,
            shape: FieldShape::Scalar,
            elem,
        })
    }

    pub fn constant(mut self, name: impl Into<String>, value: Scalar) -> Self {
        self.captures.push((name.into(), Capture::Constant(value)));
        self
    }

    pub fn constant_array(mut self, name: impl Into<String>, elem: ElemType, values: Vec<Scalar>) -> Self {
        self.captures
            .push((name.into(), Capture::ConstArray { elem, values }));
        self
    }

    pub fn mutable_global(mut self, name: impl Into<String>, elem: ElemType) -> Self {
        self.captures.push((name.into(), Capture::Mutable { elem }));
        self
    }

    pub fn capture(mut self, name: impl Into<String>, capture: Capture) -> Self {
        self.captures.push((name.into(), capture));
        self
    }

    pub fn helper(mut self, helper: HelperFn) -> Self {
        self.helpers.push(helper);
        self
    }

    pub fn body(mut self, body: Vec<Stmt>) -> Self {
        self.body = body;
        self
    }

    pub fn stmt(mut self, stmt: Stmt) -> Self {
        self.body.push(stmt);
        self
    }

    /// Check names and captured values, then freeze the signature.
    pub fn build(self) -> Result<KernelSpec, VerificationError> {
        let codelet = self.name.clone();
        let malformed =
            |location: &str, detail: String| VerificationError::single(&codelet, Rule::Malformed, location, detail);

        check_name(&self.name).map_err(|d| malformed("signature", d))?;

        let mut seen: BTreeMap<String, &'static str> = BTreeMap::new();
        for field in &self.fields {
            claim(&mut seen, &field.name, "field").map_err(|d| malformed("signature", d))?;
        }

        let mut captures = BTreeMap::new();
        for (name, capture) in &self.captures {
            claim(&mut seen, name, "capture").map_err(|d| malformed("captures", d))?;
            if let Capture::ConstArray { elem, values } = capture {
                if values.is_empty() {
                    return Err(malformed("captures", format!("constant table `{}` is empty", name)));
                }
                if let Some(bad) = values.iter().find(|v| v.elem() != *elem) {
                    return Err(malformed(
                        "captures",
                        format!("constant table `{}` of {} holds a {} value", name, elem, bad.elem()),
                    ));
                }
            }
            captures.insert(name.clone(), capture.clone());
        }

        for helper in &self.helpers {
            claim(&mut seen, &helper.name, "helper").map_err(|d| malformed("helpers", d))?;
            let mut params: Vec<&str> = Vec::new();
            for param in &helper.params {
                check_name(&param.name).map_err(|d| malformed(&format!("helper {}", helper.name), d))?;
                if params.contains(&param.name.as_str()) {
                    return Err(malformed(
                        &format!("helper {}", helper.name),
                        format!("parameter `{}` declared twice", param.name),
                    ));
                }
                params.push(&param.name);
            }
        }

        Ok(KernelSpec {
            name: self.name,
            fields: self.fields,
            captures,
            helpers: self.helpers,
            body: self.body,
        })
    }
}

fn claim(seen: &mut BTreeMap<String, &'static str>, name: &str, what: &'static str) -> Result<(), String> {
    check_name(name)?;
    if let Some(previous) = seen.get(name) {
        return Err(format!("`{}` is declared both as {} and as {}", name, previous, what));
    }
    seen.insert(name.to_string(), what);
    Ok(())
}

fn check_name(name: &str) -> Result<(), String> {
    if !is_identifier(name) {
        return Err(format!("`{}` is not a valid identifier", name));
    }
    if RESERVED.contains(&name) {
        return Err(format!("`{}` is a reserved word", name));
    }
    if name.starts_with(GENERATED_PREFIX) {
        return Err(format!("`{}` uses the reserved `{}` prefix", name, GENERATED_PREFIX));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_orders_fields_and_sorts_captures() {
        let spec = KernelSpec::builder("Axpy")
            .input("x", ElemType::F32)
            .inout("y", ElemType::F32)
            .constant("b", Scalar::F32(1.0))
            .constant("a", Scalar::F32(2.0))
            .build()
            .unwrap();

        let names: Vec<_> = spec.fields().iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["x", "y"]);
        let captures: Vec<_> = spec.captures().keys().map(String::as_str).collect();
        assert_eq!(captures, ["a", "b"]);
    }

    #[test]
    fn duplicate_names_are_malformed() {
        let err = KernelSpec::builder("Dup")
            .input("x", ElemType::F32)
            .constant("x", Scalar::I32(1))
            .build()
            .unwrap_err();
        assert_eq!(err.rule(), Rule::Malformed);
        assert!(err.to_string().contains("both as field and as capture"));
    }

    #[test]
    fn reserved_and_invalid_names() {
        assert!(KernelSpec::builder("for").build().is_err());
        assert!(KernelSpec::builder("9lives").build().is_err());
        assert!(KernelSpec::builder("Ok_1").build().is_ok());
    }

    #[test]
    fn constant_table_must_be_homogeneous() {
        let err = KernelSpec::builder("Lut")
            .constant_array("T", ElemType::U32, vec![Scalar::U32(1), Scalar::I32(2)])
            .build()
            .unwrap_err();
        assert_eq!(err.rule(), Rule::Malformed);
    }

    #[test]
    fn scalar_casts_wrap_like_llvm() {
        assert_eq!(Scalar::I32(-1).cast(ElemType::U32), Scalar::U32(u32::MAX));
        assert_eq!(Scalar::F32(2.75).cast(ElemType::I32), Scalar::I32(2));
        assert_eq!(Scalar::U64(1 << 40).cast(ElemType::U32), Scalar::U32(0));
    }
}
