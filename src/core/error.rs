// This module defines the error types of the codelet pipeline using the thiserror crate.
// Each pipeline stage owns one error kind: VerificationError for kernels that use a
// construct outside the on-device subset (carrying every violated rule with its location),
// LoweringError for constructs the Colossus code generator cannot express, ToolchainError
// for failures of the external popc invocation or of loading its output, and
// BindingMismatchError for add_vertex calls whose bindings do not match the codelet
// signature. ParseError covers the textual kernel format and ExecutionError the host
// emulator. CodeletError is the umbrella enum returned by the orchestrator, with
// CodeletResult<T> as the convenience alias.

//! Error types for the codelet pipeline.
//!
//! None of these errors is retried anywhere: every one of them describes a
//! structural incompatibility that needs a source-level fix.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::kernel::{Direction, ElemType, FieldShape};

/// Category of a verifier rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Rule {
    /// The body allocates heap memory.
    HeapAllocation,
    /// A call cannot be resolved to one statically known function.
    DynamicDispatch,
    /// A call into a runtime or library not compiled for the tile.
    ForeignCall,
    /// A reference to mutable or uncaptured host data.
    ExternalReference,
    /// The kernel signature or helper set is structurally invalid.
    Malformed,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Rule::HeapAllocation => "heap-allocation",
            Rule::DynamicDispatch => "dynamic-dispatch",
            Rule::ForeignCall => "foreign-call",
            Rule::ExternalReference => "external-reference",
            Rule::Malformed => "malformed",
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One rejected construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub rule: Rule,
    /// Path of the offending statement, e.g. `compute/2/then/0`.
    pub location: String,
    pub detail: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}: {}", self.rule, self.location, self.detail)
    }
}

/// A kernel was rejected by the restricted-subset verifier.
///
/// Always carries at least one violation; the first one is the primary
/// cause reported in the message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("codelet `{codelet}` rejected: {}", describe_violations(.violations))]
pub struct VerificationError {
    pub codelet: String,
    pub violations: Vec<Violation>,
}

fn describe_violations(violations: &[Violation]) -> String {
    match violations {
        [] => "no violation recorded".to_string(),
        [only] => only.to_string(),
        [first, rest @ ..] => format!("{} (and {} more)", first, rest.len()),
    }
}

impl VerificationError {
    pub fn single(codelet: &str, rule: Rule, location: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            codelet: codelet.to_string(),
            violations: vec![Violation {
                rule,
                location: location.into(),
                detail: detail.into(),
            }],
        }
    }

    /// The primary violated rule.
    pub fn rule(&self) -> Rule {
        self.violations
            .first()
            .map(|v| v.rule)
            .unwrap_or(Rule::Malformed)
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn has_rule(&self, rule: Rule) -> bool {
        self.violations.iter().any(|v| v.rule == rule)
    }
}

/// The code generator cannot express an otherwise accepted construct.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot lower {construct} in `{codelet}`: {reason}")]
pub struct LoweringError {
    pub codelet: String,
    pub construct: String,
    pub reason: String,
}

/// Failure of the external toolchain or of loading what it produced.
#[derive(Error, Debug)]
pub enum ToolchainError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("`{program}` exited with {}: {diagnostics}", exit_description(.code))]
    Failed {
        program: String,
        code: Option<i32>,
        diagnostics: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("`{}` is not a loadable object: {reason}", .path.display())]
    InvalidObject { path: PathBuf, reason: String },

    #[error("`{}` does not export `{symbol}`", .path.display())]
    MissingSymbol { path: PathBuf, symbol: String },
}

fn exit_description(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("status {}", code),
        None => "no status (terminated by signal)".to_string(),
    }
}

impl ToolchainError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        ToolchainError::Io {
            context: context.into(),
            source,
        }
    }

    /// Exit code of a failed toolchain run.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ToolchainError::Failed { code, .. } => *code,
            _ => None,
        }
    }

    /// Captured diagnostics of a failed toolchain run.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            ToolchainError::Failed { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }
}

/// `add_vertex` bindings do not match the codelet, or the tile is invalid.
///
/// Raising this never leaves a partially registered vertex in the graph.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindingMismatchError {
    #[error("tile {tile} is out of range (device has {num_tiles} tiles)")]
    TileOutOfRange { tile: u32, num_tiles: u32 },

    #[error("no codelet with symbol `{symbol}` is registered in the graph")]
    UnknownCodelet { symbol: String },

    #[error("a different codelet is already registered as `{symbol}`")]
    ConflictingCodelet { symbol: String },

    #[error("unknown tensor #{tensor}")]
    UnknownTensor { tensor: u32 },

    #[error("field `{field}` of `{codelet}` is not bound")]
    MissingField { codelet: String, field: String },

    #[error("`{codelet}` has no field named `{field}`")]
    UnexpectedField { codelet: String, field: String },

    #[error("field `{field}` is bound more than once")]
    DuplicateField { field: String },

    #[error("field `{field}` expects direction {expected}, got {found}")]
    DirectionMismatch {
        field: String,
        expected: Direction,
        found: Direction,
    },

    #[error("field `{field}` expects element type {expected}, got {found}")]
    TypeMismatch {
        field: String,
        expected: ElemType,
        found: ElemType,
    },

    #[error("field `{field}` is a {shape} field but the allocation holds {len} elements")]
    ShapeMismatch {
        field: String,
        shape: FieldShape,
        len: u32,
    },

    #[error("field `{field}` is mapped to tile {mapped}, vertex runs on tile {tile}")]
    TileMismatch { field: String, mapped: u32, tile: u32 },

    #[error("allocation {offset}..{end} is outside tensor `{tensor}` of length {len}")]
    SliceOutOfRange {
        tensor: String,
        offset: u32,
        end: u32,
        len: u32,
    },

    #[error("cannot split field `{field}` of length {len} across {tiles} tiles")]
    UnevenSplit { field: String, len: u32, tiles: u32 },
}

/// Failure while running a codelet on the host emulator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("field `{field}` has no data")]
    MissingField { field: String },

    #[error("field `{field}` holds {found} data, expected {expected}")]
    FieldType {
        field: String,
        expected: ElemType,
        found: ElemType,
    },

    #[error("scalar field `{field}` holds {len} elements")]
    FieldShape { field: String, len: usize },

    #[error("index {index} is out of bounds for `{name}` of length {len}")]
    OutOfBounds { name: String, index: i128, len: usize },

    #[error("{0}")]
    Arithmetic(String),

    #[error("cannot execute {construct}: {reason}")]
    Unsupported { construct: String, reason: String },

    #[error("step limit of {0} exceeded")]
    StepLimit(u64),
}

/// Error in the textual kernel format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{line}:{column}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

/// Any failure of the codelet pipeline.
#[derive(Error, Debug)]
pub enum CodeletError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error(transparent)]
    Lowering(#[from] LoweringError),

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),

    #[error(transparent)]
    Binding(#[from] BindingMismatchError),

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error("codelet `{name}` not found")]
    CodeletNotFound { name: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for pipeline operations.
pub type CodeletResult<T> = Result<T, CodeletError>;
