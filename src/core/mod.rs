// This module gathers the infrastructure shared by every pipeline stage: the error types
// (one kind per stage plus the CodeletError umbrella), the build configuration seeded from
// the environment, and the arena-backed compilation session that interns symbol names and
// collects statistics while a codelet is lowered.

//! Shared infrastructure: errors, configuration and the compilation session.

pub mod config;
pub mod error;
pub mod session;

pub use config::BuildConfig;
pub use error::{
    BindingMismatchError, CodeletError, CodeletResult, ExecutionError, LoweringError, ParseError,
    Rule, ToolchainError, VerificationError, Violation,
};
pub use session::{CompilationSession, SessionStats};
