//! ipu-codelet - compiling codelets for Graphcore IPU tiles.
//!
//! A codelet is a small kernel that runs independently on each tile of an IPU.
//! This crate takes a codelet from its intermediate representation to a
//! loadable graph program object and packages it as a vertex of a compute
//! graph.
//!
//! # Primary Usage
//!
//! ```ignore
//! use ipu_codelet::{define_codelet, parse_codelet, add_vertex, Graph, IpuModel, Orchestrator};
//!
//! let codelet = define_codelet(parse_codelet(source)?)?;
//! let orchestrator = Orchestrator::from_environment();
//! let built = orchestrator.build(&codelet, &TargetDesc::ipu21())?;
//!
//! let mut graph = Graph::new(&IpuModel::new(4));
//! graph.register_artifact(&built.artifact);
//! add_vertex(&mut graph, &built.artifact, 0, &[("x", VertexVector::input(x.all()))])?;
//! ```
//!
//! # Architecture
//!
//! - [`kernel`] - Kernel IR, builder and text parser
//! - [`intrinsics`] - Device intrinsics, binding and macro elaboration
//! - [`verify`] - Restricted-subset verifier
//! - [`codegen`] - Colossus LLVM IR generation
//! - [`build`] - Toolchain invocation, build directories and caches
//! - [`graph`] / [`vertex`] - Compute graph model and vertex packaging
//! - [`emulator`] - Host-side reference execution of codelets
//! - [`core`] - Errors, configuration and the compilation session

pub mod build;
pub mod codegen;
pub mod codelet;
pub mod core;
pub mod emulator;
pub mod graph;
pub mod intrinsics;
pub mod kernel;
pub mod timing;
pub mod verify;
pub mod vertex;

pub use build::{load_object, BuiltCodelet, Orchestrator, Toolchain};
pub use codegen::{generate, CodegenOptions, CompiledArtifact, TargetDesc};
pub use codelet::{define_codelet, Codelet};
pub use core::{
    BindingMismatchError, BuildConfig, CodeletError, CodeletResult, ExecutionError, LoweringError,
    ParseError, ToolchainError, VerificationError,
};
pub use emulator::Emulator;
pub use graph::{Device, Graph, IpuModel, Tensor, VertexId, VertexVector};
pub use kernel::{parse_codelet, parse_codelets, Direction, ElemType, KernelSpec};
pub use verify::verify;
pub use vertex::{add_vertex, add_vertex_across_tiles, CodeletRef};
