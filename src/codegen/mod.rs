// This module is the Colossus code generator. generate() takes a verified Codelet, elaborates
// its instrumentation macros (or elides them when printing is disabled), lowers the body and
// every reachable helper specialisation to one LLVM IR module for the target triple, and
// packages the result as a CompiledArtifact: the module text, the exported symbol table, the
// reified vertex fields with their slot in the vertex state, the C++ vertex declaration the
// toolchain compiles alongside the module, and a fingerprint over everything that influences
// the output. Lowering runs inside a CompilationSession whose arena holds the interned symbol
// names; the session statistics are logged at debug level once the module is complete.

//! Colossus code generation.

pub mod lower;
pub mod target;

use std::fmt::Write as _;

use bumpalo::Bump;

use crate::codelet::Codelet;
use crate::core::config::BuildConfig;
use crate::core::error::LoweringError;
use crate::core::session::CompilationSession;
use crate::intrinsics;
use crate::kernel::{Direction, ElemType, FieldShape, KernelSpec};

pub use lower::{compute_symbol, state_type};
pub use target::TargetDesc;

/// Options that change the generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodegenOptions {
    /// Emit print and `@cycles` instrumentation.
    pub print: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self { print: true }
    }
}

impl CodegenOptions {
    pub fn from_config(config: &BuildConfig) -> Self {
        Self {
            print: !config.disable_print,
        }
    }
}

/// A codelet field as laid out in the vertex state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexField {
    pub name: String,
    pub direction: Direction,
    pub shape: FieldShape,
    pub elem: ElemType,
    /// Index of the field in the vertex state struct.
    pub slot: u32,
}

/// Output of the code generator for one codelet and target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub codelet: String,
    /// Exported compute entry point.
    pub symbol: String,
    pub fields: Vec<VertexField>,
    /// LLVM IR module text.
    pub module: String,
    /// Every function defined by the module.
    pub symbols: Vec<String>,
    /// C++ class declaring the vertex to the toolchain.
    pub vertex_declaration: String,
    /// Name of the target the module was generated for.
    pub target: String,
    pub fingerprint: String,
}

impl CompiledArtifact {
    /// Symbol the toolchain exports for the vertex entry.
    pub fn entry_symbol(&self) -> String {
        run_codelet_symbol(&self.codelet)
    }

    pub fn field(&self, name: &str) -> Option<&VertexField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// Symbol of the vertex entry that popc generates around `compute()`.
pub fn run_codelet_symbol(codelet: &str) -> String {
    format!("__runCodelet_{}", codelet)
}

/// Fingerprint of the artifact built from `codelet` for `target` with `options`.
pub fn artifact_fingerprint(codelet: &Codelet, target: &TargetDesc, options: &CodegenOptions) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(codelet.fingerprint().as_bytes());
    hasher.update(b"\0");
    hasher.update(target.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(if options.print { b"print".as_slice() } else { b"noprint".as_slice() });
    hasher.finalize().to_hex().to_string()
}

/// Lower `codelet` to an LLVM module for `target`.
pub fn generate(
    codelet: &Codelet,
    target: &TargetDesc,
    options: &CodegenOptions,
) -> Result<CompiledArtifact, LoweringError> {
    log::debug!(
        "generating `{}` for {} (print {})",
        codelet.name(),
        target,
        if options.print { "on" } else { "off" }
    );

    let spec = intrinsics::elaborate(codelet.spec(), options.print);
    let arena = Bump::new();
    let session = CompilationSession::new(&arena);
    let lowered = lower::lower_module(&spec, target, &session)?;
    log::debug!("{}", session.stats());

    Ok(CompiledArtifact {
        codelet: spec.name().to_string(),
        symbol: compute_symbol(spec.name()),
        fields: vertex_fields(&spec),
        module: lowered.text,
        symbols: lowered.defined,
        vertex_declaration: vertex_declaration(&spec),
        target: target.name.clone(),
        fingerprint: artifact_fingerprint(codelet, target, options),
    })
}

fn vertex_fields(spec: &KernelSpec) -> Vec<VertexField> {
    spec.fields()
        .iter()
        .zip(0u32..)
        .map(|(f, slot)| VertexField {
            name: f.name.clone(),
            direction: f.direction,
            shape: f.shape,
            elem: f.elem,
            slot,
        })
        .collect()
}

/// C++ declaration of the vertex class.
pub fn vertex_declaration(spec: &KernelSpec) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "#include <poplar/Vertex.hpp>");
    let _ = writeln!(out);
    let _ = writeln!(out, "class {} : public poplar::Vertex {{", spec.name());
    let _ = writeln!(out, "public:");
    for field in spec.fields() {
        let ty = match field.shape {
            FieldShape::Vector => format!("{}<poplar::Vector<{}>>", field.direction.poplar(), field.elem.poplar()),
            FieldShape::Scalar => format!("{}<{}>", field.direction.poplar(), field.elem.poplar()),
        };
        let _ = writeln!(out, "  {} {};", ty, field.name);
    }
    if !spec.fields().is_empty() {
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "  bool compute();");
    let _ = writeln!(out, "}};");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codelet::define_codelet;
    use crate::kernel::{Expr, Stmt};

    fn scale() -> Codelet {
        let spec = KernelSpec::builder("Scale")
            .input("x", ElemType::F32)
            .output("y", ElemType::F32)
            .scalar("s", Direction::Input, ElemType::F32)
            .body(vec![Stmt::for_range(
                "i",
                Expr::int(0),
                Expr::len("x"),
                vec![Stmt::store(
                    "y",
                    Expr::local("i"),
                    Expr::index("x", Expr::local("i")) * Expr::field("s"),
                )],
            )])
            .build()
            .unwrap();
        define_codelet(spec).unwrap()
    }

    #[test]
    fn declares_vertex_class() {
        let decl = vertex_declaration(scale().spec());
        assert!(decl.contains("class Scale : public poplar::Vertex {"));
        assert!(decl.contains("  poplar::Input<poplar::Vector<float>> x;"));
        assert!(decl.contains("  poplar::Output<poplar::Vector<float>> y;"));
        assert!(decl.contains("  poplar::Input<float> s;"));
        assert!(decl.contains("  bool compute();"));
    }

    #[test]
    fn artifact_lists_fields_in_slot_order() {
        let artifact = generate(&scale(), &TargetDesc::ipu2(), &CodegenOptions::default()).unwrap();
        assert_eq!(artifact.symbol, "_ZN5Scale7computeEv");
        assert_eq!(artifact.entry_symbol(), "__runCodelet_Scale");
        let slots: Vec<(&str, u32)> = artifact.fields.iter().map(|f| (f.name.as_str(), f.slot)).collect();
        assert_eq!(slots, [("x", 0), ("y", 1), ("s", 2)]);
        assert_eq!(artifact.field("s").unwrap().shape, FieldShape::Scalar);
        assert!(artifact.module.contains("%Scale.state = type { { ptr, i32 }, { ptr, i32 }, ptr }"));
    }

    #[test]
    fn fingerprint_depends_on_target_and_print() {
        let codelet = scale();
        let on = CodegenOptions { print: true };
        let off = CodegenOptions { print: false };
        let a = artifact_fingerprint(&codelet, &TargetDesc::ipu2(), &on);
        assert_eq!(a, artifact_fingerprint(&codelet, &TargetDesc::ipu2(), &on));
        assert_ne!(a, artifact_fingerprint(&codelet, &TargetDesc::ipu21(), &on));
        assert_ne!(a, artifact_fingerprint(&codelet, &TargetDesc::ipu2(), &off));
    }
}
