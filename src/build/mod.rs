// This module is the build orchestrator. Orchestrator::compile runs the code generator for a
// codelet and target and caches the CompiledArtifact under its fingerprint; build goes on to
// write the artifact into a scoped BuildSession, run the external toolchain on it and load
// the graph program object it produced, caching the BuiltCodelet under a fingerprint that also
// covers the toolchain and its flags. Both caches are single-flight: concurrent requests for
// the same fingerprint wait for one build and share its Arc. Loading checks the object with
// the object crate: it must parse and must export the vertex entry or the compute symbol.

//! Build orchestration and caching.

pub mod cache;
pub mod progress;
pub mod session;
pub mod toolchain;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use object::{Object, ObjectSymbol};

use crate::codegen::{self, CodegenOptions, CompiledArtifact, TargetDesc};
use crate::codelet::Codelet;
use crate::core::config::BuildConfig;
use crate::core::error::{CodeletError, CodeletResult, LoweringError, ToolchainError};

pub use cache::ArtifactCache;
pub use progress::{Progress, Silent, Spinner};
pub use session::BuildSession;
pub use toolchain::{Toolchain, ToolchainOutput};

/// A codelet compiled all the way to a loadable object.
#[derive(Debug, Clone)]
pub struct BuiltCodelet {
    pub artifact: Arc<CompiledArtifact>,
    /// Contents of the graph program object.
    pub object: Vec<u8>,
    /// Build directory, when build files are kept.
    pub kept_dir: Option<PathBuf>,
    pub fingerprint: String,
}

pub struct Orchestrator {
    toolchain: Toolchain,
    config: BuildConfig,
    artifacts: ArtifactCache<CompiledArtifact>,
    builds: ArtifactCache<BuiltCodelet>,
}

impl Orchestrator {
    pub fn new(config: BuildConfig) -> Self {
        Self {
            toolchain: Toolchain::default(),
            config,
            artifacts: ArtifactCache::new(),
            builds: ArtifactCache::new(),
        }
    }

    /// An orchestrator using the process-wide configuration.
    pub fn from_environment() -> Self {
        Self::new(BuildConfig::process().clone())
    }

    pub fn with_toolchain(mut self, toolchain: Toolchain) -> Self {
        self.toolchain = toolchain;
        self
    }

    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    pub fn toolchain(&self) -> &Toolchain {
        &self.toolchain
    }

    /// Generate code for `codelet`, reusing an earlier identical compile.
    pub fn compile(&self, codelet: &Codelet, target: &TargetDesc) -> Result<Arc<CompiledArtifact>, LoweringError> {
        self.compile_with(codelet, target, &self.config)
    }

    pub fn compile_with(
        &self,
        codelet: &Codelet,
        target: &TargetDesc,
        config: &BuildConfig,
    ) -> Result<Arc<CompiledArtifact>, LoweringError> {
        let options = CodegenOptions::from_config(config);
        let key = codegen::artifact_fingerprint(codelet, target, &options);
        self.artifacts
            .get_or_try_insert_with(&key, || codegen::generate(codelet, target, &options))
    }

    /// Compile `codelet` and run the toolchain on it.
    pub fn build(&self, codelet: &Codelet, target: &TargetDesc) -> CodeletResult<Arc<BuiltCodelet>> {
        self.build_with(codelet, target, &self.config)
    }

    /// Like [`Orchestrator::build`] with a per-call configuration.
    pub fn build_with(
        &self,
        codelet: &Codelet,
        target: &TargetDesc,
        config: &BuildConfig,
    ) -> CodeletResult<Arc<BuiltCodelet>> {
        let artifact = self.compile_with(codelet, target, config)?;
        let key = self.build_fingerprint(&artifact, target, config);
        self.builds.get_or_try_insert_with(&key, || {
            self.run_build(&artifact, target, config, &key)
                .map_err(CodeletError::from)
        })
    }

    fn build_fingerprint(&self, artifact: &CompiledArtifact, target: &TargetDesc, config: &BuildConfig) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(artifact.fingerprint.as_bytes());
        hasher.update(b"\0");
        hasher.update(self.toolchain.program().to_string_lossy().as_bytes());
        hasher.update(b"\0");
        hasher.update(target.toolchain_target.as_bytes());
        for flag in &config.extra_flags {
            hasher.update(b"\0");
            hasher.update(flag.as_bytes());
        }
        // A build that keeps its files is never served by one that did not.
        hasher.update(if config.keep_files { b"\0keep" } else { b"\0drop" });
        hasher.finalize().to_hex().to_string()
    }

    fn run_build(
        &self,
        artifact: &Arc<CompiledArtifact>,
        target: &TargetDesc,
        config: &BuildConfig,
        fingerprint: &str,
    ) -> Result<BuiltCodelet, ToolchainError> {
        let session = BuildSession::new(&artifact.codelet, config)?;
        session.write_inputs(artifact)?;

        let args = self.toolchain.arguments(
            target,
            &config.extra_flags,
            &session.declaration_path(),
            &session.module_path(),
            &session.object_path(),
        );
        let mut progress = progress::for_config(config);
        let object = self
            .toolchain
            .run(&args, session.path(), &artifact.codelet, progress.as_mut())
            .and_then(|_| load_object(&session.object_path(), artifact));
        let object = match object {
            Ok(object) => object,
            Err(e) => {
                session.finish();
                return Err(e);
            }
        };
        log::info!("built `{}` ({} bytes)", artifact.codelet, object.len());
        Ok(BuiltCodelet {
            artifact: Arc::clone(artifact),
            object,
            kept_dir: session.finish(),
            fingerprint: fingerprint.to_string(),
        })
    }
}

/// Read the object at `path` and check that it exports `artifact`'s entry.
pub fn load_object(path: &Path, artifact: &CompiledArtifact) -> Result<Vec<u8>, ToolchainError> {
    let bytes = fs::read(path).map_err(|e| ToolchainError::io(format!("reading {}", path.display()), e))?;
    let entry = artifact.entry_symbol();
    let exported = {
        let file = object::File::parse(&*bytes).map_err(|e| ToolchainError::InvalidObject {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        file.symbols()
            .filter(|s| s.is_definition())
            .filter_map(|s| s.name().ok())
            .any(|name| name == entry || name == artifact.symbol)
    };
    if !exported {
        return Err(ToolchainError::MissingSymbol {
            path: path.to_path_buf(),
            symbol: entry,
        });
    }
    Ok(bytes)
}
