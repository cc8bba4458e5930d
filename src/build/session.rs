// This module implements BuildSession, the scoped workspace of one toolchain invocation. A
// session owns a temporary directory created with the tempfile crate, under the configured
// work root or the system temp dir, and knows the paths of the files a build reads and
// writes: the LLVM module, the C++ vertex declaration and the graph program object the
// toolchain produces. The directory is removed when the session is dropped, on success and on
// every error path alike, unless the configuration asks to keep build files, in which case
// its location is logged and handed back to the caller.

//! Scoped build directories.

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::codegen::CompiledArtifact;
use crate::core::config::BuildConfig;
use crate::core::error::ToolchainError;

pub struct BuildSession {
    dir: TempDir,
    name: String,
    keep: bool,
}

impl BuildSession {
    /// Create the workspace for building codelet `name`.
    pub fn new(name: &str, config: &BuildConfig) -> Result<Self, ToolchainError> {
        let prefix = format!("ipu-codelet-{}-", name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).disable_cleanup(config.keep_files);
        let dir = match &config.work_root {
            Some(root) => {
                fs::create_dir_all(root)
                    .map_err(|e| ToolchainError::io(format!("creating {}", root.display()), e))?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| ToolchainError::io("creating build directory", e))?;

        log::debug!("build session for `{}` in {}", name, dir.path().display());
        Ok(Self {
            dir,
            name: name.to_string(),
            keep: config.keep_files,
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn module_path(&self) -> PathBuf {
        self.path().join(format!("{}.ll", self.name))
    }

    pub fn declaration_path(&self) -> PathBuf {
        self.path().join(format!("{}.cpp", self.name))
    }

    pub fn object_path(&self) -> PathBuf {
        self.path().join(format!("{}.gp", self.name))
    }

    /// Write the module and the vertex declaration of `artifact`.
    pub fn write_inputs(&self, artifact: &CompiledArtifact) -> Result<(), ToolchainError> {
        for (path, contents) in [
            (self.module_path(), &artifact.module),
            (self.declaration_path(), &artifact.vertex_declaration),
        ] {
            fs::write(&path, contents).map_err(|e| ToolchainError::io(format!("writing {}", path.display()), e))?;
        }
        Ok(())
    }

    /// End the session; returns the directory if it is kept.
    pub fn finish(self) -> Option<PathBuf> {
        if self.keep {
            let path = self.path().to_path_buf();
            log::warn!("keeping build files of `{}` in {}", self.name, path.display());
            Some(path)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn removed_unless_kept() {
        let root = tempfile::tempdir().unwrap();
        let config = BuildConfig::default().work_root(root.path());

        let session = BuildSession::new("Scale", &config).unwrap();
        let path = session.path().to_path_buf();
        assert!(path.starts_with(root.path()));
        assert_eq!(session.module_path(), path.join("Scale.ll"));
        assert!(session.finish().is_none());
        assert!(!path.exists());

        let session = BuildSession::new("Scale", &config.clone().keep_files(true)).unwrap();
        let kept = session.finish().unwrap();
        assert!(kept.exists());
    }
}
