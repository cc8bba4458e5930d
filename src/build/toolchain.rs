// This module drives the external graph program compiler, popc by default. Toolchain builds
// the command line from the target, the configured extra flags and the session paths, then
// runs the program as a subprocess with piped stdout and stderr. Both pipes are drained on
// their own reader threads so a chatty compiler can never block on a full pipe, while the
// calling thread polls for completion and relays progress. A non-zero exit is reported as
// ToolchainError::Failed carrying the exit code and the captured diagnostics; nothing is
// retried, since a failing compile needs a source-level fix.

//! External toolchain invocation.

use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::build::progress::Progress;
use crate::codegen::TargetDesc;
use crate::core::error::ToolchainError;

/// Default graph program compiler.
pub const DEFAULT_PROGRAM: &str = "popc";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    program: PathBuf,
    poll_interval: Duration,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

/// What a successful run printed.
#[derive(Debug, Clone)]
pub struct ToolchainOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl Toolchain {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// `[extra flags] -X -Wno-override-module --target <t> <decl> <module> -o <object>`
    pub fn arguments(
        &self,
        target: &TargetDesc,
        extra_flags: &[String],
        declaration: &Path,
        module: &Path,
        object: &Path,
    ) -> Vec<OsString> {
        let mut args: Vec<OsString> = extra_flags.iter().map(OsString::from).collect();
        args.extend(
            ["-X", "-Wno-override-module", "--target", target.toolchain_target]
                .into_iter()
                .map(OsString::from),
        );
        args.push(declaration.into());
        args.push(module.into());
        args.push("-o".into());
        args.push(object.into());
        args
    }

    /// Run the toolchain in `cwd` and wait for it.
    pub fn run(
        &self,
        args: &[OsString],
        cwd: &Path,
        what: &str,
        progress: &mut dyn Progress,
    ) -> Result<ToolchainOutput, ToolchainError> {
        let program = self.program_name();
        log::info!(
            "running {} {}",
            program,
            args.iter()
                .map(|a| a.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let started = Instant::now();
        let mut child = Command::new(&self.program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ToolchainError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        progress.start(what);
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    progress.tick(started.elapsed());
                    thread::sleep(self.poll_interval);
                }
                Err(e) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    progress.finish(false, started.elapsed());
                    return Err(ToolchainError::io(format!("waiting for {}", program), e));
                }
            }
        };
        let elapsed = started.elapsed();
        progress.finish(status.success(), elapsed);

        let stdout = collect(stdout);
        let stderr = collect(stderr);
        if !status.success() {
            let diagnostics = if stderr.trim().is_empty() { &stdout } else { &stderr };
            log::debug!("{} failed after {:.2}s", program, elapsed.as_secs_f64());
            return Err(ToolchainError::Failed {
                program,
                code: status.code(),
                diagnostics: diagnostics.trim_end().to_string(),
            });
        }

        log::debug!("{} finished in {:.2}s", program, elapsed.as_secs_f64());
        Ok(ToolchainOutput {
            stdout,
            stderr,
            elapsed,
        })
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    }))
}

fn collect(reader: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    reader
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::progress::Silent;

    #[test]
    fn argument_order() {
        let toolchain = Toolchain::default();
        let args = toolchain.arguments(
            &TargetDesc::ipu21(),
            &["-O3".to_string()],
            Path::new("Scale.cpp"),
            Path::new("Scale.ll"),
            Path::new("Scale.gp"),
        );
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-O3",
                "-X",
                "-Wno-override-module",
                "--target",
                "ipu21",
                "Scale.cpp",
                "Scale.ll",
                "-o",
                "Scale.gp"
            ]
        );
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let toolchain = Toolchain::new("/nonexistent/popc");
        let dir = tempfile::tempdir().unwrap();
        let err = toolchain.run(&[], dir.path(), "x", &mut Silent).unwrap_err();
        assert!(matches!(err, ToolchainError::Spawn { .. }));
    }
}
