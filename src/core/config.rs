//! Build configuration.
//!
//! Process-wide defaults are read from the environment once
//! ([`BuildConfig::process`]) and every call site may override them through
//! the builder-style setters before handing the config to the orchestrator.
//!
//! | Variable | Meaning | Default |
//! |---|---|---|
//! | `IPU_CODELET_KEEP_FILES` | keep intermediate build directories | off |
//! | `IPU_CODELET_EXTRA_FLAGS` | whitespace separated flags passed verbatim to the toolchain | none |
//! | `IPU_CODELET_PROGRESS` | show a progress indicator while the toolchain runs | on |
//! | `IPU_CODELET_DISABLE_PRINT` | elide print and benchmark instrumentation | off |

use std::path::PathBuf;
use std::sync::OnceLock;

pub const ENV_KEEP_FILES: &str = "IPU_CODELET_KEEP_FILES";
pub const ENV_EXTRA_FLAGS: &str = "IPU_CODELET_EXTRA_FLAGS";
pub const ENV_PROGRESS: &str = "IPU_CODELET_PROGRESS";
pub const ENV_DISABLE_PRINT: &str = "IPU_CODELET_DISABLE_PRINT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    /// Keep the temporary build directory after the toolchain ran.
    pub keep_files: bool,
    /// Flags passed verbatim to the toolchain, before its own arguments.
    pub extra_flags: Vec<String>,
    /// Relay progress while the toolchain subprocess runs.
    pub progress: bool,
    /// Drop print and `@cycles` instrumentation at code generation time.
    pub disable_print: bool,
    /// Parent directory for build sessions; the system temp dir when unset.
    pub work_root: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            keep_files: false,
            extra_flags: Vec::new(),
            progress: true,
            disable_print: false,
            work_root: None,
        }
    }
}

impl BuildConfig {
    /// Process-wide defaults, seeded from the environment on first use.
    pub fn process() -> &'static BuildConfig {
        static PROCESS: OnceLock<BuildConfig> = OnceLock::new();
        PROCESS.get_or_init(|| BuildConfig::from_lookup(|key| std::env::var(key).ok()))
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = BuildConfig::default();
        let flag = |key: &str, default: bool| match lookup(key) {
            Some(value) => parse_flag(&value).unwrap_or_else(|| {
                log::warn!("ignoring unrecognised value {:?} for {}", value, key);
                default
            }),
            None => default,
        };

        Self {
            keep_files: flag(ENV_KEEP_FILES, defaults.keep_files),
            extra_flags: lookup(ENV_EXTRA_FLAGS)
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            progress: flag(ENV_PROGRESS, defaults.progress),
            disable_print: flag(ENV_DISABLE_PRINT, defaults.disable_print),
            work_root: None,
        }
    }

    pub fn keep_files(mut self, keep: bool) -> Self {
        self.keep_files = keep;
        self
    }

    pub fn extra_flags<I, S>(mut self, flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extra_flags = flags.into_iter().map(Into::into).collect();
        self
    }

    pub fn progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn disable_print(mut self, disable: bool) -> Self {
        self.disable_print = disable;
        self
    }

    pub fn work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
