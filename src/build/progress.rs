//! Progress reporting while the toolchain runs.

use std::io::{self, Write};
use std::time::Duration;

use crate::core::config::BuildConfig;

/// Receives progress of one long-running build step.
pub trait Progress {
    fn start(&mut self, what: &str);
    /// Called periodically while the step is running.
    fn tick(&mut self, elapsed: Duration);
    fn finish(&mut self, success: bool, elapsed: Duration);
}

/// Reports nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Progress for Silent {
    fn start(&mut self, _what: &str) {}
    fn tick(&mut self, _elapsed: Duration) {}
    fn finish(&mut self, _success: bool, _elapsed: Duration) {}
}

const FRAMES: [char; 4] = ['|', '/', '-', '\\'];

/// An in-place spinner, normally on stderr.
pub struct Spinner<W: Write> {
    out: W,
    what: String,
    frame: usize,
}

impl Spinner<io::Stderr> {
    pub fn stderr() -> Self {
        Self::new(io::stderr())
    }
}

impl<W: Write> Spinner<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            what: String::new(),
            frame: 0,
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Progress for Spinner<W> {
    fn start(&mut self, what: &str) {
        self.what = what.to_string();
        self.frame = 0;
        let _ = write!(self.out, "{:>12} {}", "Compiling", self.what);
        let _ = self.out.flush();
    }

    fn tick(&mut self, elapsed: Duration) {
        let frame = FRAMES[self.frame % FRAMES.len()];
        self.frame += 1;
        let _ = write!(
            self.out,
            "\r{:>12} {} {} {:.1}s",
            "Compiling",
            self.what,
            frame,
            elapsed.as_secs_f64()
        );
        let _ = self.out.flush();
    }

    fn finish(&mut self, success: bool, elapsed: Duration) {
        let status = if success { "done" } else { "failed" };
        let _ = writeln!(
            self.out,
            "\r{:>12} {} {} in {:.2}s",
            "Compiling",
            self.what,
            status,
            elapsed.as_secs_f64()
        );
        let _ = self.out.flush();
    }
}

/// The reporter selected by `config`.
pub fn for_config(config: &BuildConfig) -> Box<dyn Progress> {
    if config.progress {
        Box::new(Spinner::stderr())
    } else {
        Box::new(Silent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_reports_outcome() {
        let mut spinner = Spinner::new(Vec::new());
        spinner.start("Scale");
        spinner.tick(Duration::from_millis(100));
        spinner.tick(Duration::from_millis(200));
        spinner.finish(false, Duration::from_millis(250));

        let text = String::from_utf8(spinner.into_inner()).unwrap();
        assert!(text.contains("Compiling Scale"));
        assert!(text.contains("| 0.1s"));
        assert!(text.contains("/ 0.2s"));
        assert!(text.ends_with("Scale failed in 0.25s\n"));
    }
}
