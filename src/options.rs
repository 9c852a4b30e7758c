//! Run options consumed by the engine

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::progress::Progress;

/// How much the engine prints through the output sink
///
/// Ordered: a message tagged at some level is shown when the effective
/// verbosity is at least that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// Print nothing
    Silent,
    /// Only errors
    Quiet,
    /// Errors and warnings
    Normal,
    /// Also progress messages
    Loud,
    /// Also a line per executed rule
    Chatty,
    /// Everything, including scheduler internals
    Diagnostic,
}

/// Post-build lint checking mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lint {
    /// Working-directory stability and stored-value validation
    Basic,
    /// `Basic` plus tracking coherence checks at the end of every rule
    FsaTrace,
}

/// User-supplied output sink: receives the verbosity a message was tagged
/// with and the already-abbreviated text
pub type OutputHook = Arc<dyn Fn(Verbosity, &str) + Send + Sync>;

/// User-supplied progress observer, invoked with fresh snapshots on a
/// dedicated reporter task while the build runs
pub type ProgressHook = Arc<dyn Fn(Progress) + Send + Sync>;

/// Options controlling one call to [`run`](crate::run)
#[derive(Clone)]
pub struct RunOptions {
    /// Worker slots; `0` means one per detected processor
    pub threads: usize,
    /// Flush the default output sink after every line
    pub line_buffering: bool,
    /// `(from, to)` replacements applied to output text, longest `from` first
    pub abbreviations: Vec<(String, String)>,
    /// Effective verbosity for the build
    pub verbosity: Verbosity,
    /// Continue after errors, reporting the first at the end
    pub staunch: bool,
    /// Print phase timings when the run finishes
    pub timings: bool,
    /// Lint checking mode, if any
    pub lint: Option<Lint>,
    /// Paths to write the JSON build report to
    pub reports: Vec<PathBuf>,
    /// Paths to write the live key listing to; `-` means stdout
    pub live_files: Vec<PathBuf>,
    /// Progress observer
    pub progress: Option<ProgressHook>,
    /// Replacement output sink; defaults to stdout
    pub output: Option<OutputHook>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            threads: 0,
            line_buffering: false,
            abbreviations: Vec::new(),
            verbosity: Verbosity::Normal,
            staunch: false,
            timings: false,
            lint: None,
            reports: Vec::new(),
            live_files: Vec::new(),
            progress: None,
            output: None,
        }
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("threads", &self.threads)
            .field("line_buffering", &self.line_buffering)
            .field("abbreviations", &self.abbreviations)
            .field("verbosity", &self.verbosity)
            .field("staunch", &self.staunch)
            .field("timings", &self.timings)
            .field("lint", &self.lint)
            .field("reports", &self.reports)
            .field("live_files", &self.live_files)
            .field("progress", &self.progress.is_some())
            .field("output", &self.output.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_orders_from_silent_to_diagnostic() {
        assert!(Verbosity::Silent < Verbosity::Quiet);
        assert!(Verbosity::Quiet < Verbosity::Normal);
        assert!(Verbosity::Normal < Verbosity::Loud);
        assert!(Verbosity::Loud < Verbosity::Chatty);
        assert!(Verbosity::Chatty < Verbosity::Diagnostic);
    }
}
