//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;

use girder::{BuildKey, OutputHook, RunOptions, Verbosity};

/// A simple named key producing a `String`
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Name(pub &'static str);

impl BuildKey for Name {
    type Value = String;
}

/// A key with no rule registered, for missing-rule tests
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Orphan(pub &'static str);

impl BuildKey for Orphan {
    type Value = String;
}

/// Captures everything emitted through the output sink
#[derive(Clone, Default)]
pub struct SinkSpy {
    lines: Arc<Mutex<Vec<(Verbosity, String)>>>,
}

impl SinkSpy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hook(&self) -> OutputHook {
        let lines = self.lines.clone();
        Arc::new(move |verbosity, msg| lines.lock().push((verbosity, msg.to_string())))
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().iter().map(|(_, msg)| msg.clone()).collect()
    }

    pub fn text(&self) -> String {
        self.lines().join("\n")
    }

    pub fn count_containing(&self, needle: &str) -> usize {
        self.lines().iter().filter(|line| line.contains(needle)).count()
    }
}

/// Install the test tracing subscriber once per test binary
///
/// Engine diagnostics show up in failing-test output; tune with
/// `RUST_LOG`, e.g. `RUST_LOG=girder=trace`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Options with a fixed thread budget and everything else default
pub fn options(threads: usize) -> RunOptions {
    init_tracing();
    RunOptions {
        threads,
        ..RunOptions::default()
    }
}
