//! Dependency-directed build execution engine
//!
//! This crate is the run-time half of a build system: a user supplies
//! [`Rules`] (typed keys mapped to actions producing typed values) plus
//! some top-level actions, and [`run`] drives everything to completion.
//! Dependencies are discovered while rules execute, results are memoised
//! per key across concurrent demands, independent work runs in parallel
//! under a bounded worker pool, user-defined resources gate contended
//! segments, and failures come back structured with the key chain that led
//! to them.
//!
//! The pieces:
//! - [`Action`]: the context rules receive: `apply` for dependencies,
//!   `parallel`/`order_only`/`extra_thread` combinators, resource gating,
//!   tracking hooks, output helpers
//! - [`Rules`]: rule registration and top-level actions
//! - [`Resource`]: finite and throttled gating primitives
//! - [`Cache`]: per-key memoised sub-actions with dependency replay
//! - [`Database`]: the pluggable store; [`MemoryDatabase`] is bundled
//! - [`RunOptions`]: thread budget, verbosity, lint, staunch mode, reports

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod action;
mod apply;
pub mod cache;
pub mod database;
pub mod error;
pub mod fence;
pub mod key;
pub mod options;
mod parallel;
pub mod pool;
pub mod progress;
pub mod resource;
pub mod rules;
mod run;
mod track;

pub use action::Action;
pub use cache::Cache;
pub use database::{BuildOps, BuiltResult, Database, MemoryDatabase, ProgressCounts};
pub use error::{BuildError, BuildResult, StructuredError};
pub use fence::Fence;
pub use key::{BuildKey, BuildValue, Depends, Key, Stack, Trace, Value};
pub use options::{Lint, OutputHook, ProgressHook, RunOptions, Verbosity};
pub use pool::{Pool, Priority};
pub use progress::Progress;
pub use resource::Resource;
pub use rules::Rules;
pub use run::{run, run_with};
