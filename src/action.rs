//! The action context: ambient state threaded through user rules
//!
//! An [`Action`] is the handle rules and top-level actions receive. It pairs
//! the build-wide [`Global`] state (database, pool, registry, sinks) with a
//! per-action [`Local`] record (stack, recorded dependencies, discount,
//! traces, tracking state). Locals are owned by one logical action at a
//! time; `parallel` branches get a cleared copy and merge back on join.
//!
//! Suspension is cooperative: any operation that must wait for an external
//! event goes through [`Action::suspended`], which gives the worker slot
//! back to the pool for the duration of the wait and re-acquires one when
//! the event fires (at high priority when the delivered result is an
//! error, so failures surface promptly).

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::database::Database;
use crate::error::{BuildError, BuildResult, StructuredError};
use crate::key::{Depends, Key, Stack, Trace};
use crate::options::{RunOptions, Verbosity};
use crate::pool::{Pool, Priority};
use crate::rules::RuleRegistry;

pub(crate) type TrackAllow = Arc<dyn Fn(&Key) -> bool + Send + Sync>;
pub(crate) type AfterAction = Box<dyn FnOnce() + Send>;

/// Serialised, abbreviation-applying output sink
pub(crate) struct OutputSink {
    abbreviations: Vec<(String, String)>,
    write: Mutex<Box<dyn Fn(Verbosity, &str) + Send>>,
}

impl OutputSink {
    pub(crate) fn new(options: &RunOptions) -> Self {
        let mut abbreviations = options.abbreviations.clone();
        // Longest sources first, so overlapping abbreviations apply the
        // most specific replacement.
        abbreviations.sort_by_key(|(from, _)| std::cmp::Reverse(from.len()));
        let write: Box<dyn Fn(Verbosity, &str) + Send> = match &options.output {
            Some(hook) => {
                let hook = hook.clone();
                Box::new(move |verbosity, msg| hook(verbosity, msg))
            }
            None => {
                let flush = options.line_buffering;
                Box::new(move |_verbosity, msg| {
                    use std::io::Write;
                    let stdout = std::io::stdout();
                    let mut handle = stdout.lock();
                    let _ = writeln!(handle, "{msg}");
                    if flush {
                        let _ = handle.flush();
                    }
                })
            }
        };
        Self {
            abbreviations,
            write: Mutex::new(write),
        }
    }

    pub(crate) fn emit(&self, verbosity: Verbosity, msg: &str) {
        let mut msg = msg.to_string();
        for (from, to) in &self.abbreviations {
            if !from.is_empty() {
                msg = msg.replace(from, to);
            }
        }
        let write = self.write.lock();
        (*write)(verbosity, &msg);
    }
}

/// Build-wide state, shared by every action of one `run`
pub(crate) struct Global {
    pub database: Arc<dyn Database>,
    pub pool: Pool,
    pub start: Instant,
    pub rules: Arc<RuleRegistry>,
    pub output: OutputSink,
    pub options: RunOptions,
    /// Finalisers registered by `run_after`, executed in reverse order after
    /// a successful build
    pub after: Mutex<Vec<AfterAction>>,
    /// `(owner, key)` claims recorded by `track_change`: the rule `owner`
    /// says `key` is not tracked by the build
    pub absent: Mutex<Vec<(Key, Key)>>,
    /// First failure observed, kept for the final throw and for progress
    pub first_error: Mutex<Option<StructuredError>>,
    /// Working directory at the start of the build, when lint is on
    pub lint_cwd: Option<PathBuf>,
}

impl Global {
    /// Emit a scheduler diagnostic; the closure only runs at Diagnostic
    /// verbosity
    pub(crate) fn diagnostic(&self, msg: impl FnOnce() -> String) {
        if self.options.verbosity == Verbosity::Diagnostic {
            self.output.emit(Verbosity::Diagnostic, &msg());
        }
    }

    /// Wrap a raw failure with its build context (idempotent)
    ///
    /// In staunch mode the wrapped failure is printed immediately with a
    /// continuation notice, since only the first failure is rethrown at the
    /// end of the run.
    pub(crate) fn annotate(&self, frames: Vec<String>, err: BuildError) -> StructuredError {
        if let BuildError::Structured(structured) = err {
            return structured;
        }
        let structured = StructuredError {
            target: frames
                .last()
                .cloned()
                .unwrap_or_else(|| "Unknown call stack".to_string()),
            stack: frames,
            inner: Arc::new(err),
        };
        if self.options.staunch
            && self.options.verbosity >= Verbosity::Quiet
            && !structured.inner.is_cancelled()
        {
            self.output.emit(
                Verbosity::Quiet,
                &format!("{structured}\nContinuing due to staunch mode"),
            );
        }
        structured
    }

    /// Record a failure; the first one observed is what `run` rethrows
    ///
    /// Outside staunch mode the first failure also cancels the build, so
    /// queued work bails out quickly.
    pub(crate) fn raise_error(&self, err: StructuredError) {
        if err.inner.is_cancelled() {
            return;
        }
        {
            let mut cell = self.first_error.lock();
            if cell.is_none() {
                *cell = Some(err);
            }
        }
        if !self.options.staunch {
            self.pool.cancel();
        }
    }

    /// Seconds since the build started
    pub(crate) fn offset(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

/// Per-action mutable state
///
/// Travels with the action across suspension points; never shared between
/// concurrently running actions.
#[derive(Clone)]
pub(crate) struct Local {
    /// Keys being built on this action's call chain; top is the current one
    pub stack: Stack,
    /// Effective verbosity for output helpers
    pub verbosity: Verbosity,
    /// Dependency groups in `apply` call order
    pub depends: Vec<Depends>,
    /// Time spent suspended, subtracted from the action's reported duration
    pub discount: Duration,
    /// Timed annotations recorded by `traced`
    pub traces: Vec<Trace>,
    /// Keys reported by `track_use` awaiting end-of-rule validation
    pub track_used: Vec<Key>,
    /// Predicates that exempt keys from tracking checks
    pub track_allows: Vec<TrackAllow>,
    /// When set, `apply` is forbidden and this is the reason
    pub block_apply: Option<String>,
}

impl Local {
    pub(crate) fn new(stack: Stack, verbosity: Verbosity) -> Self {
        Self {
            stack,
            verbosity,
            depends: Vec::new(),
            discount: Duration::ZERO,
            traces: Vec::new(),
            track_used: Vec::new(),
            track_allows: Vec::new(),
            block_apply: None,
        }
    }

    /// Copy for a parallel branch: scope travels, mutable records start
    /// empty
    pub(crate) fn branch(&self) -> Self {
        Self {
            stack: self.stack.clone(),
            verbosity: self.verbosity,
            depends: Vec::new(),
            discount: Duration::ZERO,
            traces: Vec::new(),
            track_used: Vec::new(),
            track_allows: self.track_allows.clone(),
            block_apply: self.block_apply.clone(),
        }
    }

    /// Fold finished branch records back in, in branch submission order
    pub(crate) fn merge_branches(&mut self, branches: Vec<Local>) {
        for branch in branches {
            self.depends.extend(branch.depends);
            self.traces.extend(branch.traces);
            self.track_used.extend(branch.track_used);
            self.discount += branch.discount;
        }
    }

    /// All dependency keys recorded so far, flattened across groups
    pub(crate) fn flat_depends(&self) -> impl Iterator<Item = &Key> {
        self.depends.iter().flat_map(|d| d.keys().iter())
    }
}

impl Default for Local {
    fn default() -> Self {
        Self::new(Stack::new(), Verbosity::Normal)
    }
}

/// Handle to a running action: the context rules receive
///
/// Cloning is cheap and shares the same local state; `parallel` is the only
/// operation that forks it.
#[derive(Clone)]
pub struct Action {
    pub(crate) global: Arc<Global>,
    pub(crate) local: Arc<Mutex<Local>>,
}

impl Action {
    pub(crate) fn new(global: Arc<Global>, local: Local) -> Self {
        Self {
            global,
            local: Arc::new(Mutex::new(local)),
        }
    }

    pub(crate) fn with_local<T>(&self, f: impl FnOnce(&mut Local) -> T) -> T {
        f(&mut self.local.lock())
    }

    pub(crate) fn take_local(&self) -> Local {
        std::mem::take(&mut *self.local.lock())
    }

    pub(crate) fn add_discount(&self, waited: Duration) {
        self.local.lock().discount += waited;
    }

    /// The options this build was started with
    pub fn options(&self) -> &RunOptions {
        &self.global.options
    }

    /// Effective verbosity of this action
    pub fn verbosity(&self) -> Verbosity {
        self.local.lock().verbosity
    }

    /// Run a sub-computation at a different verbosity
    pub async fn with_verbosity<T, F, Fut>(&self, verbosity: Verbosity, act: F) -> BuildResult<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = BuildResult<T>>,
    {
        let previous = {
            let mut local = self.local.lock();
            std::mem::replace(&mut local.verbosity, verbosity)
        };
        let result = act(self.clone()).await;
        self.local.lock().verbosity = previous;
        result
    }

    /// Run a sub-computation printing only errors
    pub async fn quietly<T, F, Fut>(&self, act: F) -> BuildResult<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = BuildResult<T>>,
    {
        self.with_verbosity(Verbosity::Quiet, act).await
    }

    pub(crate) fn put_when(&self, level: Verbosity, msg: &str) {
        if self.verbosity() >= level {
            self.global.output.emit(level, msg);
        }
    }

    /// Print a message shown at Quiet verbosity and above
    pub fn put_quiet(&self, msg: &str) {
        self.put_when(Verbosity::Quiet, msg);
    }

    /// Print a message shown at Normal verbosity and above
    pub fn put_normal(&self, msg: &str) {
        self.put_when(Verbosity::Normal, msg);
    }

    /// Print a message shown at Loud verbosity and above
    pub fn put_loud(&self, msg: &str) {
        self.put_when(Verbosity::Loud, msg);
    }

    /// Run a synchronous computation, recording it as a timed trace entry
    ///
    /// The computation holds the worker slot; use resources or `apply` for
    /// anything that should let other work in.
    pub fn traced<T>(&self, message: impl Into<String>, f: impl FnOnce() -> T) -> T {
        let start = self.global.offset();
        let result = f();
        let stop = self.global.offset();
        self.local.lock().traces.push(Trace {
            message: message.into(),
            start,
            stop,
        });
        result
    }

    /// Register a finaliser to run after the build completes successfully
    ///
    /// Finalisers run in reverse registration order.
    pub fn run_after(&self, f: impl FnOnce() + Send + 'static) {
        self.global.after.lock().push(Box::new(f));
    }

    /// Why `apply` is currently forbidden, if it is
    pub(crate) fn blocked_reason(&self) -> Option<String> {
        self.local.lock().block_apply.clone()
    }

    /// Run `fut` with the worker slot released, re-acquiring one afterwards
    pub(crate) async fn suspended<T>(
        &self,
        fut: impl Future<Output = BuildResult<T>>,
    ) -> BuildResult<T> {
        let pool = self.global.pool.clone();
        pool.release_slot();
        let result = fut.await;
        let priority = if result.is_err() {
            Priority::High
        } else {
            Priority::Normal
        };
        pool.acquire_slot(priority).await;
        result
    }
}

/// Convert a panic in user code into an ordinary failure
///
/// Panics must not escape to the pool: an unwound job would leave its fence
/// unsignalled and strand every waiter.
pub(crate) async fn guard_panics<T>(
    fut: impl Future<Output = BuildResult<T>>,
) -> BuildResult<T> {
    use futures::FutureExt;
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let msg = if let Some(text) = panic.downcast_ref::<&str>() {
                (*text).to_string()
            } else if let Some(text) = panic.downcast_ref::<String>() {
                text.clone()
            } else {
                "opaque panic payload".to_string()
            };
            Err(BuildError::UserError(format!("action panicked: {msg}")))
        }
    }
}
