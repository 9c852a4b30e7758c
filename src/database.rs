//! The build database contract and an in-memory implementation
//!
//! The scheduler never decides staleness or stores values itself; it hands
//! the database an [`BuildOps`] triple (`stored`, `equal`, `exec`) and asks
//! it to `build` a list of keys. The database owns memoisation across
//! concurrent demands, cycle detection against the demanding stack, and
//! dependency bookkeeping.
//!
//! [`MemoryDatabase`] is the bundled non-persistent implementation: every
//! key is built at most once per run, concurrent demands share one
//! execution through a fence, and nothing survives the process. Durable
//! storage plugs in through the same trait.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::debug;

use crate::error::{BuildError, BuildResult};
use crate::fence::Fence;
use crate::key::{Depends, Key, Stack, Trace, Value};
use crate::pool::Pool;

/// Handler for recovering a key's current value from the world
pub type StoredFn = Arc<dyn Fn(&Key) -> Option<Value> + Send + Sync>;
/// Handler deciding whether a recovered value still matches a built one
pub type EqualFn = Arc<dyn Fn(&Key, &Value, &Value) -> bool + Send + Sync>;
/// Handler that actually executes a key's rule on a fresh action
pub type ExecFn =
    Arc<dyn Fn(Stack, Key) -> BoxFuture<'static, BuildResult<BuiltResult>> + Send + Sync>;

/// The callback triple the scheduler hands to [`Database::build`]
pub struct BuildOps {
    /// Recover a key's current value, `None` when absent
    pub stored: StoredFn,
    /// Compare a built value against a recovered one
    pub equal: EqualFn,
    /// Execute the rule for one key
    pub exec: ExecFn,
}

/// What executing one rule produced
#[derive(Clone)]
pub struct BuiltResult {
    /// The value the rule returned
    pub value: Value,
    /// Dependency groups recorded during execution, in `apply` order
    pub depends: Vec<Depends>,
    /// Wall time charged to the rule, with suspension waits subtracted
    pub duration: Duration,
    /// Timed annotations recorded by `traced`
    pub traces: Vec<Trace>,
}

/// Database-side progress counters, polled by the progress reporter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressCounts {
    /// Keys built successfully so far
    pub done: usize,
    /// Keys currently executing or queued
    pub building: usize,
    /// Keys whose rule failed
    pub failed: usize,
}

/// The persistent key/value store the scheduler drives
#[async_trait]
pub trait Database: Send + Sync {
    /// Bring `keys` up to date and return the elapsed duration, the
    /// dependency record for this demand, and the values in key order
    ///
    /// `stack` is the demanding action's chain, used for cycle detection.
    async fn build(
        &self,
        pool: &Pool,
        ops: &BuildOps,
        stack: &Stack,
        keys: Vec<Key>,
    ) -> BuildResult<(Duration, Depends, Vec<Value>)>;

    /// Expand one dependency group to its keys
    fn list_depends(&self, depends: &Depends) -> Vec<Key>;

    /// The direct dependencies recorded for `key`, flattened
    fn lookup_dependencies(&self, key: &Key) -> Vec<Key>;

    /// Post-build lint validation: stored values still match, and no key
    /// claimed untracked was actually built
    async fn check_valid(&self, ops: &BuildOps, absent: &[(Key, Key)]) -> BuildResult<()>;

    /// Keys that participated in this run
    fn list_live(&self) -> Vec<Key>;

    /// A JSON description of the run, for report files
    fn to_report(&self) -> serde_json::Value;

    /// Verify no key was left mid-build
    fn assert_finished(&self) -> BuildResult<()>;

    /// Current progress counters
    fn progress(&self) -> ProgressCounts;
}

#[derive(Clone)]
struct StoredEntry {
    value: Value,
    depends: Vec<Key>,
    duration: Duration,
}

enum KeyState {
    Building(Arc<Fence<BuildResult<Value>>>),
    Done(StoredEntry),
    Failed(BuildError),
}

#[derive(Default)]
struct DbInner {
    state: DashMap<Key, KeyState>,
    done: AtomicUsize,
    building: AtomicUsize,
    failed: AtomicUsize,
}

/// Non-persistent database: memoises within one run only
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    inner: Arc<DbInner>,
}

impl MemoryDatabase {
    /// An empty database
    pub fn new() -> Self {
        Self::default()
    }

    fn store_done(&self, key: Key, built: &BuiltResult) {
        let depends = built
            .depends
            .iter()
            .flat_map(|d| d.keys().iter().cloned())
            .collect();
        self.inner.state.insert(
            key,
            KeyState::Done(StoredEntry {
                value: built.value.clone(),
                depends,
                duration: built.duration,
            }),
        );
        self.inner.building.fetch_sub(1, Ordering::Relaxed);
        self.inner.done.fetch_add(1, Ordering::Relaxed);
    }

    fn store_failed(&self, key: Key, err: BuildError) {
        self.inner.state.insert(key, KeyState::Failed(err));
        self.inner.building.fetch_sub(1, Ordering::Relaxed);
        self.inner.failed.fetch_add(1, Ordering::Relaxed);
    }
}

enum Plan {
    Ready(Value),
    Broken(BuildError),
    Wait(Arc<Fence<BuildResult<Value>>>),
}

#[async_trait]
impl Database for MemoryDatabase {
    async fn build(
        &self,
        pool: &Pool,
        ops: &BuildOps,
        stack: &Stack,
        keys: Vec<Key>,
    ) -> BuildResult<(Duration, Depends, Vec<Value>)> {
        let started = Instant::now();
        for key in &keys {
            if stack.contains(key) {
                let mut chain = stack.render();
                chain.push(key.to_string());
                return Err(BuildError::CycleDetected { keys: chain });
            }
        }

        let mut plans = Vec::with_capacity(keys.len());
        for key in &keys {
            let plan = match self.inner.state.entry(key.clone()) {
                Entry::Occupied(entry) => match entry.get() {
                    KeyState::Done(stored) => Plan::Ready(stored.value.clone()),
                    KeyState::Failed(err) => Plan::Broken(err.clone()),
                    KeyState::Building(fence) => Plan::Wait(fence.clone()),
                },
                Entry::Vacant(vacant) => {
                    let fence = Arc::new(Fence::new());
                    vacant.insert(KeyState::Building(fence.clone()));
                    self.inner.building.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "building");
                    let job = (ops.exec)(stack.push(key.clone()), key.clone());
                    let db = self.clone();
                    let key = key.clone();
                    let job_fence = fence.clone();
                    pool.spawn(async move {
                        let outcome = match job.await {
                            Ok(built) => {
                                let value = built.value.clone();
                                db.store_done(key, &built);
                                Ok(value)
                            }
                            Err(err) => {
                                db.store_failed(key, err.clone());
                                Err(err)
                            }
                        };
                        job_fence.signal(outcome);
                    });
                    Plan::Wait(fence)
                }
            };
            plans.push(plan);
        }

        let waits = plans.into_iter().map(|plan| async move {
            match plan {
                Plan::Ready(value) => Ok(value),
                Plan::Broken(err) => Err(err),
                Plan::Wait(fence) => fence
                    .wait()
                    .await
                    .ok_or_else(|| BuildError::internal("build fence abandoned"))?,
            }
        });
        let values = futures::future::try_join_all(waits).await?;

        Ok((started.elapsed(), Depends::new(keys), values))
    }

    fn list_depends(&self, depends: &Depends) -> Vec<Key> {
        depends.keys().to_vec()
    }

    fn lookup_dependencies(&self, key: &Key) -> Vec<Key> {
        match self.inner.state.get(key).as_deref() {
            Some(KeyState::Done(stored)) => stored.depends.clone(),
            _ => Vec::new(),
        }
    }

    async fn check_valid(&self, ops: &BuildOps, absent: &[(Key, Key)]) -> BuildResult<()> {
        for entry in self.inner.state.iter() {
            if let KeyState::Done(stored) = entry.value() {
                if let Some(now) = (ops.stored)(entry.key()) {
                    if !(ops.equal)(entry.key(), &stored.value, &now) {
                        return Err(BuildError::LintFailure(format!(
                            "key {} changed since it was built",
                            entry.key()
                        )));
                    }
                }
            }
        }
        for (owner, key) in absent {
            if self.inner.state.contains_key(key) {
                return Err(BuildError::LintFailure(format!(
                    "rule {owner} claimed {key} is untracked, but the build tracks it"
                )));
            }
        }
        Ok(())
    }

    fn list_live(&self) -> Vec<Key> {
        self.inner
            .state
            .iter()
            .filter(|entry| matches!(entry.value(), KeyState::Done(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    fn to_report(&self) -> serde_json::Value {
        let entries: Vec<serde_json::Value> = self
            .inner
            .state
            .iter()
            .filter_map(|entry| match entry.value() {
                KeyState::Done(stored) => Some(json!({
                    "key": entry.key().to_string(),
                    "seconds": stored.duration.as_secs_f64(),
                    "depends": stored.depends.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
                })),
                _ => None,
            })
            .collect();
        json!({ "keys": entries })
    }

    fn assert_finished(&self) -> BuildResult<()> {
        let unfinished: Vec<String> = self
            .inner
            .state
            .iter()
            .filter(|entry| matches!(entry.value(), KeyState::Building(_)))
            .map(|entry| entry.key().to_string())
            .collect();
        if unfinished.is_empty() {
            Ok(())
        } else {
            Err(BuildError::internal(format!(
                "keys left mid-build: {}",
                unfinished.join(", ")
            )))
        }
    }

    fn progress(&self) -> ProgressCounts {
        ProgressCounts {
            done: self.inner.done.load(Ordering::Relaxed),
            building: self.inner.building.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }
}
