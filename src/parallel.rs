//! Structured sub-action parallelism
//!
//! `parallel` forks an action into branches scheduled through the pool,
//! `order_only` runs a sub-action whose dependencies are not recorded, and
//! `extra_thread` runs a slot-hungry segment with the pool limit raised by
//! one.

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::action::{Action, Local};
use crate::error::{BuildError, BuildResult};
use crate::pool::Priority;

struct ParallelState<T> {
    remaining: usize,
    cancelled: bool,
    results: Vec<Option<(Local, T)>>,
    sender: Option<oneshot::Sender<BuildResult<(Vec<Local>, Vec<T>)>>>,
}

impl Action {
    /// Run sub-actions in parallel, returning their results in submission
    /// order
    ///
    /// Each branch gets a copy of this action's scope with empty records;
    /// on success the branches' dependencies, traces and tracking reports
    /// merge back in submission order. The first branch to fail (in
    /// completion order) becomes the error, and branches that have not
    /// started yet are abandoned.
    pub async fn parallel<T, F, Fut>(&self, acts: Vec<F>) -> BuildResult<Vec<T>>
    where
        T: Send + 'static,
        F: FnOnce(Action) -> Fut + Send + 'static,
        Fut: Future<Output = BuildResult<T>> + Send + 'static,
    {
        let count = acts.len();
        if count == 0 {
            return Ok(Vec::new());
        }
        if count == 1 {
            let mut acts = acts;
            let act = acts
                .pop()
                .ok_or_else(|| BuildError::internal("singleton parallel lost its action"))?;
            // A single branch runs in place, sharing this action's record.
            let value = act(self.clone()).await?;
            return Ok(vec![value]);
        }

        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(Mutex::new(ParallelState {
            remaining: count,
            cancelled: false,
            results: (0..count).map(|_| None).collect(),
            sender: Some(tx),
        }));

        for (index, act) in acts.into_iter().enumerate() {
            let branch = Action::new(self.global.clone(), self.with_local(|local| local.branch()));
            let shared = shared.clone();
            let pool = self.global.pool.clone();
            self.global.pool.spawn(async move {
                {
                    let mut state = shared.lock();
                    if state.cancelled || pool.is_cancelled() {
                        state.cancelled = true;
                        if let Some(tx) = state.sender.take() {
                            let _ = tx.send(Err(BuildError::Cancelled));
                        }
                        return;
                    }
                }
                let result = crate::action::guard_panics(act(branch.clone())).await;
                let local = branch.take_local();
                let mut state = shared.lock();
                match result {
                    Ok(value) => {
                        state.results[index] = Some((local, value));
                        state.remaining -= 1;
                        if state.remaining == 0 {
                            let slots = std::mem::take(&mut state.results);
                            let mut locals = Vec::with_capacity(count);
                            let mut values = Vec::with_capacity(count);
                            for slot in slots.into_iter().flatten() {
                                locals.push(slot.0);
                                values.push(slot.1);
                            }
                            if let Some(tx) = state.sender.take() {
                                let outcome = if locals.len() == count {
                                    Ok((locals, values))
                                } else {
                                    Err(BuildError::internal("parallel branch result went missing"))
                                };
                                let _ = tx.send(outcome);
                            }
                        }
                    }
                    Err(err) => {
                        state.cancelled = true;
                        if let Some(tx) = state.sender.take() {
                            let _ = tx.send(Err(err));
                        }
                    }
                }
            });
        }

        let (locals, values) = self
            .suspended(async {
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(BuildError::internal("parallel branches vanished")),
                }
            })
            .await?;
        self.with_local(|local| local.merge_branches(locals));
        Ok(values)
    }

    /// Run a sub-action whose dependencies are not recorded
    ///
    /// Whatever the sub-action builds gets built, but this action's
    /// dependency record is restored afterwards. Traces, discount and
    /// tracking state are kept.
    pub async fn order_only<T, F, Fut>(&self, act: F) -> BuildResult<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = BuildResult<T>>,
    {
        let before = self.with_local(|local| local.depends.len());
        let result = act(self.clone()).await;
        self.with_local(|local| local.depends.truncate(before));
        result
    }

    /// Run a sub-action with the pool limit raised by one
    ///
    /// For segments that burn a thread outside the pool's control (a
    /// blocking external process, say). `apply` is forbidden inside. After
    /// the limit is restored the action re-enters the queue, at high
    /// priority when the sub-action failed.
    pub async fn extra_thread<T, F, Fut>(&self, act: F) -> BuildResult<T>
    where
        F: FnOnce(Action) -> Fut,
        Fut: Future<Output = BuildResult<T>>,
    {
        let capacity = self.global.pool.increase();
        let previous = self.with_local(|local| {
            local
                .block_apply
                .replace("within extra_thread".to_string())
        });
        let result = act(self.clone()).await;
        self.with_local(|local| local.block_apply = previous);
        drop(capacity);
        let pool = self.global.pool.clone();
        pool.release_slot();
        let priority = if result.is_err() {
            Priority::High
        } else {
            Priority::Normal
        };
        pool.acquire_slot(priority).await;
        result
    }
}
