//! Per-key memoised sub-actions with dependency replay
//!
//! A [`Cache`] wraps an action-valued function so that each key is computed
//! at most once per cache instance, no matter how many actions demand it
//! concurrently. Dependencies discovered by the one real run are replayed
//! into every caller's record, so caching never hides edges from the build
//! graph.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::action::Action;
use crate::error::{BuildError, BuildResult};
use crate::fence::Fence;
use crate::key::Depends;

type CacheFence<V> = Arc<Fence<BuildResult<(Vec<Depends>, V)>>>;

/// A memoised action-valued function
///
/// Cheap to clone; clones share the same memo table. Distinct `Cache`
/// instances are fully independent, even for the same key type.
pub struct Cache<K, V> {
    map: Arc<DashMap<K, CacheFence<V>>>,
    run: Arc<dyn Fn(Action, K) -> BoxFuture<'static, BuildResult<V>> + Send + Sync>,
}

impl<K, V> Clone for Cache<K, V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
            run: self.run.clone(),
        }
    }
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Wrap `f` in a fresh memo table
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Action, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BuildResult<V>> + Send + 'static,
    {
        Self {
            map: Arc::new(DashMap::new()),
            run: Arc::new(move |action, key| Box::pin(f(action, key))),
        }
    }

    /// The memoised computation for `key`
    ///
    /// The first caller runs the wrapped function; everyone else waits on
    /// its fence (worker slot released, wait time discounted) and replays
    /// the dependency groups the run recorded.
    pub async fn get(&self, action: &Action, key: K) -> BuildResult<V> {
        enum Role<V> {
            Run(CacheFence<V>),
            Wait(CacheFence<V>),
        }
        let role = match self.map.entry(key.clone()) {
            Entry::Occupied(entry) => Role::Wait(entry.get().clone()),
            Entry::Vacant(vacant) => {
                let fence = Arc::new(Fence::new());
                vacant.insert(fence.clone());
                Role::Run(fence)
            }
        };
        match role {
            Role::Run(fence) => {
                let before = action.with_local(|local| local.depends.len());
                match crate::action::guard_panics((self.run)(action.clone(), key)).await {
                    Ok(value) => {
                        let delta = action.with_local(|local| {
                            local.depends.get(before..).map(<[_]>::to_vec).unwrap_or_default()
                        });
                        fence.signal(Ok((delta, value.clone())));
                        Ok(value)
                    }
                    Err(err) => {
                        fence.signal(Err(err.clone()));
                        Err(err)
                    }
                }
            }
            Role::Wait(fence) => {
                let resolved = match fence.test() {
                    Some(resolved) => resolved,
                    None => {
                        let started = Instant::now();
                        let resolved = action
                            .suspended(async {
                                match fence.wait().await {
                                    Some(resolved) => resolved,
                                    None => {
                                        Err(BuildError::internal("cache fence abandoned"))
                                    }
                                }
                            })
                            .await;
                        action.add_discount(started.elapsed());
                        resolved
                    }
                };
                let (depends, value) = resolved?;
                action.with_local(|local| local.depends.extend(depends));
                Ok(value)
            }
        }
    }
}
