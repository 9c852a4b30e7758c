//! Finite and throttled resources
//!
//! Resources gate segments of actions that contend for something outside
//! the engine's slot budget: a licence server with a handful of seats, an
//! API with a rate limit, a tool that misbehaves when run concurrently.
//!
//! Two kinds share one opaque handle:
//! - **Finite**: up to `capacity` units held at once. Waiters are served in
//!   submission order with no overtaking, so a large request at the head of
//!   the queue is not starved by small ones behind it.
//! - **Throttle**: a token bucket of `count` tokens; tokens spent by a
//!   holder return `period` after release.
//!
//! Resources carry a creation-order total order. Multi-resource acquisition
//! sorts by it, which removes lock-ordering deadlocks between concurrent
//! actions that each take several resources.

use std::cmp::Ordering as CmpOrdering;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::trace;

use crate::error::{BuildError, BuildResult};

static NEXT_RESOURCE_ID: AtomicU64 = AtomicU64::new(0);

struct Waiter {
    n: usize,
    tx: oneshot::Sender<()>,
}

struct FiniteState {
    available: usize,
    waiters: VecDeque<Waiter>,
}

struct ThrottleState {
    available: usize,
    period: Duration,
    waiters: VecDeque<Waiter>,
}

enum Kind {
    Finite(Mutex<FiniteState>),
    Throttle(Mutex<ThrottleState>),
}

struct ResourceInner {
    id: u64,
    name: String,
    capacity: usize,
    kind: Kind,
}

/// A gating primitive for serialising or rate-limiting action segments
///
/// Cheap to clone; clones refer to the same underlying units.
#[derive(Clone)]
pub struct Resource {
    inner: Arc<ResourceInner>,
}

impl Resource {
    /// A finite resource with `capacity` units
    ///
    /// `capacity` of zero would make every acquire impossible, so it is
    /// rounded up to one.
    pub fn finite(name: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(ResourceInner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                capacity,
                kind: Kind::Finite(Mutex::new(FiniteState {
                    available: capacity,
                    waiters: VecDeque::new(),
                })),
            }),
        }
    }

    /// A throttled resource: `count` tokens, each returning `period` after
    /// the holder releases it
    pub fn throttle(name: impl Into<String>, count: usize, period: Duration) -> Self {
        let count = count.max(1);
        Self {
            inner: Arc::new(ResourceInner {
                id: NEXT_RESOURCE_ID.fetch_add(1, Ordering::Relaxed),
                name: name.into(),
                capacity: count,
                kind: Kind::Throttle(Mutex::new(ThrottleState {
                    available: count,
                    period,
                    waiters: VecDeque::new(),
                })),
            }),
        }
    }

    /// The name given at construction
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Wait until `n` units are held by the caller
    ///
    /// Fails immediately when `n` exceeds the resource's total capacity,
    /// since such a request could never be served.
    pub(crate) async fn acquire(&self, n: usize) -> BuildResult<()> {
        if n > self.inner.capacity {
            return Err(BuildError::ResourceOverCapacity {
                resource: self.inner.name.clone(),
                requested: n,
                capacity: self.inner.capacity,
            });
        }
        if n == 0 {
            return Ok(());
        }
        let rx = {
            let (tx, rx) = oneshot::channel();
            match &self.inner.kind {
                Kind::Finite(state) => {
                    let mut state = state.lock();
                    if state.waiters.is_empty() && state.available >= n {
                        state.available -= n;
                        trace!(resource = %self.inner.name, n, "acquired");
                        return Ok(());
                    }
                    state.waiters.push_back(Waiter { n, tx });
                }
                Kind::Throttle(state) => {
                    let mut state = state.lock();
                    if state.waiters.is_empty() && state.available >= n {
                        state.available -= n;
                        trace!(resource = %self.inner.name, n, "acquired");
                        return Ok(());
                    }
                    state.waiters.push_back(Waiter { n, tx });
                }
            }
            rx
        };
        trace!(resource = %self.inner.name, n, "queued");
        rx.await
            .map_err(|_| BuildError::internal("resource waiter abandoned"))?;
        Ok(())
    }

    /// Return `n` units
    ///
    /// Finite units become available immediately; throttle tokens return
    /// after the configured period.
    pub(crate) fn release(&self, n: usize) {
        if n == 0 {
            return;
        }
        match &self.inner.kind {
            Kind::Finite(state) => {
                let mut state = state.lock();
                state.available = (state.available + n).min(self.inner.capacity);
                let FiniteState { available, waiters } = &mut *state;
                Self::grant(available, waiters);
            }
            Kind::Throttle(state) => {
                let period = state.lock().period;
                let resource = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(period).await;
                    if let Kind::Throttle(state) = &resource.inner.kind {
                        let mut state = state.lock();
                        state.available = (state.available + n).min(resource.inner.capacity);
                        let ThrottleState { available, waiters, .. } = &mut *state;
                        Self::grant(available, waiters);
                    }
                });
            }
        }
        trace!(resource = %self.inner.name, n, "released");
    }

    /// Serve queued requests head-first while they fit
    fn grant(available: &mut usize, waiters: &mut VecDeque<Waiter>) {
        while let Some(head) = waiters.front() {
            if head.n > *available {
                break;
            }
            let Some(waiter) = waiters.pop_front() else { break };
            if waiter.tx.send(()).is_ok() {
                *available -= waiter.n;
            }
        }
    }

}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Resource {}

impl PartialOrd for Resource {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Resource {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.inner.id.cmp(&other.inner.id)
    }
}

impl Hash for Resource {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({})", self.inner.name)
    }
}

/// Releases held units on drop, so failures inside the guarded segment
/// cannot leak the resource
pub(crate) struct ResourceGuard {
    resource: Resource,
    n: usize,
}

impl ResourceGuard {
    pub(crate) fn new(resource: Resource, n: usize) -> Self {
        Self { resource, n }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        self.resource.release(self.n);
    }
}

impl crate::action::Action {
    /// Run a sub-action while holding `n` units of `resource`
    ///
    /// The wait for the units happens with the worker slot released and is
    /// discounted from this action's reported time. Inside the sub-action
    /// `apply` is forbidden: introducing dependencies while holding a
    /// resource can deadlock against other holders. The units are released
    /// on every exit path.
    pub async fn with_resource<T, F, Fut>(
        &self,
        resource: &Resource,
        n: usize,
        act: F,
    ) -> BuildResult<T>
    where
        F: FnOnce(crate::action::Action) -> Fut,
        Fut: std::future::Future<Output = BuildResult<T>>,
    {
        self.global.diagnostic(|| {
            format!("waiting to acquire {n} from resource {}", resource.name())
        });
        let started = std::time::Instant::now();
        self.suspended(resource.acquire(n)).await?;
        self.add_discount(started.elapsed());
        self.global
            .diagnostic(|| format!("acquired {n} from resource {}", resource.name()));
        let guard = ResourceGuard::new(resource.clone(), n);
        let previous = self.with_local(|local| {
            local
                .block_apply
                .replace(format!("within with_resource applied to {}", resource.name()))
        });
        let result = act(self.clone()).await;
        self.with_local(|local| local.block_apply = previous);
        drop(guard);
        self.global
            .diagnostic(|| format!("released {n} from resource {}", resource.name()));
        result
    }

    /// Run a sub-action while holding several resources at once
    ///
    /// Requests are grouped per resource and summed, then acquired in the
    /// resources' creation order. Every concurrent caller acquiring through
    /// here takes overlapping resources in the same order, so no
    /// lock-ordering deadlock can form.
    pub async fn with_resources<T, F, Fut>(
        &self,
        requests: &[(Resource, usize)],
        act: F,
    ) -> BuildResult<T>
    where
        F: FnOnce(crate::action::Action) -> Fut,
        Fut: std::future::Future<Output = BuildResult<T>>,
    {
        let mut grouped: std::collections::BTreeMap<Resource, usize> =
            std::collections::BTreeMap::new();
        for (resource, n) in requests {
            *grouped.entry(resource.clone()).or_insert(0) += n;
        }
        let mut guards = Vec::with_capacity(grouped.len());
        for (resource, n) in &grouped {
            self.global.diagnostic(|| {
                format!("waiting to acquire {n} from resource {}", resource.name())
            });
            let started = std::time::Instant::now();
            self.suspended(resource.acquire(*n)).await?;
            self.add_discount(started.elapsed());
            self.global
                .diagnostic(|| format!("acquired {n} from resource {}", resource.name()));
            guards.push(ResourceGuard::new(resource.clone(), *n));
        }
        let names: Vec<&str> = grouped.keys().map(|r| r.name()).collect();
        let previous = self.with_local(|local| {
            local.block_apply.replace(format!(
                "within with_resources applied to {}",
                names.join(", ")
            ))
        });
        let result = act(self.clone()).await;
        self.with_local(|local| local.block_apply = previous);
        drop(guards);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn over_capacity_requests_fail_fast() {
        let r = Resource::finite("compiler", 2);
        let err = r.acquire(3).await.unwrap_err();
        assert!(matches!(err, BuildError::ResourceOverCapacity { .. }));
    }

    #[tokio::test]
    async fn finite_waiters_are_served_in_order_without_overtaking() {
        let r = Resource::finite("seats", 2);
        r.acquire(2).await.unwrap();

        let r1 = r.clone();
        let big = tokio::spawn(async move { r1.acquire(2).await.unwrap() });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let r2 = r.clone();
        let small = tokio::spawn(async move { r2.acquire(1).await.unwrap() });

        // One unit back: the queued big request must keep the small one
        // behind it waiting.
        r.release(1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!big.is_finished());
        assert!(!small.is_finished());

        r.release(1);
        big.await.unwrap();
        r.release(2);
        small.await.unwrap();
    }

    #[tokio::test]
    async fn throttle_tokens_return_after_the_period() {
        let r = Resource::throttle("api", 1, Duration::from_millis(50));
        let start = Instant::now();
        r.acquire(1).await.unwrap();
        r.release(1);
        r.acquire(1).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(45));
        r.release(1);
    }
}
