//! One-shot promise used for memoised results
//!
//! A fence starts unresolved, accepts exactly one signal, and fans the
//! signalled value out to every waiter, past and future. The in-memory
//! database and the [`Cache`](crate::Cache) both use fences to hand one
//! builder's result to all concurrent demanders of the same key.

use parking_lot::Mutex;
use tokio::sync::oneshot;

enum State<T> {
    Pending(Vec<oneshot::Sender<T>>),
    Done(T),
}

/// A single-assignment cell with non-blocking test and async wait
pub struct Fence<T> {
    state: Mutex<State<T>>,
}

impl<T: Clone + Send + 'static> Fence<T> {
    /// A fresh, unresolved fence
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::Pending(Vec::new())),
        }
    }

    /// The resolved value, without waiting
    pub fn test(&self) -> Option<T> {
        match &*self.state.lock() {
            State::Pending(_) => None,
            State::Done(value) => Some(value.clone()),
        }
    }

    /// Wait for resolution
    ///
    /// Returns `None` only if the signalling side disappeared without ever
    /// resolving the fence, which the engine treats as an internal error.
    pub async fn wait(&self) -> Option<T> {
        let rx = {
            let mut state = self.state.lock();
            match &mut *state {
                State::Done(value) => return Some(value.clone()),
                State::Pending(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    rx
                }
            }
        };
        rx.await.ok()
    }

    /// Resolve the fence, waking every waiter
    ///
    /// A fence is signalled exactly once; a second signal is an engine bug.
    pub fn signal(&self, value: T) {
        let waiters = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, State::Done(value.clone())) {
                State::Pending(waiters) => waiters,
                State::Done(_) => {
                    debug_assert!(false, "fence signalled twice");
                    return;
                }
            }
        };
        for tx in waiters {
            // A waiter that stopped listening is fine to skip.
            let _ = tx.send(value.clone());
        }
    }
}

impl<T: Clone + Send + 'static> Default for Fence<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_before_wait_delivers_immediately() {
        let fence = Fence::new();
        fence.signal(7usize);
        assert_eq!(fence.test(), Some(7));
        assert_eq!(fence.wait().await, Some(7));
    }

    #[tokio::test]
    async fn all_waiters_observe_the_single_signal() {
        let fence = Arc::new(Fence::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let fence = fence.clone();
            handles.push(tokio::spawn(async move { fence.wait().await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fence.test(), None);
        fence.signal("done".to_string());
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Some("done".to_string()));
        }
    }
}
