//! Progress reporting
//!
//! When a progress hook is configured, a dedicated reporter task ticks it
//! once immediately and then once a second with fresh snapshots until the
//! build finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::action::Global;

/// A snapshot of build progress, delivered to the progress hook
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Keys built successfully so far
    pub done: usize,
    /// Keys currently executing or queued
    pub building: usize,
    /// Keys whose rule failed
    pub failed: usize,
    /// Target of the first recorded failure, if any
    pub failure: Option<String>,
}

pub(crate) fn start_reporter(global: &Arc<Global>) -> Option<JoinHandle<()>> {
    let hook = global.options.progress.clone()?;
    let global = global.clone();
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            let counts = global.database.progress();
            let failure = global
                .first_error
                .lock()
                .as_ref()
                .map(|err| err.target.clone());
            hook(Progress {
                done: counts.done,
                building: counts.building,
                failed: counts.failed,
                failure,
            });
        }
    }))
}
