//! Tracking hooks and end-of-rule lint checks
//!
//! External tracers (or careful rule authors) report the keys a rule
//! actually touched; at the end of the rule the engine checks the reports
//! against the recorded dependencies. A rule may also declare keys as
//! deliberately untracked, which the post-build lint pass validates.

use std::sync::Arc;

use crate::action::{Action, TrackAllow};
use crate::error::{BuildError, BuildResult};
use crate::key::{BuildKey, Key};

impl Action {
    /// Report that the rule read `key`
    ///
    /// Silently accepted when `key` is the one being built, is already a
    /// recorded dependency, or matches a `track_allow` predicate; otherwise
    /// it is queued for validation at the end of the rule.
    pub fn track_use<K: BuildKey>(&self, key: K) {
        self.track_use_key(Key::new(key));
    }

    pub(crate) fn track_use_key(&self, key: Key) {
        self.with_local(|local| {
            if local.stack.top() == Some(&key) {
                return;
            }
            let depended = local.flat_depends().any(|dep| *dep == key);
            if depended {
                return;
            }
            let allowed = local.track_allows.iter().any(|pred| pred(&key));
            if allowed {
                return;
            }
            local.track_used.push(key);
        });
    }

    /// Report that the rule wrote `key`
    ///
    /// Accepted when `key` is the one being built or matches a
    /// `track_allow` predicate. Anything else is recorded as a claim that
    /// the key is not tracked by the build, checked by the post-build lint
    /// pass.
    pub fn track_change<K: BuildKey>(&self, key: K) {
        let key = Key::new(key);
        let (accepted, owner) = self.with_local(|local| {
            let accepted = local.stack.top() == Some(&key)
                || local.track_allows.iter().any(|pred| pred(&key));
            (accepted, local.stack.top().cloned())
        });
        if accepted {
            return;
        }
        let owner = owner.unwrap_or_else(|| key.clone());
        self.global.absent.lock().push((owner, key));
    }

    /// Exempt keys matching `pred` from tracking checks in this action
    ///
    /// The predicate only ever matches keys of type `K`; keys of other
    /// types never satisfy it.
    pub fn track_allow<K, F>(&self, pred: F)
    where
        K: BuildKey,
        F: Fn(&K) -> bool + Send + Sync + 'static,
    {
        let erased: TrackAllow =
            Arc::new(move |key: &Key| key.downcast_ref::<K>().map(&pred).unwrap_or(false));
        self.with_local(|local| local.track_allows.push(erased));
    }

    /// End-of-rule validation of `track_use` reports
    ///
    /// Every reported key must have become a dependency of the rule, and
    /// must be a source (nothing was recorded as its dependencies); a
    /// built key that was read before being depended upon is stale data.
    pub(crate) fn track_check_used(&self) -> BuildResult<()> {
        let (used, depends) = self.with_local(|local| {
            (
                local.track_used.clone(),
                local.flat_depends().cloned().collect::<Vec<_>>(),
            )
        });
        let not_depended: Vec<String> = used
            .iter()
            .filter(|key| !depends.contains(key))
            .map(|key| key.to_string())
            .collect();
        if !not_depended.is_empty() {
            return Err(BuildError::LintUsedNotDepended {
                keys: not_depended,
            });
        }
        let built: Vec<String> = used
            .iter()
            .filter(|key| !self.global.database.lookup_dependencies(key).is_empty())
            .map(|key| key.to_string())
            .collect();
        if !built.is_empty() {
            return Err(BuildError::LintDependedAfterUsed { keys: built });
        }
        Ok(())
    }
}
