//! Rule registration and top-level actions
//!
//! A [`Rules`] value is the consumed surface of the rules DSL: a set of
//! top-level actions to run plus, per key type, the handlers the scheduler
//! needs at run time (`execute`, `stored`, `equal`). Handlers are stored
//! erased; the typed registration functions build the erasure shims.

use std::any::TypeId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::action::Action;
use crate::error::{BuildError, BuildResult};
use crate::key::{BuildKey, Key, Value};

pub(crate) type RuleExecute =
    Arc<dyn Fn(Action, Key) -> BoxFuture<'static, BuildResult<Value>> + Send + Sync>;
pub(crate) type RuleStored = Arc<dyn Fn(&Key) -> Option<Value> + Send + Sync>;
pub(crate) type RuleEqual = Arc<dyn Fn(&Key, &Value, &Value) -> bool + Send + Sync>;
pub(crate) type TopAction = Box<dyn FnOnce(Action) -> BoxFuture<'static, BuildResult<()>> + Send>;

/// Run-time handlers for one key type
pub(crate) struct RuleInfo {
    pub execute: RuleExecute,
    pub stored: RuleStored,
    pub equal: RuleEqual,
    pub result_type: TypeId,
    pub result_type_name: &'static str,
    pub file_key: bool,
}

/// Rule lookup by erased key type tag
pub(crate) struct RuleRegistry {
    rules: HashMap<TypeId, RuleInfo>,
}

impl RuleRegistry {
    pub fn get(&self, key: &Key) -> Option<&RuleInfo> {
        self.rules.get(&key.type_id())
    }

    pub fn get_by_type(&self, type_id: TypeId) -> Option<&RuleInfo> {
        self.rules.get(&type_id)
    }
}

/// Top-level actions plus the rule registry, ready to be run
///
/// Registering a second rule for the same key type replaces the first.
#[derive(Default)]
pub struct Rules {
    actions: Vec<TopAction>,
    rules: HashMap<TypeId, RuleInfo>,
}

impl Rules {
    /// An empty rule set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a top-level action, run when the build starts
    pub fn action<F, Fut>(&mut self, act: F)
    where
        F: FnOnce(Action) -> Fut + Send + 'static,
        Fut: Future<Output = BuildResult<()>> + Send + 'static,
    {
        self.actions
            .push(Box::new(move |action| Box::pin(act(action))));
    }

    /// Register a rule for key type `K`
    ///
    /// The rule has no stored-value check (keys of this type rebuild on
    /// first demand every run) and compares values by equality.
    pub fn add_rule<K, F, Fut>(&mut self, run: F)
    where
        K: BuildKey,
        F: Fn(Action, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BuildResult<K::Value>> + Send + 'static,
    {
        self.add_rule_full::<K, _, _, _, _>(false, |_| None, |_, a, b| a == b, run);
    }

    /// Register a rule with explicit `stored` and `equal` handlers
    ///
    /// `stored` recovers the current value of a key from the world (`None`
    /// when absent), `equal` decides whether a recovered value still matches
    /// a built one, and `file_key` marks the key type for the live-file
    /// listing.
    pub fn add_rule_full<K, S, E, F, Fut>(&mut self, file_key: bool, stored: S, equal: E, run: F)
    where
        K: BuildKey,
        S: Fn(&K) -> Option<K::Value> + Send + Sync + 'static,
        E: Fn(&K, &K::Value, &K::Value) -> bool + Send + Sync + 'static,
        F: Fn(Action, K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = BuildResult<K::Value>> + Send + 'static,
    {
        let run = Arc::new(run);
        let execute: RuleExecute = Arc::new(move |action: Action, key: Key| {
            let run = run.clone();
            Box::pin(async move {
                let typed = key.downcast_ref::<K>().cloned().ok_or_else(|| {
                    BuildError::internal(format!("key {key} dispatched to a rule of another type"))
                })?;
                run(action, typed).await.map(Value::new)
            })
        });
        let stored: RuleStored = Arc::new(move |key: &Key| {
            key.downcast_ref::<K>().and_then(&stored).map(Value::new)
        });
        let equal: RuleEqual = Arc::new(move |key: &Key, a: &Value, b: &Value| {
            match (
                key.downcast_ref::<K>(),
                a.downcast_ref::<K::Value>(),
                b.downcast_ref::<K::Value>(),
            ) {
                (Some(key), Some(a), Some(b)) => equal(key, a, b),
                _ => false,
            }
        });
        self.rules.insert(
            TypeId::of::<K>(),
            RuleInfo {
                execute,
                stored,
                equal,
                result_type: TypeId::of::<K::Value>(),
                result_type_name: std::any::type_name::<K::Value>(),
                file_key,
            },
        );
    }

    /// Number of registered top-level actions
    pub fn action_count(&self) -> usize {
        self.actions.len()
    }

    pub(crate) fn into_parts(self) -> (Vec<TopAction>, RuleRegistry) {
        (self.actions, RuleRegistry { rules: self.rules })
    }
}
