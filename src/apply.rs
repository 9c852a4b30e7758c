//! Demanding keys: dependency recording and rule execution
//!
//! `apply` is the one place dependencies enter the graph. It validates the
//! demanded key type against the registry, suspends the calling action,
//! and asks the database to bring the keys up to date. The database calls
//! back into [`build_ops`]'s `exec` for keys that actually need building;
//! `exec` runs the rule on a fresh local with the extended stack.

use std::any::TypeId;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::action::{Action, Global, Local};
use crate::database::{BuildOps, BuiltResult, EqualFn, ExecFn, StoredFn};
use crate::error::{BuildError, BuildResult};
use crate::key::{BuildKey, Key, Stack, Value};
use crate::options::{Lint, Verbosity};

impl Action {
    /// Demand a list of keys of one type, returning their values in order
    ///
    /// Missing and stale keys are built (in parallel where possible); the
    /// whole group is recorded as one dependency of this action.
    pub async fn apply<K: BuildKey>(&self, keys: Vec<K>) -> BuildResult<Vec<K::Value>> {
        if let Some(reason) = self.blocked_reason() {
            return Err(BuildError::NoApplyHere(reason));
        }
        let erased: Vec<Key> = keys.into_iter().map(Key::new).collect();
        match self.global.rules.get_by_type(TypeId::of::<K>()) {
            None => {
                return Err(BuildError::NoRuleToBuild {
                    key: erased
                        .first()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| format!("<{}>", std::any::type_name::<K>())),
                    result_type: Some(std::any::type_name::<K::Value>().to_string()),
                });
            }
            Some(info) if info.result_type != TypeId::of::<K::Value>() => {
                return Err(BuildError::RuleTypeMismatch {
                    key: erased
                        .first()
                        .map(|k| k.to_string())
                        .unwrap_or_else(|| format!("<{}>", std::any::type_name::<K>())),
                    declared: std::any::type_name::<K::Value>().to_string(),
                    registered: info.result_type_name.to_string(),
                });
            }
            Some(_) => {}
        }
        let values = self.apply_key_value(erased).await?;
        let mut typed = Vec::with_capacity(values.len());
        for value in values {
            typed.push(value.downcast_clone::<K::Value>().ok_or_else(|| {
                BuildError::internal(format!(
                    "value of type {} delivered where {} was expected",
                    value.type_name(),
                    std::any::type_name::<K::Value>()
                ))
            })?);
        }
        Ok(typed)
    }

    /// Demand a single key
    pub async fn apply1<K: BuildKey>(&self, key: K) -> BuildResult<K::Value> {
        let mut values = self.apply(vec![key]).await?;
        values
            .pop()
            .ok_or_else(|| BuildError::internal("apply of one key delivered no value"))
    }

    /// Erased demand: suspend, build through the database, record the
    /// dependency group and the discount
    pub(crate) async fn apply_key_value(&self, keys: Vec<Key>) -> BuildResult<Vec<Value>> {
        let ops = build_ops(&self.global);
        let stack = self.with_local(|local| local.stack.clone());
        let database = self.global.database.clone();
        let pool = self.global.pool.clone();
        let (duration, depends, values) = self
            .suspended(async { database.build(&pool, &ops, &stack, keys).await })
            .await?;
        self.with_local(|local| {
            local.discount += duration;
            local.depends.push(depends);
        });
        Ok(values)
    }
}

/// The callback triple handed to the database for one demand
pub(crate) fn build_ops(global: &Arc<Global>) -> BuildOps {
    let stored: StoredFn = {
        let rules = global.rules.clone();
        Arc::new(move |key: &Key| rules.get(key).and_then(|info| (info.stored)(key)))
    };
    let equal: EqualFn = {
        let rules = global.rules.clone();
        Arc::new(move |key: &Key, built: &Value, now: &Value| {
            rules
                .get(key)
                .map(|info| (info.equal)(key, built, now))
                .unwrap_or(false)
        })
    };
    let exec: ExecFn = {
        let global = global.clone();
        Arc::new(move |stack: Stack, key: Key| {
            let global = global.clone();
            Box::pin(async move { exec_key(global, stack, key).await })
        })
    };
    BuildOps {
        stored,
        equal,
        exec,
    }
}

/// Execute the rule for one key on a fresh local
async fn exec_key(global: Arc<Global>, stack: Stack, key: Key) -> BuildResult<BuiltResult> {
    if global.pool.is_cancelled() {
        return Err(BuildError::Cancelled);
    }
    let started = Instant::now();
    let action = Action::new(
        global.clone(),
        Local::new(stack.clone(), global.options.verbosity),
    );
    debug!(key = %key, "executing rule");
    match crate::action::guard_panics(run_rule(&action, &key)).await {
        Ok(value) => {
            let local = action.take_local();
            Ok(BuiltResult {
                value,
                depends: local.depends,
                duration: started.elapsed().saturating_sub(local.discount),
                traces: local.traces,
            })
        }
        Err(err) => Err(BuildError::Structured(global.annotate(stack.render(), err))),
    }
}

async fn run_rule(action: &Action, key: &Key) -> BuildResult<Value> {
    action.put_when(Verbosity::Chatty, &format!("# {key}"));
    let execute = action
        .global
        .rules
        .get(key)
        .map(|info| info.execute.clone())
        .ok_or_else(|| BuildError::NoRuleToBuild {
            key: key.to_string(),
            result_type: None,
        })?;
    let value = execute(action.clone(), key.clone()).await?;
    if action.global.options.lint == Some(Lint::FsaTrace) {
        action.track_check_used()?;
    }
    if let Some(wanted) = &action.global.lint_cwd {
        let got = std::env::current_dir()
            .map_err(|err| BuildError::internal(format!("cannot read working directory: {err}")))?;
        if &got != wanted {
            return Err(BuildError::LintCwdChanged {
                wanted: wanted.display().to_string(),
                got: got.display().to_string(),
            });
        }
    }
    Ok(value)
}
