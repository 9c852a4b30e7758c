//! The build driver
//!
//! `run` wires a [`Rules`] value to a database and a pool, drives every
//! top-level action to completion, and then walks the post-build steps:
//! integrity assertion, lint validation, report and live-file output, and
//! registered finalisers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::action::{Action, Global, Local, OutputSink};
use crate::apply::build_ops;
use crate::database::{Database, MemoryDatabase};
use crate::error::{BuildError, BuildResult};
use crate::key::Stack;
use crate::options::{RunOptions, Verbosity};
use crate::pool::Pool;
use crate::progress;
use crate::rules::Rules;

/// Run a build against a fresh in-memory database
///
/// Returns normally when every top-level action succeeded; otherwise the
/// first recorded failure is returned (the only one, outside staunch mode).
pub async fn run(options: RunOptions, rules: Rules) -> BuildResult<()> {
    run_with(options, rules, Arc::new(MemoryDatabase::new())).await
}

/// Run a build against a caller-supplied database
pub async fn run_with(
    options: RunOptions,
    rules: Rules,
    database: Arc<dyn Database>,
) -> BuildResult<()> {
    let start = Instant::now();
    let threads = if options.threads == 0 {
        num_cpus::get()
    } else {
        options.threads
    };
    let (actions, registry) = rules.into_parts();
    let action_count = actions.len();
    let lint_cwd = if options.lint.is_some() {
        std::env::current_dir().ok()
    } else {
        None
    };
    let pool = Pool::new(threads);
    let global = Arc::new(Global {
        database,
        pool: pool.clone(),
        start,
        rules: Arc::new(registry),
        output: OutputSink::new(&options),
        options: options.clone(),
        after: Mutex::new(Vec::new()),
        absent: Mutex::new(Vec::new()),
        first_error: Mutex::new(None),
        lint_cwd,
    });
    debug!(threads, actions = action_count, "build starting");

    let reporter = progress::start_reporter(&global);
    let mut timings: Vec<(&'static str, Duration)> = vec![("setup", start.elapsed())];

    let build_started = Instant::now();
    for act in actions {
        let global = global.clone();
        pool.spawn(async move {
            let action = Action::new(
                global.clone(),
                Local::new(Stack::new(), global.options.verbosity),
            );
            if let Err(err) = crate::action::guard_panics(act(action)).await {
                let structured = global.annotate(vec!["Top-level action".to_string()], err);
                global.raise_error(structured);
            }
        });
    }
    pool.wait_idle().await;
    timings.push(("build", build_started.elapsed()));

    if let Some(handle) = reporter {
        handle.abort();
    }

    if let Some(err) = global.first_error.lock().take() {
        print_timings(&global, &timings);
        return Err(BuildError::Structured(err));
    }

    global.database.assert_finished()?;

    if action_count == 0 && options.verbosity >= Verbosity::Normal {
        global
            .output
            .emit(Verbosity::Normal, "warning: no actions requested, nothing to do");
    }

    if options.lint.is_some() {
        let ops = build_ops(&global);
        let absent = global.absent.lock().clone();
        global.database.check_valid(&ops, &absent).await?;
        if options.verbosity >= Verbosity::Loud {
            global
                .output
                .emit(Verbosity::Loud, "Lint checking succeeded");
        }
    }

    if !options.reports.is_empty() {
        let report = global.database.to_report();
        let text = serde_json::to_string_pretty(&report)
            .map_err(|err| BuildError::internal(format!("cannot serialise report: {err}")))?;
        for path in &options.reports {
            debug!(path = %path.display(), "writing report");
            std::fs::write(path, &text)?;
        }
    }

    if !options.live_files.is_empty() {
        let mut live: Vec<String> = global
            .database
            .list_live()
            .into_iter()
            .filter(|key| {
                global
                    .rules
                    .get(key)
                    .map(|info| info.file_key)
                    .unwrap_or(false)
            })
            .map(|key| key.to_string())
            .collect();
        live.sort();
        let text = live.join("\n");
        for path in &options.live_files {
            if path.as_os_str() == "-" {
                if options.verbosity >= Verbosity::Quiet {
                    global.output.emit(Verbosity::Quiet, &text);
                }
            } else {
                std::fs::write(path, format!("{text}\n"))?;
            }
        }
    }

    let after = std::mem::take(&mut *global.after.lock());
    for finaliser in after.into_iter().rev() {
        // One bad finaliser must not stop the rest.
        if catch_unwind(AssertUnwindSafe(finaliser)).is_err() {
            warn!("a run_after finaliser panicked");
        }
    }

    print_timings(&global, &timings);
    Ok(())
}

fn print_timings(global: &Global, timings: &[(&'static str, Duration)]) {
    if !global.options.timings || global.options.verbosity < Verbosity::Normal {
        return;
    }
    for (label, duration) in timings {
        global.output.emit(
            Verbosity::Normal,
            &format!("{label}: {:.3}s", duration.as_secs_f64()),
        );
    }
}
