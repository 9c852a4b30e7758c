//! The parallel combinator, order-only dependencies, and extra_thread

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use serial_test::serial;

use common::{options, Name};
use girder::{
    run, run_with, Action, BuildError, BuildResult, Database, Key, Lint, MemoryDatabase, Rules,
};

/// A branch that sleeps and then delivers the given outcome
fn timed_branch(
    ms: u64,
    outcome: BuildResult<usize>,
) -> impl FnOnce(Action) -> BoxFuture<'static, BuildResult<usize>> + Send {
    move |_: Action| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            outcome
        })
    }
}

/// A branch that demands one key
fn fetch_branch(
    name: &'static str,
) -> impl FnOnce(Action) -> BoxFuture<'static, BuildResult<String>> + Send {
    move |inner: Action| Box::pin(async move { inner.apply1(Name(name)).await })
}

#[tokio::test(flavor = "multi_thread")]
#[serial]
async fn parallel_branches_share_the_wall_clock() {
    let mut rules = Rules::new();
    rules.action(|action| async move {
        let results = action
            .parallel(vec![timed_branch(100, Ok(1)), timed_branch(100, Ok(2))])
            .await?;
        assert_eq!(results, vec![1, 2]);
        Ok(())
    });

    let started = Instant::now();
    run(options(2), rules).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(95), "too fast: {elapsed:?}");
    assert!(
        elapsed < Duration::from_millis(180),
        "branches serialised: {elapsed:?}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_results_keep_submission_order() {
    let mut rules = Rules::new();
    rules.action(|action| async move {
        let branches: Vec<_> = (0..6usize)
            .map(|index| timed_branch(60 - 10 * index as u64, Ok(index)))
            .collect();
        let results = action.parallel(branches).await?;
        assert_eq!(results, (0..6).collect::<Vec<_>>());
        Ok(())
    });
    run(options(6), rules).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn the_first_completed_failure_wins() {
    let mut rules = Rules::new();
    rules.action(|action| async move {
        let result = action
            .parallel(vec![
                timed_branch(80, Err(BuildError::user("slow failure"))),
                timed_branch(0, Err(BuildError::user("fast failure"))),
            ])
            .await;
        match result {
            Err(BuildError::UserError(msg)) => {
                assert_eq!(msg, "fast failure");
                Ok(())
            }
            other => Err(BuildError::user(format!(
                "expected the fast failure, got {other:?}"
            ))),
        }
    });
    run(options(4), rules).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn queued_branches_are_abandoned_after_a_failure() {
    let executed = Arc::new(AtomicUsize::new(0));
    let mut rules = Rules::new();
    let executed_in_action = executed.clone();

    fn counting_branch(
        executed: Arc<AtomicUsize>,
        index: usize,
    ) -> impl FnOnce(Action) -> BoxFuture<'static, BuildResult<usize>> + Send {
        move |_: Action| {
            Box::pin(async move {
                executed.fetch_add(1, Ordering::SeqCst);
                if index == 0 {
                    Err(BuildError::user("first branch fails"))
                } else {
                    Ok(index)
                }
            })
        }
    }

    rules.action(move |action| async move {
        let branches: Vec<_> = (0..5)
            .map(|index| counting_branch(executed_in_action.clone(), index))
            .collect();
        let result = action.parallel(branches).await;
        assert!(result.is_err());
        Err(BuildError::user("propagate"))
    });

    // One worker: branches run one at a time, and the failure of the first
    // abandons the rest before they start.
    let err = run(options(1), rules).await.unwrap_err();
    assert!(matches!(err, BuildError::Structured(_)));
    assert_eq!(executed.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_dependencies_merge_into_the_parent() {
    let mut rules = Rules::new();
    rules.add_rule(|action: Action, key: Name| async move {
        match key.0 {
            "combine" => {
                let values = action
                    .parallel(vec![fetch_branch("left"), fetch_branch("right")])
                    .await?;
                // Both branch dependencies must now be the parent's own,
                // or these reads would fail the tracking lint.
                action.track_use(Name("left"));
                action.track_use(Name("right"));
                Ok(values.join("|"))
            }
            other => Ok(other.to_string()),
        }
    });
    rules.action(|action| async move {
        let combined = action.apply1(Name("combine")).await?;
        assert_eq!(combined, "left|right");
        Ok(())
    });

    let mut opts = options(4);
    opts.lint = Some(Lint::FsaTrace);
    let db = Arc::new(MemoryDatabase::new());
    run_with(opts, rules, db.clone()).await.unwrap();
    let deps = db.lookup_dependencies(&Key::new(Name("combine")));
    assert!(deps.contains(&Key::new(Name("left"))));
    assert!(deps.contains(&Key::new(Name("right"))));
}

#[tokio::test(flavor = "multi_thread")]
async fn order_only_discards_the_dependency_record() {
    let mut rules = Rules::new();
    rules.add_rule(|action: Action, key: Name| async move {
        if key.0 == "top" {
            action
                .order_only(|inner| async move { inner.apply1(Name("hidden")).await.map(drop) })
                .await?;
            Ok("done".to_string())
        } else {
            Ok("hidden-value".to_string())
        }
    });
    rules.action(|action| async move { action.apply1(Name("top")).await.map(drop) });

    let db = Arc::new(MemoryDatabase::new());
    run_with(options(2), rules, db.clone()).await.unwrap();
    // The hidden key was built, but top does not depend on it.
    assert!(db.list_live().contains(&Key::new(Name("hidden"))));
    assert!(db.lookup_dependencies(&Key::new(Name("top"))).is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn extra_thread_admits_queued_work_while_it_runs() {
    let in_segment = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(AtomicBool::new(false));
    let mut rules = Rules::new();

    let segment = in_segment.clone();
    rules.action(move |action| async move {
        segment.store(true, Ordering::SeqCst);
        let result = action
            .extra_thread(|_inner| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            })
            .await;
        segment.store(false, Ordering::SeqCst);
        result
    });

    let segment = in_segment.clone();
    let observed_by_second = observed.clone();
    rules.action(move |_action| async move {
        observed_by_second.store(segment.load(Ordering::SeqCst), Ordering::SeqCst);
        Ok(())
    });

    // One worker: the second action can only run during the first one's
    // extra-thread segment, when the limit is temporarily two.
    run(options(1), rules).await.unwrap();
    assert!(observed.load(Ordering::SeqCst));
}

#[tokio::test(flavor = "multi_thread")]
async fn apply_is_forbidden_inside_extra_thread() {
    let mut rules = Rules::new();
    rules.add_rule(|_action: Action, _key: Name| async move { Ok("v".to_string()) });
    rules.action(|action| async move {
        let result = action
            .extra_thread(|inner| async move { inner.apply1(Name("dep")).await.map(drop) })
            .await;
        match result {
            Err(BuildError::NoApplyHere(reason)) => {
                assert!(reason.contains("extra_thread"));
                Ok(())
            }
            other => Err(BuildError::user(format!(
                "expected NoApplyHere, got {other:?}"
            ))),
        }
    });
    run(options(1), rules).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn empty_and_singleton_parallel_are_trivial() {
    let mut rules = Rules::new();
    rules.action(|action| async move {
        let none: Vec<usize> = action
            .parallel(Vec::<fn(Action) -> std::future::Ready<BuildResult<usize>>>::new())
            .await?;
        assert!(none.is_empty());
        let one = action
            .parallel(vec![|_: Action| async { Ok(7usize) }])
            .await?;
        assert_eq!(one, vec![7]);
        Ok(())
    });
    run(options(1), rules).await.unwrap();
}
