//! Failure policy: staunch mode, fatal mode, and error reporting

mod common;

use std::time::Duration;

use common::{options, SinkSpy};
use girder::{run, BuildError, Rules, Verbosity};

#[tokio::test(flavor = "multi_thread")]
async fn staunch_reports_every_failure_but_throws_the_first() {
    let spy = SinkSpy::new();
    let mut rules = Rules::new();
    rules.action(|_action| async move { Err(BuildError::user("failure A")) });
    rules.action(|_action| async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(BuildError::user("failure B"))
    });

    let mut opts = options(2);
    opts.staunch = true;
    opts.output = Some(spy.hook());
    let err = run(opts, rules).await.unwrap_err();

    match err {
        BuildError::Structured(structured) => {
            assert_eq!(structured.target, "Top-level action");
            assert!(structured.inner.to_string().contains("failure A"));
        }
        other => panic!("expected a structured error, got: {other}"),
    }
    let text = spy.text();
    assert!(text.contains("failure A"), "missing A in: {text}");
    assert!(text.contains("failure B"), "missing B in: {text}");
    assert_eq!(spy.count_containing("Continuing due to staunch mode"), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn fatal_mode_stays_quiet_about_secondary_failures() {
    let spy = SinkSpy::new();
    let mut rules = Rules::new();
    rules.action(|_action| async move { Err(BuildError::user("only failure")) });

    let mut opts = options(2);
    opts.output = Some(spy.hook());
    let err = run(opts, rules).await.unwrap_err();
    assert!(matches!(err, BuildError::Structured(_)));
    assert_eq!(spy.count_containing("Continuing due to staunch mode"), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn a_fatal_failure_abandons_queued_actions() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let mut rules = Rules::new();
    rules.action(|_action| async move { Err(BuildError::user("boom")) });
    let survivors = Arc::new(AtomicUsize::new(0));
    for _ in 0..4 {
        let survivors = survivors.clone();
        rules.action(move |action| async move {
            // Queued work still drains, but applying new keys after the
            // cancellation short-circuits inside the database.
            let result = action.apply1(common::Name("late")).await;
            if result.is_ok() {
                survivors.fetch_add(1, Ordering::SeqCst);
            }
            result.map(drop)
        });
    }
    rules.add_rule(|_action: girder::Action, _key: common::Name| async move {
        Ok("late-value".to_string())
    });

    let err = run(options(1), rules).await.unwrap_err();
    match err {
        BuildError::Structured(structured) => {
            assert!(structured.inner.to_string().contains("boom"));
        }
        other => panic!("expected a structured error, got: {other}"),
    }
    // With one worker the failing action runs first and cancels; the rules
    // demanded afterwards are cut short rather than executed.
    assert_eq!(survivors.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn staunch_mode_lets_independent_work_finish() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let finished = Arc::new(AtomicUsize::new(0));
    let mut rules = Rules::new();
    rules.action(|_action| async move { Err(BuildError::user("early failure")) });
    for _ in 0..3 {
        let finished = finished.clone();
        rules.action(move |_action| async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let mut opts = options(2);
    opts.staunch = true;
    opts.verbosity = Verbosity::Silent;
    let err = run(opts, rules).await;
    assert!(err.is_err());
    assert_eq!(finished.load(Ordering::SeqCst), 3);
}
