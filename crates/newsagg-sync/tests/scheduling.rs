mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{source, Harness, ScriptedAdapter};
use newsagg_core::{FetchInterval, RunOutcome};
use newsagg_sync::{ScheduleError, TelemetryEvent, TriggerError};

#[tokio::test]
async fn forced_trigger_during_a_run_is_refused() {
    let h = Harness::new(4);
    let adapter = h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 2))).await;
    adapter.hold();

    let handle = h.scheduler.force_run("example-feed").unwrap();
    adapter.entered().await;
    let in_flight = h.scheduler.state("example-feed").unwrap();
    assert!(in_flight.running);

    let err = h.scheduler.force_run("example-feed").unwrap_err();
    assert_eq!(
        err,
        TriggerError::AlreadyRunning {
            source_id: "example-feed".into(),
            run_id: in_flight.current_run.unwrap(),
        }
    );

    adapter.release(2);
    let record = handle.await.unwrap();
    assert_eq!(record.run_id, in_flight.current_run.unwrap());
    assert_eq!(h.gateway.runs("example-feed", 10).await.unwrap().len(), 1);
    // Forced collisions are not missed triggers.
    assert_eq!(h.telemetry.missed_triggers("example-feed"), 0);
}

#[tokio::test]
async fn late_timer_trigger_is_skipped_and_reported() {
    let h = Harness::new(4);
    let adapter = h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 1))).await;
    adapter.hold();

    let handle = h.scheduler.trigger_scheduled("example-feed").unwrap().unwrap();
    adapter.entered().await;
    assert!(matches!(
        h.scheduler.trigger_scheduled("example-feed"),
        Err(TriggerError::AlreadyRunning { .. })
    ));
    assert!(h.scheduler.trigger_scheduled("example-feed").is_err());

    adapter.release(1);
    handle.await.unwrap();

    assert_eq!(h.telemetry.missed_triggers("example-feed"), 2);
    assert_eq!(h.scheduler.state("example-feed").unwrap().missed_triggers, 2);
    assert_eq!(h.gateway.runs("example-feed", 10).await.unwrap().len(), 1);
    let missed = h
        .telemetry
        .events()
        .into_iter()
        .find_map(|event| match event {
            TelemetryEvent::MissedTrigger { in_flight_run, .. } => in_flight_run,
            _ => None,
        })
        .unwrap();
    assert_eq!(Some(missed), h.scheduler.state("example-feed").unwrap().last_run_id);
}

#[tokio::test]
async fn panicking_run_is_recorded_and_schedule_survives() {
    let h = Harness::new(4);
    let adapter = h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 1))).await;
    adapter.panic_on_listing(true);

    let record = h.scheduler.force_run("example-feed").unwrap().await.unwrap();
    assert_eq!(record.outcome, RunOutcome::Failed);
    assert!(record.error_summary.unwrap().contains("panicked"));
    assert_eq!(h.gateway.runs("example-feed", 10).await.unwrap().len(), 1);
    let state = h.scheduler.state("example-feed").unwrap();
    assert!(!state.running);
    assert_eq!(state.last_outcome, Some(RunOutcome::Failed));

    adapter.panic_on_listing(false);
    let next = h.scheduler.trigger_scheduled("example-feed").unwrap().unwrap().await.unwrap();
    assert_eq!(next.outcome, RunOutcome::Succeeded);
}

#[tokio::test]
async fn global_limit_admits_waiting_runs_in_arrival_order() {
    let h = Harness::new(1);
    let log = Arc::new(Mutex::new(Vec::new()));
    let first = h
        .add(Arc::new(ScriptedAdapter::with_articles("feed-a", 1).logging_to(log.clone())))
        .await;
    let second = h
        .add(Arc::new(ScriptedAdapter::with_articles("feed-b", 1).logging_to(log.clone())))
        .await;
    let third = h
        .add(Arc::new(ScriptedAdapter::with_articles("feed-c", 1).logging_to(log.clone())))
        .await;
    first.hold();

    let a = h.scheduler.force_run("feed-a").unwrap();
    first.entered().await;
    let c = h.scheduler.trigger_scheduled("feed-c").unwrap().unwrap();
    let b = h.scheduler.force_run("feed-b").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Queued, not dropped, and not started while the slot is taken.
    assert_eq!(second.listing_calls(), 0);
    assert_eq!(third.listing_calls(), 0);
    assert!(h.scheduler.state("feed-b").unwrap().running);

    first.release(1);
    let records = vec![a.await.unwrap(), c.await.unwrap(), b.await.unwrap()];
    assert!(records.iter().all(|r| r.outcome == RunOutcome::Succeeded));
    assert_eq!(*log.lock().unwrap(), vec!["feed-a", "feed-c", "feed-b"]);
}

#[tokio::test]
async fn sources_run_concurrently_under_the_limit() {
    let h = Harness::new(2);
    let a = h.add(Arc::new(ScriptedAdapter::with_articles("feed-a", 2))).await;
    let b = h.add(Arc::new(ScriptedAdapter::with_articles("feed-b", 2))).await;
    a.hold();
    b.hold();

    let ha = h.scheduler.force_run("feed-a").unwrap();
    let hb = h.scheduler.force_run("feed-b").unwrap();
    a.entered().await;
    b.entered().await;

    // Both are mid-run at once; finishing b first does not wait on a.
    b.release(2);
    let rb = hb.await.unwrap();
    assert_eq!(rb.counts.new, 2);
    assert!(h.scheduler.state("feed-a").unwrap().running);

    a.release(2);
    let ra = ha.await.unwrap();
    assert_eq!(ra.counts.new, 2);
}

#[tokio::test]
async fn disabled_source_ignores_timer_but_not_force() {
    let h = Harness::new(4);
    h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 1))).await;
    h.scheduler.set_enabled("example-feed", false).unwrap();

    assert!(h.scheduler.trigger_scheduled("example-feed").unwrap().is_none());
    let record = h.scheduler.force_run("example-feed").unwrap().await.unwrap();
    assert_eq!(record.counts.new, 1);

    assert_eq!(
        h.scheduler.set_enabled("nope", true),
        Err(TriggerError::UnknownSource("nope".into()))
    );
    assert!(matches!(h.scheduler.force_run("nope"), Err(TriggerError::UnknownSource(_))));
}

#[tokio::test]
async fn invalid_sources_are_refused_individually() {
    let h = Harness::new(4);
    let mut too_fast = source("too-fast");
    too_fast.interval = FetchInterval::from_duration(Duration::from_secs(20));
    let err = h
        .scheduler
        .register(too_fast, Arc::new(ScriptedAdapter::new("too-fast")))
        .await
        .unwrap_err();
    assert!(matches!(err, ScheduleError::IntervalTooShort { .. }));

    h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 1))).await;
    let dup = h
        .scheduler
        .register(source("example-feed"), Arc::new(ScriptedAdapter::new("example-feed")))
        .await
        .unwrap_err();
    assert!(matches!(dup, ScheduleError::Duplicate(_)));

    let ids: Vec<_> = h.scheduler.sources().iter().map(|s| s.source_id.clone()).collect();
    assert_eq!(ids, vec!["example-feed"]);
}

#[tokio::test]
async fn reload_applies_to_the_next_run() {
    let h = Harness::new(4);
    h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 1))).await;
    h.scheduler.force_run("example-feed").unwrap().await.unwrap();

    let replacement = Arc::new(ScriptedAdapter::with_articles("example-feed", 3));
    let mut config = source("example-feed");
    config.display_name = "Example Feed".into();
    h.scheduler.update_source(config, replacement.clone()).await.unwrap();

    let record = h.scheduler.force_run("example-feed").unwrap().await.unwrap();
    assert_eq!(record.counts.discovered, 3);
    assert_eq!(record.counts.new, 2);
    assert_eq!(record.counts.duplicate, 1);
    assert_eq!(replacement.listing_calls(), 1);
    assert_eq!(h.scheduler.sources()[0].display_name, "Example Feed");

    let unknown = h
        .scheduler
        .update_source(source("ghost"), Arc::new(ScriptedAdapter::new("ghost")))
        .await
        .unwrap_err();
    assert!(matches!(unknown, ScheduleError::UnknownSource(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_waits_for_in_flight_runs() {
    let h = Harness::new(4);
    let adapter = h.add(Arc::new(ScriptedAdapter::with_articles("example-feed", 3))).await;
    h.scheduler.start().await.unwrap();
    adapter.hold();

    let handle = h.scheduler.force_run("example-feed").unwrap();
    adapter.entered().await;

    let scheduler = h.scheduler.clone();
    let shutdown = tokio::spawn(async move { scheduler.shutdown().await });
    while !h.coordinator.stop_flag().load(std::sync::atomic::Ordering::SeqCst) {
        tokio::task::yield_now().await;
    }
    assert!(!shutdown.is_finished());
    adapter.release(3);

    tokio::time::timeout(Duration::from_secs(5), shutdown).await.unwrap().unwrap();
    let record = handle.await.unwrap();
    assert_eq!(record.counts.fetched, 1);
    assert_eq!(record.counts.skipped, 2);
    assert!(!h.scheduler.state("example-feed").unwrap().running);
    assert_eq!(h.scheduler.force_run("example-feed").unwrap_err(), TriggerError::ShuttingDown);
}
