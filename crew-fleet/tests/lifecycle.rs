//! Crew lifecycle: creation, reuse, bounded execution, idle tracking and
//! teardown.

mod support;

use std::sync::Arc;
use std::time::Duration;

use crew_fleet::crew::{EMPTY_RESPONSE, ITERATION_LIMIT, LifecycleConfig, SYSTEM_ERROR, Status};
use crew_fleet::error::LifecycleError;
use crew_fleet::worker::TaskRequest;

use support::{Behavior, Health, ScriptedFactory, fast_config, manager};

#[tokio::test]
async fn first_use_creates_active_crew() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.status("T1"), None);
    let handle = mgr.get_or_create("T1").await.unwrap();
    assert_eq!(handle.status(), Status::Active);
    assert_eq!(handle.tenant_id(), "T1");
    assert_eq!(mgr.status("T1"), Some(Status::Active));

    let again = mgr.get_or_create("T1").await.unwrap();
    assert!(Arc::ptr_eq(&handle, &again));
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn concurrent_get_or_create_builds_one_crew() {
    let factory = ScriptedFactory::new();
    factory.slow_creation(Duration::from_millis(50));
    let mgr = manager(&factory, fast_config());

    let (a, b) = tokio::join!(mgr.get_or_create("T1"), mgr.get_or_create("T1"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn tenants_get_separate_crews() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T1", "hi").await, "T1: hi");
    assert_eq!(mgr.execute_task("T2", "hi").await, "T2: hi");
    assert_eq!(factory.created(), 2);
    assert_eq!(mgr.tenant_ids(), vec!["T1", "T2"]);
}

#[tokio::test]
async fn successful_task_updates_metrics() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    let before = chrono::Utc::now();
    let reply = mgr
        .execute_task("T1", TaskRequest::new("who plays saturday?").with_sender("coach"))
        .await;
    assert_eq!(reply, "T1: who plays saturday?");

    let snap = mgr.metrics("T1").unwrap();
    assert_eq!(snap.status, Status::Active);
    assert_eq!(snap.metrics.total_requests, 1);
    assert_eq!(snap.metrics.successful_requests, 1);
    assert_eq!(snap.metrics.failed_requests, 0);
    assert!(snap.metrics.last_activity_at >= before);
    assert!(snap.metrics.average_response_time_ms >= 0.0);
    assert_eq!(
        snap.metrics.last_health_snapshot.as_ref().unwrap()["ok"],
        true
    );
}

#[tokio::test]
async fn blank_answer_gets_fallback() {
    let factory = ScriptedFactory::new();
    factory.behave("T1", Behavior::Reply("   \n".to_string()));
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T1", "ping").await, EMPTY_RESPONSE);
    let m = mgr.metrics("T1").unwrap().metrics;
    assert_eq!(m.successful_requests, 1);
}

#[tokio::test]
async fn timeout_names_limit_and_counts_failure() {
    let factory = ScriptedFactory::new();
    factory.behave("T1", Behavior::Sleep(Duration::from_secs(10)));
    let config = LifecycleConfig {
        task_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let mgr = manager(&factory, config);

    let handle = mgr.get_or_create("T1").await.unwrap();
    assert_eq!(handle.status(), Status::Active);

    let started = std::time::Instant::now();
    let reply = mgr.execute_task("T1", "ping").await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(reply.contains("50 ms"), "unexpected reply: {reply}");

    let m = handle.metrics();
    assert_eq!(m.failed_requests, 1);
    assert_eq!(m.successful_requests, 0);
    assert_eq!(handle.status(), Status::Active);
}

#[tokio::test]
async fn iteration_limit_error_gets_dedicated_fallback() {
    let factory = ScriptedFactory::new();
    factory.behave(
        "T2",
        Behavior::Fail("Agent stopped: max_iter of 25 exceeded".to_string()),
    );
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T2", "plan the season").await, ITERATION_LIMIT);
    assert_eq!(mgr.metrics("T2").unwrap().metrics.failed_requests, 1);
}

#[tokio::test]
async fn generic_error_names_the_failure() {
    let factory = ScriptedFactory::new();
    factory.behave("T2", Behavior::Fail("fixtures feed offline".to_string()));
    let mgr = manager(&factory, fast_config());

    let reply = mgr.execute_task("T2", "next match?").await;
    assert_ne!(reply, ITERATION_LIMIT);
    assert!(reply.contains("fixtures feed offline"));
    assert_eq!(mgr.metrics("T2").unwrap().metrics.failed_requests, 1);
}

#[tokio::test]
async fn panicking_crew_still_yields_text() {
    let factory = ScriptedFactory::new();
    factory.behave("T1", Behavior::Panic);
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T1", "boom").await, SYSTEM_ERROR);
    let m = mgr.metrics("T1").unwrap().metrics;
    assert_eq!(m.failed_requests, 1);
    assert_eq!(mgr.status("T1"), Some(Status::Active));
}

#[tokio::test]
async fn creation_failure_propagates_and_marks_error() {
    let factory = ScriptedFactory::new();
    factory.fail_creation("T1", true);
    let mgr = manager(&factory, fast_config());

    let err = mgr.get_or_create("T1").await.unwrap_err();
    let LifecycleError::Creation { tenant_id, .. } = &err;
    assert_eq!(tenant_id, "T1");
    assert!(err.to_string().contains("crew model unavailable"));
    assert_eq!(mgr.status("T1"), Some(Status::Error));

    // execute_task absorbs the same failure
    assert_eq!(mgr.execute_task("T1", "hi").await, SYSTEM_ERROR);

    // next request rebuilds once the factory recovers
    factory.fail_creation("T1", false);
    assert_eq!(mgr.execute_task("T1", "hi").await, "T1: hi");
    assert_eq!(mgr.status("T1"), Some(Status::Active));
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn failed_health_check_degrades_snapshot_only() {
    let factory = ScriptedFactory::new();
    factory.failing_health();
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T1", "hi").await, "T1: hi");
    let m = mgr.metrics("T1").unwrap().metrics;
    assert_eq!(m.successful_requests, 1);
    assert_eq!(m.last_health_snapshot.unwrap()["error"], true);
}

#[tokio::test]
async fn outcome_counts_add_up_under_concurrency() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    let calls = (0..25).map(|i| {
        let mgr = Arc::clone(&mgr);
        tokio::spawn(async move { mgr.execute_task("T1", format!("q{i}")).await })
    });
    for reply in futures::future::join_all(calls).await {
        assert!(reply.unwrap().starts_with("T1: q"));
    }

    let m = mgr.metrics("T1").unwrap().metrics;
    assert_eq!(m.total_requests, 25);
    assert_eq!(m.total_requests, m.successful_requests + m.failed_requests);
    assert_eq!(factory.created(), 1);
}

#[tokio::test]
async fn monitor_marks_quiet_crew_idle_and_work_reactivates_it() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    mgr.execute_task("T1", "hi").await;
    mgr.start_monitoring();
    assert!(mgr.is_monitoring());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mgr.status("T1"), Some(Status::Idle));

    mgr.execute_task("T1", "back again").await;
    assert_eq!(mgr.status("T1"), Some(Status::Active));
    assert_eq!(factory.created(), 1);

    mgr.stop_monitoring().await;
    assert!(!mgr.is_monitoring());
}

#[tokio::test]
async fn idle_sweep_respects_threshold() {
    let factory = ScriptedFactory::new();
    let config = LifecycleConfig {
        idle_threshold: Duration::from_secs(3600),
        ..fast_config()
    };
    let mgr = manager(&factory, config);

    mgr.get_or_create("T1").await.unwrap();
    assert!(mgr.sweep_idle().is_empty());
    assert_eq!(mgr.status("T1"), Some(Status::Active));
}

#[tokio::test]
async fn start_monitoring_is_idempotent() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    mgr.start_monitoring();
    mgr.start_monitoring();
    assert!(mgr.is_monitoring());
    mgr.shutdown_all().await;
    assert!(!mgr.is_monitoring());
}

#[tokio::test]
async fn shutdown_is_idempotent_and_allows_recreation() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    let first = mgr.get_or_create("T1").await.unwrap();
    mgr.shutdown("T1").await;
    mgr.shutdown("T1").await;
    assert_eq!(first.status(), Status::Shutdown);
    assert_eq!(mgr.status("T1"), None);
    assert_eq!(factory.shutdowns(), 1);

    let second = mgr.get_or_create("T1").await.unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(second.status(), Status::Active);
    assert_eq!(second.metrics().total_requests, 0);
}

#[tokio::test]
async fn shutdown_all_empties_fleet_and_collects_failures() {
    let factory = ScriptedFactory::new();
    factory.failing_shutdown();
    let mgr = manager(&factory, fast_config());

    for t in ["T1", "T2", "T3"] {
        mgr.get_or_create(t).await.unwrap();
    }
    mgr.start_monitoring();

    let summary = mgr.shutdown_all().await;
    assert_eq!(summary.stopped, 3);
    assert_eq!(summary.failed.len(), 3);
    assert!(mgr.is_empty());
    assert!(!mgr.is_monitoring());
    assert_eq!(factory.shutdowns(), 3);
}

#[tokio::test]
async fn health_check_tallies_states() {
    let factory = ScriptedFactory::new();
    factory.fail_creation("broken", true);
    let mgr = manager(&factory, fast_config());

    mgr.get_or_create("T1").await.unwrap();
    mgr.get_or_create("T2").await.unwrap();
    let _ = mgr.get_or_create("broken").await;

    let report = mgr.health_check().await;
    assert_eq!(report.total, 3);
    assert_eq!(report.active, 2);
    assert_eq!(report.errors, 1);
    assert!(report.tenants["T1"].healthy);
    assert_eq!(report.tenants["T1"].detail.as_ref().unwrap()["ok"], true);
    assert!(!report.tenants["broken"].healthy);
    assert_eq!(report.tenants["broken"].status, Status::Error);

    let all = mgr.all_metrics();
    let ids: Vec<&str> = all.iter().map(|s| s.tenant_id.as_str()).collect();
    assert_eq!(ids, vec!["T1", "T2", "broken"]);
}

#[tokio::test]
async fn failing_health_checks_count_as_errors() {
    let factory = ScriptedFactory::new();
    factory.failing_health();
    let mgr = manager(&factory, fast_config());

    mgr.get_or_create("T1").await.unwrap();
    let report = mgr.health_check().await;
    assert_eq!(report.active, 1);
    assert_eq!(report.errors, 1);
    assert!(!report.tenants["T1"].healthy);
}

#[tokio::test]
async fn deadline_cancels_the_task_token() {
    let factory = ScriptedFactory::new();
    factory.behave("T1", Behavior::Sleep(Duration::from_secs(10)));
    let config = LifecycleConfig {
        task_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let mgr = manager(&factory, config);

    let request = TaskRequest::new("ping").with_sender("coach").with_channel("#t1");
    mgr.execute_task("T1", request).await;

    let contexts = factory.contexts();
    assert_eq!(contexts.len(), 1);
    let ctx = &contexts[0];
    assert!(ctx.cancel.is_cancelled());
    assert_eq!(ctx.tenant_id, "T1");
    assert_eq!(ctx.sender.as_deref(), Some("coach"));
    assert_eq!(ctx.channel_id.as_deref(), Some("#t1"));
}

#[tokio::test]
async fn completed_task_leaves_token_untouched() {
    let factory = ScriptedFactory::new();
    let mgr = manager(&factory, fast_config());

    mgr.execute_task("T1", "hi").await;
    let contexts = factory.contexts();
    assert_eq!(contexts.len(), 1);
    assert!(!contexts[0].cancel.is_cancelled());
    assert_eq!(contexts[0].sender, None);
}

#[tokio::test]
async fn hanging_health_check_is_bounded() {
    let factory = ScriptedFactory::new();
    factory.health(Health::Hang);
    let config = LifecycleConfig {
        task_timeout: Duration::from_millis(50),
        ..fast_config()
    };
    let mgr = manager(&factory, config);

    let started = std::time::Instant::now();
    assert_eq!(mgr.execute_task("T1", "hi").await, "T1: hi");
    assert!(started.elapsed() < Duration::from_secs(5));

    let m = mgr.metrics("T1").unwrap().metrics;
    assert_eq!(m.successful_requests, 1);
    let snapshot = m.last_health_snapshot.unwrap();
    assert_eq!(snapshot["error"], true);
    assert!(snapshot["message"].as_str().unwrap().contains("timed out"));

    let report = mgr.health_check().await;
    assert_eq!(report.errors, 1);
}

#[tokio::test]
async fn panicking_health_check_is_contained() {
    let factory = ScriptedFactory::new();
    factory.health(Health::Panic);
    let mgr = manager(&factory, fast_config());

    assert_eq!(mgr.execute_task("T1", "hi").await, "T1: hi");
    let snapshot = mgr.metrics("T1").unwrap().metrics.last_health_snapshot.unwrap();
    assert_eq!(snapshot["error"], true);
    assert!(snapshot["message"].as_str().unwrap().contains("panicked"));

    let report = mgr.health_check().await;
    assert_eq!(report.active, 1);
    assert_eq!(report.errors, 1);
    assert!(!report.tenants["T1"].healthy);
}

#[tokio::test]
async fn monitor_keeps_sweeping_while_health_checks_fail() {
    let factory = ScriptedFactory::new();
    factory.health(Health::Panic);
    let mgr = manager(&factory, fast_config());

    mgr.get_or_create("T1").await.unwrap();
    mgr.start_monitoring();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(mgr.is_monitoring());
    assert_eq!(mgr.status("T1"), Some(Status::Idle));
    mgr.stop_monitoring().await;
}

#[tokio::test]
async fn zero_monitor_interval_still_monitors() {
    let factory = ScriptedFactory::new();
    let config = LifecycleConfig {
        monitor_interval: Duration::ZERO,
        ..fast_config()
    };
    let mgr = manager(&factory, config);

    mgr.start_monitoring();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mgr.is_monitoring());
    mgr.shutdown_all().await;
    assert!(!mgr.is_monitoring());
}
