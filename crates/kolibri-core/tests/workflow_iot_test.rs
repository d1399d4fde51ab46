//! Integration test: workflow reminders and IoT dispatch through the
//! runtime, including journaling of both surfaces.

use chrono::{Duration, TimeZone, Utc};
use kolibri_core::{
    IotCommand, IotError, IotPolicy, KolibriRuntime, ReminderRule, TaskStepState,
};
use std::collections::BTreeMap;

fn lamp_policy() -> IotPolicy {
    let mut allowlist = BTreeMap::new();
    allowlist.insert("lamp".to_string(), vec!["on".to_string(), "off".to_string()]);
    IotPolicy {
        allowlist,
        max_actions_per_session: 2,
        ..IotPolicy::default()
    }
}

// ===========================================================================
// Workflow reminder: deadline minus offset, emitted once due
// ===========================================================================

#[test]
fn reminder_fires_at_deadline_minus_offset() {
    let mut runtime = KolibriRuntime::default();
    let deadline = Utc.with_ymd_and_hms(2025, 1, 3, 9, 0, 0).unwrap();
    let workflow = runtime.schedule_workflow(
        "file the quarterly report",
        vec![TaskStepState::new("gather figures", None)],
        Some(deadline),
        vec![ReminderRule::new(Duration::hours(24), "one day left")],
        BTreeMap::new(),
    );

    let at = Utc.with_ymd_and_hms(2025, 1, 3, 8, 0, 0).unwrap();
    let events = runtime.emit_workflow_reminders(Some(at));
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].workflow_id, workflow.id);
    assert_eq!(
        events[0].scheduled_for,
        Utc.with_ymd_and_hms(2025, 1, 2, 9, 0, 0).unwrap()
    );

    let journal_events: Vec<String> = runtime
        .journal()
        .entries()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(journal_events.contains(&"workflow_created".to_string()));
    assert!(journal_events.contains(&"workflow_reminder".to_string()));
}

// ===========================================================================
// Workflow progress and overdue detection
// ===========================================================================

#[test]
fn overdue_workflow_is_reported() {
    let mut runtime = KolibriRuntime::default();
    let deadline = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
    let workflow = runtime.schedule_workflow(
        "late task",
        vec![
            TaskStepState::new("step one", None),
            TaskStepState::new("step two", Some("writer".to_string())),
        ],
        Some(deadline),
        vec![],
        BTreeMap::new(),
    );
    runtime
        .workflow_manager_mut()
        .mark_step_completed(&workflow.id, 0)
        .unwrap();
    let stored = runtime.workflow_manager().workflow(&workflow.id).unwrap();
    assert!((stored.progress() - 0.5).abs() < 1e-9);
    assert_eq!(stored.pending_steps().len(), 1);

    let overdue = runtime
        .workflow_manager()
        .overdue_workflows(Some(deadline + Duration::days(1)));
    assert_eq!(overdue.len(), 1);
}

// ===========================================================================
// IoT dispatch through the runtime: allow, rate-limit, session reset
// ===========================================================================

#[tokio::test]
async fn iot_dispatch_journals_and_respects_session_limit() {
    let dir = tempfile::tempdir().unwrap();
    let config = kolibri_core::KolibriConfig {
        graph_dir: dir.path().to_path_buf(),
        ..kolibri_core::KolibriConfig::default()
    };
    let mut runtime = KolibriRuntime::builder()
        .config(config)
        .iot_policy(lamp_policy())
        .build();
    let on = IotCommand::new("lamp", "on");

    let ack = runtime.dispatch_iot_command("sess", &on, None).unwrap();
    assert_eq!(ack["status"], "executed");
    assert_eq!(ack["count"], 1);
    runtime.dispatch_iot_command("sess", &on, None).unwrap();
    assert!(matches!(
        runtime.dispatch_iot_command("sess", &on, None),
        Err(IotError::RateLimited { .. })
    ));

    // Ending a session clears the counters.
    runtime.start_session("sess", None).unwrap();
    runtime.end_session().unwrap();
    let ack = runtime.dispatch_iot_command("sess", &on, None).unwrap();
    assert_eq!(ack["count"], 1);

    let journal_events: Vec<String> = runtime
        .journal()
        .entries()
        .into_iter()
        .map(|entry| entry.event)
        .collect();
    assert!(journal_events.contains(&"iot_executed".to_string()));
    assert!(journal_events.contains(&"iot_rate_limited".to_string()));
    assert!(journal_events.contains(&"runtime_iot_dispatch".to_string()));
}

// ===========================================================================
// Offline queue: merge after reconnect deduplicates and dispatches
// ===========================================================================

#[tokio::test]
async fn offline_queue_merges_and_dispatches() {
    let mut runtime = KolibriRuntime::builder().iot_policy(lamp_policy()).build();
    let bridge = runtime.iot_bridge_mut().unwrap();
    bridge
        .queue_command(IotCommand::new("lamp", "on"), Utc::now() - Duration::seconds(5))
        .unwrap();
    let results = bridge.merge_after_offline(
        "sess",
        vec![IotCommand::new("lamp", "on"), IotCommand::new("lamp", "off")],
        None,
    );
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(bridge.deferred_len(), 0);
}
