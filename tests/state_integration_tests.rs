//! Integration tests for StateManager with state change events
//!
//! These tests verify that the StateManager correctly:
//! - Emits state change events for a full run lifecycle
//! - Supports multiple subscribers
//! - Handles concurrent access from multiple threads
//! - Keeps writes of a superseded run out of the current one

use autocaption::models::{ItemOutcome, ItemStatus, RunOutcome};
use autocaption::{StateChange, StateManager};
use camino::Utf8PathBuf;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};

fn outcome(name: &str, ok: bool) -> ItemOutcome {
    ItemOutcome {
        filename: name.to_string(),
        source_path: Utf8PathBuf::from(format!("/images/{name}")),
        result: if ok {
            Ok(format!("caption for {name}"))
        } else {
            Err(format!("{name} failed"))
        },
        cost: 0.01,
        completed_at: Utc::now(),
    }
}

async fn next_event(rx: &mut broadcast::Receiver<StateChange>) -> StateChange {
    timeout(Duration::from_millis(100), rx.recv())
        .await
        .expect("Timeout waiting for event")
        .expect("Channel closed")
}

#[tokio::test]
async fn test_run_started_event_emitted() {
    let state = Arc::new(StateManager::new());
    let mut rx = state.subscribe();

    let run_id = state.begin_run(Utf8PathBuf::from("/images"), 2);

    let event = next_event(&mut rx).await;
    assert!(
        matches!(event, StateChange::RunStarted { run_id: id, total: 2 } if id == run_id),
        "Expected RunStarted event, got: {:?}",
        event
    );
}

#[tokio::test]
async fn test_multiple_subscribers_receive_events() {
    let state = Arc::new(StateManager::new());
    let mut rx1 = state.subscribe();
    let mut rx2 = state.subscribe();
    let mut rx3 = state.subscribe();

    state.begin_run(Utf8PathBuf::from("/images"), 5);

    for rx in [&mut rx1, &mut rx2, &mut rx3] {
        assert!(matches!(
            next_event(rx).await,
            StateChange::RunStarted { total: 5, .. }
        ));
    }
}

#[tokio::test]
async fn test_full_run_workflow_events() {
    let state = StateManager::new();
    let mut rx = state.subscribe();

    let run_id = state.begin_run(Utf8PathBuf::from("/images"), 3);
    state.start_batch(run_id);
    state.record_item(run_id, outcome("a.png", true));
    state.record_item(run_id, outcome("b.png", false));
    state.set_paused(true);
    state.set_paused(false);
    state.start_batch(run_id);
    state.record_item(run_id, outcome("c.png", true));
    state.finish_run(run_id, RunOutcome::Completed);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(
        events,
        vec![
            StateChange::RunStarted { run_id, total: 3 },
            StateChange::BatchStarted { batch_index: 1 },
            StateChange::ItemProcessed {
                id: 1,
                filename: "a.png".to_string(),
                status: ItemStatus::Success,
            },
            StateChange::ItemProcessed {
                id: 2,
                filename: "b.png".to_string(),
                status: ItemStatus::Error,
            },
            StateChange::Paused,
            StateChange::Resumed,
            StateChange::BatchStarted { batch_index: 2 },
            StateChange::ItemProcessed {
                id: 3,
                filename: "c.png".to_string(),
                status: ItemStatus::Success,
            },
            StateChange::RunFinished {
                outcome: Some(RunOutcome::Completed),
                processed: 3,
                errors: 1,
            },
        ]
    );
}

#[tokio::test]
async fn test_results_retained_after_finish() {
    let state = StateManager::new();
    let run_id = state.begin_run(Utf8PathBuf::from("/images"), 2);
    state.record_item(run_id, outcome("a.png", true));
    state.record_item(run_id, outcome("b.png", false));
    state.finish_run(run_id, RunOutcome::Completed);

    let snapshot = state.snapshot();
    assert!(!snapshot.is_processing);
    assert_eq!(snapshot.results.len(), 2);
    assert_eq!(snapshot.error_count(), 1);
    assert_eq!(snapshot.success_count(), 1);
    assert!((snapshot.total_cost - 0.02).abs() < 1e-9);
    assert_eq!(
        snapshot.results[1].error_message.as_deref(),
        Some("b.png failed")
    );
    assert!(snapshot.results[1].caption.is_empty());
}

#[tokio::test]
async fn test_new_run_ignores_superseded_writes() {
    let state = StateManager::new();

    let old_run = state.begin_run(Utf8PathBuf::from("/old"), 2);
    assert_eq!(state.stop_run(), Some(old_run));
    let new_run = state.begin_run(Utf8PathBuf::from("/new"), 1);

    assert!(state.record_item(old_run, outcome("old.png", true)).is_none());
    assert!(state.start_batch(old_run).is_none());
    assert!(!state.finish_run(old_run, RunOutcome::Completed));

    let item = state.record_item(new_run, outcome("new.png", true)).unwrap();
    assert_eq!(item.id, 1);

    let snapshot = state.snapshot();
    assert!(snapshot.is_processing);
    assert_eq!(snapshot.results.len(), 1);
    assert_eq!(snapshot.current_folder, Some(Utf8PathBuf::from("/new")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_state_access() {
    let state = Arc::new(StateManager::new());
    let run_id = state.begin_run(Utf8PathBuf::from("/images"), 100);

    let mut handles = Vec::new();
    for worker in 0..4 {
        let state = Arc::clone(&state);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                state.record_item(run_id, outcome(&format!("w{worker}_{i}.png"), i % 5 != 0));
                // Readers interleave with writers
                let _ = state.read(|s| s.results.len());
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    let snapshot = state.snapshot();
    assert_eq!(snapshot.results.len(), 100);
    assert_eq!(snapshot.error_count(), 20);

    let ids: Vec<usize> = snapshot.results.iter().map(|item| item.id).collect();
    assert_eq!(ids, (1..=100).collect::<Vec<_>>());
}
