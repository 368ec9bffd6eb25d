use crate::models::{ProgressSnapshot, RunState};
use chrono::{DateTime, TimeDelta, Utc};

const MILLIS_PER_MINUTE: f64 = 60_000.0;

/// Derive the progress view of `state` as of `now`.
///
/// Pure; safe to call on an idle state, which yields an all-zero snapshot
/// apart from the results of the last finished run.
pub fn compute_snapshot(state: &RunState, now: DateTime<Utc>) -> ProgressSnapshot {
    let processed_count = state.results.len();

    // Only the active run has a meaningful remaining workload
    let total_count = if state.is_processing {
        state.total_count
    } else {
        0
    };

    let processing_speed = state
        .start_time
        .map(|start| (now - start).num_milliseconds() as f64 / MILLIS_PER_MINUTE)
        .filter(|&elapsed| elapsed > 0.0 && processed_count > 0)
        .map(|elapsed| processed_count as f64 / elapsed);

    let remaining = total_count.saturating_sub(processed_count);
    let estimated_completion = processing_speed
        .filter(|&speed| speed > 0.0 && remaining > 0)
        .and_then(|speed| {
            let millis = (remaining as f64 / speed * MILLIS_PER_MINUTE).round() as i64;
            TimeDelta::try_milliseconds(millis).and_then(|delta| now.checked_add_signed(delta))
        });

    ProgressSnapshot {
        is_processing: state.is_processing,
        is_paused: state.is_paused,
        processed_count,
        total_count,
        error_count: state.error_count(),
        current_batch: state.current_batch_index,
        current_folder: state.current_folder.clone(),
        start_time: state.start_time,
        processing_speed,
        estimated_completion,
        total_cost: state.total_cost,
        outcome: state.outcome,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemOutcome, RunOutcome};
    use camino::Utf8PathBuf;
    use proptest::prelude::*;

    fn push(state: &mut RunState, ok: bool) {
        state.push_result(ItemOutcome {
            filename: "x.png".to_string(),
            source_path: Utf8PathBuf::from("/x.png"),
            result: if ok {
                Ok("c".to_string())
            } else {
                Err("e".to_string())
            },
            cost: 0.25,
            completed_at: Utc::now(),
        });
    }

    fn running(total: usize, processed: usize, minutes: i64) -> (RunState, DateTime<Utc>) {
        let start = Utc::now();
        let mut state = RunState::default();
        state.begin(Utf8PathBuf::from("/images"), total, start);
        for _ in 0..processed {
            push(&mut state, true);
        }
        (state, start + TimeDelta::minutes(minutes))
    }

    #[test]
    fn test_idle_snapshot_is_empty() {
        let snapshot = compute_snapshot(&RunState::default(), Utc::now());

        assert_eq!(snapshot, ProgressSnapshot::default());
    }

    #[test]
    fn test_speed_and_eta() {
        let (state, now) = running(100, 20, 2);

        let snapshot = compute_snapshot(&state, now);

        assert_eq!(snapshot.processed_count, 20);
        assert_eq!(snapshot.total_count, 100);
        assert_eq!(snapshot.processing_speed, Some(10.0));
        assert_eq!(snapshot.estimated_completion, Some(now + TimeDelta::minutes(8)));
        assert!((snapshot.total_cost - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_speed_before_first_result() {
        let (state, now) = running(10, 0, 5);

        let snapshot = compute_snapshot(&state, now);

        assert!(snapshot.processing_speed.is_none());
        assert!(snapshot.estimated_completion.is_none());
    }

    #[test]
    fn test_no_speed_without_elapsed_time() {
        let start = Utc::now();
        let mut state = RunState::default();
        state.begin(Utf8PathBuf::from("/images"), 10, start);
        push(&mut state, true);

        assert!(compute_snapshot(&state, start).processing_speed.is_none());
    }

    #[test]
    fn test_no_eta_when_work_done() {
        let (state, now) = running(5, 5, 1);

        let snapshot = compute_snapshot(&state, now);

        assert_eq!(snapshot.processing_speed, Some(5.0));
        assert!(snapshot.estimated_completion.is_none());
    }

    #[test]
    fn test_finished_run_reports_zero_total() {
        let (mut state, now) = running(4, 0, 1);
        push(&mut state, true);
        push(&mut state, false);
        state.finish(RunOutcome::StoppedByPolicy);

        let snapshot = compute_snapshot(&state, now);

        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.total_count, 0);
        assert_eq!(snapshot.processed_count, 2);
        assert_eq!(snapshot.error_count, 1);
        assert!(snapshot.estimated_completion.is_none());
        assert_eq!(snapshot.outcome, Some(RunOutcome::StoppedByPolicy));
    }

    proptest! {
        #[test]
        fn prop_counts_are_consistent(
            total in 0usize..200,
            outcomes in proptest::collection::vec(any::<bool>(), 0..50),
            minutes in 0i64..120,
        ) {
            let start = Utc::now();
            let mut state = RunState::default();
            state.begin(Utf8PathBuf::from("/images"), total, start);
            for ok in &outcomes {
                push(&mut state, *ok);
            }
            let now = start + TimeDelta::minutes(minutes);

            let snapshot = compute_snapshot(&state, now);

            prop_assert_eq!(snapshot.processed_count, outcomes.len());
            prop_assert_eq!(snapshot.error_count, outcomes.iter().filter(|ok| !**ok).count());
            prop_assert!(snapshot.error_count <= snapshot.processed_count);
            if let Some(speed) = snapshot.processing_speed {
                prop_assert!(speed > 0.0);
            }
            if let Some(eta) = snapshot.estimated_completion {
                prop_assert!(eta >= now);
                prop_assert!(total > outcomes.len());
            }
        }
    }
}
