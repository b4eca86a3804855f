//! Task store integration tests.

use dispatchd::db::{Database, now_ms};
use dispatchd::types::{CycleCompletion, NewTask, TaskStatus};

fn setup_db() -> Database {
    Database::open_in_memory().expect("Failed to create test database")
}

mod enqueue {
    use super::*;

    #[test]
    fn applies_defaults() {
        let db = setup_db();
        let id = db.enqueue(NewTask::new("write report")).unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.priority, 5);
        assert_eq!(task.max_retries, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt_count, 0);
        assert!(task.started_at.is_none());
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn ids_are_monotonic() {
        let db = setup_db();
        let a = db.enqueue(NewTask::new("a")).unwrap();
        let b = db.enqueue(NewTask::new("b")).unwrap();
        assert!(b > a);
    }

    #[test]
    fn missing_task_is_none() {
        let db = setup_db();
        assert!(db.get_task(999).unwrap().is_none());
    }

    #[test]
    fn skills_round_trip() {
        let db = setup_db();
        let id = db
            .enqueue(NewTask::new("t").with_skills(vec!["email".into(), "calendar".into()]))
            .unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.skills, vec!["email", "calendar"]);
    }
}

mod source_dedup {
    use super::*;

    #[test]
    fn active_only_allows_refire_after_terminal() {
        let db = setup_db();
        let id = db
            .enqueue(NewTask::new("check inbox").with_source("inbox:msg-42"))
            .unwrap();

        // unresolved occurrence suppresses duplicates
        assert!(db.exists_for_source("inbox:msg-42", true).unwrap());
        db.mark_active(id).unwrap();
        assert!(db.exists_for_source("inbox:msg-42", true).unwrap());

        // terminal state frees the source key for re-firing
        db.mark_completed(id, "done", None).unwrap();
        assert!(!db.exists_for_source("inbox:msg-42", true).unwrap());

        // but history still counts without active_only
        assert!(db.exists_for_source("inbox:msg-42", false).unwrap());
    }

    #[test]
    fn unknown_source_is_absent() {
        let db = setup_db();
        assert!(!db.exists_for_source("nope", true).unwrap());
        assert!(!db.exists_for_source("nope", false).unwrap());
    }
}

mod ordering {
    use super::*;

    #[test]
    fn priority_then_insertion_order() {
        let db = setup_db();
        let b = db.enqueue(NewTask::new("B").with_priority(5)).unwrap();
        let c = db.enqueue(NewTask::new("C").with_priority(3)).unwrap();
        let a = db.enqueue(NewTask::new("A").with_priority(5)).unwrap();

        let pending: Vec<i64> = db.list_pending().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(pending, vec![c, b, a]);
    }

    #[test]
    fn deferred_tasks_are_invisible_until_due() {
        let db = setup_db();
        let mut future = NewTask::new("later");
        future.scheduled_for = Some(now_ms() + 3_600_000);
        db.enqueue(future).unwrap();

        let mut past = NewTask::new("now");
        past.scheduled_for = Some(now_ms() - 1_000);
        let due = db.enqueue(past).unwrap();

        let pending: Vec<i64> = db.list_pending().unwrap().iter().map(|t| t.id).collect();
        assert_eq!(pending, vec![due]);
    }
}

mod transitions {
    use super::*;

    #[test]
    fn mark_active_stamps_and_counts() {
        let db = setup_db();
        let id = db.enqueue(NewTask::new("t")).unwrap();

        db.mark_active(id).unwrap();
        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.attempt_count, 1);
        assert!(task.started_at.is_some());
    }

    #[test]
    fn requeue_clears_started_at_keeps_attempts() {
        let db = setup_db();
        let id = db.enqueue(NewTask::new("t")).unwrap();
        db.mark_active(id).unwrap();
        db.requeue(id).unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.started_at.is_none());
        assert_eq!(task.attempt_count, 1);

        // second attempt counts onward from the first
        db.mark_active(id).unwrap();
        assert_eq!(db.get_task(id).unwrap().unwrap().attempt_count, 2);
    }

    #[test]
    fn blocked_is_resumable_without_completion_stamp() {
        let db = setup_db();
        let id = db.enqueue(NewTask::new("t")).unwrap();
        db.mark_active(id).unwrap();
        db.mark_blocked(id, "waiting on approval").unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.completed_at.is_none());
        assert_eq!(task.result_summary.as_deref(), Some("waiting on approval"));
    }

    #[test]
    fn terminal_states_stamp_completed_at() {
        let db = setup_db();
        let done = db.enqueue(NewTask::new("done")).unwrap();
        db.mark_completed(done, "ok", Some("details")).unwrap();
        let task = db.get_task(done).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.completed_at.is_some());
        assert_eq!(task.result_detail.as_deref(), Some("details"));

        let bad = db.enqueue(NewTask::new("bad")).unwrap();
        db.mark_failed(bad, "boom").unwrap();
        let task = db.get_task(bad).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn cost_accounting_round_trip() {
        let db = setup_db();
        let id = db.enqueue(NewTask::new("t")).unwrap();
        db.update_cost(id, 0.42, 0.40, 1200, 300).unwrap();

        let task = db.get_task(id).unwrap().unwrap();
        assert!((task.cost_usd - 0.42).abs() < 1e-9);
        assert!((task.api_cost_usd - 0.40).abs() < 1e-9);
        assert_eq!(task.tokens_in, 1200);
        assert_eq!(task.tokens_out, 300);
    }
}

mod cycles {
    use super::*;

    #[test]
    fn append_then_update_once() {
        let db = setup_db();
        let task_id = db.enqueue(NewTask::new("t")).unwrap();
        let cycle_id = db
            .append_cycle(Some(task_id), &["email".to_string()])
            .unwrap();

        db.update_cycle(
            cycle_id,
            &CycleCompletion {
                cost_usd: 0.1,
                tokens_in: 500,
                tokens_out: 100,
                summary: Some("handled".into()),
            },
        )
        .unwrap();

        let recent = db.list_recent_cycles(10).unwrap();
        assert_eq!(recent.len(), 1);
        let cycle = &recent[0];
        assert_eq!(cycle.task_id, Some(task_id));
        assert_eq!(cycle.skills, vec!["email"]);
        assert_eq!(cycle.summary.as_deref(), Some("handled"));
        assert!(cycle.completed_at.is_some());
        assert!(cycle.duration_ms.is_some());
    }

    #[test]
    fn recent_window_is_newest_first_and_bounded() {
        let db = setup_db();
        let mut ids = Vec::new();
        for _ in 0..5 {
            ids.push(db.append_cycle(None, &[]).unwrap());
        }

        let recent = db.list_recent_cycles(3).unwrap();
        let got: Vec<i64> = recent.iter().map(|c| c.id).collect();
        assert_eq!(got, vec![ids[4], ids[3], ids[2]]);
    }
}

mod sensors {
    use super::*;

    #[test]
    fn first_claim_succeeds_and_writes_state() {
        let db = setup_db();
        assert!(db.claim_sensor_run("inbox", 60).unwrap());

        let state = db.get_sensor_state("inbox").unwrap().unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.last_result, "running");
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn claim_within_window_refuses_without_write() {
        let db = setup_db();
        assert!(db.claim_sensor_run("inbox", 60).unwrap());
        let before = db.get_sensor_state("inbox").unwrap().unwrap();

        assert!(!db.claim_sensor_run("inbox", 60).unwrap());
        let after = db.get_sensor_state("inbox").unwrap().unwrap();
        assert_eq!(after.last_ran, before.last_ran);
        assert_eq!(after.version, before.version);
    }

    #[test]
    fn elapsed_window_reclaims_with_bumped_version() {
        let db = setup_db();
        assert!(db.claim_sensor_run("inbox", 0).unwrap());
        assert!(db.claim_sensor_run("inbox", 0).unwrap());

        let state = db.get_sensor_state("inbox").unwrap().unwrap();
        assert_eq!(state.version, 2);
    }

    #[test]
    fn failure_counter_accumulates_and_resets_on_claim() {
        let db = setup_db();
        db.claim_sensor_run("flaky", 0).unwrap();
        db.record_sensor_result("flaky", false).unwrap();
        db.claim_sensor_run("flaky", 0).unwrap();
        // claim resets the counter before the run
        assert_eq!(
            db.get_sensor_state("flaky").unwrap().unwrap().consecutive_failures,
            0
        );

        db.record_sensor_result("flaky", false).unwrap();
        let state = db.get_sensor_state("flaky").unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 1);
        assert_eq!(state.last_result, "error");

        db.record_sensor_result("flaky", true).unwrap();
        let state = db.get_sensor_state("flaky").unwrap().unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.last_result, "ok");
    }

    #[test]
    fn unknown_sensor_has_no_state() {
        let db = setup_db();
        assert!(db.get_sensor_state("never-ran").unwrap().is_none());
    }
}
