//! Queued operation registry tests.
//!
//! Exercises scheduling the way the router and an orchestrating caller use
//! it: enqueue, poll for ready work, report results, inspect batches.

use std::time::Duration;

use gridlink_server::operations::{OperationError, OperationRegistry, OperationStatus, QueuedOperation};
use serde_json::json;

fn op(id: &str) -> QueuedOperation {
    QueuedOperation::new("s1", "write_cell", json!({ "id": id })).with_id(id)
}

fn pending_ids(reg: &OperationRegistry, session: &str) -> Vec<String> {
    reg.get_pending_operations(session).into_iter().map(|o| o.id).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Readiness and ordering
// ─────────────────────────────────────────────────────────────────────────────

mod readiness {
    use super::*;

    #[test]
    fn assigns_id_when_missing() {
        let reg = OperationRegistry::new();
        let id = reg
            .queue_operation(QueuedOperation::new("s1", "read_range", json!({})))
            .unwrap();
        assert!(!id.is_empty());
        let stored = reg.get_operation(&id).unwrap();
        assert_eq!(stored.status, OperationStatus::Queued);
        assert!(stored.created_at.is_some());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        assert_eq!(
            reg.queue_operation(op("a")),
            Err(OperationError::DuplicateId("a".into()))
        );
    }

    #[test]
    fn never_returns_operation_with_incomplete_dependency() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.queue_operation(op("b")).unwrap();
        reg.queue_operation(op("c").depends_on(["a", "b"])).unwrap();

        assert_eq!(pending_ids(&reg, "s1"), vec!["a", "b"]);

        reg.mark_operation_complete("a", json!(null)).unwrap();
        assert_eq!(pending_ids(&reg, "s1"), vec!["b"]);

        reg.mark_operation_in_progress("b").unwrap();
        assert!(pending_ids(&reg, "s1").is_empty());

        reg.mark_operation_complete("b", json!(null)).unwrap();
        assert_eq!(pending_ids(&reg, "s1"), vec!["c"]);
    }

    #[test]
    fn priority_descending_with_stable_ties() {
        let reg = OperationRegistry::new();
        for (id, pri) in [("p5", 5), ("p1", 1), ("p9a", 9), ("p9b", 9)] {
            reg.queue_operation(op(id).with_priority(pri)).unwrap();
        }
        assert_eq!(pending_ids(&reg, "s1"), vec!["p9a", "p9b", "p5", "p1"]);
    }

    #[test]
    fn pending_is_scoped_to_session() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("mine")).unwrap();
        reg.queue_operation(QueuedOperation::new("s2", "t", json!(null)).with_id("theirs"))
            .unwrap();
        assert_eq!(pending_ids(&reg, "s1"), vec!["mine"]);
        assert_eq!(pending_ids(&reg, "s2"), vec!["theirs"]);
    }

    #[test]
    fn chain_scenario_completes_then_fails() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("A").with_priority(1)).unwrap();
        reg.queue_operation(op("B").depends_on(["A"]).with_priority(5)).unwrap();

        assert_eq!(pending_ids(&reg, "s1"), vec!["A"]);
        reg.mark_operation_complete("A", json!({"ok": true})).unwrap();
        assert_eq!(pending_ids(&reg, "s1"), vec!["B"]);

        reg.mark_operation_failed("B", "sheet locked").unwrap();
        assert!(pending_ids(&reg, "s1").is_empty());
        let b = reg.get_operation("B").unwrap();
        assert_eq!(b.status, OperationStatus::Failed);
        assert_eq!(b.error.as_deref(), Some("sheet locked"));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transitions and cascade
// ─────────────────────────────────────────────────────────────────────────────

mod cascade {
    use super::*;

    #[test]
    fn failure_cancels_every_transitive_dependent() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("root")).unwrap();
        reg.queue_operation(op("child").depends_on(["root"])).unwrap();
        reg.queue_operation(op("grandchild").depends_on(["child"])).unwrap();
        reg.queue_operation(op("unrelated")).unwrap();

        let mut cancelled = reg.mark_operation_failed("root", "boom").unwrap();
        cancelled.sort();
        assert_eq!(cancelled, vec!["child", "grandchild"]);

        for id in ["child", "grandchild"] {
            let o = reg.get_operation(id).unwrap();
            assert_eq!(o.status, OperationStatus::Cancelled);
            assert_eq!(o.error.as_deref(), Some("dependency root failed: boom"));
            assert!(o.completed_at.is_some());
        }
        assert_eq!(reg.get_operation("unrelated").unwrap().status, OperationStatus::Queued);
        assert_eq!(pending_ids(&reg, "s1"), vec!["unrelated"]);
    }

    #[test]
    fn in_progress_dependents_are_cancelled_too() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.queue_operation(op("b").depends_on(["a"])).unwrap();
        reg.mark_operation_in_progress("b").unwrap();

        assert_eq!(reg.mark_operation_failed("a", "x").unwrap(), vec!["b"]);
        assert_eq!(reg.get_operation("b").unwrap().status, OperationStatus::Cancelled);
    }

    #[test]
    fn dependent_of_failed_operation_is_cancelled_on_arrival() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.mark_operation_failed("a", "x").unwrap();

        reg.queue_operation(op("late").depends_on(["a"])).unwrap();
        let late = reg.get_operation("late").unwrap();
        assert_eq!(late.status, OperationStatus::Cancelled);
        assert_eq!(late.error.as_deref(), Some("dependency a failed"));
        assert!(pending_ids(&reg, "s1").is_empty());
    }

    #[test]
    fn explicit_cancel_cascades() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.queue_operation(op("b").depends_on(["a"])).unwrap();

        assert_eq!(reg.cancel_operation("a", "user aborted").unwrap(), vec!["b"]);
        assert_eq!(reg.get_operation("a").unwrap().status, OperationStatus::Cancelled);
        assert_eq!(
            reg.get_operation("b").unwrap().error.as_deref(),
            Some("dependency a cancelled: user aborted")
        );
    }

    #[test]
    fn terminal_states_are_final() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.mark_operation_complete("a", json!(1)).unwrap();

        assert!(matches!(
            reg.mark_operation_failed("a", "late"),
            Err(OperationError::InvalidTransition {
                from: OperationStatus::Completed,
                to: OperationStatus::Failed,
                ..
            })
        ));
        assert!(reg.mark_operation_in_progress("a").is_err());
        assert!(reg.cancel_operation("a", "nope").is_err());
        assert_eq!(reg.get_operation("a").unwrap().result, Some(json!(1)));
    }

    #[test]
    fn unknown_operation_is_not_found() {
        let reg = OperationRegistry::new();
        assert_eq!(
            reg.mark_operation_complete("ghost", json!(null)),
            Err(OperationError::NotFound("ghost".into()))
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batches
// ─────────────────────────────────────────────────────────────────────────────

mod batches {
    use super::*;

    #[test]
    fn batch_lists_exactly_its_members_regardless_of_status() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("outsider")).unwrap();
        let batch = reg
            .create_batch("s1", vec![op("op1"), op("op2"), op("op3")])
            .unwrap();

        reg.mark_operation_complete("op1", json!(null)).unwrap();
        reg.mark_operation_failed("op2", "bad range").unwrap();

        let ids: Vec<String> = reg
            .get_batch_operations(&batch)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["op1", "op2", "op3"]);

        let progress = reg.get_batch_progress(&batch).unwrap();
        assert_eq!(progress.total, 3);
        assert_eq!(progress.completed, 1);
        assert_eq!(progress.failed, 1);
        assert_eq!(progress.queued, 1);
        assert!(!progress.is_finished());
    }

    #[test]
    fn batch_members_carry_batch_and_session() {
        let reg = OperationRegistry::new();
        let batch = reg
            .create_batch("s7", vec![QueuedOperation::new("", "t", json!(null))])
            .unwrap();
        let ops = reg.get_batch_operations(&batch).unwrap();
        assert_eq!(ops[0].session_id, "s7");
        assert_eq!(ops[0].batch_id.as_deref(), Some(batch.as_str()));
    }

    #[test]
    fn batch_is_all_or_nothing() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("taken")).unwrap();

        let err = reg
            .create_batch("s1", vec![op("fresh"), op("taken")])
            .unwrap_err();
        assert_eq!(err, OperationError::DuplicateId("taken".into()));
        assert!(reg.get_operation("fresh").is_none());
        assert_eq!(reg.len(), 1);

        assert_eq!(reg.create_batch("s1", vec![]), Err(OperationError::EmptyBatch));
        assert!(matches!(
            reg.get_batch_operations("nope"),
            Err(OperationError::UnknownBatch(_))
        ));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Undo / redo
// ─────────────────────────────────────────────────────────────────────────────

mod history {
    use super::*;

    #[test]
    fn undo_then_redo_replays_original_input() {
        let reg = OperationRegistry::new();
        reg.queue_operation(
            QueuedOperation::new("s1", "write_cell", json!({"cell": "B2", "value": 42})).with_id("x"),
        )
        .unwrap();
        reg.mark_operation_complete("x", json!({"ok": true})).unwrap();

        let undo = reg.undo_last_operation().unwrap();
        assert_eq!(undo.kind, "undo_write_cell");
        assert_eq!(undo.input, json!({"cell": "B2", "value": 42}));
        assert_eq!(undo.session_id, "s1");
        assert_ne!(undo.id, "x");

        let redo = reg.redo_last_operation().unwrap();
        assert_eq!(redo.kind, "redo_write_cell");
        assert_eq!(redo.input, reg.get_operation("x").unwrap().input);
    }

    #[test]
    fn completing_new_work_clears_redo() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("x")).unwrap();
        reg.mark_operation_complete("x", json!(null)).unwrap();
        reg.undo_last_operation().unwrap();

        reg.queue_operation(op("y")).unwrap();
        reg.mark_operation_complete("y", json!(null)).unwrap();
        assert_eq!(reg.redo_last_operation(), Err(OperationError::NothingToRedo));

        let undo = reg.undo_last_operation().unwrap();
        assert_eq!(undo.input, json!({"id": "y"}));
    }

    #[test]
    fn empty_history() {
        let reg = OperationRegistry::new();
        assert_eq!(reg.undo_last_operation(), Err(OperationError::NothingToUndo));
        assert_eq!(reg.redo_last_operation(), Err(OperationError::NothingToRedo));
    }

    #[test]
    fn undo_walks_back_through_history() {
        let reg = OperationRegistry::new();
        for id in ["first", "second"] {
            reg.queue_operation(op(id)).unwrap();
            reg.mark_operation_complete(id, json!(null)).unwrap();
        }
        assert_eq!(reg.undo_last_operation().unwrap().input, json!({"id": "second"}));
        assert_eq!(reg.undo_last_operation().unwrap().input, json!({"id": "first"}));
        assert_eq!(reg.undo_last_operation(), Err(OperationError::NothingToUndo));
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cleanup
// ─────────────────────────────────────────────────────────────────────────────

mod cleanup {
    use super::*;

    #[test]
    fn removes_only_old_terminal_operations() {
        let reg = OperationRegistry::new();
        let batch = reg.create_batch("s1", vec![op("done"), op("open")]).unwrap();
        reg.mark_operation_complete("done", json!(null)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(reg.cleanup_old_operations(Duration::from_millis(5)), 1);
        assert!(reg.get_operation("done").is_none());
        assert!(reg.get_operation("open").is_some());

        let ids: Vec<String> = reg
            .get_batch_operations(&batch)
            .unwrap()
            .into_iter()
            .map(|o| o.id)
            .collect();
        assert_eq!(ids, vec!["open"]);
    }

    #[test]
    fn recent_terminal_operations_survive() {
        let reg = OperationRegistry::new();
        reg.queue_operation(op("a")).unwrap();
        reg.mark_operation_failed("a", "x").unwrap();
        assert_eq!(reg.cleanup_old_operations(Duration::from_secs(3600)), 0);
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test]
    async fn background_cleanup_stops_on_shutdown() {
        let reg = std::sync::Arc::new(OperationRegistry::new());
        reg.queue_operation(op("a")).unwrap();
        reg.mark_operation_complete("a", json!(null)).unwrap();

        let token = tokio_util::sync::CancellationToken::new();
        let task = reg.spawn_cleanup(Duration::from_millis(5), Duration::from_millis(1), token.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(reg.is_empty());

        token.cancel();
        task.await.unwrap();
    }
}
