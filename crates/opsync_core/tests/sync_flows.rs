//! Multi-device flows through the operation log.

use opsync_core::{
    BackendJournal, CallContext, OperationLog, OplogConfig, OplogError, PullOptions, PushOptions,
    RealtimeNotifier,
};
use opsync_protocol::{DeviceId, Operation, OperationId, PushedOperation, TrackedEntity, UserId};
use opsync_testkit::prelude::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn ctx() -> CallContext {
    CallContext::background()
}

#[test]
fn end_to_end_duplicate_after_confirm() {
    let log = TestLog::new();

    log.push_as("alice", "A", vec![deal_op("op1", "alice", 100, "D1")])
        .unwrap();
    assert_eq!(log.pull_ids("alice", "B"), vec!["op1"]);
    assert_eq!(log.confirm_ids("alice", "B", &["op1"]), 1);

    let again = log
        .push_as("alice", "A", vec![deal_op("op1", "alice", 100, "D1")])
        .unwrap();
    assert!(again.appended.is_empty());
    assert_eq!(again.duplicates, vec![OperationId::from("op1")]);

    assert!(log.pull_ids("alice", "B").is_empty());
}

#[test]
fn duplicate_in_a_later_batch_keeps_one_copy() {
    let log = TestLog::new();
    log.push_as("alice", "A", vec![op("op1", "alice", 1), op("op2", "alice", 2)])
        .unwrap();
    let outcome = log
        .push_as("alice", "B", vec![op("op2", "alice", 2), op("op3", "alice", 3)])
        .unwrap();

    assert_eq!(outcome.appended, vec![OperationId::from("op3")]);
    assert_eq!(outcome.head_sequence, 3);
    assert_eq!(log.pull_ids("alice", "C"), vec!["op1", "op2", "op3"]);
}

#[test]
fn fresh_devices_see_the_same_order() {
    let log = TestLog::new();
    log.push_as(
        "alice",
        "A",
        vec![
            op("m", "alice", 30),
            op("b", "alice", 10),
            op("a", "alice", 30),
            op("z", "alice", 5),
        ],
    )
    .unwrap();
    log.push_as("alice", "B", vec![op("c", "alice", 10)]).unwrap();

    let first = log.pull_ids("alice", "fresh-1");
    assert_eq!(first, vec!["z", "b", "c", "a", "m"]);
    assert_eq!(log.pull_ids("alice", "fresh-2"), first);
    assert_eq!(log.pull_ids("alice", "fresh-1"), first);
}

#[test]
fn confirmed_ids_are_never_redelivered() {
    let log = TestLog::new();
    log.push_as("alice", "A", (1..=5).map(|n| op(&format!("op{n}"), "alice", n)).collect())
        .unwrap();

    assert_eq!(log.pull_ids("alice", "B").len(), 5);
    log.confirm_ids("alice", "B", &["op2", "op4"]);
    assert_eq!(log.pull_ids("alice", "B"), vec!["op1", "op3", "op5"]);

    log.push_as("alice", "A", vec![op("op6", "alice", 6)]).unwrap();
    log.confirm_ids("alice", "B", &["op1", "op3", "op5", "op6"]);
    assert!(log.pull_ids("alice", "B").is_empty());
    assert_eq!(log.cursor(&"alice".into(), &"B".into()).unwrap().confirmed_through, 6);

    log.reset_cursor(&ctx(), &"alice".into(), &"B".into()).unwrap();
    assert_eq!(log.pull_ids("alice", "B").len(), 6);
}

#[test]
fn confirm_of_unknown_ids_is_a_noop() {
    let log = TestLog::new();
    assert_eq!(log.confirm_ids("alice", "B", &["never-pushed"]), 0);
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    assert_eq!(log.confirm_ids("alice", "B", &["op1", "op1"]), 1);
    assert_eq!(log.confirm_ids("alice", "B", &["op1"]), 0);
}

#[test]
fn notifications_exclude_the_pushing_device() {
    let notifier = Arc::new(RealtimeNotifier::new(64).unwrap());
    let journal = Arc::new(BackendJournal::new(Box::new(SharedBackend::new())));
    let log = OperationLog::open(OplogConfig::default(), journal, notifier.clone()).unwrap();

    let alice = UserId::from("alice");
    let a = notifier.subscribe(alice.clone(), DeviceId::from("A"), 8);
    let b = notifier.subscribe(alice.clone(), DeviceId::from("B"), 8);
    let bob = notifier.subscribe(UserId::from("bob"), DeviceId::from("B"), 8);

    log.push(
        &ctx(),
        &alice,
        &DeviceId::from("A"),
        vec![op("op1", "alice", 1).into()],
        PushOptions::new(),
    )
    .unwrap();

    let signal = b.recv_timeout(Duration::from_secs(2)).expect("B is notified");
    assert_eq!(signal.user, alice);
    assert_eq!(signal.device, DeviceId::from("B"));
    assert!(a.recv_timeout(Duration::from_millis(100)).is_none());
    assert!(bob.try_recv().is_none());
    notifier.close();
}

#[test]
fn recorded_notifications_name_the_pusher() {
    let log = TestLog::new();
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();

    assert_eq!(
        log.notifier.calls(),
        vec![(UserId::from("alice"), vec![DeviceId::from("A")])]
    );
}

#[test]
fn get_is_scoped_by_entity_and_ignores_confirmation() {
    let log = TestLog::new();
    log.push_as(
        "alice",
        "A",
        vec![
            deal_op("d1-a", "alice", 1, "D1"),
            deal_op("d2-a", "alice", 2, "D2"),
            deal_op("d1-b", "alice", 3, "D1").tracking("contact", "C9"),
            op("note", "alice", 4),
        ],
    )
    .unwrap();
    log.sync_device("alice", "B");

    let d1 = log
        .get(&ctx(), &"alice".into(), &[TrackedEntity::new("deal", "D1")])
        .unwrap();
    assert_eq!(ids_of(&d1), vec!["d1-a", "d1-b"]);

    let either = log
        .get(
            &ctx(),
            &"alice".into(),
            &[TrackedEntity::new("contact", "C9"), TrackedEntity::new("deal", "D2")],
        )
        .unwrap();
    assert_eq!(ids_of(&either), vec!["d2-a", "d1-b"]);

    let other_user = log
        .get(&ctx(), &"bob".into(), &[TrackedEntity::new("deal", "D1")])
        .unwrap();
    assert!(other_user.is_empty());
}

#[test]
fn search_matches_type_and_hint() {
    let log = TestLog::new();
    log.push_as(
        "alice",
        "A",
        vec![
            Operation::new("o1", "alice", 1, "deal", b"Acme Corp renewal".to_vec()),
            Operation::new("o2", "alice", 2, "deal", b"Globex expansion".to_vec()),
            Operation::new("o3", "alice", 3, "note", b"call acme".to_vec()),
        ],
    )
    .unwrap();

    let found = log.search(&ctx(), &"alice".into(), "deal", "acme").unwrap();
    assert_eq!(ids_of(&found), vec!["o1"]);

    let all_deals = log.search(&ctx(), &"alice".into(), "deal", "").unwrap();
    assert_eq!(ids_of(&all_deals), vec!["o1", "o2"]);

    let err = log.search(&ctx(), &"alice".into(), "", "acme").unwrap_err();
    assert!(matches!(err, OplogError::InvalidArgument(_)));
}

#[test]
fn search_results_are_capped() {
    let log = TestLog::with_config(OplogConfig::default().with_max_search_results(2));
    log.push_as("alice", "A", (1..=5).map(|n| op(&format!("op{n}"), "alice", n)).collect())
        .unwrap();
    let found = log.search(&ctx(), &"alice".into(), "note", "note").unwrap();
    assert_eq!(ids_of(&found), vec!["op1", "op2"]);
}

#[test]
fn one_of_two_confirmations_never_prunes() {
    let log = TestLog::with_config(OplogConfig::default().with_retention_grace(Duration::ZERO));
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    log.pull_ids("alice", "B");

    log.advance(Duration::from_secs(3600));
    assert_eq!(log.sweep(&ctx()).unwrap().pruned, 0);
    assert_eq!(log.pull_ids("alice", "B"), vec!["op1"]);

    log.confirm_ids("alice", "B", &["op1"]);
    let summary = log.user_summary(&"alice".into()).unwrap();
    assert_eq!(summary.live_operations, 0);
    assert_eq!(summary.pruned_total, 1);
}

#[test]
fn grace_period_delays_pruning() {
    let config = OplogConfig::default()
        .with_retention_grace(Duration::from_secs(60))
        .with_sweep_on_confirm(false);
    let log = TestLog::with_config(config);
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    log.sync_device("alice", "B");

    assert_eq!(log.sweep(&ctx()).unwrap().pruned, 0);
    log.advance(Duration::from_secs(61));
    let report = log.sweep(&ctx()).unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(report.users, 1);
    assert_eq!(log.stats().pruned(), 1);
}

#[test]
fn pruned_ids_stay_duplicates() {
    let log = TestLog::with_config(OplogConfig::default().with_retention_grace(Duration::ZERO));
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    log.sync_device("alice", "B");
    assert_eq!(log.user_summary(&"alice".into()).unwrap().live_operations, 0);

    let outcome = log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    assert!(outcome.appended.is_empty());
    assert_eq!(outcome.head_sequence, 1);
    assert!(log.pull_ids("alice", "C").is_empty());
}

#[test]
fn late_devices_learn_about_the_history_gap() {
    let log = TestLog::with_config(OplogConfig::default().with_retention_grace(Duration::ZERO));
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();
    log.sweep(&ctx()).unwrap();

    let pulled = log
        .pull(&ctx(), &"alice".into(), &"late".into(), PullOptions::new())
        .unwrap();
    assert!(pulled.operations.is_empty());
    assert!(pulled.history_gap);
    assert_eq!(pulled.head_sequence, 1);
}

#[test]
fn large_operations_can_be_deferred() {
    let log = TestLog::with_config(OplogConfig::default().with_large_operation_threshold(16));
    log.push_as(
        "alice",
        "A",
        vec![
            op("small", "alice", 1),
            Operation::new("photo", "alice", 2, "attachment", vec![7u8; 1024])
                .tracking("deal", "D1"),
        ],
    )
    .unwrap();

    let light = log
        .pull(
            &ctx(),
            &"alice".into(),
            &"watch".into(),
            PullOptions::new().ignoring_large_operations(),
        )
        .unwrap();
    assert_eq!(ids_of(&light.operations), vec!["small"]);
    assert_eq!(light.skipped_large, vec![OperationId::from("photo")]);

    let fetched = log
        .get(&ctx(), &"alice".into(), &[TrackedEntity::new("deal", "D1")])
        .unwrap();
    assert_eq!(ids_of(&fetched), vec!["photo"]);
}

#[test]
fn share_with_fans_out_to_counterparties() {
    let log = TestLog::new();
    let shared = PushedOperation::from(deal_op("deal-1", "alice", 1, "D1"))
        .share_with("bob")
        .share_with("carol")
        .share_with("alice");
    let outcome = log
        .push(&ctx(), &"alice".into(), &"A".into(), vec![shared], PushOptions::new())
        .unwrap();

    assert_eq!(outcome.shared, 2);
    assert!(outcome.fanout_failures.is_empty());
    assert_eq!(log.pull_ids("bob", "bob-phone"), vec!["deal-1"]);
    assert_eq!(log.pull_ids("carol", "carol-phone"), vec!["deal-1"]);
    assert_eq!(log.notifier.count_for("bob"), 1);
    assert_eq!(log.notifier.count_for("alice"), 1);

    let bob_view = log
        .get(&ctx(), &"bob".into(), &[TrackedEntity::new("deal", "D1")])
        .unwrap();
    assert_eq!(bob_view[0].author, UserId::from("alice"));
}

#[test]
fn invalid_batches_append_nothing() {
    let log = TestLog::new();
    let result = log.push_as(
        "alice",
        "A",
        vec![op("ok", "alice", 1), Operation::new("bad", "alice", 2, "", Vec::new())],
    );
    assert!(matches!(result, Err(OplogError::InvalidArgument(_))));
    assert!(log.pull_ids("alice", "B").is_empty());
    assert!(log.notifier.calls().is_empty());

    let result = log.push_as("alice", "", vec![op("ok", "alice", 1)]);
    assert!(matches!(result, Err(OplogError::InvalidArgument(_))));
    assert_eq!(log.stats().errors(), 2);
}

#[test]
fn expired_deadline_aborts_cleanly() {
    let log = TestLog::new();
    let expired = CallContext::with_timeout(Duration::ZERO);
    thread::sleep(Duration::from_millis(5));

    let err = log
        .push(
            &expired,
            &"alice".into(),
            &"A".into(),
            vec![op("op1", "alice", 1).into()],
            PushOptions::new(),
        )
        .unwrap_err();
    assert!(matches!(err, OplogError::Timeout));
    assert!(err.is_retryable());
    assert_eq!(log.journal_size().unwrap(), 0);
}

#[test]
fn unavailable_storage_rejects_the_whole_batch() {
    let log = TestLog::new();
    log.push_as("alice", "A", vec![op("op1", "alice", 1)]).unwrap();

    log.backend().set_unavailable(true);
    let err = log
        .push_as("alice", "A", vec![op("op2", "alice", 2), op("op3", "alice", 3)])
        .unwrap_err();
    assert!(matches!(err, OplogError::StorageUnavailable(_)));
    assert!(err.is_retryable());

    log.backend().set_unavailable(false);
    assert_eq!(log.pull_ids("alice", "B"), vec!["op1"]);

    let retried = log
        .push_as("alice", "A", vec![op("op2", "alice", 2), op("op3", "alice", 3)])
        .unwrap();
    assert_eq!(retried.appended.len(), 2);
    assert_eq!(retried.head_sequence, 3);
}

#[test]
fn concurrent_pushes_keep_sequences_contiguous() {
    let log = Arc::new(TestLog::new());
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let log = Arc::clone(&log);
            thread::spawn(move || {
                for n in 0..25 {
                    let id = format!("t{t}-{n}");
                    log.push_as("alice", &format!("dev{t}"), vec![op(&id, "alice", n)])
                        .unwrap();
                    log.push_as("bob", &format!("dev{t}"), vec![op(&id, "bob", n)])
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for user in ["alice", "bob"] {
        let summary = log.user_summary(&user.into()).unwrap();
        assert_eq!(summary.head, 100);
        assert_eq!(summary.live_operations, 100);
        assert_eq!(log.pull_ids(user, "reader").len(), 100);
    }
}

#[test]
fn readers_never_see_part_of_a_batch() {
    const BATCHES: usize = 40;
    const BATCH: usize = 5;
    let log = Arc::new(TestLog::new());
    let done = Arc::new(AtomicBool::new(false));
    let deal = [TrackedEntity::new("deal", "D1")];

    let writer = {
        let log = Arc::clone(&log);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for batch in 0..BATCHES {
                let ops = (0..BATCH)
                    .map(|n| {
                        let seq = batch * BATCH + n;
                        deal_op(&format!("op{seq:03}"), "alice", seq as u64, "D1")
                    })
                    .collect();
                log.push_as("alice", "A", ops).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    loop {
        let finished = done.load(Ordering::SeqCst);
        let tracked = log.get(&ctx(), &"alice".into(), &deal).unwrap();
        assert_eq!(tracked.len() % BATCH, 0, "get saw {} operations", tracked.len());
        let pulled = log.pull_ids("alice", "B");
        assert_eq!(pulled.len() % BATCH, 0, "pull saw {} operations", pulled.len());
        if finished {
            break;
        }
    }
    writer.join().unwrap();

    assert_eq!(log.pull_ids("alice", "B").len(), BATCHES * BATCH);
    assert_eq!(log.get(&ctx(), &"alice".into(), &deal).unwrap().len(), BATCHES * BATCH);
}

#[test]
fn concurrent_confirms_of_different_devices() {
    let log = Arc::new(TestLog::with_config(OplogConfig::default().with_sweep_on_confirm(false)));
    let ids: Vec<String> = (0..50).map(|n| format!("op{n}")).collect();
    log.push_as("alice", "A", ids.iter().map(|id| op(id, "alice", 1)).collect())
        .unwrap();

    let handles: Vec<_> = ["B", "C", "D"]
        .into_iter()
        .map(|device| {
            let log = Arc::clone(&log);
            let ids = ids.clone();
            thread::spawn(move || {
                for id in ids.iter().rev() {
                    log.confirm_ids("alice", device, &[id.as_str()]);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for device in ["B", "C", "D"] {
        let cursor = log.cursor(&"alice".into(), &device.into()).unwrap();
        assert_eq!(cursor.confirmed_through, 50);
        assert!(log.pull_ids("alice", device).is_empty());
    }
}
