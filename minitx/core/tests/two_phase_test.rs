mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::*;
use minitx::resource::mock::{Behavior, Call};
use minitx::{
    GlobalTransactionId, HeuristicOutcome, RecordStatus, ResourceError, Status, StatusListener,
    TransactionError, Vote,
};

#[test]
fn test_single_resource_commits_in_one_phase() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let a = scripted("A");

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    coordinator.commit().unwrap();

    assert_eq!(tx.status(), Status::Committed);
    let calls = a.calls();
    assert!(calls.iter().all(|call| !call.is_prepare()));
    assert!(matches!(
        calls.last(),
        Some(Call::Commit {
            one_phase: true,
            ..
        })
    ));
    assert_eq!(records_of(&journal, tx.gtrid()), vec![(
        RecordStatus::StatusCommitted,
        names(&["A"])
    )]);
}

#[test]
fn test_all_yes_votes_commit() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b, c) = (scripted("A"), scripted("B"), scripted("C"));
    c.set_vote(Vote::ReadOnly);

    let tx = coordinator.begin().unwrap();
    for resource in [&a, &b, &c] {
        tx.enlist(resource.clone()).unwrap();
    }
    coordinator.commit().unwrap();

    assert_eq!(tx.status(), Status::Committed);
    assert_eq!(records_of(&journal, tx.gtrid()), vec![
        (RecordStatus::StatusPrepared, names(&["A", "B"])),
        (RecordStatus::StatusCommitted, names(&["A", "B"])),
    ]);
    assert_eq!(a.committed().len(), 1);
    assert_eq!(b.committed().len(), 1);
    assert!(c.calls().iter().all(|call| !call.is_commit()));

    for resource in [&a, &b, &c] {
        let calls = resource.calls();
        let end = calls.iter().position(|call| matches!(call, Call::End(_)));
        let prepare = calls.iter().position(Call::is_prepare);
        assert!(end.unwrap() < prepare.unwrap());
    }
}

#[test]
fn test_vote_no_rolls_back_everything() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));
    b.script_prepare(Behavior::Fail(ResourceError::Transient("disk full".into())));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, TransactionError::RolledBack { .. }));
    assert_eq!(tx.status(), Status::RolledBack);
    assert!(a.committed().is_empty() && b.committed().is_empty());
    assert_eq!(a.rolled_back().len(), 1);
    assert!(a.in_doubt().is_empty());
    assert_eq!(records_of(&journal, tx.gtrid()), vec![(
        RecordStatus::StatusRolledback,
        names(&["A", "B"])
    )]);
}

#[test]
fn test_read_only_transaction_writes_nothing() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));
    a.set_vote(Vote::ReadOnly);
    b.set_vote(Vote::ReadOnly);

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    coordinator.commit().unwrap();

    assert_eq!(tx.status(), Status::Committed);
    assert!(records_of(&journal, tx.gtrid()).is_empty());
    assert!(a.calls().iter().all(|call| !call.is_commit()));
}

#[test]
fn test_commit_failure_is_left_to_recovery() {
    let (config, _cleaner) = create_test_config();
    let (a, b) = (scripted("A"), scripted("B"));
    let (coordinator, journal) = open_coordinator(&config, &[&a, &b]);
    b.script_commit_once(Behavior::Fail(ResourceError::Transient("connection reset".into())));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, TransactionError::Heuristic {
        outcome: HeuristicOutcome::Hazard,
        ..
    }));
    assert_eq!(tx.status(), Status::Unknown);
    assert_eq!(a.committed().len(), 1);
    assert_eq!(b.in_doubt().len(), 1);
    assert_eq!(records_of(&journal, tx.gtrid()), vec![
        (RecordStatus::StatusPrepared, names(&["A", "B"])),
        (RecordStatus::StatusCommitted, names(&["A"])),
        (RecordStatus::StatusUnknown, names(&["B"])),
    ]);
    assert_eq!(coordinator.in_flight_count(), 0);

    let report = coordinator.recover_now().unwrap();
    assert_eq!(report.committed.len(), 1);
    assert!(b.in_doubt().is_empty());
    assert_eq!(
        records_of(&journal, tx.gtrid()).last(),
        Some(&(RecordStatus::StatusCommitted, names(&["B"])))
    );
    assert!(journal.collect_dangling().unwrap().is_empty());
}

#[test]
fn test_heuristic_rollback_is_reported() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));
    b.script_commit(Behavior::Fail(ResourceError::Heuristic(
        HeuristicOutcome::Rollback,
    )));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, TransactionError::Heuristic {
        outcome: HeuristicOutcome::Mixed,
        ..
    }));
    let report = coordinator.heuristic_report();
    assert_eq!(report.len(), 1);
    assert_eq!(report[0].resource, "B");
    assert_eq!(report[0].outcome, HeuristicOutcome::Rollback);
    assert!(report[0].decision.is_commit());
    assert!(b.calls().iter().any(|call| matches!(call, Call::Forget(_))));
    assert_eq!(
        records_of(&journal, tx.gtrid()).last(),
        Some(&(RecordStatus::StatusCommitted, names(&["A", "B"])))
    );
}

#[test]
fn test_phases_on_worker_pool() {
    let (mut config, _cleaner) = create_test_config();
    config.asynchronous_2pc = true;
    config.background_threads = 2;
    let (coordinator, _journal) = open_coordinator(&config, &[]);
    let resources: Vec<_> = ["A", "B", "C", "D"].into_iter().map(scripted).collect();

    let tx = coordinator.begin().unwrap();
    for resource in &resources {
        tx.enlist(resource.clone()).unwrap();
    }
    coordinator.commit().unwrap();
    assert_eq!(tx.status(), Status::Committed);
    assert!(resources.iter().all(|resource| resource.committed().len() == 1));
}

#[test]
fn test_hanging_prepare_times_out() {
    let (mut config, _cleaner) = create_test_config();
    config.asynchronous_2pc = true;
    config.branch_call_timeout_ms = 100;
    let (coordinator, _journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));
    b.script_prepare(Behavior::Hang(Duration::from_secs(1)));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    let started = Instant::now();
    let err = coordinator.commit().unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(matches!(err, TransactionError::RolledBack { .. }));
    assert_eq!(a.rolled_back().len(), 1);
    assert!(a.committed().is_empty());
}

#[test]
fn test_hanging_prepare_times_out_with_serial_calls() {
    let (mut config, _cleaner) = create_test_config();
    assert!(!config.asynchronous_2pc);
    config.branch_call_timeout_ms = 100;
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));
    b.script_prepare(Behavior::Hang(Duration::from_secs(1)));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    let started = Instant::now();
    let err = coordinator.commit().unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(matches!(err, TransactionError::RolledBack { .. }));
    assert_eq!(a.rolled_back().len(), 1);
    assert!(a.committed().is_empty() && b.committed().is_empty());
    assert!(
        records_of(&journal, tx.gtrid())
            .iter()
            .all(|(status, _)| *status != RecordStatus::StatusPrepared)
    );
}

#[test]
fn test_last_resource_commit() {
    let (mut config, _cleaner) = create_test_config();
    config.allow_last_resource_commit = true;
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, last) = (scripted("A"), scripted("LAST"));
    last.set_last_resource(true);

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(last.clone()).unwrap();
    coordinator.commit().unwrap();

    assert!(last.calls().iter().all(|call| !call.is_prepare()));
    assert!(last.calls().contains(&Call::Commit {
        xid: last.committed()[0].clone(),
        one_phase: true,
    }));
    assert_eq!(records_of(&journal, tx.gtrid()), vec![
        (RecordStatus::StatusPrepared, names(&["A", "LAST"])),
        (RecordStatus::StatusCommitted, names(&["A", "LAST"])),
    ]);

    // A failing last resource rolls back the prepared branches.
    last.script_commit(Behavior::Fail(ResourceError::Transient("lost".into())));
    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(last.clone()).unwrap();
    assert!(matches!(
        coordinator.commit(),
        Err(TransactionError::RolledBack { .. })
    ));
    assert_eq!(a.rolled_back().len(), 1);
    assert_eq!(records_of(&journal, tx.gtrid()), vec![(
        RecordStatus::StatusRolledback,
        names(&["A", "LAST"])
    )]);
}

#[test]
fn test_last_resource_requires_opt_in() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, _journal) = open_coordinator(&config, &[]);
    let last = scripted("LAST");
    last.set_last_resource(true);

    let tx = coordinator.begin().unwrap();
    assert!(matches!(
        tx.enlist(last),
        Err(TransactionError::EnlistmentRefused { .. })
    ));
    coordinator.rollback().unwrap();
}

#[test]
fn test_zero_resource_commit() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let tx = coordinator.begin().unwrap();
    coordinator.commit().unwrap();
    assert_eq!(tx.status(), Status::Committed);
    assert!(records_of(&journal, tx.gtrid()).is_empty());
}

struct Veto;

impl StatusListener for Veto {
    fn before_status_change(
        &self,
        _gtrid: &GlobalTransactionId,
        _from: Status,
        to: Status,
    ) -> Result<(), String> {
        match to {
            Status::Preparing => Err("audit trail unavailable".into()),
            _ => Ok(()),
        }
    }
}

#[test]
fn test_listener_veto_rolls_back() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, _journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    coordinator.register_status_listener(Arc::new(Veto)).unwrap();
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, TransactionError::RolledBack { .. }));
    assert_eq!(tx.status(), Status::RolledBack);
    assert!(a.calls().iter().all(|call| !call.is_prepare()));
    assert_eq!(b.rolled_back().len(), 1);
}

#[test]
fn test_rollback_only_never_prepares() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    coordinator.set_rollback_only().unwrap();
    let err = coordinator.commit().unwrap_err();

    assert!(matches!(err, TransactionError::RollbackOnly(_)));
    assert!(a.calls().iter().all(|call| !call.is_prepare()));
    assert_eq!(a.rolled_back().len(), 1);
    assert_eq!(records_of(&journal, tx.gtrid()), vec![(
        RecordStatus::StatusRolledback,
        names(&["A", "B"])
    )]);
}

#[test]
fn test_explicit_rollback() {
    let (config, _cleaner) = create_test_config();
    let (coordinator, journal) = open_coordinator(&config, &[]);
    let (a, b) = (scripted("A"), scripted("B"));

    let tx = coordinator.begin().unwrap();
    tx.enlist(a.clone()).unwrap();
    tx.enlist(b.clone()).unwrap();
    coordinator.rollback().unwrap();

    assert_eq!(tx.status(), Status::RolledBack);
    for resource in [&a, &b] {
        let calls = resource.calls();
        assert!(matches!(calls[1], Call::End(_)));
        assert!(calls[2].is_rollback());
    }
    assert_eq!(records_of(&journal, tx.gtrid()), vec![(
        RecordStatus::StatusRolledback,
        names(&["A", "B"])
    )]);
    assert_eq!(coordinator.in_flight_count(), 0);
}
