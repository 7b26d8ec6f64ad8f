//! End-to-end lease protocol scenarios against the in-memory store.

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use flowjob_core::{Clock, Entity, LockOwner, ManualClock, TenantId};
use flowjob_infra::JobServiceConfig;
use flowjob_infra::jobs::{
    ClaimOutcome, FailureOutcome, HandlerError, InMemoryJobStore, JobRecord, JobStore,
    LeaseManager, RenewOutcome,
};

const LEASE: Duration = Duration::from_secs(30);

fn owner(name: &str) -> LockOwner {
    LockOwner::new(name).unwrap()
}

fn manager_with_clock(
    store: Arc<InMemoryJobStore>,
    clock: Arc<ManualClock>,
) -> LeaseManager<Arc<InMemoryJobStore>> {
    LeaseManager::new(store, JobServiceConfig::default()).with_clock(clock)
}

#[test]
fn concurrent_claims_have_exactly_one_winner() {
    flowjob_observability::init();
    let store = InMemoryJobStore::arc();
    let clock = Arc::new(ManualClock::deterministic());
    let mut job = JobRecord::new("async-continuation", TenantId::new(""), 3);
    store.insert_job(&mut job).unwrap();
    let job_id = *job.id();

    const CLAIMANTS: usize = 16;
    let barrier = Arc::new(Barrier::new(CLAIMANTS));
    let winners: Vec<bool> = (0..CLAIMANTS)
        .map(|i| {
            let manager = manager_with_clock(store.clone(), clock.clone());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                matches!(
                    manager.claim(job_id, &owner(&format!("node-{i}")), LEASE).unwrap(),
                    ClaimOutcome::Claimed(_)
                )
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(winners.iter().filter(|w| **w).count(), 1);
}

#[test]
fn expired_lease_is_reclaimed_and_previous_owner_loses_it() {
    let store = InMemoryJobStore::arc();
    let clock = Arc::new(ManualClock::deterministic());
    let manager = manager_with_clock(store.clone(), clock.clone());
    let mut job = JobRecord::new("timer", TenantId::new(""), 3);
    store.insert_job(&mut job).unwrap();
    let id = *job.id();

    let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
    clock.advance(Duration::from_secs(10));
    assert!(matches!(
        manager.claim(id, &owner("b"), LEASE).unwrap(),
        ClaimOutcome::AlreadyClaimed
    ));

    clock.advance(LEASE);
    let reclaimed = manager.claim(id, &owner("b"), LEASE).unwrap().into_job().unwrap();
    assert!(reclaimed.is_locked_by(&owner("b"), clock.now()));

    assert_eq!(manager.renew(id, &owner("a"), LEASE).unwrap(), RenewOutcome::LostOwnership);
    assert!(matches!(
        manager.renew(id, &owner("b"), LEASE).unwrap(),
        RenewOutcome::Renewed { .. }
    ));
}

#[test]
fn expired_owner_renewing_races_a_new_claimant() {
    let store = InMemoryJobStore::arc();
    let clock = Arc::new(ManualClock::deterministic());
    let manager = manager_with_clock(store.clone(), clock.clone());

    for _ in 0..50 {
        let mut job = JobRecord::new("timer", TenantId::new(""), 3);
        store.insert_job(&mut job).unwrap();
        let id = *job.id();
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        clock.advance(LEASE + Duration::from_secs(1));

        let barrier = Arc::new(Barrier::new(2));
        let renewer = {
            let manager = manager_with_clock(store.clone(), clock.clone());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                matches!(
                    manager.renew(id, &owner("a"), LEASE).unwrap(),
                    RenewOutcome::Renewed { .. }
                )
            })
        };
        let claimant = {
            let manager = manager_with_clock(store.clone(), clock.clone());
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                matches!(
                    manager.claim(id, &owner("b"), LEASE).unwrap(),
                    ClaimOutcome::Claimed(_)
                )
            })
        };
        let renewed = renewer.join().unwrap();
        let claimed = claimant.join().unwrap();
        assert!(renewed ^ claimed, "renewed={renewed} claimed={claimed}");

        let holder = if renewed { owner("a") } else { owner("b") };
        let stored = store.load_job(id).unwrap().unwrap();
        assert!(stored.is_locked_by(&holder, clock.now()));
    }
}

#[test]
fn renew_by_stranger_is_lost_ownership() {
    let store = InMemoryJobStore::arc();
    let manager = manager_with_clock(store.clone(), Arc::new(ManualClock::deterministic()));
    let mut job = JobRecord::new("timer", TenantId::new(""), 3);
    store.insert_job(&mut job).unwrap();

    assert_eq!(
        manager.renew(*job.id(), &owner("nobody"), LEASE).unwrap(),
        RenewOutcome::LostOwnership
    );
}

#[test]
fn one_retry_then_dead_letter() {
    let store = InMemoryJobStore::arc();
    let clock = Arc::new(ManualClock::deterministic());
    let manager = manager_with_clock(store.clone(), clock.clone());
    let mut job = JobRecord::new("service-task", TenantId::new(""), 1);
    store.insert_job(&mut job).unwrap();
    let id = *job.id();

    let long_message = "connection refused ".repeat(40);
    let detail = format!("{long_message}\n  at step 1\n  at step 2");
    let failure = HandlerError::new(long_message.clone()).with_detail(detail.clone());

    let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
    assert_eq!(
        manager.record_failure(id, &owner("a"), &failure).unwrap(),
        FailureOutcome::Retrying { remaining: 0 }
    );
    let after_first = store.load_job(id).unwrap().unwrap();
    assert_eq!(after_first.retries(), 0);
    assert!(after_first.lock().is_none());

    // Another instance picks it up.
    let _ = manager.claim(id, &owner("b"), LEASE).unwrap().into_job().unwrap();
    assert_eq!(
        manager.record_failure(id, &owner("b"), &failure).unwrap(),
        FailureOutcome::DeadLettered
    );

    assert!(store.load_job(id).unwrap().is_none());
    let dead = store.load_dead_letter(id).unwrap().unwrap();
    let message = dead.job.exception_message().unwrap();
    assert_eq!(message.chars().count(), 255);
    assert!(message.ends_with("..."));
    assert!(long_message.starts_with(message.trim_end_matches("...")));
    assert_eq!(dead.job.exception_detail(&store).unwrap(), Some(detail));

    // A dead-lettered job can no longer be claimed.
    assert!(manager.claim(id, &owner("c"), LEASE).is_err());
}

#[test]
fn failure_detail_keeps_a_single_blob_across_attempts() {
    let store = InMemoryJobStore::arc();
    let manager = manager_with_clock(store.clone(), Arc::new(ManualClock::deterministic()));
    let mut job = JobRecord::new("service-task", TenantId::new(""), 5);
    store.insert_job(&mut job).unwrap();
    let id = *job.id();

    for attempt in 0..3 {
        let _ = manager.claim(id, &owner("a"), LEASE).unwrap();
        let failure = HandlerError::new(format!("attempt {attempt}"));
        let _ = manager.record_failure(id, &owner("a"), &failure).unwrap();
    }

    assert_eq!(store.blob_count(), 1);
    let job = store.load_job(id).unwrap().unwrap();
    assert_eq!(job.exception_detail(&store).unwrap().as_deref(), Some("attempt 2"));
}
