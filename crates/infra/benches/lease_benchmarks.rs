use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use flowjob_core::{Entity, LockOwner, ManualClock, Persistent, TenantId};
use flowjob_infra::JobServiceConfig;
use flowjob_infra::jobs::{
    ClaimOutcome, InMemoryJobStore, JobRecord, JobStore, LeaseManager, ReleaseOutcome,
};

const LEASE: Duration = Duration::from_secs(30);

fn setup_manager() -> (LeaseManager<Arc<InMemoryJobStore>>, LockOwner) {
    let store = InMemoryJobStore::arc();
    let manager = LeaseManager::new(store, JobServiceConfig::default())
        .with_clock(Arc::new(ManualClock::deterministic()));
    (manager, LockOwner::new("bench-node").unwrap())
}

fn bench_lease_cycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("lease_cycle");
    group.sample_size(1000);

    group.bench_function("claim_release", |b| {
        let (manager, owner) = setup_manager();
        let mut job = JobRecord::new("timer", TenantId::new(""), 3);
        manager.store().insert_job(&mut job).unwrap();
        let id = *job.id();

        b.iter(|| {
            let claimed = manager.claim(black_box(id), &owner, LEASE).unwrap();
            assert!(matches!(claimed, ClaimOutcome::Claimed(_)));
            assert_eq!(manager.release(id, &owner).unwrap(), ReleaseOutcome::Released);
        });
    });

    group.bench_function("claim_contended", |b| {
        let (manager, owner) = setup_manager();
        let other = LockOwner::new("other-node").unwrap();
        let mut job = JobRecord::new("timer", TenantId::new(""), 3);
        manager.store().insert_job(&mut job).unwrap();
        let id = *job.id();
        let _ = manager.claim(id, &other, LEASE).unwrap();

        b.iter(|| manager.claim(black_box(id), &owner, LEASE).unwrap());
    });

    group.finish();
}

fn bench_acquire_due(c: &mut Criterion) {
    let mut group = c.benchmark_group("acquire_due");

    for batch_size in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("claim_batch", batch_size),
            batch_size,
            |b, &size| {
                let (manager, owner) = setup_manager();
                for _ in 0..size {
                    let mut job = JobRecord::new("timer", TenantId::new(""), 3);
                    manager.store().insert_job(&mut job).unwrap();
                }

                b.iter(|| {
                    let jobs = manager.acquire_due(&owner, LEASE, size).unwrap();
                    for job in &jobs {
                        let _ = manager.release(*job.id(), &owner).unwrap();
                    }
                    black_box(jobs.len())
                });
            },
        );
    }

    group.finish();
}

fn bench_state_diff(c: &mut Criterion) {
    let mut group = c.benchmark_group("state_diff");

    group.bench_function("unchanged", |b| {
        let job = JobRecord::new("timer", TenantId::new(""), 3);
        let baseline = job.persistent_state();
        b.iter(|| black_box(baseline.diff(&job.persistent_state())));
    });

    group.bench_function("retries_and_message", |b| {
        let mut job = JobRecord::new("timer", TenantId::new(""), 3);
        let baseline = job.persistent_state();
        let limit = JobServiceConfig::default().exception_message_limit;
        job.set_retries(2);
        job.set_exception_message("handler failed", &limit);
        b.iter(|| black_box(baseline.diff(&job.persistent_state())));
    });

    group.finish();
}

criterion_group!(benches, bench_lease_cycle, bench_acquire_due, bench_state_diff);
criterion_main!(benches);
