//! Placement tests for the load balancer over a real gateway.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;

use hostgrid::gateway::{EventRouter, HostGateway, ServerMessage};
use hostgrid::hosts::{HostClaims, HostRegistry};
use hostgrid::scheduler::{
    DispatchOutcome, InMemoryJobStore, Job, JobQuery, JobStatus, JobStore, LoadBalancer,
    TaskDefinition,
};

fn setup() -> (Arc<HostGateway>, Arc<LoadBalancer>, Arc<InMemoryJobStore>) {
    let registry = Arc::new(HostRegistry::new(["A"]));
    let (tx, _rx) = mpsc::channel(16);
    let mut router = EventRouter::new();
    router.add_route("A", tx);
    let gateway = Arc::new(HostGateway::new(registry.clone(), router));
    let balancer = Arc::new(LoadBalancer::new(registry, gateway.clone()));
    (gateway, balancer, Arc::new(InMemoryJobStore::new()))
}

/// N jobs raced onto one host of capacity 2: exactly two get through.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_capacity_holds_under_concurrent_dispatch() {
    const NUM_JOBS: usize = 20;
    let (gateway, balancer, store) = setup();
    let (_id, _host, _rx) = gateway
        .connect("h1", &HostClaims::new("A").with_limit(2))
        .unwrap();
    let task = Arc::new(TaskDefinition::new("t", "task"));

    let mut jobs = Vec::new();
    for _ in 0..NUM_JOBS {
        let job = Job::new("t", "A");
        store.add(job.clone()).await.unwrap();
        jobs.push(job);
    }

    let handles: Vec<_> = jobs
        .into_iter()
        .map(|job| {
            let balancer = balancer.clone();
            let store = store.clone();
            let task = task.clone();
            tokio::spawn(async move {
                balancer
                    .dispatch(&*store, &job, &task, Utc::now())
                    .await
                    .unwrap()
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let dispatched = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Dispatched { .. }))
        .count();
    assert_eq!(dispatched, 2);
    assert_eq!(balancer.load("A", "h1"), 2);

    let starting = store
        .query(&JobQuery::status(JobStatus::Starting))
        .await
        .unwrap();
    let pending = store
        .query(&JobQuery::status(JobStatus::Pending))
        .await
        .unwrap();
    assert_eq!(starting.len(), 2);
    assert_eq!(pending.len(), NUM_JOBS - 2);
}

/// The same job dispatched twice at once is placed once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_job_is_never_assigned_twice() {
    let (gateway, balancer, store) = setup();
    let (_id, _host, mut rx) = gateway
        .connect("h1", &HostClaims::new("A").with_limit(10))
        .unwrap();
    let job = Job::new("t", "A");
    store.add(job.clone()).await.unwrap();
    let task = TaskDefinition::new("t", "task");

    let (a, b) = tokio::join!(
        balancer.dispatch(&*store, &job, &task, Utc::now()),
        balancer.dispatch(&*store, &job, &task, Utc::now()),
    );
    let outcomes = [a.unwrap(), b.unwrap()];
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, DispatchOutcome::Dispatched { .. }))
            .count(),
        1
    );
    assert_eq!(balancer.load("A", "h1"), 1);

    let mut executes = 0;
    while let Ok(msg) = rx.try_recv() {
        if matches!(msg, ServerMessage::Execute { .. }) {
            executes += 1;
        }
    }
    assert_eq!(executes, 1);
}

#[tokio::test]
async fn test_highest_priority_host_wins() {
    let (gateway, balancer, store) = setup();
    let (_i5, _h5, _rx5) = gateway
        .connect("p5", &HostClaims::new("A").with_priority(5).with_limit(4))
        .unwrap();
    let (_i10, _h10, mut rx10) = gateway
        .connect("p10", &HostClaims::new("A").with_priority(10).with_limit(4))
        .unwrap();

    let job = Job::new("t", "A").with_parameter("target", "prod");
    store.add(job.clone()).await.unwrap();

    let outcome = balancer
        .dispatch(&*store, &job, &TaskDefinition::new("t", "task"), Utc::now())
        .await
        .unwrap();
    assert_eq!(
        outcome,
        DispatchOutcome::Dispatched {
            host: "p10".into()
        }
    );

    match rx10.recv().await.unwrap() {
        ServerMessage::Execute {
            job_id, parameters, ..
        } => {
            assert_eq!(job_id, job.id);
            assert_eq!(
                parameters,
                HashMap::from([("target".to_string(), "prod".to_string())])
            );
        }
        other => panic!("unexpected frame: {:?}", other),
    }

    let stored = store.get(&job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Starting);
    assert_eq!(stored.assigned_host.as_deref(), Some("p10"));
}

#[tokio::test]
async fn test_no_host_defers_without_error() {
    let (_gateway, balancer, store) = setup();
    let job = Job::new("t", "A");
    store.add(job.clone()).await.unwrap();

    let outcome = balancer
        .dispatch(&*store, &job, &TaskDefinition::new("t", "task"), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Deferred);
    assert_eq!(
        store.get(&job.id).await.unwrap().unwrap().status,
        JobStatus::Pending
    );
}

#[tokio::test]
async fn test_disconnected_host_is_not_a_candidate() {
    let (gateway, balancer, store) = setup();
    let (id, _host, _rx) = gateway.connect("h1", &HostClaims::new("A")).unwrap();
    gateway.disconnect(id);

    let job = Job::new("t", "A");
    store.add(job.clone()).await.unwrap();
    let outcome = balancer
        .dispatch(&*store, &job, &TaskDefinition::new("t", "task"), Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Deferred);
}

/// One machine registered in two groups is two hosts: jobs reach the
/// connection of their own group and capacity is counted per group.
#[tokio::test]
async fn test_same_host_name_in_two_groups_stays_separate() {
    let registry = Arc::new(HostRegistry::new(["A", "B"]));
    let (a_tx, _a_events) = mpsc::channel(16);
    let (b_tx, _b_events) = mpsc::channel(16);
    let mut router = EventRouter::new();
    router.add_route("A", a_tx);
    router.add_route("B", b_tx);
    let gateway = Arc::new(HostGateway::new(registry.clone(), router));
    let balancer = LoadBalancer::new(registry, gateway.clone());
    let store = InMemoryJobStore::new();
    let task = TaskDefinition::new("t", "task");

    let (_a, _, mut a_rx) = gateway.connect("h1", &HostClaims::new("A")).unwrap();
    let (_b, _, mut b_rx) = gateway.connect("h1", &HostClaims::new("B")).unwrap();

    let in_a = Job::new("t", "A");
    store.add(in_a.clone()).await.unwrap();
    let outcome = balancer
        .dispatch(&store, &in_a, &task, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Dispatched { host: "h1".into() });
    assert!(matches!(
        a_rx.try_recv().unwrap(),
        ServerMessage::Execute { job_id, .. } if job_id == in_a.id
    ));
    assert!(b_rx.try_recv().is_err());

    // The A registration is full; the B registration still has its slot.
    let in_b = Job::new("t", "B");
    store.add(in_b.clone()).await.unwrap();
    let outcome = balancer
        .dispatch(&store, &in_b, &task, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, DispatchOutcome::Dispatched { host: "h1".into() });
    assert!(matches!(
        b_rx.try_recv().unwrap(),
        ServerMessage::Execute { job_id, .. } if job_id == in_b.id
    ));
    assert_eq!(balancer.load("A", "h1"), 1);
    assert_eq!(balancer.load("B", "h1"), 1);
}
