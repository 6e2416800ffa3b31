//! Integration tests for the worker loops.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use workd::director::{AutoSchedule, WorkerDirector};
use workd::model::*;
use workd::plugins::{ExternalAdapter, HeartbeatAdapter};
use workd::queue::{MemoryQueue, WorkQueue};
use workd::schedule::Schedule;
use workd::worker::{
    BaseWorker, EventListenerOptions, EventListenerWorker, IntervalWorker, IntervalWorkerOptions,
    ProcessOptions, ProcessSummary, Worker,
};

fn director() -> WorkerDirector {
    let mut director = WorkerDirector::new();
    director.register_adapter(HeartbeatAdapter);
    director.register_adapter(ExternalAdapter);
    director
}

fn hourly(schedule_id: &str) -> AutoSchedule {
    AutoSchedule::new("heartbeat", Schedule::parse("every 1 hour").unwrap()).schedule_id(schedule_id)
}

async fn count(queue: &dyn WorkQueue, status: Status) -> u64 {
    queue.count(&WorkFilter::new().status(status)).await.unwrap()
}

// ---------------------------------------------------------------------------
// BaseWorker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_fails_this_workers_orphans_only() {
    let queue = Arc::new(MemoryQueue::new());
    let claim = |worker: &str, ty: &str| AllocateWork {
        types: vec![ty.to_string()],
        worker: worker.to_string(),
    };

    queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    queue.add_work(NewWork::new("external")).await.unwrap();
    let orphan = queue.allocate_work(&claim("w1", "heartbeat")).await.unwrap().unwrap();
    let foreign = queue.allocate_work(&claim("w2", "heartbeat")).await.unwrap().unwrap();
    let external = queue.allocate_work(&claim("w1", "external")).await.unwrap().unwrap();

    let worker = BaseWorker::new("w1", Arc::new(director()), queue.clone());
    let recovered = worker
        .reset(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].id, orphan.id);
    assert_eq!(recovered[0].status, Status::Failed);

    for (id, status) in [(foreign.id, Status::Allocated), (external.id, Status::Allocated)] {
        assert_eq!(queue.find_work(id).await.unwrap().unwrap().status, status);
    }
}

#[tokio::test]
async fn recovered_orphan_is_never_claimed_again() {
    let queue = Arc::new(MemoryQueue::new());
    let work = queue
        .add_work(NewWork::new("heartbeat").timeout(Duration::from_millis(1)))
        .await
        .unwrap();
    // A previous run of w1 claimed it and died.
    queue
        .allocate_work(&AllocateWork {
            types: vec!["heartbeat".to_string()],
            worker: "w1".to_string(),
        })
        .await
        .unwrap()
        .unwrap();

    let director = Arc::new(director());
    let worker = BaseWorker::new("w1", director.clone(), queue.clone());
    worker
        .reset(Utc::now() + chrono::Duration::seconds(1))
        .await
        .unwrap();

    // Outlive the lease as well: expiry must not resurrect a failed item.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let summary = worker.process(ProcessOptions::now(None)).await.unwrap();
    assert_eq!(summary.processed, 0);
    assert!(
        director
            .process_next_work(queue.as_ref(), "w2")
            .await
            .unwrap()
            .is_none()
    );

    let after = queue.find_work(work.id).await.unwrap().unwrap();
    assert_eq!(after.status, Status::Failed);
    assert_eq!(after.attempts, 1);
    assert_eq!(after.error.unwrap()["name"], "ORPHANED");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_run_each_item_once() {
    let queue = Arc::new(MemoryQueue::new());
    for n in 0..40 {
        queue
            .add_work(NewWork::new("heartbeat").input(json!({ "n": n })))
            .await
            .unwrap();
    }
    let director = Arc::new(director());

    let mut handles = Vec::new();
    for w in 0..6 {
        let worker = BaseWorker::new(format!("w{w}"), director.clone(), queue.clone());
        handles.push(tokio::spawn(async move {
            worker.process(ProcessOptions::now(None)).await.unwrap()
        }));
    }
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().processed;
    }

    assert_eq!(processed, 40);
    let done = queue
        .find_work_queue(&WorkFilter::new().status(Status::Success))
        .await
        .unwrap();
    assert_eq!(done.len(), 40);
    assert!(done.iter().all(|w| w.attempts == 1));
}

#[tokio::test]
async fn process_until_claims_nothing_once_stopped() {
    let queue = Arc::new(MemoryQueue::new());
    for _ in 0..3 {
        queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    }
    let worker = BaseWorker::new("w1", Arc::new(director()), queue.clone());

    let summary = worker
        .process_until(ProcessOptions::now(None), || true)
        .await
        .unwrap();
    assert_eq!(summary, ProcessSummary::default());
    assert_eq!(count(queue.as_ref(), Status::New).await, 3);

    // Checked on entry and before each claim: the third check stops it.
    let checks = std::sync::atomic::AtomicUsize::new(0);
    let summary = worker
        .process_until(ProcessOptions::now(None), || {
            checks.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 2
        })
        .await
        .unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(count(queue.as_ref(), Status::New).await, 2);
}

#[tokio::test]
async fn autoreschedule_is_idempotent() {
    let queue = Arc::new(MemoryQueue::new());
    let mut director = director();
    director.configure_auto_schedule(hourly("hb")).unwrap();
    let worker = BaseWorker::new("w1", Arc::new(director), queue.clone());

    let reference = Utc::now();
    let first = worker.autoreschedule_types(reference).await.unwrap();
    let second = worker.autoreschedule_types(reference).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, second[0].id);
    assert_eq!(
        queue
            .count(&WorkFilter::new().schedule_id("hb").status(Status::New))
            .await
            .unwrap(),
        1
    );
    let expected = Schedule::parse("every 1 hour")
        .unwrap()
        .next_after(reference)
        .unwrap();
    assert_eq!(first[0].scheduled, expected);
}

#[tokio::test]
async fn removed_schedule_loses_its_placeholder() {
    let queue = Arc::new(MemoryQueue::new());
    let mut declared = director();
    declared.configure_auto_schedule(hourly("hb")).unwrap();
    BaseWorker::new("w1", Arc::new(declared), queue.clone())
        .autoreschedule_types(Utc::now())
        .await
        .unwrap();

    let mut retired = director();
    retired.configure_auto_schedule(hourly("hb")).unwrap();
    retired.remove_auto_schedule("hb").unwrap();
    let ensured = BaseWorker::new("w1", Arc::new(retired), queue.clone())
        .autoreschedule_types(Utc::now())
        .await
        .unwrap();

    assert!(ensured.is_empty());
    assert_eq!(count(queue.as_ref(), Status::New).await, 0);
    assert_eq!(count(queue.as_ref(), Status::Deleted).await, 1);
}

#[tokio::test]
async fn skipped_occurrence_removes_placeholder() {
    let queue = Arc::new(MemoryQueue::new());
    let mut declared = director();
    declared.configure_auto_schedule(hourly("hb")).unwrap();
    BaseWorker::new("w1", Arc::new(declared), queue.clone())
        .autoreschedule_types(Utc::now())
        .await
        .unwrap();

    let mut skipping = director();
    skipping
        .configure_auto_schedule(hourly("hb").input(|_| None))
        .unwrap();
    BaseWorker::new("w1", Arc::new(skipping), queue.clone())
        .autoreschedule_types(Utc::now())
        .await
        .unwrap();

    assert_eq!(count(queue.as_ref(), Status::New).await, 0);
}

#[tokio::test]
async fn process_respects_batch_limit() {
    let queue = Arc::new(MemoryQueue::new());
    for i in 0..5 {
        queue
            .add_work(NewWork::new("heartbeat").input(json!({ "n": i })))
            .await
            .unwrap();
    }
    let worker = BaseWorker::new("w1", Arc::new(director()), queue.clone());

    let summary = worker.process(ProcessOptions::now(Some(2))).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(count(queue.as_ref(), Status::New).await, 3);

    let summary = worker.process(ProcessOptions::now(None)).await.unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(count(queue.as_ref(), Status::Success).await, 5);
}

#[tokio::test]
async fn process_contains_failures_and_keeps_draining() {
    let queue = Arc::new(MemoryQueue::new());
    queue
        .add_work(NewWork::new("heartbeat").priority(1).retries(0).input(json!({ "fail": true })))
        .await
        .unwrap();
    queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    let worker = BaseWorker::new("w1", Arc::new(director()), queue.clone());

    let summary = worker.process(ProcessOptions::now(None)).await.unwrap();
    assert_eq!(summary.processed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(count(queue.as_ref(), Status::Failed).await, 1);
}

#[tokio::test]
async fn process_seeds_recurring_work_without_running_it_early() {
    let queue = Arc::new(MemoryQueue::new());
    let mut director = director();
    director.configure_auto_schedule(hourly("hb")).unwrap();
    let worker = BaseWorker::new("w1", Arc::new(director), queue.clone());

    let summary = worker.process(ProcessOptions::now(None)).await.unwrap();
    assert_eq!(summary.scheduled, 1);
    assert_eq!(summary.processed, 0);
    assert_eq!(count(queue.as_ref(), Status::New).await, 1);
}

// ---------------------------------------------------------------------------
// IntervalWorker
// ---------------------------------------------------------------------------

#[test]
fn interval_is_derived_from_schedule() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = IntervalWorker::new(
        Arc::new(director()),
        queue,
        IntervalWorkerOptions {
            worker_id: "w1".to_string(),
            batch_count: None,
            schedule: Some(Schedule::parse("*/10 * * * * *").unwrap()),
        },
    )
    .unwrap();
    assert_eq!(worker.period(), Duration::from_secs(10));

    let sparse = IntervalWorker::new(
        Arc::new(director()),
        Arc::new(MemoryQueue::new()),
        IntervalWorkerOptions {
            worker_id: "w1".to_string(),
            batch_count: None,
            schedule: Some(Schedule::parse("0 0 * * *").unwrap()),
        },
    )
    .unwrap();
    assert_eq!(sparse.period(), Duration::from_secs(3600));
}

#[tokio::test(start_paused = true)]
async fn interval_worker_drains_queue_until_stopped() {
    let queue = Arc::new(MemoryQueue::new());
    for _ in 0..3 {
        queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    }
    let worker = IntervalWorker::new(
        Arc::new(director()),
        queue.clone(),
        IntervalWorkerOptions {
            worker_id: "w1".to_string(),
            batch_count: Some(1),
            schedule: Some(Schedule::parse("every 1 second").unwrap()),
        },
    )
    .unwrap();

    worker.start().await.unwrap();
    assert!(worker.is_running().await);
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(count(queue.as_ref(), Status::Success).await, 3);

    worker.stop().await;
    worker.stop().await;
    assert!(!worker.is_running().await);

    queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(count(queue.as_ref(), Status::New).await, 1);
}

#[tokio::test(start_paused = true)]
async fn interval_stop_finishes_current_item_and_claims_no_more() {
    let queue = Arc::new(MemoryQueue::new());
    for _ in 0..10 {
        queue
            .add_work(NewWork::new("heartbeat").input(json!({ "wait": 1000 })))
            .await
            .unwrap();
    }
    let worker = IntervalWorker::new(
        Arc::new(director()),
        queue.clone(),
        IntervalWorkerOptions {
            worker_id: "w1".to_string(),
            batch_count: None,
            schedule: Some(Schedule::parse("every 1 second").unwrap()),
        },
    )
    .unwrap();

    worker.start().await.unwrap();
    // Second item is mid-run.
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let asked = tokio::time::Instant::now();
    worker.stop().await;
    assert!(asked.elapsed() <= Duration::from_secs(1));
    assert_eq!(count(queue.as_ref(), Status::Success).await, 2);
    assert_eq!(count(queue.as_ref(), Status::Allocated).await, 0);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count(queue.as_ref(), Status::New).await, 8);
}

// ---------------------------------------------------------------------------
// EventListenerWorker
// ---------------------------------------------------------------------------

fn listener_options() -> EventListenerOptions {
    EventListenerOptions {
        worker_id: "w1".to_string(),
        fallback_interval: None,
        ..EventListenerOptions::default()
    }
}

#[tokio::test(start_paused = true)]
async fn event_listener_drains_on_added_work() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = EventListenerWorker::new(Arc::new(director()), queue.clone(), listener_options());
    worker.start().await.unwrap();

    for _ in 0..5 {
        queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(count(queue.as_ref(), Status::Success).await, 5);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn event_listener_seeds_schedules_after_settle() {
    let queue = Arc::new(MemoryQueue::new());
    let mut director = director();
    director.configure_auto_schedule(hourly("hb")).unwrap();
    let worker = EventListenerWorker::new(Arc::new(director), queue.clone(), listener_options());

    worker.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(
        queue
            .count(&WorkFilter::new().schedule_id("hb").status(Status::New))
            .await
            .unwrap(),
        1
    );
    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn event_listener_stop_cancels_pending_drain() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = EventListenerWorker::new(Arc::new(director()), queue.clone(), listener_options());
    worker.start().await.unwrap();

    queue.add_work(NewWork::new("heartbeat")).await.unwrap();
    worker.stop().await;
    assert!(!worker.is_running().await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(count(queue.as_ref(), Status::New).await, 1);
}

#[tokio::test(start_paused = true)]
async fn event_listener_fallback_runs_deferred_work() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = EventListenerWorker::new(
        Arc::new(director()),
        queue.clone(),
        EventListenerOptions {
            worker_id: "w1".to_string(),
            fallback_interval: Some(Duration::from_secs(5)),
            ..EventListenerOptions::default()
        },
    );
    worker.start().await.unwrap();

    // Drained once on the added event while still in the future; only the
    // fallback cycle picks it up later.
    queue
        .add_work(
            NewWork::new("heartbeat").scheduled(Utc::now() + chrono::Duration::milliseconds(500)),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(count(queue.as_ref(), Status::New).await, 1);

    // Virtual time outruns the wall clock; wait out the real delay.
    std::thread::sleep(Duration::from_millis(600));
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(count(queue.as_ref(), Status::Success).await, 1);

    worker.stop().await;
}

#[tokio::test(start_paused = true)]
async fn event_listener_stop_ends_a_running_drain() {
    let queue = Arc::new(MemoryQueue::new());
    let worker = EventListenerWorker::new(Arc::new(director()), queue.clone(), listener_options());
    worker.start().await.unwrap();

    for _ in 0..10 {
        queue
            .add_work(NewWork::new("heartbeat").input(json!({ "wait": 1000 })))
            .await
            .unwrap();
    }
    // Drain began after the 300ms window; the second item is mid-run.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    worker.stop().await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(count(queue.as_ref(), Status::Success).await, 2);
    assert_eq!(count(queue.as_ref(), Status::New).await, 8);
}
