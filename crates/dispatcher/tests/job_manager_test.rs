mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use grid_core::errors::GridError;
use grid_core::models::{
    Job, JobSla, JobStatus, Payload, ResubmitExhaustedPolicy, SubmissionStatus, Task,
    TaskErrorKind, TaskGraph, TaskState,
};
use grid_core::traits::{FnRunner, JobEventKind, TaskOutcome, TaskRunner};
use grid_dispatcher::{ExecutorChannel, LocalChannel};

use common::{manager, upper, upper_runner, wait_for, ConcurrencyTracker, RecordingListener, SleepRunner};

fn text_job(name: &str, count: usize) -> Job {
    Job::new(name).with_tasks((0..count).map(|i| format!("t{i}").into_bytes()))
}

#[tokio::test]
async fn test_every_position_returned_exactly_once() {
    let manager = manager();
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_millis(2));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner.clone(), 2, 0, 1)))
        .unwrap();
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 2, 0, 1)))
        .unwrap();
    manager.start();

    let job = text_job("positions", 25).with_sla(JobSla::default().with_max_dispatch_size(3));
    let handle = manager.submit(job).unwrap();
    let results = handle.await_results().await.unwrap();

    assert_eq!(results.positions(), (0..25).collect::<Vec<_>>());
    for task in &results.tasks {
        assert_eq!(task.state(), TaskState::Result);
        assert_eq!(task.result(), Some(&upper(&format!("t{}", task.position()))));
    }
    assert_eq!(handle.status(), JobStatus::Done);
    assert_eq!(handle.submission_status(), SubmissionStatus::Ended);
    manager.close().await;
}

#[tokio::test]
async fn test_max_channels_two_splits_job_into_two_dispatches() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_millis(20));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner.clone(), 5, 0, 1)))
        .unwrap();
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 5, 0, 1)))
        .unwrap();

    let job = text_job("ten", 10).with_sla(
        JobSla::default()
            .with_max_channels(2)
            .with_max_dispatch_size(5),
    );
    let handle = manager.submit(job).unwrap();
    manager.start();
    let results = handle.await_results().await.unwrap();
    assert_eq!(results.tasks.len(), 10);

    let dispatched = listener.events(handle.uuid(), JobEventKind::Dispatched);
    assert_eq!(dispatched.len(), 2);
    let first: HashSet<usize> = dispatched[0].positions.iter().copied().collect();
    let second: HashSet<usize> = dispatched[1].positions.iter().copied().collect();
    assert!(first.is_disjoint(&second));
    assert_eq!(first.len() + second.len(), 10);
    assert_ne!(dispatched[0].channel_uuid, dispatched[1].channel_uuid);

    assert_eq!(listener.events(handle.uuid(), JobEventKind::Ended).len(), 1);
    assert_eq!(listener.events(handle.uuid(), JobEventKind::Started).len(), 1);
    manager.close().await;
}

#[tokio::test]
async fn test_cancel_before_any_channel_is_idle() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    manager.start();

    let handle = manager.submit(text_job("cancel-early", 4)).unwrap();
    assert!(handle.cancel());
    assert!(!handle.cancel());

    let results = handle.await_results().await.unwrap();
    assert!(results.cancelled);
    assert_eq!(results.positions(), vec![0, 1, 2, 3]);
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Cancelled));
    assert!(listener
        .events(handle.uuid(), JobEventKind::Dispatched)
        .is_empty());
    assert_eq!(handle.status(), JobStatus::Cancelled);
    assert!(manager.job(handle.uuid()).is_none());
    manager.close().await;
}

#[tokio::test]
async fn test_submission_status_never_regresses() {
    let manager = manager();
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_millis(5));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 2, 0, 1)))
        .unwrap();
    manager.start();

    let handle = manager
        .submit(text_job("monotonic", 12).with_sla(JobSla::default().with_max_dispatch_size(2)))
        .unwrap();
    let job = Arc::clone(handle.job());
    let poller = tokio::spawn(async move {
        let mut seen = vec![job.submission_status()];
        while !job.is_ended() {
            seen.push(job.submission_status());
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        seen.push(job.submission_status());
        seen
    });

    handle.await_results().await.unwrap();
    let seen = poller.await.unwrap();
    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
    assert_eq!(seen.last(), Some(&SubmissionStatus::Ended));
    manager.close().await;
}

#[tokio::test]
async fn test_one_outstanding_dispatch_per_channel() {
    let manager = manager();
    let tracker = ConcurrencyTracker::new();
    let listener = RecordingListener::new();
    manager.add_job_listener(tracker.clone());
    manager.add_job_listener(listener.clone());
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_millis(5));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 2, 0, 3)))
        .unwrap();
    manager.start();

    let handle = manager
        .submit(text_job("single", 8).with_sla(JobSla::default().with_max_dispatch_size(2)))
        .unwrap();
    handle.await_results().await.unwrap();

    assert_eq!(tracker.max_seen(), 1);
    assert_eq!(listener.events(handle.uuid(), JobEventKind::Dispatched).len(), 4);
    manager.close().await;
}

#[tokio::test]
async fn test_multiple_dispatches_to_same_channel_when_allowed() {
    let manager = manager();
    let tracker = ConcurrencyTracker::new();
    manager.add_job_listener(tracker.clone());
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_millis(30));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 2, 0, 3)))
        .unwrap();

    let sla = JobSla::default()
        .with_max_dispatch_size(2)
        .allow_multiple_dispatches(true);
    let handle = manager.submit(text_job("multi", 6).with_sla(sla)).unwrap();
    manager.start();
    handle.await_results().await.unwrap();

    assert_eq!(tracker.max_seen(), 3);
    manager.close().await;
}

#[tokio::test]
async fn test_duplicate_positions_rejected_at_submit() {
    let manager = manager();
    let mut job = text_job("dup", 2);
    job.tasks.push(Task::new(1, "again"));
    match manager.submit(job) {
        Err(GridError::DuplicateTaskPosition { position, .. }) => assert_eq!(position, 1),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_cyclic_graph_rejected_at_submit() {
    let manager = manager();
    let graph = TaskGraph::new().add_dependency(0, 1).add_dependency(1, 0);
    let job = text_job("cycle", 2).with_task_graph(graph);
    assert!(matches!(
        manager.submit(job),
        Err(GridError::CircularDependency)
    ));
}

#[tokio::test]
async fn test_graph_job_sent_as_single_bundle() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    manager.add_local_channel(upper_runner(), &Default::default()).unwrap();
    manager.start();

    let graph = TaskGraph::new().add_dependency(2, 0).add_dependency(2, 1);
    let job = text_job("graph", 4)
        .with_task_graph(graph)
        .with_sla(JobSla::default().with_max_dispatch_size(1));
    let handle = manager.submit(job).unwrap();
    let results = handle.await_results().await.unwrap();

    assert_eq!(results.tasks.len(), 4);
    let dispatched = listener.events(handle.uuid(), JobEventKind::Dispatched);
    assert_eq!(dispatched.len(), 1);
    assert_eq!(dispatched[0].positions, vec![0, 1, 2, 3]);
    manager.close().await;
}

#[tokio::test]
async fn test_zero_task_job_ends_immediately() {
    let manager = manager();
    let handle = manager.submit(Job::new("empty")).unwrap();
    let results = handle
        .await_results_timeout(Duration::from_secs(1))
        .await
        .unwrap()
        .expect("作业应立即结束");
    assert!(results.tasks.is_empty());
    assert!(!results.cancelled);
}

#[tokio::test]
async fn test_priority_update_reorders_queue() {
    let manager = manager();
    let first = manager.submit(text_job("first", 1)).unwrap();
    let second = manager.submit(text_job("second", 1)).unwrap();

    let order: Vec<_> = manager.queue().jobs_in_order().iter().map(|j| j.uuid()).collect();
    assert_eq!(order, vec![first.uuid(), second.uuid()]);

    assert!(manager.update_priority(second.uuid(), 5));
    let order: Vec<_> = manager.queue().jobs_in_order().iter().map(|j| j.uuid()).collect();
    assert_eq!(order, vec![second.uuid(), first.uuid()]);
    assert_eq!(second.job().priority(), 5);

    assert!(manager.job(first.uuid()).is_some());
    assert!(manager.cancel_job(first.uuid()));
    assert!(!manager.update_priority(uuid::Uuid::new_v4(), 1));
    manager.close().await;
}

#[tokio::test]
async fn test_submit_after_close_fails() {
    let manager = manager();
    let queued = manager.submit(text_job("queued", 2)).unwrap();
    manager.close().await;

    assert!(manager.is_closed());
    assert!(queued.await_results().await.unwrap().cancelled);
    assert!(matches!(
        manager.submit(text_job("late", 1)),
        Err(GridError::ManagerClosed)
    ));
}

#[tokio::test]
async fn test_job_start_delay_holds_dispatch() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    manager.add_local_channel(upper_runner(), &Default::default()).unwrap();
    manager.start();

    let started = Instant::now();
    let sla = JobSla::default().with_job_start_delay(Duration::from_millis(150));
    let handle = manager.submit(text_job("delayed", 2).with_sla(sla)).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(listener
        .events(handle.uuid(), JobEventKind::Dispatched)
        .is_empty());

    let results = handle.await_results().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Result));
    manager.close().await;
}

#[tokio::test]
async fn test_job_expiration_cancels_running_job() {
    let manager = manager();
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_secs(5));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 2, 0, 1)))
        .unwrap();
    manager.start();

    let sla = JobSla::default().with_job_expiration(Duration::from_millis(100));
    let handle = manager.submit(text_job("expiring", 2).with_sla(sla)).unwrap();
    let results = handle
        .await_results_timeout(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("作业应在过期后结束");

    assert!(results.expired);
    assert!(results.cancelled);
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Cancelled));
    manager.close().await;
}

/// 每个位置第一次执行时挂起
struct HangOnce {
    seen: Mutex<HashSet<usize>>,
}

#[async_trait]
impl TaskRunner for HangOnce {
    async fn run(&self, task: &Task) -> TaskOutcome {
        let first = self.seen.lock().unwrap().insert(task.position());
        if first {
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
        TaskOutcome::Completed(Payload::from("done"))
    }

    fn name(&self) -> &str {
        "hang-once"
    }
}

#[tokio::test]
async fn test_dispatch_expiration_resubmits_without_budget() {
    let manager = manager();
    let runner = Arc::new(HangOnce {
        seen: Mutex::new(HashSet::new()),
    });
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 3, 0, 1)))
        .unwrap();
    manager.start();

    let sla = JobSla::default().with_dispatch_expiration(Duration::from_millis(50), 2);
    let handle = manager.submit(text_job("expire-dispatch", 3).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();

    for task in &results.tasks {
        assert_eq!(task.state(), TaskState::Result);
        assert_eq!(task.expiration_count(), 1);
        assert_eq!(task.resubmit_count(), 0);
    }
    manager.close().await;
}

#[tokio::test]
async fn test_dispatch_expiration_limit_cancels_task() {
    let manager = manager();
    let runner: Arc<dyn TaskRunner> = SleepRunner::new(Duration::from_secs(5));
    manager
        .add_channel(Arc::new(LocalChannel::new(runner, 1, 0, 1)))
        .unwrap();
    manager.start();

    let sla = JobSla::default().with_dispatch_expiration(Duration::from_millis(30), 0);
    let handle = manager.submit(text_job("give-up", 1).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();

    assert_eq!(results.tasks[0].state(), TaskState::Cancelled);
    assert_eq!(results.tasks[0].expiration_count(), 1);
    manager.close().await;
}

fn always_resubmit(partial: Option<&'static str>) -> Arc<dyn TaskRunner> {
    Arc::new(FnRunner::new("resubmit", move |_task: &Task| {
        TaskOutcome::Resubmit(partial.map(Payload::from))
    }))
}

#[tokio::test]
async fn test_resubmit_budget_exhausted_fails_task() {
    let manager = manager();
    manager
        .add_channel(Arc::new(LocalChannel::new(always_resubmit(None), 1, 0, 1)))
        .unwrap();
    manager.start();

    let sla = JobSla::default().with_max_task_resubmits(2);
    let handle = manager.submit(text_job("budget", 2).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();

    for task in &results.tasks {
        assert_eq!(task.state(), TaskState::Exception);
        assert_eq!(task.resubmit_count(), 2);
        assert_eq!(
            task.error().map(|e| e.kind),
            Some(TaskErrorKind::ResubmitLimitExceeded)
        );
    }
    manager.close().await;
}

#[tokio::test]
async fn test_resubmit_budget_accept_last_keeps_partial_result() {
    let manager = manager();
    manager
        .add_channel(Arc::new(LocalChannel::new(
            always_resubmit(Some("partial")),
            1,
            0,
            1,
        )))
        .unwrap();
    manager.start();

    let sla = JobSla::default()
        .with_max_task_resubmits(1)
        .with_resubmit_exhausted(ResubmitExhaustedPolicy::AcceptLast);
    let handle = manager.submit(text_job("accept-last", 1).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();

    let task = &results.tasks[0];
    assert_eq!(task.state(), TaskState::Result);
    assert_eq!(task.result(), Some(&Payload::from("partial")));
    manager.close().await;
}

#[tokio::test]
async fn test_higher_priority_channel_preferred_while_working() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    let high = Arc::new(LocalChannel::new(upper_runner(), 1, 10, 1));
    let low = Arc::new(LocalChannel::new(upper_runner(), 1, 0, 1));
    manager.add_channel(high.clone()).unwrap();
    manager.add_channel(low).unwrap();
    manager.start();

    let sla = JobSla::default().with_max_dispatch_size(1);
    let handle = manager.submit(text_job("failover", 3).with_sla(sla)).unwrap();
    handle.await_results().await.unwrap();

    let dispatched = listener.events(handle.uuid(), JobEventKind::Dispatched);
    assert_eq!(dispatched.len(), 3);
    assert!(dispatched
        .iter()
        .all(|e| e.channel_uuid.as_deref() == Some(high.uuid())));
    manager.close().await;
}

#[tokio::test]
async fn test_remove_channel_unknown_uuid() {
    let manager = manager();
    let channel = manager
        .add_local_channel(upper_runner(), &Default::default())
        .unwrap();
    assert_eq!(manager.channels().len(), 1);
    manager.remove_channel(channel.uuid()).await.unwrap();
    assert!(wait_for(|| manager.channels().is_empty(), Duration::from_secs(1)).await);
    assert!(matches!(
        manager.remove_channel("missing").await,
        Err(GridError::ChannelNotFound { .. })
    ));
}
