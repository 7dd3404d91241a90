mod common;

use std::sync::Arc;
use std::time::Duration;

use grid_core::models::{
    ConnectionStatus, ExecutionPolicy, Job, JobSla, SystemInformation, TaskErrorKind, TaskState,
};
use grid_core::traits::JobEventKind;
use grid_dispatcher::{ExecutorChannel, JobManager, LocalChannel, RemoteChannel};

use common::{manager, remote_config, upper, upper_runner, wait_for, RecordingListener, ScriptedTransport};

async fn connect_remote(
    manager: &JobManager,
    transport: Arc<ScriptedTransport>,
    info: SystemInformation,
) -> Arc<RemoteChannel> {
    let channel = Arc::new(RemoteChannel::new(
        transport,
        "remote-host",
        info,
        &remote_config(),
    ));
    channel.connect().await.unwrap();
    manager.add_channel(channel.clone()).unwrap();
    channel
}

fn text_job(name: &str, count: usize) -> Job {
    Job::new(name).with_tasks((0..count).map(|i| format!("t{i}").into_bytes()))
}

#[tokio::test]
async fn test_remote_results_merged_by_bundle_id() {
    let manager = manager();
    let transport = ScriptedTransport::new();
    connect_remote(&manager, transport.clone(), SystemInformation::new()).await;
    manager.start();

    let sla = JobSla::default().with_max_dispatch_size(2);
    let handle = manager.submit(text_job("remote", 5).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();

    assert_eq!(results.positions(), vec![0, 1, 2, 3, 4]);
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Result));
    assert_eq!(results.task(4).and_then(|t| t.result()), Some(&upper("t4")));
    assert_eq!(transport.sent().len(), 3);
    manager.close().await;
}

#[tokio::test]
async fn test_transient_send_failure_resubmits_bundle() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    let transport = ScriptedTransport::new();
    transport.fail_next_sends(1);
    let channel = connect_remote(&manager, transport.clone(), SystemInformation::new()).await;
    manager.start();

    let handle = manager.submit(text_job("transient", 5)).unwrap();
    let results = handle.await_results().await.unwrap();

    assert_eq!(results.positions(), vec![0, 1, 2, 3, 4]);
    for task in &results.tasks {
        assert_eq!(task.state(), TaskState::Result);
        assert_eq!(task.resubmit_count(), 0);
    }

    let sent = transport.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].tasks.len(), 5);
    assert!(sent[1].tasks.iter().all(|t| t.state() == TaskState::Pending));

    let dispatched = listener.events(handle.uuid(), JobEventKind::Dispatched);
    let returned = listener.events(handle.uuid(), JobEventKind::Returned);
    assert_eq!(dispatched.len(), 2);
    assert_eq!(returned[0].positions, vec![0, 1, 2, 3, 4]);
    assert!(channel.await_working(Duration::from_secs(1)).await);
    manager.close().await;
}

#[tokio::test]
async fn test_rejected_positions_fail_individually() {
    let manager = manager();
    let transport = ScriptedTransport::new();
    transport.reject_positions(vec![2]);
    connect_remote(&manager, transport, SystemInformation::new()).await;
    manager.start();

    let handle = manager.submit(text_job("rejected", 4)).unwrap();
    let results = handle.await_results().await.unwrap();

    let rejected = results.task(2).unwrap();
    assert_eq!(rejected.state(), TaskState::Exception);
    assert_eq!(rejected.error().map(|e| e.kind), Some(TaskErrorKind::Rejected));
    for position in [0, 1, 3] {
        assert_eq!(results.task(position).unwrap().state(), TaskState::Result);
    }
    manager.close().await;
}

#[tokio::test]
async fn test_disconnect_requeues_in_flight_bundle_to_other_channel() {
    let manager = manager();
    let held = ScriptedTransport::new();
    held.hold_results();
    held.refuse_reconnect();
    let remote = connect_remote(&manager, held.clone(), SystemInformation::new()).await;
    manager.start();

    let handle = manager.submit(text_job("failover", 3)).unwrap();
    assert!(wait_for(|| held.sent().len() == 1, Duration::from_secs(2)).await);

    manager
        .add_local_channel(upper_runner(), &Default::default())
        .unwrap();
    held.break_connection();

    let results = handle.await_results().await.unwrap();
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Result));
    assert!(wait_for(
        || remote.status() == ConnectionStatus::Failed,
        Duration::from_secs(2)
    )
    .await);
    manager.close().await;
}

#[tokio::test]
async fn test_execution_policy_selects_matching_channel() {
    let manager = manager();
    let listener = RecordingListener::new();
    manager.add_job_listener(listener.clone());
    let gpu = ScriptedTransport::new();
    let plain = ScriptedTransport::new();
    let gpu_channel = connect_remote(
        &manager,
        gpu.clone(),
        SystemInformation::new().with_property("gpu", "true"),
    )
    .await;
    connect_remote(&manager, plain.clone(), SystemInformation::new()).await;
    manager.start();

    let sla = JobSla::default()
        .with_execution_policy(ExecutionPolicy::equal("gpu", "true"))
        .with_max_dispatch_size(1);
    let handle = manager.submit(text_job("gpu-only", 3).with_sla(sla)).unwrap();
    handle.await_results().await.unwrap();

    assert_eq!(gpu.sent().len(), 3);
    assert!(plain.sent().is_empty());
    assert!(listener
        .events(handle.uuid(), JobEventKind::Dispatched)
        .iter()
        .all(|e| e.channel_uuid.as_deref() == Some(gpu_channel.uuid())));
    manager.close().await;
}

#[tokio::test]
async fn test_preference_falls_back_when_no_channel_matches() {
    let manager = manager();
    let channel = Arc::new(LocalChannel::new(upper_runner(), 1, 0, 1));
    manager.add_channel(channel).unwrap();
    manager.start();

    let sla = JobSla::default().with_preference(vec![ExecutionPolicy::equal("zone", "mars")]);
    let handle = manager.submit(text_job("fallback", 2).with_sla(sla)).unwrap();
    let results = handle.await_results().await.unwrap();
    assert!(results.tasks.iter().all(|t| t.state() == TaskState::Result));
    manager.close().await;
}
