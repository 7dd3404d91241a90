use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use grid_core::config::{DriverConfig, RemoteConfig};
use grid_core::errors::GridError;
use grid_core::load_balancer::{client_default_info, LoadBalancerFactory};
use grid_core::models::{
    BundleHeader, BundleMessage, ConnectionStatus, ExecutionPolicy, Job, JobMetadata, JobSla,
    Payload, ResultsStrategy, Task, TaskErrorKind, TaskGraph, TaskState,
};
use grid_core::traits::{FnRunner, TaskOutcome, TaskRunner, Transport};
use grid_dispatcher::{ExecutorChannel, JobManager, RemoteChannel};
use grid_driver::{ClientBundleListener, Driver, DriverLink, LocalNode, NodeChannel};
use uuid::Uuid;

fn driver_config(nodes: usize) -> DriverConfig {
    DriverConfig {
        enabled: true,
        nodes,
        node_threads: 2,
        tick_interval_ms: 20,
        ..DriverConfig::default()
    }
}

fn upper_runner() -> Arc<dyn TaskRunner> {
    Arc::new(FnRunner::new("upper", |task: &Task| {
        let text = String::from_utf8_lossy(task.payload().as_bytes()).to_uppercase();
        TaskOutcome::Completed(Payload::from(text.as_str()))
    }))
}

struct SlowRunner {
    delay: Duration,
}

#[async_trait]
impl TaskRunner for SlowRunner {
    async fn run(&self, _task: &Task) -> TaskOutcome {
        tokio::time::sleep(self.delay).await;
        TaskOutcome::Completed(Payload::from("slow"))
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[derive(Default)]
struct Collect {
    batches: Mutex<Vec<(u64, Vec<Task>)>>,
    completed: Mutex<Vec<u64>>,
}

impl Collect {
    fn batches(&self) -> Vec<(u64, Vec<Task>)> {
        self.batches.lock().unwrap().clone()
    }

    fn delivered(&self) -> usize {
        self.batches().iter().map(|(_, tasks)| tasks.len()).sum()
    }
}

impl ClientBundleListener for Collect {
    fn results_available(&self, bundle_id: u64, tasks: Vec<Task>) {
        self.batches.lock().unwrap().push((bundle_id, tasks));
    }

    fn bundle_completed(&self, bundle_id: u64) {
        self.completed.lock().unwrap().push(bundle_id);
    }
}

fn message(job_uuid: Uuid, bundle_id: u64, positions: std::ops::Range<usize>, task_count: usize, sla: JobSla) -> BundleMessage {
    BundleMessage {
        header: BundleHeader {
            job_uuid,
            job_name: "driver-job".into(),
            bundle_id,
            sla,
            metadata: JobMetadata::new(),
            job_task_count: task_count,
            task_graph: None,
        },
        tasks: positions.map(|p| Task::new(p, format!("t{p}").as_str())).collect(),
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn started_driver(nodes: usize, runner: Arc<dyn TaskRunner>) -> Arc<Driver> {
    let driver = Arc::new(Driver::new(&driver_config(nodes)).unwrap());
    driver.add_local_nodes(runner).unwrap();
    driver.start();
    driver
}

#[tokio::test]
async fn test_client_job_runs_through_driver() {
    let driver = started_driver(2, upper_runner());
    let remote_config = RemoteConfig {
        reconnect_initial_delay_ms: 10,
        reconnect_jitter: 0.0,
        ..RemoteConfig::default()
    };
    let channel = Arc::new(RemoteChannel::new(
        Arc::new(DriverLink::new(Arc::clone(&driver))),
        "localhost",
        driver.system_information(),
        &remote_config,
    ));
    channel.connect().await.unwrap();

    let factory = Arc::new(LoadBalancerFactory::new(client_default_info()).unwrap());
    let manager = JobManager::with_factory(factory, Duration::from_millis(20));
    manager.add_channel(channel.clone()).unwrap();
    manager.start();

    let job = Job::new("through-driver").with_tasks((0..10).map(|i| format!("task-{i}").into_bytes()));
    let handle = manager.submit(job).unwrap();
    let results = handle
        .await_results_timeout(Duration::from_secs(5))
        .await
        .unwrap()
        .expect("作业应在超时前完成");

    assert_eq!(results.positions(), (0..10).collect::<Vec<_>>());
    assert_eq!(
        results.task(7).and_then(|t| t.result()),
        Some(&Payload::from("TASK-7"))
    );
    assert!(wait_for(|| driver.job_count() == 0, Duration::from_secs(1)).await);

    manager.close().await;
    driver.close().await;
    assert_eq!(channel.status(), ConnectionStatus::Closed);
}

#[tokio::test]
async fn test_send_strategies_control_batches() {
    let driver = started_driver(2, upper_runner());
    let cases = [
        (ResultsStrategy::NodeResults, 4),
        (ResultsStrategy::AllResults, 1),
        (ResultsStrategy::NTasks { count: 2 }, 2),
    ];
    for (strategy, expected_batches) in cases {
        let listener = Arc::new(Collect::default());
        let sla = JobSla::default()
            .with_max_dispatch_size(1)
            .with_results_strategy(strategy);
        driver
            .submit_bundle(message(Uuid::new_v4(), 1, 0..4, 4, sla), listener.clone())
            .unwrap();
        assert!(wait_for(|| listener.delivered() == 4, Duration::from_secs(2)).await);
        assert_eq!(listener.batches().len(), expected_batches, "{strategy:?}");
        assert_eq!(*listener.completed.lock().unwrap(), vec![1]);
    }
    driver.close().await;
}

#[tokio::test]
async fn test_late_bundle_creates_new_job() {
    let driver = started_driver(1, upper_runner());
    let job_uuid = Uuid::new_v4();
    let first = Arc::new(Collect::default());
    driver
        .submit_bundle(message(job_uuid, 1, 0..2, 3, JobSla::default()), first.clone())
        .unwrap();
    assert!(wait_for(|| first.delivered() == 2, Duration::from_secs(2)).await);
    assert!(wait_for(|| driver.job(job_uuid).is_none(), Duration::from_secs(1)).await);

    let late = Arc::new(Collect::default());
    let ack = driver
        .submit_bundle(message(job_uuid, 2, 2..3, 3, JobSla::default()), late.clone())
        .unwrap();
    assert!(ack.rejected.is_empty());
    assert!(wait_for(|| late.delivered() == 1, Duration::from_secs(2)).await);
    assert_eq!(late.batches()[0].1[0].position(), 2);
    driver.close().await;
}

#[tokio::test]
async fn test_duplicate_position_rejects_whole_bundle() {
    // 没有节点，作业停留在队列中
    let driver = Arc::new(Driver::new(&driver_config(0)).unwrap());
    let job_uuid = Uuid::new_v4();
    let listener = Arc::new(Collect::default());
    driver
        .submit_bundle(message(job_uuid, 1, 0..3, 5, JobSla::default()), listener.clone())
        .unwrap();

    let ack = driver
        .submit_bundle(message(job_uuid, 2, 2..5, 5, JobSla::default()), listener)
        .unwrap();
    let positions: Vec<usize> = ack.rejected.iter().map(|r| r.position).collect();
    assert_eq!(positions, vec![2, 3, 4]);
    assert!(ack.rejected.iter().all(|r| r.kind == TaskErrorKind::Rejected));

    let job = driver.job(job_uuid).unwrap();
    assert_eq!(job.pending_task_count(), 3);
    assert_eq!(job.client_bundle_count(), 1);
    driver.close().await;
}

#[tokio::test]
async fn test_graph_dependencies_run_first() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&order);
    let runner: Arc<dyn TaskRunner> = Arc::new(FnRunner::new("order", move |task: &Task| {
        recorded.lock().unwrap().push(task.position());
        TaskOutcome::Completed(Payload::from("ok"))
    }));
    let driver = started_driver(2, runner);

    let mut bundle = message(Uuid::new_v4(), 1, 0..4, 4, JobSla::default());
    bundle.header.task_graph = Some(
        TaskGraph::new()
            .add_dependency(3, 1)
            .add_dependency(3, 2)
            .add_dependency(1, 0),
    );
    let listener = Arc::new(Collect::default());
    driver.submit_bundle(bundle, listener.clone()).unwrap();
    assert!(wait_for(|| listener.delivered() == 4, Duration::from_secs(2)).await);

    let order = order.lock().unwrap().clone();
    let index = |p: usize| order.iter().position(|&x| x == p).unwrap();
    assert!(index(0) < index(1));
    assert!(index(1) < index(3));
    assert!(index(2) < index(3));
    driver.close().await;
}

#[tokio::test]
async fn test_disconnect_cancels_jobs_submitted_over_link() {
    let driver = started_driver(1, Arc::new(SlowRunner { delay: Duration::from_secs(5) }));
    let link = DriverLink::new(Arc::clone(&driver));
    let job_uuid = Uuid::new_v4();
    link.send(message(job_uuid, 1, 0..2, 2, JobSla::default()))
        .await
        .unwrap();
    assert!(wait_for(|| driver.dispatcher().busy_count() == 1, Duration::from_secs(1)).await);

    link.disconnect();
    assert!(!link.is_connected());
    assert!(matches!(link.receive().await, Err(GridError::Disconnected(_))));
    assert!(wait_for(|| driver.job(job_uuid).is_none(), Duration::from_secs(1)).await);
    assert!(wait_for(|| driver.dispatcher().busy_count() == 0, Duration::from_secs(1)).await);

    link.reconnect().await.unwrap();
    assert!(link.is_connected());
    driver.close().await;
    assert!(link.reconnect().await.is_err());
}

#[tokio::test]
async fn test_remove_node_force_completes_broadcast_child() {
    let driver = Arc::new(Driver::new(&driver_config(0)).unwrap());
    let lost = Arc::new(LocalNode::new(
        Arc::new(SlowRunner { delay: Duration::from_secs(5) }),
        2,
    ));
    let healthy = Arc::new(LocalNode::new(
        Arc::new(SlowRunner { delay: Duration::from_millis(100) }),
        2,
    ));
    let lost_uuid = lost.uuid().to_string();
    driver.add_node(lost).unwrap();
    driver.add_node(healthy).unwrap();
    driver.start();

    let listener = Arc::new(Collect::default());
    let job_uuid = Uuid::new_v4();
    driver
        .submit_bundle(
            message(job_uuid, 1, 0..2, 2, JobSla::default().broadcast()),
            listener.clone(),
        )
        .unwrap();
    assert!(wait_for(|| driver.dispatcher().busy_count() == 2, Duration::from_secs(1)).await);

    driver.remove_node(&lost_uuid).await.unwrap();
    assert!(wait_for(|| listener.delivered() == 2, Duration::from_secs(2)).await);
    let tasks: Vec<Task> = listener
        .batches()
        .into_iter()
        .flat_map(|(_, tasks)| tasks)
        .collect();
    assert!(tasks.iter().all(|t| t.state() == TaskState::Result));
    assert!(wait_for(|| driver.job_count() == 0, Duration::from_secs(1)).await);
    driver.close().await;
}

fn gpu_driver() -> Arc<Driver> {
    let driver = Arc::new(Driver::new(&driver_config(0)).unwrap());
    driver
        .add_node(Arc::new(LocalNode::new(upper_runner(), 2)))
        .unwrap();
    driver
        .add_node(Arc::new(
            LocalNode::new(upper_runner(), 2).with_property("gpu", "true"),
        ))
        .unwrap();
    driver.start();
    driver
}

#[tokio::test]
async fn test_broadcast_respects_execution_policy() {
    let driver = gpu_driver();
    let listener = Arc::new(Collect::default());
    let sla = JobSla::default()
        .broadcast()
        .with_execution_policy(ExecutionPolicy::equal("gpu", "true"));
    driver
        .submit_bundle(message(Uuid::new_v4(), 1, 0..2, 2, sla), listener.clone())
        .unwrap();

    assert!(wait_for(|| listener.delivered() == 2, Duration::from_secs(2)).await);
    let tasks: Vec<Task> = listener
        .batches()
        .into_iter()
        .flat_map(|(_, tasks)| tasks)
        .collect();
    assert!(tasks.iter().all(|t| t.state() == TaskState::Result));
    assert!(wait_for(|| driver.job_count() == 0, Duration::from_secs(1)).await);
    driver.close().await;
}

#[tokio::test]
async fn test_broadcast_without_matching_node_ends_immediately() {
    let driver = gpu_driver();
    let listener = Arc::new(Collect::default());
    let sla = JobSla::default()
        .broadcast()
        .with_execution_policy(ExecutionPolicy::equal("gpu", "tpu"));
    driver
        .submit_bundle(message(Uuid::new_v4(), 1, 0..3, 3, sla), listener.clone())
        .unwrap();

    assert!(wait_for(|| listener.delivered() == 3, Duration::from_secs(2)).await);
    for (_, tasks) in listener.batches() {
        for task in tasks {
            assert_eq!(task.state(), TaskState::Exception);
            assert_eq!(task.error().map(|e| e.kind), Some(TaskErrorKind::Rejected));
        }
    }
    assert!(wait_for(|| driver.job_count() == 0, Duration::from_secs(1)).await);
    driver.close().await;
}

#[tokio::test]
async fn test_system_information_sums_node_processors() {
    let driver = Driver::new(&driver_config(3)).unwrap();
    driver.add_local_nodes(upper_runner()).unwrap();
    let info = driver.system_information();
    assert_eq!(info.available_processors(), Some(6));
    assert_eq!(info.get("nodes"), Some("3"));
    assert_eq!(info.get("driver_uuid"), Some(driver.uuid()));
}

#[tokio::test]
async fn test_closed_driver_refuses_bundles() {
    let driver = Arc::new(Driver::new(&driver_config(1)).unwrap());
    driver.close().await;
    let listener = Arc::new(Collect::default());
    let err = driver
        .submit_bundle(message(Uuid::new_v4(), 1, 0..1, 1, JobSla::default()), listener)
        .unwrap_err();
    assert!(matches!(err, GridError::ManagerClosed));

    let link = DriverLink::new(Arc::clone(&driver));
    let err = link
        .send(message(Uuid::new_v4(), 1, 0..1, 1, JobSla::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, GridError::Transport(_)));
    assert!(driver.add_node(Arc::new(LocalNode::new(upper_runner(), 1))).is_err());
}
