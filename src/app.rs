use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use grid_core::config::AppConfig;
use grid_core::models::{Job, JobResults, Payload, Task, TaskState};
use grid_core::traits::{TaskOutcome, TaskRunner};
use grid_dispatcher::{JobManager, RemoteChannel};
use grid_driver::{Driver, DriverLink};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅在提交端本地执行
    Local,
    /// 仅经进程内驱动端执行
    Driver,
    /// 本地通道与驱动端通道同时参与
    All,
}

impl AppMode {
    fn uses_local(self) -> bool {
        matches!(self, AppMode::Local | AppMode::All)
    }

    fn uses_driver(self) -> bool {
        matches!(self, AppMode::Driver | AppMode::All)
    }
}

/// 演示用的任务执行器：等待片刻后把负载转成大写
pub struct DemoRunner {
    delay: Duration,
}

impl DemoRunner {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl TaskRunner for DemoRunner {
    async fn run(&self, task: &Task) -> TaskOutcome {
        tokio::time::sleep(self.delay).await;
        let text = String::from_utf8_lossy(task.payload().as_bytes()).to_uppercase();
        TaskOutcome::Completed(Payload::from(text.as_str()))
    }

    fn name(&self) -> &str {
        "demo"
    }
}

/// 主应用程序
pub struct Application {
    mode: AppMode,
    manager: JobManager,
    driver: Option<Arc<Driver>>,
}

impl Application {
    /// 创建新的应用实例，按模式注册本地通道与驱动端通道
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {:?}", mode);
        let runner: Arc<dyn TaskRunner> = Arc::new(DemoRunner::new(Duration::from_millis(50)));
        let manager = JobManager::new(&config).context("创建作业管理器失败")?;

        if mode.uses_local() {
            manager
                .add_local_channel(Arc::clone(&runner), &config.client)
                .context("注册本地通道失败")?;
        }

        let driver = if mode.uses_driver() {
            let driver = Arc::new(Driver::new(&config.driver).context("创建驱动端失败")?);
            let nodes = driver
                .add_local_nodes(Arc::clone(&runner))
                .context("创建驱动端节点失败")?;
            info!("驱动端 {} 创建了 {} 个节点", driver.uuid(), nodes.len());
            driver.start();

            let link = Arc::new(DriverLink::new(Arc::clone(&driver)));
            let channel = Arc::new(RemoteChannel::new(
                link,
                "localhost",
                driver.system_information(),
                &config.remote,
            ));
            channel.connect().await.context("连接驱动端失败")?;
            manager.add_channel(channel).context("注册驱动端通道失败")?;
            Some(driver)
        } else {
            None
        };

        Ok(Self {
            mode,
            manager,
            driver,
        })
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    /// 提交一个演示作业并等待结果；收到关闭信号时取消作业
    pub async fn run(&self, task_count: usize, shutdown: CancellationToken) -> Result<Arc<JobResults>> {
        info!("启动应用程序，模式: {:?}", self.mode);
        self.manager.start();

        let job = Job::new("demo")
            .with_tasks((0..task_count).map(|i| format!("task-{i}").into_bytes()))
            .with_metadata("origin", "cli");
        let handle = self.manager.submit(job).context("提交作业失败")?;
        info!("已提交作业 {}，任务数: {}", handle.uuid(), task_count);

        let results = tokio::select! {
            results = handle.await_results() => results?,
            _ = shutdown.cancelled() => {
                warn!("收到关闭信号，取消作业 {}", handle.uuid());
                handle.cancel();
                handle.await_results().await?
            }
        };
        log_results(&results);
        Ok(results)
    }

    pub async fn close(&self) {
        self.manager.close().await;
        if let Some(driver) = &self.driver {
            driver.close().await;
        }
        info!("应用程序已关闭");
    }
}

fn log_results(results: &JobResults) {
    let completed = results
        .tasks
        .iter()
        .filter(|t| t.state() == TaskState::Result)
        .count();
    let failed = results
        .tasks
        .iter()
        .filter(|t| t.state() == TaskState::Exception)
        .count();
    info!(
        "作业 {} 结束: {} 个任务，成功 {}，失败 {}，已取消: {}",
        results.job_name,
        results.tasks.len(),
        completed,
        failed,
        results.cancelled
    );
    for task in &results.tasks {
        if let Some(result) = task.result() {
            info!(
                "  任务 {} → {}",
                task.position(),
                String::from_utf8_lossy(result.as_bytes())
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.client.local_threads = 2;
        config.scheduler.tick_interval_ms = 20;
        config.driver.nodes = 2;
        config.driver.tick_interval_ms = 20;
        config
    }

    #[tokio::test]
    async fn test_local_mode_runs_demo_job() {
        let app = Application::new(test_config(), AppMode::Local).await.unwrap();
        let results = app.run(4, CancellationToken::new()).await.unwrap();
        assert_eq!(results.positions(), vec![0, 1, 2, 3]);
        assert_eq!(
            results.task(2).and_then(Task::result),
            Some(&Payload::from("TASK-2"))
        );
        app.close().await;
    }

    #[tokio::test]
    async fn test_all_mode_uses_both_channels() {
        let app = Application::new(test_config(), AppMode::All).await.unwrap();
        assert_eq!(app.manager().channels().len(), 2);
        let results = app.run(12, CancellationToken::new()).await.unwrap();
        assert_eq!(results.tasks.len(), 12);
        assert!(results.tasks.iter().all(|t| t.state() == TaskState::Result));
        app.close().await;
    }
}
