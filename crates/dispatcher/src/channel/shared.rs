use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use grid_core::load_balancer::BundlerSlot;
use grid_core::models::{ConnectionStatus, SystemInformation};
use grid_core::sync;
use grid_core::traits::BundlerFactory;
use tokio::sync::watch;
use tracing::debug;

use super::{ChannelContext, ChannelStatusEvent, StatusListener};

/// 两种通道共用的状态：连接状态、并发计数、负载均衡器与监听器。
///
/// 状态切换在 `transition` 锁内完成，监听器在锁外同步调用。
pub struct ChannelCore {
    uuid: String,
    priority: i32,
    max_jobs: usize,
    status: watch::Sender<ConnectionStatus>,
    job_count: AtomicUsize,
    transition: Mutex<()>,
    bundler: BundlerSlot,
    system_info: RwLock<SystemInformation>,
    listeners: RwLock<Vec<StatusListener>>,
    context: RwLock<Option<ChannelContext>>,
}

impl ChannelCore {
    pub fn new(uuid: impl Into<String>, priority: i32, max_jobs: usize, info: SystemInformation) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::New);
        Self {
            uuid: uuid.into(),
            priority,
            max_jobs: max_jobs.max(1),
            status,
            job_count: AtomicUsize::new(0),
            transition: Mutex::new(()),
            bundler: BundlerSlot::new(),
            system_info: RwLock::new(info),
            listeners: RwLock::new(Vec::new()),
            context: RwLock::new(None),
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    pub fn current_jobs(&self) -> usize {
        self.job_count.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn bundler(&self) -> &BundlerSlot {
        &self.bundler
    }

    pub fn system_information(&self) -> SystemInformation {
        sync::read(&self.system_info).clone()
    }

    pub fn set_system_information(&self, info: SystemInformation) {
        *sync::write(&self.system_info) = info;
    }

    pub fn add_listener(&self, listener: StatusListener) {
        sync::write(&self.listeners).push(listener);
    }

    pub fn attach(&self, context: ChannelContext) {
        *sync::write(&self.context) = Some(context);
    }

    pub fn factory(&self) -> Option<Arc<dyn BundlerFactory>> {
        sync::read(&self.context)
            .as_ref()
            .map(|c| Arc::clone(&c.factory))
    }

    pub fn wake_scheduler(&self) {
        if let Some(context) = sync::read(&self.context).as_ref() {
            context.wakeup.notify_one();
        }
    }

    /// 设置新状态并返回旧状态；状态未变化时不触发监听器
    pub fn set_status(&self, new_status: ConnectionStatus) -> ConnectionStatus {
        let old_status = {
            let _guard = sync::lock(&self.transition);
            self.status.send_replace(new_status)
        };
        if old_status != new_status {
            self.fire(old_status, new_status);
        }
        old_status
    }

    /// 仅当当前状态为 `expected` 时切换
    pub fn transition(&self, expected: ConnectionStatus, new_status: ConnectionStatus) -> bool {
        {
            let _guard = sync::lock(&self.transition);
            if *self.status.borrow() != expected {
                return false;
            }
            self.status.send_replace(new_status);
        }
        if expected != new_status {
            self.fire(expected, new_status);
        }
        true
    }

    /// 占用一个并发位置；达到上限时 ACTIVE → EXECUTING
    pub fn job_started(&self) {
        let changed = {
            let _guard = sync::lock(&self.transition);
            let count = self.job_count.fetch_add(1, Ordering::AcqRel) + 1;
            let current = *self.status.borrow();
            if count >= self.max_jobs && current == ConnectionStatus::Active {
                self.status.send_replace(ConnectionStatus::Executing);
                true
            } else {
                false
            }
        };
        if changed {
            self.fire(ConnectionStatus::Active, ConnectionStatus::Executing);
        }
    }

    /// 释放一个并发位置；低于上限时 EXECUTING → ACTIVE
    pub fn job_finished(&self) {
        let changed = {
            let _guard = sync::lock(&self.transition);
            let previous = self
                .job_count
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
                .unwrap_or(0);
            let count = previous.saturating_sub(1);
            let current = *self.status.borrow();
            if count < self.max_jobs && current == ConnectionStatus::Executing {
                self.status.send_replace(ConnectionStatus::Active);
                true
            } else {
                false
            }
        };
        if changed {
            self.fire(ConnectionStatus::Executing, ConnectionStatus::Active);
        }
        self.wake_scheduler();
    }

    /// 等待通道进入可工作状态，超时返回 false
    pub async fn await_working(&self, timeout: Duration) -> bool {
        let mut rx = self.status.subscribe();
        let working = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|status| status.is_working())).await,
            Ok(Ok(_))
        );
        working
    }

    fn fire(&self, old_status: ConnectionStatus, new_status: ConnectionStatus) {
        debug!("通道 {} 状态: {} -> {}", self.uuid, old_status, new_status);
        let event = ChannelStatusEvent {
            channel_uuid: self.uuid.clone(),
            old_status,
            new_status,
        };
        let listeners: Vec<StatusListener> = sync::read(&self.listeners).clone();
        for listener in listeners {
            listener(&event);
        }
        self.wake_scheduler();
    }
}
