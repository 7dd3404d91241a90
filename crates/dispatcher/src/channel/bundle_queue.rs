use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use grid_core::sync;
use tokio::sync::Notify;

use crate::job::ClientTaskBundle;

/// 通道的发送队列，单个发送循环消费
#[derive(Default)]
pub struct BundleQueue {
    items: Mutex<VecDeque<Arc<ClientTaskBundle>>>,
    notify: Notify,
    closed: AtomicBool,
}

impl BundleQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 队列已关闭时返回 false
    pub fn push(&self, bundle: Arc<ClientTaskBundle>) -> bool {
        {
            let mut items = sync::lock(&self.items);
            if self.closed.load(Ordering::Acquire) {
                return false;
            }
            items.push_back(bundle);
        }
        self.notify.notify_one();
        true
    }

    /// 等待下一个任务束；关闭且为空时返回 None
    pub async fn pop(&self) -> Option<Arc<ClientTaskBundle>> {
        loop {
            {
                let mut items = sync::lock(&self.items);
                if let Some(bundle) = items.pop_front() {
                    return Some(bundle);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn drain(&self) -> Vec<Arc<ClientTaskBundle>> {
        sync::lock(&self.items).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        sync::lock(&self.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn close(&self) {
        {
            let _items = sync::lock(&self.items);
            self.closed.store(true, Ordering::Release);
        }
        self.notify.notify_one();
    }
}
