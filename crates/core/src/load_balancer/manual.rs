use crate::traits::{next_stamp, Bundler};

pub const MANUAL: &str = "manual";

/// 固定大小的任务束
pub struct ManualBundler {
    size: usize,
    stamp: u64,
}

impl ManualBundler {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            stamp: next_stamp(),
        }
    }
}

impl Bundler for ManualBundler {
    fn algorithm(&self) -> &str {
        MANUAL
    }

    fn bundle_size(&self) -> usize {
        self.size
    }

    fn timestamp(&self) -> u64 {
        self.stamp
    }
}
