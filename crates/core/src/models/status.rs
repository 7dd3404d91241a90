use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 可存入原子单元的有序状态枚举
pub trait StatusOrdinal: Copy + Ord + fmt::Debug {
    fn ordinal(self) -> u8;
    fn from_ordinal(value: u8) -> Self;
}

macro_rules! status_ordinal {
    ($ty:ident { $($variant:ident = $value:literal),+ $(,)? }) => {
        impl StatusOrdinal for $ty {
            fn ordinal(self) -> u8 {
                self as u8
            }

            fn from_ordinal(value: u8) -> Self {
                match value {
                    $($value => $ty::$variant,)+
                    _ => unreachable!("invalid {} ordinal {}", stringify!($ty), value),
                }
            }
        }
    };
}

/// 作业粗粒度状态，单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    New = 0,
    Executing = 1,
    Done = 2,
    Cancelled = 3,
}

status_ordinal!(JobStatus {
    New = 0,
    Executing = 1,
    Done = 2,
    Cancelled = 3,
});

/// 作业提交状态，单调递增
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Submitted = 0,
    Pending = 1,
    Executing = 2,
    Complete = 3,
    Ended = 4,
}

status_ordinal!(SubmissionStatus {
    Submitted = 0,
    Pending = 1,
    Executing = 2,
    Complete = 3,
    Ended = 4,
});

impl SubmissionStatus {
    pub fn is_finished(self) -> bool {
        self >= SubmissionStatus::Complete
    }
}

/// 基于CAS的状态单元
pub struct AtomicStatus<T: StatusOrdinal> {
    value: AtomicU8,
    _marker: PhantomData<T>,
}

impl<T: StatusOrdinal> AtomicStatus<T> {
    pub fn new(initial: T) -> Self {
        Self {
            value: AtomicU8::new(initial.ordinal()),
            _marker: PhantomData,
        }
    }

    pub fn get(&self) -> T {
        T::from_ordinal(self.value.load(Ordering::Acquire))
    }

    /// 仅当当前状态等于 `expected` 时切换为 `new`
    pub fn compare_and_set(&self, expected: T, new: T) -> bool {
        self.value
            .compare_exchange(
                expected.ordinal(),
                new.ordinal(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// 向前推进到 `new`，已处于相同或更后的状态时返回 false
    pub fn advance(&self, new: T) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < new.ordinal()).then_some(new.ordinal())
            })
            .is_ok()
    }

    /// 当前状态不晚于 `limit` 时切换为 `new`，返回是否成功
    pub fn transition_if_at_most(&self, limit: T, new: T) -> bool {
        self.value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current <= limit.ordinal()).then_some(new.ordinal())
            })
            .is_ok()
    }
}

impl<T: StatusOrdinal> fmt::Debug for AtomicStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_never_regresses() {
        let status = AtomicStatus::new(SubmissionStatus::Submitted);
        assert!(status.advance(SubmissionStatus::Executing));
        assert!(!status.advance(SubmissionStatus::Pending));
        assert_eq!(status.get(), SubmissionStatus::Executing);
        assert!(status.advance(SubmissionStatus::Ended));
        assert!(!status.advance(SubmissionStatus::Complete));
        assert_eq!(status.get(), SubmissionStatus::Ended);
    }

    #[test]
    fn test_cancel_window() {
        let status = AtomicStatus::new(JobStatus::Executing);
        assert!(status.transition_if_at_most(JobStatus::Executing, JobStatus::Cancelled));
        assert!(!status.transition_if_at_most(JobStatus::Executing, JobStatus::Cancelled));
        assert!(!status.compare_and_set(JobStatus::Executing, JobStatus::Done));
    }
}
