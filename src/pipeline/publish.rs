//! 检测结果发布
//! Published detection buffer guarded by a busy flag

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, TryLockError};

use serde::Serialize;

use crate::blobs::BlobRecord;
use crate::error::{FrameError, Result};
use crate::line::{AllFrame, PrimaryFrame};

/// 一帧的完整检测结果
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Detections {
    pub frame: u64, // 帧序号, 从1开始
    pub timestamp_ms: u64,
    pub blobs: Vec<BlobRecord>,
    pub primary: Option<PrimaryFrame>,
    pub all: Option<AllFrame>,
}

impl Detections {
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty() && self.primary.is_none() && self.all.is_none()
    }
}

/// 单槽发布缓冲
///
/// 写入期间读取方得到 [`FrameError::NotReady`], 永远不会看到写了一半的数据。
pub struct Published<T> {
    busy: AtomicBool,
    seq: AtomicU64,
    slot: Mutex<Option<T>>,
}

impl<T: Clone> Default for Published<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Published<T> {
    pub fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
            seq: AtomicU64::new(0),
            slot: Mutex::new(None),
        }
    }

    /// 替换为新一帧的结果, 返回新的序号
    pub fn write(&self, value: T) -> u64 {
        self.busy.store(true, Ordering::Release);
        {
            let mut slot = match self.slot.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *slot = Some(value);
        }
        let seq = self.seq.fetch_add(1, Ordering::AcqRel) + 1;
        self.busy.store(false, Ordering::Release);
        seq
    }

    /// 最近一帧的结果
    pub fn read(&self) -> Result<T> {
        self.read_with_seq().map(|(value, _)| value)
    }

    /// 只在序号大于 `last_seq` 时返回结果
    pub fn read_new(&self, last_seq: u64) -> Result<(T, u64)> {
        let (value, seq) = self.read_with_seq()?;
        if seq <= last_seq {
            return Err(FrameError::NoNewData);
        }
        Ok((value, seq))
    }

    fn read_with_seq(&self) -> Result<(T, u64)> {
        if self.busy.load(Ordering::Acquire) {
            return Err(FrameError::NotReady);
        }
        let slot = match self.slot.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(FrameError::NotReady),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        let value = slot.as_ref().cloned().ok_or(FrameError::NoNewData)?;
        Ok((value, self.seq.load(Ordering::Acquire)))
    }

    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// 清空 (上下文关闭时)
    pub fn clear(&self) {
        self.busy.store(true, Ordering::Release);
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
        self.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_slot() {
        let published: Published<u32> = Published::new();
        assert_eq!(published.read(), Err(FrameError::NoNewData));
    }

    #[test]
    fn test_write_then_read() {
        let published = Published::new();
        assert_eq!(published.write(7u32), 1);
        assert_eq!(published.read(), Ok(7));
        assert_eq!(published.read_new(0), Ok((7, 1)));
        assert_eq!(published.read_new(1), Err(FrameError::NoNewData));
        assert_eq!(published.write(8), 2);
        assert_eq!(published.read_new(1), Ok((8, 2)));
    }

    #[test]
    fn test_busy_reads_not_ready() {
        let published = Published::new();
        published.write(1u32);
        published.busy.store(true, Ordering::Release);
        assert_eq!(published.read(), Err(FrameError::NotReady));
        published.busy.store(false, Ordering::Release);

        // 写入方持有锁时同样返回 NotReady
        let guard = published.slot.lock().unwrap();
        assert_eq!(published.read(), Err(FrameError::NotReady));
        drop(guard);
        assert_eq!(published.read(), Ok(1));
    }

    #[test]
    fn test_clear() {
        let published = Published::new();
        published.write(3u32);
        published.clear();
        assert_eq!(published.read(), Err(FrameError::NoNewData));
    }
}
