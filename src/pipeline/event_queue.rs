//! 事件队列
//! Fixed-capacity producer/consumer event queue with an in-band overrun sentinel

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;

use crate::error::{FrameError, Result};
use crate::event::ScanEvent;

/// 生产者与消费者共享的计数
#[derive(Default)]
struct Counters {
    produced: AtomicU32, // 单调递增, 回绕
    consumed: AtomicU32,
    dropped: AtomicU32,
    overruns: AtomicU32,
}

/// 创建一对生产者/消费者
pub fn event_queue(capacity: usize, timeout_ms: u64) -> (EventProducer, EventConsumer) {
    let (tx, rx) = bounded(capacity.max(1));
    let counters = Arc::new(Counters::default());
    (
        EventProducer {
            tx,
            counters: counters.clone(),
            dropping: AtomicBool::new(false),
        },
        EventConsumer {
            rx,
            counters,
            timeout: Duration::from_millis(timeout_ms),
        },
    )
}

/// 生产端 (采集线程)
///
/// 队列满时丢弃本帧剩余事件, 并在本帧结束处写入 [`ScanEvent::Overrun`] 代替帧结束。
/// 写不进去就继续丢弃, 直到某个帧结束处能写入为止。
pub struct EventProducer {
    tx: Sender<ScanEvent>,
    counters: Arc<Counters>,
    dropping: AtomicBool,
}

impl EventProducer {
    fn try_send(&self, event: ScanEvent) -> std::result::Result<(), TrySendError<ScanEvent>> {
        self.tx.try_send(event)?;
        self.counters.produced.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 写入一个事件, 返回 false 表示事件被丢弃
    pub fn push(&self, event: ScanEvent) -> bool {
        if self.dropping.load(Ordering::Acquire) {
            if event == ScanEvent::FrameEnd && self.try_send(ScanEvent::Overrun).is_ok() {
                self.dropping.store(false, Ordering::Release);
            }
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match self.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                self.counters.overruns.fetch_add(1, Ordering::Relaxed);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️  事件队列已满, 本帧作废");
                // 帧结束本身被丢弃时, 哨兵要等到下一个帧结束
                self.dropping.store(true, Ordering::Release);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// 写入一整帧, 返回成功写入的事件数
    pub fn push_frame<I>(&self, events: I) -> usize
    where
        I: IntoIterator<Item = ScanEvent>,
    {
        events.into_iter().filter(|e| self.push(*e)).count()
    }

    pub fn produced(&self) -> u32 {
        self.counters.produced.load(Ordering::Relaxed)
    }

    /// 是否正在丢弃 (已溢出, 哨兵尚未写入)
    pub fn is_dropping(&self) -> bool {
        self.dropping.load(Ordering::Acquire)
    }
}

/// 消费端 (处理线程)
pub struct EventConsumer {
    rx: Receiver<ScanEvent>,
    counters: Arc<Counters>,
    timeout: Duration,
}

impl EventConsumer {
    /// 读取下一个事件, 最多等待一个超时周期
    pub fn recv(&self) -> Result<ScanEvent> {
        match self.rx.recv_timeout(self.timeout) {
            Ok(event) => {
                self.counters.consumed.fetch_add(1, Ordering::Relaxed);
                Ok(event)
            }
            Err(RecvTimeoutError::Timeout) => {
                Err(FrameError::Timeout(self.timeout.as_millis() as u64))
            }
            Err(RecvTimeoutError::Disconnected) => Err(FrameError::Disconnected),
        }
    }

    pub fn consumed(&self) -> u32 {
        self.counters.consumed.load(Ordering::Relaxed)
    }

    /// 已写入但未读取的事件数
    pub fn pending(&self) -> u32 {
        let produced = self.counters.produced.load(Ordering::Relaxed);
        produced.wrapping_sub(self.consumed())
    }

    /// 因溢出被丢弃的事件总数
    pub fn dropped(&self) -> u32 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// 溢出次数
    pub fn overruns(&self) -> u32 {
        self.counters.overruns.load(Ordering::Relaxed)
    }
}
