//! 视觉上下文 - 一次程序会话内的全部引擎状态
//! Session context: owns the active engine, drains one frame per cycle and publishes results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};

use crate::blobs::BlobEngine;
use crate::config::{Program, VisionConfig};
use crate::error::{FrameError, Result};
use crate::event::ScanEvent;
use crate::line::LineEngine;
use crate::pipeline::event_queue::EventConsumer;
use crate::pipeline::publish::{Detections, Published};

/// 当前运行的引擎
pub enum Engine {
    Blobs(BlobEngine),
    Lines(LineEngine),
}

impl Engine {
    fn new(config: &VisionConfig) -> Self {
        match config.program {
            Program::Blobs => Engine::Blobs(BlobEngine::new(config.blobs.clone())),
            Program::Lines => Engine::Lines(LineEngine::new(config.lines.clone())),
        }
    }

    fn ingest(&mut self, event: ScanEvent) -> Result<bool> {
        match self {
            Engine::Blobs(e) => e.ingest(event),
            Engine::Lines(e) => e.ingest(event),
        }
    }

    fn end_frame(&mut self, now_ms: u64) -> usize {
        match self {
            Engine::Blobs(e) => e.end_frame(now_ms),
            Engine::Lines(e) => e.end_frame(now_ms),
        }
    }

    fn abort_frame(&mut self) {
        match self {
            Engine::Blobs(e) => e.abort_frame(),
            Engine::Lines(e) => e.abort_frame(),
        }
    }

    /// 本帧的发布内容
    fn detections(&mut self, frame: u64, timestamp_ms: u64) -> Detections {
        let mut detections = Detections {
            frame,
            timestamp_ms,
            ..Default::default()
        };
        match self {
            Engine::Blobs(e) => detections.blobs = e.get_blobs(0xff, e.config().max_blobs),
            Engine::Lines(e) => {
                if let Some((primary, all)) = e.publish_frame() {
                    detections.primary = Some(primary);
                    detections.all = Some(all);
                }
            }
        }
        detections
    }
}

/// 上下文统计
#[derive(Clone, Copy, Debug, Default)]
pub struct ContextStats {
    pub frames: u64,   // 已发布帧数
    pub aborted: u64,  // 中止的帧
    pub overruns: u64,
    pub timeouts: u64,
    pub fps: f64,
}

/// 视觉上下文
///
/// `open` 后按配置的程序创建引擎, `close` 时释放全部帧状态与跟踪器。
pub struct VisionContext {
    config: VisionConfig,
    engine: Option<Engine>,
    published: Arc<Published<Detections>>,
    epoch: Instant,
    resync: bool, // 丢弃事件直到下一个帧结束
    stats: ContextStats,

    // FPS 统计
    count: u64,
    last: Instant,
}

impl VisionContext {
    pub fn new(config: VisionConfig) -> Self {
        Self {
            config,
            engine: None,
            published: Arc::new(Published::new()),
            epoch: Instant::now(),
            resync: false,
            stats: ContextStats::default(),
            count: 0,
            last: Instant::now(),
        }
    }

    pub fn config(&self) -> &VisionConfig {
        &self.config
    }

    /// 更换配置; 已打开且程序改变时重新打开
    pub fn set_config(&mut self, config: VisionConfig) {
        let reopen = self.is_open() && config.program != self.config.program;
        self.config = config;
        if reopen {
            self.close();
            self.open();
            return;
        }
        match self.engine.as_mut() {
            Some(Engine::Blobs(e)) => e.set_config(self.config.blobs.clone()),
            Some(Engine::Lines(e)) => e.set_config(self.config.lines.clone()),
            None => {}
        }
    }

    // ========== 生命周期 ==========

    pub fn open(&mut self) {
        if self.engine.is_some() {
            debug!("上下文已打开");
            return;
        }
        self.engine = Some(Engine::new(&self.config));
        self.published.clear();
        self.resync = false;
        self.stats = ContextStats::default();
        self.epoch = Instant::now();
        self.count = 0;
        self.last = Instant::now();
        info!("✅ 视觉上下文已打开: {:?}", self.config.program);
    }

    pub fn close(&mut self) {
        if self.engine.take().is_none() {
            return;
        }
        self.published.clear();
        info!(
            "🛑 视觉上下文已关闭: 共{}帧 | 中止{}帧",
            self.stats.frames, self.stats.aborted
        );
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_some()
    }

    // ========== 访问 ==========

    /// 发布缓冲 (可交给其他线程读取)
    pub fn published(&self) -> Arc<Published<Detections>> {
        self.published.clone()
    }

    pub fn stats(&self) -> ContextStats {
        self.stats
    }

    pub fn blob_engine(&self) -> Option<&BlobEngine> {
        match self.engine.as_ref() {
            Some(Engine::Blobs(e)) => Some(e),
            _ => None,
        }
    }

    pub fn blob_engine_mut(&mut self) -> Option<&mut BlobEngine> {
        match self.engine.as_mut() {
            Some(Engine::Blobs(e)) => Some(e),
            _ => None,
        }
    }

    pub fn line_engine(&self) -> Option<&LineEngine> {
        match self.engine.as_ref() {
            Some(Engine::Lines(e)) => Some(e),
            _ => None,
        }
    }

    pub fn line_engine_mut(&mut self) -> Option<&mut LineEngine> {
        match self.engine.as_mut() {
            Some(Engine::Lines(e)) => Some(e),
            _ => None,
        }
    }

    // ========== 帧处理 ==========

    /// 处理一帧, 时间戳为上下文打开后的毫秒数
    pub fn process_frame(&mut self, consumer: &EventConsumer) -> Result<usize> {
        let epoch = self.epoch;
        self.next_frame(consumer, || epoch.elapsed().as_millis() as u64)
    }

    /// 处理一帧, 使用给定的时间戳
    pub fn process_frame_at(&mut self, consumer: &EventConsumer, now_ms: u64) -> Result<usize> {
        self.next_frame(consumer, || now_ms)
    }

    /// 读取事件直到帧结束; 中止的帧不发布, 跟踪器不变
    fn next_frame<F>(&mut self, consumer: &EventConsumer, now: F) -> Result<usize>
    where
        F: FnOnce() -> u64,
    {
        let Some(engine) = self.engine.as_mut() else {
            return Err(FrameError::NotOpen);
        };

        let mut started = false;
        let outcome = loop {
            let event = match consumer.recv() {
                Ok(event) => event,
                Err(e) => break Err(e),
            };
            if self.resync {
                if matches!(event, ScanEvent::FrameEnd | ScanEvent::Overrun) {
                    debug!("已跳过残帧");
                    self.resync = false;
                }
                continue;
            }
            started = true;
            match engine.ingest(event) {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(()) => {
                let now_ms = now();
                let n = engine.end_frame(now_ms);
                self.stats.frames += 1;
                let detections = engine.detections(self.stats.frames, now_ms);
                self.published.write(detections);
                self.tick();
                Ok(n)
            }
            Err(FrameError::Overrun) => {
                // 引擎已在收到哨兵时中止本帧
                self.stats.overruns += 1;
                self.stats.aborted += 1;
                Err(FrameError::Overrun)
            }
            Err(FrameError::Timeout(ms)) => {
                self.stats.timeouts += 1;
                if started {
                    engine.abort_frame();
                    self.stats.aborted += 1;
                    self.resync = true;
                    warn!("⏱️  等待事件超时 {}ms, 本帧作废", ms);
                }
                Err(FrameError::Timeout(ms))
            }
            Err(e) => Err(e),
        }
    }

    fn tick(&mut self) {
        self.count += 1;
        if self.last.elapsed().as_secs_f64() >= 1.0 {
            let elapsed = self.last.elapsed().as_secs_f64();
            self.stats.fps = self.count as f64 / elapsed;

            info!(
                "📊 处理统计: 处理{}帧 | 实际{:.1}fps | 中止{}帧",
                self.count, self.stats.fps, self.stats.aborted
            );

            self.last = Instant::now();
            self.count = 0;
        }
    }

    /// 处理循环: 中止的帧继续, 事件源断开或 `stop` 置位时退出
    pub fn run(&mut self, consumer: &EventConsumer, stop: &AtomicBool) -> Result<ContextStats> {
        info!("🚀 处理循环启动");
        while !stop.load(Ordering::Relaxed) {
            match self.process_frame(consumer) {
                Ok(_) => {}
                Err(e) if e.is_frame_abort() => continue,
                Err(FrameError::Disconnected) => {
                    info!("📴 事件源已断开, 处理循环结束");
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(self.stats)
    }
}

impl Drop for VisionContext {
    fn drop(&mut self) {
        self.close();
    }
}
