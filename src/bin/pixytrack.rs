use clap::Parser;
/// 合成场景演示 - 采集线程 + 处理线程 + 结果读取线程
///
/// 主程序入口 - 直接运行: cargo run --bin pixytrack -- --program lines --frames 120
use flexi_logger::Logger;
use log::{debug, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pixytrack_rs::config::{Program, VisionConfig};
use pixytrack_rs::pipeline::{event_queue, Detections, EventProducer, VisionContext};
use pixytrack_rs::synth::{blob_frame, EdgeItem, EdgeScene, SceneRect};

/// 色块/线跟踪演示程序
#[derive(Parser, Debug)]
#[command(author, version, about = "色块与线跟踪演示 (合成场景)", long_about = None)]
struct Args {
    /// 检测程序: blobs 或 lines
    #[arg(short, long, default_value = "blobs")]
    program: String,

    /// 生成的帧数
    #[arg(short, long, default_value_t = 120)]
    frames: u32,

    /// 采集帧率
    #[arg(long, default_value_t = 30)]
    fps: u32,

    /// 线场景的水平抖动 (边沿坐标)
    #[arg(long, default_value_t = 0)]
    jitter: u16,

    /// 配置文件 (JSON), 不存在时写入默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 日志级别
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// 线场景: 竖直主线 + 水平暗带 + 条码
fn line_scene(jitter: u16) -> EdgeScene {
    let items = vec![
        EdgeItem::VerticalLine {
            pos: 306,
            width: 12,
            top: 8,
            bottom: 95,
        },
        EdgeItem::HorizontalBand {
            col0: 20,
            col1: 60,
            top: 30,
            bottom: 34,
        },
        EdgeItem::Barcode {
            left: 450,
            unit: 4,
            value: 9,
            top: 70,
            bottom: 76,
        },
    ];
    EdgeScene::new(items).with_jitter(jitter, 42)
}

/// 色块场景: 一个水平移动的色块, 一个静止色块, 一对相邻色块 (可组成色码)
fn blob_scene(frame: u32) -> Vec<SceneRect> {
    let dx = (frame % 60) as i32 - 30;
    vec![
        SceneRect::new(1, 60, 80, 20, 40).shifted(dx, 0),
        SceneRect::new(2, 120, 140, 60, 90),
        SceneRect::new(3, 20, 29, 70, 79),
        SceneRect::new(4, 30, 39, 70, 79),
    ]
}

/// 采集线程: 按帧率写入事件, 结束后关闭队列
fn spawn_producer(
    tx: EventProducer,
    program: Program,
    frames: u32,
    fps: u32,
    jitter: u16,
) -> thread::JoinHandle<()> {
    let period = Duration::from_millis(1000 / fps.max(1) as u64);
    thread::spawn(move || {
        info!("📷 采集线程启动: {:?} | {}帧", program, frames);
        let mut scene = line_scene(jitter);
        let mut dropped = 0;
        for i in 0..frames {
            let events = match program {
                Program::Blobs => blob_frame(&blob_scene(i)),
                Program::Lines => scene.next_frame(),
            };
            let total = events.len();
            let written = tx.push_frame(events);
            dropped += total - written;
            thread::sleep(period);
        }
        info!("📷 采集结束: 写入{}个事件 | 丢弃{}个", tx.produced(), dropped);
    })
}

fn log_detections(d: &Detections) {
    if let Some(primary) = &d.primary {
        if let Some(v) = &primary.vector {
            info!(
                "🧭 帧{}: 主向量#{} ({},{})→({},{})",
                d.frame, v.index, v.x0, v.y0, v.x1, v.y1
            );
        }
        if let Some(i) = &primary.intersection {
            info!("✚ 帧{}: 交叉点 ({},{}) 分支{}", d.frame, i.x, i.y, i.lines.len());
        }
        if let Some(b) = &primary.barcode {
            info!("🏷️  帧{}: 条码#{} 码值{} ({},{})", d.frame, b.index, b.code, b.x, b.y);
        }
    }
    if !d.blobs.is_empty() {
        let ids: Vec<u16> = d.blobs.iter().map(|b| b.index).collect();
        debug!("🎯 帧{}: {}个色块 {:?}", d.frame, d.blobs.len(), ids);
    }
    if log::log_enabled!(log::Level::Trace) {
        if let Ok(json) = serde_json::to_string(d) {
            log::trace!("{}", json);
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _logger = Logger::try_with_str(&args.log_level)?.log_to_stderr().start()?;

    let program = match args.program.to_lowercase().as_str() {
        "lines" | "line" => Program::Lines,
        "blobs" | "blob" => Program::Blobs,
        other => anyhow::bail!("未知的程序: {} (可选 blobs / lines)", other),
    };

    let mut config = match &args.config {
        Some(path) => VisionConfig::load(path),
        None => VisionConfig::default(),
    };
    config.program = program;
    config.print_summary();

    let (tx, rx) = event_queue(config.queue_capacity, config.frame_timeout_ms);
    let mut ctx = VisionContext::new(config);
    ctx.open();

    let producer = spawn_producer(tx, program, args.frames, args.fps, args.jitter);

    // 结果读取线程
    let published = ctx.published();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_reader = stop.clone();
    let reader = thread::spawn(move || {
        let mut last_seq = 0;
        let mut not_ready = 0u32;
        while !stop_reader.load(Ordering::Relaxed) {
            match published.read_new(last_seq) {
                Ok((detections, seq)) => {
                    last_seq = seq;
                    log_detections(&detections);
                }
                Err(e) if e.is_retryable() => {
                    if e == pixytrack_rs::FrameError::NotReady {
                        not_ready += 1;
                    }
                    thread::sleep(Duration::from_millis(2));
                }
                Err(e) => {
                    warn!("⚠️  读取检测结果失败: {}", e);
                    break;
                }
            }
        }
        debug!("读取线程结束: 忙碌{}次", not_ready);
    });

    let never = AtomicBool::new(false);
    let stats = ctx.run(&rx, &never)?;

    stop.store(true, Ordering::Relaxed);
    producer
        .join()
        .map_err(|_| anyhow::anyhow!("采集线程异常退出"))?;
    reader
        .join()
        .map_err(|_| anyhow::anyhow!("读取线程异常退出"))?;

    info!(
        "✅ 完成: 处理{}帧 | 中止{}帧 (溢出{} / 超时{})",
        stats.frames, stats.aborted, stats.overruns, stats.timeouts
    );
    ctx.close();
    Ok(())
}
