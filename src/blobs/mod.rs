//! 色块检测与跟踪
//! Blob segmentation, composition and identity tracking

pub mod color_code;
pub mod compose;
pub mod segment;
pub mod types;

use log::{debug, warn};

use crate::config::BlobConfig;
use crate::error::{FrameError, Result};
use crate::event::ScanEvent;
use crate::tracking::{Tracker, TrackerSet, TR_MAXVAL};

use color_code::{process_cc, ColorCodeParams};
use compose::{combine, combine2_fixpoint};
use segment::{CcAssembler, RowSegment, RunMerger};
pub use types::{
    BlobCandidate, BlobRecord, ColorCodeMode, SignatureTable, BL_PERIOD_US, CL_NUM_SIGNATURES,
    MIN_COLOR_CODE_AREA,
};

/// 色块跟踪器数量上限 (普通 + 色码)
const MAX_BLOB_TRACKERS: usize = types::MAX_BLOBS * 2;

/// 单帧统计
#[derive(Clone, Copy, Debug, Default)]
pub struct BlobFrameStats {
    pub segments: u32,
    pub plain: usize,
    pub coded: usize,
    pub invalidated: usize,
    pub truncated: u32,
}

/// 色块引擎: 行程 → 连通域 → 合成 → 跟踪
pub struct BlobEngine {
    config: BlobConfig,
    signatures: SignatureTable,
    merger: RunMerger,
    assemblers: Vec<CcAssembler>, // 每个签名一个
    blobs: Vec<BlobCandidate>,    // 本帧色块, 普通在前, 色码在后
    num_plain: usize,
    trackers: TrackerSet<BlobCandidate>,
    max_tracking_vel2: i64,
    last_frame_ms: Option<u64>,
    stats: BlobFrameStats,
}

impl BlobEngine {
    pub fn new(config: BlobConfig) -> Self {
        let signatures = config.signature_table();
        let max_vel = config.max_velocity as i64;
        Self {
            config,
            signatures,
            merger: RunMerger::new(),
            assemblers: (0..CL_NUM_SIGNATURES).map(|_| CcAssembler::default()).collect(),
            blobs: Vec::new(),
            num_plain: 0,
            trackers: TrackerSet::new("色块", MAX_BLOB_TRACKERS),
            max_tracking_vel2: max_vel * max_vel,
            last_frame_ms: None,
            stats: BlobFrameStats::default(),
        }
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// 更新参数 (跟踪器保留)
    pub fn set_config(&mut self, config: BlobConfig) {
        self.signatures = config.signature_table();
        let max_vel = config.max_velocity as i64;
        self.max_tracking_vel2 = max_vel * max_vel;
        self.config = config;
    }

    pub fn set_color_code_mode(&mut self, mode: ColorCodeMode) {
        self.config.color_code_mode = mode;
    }

    pub fn set_signatures(&mut self, signatures: SignatureTable) {
        self.signatures = signatures;
    }

    pub fn set_filtering(&mut self, filtering: u16) {
        self.config.filtering = filtering;
    }

    pub fn set_max_velocity(&mut self, max_velocity: u16) {
        self.config.max_velocity = max_velocity;
        self.max_tracking_vel2 = max_velocity as i64 * max_velocity as i64;
    }

    // ========== 帧输入 ==========

    fn add_segment(&mut self, segment: RowSegment) {
        if !(1..=CL_NUM_SIGNATURES).contains(&segment.signature) {
            return;
        }
        self.stats.segments += 1;
        let assembler = &mut self.assemblers[(segment.signature - 1) as usize];
        if !assembler.add(&segment) {
            self.stats.truncated += 1;
        }
    }

    /// 处理一个扫描事件, 返回 true 表示帧结束
    pub fn ingest(&mut self, event: ScanEvent) -> Result<bool> {
        match event {
            ScanEvent::RowStart => {
                if let Some(seg) = self.merger.row_start() {
                    self.add_segment(seg);
                }
            }
            ScanEvent::Run { signature, col } => {
                if let Some(seg) = self.merger.push(signature, col) {
                    self.add_segment(seg);
                }
            }
            ScanEvent::FrameEnd => {
                if let Some(seg) = self.merger.finish() {
                    self.add_segment(seg);
                }
                return Ok(true);
            }
            ScanEvent::Overrun => {
                self.abort_frame();
                return Err(FrameError::Overrun);
            }
            ScanEvent::VScanStart | ScanEvent::Edge(_) => {}
        }
        Ok(false)
    }

    /// 中止当前帧: 组装器清空, 本帧无色块, 跟踪器不变
    pub fn abort_frame(&mut self) {
        for assembler in self.assemblers.iter_mut() {
            assembler.reset();
        }
        self.merger.reset();
        self.blobs.clear();
        self.num_plain = 0;
        self.stats = BlobFrameStats::default();
        warn!("⚠️  色块帧已中止");
    }

    /// 处理一整帧事件
    pub fn process_frame<I>(&mut self, events: I, now_ms: u64) -> Result<usize>
    where
        I: IntoIterator<Item = ScanEvent>,
    {
        for event in events {
            if self.ingest(event)? {
                return Ok(self.end_frame(now_ms));
            }
        }
        // 没有收到帧结束
        self.abort_frame();
        Err(FrameError::Timeout(0))
    }

    // ========== 合成 ==========

    /// 帧结束: 合成色块并跟踪, 返回本帧色块数量
    pub fn end_frame(&mut self, now_ms: u64) -> usize {
        let mode = self.config.color_code_mode;
        let mut plain: Vec<BlobCandidate> = Vec::new();
        let mut invalidated = 0;

        for (i, assembler) in self.assemblers.iter_mut().enumerate() {
            let sig = i as u8 + 1;
            let color_code = self.signatures.cc_signature(mode, sig);
            let start = plain.len();
            let finished = assembler.end_frame();

            for blob in finished.iter().take(self.config.max_blobs_per_model) {
                if plain.len() >= self.config.max_blobs {
                    break;
                }
                let min_area = if color_code {
                    MIN_COLOR_CODE_AREA
                } else {
                    self.config.min_area
                };
                if blob.area < min_area || blob.bottom.saturating_sub(blob.top) <= 1 {
                    continue;
                }
                plain.push(BlobCandidate::new(
                    sig as u16,
                    blob.left << 1,
                    blob.right << 1,
                    blob.top,
                    blob.bottom,
                ));
            }
            // 色码签名不做相邻合并
            if !color_code {
                invalidated += combine2_fixpoint(&mut plain[start..], self.config.merge_dist);
            }
        }

        invalidated += combine(&mut plain);

        let coded = if mode != ColorCodeMode::Disabled {
            let params = ColorCodeParams {
                mode,
                signatures: &self.signatures,
                max_coded_dist: self.config.max_coded_dist,
            };
            let capacity = self.config.max_blobs.saturating_sub(plain.len());
            process_cc(&mut plain, &params, capacity)
        } else {
            Vec::new()
        };

        plain.retain(|b| b.is_valid());
        self.num_plain = plain.len();
        self.blobs = plain;
        self.blobs.extend(coded);

        self.stats.plain = self.num_plain;
        self.stats.coded = self.blobs.len() - self.num_plain;
        self.stats.invalidated = invalidated;

        self.handle_tracking(now_ms);
        self.merger.reset();

        debug!(
            "🟦 色块帧: 线段 {} 普通 {} 色码 {} 合并 {} 跟踪器 {}",
            self.stats.segments,
            self.stats.plain,
            self.stats.coded,
            invalidated,
            self.trackers.len()
        );
        let count = self.blobs.len();
        self.stats.segments = 0;
        count
    }

    fn handle_tracking(&mut self, now_ms: u64) {
        // 与上一帧的时间差 (us), 首帧使用标准帧周期
        let elapsed_us = match self.last_frame_ms {
            Some(prev) => (now_ms.saturating_sub(prev) * 1000).max(1),
            None => BL_PERIOD_US,
        };
        self.last_frame_ms = Some(now_ms);

        let max_vel2 = self.max_tracking_vel2;
        let links = self.trackers.handle_tracking(
            &self.blobs,
            self.config.filtering,
            now_ms,
            |tracker: &Tracker<BlobCandidate>, blob: &BlobCandidate| {
                compare_blobs(tracker.object(), blob, elapsed_us, max_vel2)
            },
        );
        for (blob, link) in self.blobs.iter_mut().zip(links) {
            blob.tracker = link;
        }
    }

    // ========== 输出 ==========

    /// 本帧的色块 (未经跟踪过滤)
    pub fn frame_blobs(&self) -> &[BlobCandidate] {
        &self.blobs
    }

    pub fn trackers(&self) -> &TrackerSet<BlobCandidate> {
        &self.trackers
    }

    pub fn stats(&self) -> BlobFrameStats {
        self.stats
    }

    /// 已确认的色块, 按面积降序, 最多 `max` 个
    ///
    /// `sigmap` 的 bit0..6 选择签名 1..7, bit7 选择色码。
    pub fn get_blobs(&self, sigmap: u8, max: usize) -> Vec<BlobRecord> {
        let mut records: Vec<BlobRecord> = self
            .trackers
            .iter()
            .filter_map(|t| t.get().map(|b| (t, b)))
            .filter(|(_, b)| {
                if b.is_color_code() {
                    sigmap & 0x80 != 0
                } else {
                    b.model > 0 && sigmap & (1 << (b.model - 1)) != 0
                }
            })
            .map(|(t, b)| BlobRecord::from_blob(b, t.id(), t.age()))
            .collect();
        records.sort_by(|a, b| {
            (b.width as u32 * b.height as u32).cmp(&(a.width as u32 * a.height as u32))
        });
        records.truncate(max);
        records
    }

    /// 面积最大的色块; `signature` 为 0 时不限签名。同时返回匹配数量。
    pub fn get_max_blob(&self, signature: u16) -> Option<(BlobRecord, usize)> {
        let mut count = 0;
        let mut best: Option<(&Tracker<BlobCandidate>, &BlobCandidate)> = None;
        for tracker in self.trackers.iter() {
            let Some(blob) = tracker.get() else {
                continue;
            };
            if signature != 0 && blob.model != signature {
                continue;
            }
            count += 1;
            if best.map_or(true, |(_, b)| blob.area() > b.area()) {
                best = Some((tracker, blob));
            }
        }
        best.map(|(t, b)| (BlobRecord::from_blob(b, t.id(), t.age()), count))
    }

    /// 按签名分组 (1..7, 然后色码), 组内按面积降序
    pub fn reload_blobs(&self) -> Vec<BlobRecord> {
        let valid: Vec<BlobRecord> = self
            .trackers
            .iter()
            .filter_map(|t| t.get().map(|b| BlobRecord::from_blob(b, t.id(), t.age())))
            .collect();
        let mut out = Vec::with_capacity(valid.len());
        for sig in 1..=(CL_NUM_SIGNATURES as u16 + 1) {
            let mut group: Vec<BlobRecord> = valid
                .iter()
                .filter(|r| {
                    if sig > CL_NUM_SIGNATURES as u16 {
                        r.model > CL_NUM_SIGNATURES as u16
                    } else {
                        r.model == sig
                    }
                })
                .copied()
                .collect();
            group.sort_by(|a, b| {
                (b.width as u32 * b.height as u32).cmp(&(a.width as u32 * a.height as u32))
            });
            out.extend(group);
        }
        out
    }
}

/// 色块跟踪代价
pub fn compare_blobs(b0: &BlobCandidate, b1: &BlobCandidate, elapsed_us: u64, max_vel2: i64) -> u32 {
    if b0.model != b1.model {
        return TR_MAXVAL;
    }
    let xc = ((b0.left as i64 + b0.right as i64) >> 1) - ((b1.left as i64 + b1.right as i64) >> 1);
    let yc = ((b0.top as i64 + b0.bottom as i64) >> 1) - ((b1.top as i64 + b1.bottom as i64) >> 1);
    let vel2 = ((xc * xc + yc * yc) >> 1) * BL_PERIOD_US as i64 / elapsed_us.max(1) as i64;
    if vel2 > max_vel2 {
        return TR_MAXVAL;
    }
    let l = b0.left as i64 - b1.left as i64;
    let r = b0.right as i64 - b1.right as i64;
    let t = b0.top as i64 - b1.top as i64;
    let b = b0.bottom as i64 - b1.bottom as i64;
    (((l * l + r * r + t * t + b * b) >> 2) as u64).min(TR_MAXVAL as u64 - 1) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracking::TrackState;

    /// 生成一帧矩形色块事件 (列为半分辨率)
    fn frame(rects: &[(u8, u16, u16, u16, u16)]) -> Vec<ScanEvent> {
        let mut events = Vec::new();
        for row in 0..100u16 {
            events.push(ScanEvent::RowStart);
            let mut runs: Vec<(u16, u8)> = Vec::new();
            for &(sig, l, r, t, b) in rects {
                if row >= t && row <= b {
                    for col in l..=r {
                        runs.push((col, sig));
                    }
                }
            }
            runs.sort();
            for (col, signature) in runs {
                events.push(ScanEvent::Run { signature, col });
            }
        }
        events.push(ScanEvent::FrameEnd);
        events
    }

    fn engine(mode: ColorCodeMode, cc_bits: u8) -> BlobEngine {
        let config = BlobConfig {
            color_code_mode: mode,
            color_code_signatures: cc_bits,
            filtering: 1,
            ..BlobConfig::default()
        };
        BlobEngine::new(config)
    }

    #[test]
    fn test_single_blob_tracked() {
        let mut e = engine(ColorCodeMode::Disabled, 0);
        let n = e.process_frame(frame(&[(1, 10, 30, 20, 40)]), 0).unwrap();
        assert_eq!(n, 1);
        assert!(e.get_blobs(0xff, 10).is_empty());

        e.process_frame(frame(&[(1, 11, 31, 20, 40)]), 20).unwrap();
        let blobs = e.get_blobs(0xff, 10);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].model, 1);
        assert_eq!(blobs[0].index, 0);
        // 列坐标已加倍
        assert!(blobs[0].x >= 40 && blobs[0].x <= 44);
    }

    #[test]
    fn test_overrun_aborts_frame_keeps_trackers() {
        let mut e = engine(ColorCodeMode::Disabled, 0);
        e.process_frame(frame(&[(1, 10, 30, 20, 40)]), 0).unwrap();
        e.process_frame(frame(&[(1, 10, 30, 20, 40)]), 20).unwrap();

        let mut events = frame(&[(1, 10, 30, 20, 40)]);
        events.insert(50, ScanEvent::Overrun);
        assert_eq!(e.process_frame(events, 40), Err(FrameError::Overrun));
        assert!(e.frame_blobs().is_empty());
        assert_eq!(e.trackers().len(), 1);
        assert_eq!(e.trackers().find(0).map(|t| t.state()), Some(TrackState::Valid));
    }

    #[test]
    fn test_sigmap_filter_and_order() {
        let mut e = engine(ColorCodeMode::Disabled, 0);
        let rects = [(1, 10, 20, 10, 20), (2, 60, 100, 10, 50), (3, 120, 130, 60, 90)];
        e.process_frame(frame(&rects), 0).unwrap();
        e.process_frame(frame(&rects), 20).unwrap();

        let all = e.get_blobs(0xff, 10);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].model, 2);
        let only_1_and_3 = e.get_blobs(0b0000_0101, 10);
        let models: Vec<u16> = only_1_and_3.iter().map(|b| b.model).collect();
        assert_eq!(models, vec![3, 1]);
        assert_eq!(e.get_blobs(0xff, 1).len(), 1);

        let (max, count) = e.get_max_blob(0).unwrap();
        assert_eq!((max.model, count), (2, 3));
        let (max3, count3) = e.get_max_blob(3).unwrap();
        assert_eq!((max3.model, count3), (3, 1));
        assert!(e.get_max_blob(4).is_none());

        let grouped: Vec<u16> = e.reload_blobs().iter().map(|b| b.model).collect();
        assert_eq!(grouped, vec![1, 2, 3]);
    }

    #[test]
    fn test_color_code_frame() {
        // 签名 1 与 2 参与色码, 相距 2 列 (加倍后 4)
        let mut e = engine(ColorCodeMode::Enabled, 0b0000_0011);
        let rects = [(1, 10, 20, 10, 30), (2, 23, 33, 10, 30)];
        e.process_frame(frame(&rects), 0).unwrap();
        e.process_frame(frame(&rects), 20).unwrap();

        let blobs = e.get_blobs(0x80, 10);
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].model, 0o12);
        assert_eq!(blobs[0].angle, 0);
        assert!(e.get_blobs(0x03, 10).is_empty());
    }

    #[test]
    fn test_small_blobs_filtered() {
        let mut e = engine(ColorCodeMode::Disabled, 0);
        // 面积过小 / 只有一行高
        let n = e
            .process_frame(frame(&[(1, 10, 12, 10, 12), (2, 40, 80, 30, 30)]), 0)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_compare_blobs_velocity_gate() {
        let a = BlobCandidate::new(1, 100, 120, 50, 70);
        let mut b = a;
        b.left += 4;
        b.right += 4;
        assert_eq!(compare_blobs(&a, &b, BL_PERIOD_US, 65 * 65), 8);
        let mut far = a;
        far.left += 200;
        far.right += 200;
        assert_eq!(compare_blobs(&a, &far, BL_PERIOD_US, 65 * 65), TR_MAXVAL);
        let other = BlobCandidate::new(2, 100, 120, 50, 70);
        assert_eq!(compare_blobs(&a, &other, BL_PERIOD_US, 65 * 65), TR_MAXVAL);
    }
}
