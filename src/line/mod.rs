//! 线检测、拓扑与条码
//! Line grid extraction, intersection graph, barcodes and primary vector tracking

pub mod barcode;
pub mod cleanup;
pub mod extract;
pub mod geometry;
pub mod graph;
pub mod grid;
pub mod nadir;
pub mod primary;

use log::{debug, warn};
use serde::Serialize;

use crate::config::LineConfig;
use crate::error::{FrameError, Result};
use crate::event::ScanEvent;
use crate::tracking::{TrackEvents, Tracker, TrackerSet, TR_MAXVAL};
use crate::types::Point;

use barcode::{compare_barcodes, BarcodeDetector, DecodedBarcode};
use extract::SegmentExtractor;
use geometry::{tan_diff_abs1000, MAX_TRACKING_TAN};
use graph::{Line, LineGraph, LINE_MAX_LINES};
use grid::{EdgeParams, LineGrid, LINE_GRID_HEIGHT_REDUCTION, LINE_GRID_WIDTH_REDUCTION};
pub use primary::{FrameIntersection, IntersectionLine, PrimaryState, PrimaryTracker};

/// 每行最多缓存的边沿数
pub const LINE_ROW_CAPACITY: usize = 318;
/// 条码跟踪器数量上限
const MAX_BARCODE_TRACKERS: usize = barcode::LINE_MMC_VOTED_BARCODES * 2;

// ========== 模式位 ==========

pub const LINE_MODEMAP_TURN_DELAYED: u8 = 0x01;
pub const LINE_MODEMAP_MANUAL_SELECT_VECTOR: u8 = 0x02;
pub const LINE_MODEMAP_WHITE_LINE: u8 = 0x80;

// ========== 输出类型位 ==========

pub const LINE_FR_VECTOR_LINES: u8 = 0x01;
pub const LINE_FR_INTERSECTION: u8 = 0x02;
pub const LINE_FR_BARCODE: u8 = 0x04;
/// 主向量记录: 本帧存在交叉点
pub const LINE_FR_FLAG_INTERSECTION: u8 = 0x04;

/// 被跟踪的线 (只保留端点)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackedLine {
    pub p0: Point,
    pub p1: Point,
}

impl TrackedLine {
    pub fn length2(&self) -> u32 {
        self.p0.dist2(&self.p1)
    }
}

impl From<&Line> for TrackedLine {
    fn from(line: &Line) -> Self {
        Self {
            p0: line.p0,
            p1: line.p1,
        }
    }
}

/// 线记录
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct LineRecord {
    pub x0: u8,
    pub y0: u8,
    pub x1: u8,
    pub y1: u8,
    pub index: u16,
    pub flags: u8,
}

/// 条码记录 (中心为网格坐标)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BarcodeRecord {
    pub x: u8,
    pub y: u8,
    pub flags: u8,
    pub code: u8,
    pub index: u16,
}

impl BarcodeRecord {
    fn from_tracker(tracker: &Tracker<DecodedBarcode>, flags: u8) -> Self {
        let code = tracker.object();
        let o = &code.outline;
        Self {
            x: ((o.x + (o.width >> 1)) >> LINE_GRID_WIDTH_REDUCTION) as u8,
            y: ((o.y + (o.height >> 1)) >> LINE_GRID_HEIGHT_REDUCTION) as u8,
            flags,
            code: code.val,
            index: tracker.id(),
        }
    }
}

/// 主向量输出
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PrimaryFrame {
    pub vector: Option<LineRecord>,
    pub intersection: Option<FrameIntersection>,
    pub barcode: Option<BarcodeRecord>,
}

/// 全部特征输出
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct AllFrame {
    pub lines: Vec<LineRecord>,
    pub intersections: Vec<FrameIntersection>,
    pub barcodes: Vec<BarcodeRecord>,
}

/// 单帧统计
#[derive(Clone, Copy, Debug, Default)]
pub struct LineFrameStats {
    pub rows: u32,
    pub dropped_edges: u32,
    pub segments: usize,
    pub lines: usize,
    pub intersections: usize,
    pub candidates: usize,
    pub barcodes: usize,
    pub clean_passes: u32,
    pub truncated: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ScanKind {
    Horizontal,
    Vertical,
}

/// 线引擎: 边沿 → 网格 → 线段 → 拓扑 → 跟踪 → 主向量
pub struct LineEngine {
    config: LineConfig,
    grid: LineGrid,
    graph: LineGraph,
    extractor: SegmentExtractor,
    barcodes: BarcodeDetector,
    line_trackers: TrackerSet<TrackedLine>,
    barcode_trackers: TrackerSet<DecodedBarcode>,
    primary: PrimaryTracker,

    // 本帧输入状态
    row: i32,
    scan: Option<ScanKind>,
    row_edges: Vec<u16>,
    frame_flag: bool, // 有尚未读取的新帧
    stats: LineFrameStats,
}

impl LineEngine {
    pub fn new(config: LineConfig) -> Self {
        let primary = PrimaryTracker::new(&config);
        Self {
            config,
            grid: LineGrid::new(),
            graph: LineGraph::new(),
            extractor: SegmentExtractor::new(),
            barcodes: BarcodeDetector::new(),
            line_trackers: TrackerSet::new("线", LINE_MAX_LINES),
            barcode_trackers: TrackerSet::new("条码", MAX_BARCODE_TRACKERS),
            primary,
            row: -1,
            scan: None,
            row_edges: Vec::with_capacity(LINE_ROW_CAPACITY),
            frame_flag: false,
            stats: LineFrameStats::default(),
        }
    }

    pub fn config(&self) -> &LineConfig {
        &self.config
    }

    /// 更新参数 (跟踪器保留)
    pub fn set_config(&mut self, config: LineConfig) {
        self.primary.apply_config(&config);
        self.config = config;
    }

    /// 模式位: 延迟转向 / 手动选择 / 白线
    pub fn set_mode(&mut self, mode: u8) {
        self.config.delayed_turn = mode & LINE_MODEMAP_TURN_DELAYED != 0;
        self.config.manual_vector_select = mode & LINE_MODEMAP_MANUAL_SELECT_VECTOR != 0;
        self.config.white_line = mode & LINE_MODEMAP_WHITE_LINE != 0;
        self.primary.set_delayed_turn(self.config.delayed_turn);
        self.primary.set_manual_select(self.config.manual_vector_select);
    }

    pub fn set_next_turn_angle(&mut self, angle: i16) {
        self.primary.set_next_turn_angle(angle);
    }

    pub fn set_default_turn_angle(&mut self, angle: i16) {
        self.config.default_turn_angle = angle;
        self.primary.set_default_turn_angle(angle);
    }

    /// 手动指定主向量 (需处于手动选择模式)
    pub fn set_vector(&mut self, index: u16) -> Result<()> {
        if self.line_trackers.find(index).is_none() {
            return Err(FrameError::InvalidIndex(index));
        }
        self.primary.select_vector(index);
        Ok(())
    }

    pub fn reverse_vector(&mut self) -> Result<()> {
        self.primary.reverse_vector()
    }

    // ========== 帧输入 ==========

    fn edge_params(&self) -> EdgeParams {
        EdgeParams {
            min_width: self.config.min_line_width,
            max_width: self.config.max_line_width,
            edge_dist: self.config.edge_distance,
            white_line: self.config.white_line,
        }
    }

    /// 把缓存的一行边沿送入网格 (水平行同时做条码检测)
    fn flush_row(&mut self) {
        let Some(kind) = self.scan.take() else {
            self.row_edges.clear();
            return;
        };
        if !(0..=u8::MAX as i32).contains(&self.row) {
            self.row_edges.clear();
            return;
        }
        let row = self.row as u8;
        let params = self.edge_params();
        match kind {
            ScanKind::Horizontal => {
                self.barcodes.detect_codes(row, &self.row_edges);
                self.grid.h_line(row, &self.row_edges, &params);
                self.stats.rows += 1;
            }
            ScanKind::Vertical => self.grid.v_line(row, &self.row_edges, &params),
        }
        self.row_edges.clear();
    }

    /// 处理一个扫描事件, 返回 true 表示帧结束
    pub fn ingest(&mut self, event: ScanEvent) -> Result<bool> {
        match event {
            ScanEvent::RowStart => {
                self.flush_row();
                if self.row < 0 {
                    // 新的一帧
                    self.stats.rows = 0;
                    self.stats.dropped_edges = 0;
                }
                self.row += 1;
                self.scan = Some(ScanKind::Horizontal);
            }
            ScanEvent::VScanStart => {
                self.flush_row();
                self.scan = Some(ScanKind::Vertical);
            }
            ScanEvent::Edge(word) => {
                if self.row_edges.len() < LINE_ROW_CAPACITY {
                    self.row_edges.push(word);
                } else {
                    self.stats.dropped_edges += 1;
                }
            }
            ScanEvent::FrameEnd => {
                self.flush_row();
                return Ok(true);
            }
            ScanEvent::Overrun => {
                self.abort_frame();
                return Err(FrameError::Overrun);
            }
            ScanEvent::Run { .. } => {}
        }
        Ok(false)
    }

    fn reset_frame(&mut self) {
        self.grid.clear();
        self.graph.clear();
        self.extractor.clear();
        self.barcodes.clear();
        self.row = -1;
        self.scan = None;
        self.row_edges.clear();
    }

    /// 中止当前帧: 帧内状态清空, 跟踪器不变
    pub fn abort_frame(&mut self) {
        self.reset_frame();
        self.stats = LineFrameStats::default();
        warn!("⚠️  线帧已中止");
    }

    /// 处理一整帧事件, 返回本帧的线数量
    pub fn process_frame<I>(&mut self, events: I, now_ms: u64) -> Result<usize>
    where
        I: IntoIterator<Item = ScanEvent>,
    {
        for event in events {
            if self.ingest(event)? {
                return Ok(self.end_frame(now_ms));
            }
        }
        self.abort_frame();
        Err(FrameError::Timeout(0))
    }

    // ========== 帧处理 ==========

    /// 帧结束: 条码 → 提取 → 拓扑 → 跟踪 → 主向量
    pub fn end_frame(&mut self, now_ms: u64) -> usize {
        let min_len = self.config.min_line_length.min(u8::MAX as u16) as u8;
        let merge_dist = self.config.max_merge_dist.min(u8::MAX as u16) as u8;

        self.stats.candidates = self.barcodes.candidates().len();
        self.barcodes
            .cluster_codes(self.config.edge_distance, self.config.max_code_dist);
        self.barcodes.clear_grid(&mut self.grid);
        self.handle_barcode_tracking(now_ms);

        self.graph.clear(); // 上一帧的图保留到这里
        self.extractor.extract_all(&mut self.grid, &mut self.graph);
        let mut nadirs = nadir::find_nadirs(&self.grid, self.graph.endpoints(), merge_dist);
        nadir::reduce_nadirs(&mut nadirs, &self.grid, merge_dist);
        self.graph.debug_check("交叉点候选");
        nadir::form_intersections(&mut self.graph, &mut self.grid, &nadirs);
        self.graph.debug_check("形成交叉点");
        self.stats.clean_passes = cleanup::clean_intersections(&mut self.graph, min_len);
        cleanup::remove_min_lines(&mut self.graph, min_len as u32 * min_len as u32);
        self.graph.debug_check("清理");

        self.handle_line_tracking(now_ms);
        self.primary
            .handle_state(&self.line_trackers, &self.graph, now_ms);

        self.stats.segments = self.extractor.segments().len();
        self.stats.lines = self.graph.num_lines();
        self.stats.intersections = self.graph.num_intersections();
        self.stats.barcodes = self.barcodes.decoded().len();
        self.stats.truncated = self.extractor.truncated()
            + self.graph.truncated()
            + self.barcodes.truncated();
        if self.stats.truncated > 0 {
            warn!("⚠️  线帧容量不足, 截断 {} 项", self.stats.truncated);
        }
        debug!(
            "📏 线帧: 行 {} 线段 {} 线 {} 交叉点 {} 条码 {}/{} 清理 {} 轮 跟踪器 {}",
            self.stats.rows,
            self.stats.segments,
            self.stats.lines,
            self.stats.intersections,
            self.stats.barcodes,
            self.stats.candidates,
            self.stats.clean_passes,
            self.line_trackers.len()
        );

        let count = self.graph.num_lines();
        self.frame_flag = true;
        self.grid.clear();
        self.extractor.clear();
        self.barcodes.clear();
        self.row = -1;
        self.scan = None;
        count
    }

    fn handle_barcode_tracking(&mut self, now_ms: u64) {
        let decoded = self.barcodes.decoded().to_vec();
        self.barcode_trackers.handle_tracking(
            &decoded,
            self.config.barcode_filtering,
            now_ms,
            |tracker: &Tracker<DecodedBarcode>, code: &DecodedBarcode| {
                compare_barcodes(tracker.object(), code)
            },
        );
    }

    /// 主向量及其交叉点上的线优先匹配
    fn handle_line_tracking(&mut self, now_ms: u64) {
        let ids = self.graph.line_ids();
        let lines: Vec<TrackedLine> = ids
            .iter()
            .filter_map(|&id| self.graph.line(id).map(TrackedLine::from))
            .collect();

        let max_compare = self.config.max_line_compare;
        let primary = self.primary.is_active().then(|| self.primary.primary_line()).flatten();
        let branches: Vec<u16> = self
            .primary
            .intersection()
            .map(|fi| fi.lines.iter().map(|l| l.index).collect())
            .unwrap_or_default();

        let links = self.line_trackers.handle_tracking(
            &lines,
            self.config.line_filtering,
            now_ms,
            |tracker: &Tracker<TrackedLine>, line: &TrackedLine| {
                let val = compare_lines(tracker.object(), line, max_compare);
                if primary == Some(tracker.id()) || branches.contains(&tracker.id()) {
                    val
                } else {
                    val.saturating_mul(1 << 12)
                }
            },
        );
        for (id, link) in ids.into_iter().zip(links) {
            self.graph.set_tracker(id, link);
        }
    }

    // ========== 输出 ==========

    pub fn graph(&self) -> &LineGraph {
        &self.graph
    }

    pub fn line_trackers(&self) -> &TrackerSet<TrackedLine> {
        &self.line_trackers
    }

    pub fn barcode_trackers(&self) -> &TrackerSet<DecodedBarcode> {
        &self.barcode_trackers
    }

    pub fn primary(&self) -> &PrimaryTracker {
        &self.primary
    }

    pub fn stats(&self) -> LineFrameStats {
        self.stats
    }

    pub fn has_new_frame(&self) -> bool {
        self.frame_flag
    }

    /// 主向量、新交叉点和一个新确认的条码; 每帧只能读取一次
    pub fn primary_frame(&mut self, type_map: u8) -> Result<PrimaryFrame> {
        if !self.frame_flag {
            return Err(FrameError::NoNewData);
        }
        self.frame_flag = false;
        Ok(self.format_primary(type_map))
    }

    /// 全部跟踪中的线、本帧交叉点与条码; 每帧只能读取一次
    pub fn all_frame(&mut self, type_map: u8) -> Result<AllFrame> {
        if !self.frame_flag {
            return Err(FrameError::NoNewData);
        }
        self.frame_flag = false;
        Ok(self.format_all(type_map))
    }

    /// 同一帧同时取出主向量与全部特征 (发布用)
    pub fn publish_frame(&mut self) -> Option<(PrimaryFrame, AllFrame)> {
        if !self.frame_flag {
            return None;
        }
        self.frame_flag = false;
        let primary = self.format_primary(0xff);
        Some((primary, self.format_all(0xff)))
    }

    fn format_primary(&mut self, type_map: u8) -> PrimaryFrame {
        let mut frame = PrimaryFrame::default();

        if self.primary.state() == PrimaryState::Tracking && self.primary.is_active() {
            if type_map & LINE_FR_VECTOR_LINES != 0 {
                let (p, g) = (self.primary.point(), self.primary.goal());
                let flags = if self.graph.num_intersections() > 0 {
                    LINE_FR_FLAG_INTERSECTION
                } else {
                    0
                };
                frame.vector = Some(LineRecord {
                    x0: p.x,
                    y0: p.y,
                    x1: g.x,
                    y1: g.y,
                    index: self.primary.primary_line().unwrap_or_default(),
                    flags,
                });
            }
            if type_map & LINE_FR_INTERSECTION != 0 {
                frame.intersection = self.primary.take_new_intersection();
            }
        }

        if type_map & LINE_FR_BARCODE != 0 {
            let fresh = self.barcode_trackers.iter_mut().find(|t| {
                t.events().contains(TrackEvents::VALIDATED)
                    && !t.events_shadow().contains(TrackEvents::VALIDATED)
            });
            if let Some(tracker) = fresh {
                tracker.mark_reported(TrackEvents::VALIDATED);
                frame.barcode = Some(BarcodeRecord::from_tracker(tracker, 0));
            }
        }
        frame
    }

    fn format_all(&self, type_map: u8) -> AllFrame {
        let mut frame = AllFrame::default();
        if type_map & LINE_FR_VECTOR_LINES != 0 {
            frame.lines = self
                .line_trackers
                .iter()
                .map(|t| {
                    let l = t.object();
                    LineRecord {
                        x0: l.p0.x,
                        y0: l.p0.y,
                        x1: l.p1.x,
                        y1: l.p1.y,
                        index: t.id(),
                        flags: t.state().code(),
                    }
                })
                .collect();
        }
        if type_map & LINE_FR_INTERSECTION != 0 {
            frame.intersections = self
                .graph
                .intersections()
                .map(|(_, i)| primary::format_intersection(&self.graph, i))
                .collect();
        }
        if type_map & LINE_FR_BARCODE != 0 {
            frame.barcodes = self
                .barcode_trackers
                .iter()
                .map(|t| BarcodeRecord::from_tracker(t, t.state().code()))
                .collect();
        }
        frame
    }
}

/// 线跟踪代价: 端点距离 (任一方向) 之和, 夹角过大为无穷大
pub fn compare_lines(l0: &TrackedLine, l1: &TrackedLine, max_line_compare: u32) -> u32 {
    let d00 = l0.p0.dist2(&l1.p0);
    let d01 = l0.p0.dist2(&l1.p1);
    let d10 = l0.p1.dist2(&l1.p0);
    let d11 = l0.p1.dist2(&l1.p1);
    let sum = d00.min(d01) + d10.min(d11);
    if sum > max_line_compare {
        return TR_MAXVAL;
    }
    if tan_diff_abs1000(&l0.p0, &l0.p1, &l1.p0, &l1.p1, true) > *MAX_TRACKING_TAN {
        return TR_MAXVAL;
    }
    sum
}
