//! 条码检测与投票
//! Per-row barcode candidates, multi-threshold decode, cross-row clustering and voting

use log::trace;
use serde::Serialize;

use crate::event::{edge_is_negative, edge_position};
use crate::line::grid::{
    LineGrid, LINE_GRID_HEIGHT, LINE_GRID_HEIGHT_REDUCTION, LINE_GRID_WIDTH,
    LINE_GRID_WIDTH_REDUCTION,
};
use crate::tracking::TR_MAXVAL;
use crate::types::Rect;

// ========== 常量 ==========

/// 码值位数
pub const LINE_MMC_BITS: usize = 4;
/// 最少边沿数
pub const LINE_MMC_MIN_EDGES: usize = 4 + LINE_MMC_BITS;
/// 最多边沿数
pub const LINE_MMC_MAX_EDGES: usize = 2 + LINE_MMC_BITS * 2;
/// 每帧候选上限
pub const LINE_MMC_CANDIDATE_BARCODES: usize = 32;
/// 每帧投票结果上限 (同时也是聚类上限)
pub const LINE_MMC_VOTED_BARCODES: usize = 8;
/// 投票表大小
pub const LINE_MMC_VTSIZE: usize = 8;
/// 清除网格时的垂直边距比例
pub const LINE_MMC_VBOUNDARY: f32 = 0.25;
/// 清除网格时的水平边距比例
pub const LINE_MMC_HBOUNDARY: f32 = 0.1;
/// 最宽/最窄模块的比例上限
pub const LINE_MMC_MAX_RATIO: u16 = 10;
/// 最低得票率 (/256)
pub const LINE_MMC_MIN_VOTING_THRESHOLD: u32 = 128;

/// 16 位坐标点 (边沿坐标)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Point16 {
    pub x: u16,
    pub y: u16,
}

/// 一个模块: 宽度 + 结束边沿的极性
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Module {
    pub width: u16,
    pub negative: bool,
}

/// 单行候选
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BarcodeCandidate {
    pub p0: Point16,
    pub width: u16,
    pub modules: Vec<Module>,
    pub val: u8,
}

/// 投票后的条码
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct DecodedBarcode {
    pub outline: Rect,
    pub val: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("模块极性错误")]
    Polarity,
    #[error("码位不完整")]
    Incomplete,
    #[error("模块宽度比例超限")]
    Ratio,
}

// ========== 单行检测 ==========

/// 从一个下降沿开始截取候选, 要求前方有足够的静默区
pub fn detect_code(edges: &[u16], prev: Option<u16>, row: u8) -> Option<BarcodeCandidate> {
    if edges.len() < 2 {
        return None;
    }
    let col00 = edge_position(edges[0]);
    let width0 = edge_position(edges[1]).wrapping_sub(col00);
    let qwidth = width0 << 2; // 前后静默区宽度

    if let Some(prev) = prev {
        if col00.wrapping_sub(edge_position(prev)) < qwidth {
            return None;
        }
    }

    let mut modules = Vec::with_capacity(LINE_MMC_MAX_EDGES);
    let mut width = 0;
    for e in 0..edges.len() - 1 {
        if e >= LINE_MMC_MAX_EDGES {
            return None; // 边沿过多
        }
        let col0 = edge_position(edges[e]);
        let col1 = edge_position(edges[e + 1]);
        let w = col1.wrapping_sub(col0);
        if w > qwidth {
            break;
        }
        modules.push(Module {
            width: w,
            negative: edge_is_negative(edges[e + 1]),
        });
        width = col1.wrapping_sub(col00);
    }
    if modules.len() < LINE_MMC_MIN_EDGES - 1 {
        return None;
    }

    Some(BarcodeCandidate {
        p0: Point16 {
            x: col00,
            y: row as u16,
        },
        width,
        modules,
        val: 0,
    })
}

/// 以固定阈值区分窄/宽模块; 两个窄模块合成一位
pub fn decode_with(modules: &[Module], threshold: u16) -> Result<u8, DecodeError> {
    let mut val = 0u8;
    let mut bits = 0;
    let mut pending_narrow = false;
    let mut min_width = u16::MAX;
    let mut max_width = 0;

    for (i, m) in modules.iter().enumerate().skip(1) {
        if bits >= LINE_MMC_BITS {
            break;
        }
        // 奇数位为下降沿, 偶数位为上升沿
        if m.negative != (i & 1 == 1) {
            return Err(DecodeError::Polarity);
        }
        min_width = min_width.min(m.width);
        max_width = max_width.max(m.width);

        let bit = !m.negative as u8;
        if m.width < threshold {
            if pending_narrow {
                val = (val << 1) | bit;
                bits += 1;
                pending_narrow = false;
            } else {
                pending_narrow = true;
            }
        } else if pending_narrow {
            return Err(DecodeError::Incomplete);
        } else {
            val = (val << 1) | bit;
            bits += 1;
        }
    }

    if bits != LINE_MMC_BITS {
        return Err(DecodeError::Incomplete);
    }
    if min_width == 0 || max_width / min_width > LINE_MMC_MAX_RATIO {
        return Err(DecodeError::Ratio);
    }
    Ok(val)
}

/// 依次尝试排序后各间隙的中点作阈值 (间隙从大到小)
///
/// 最大间隙不足最小宽度的 1/4 时只用"全部为窄"的阈值。
/// 极性和比例错误与阈值无关, 出现即放弃。
pub fn decode(modules: &[Module]) -> Result<u8, DecodeError> {
    let mut widths: Vec<u16> = modules.iter().map(|m| m.width).collect();
    widths.sort_unstable();
    let (Some(&min), Some(&max)) = (widths.first(), widths.last()) else {
        return Err(DecodeError::Incomplete);
    };

    let mut gaps: Vec<(u16, u16)> = widths
        .windows(2)
        .map(|w| (w[1] - w[0], (w[0] + w[1]) >> 1))
        .filter(|(gap, _)| *gap > 0)
        .collect();
    gaps.sort_by(|a, b| b.0.cmp(&a.0));

    let max_gap = gaps.first().map_or(0, |g| g.0);
    let thresholds: Vec<u16> = if max_gap < (min >> 2) + 1 {
        vec![max + 1]
    } else {
        gaps.iter().map(|g| g.1).collect()
    };

    for threshold in thresholds {
        match decode_with(modules, threshold) {
            Ok(val) => return Ok(val),
            Err(DecodeError::Incomplete) => continue,
            Err(e) => return Err(e),
        }
    }
    Err(DecodeError::Incomplete)
}

// ========== 聚类 ==========

/// y 方向加权 4 倍的距离平方
fn dist2_4(p0: &Point16, p1: &Point16) -> u32 {
    let dx = p1.x as i32 - p0.x as i32;
    let dy = (p1.y as i32 - p0.y as i32) * 4;
    (dx * dx + dy * dy) as u32
}

struct Cluster {
    indexes: Vec<usize>,
    p0: Point16,
    p1: Point16,
    width: u16,
}

impl Cluster {
    fn new(p: Point16) -> Self {
        Self {
            indexes: Vec::new(),
            p0: p,
            p1: p,
            width: 0,
        }
    }

    fn add(&mut self, index: usize, candidate: &BarcodeCandidate) {
        if self.indexes.len() < LINE_MMC_CANDIDATE_BARCODES {
            self.indexes.push(index);
        }
        // 递推平均
        let n = self.indexes.len() as u32;
        self.width = ((self.width as u32 * (n - 1) + candidate.width as u32) / n) as u16;
        self.p1 = candidate.p0;
    }

    /// 多数票, 至少 2 票且得票率不低于阈值
    fn vote(&self, candidates: &[BarcodeCandidate]) -> Option<u8> {
        let n = self.indexes.len();
        if n <= 1 {
            return None;
        }
        let mut table: Vec<(u8, u32)> = Vec::with_capacity(LINE_MMC_VTSIZE);
        for &i in &self.indexes {
            let val = candidates[i].val;
            match table.iter().position(|(v, _)| *v == val) {
                Some(pos) => table[pos].1 += 1,
                None if table.len() < LINE_MMC_VTSIZE => table.push((val, 1)),
                None => {}
            }
        }
        let (val, max) = table
            .iter()
            .fold((0, 0), |best, &(v, c)| if c > best.1 { (v, c) } else { best });
        if max <= 1 {
            trace!("条码投票不足: {} 票", max);
            return None;
        }
        if (max << 8) / (n as u32) < LINE_MMC_MIN_VOTING_THRESHOLD {
            trace!("条码得票率过低: {}/{}", max, n);
            return None;
        }
        Some(val)
    }
}

// ========== 检测器 ==========

/// 一帧的条码检测状态
#[derive(Default)]
pub struct BarcodeDetector {
    candidates: Vec<BarcodeCandidate>,
    decoded: Vec<DecodedBarcode>,
    truncated: u32,
}

impl BarcodeDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.candidates.clear();
        self.decoded.clear();
        self.truncated = 0;
    }

    pub fn candidates(&self) -> &[BarcodeCandidate] {
        &self.candidates
    }

    pub fn decoded(&self) -> &[DecodedBarcode] {
        &self.decoded
    }

    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    /// 扫描一行水平边沿
    pub fn detect_codes(&mut self, row: u8, edges: &[u16]) {
        if edges.len() < LINE_MMC_MIN_EDGES {
            return;
        }
        for j in 0..edges.len() - 1 {
            let opens = edge_is_negative(edges[j]) && !edge_is_negative(edges[j + 1]);
            if !opens || edges.len() < LINE_MMC_MIN_EDGES - 1 + j {
                continue;
            }
            let prev = if j > 0 { Some(edges[j - 1]) } else { None };
            let Some(mut candidate) = detect_code(&edges[j..], prev, row) else {
                continue;
            };
            if self.candidates.len() >= LINE_MMC_CANDIDATE_BARCODES {
                self.truncated += 1;
                return;
            }
            match decode(&candidate.modules) {
                Ok(val) => {
                    candidate.val = val;
                    self.candidates.push(candidate);
                }
                Err(e) => trace!("条码解码失败 行 {} 列 {}: {}", row, candidate.p0.x, e),
            }
        }
    }

    /// 跨行聚类并投票, 返回本帧解出的条码
    pub fn cluster_codes(&mut self, edge_dist: u16, max_code_dist: u32) -> &[DecodedBarcode] {
        let mut clusters: Vec<Cluster> = Vec::with_capacity(LINE_MMC_VOTED_BARCODES);
        for (i, candidate) in self.candidates.iter().enumerate() {
            let j = clusters
                .iter()
                .position(|c| dist2_4(&candidate.p0, &c.p1) < max_code_dist)
                .unwrap_or(clusters.len());
            if j >= LINE_MMC_VOTED_BARCODES {
                continue; // 聚类表已满
            }
            if j == clusters.len() {
                clusters.push(Cluster::new(candidate.p0));
            }
            clusters[j].add(i, candidate);
        }

        self.decoded.clear();
        for cluster in &clusters {
            if self.decoded.len() >= LINE_MMC_VOTED_BARCODES {
                break;
            }
            let Some(val) = cluster.vote(&self.candidates) else {
                continue;
            };
            self.decoded.push(DecodedBarcode {
                outline: Rect {
                    x: cluster.p0.x + edge_dist,
                    y: cluster.p0.y,
                    width: cluster.width + 1,
                    height: cluster.p1.y.saturating_sub(cluster.p0.y) + 1,
                },
                val,
            });
        }
        &self.decoded
    }

    /// 清除条码区域内的线网格, 避免条码被当作线
    pub fn clear_grid(&self, grid: &mut LineGrid) {
        for code in &self.decoded {
            let (left, top, right, bottom) = grid_rect(&code.outline);
            grid.clear_rect(left, top, right, bottom);
        }
    }
}

/// 条码外框 (含边距) 对应的网格范围
pub fn grid_rect(outline: &Rect) -> (usize, usize, usize, usize) {
    let mut h = (LINE_MMC_HBOUNDARY * outline.width as f32) as i32;
    if h >> LINE_GRID_WIDTH_REDUCTION == 0 {
        h = 1 << LINE_GRID_WIDTH_REDUCTION; // 至少一个网格
    }
    let mut v = (LINE_MMC_VBOUNDARY * outline.height as f32) as i32;
    if v >> LINE_GRID_HEIGHT_REDUCTION == 0 {
        v = 1 << LINE_GRID_HEIGHT_REDUCTION;
    }
    let (x, y) = (outline.x as i32, outline.y as i32);
    let (w, ht) = (outline.width as i32, outline.height as i32);

    let left = ((x - h) >> LINE_GRID_WIDTH_REDUCTION).max(0) as usize;
    let right = (((x + w + h) >> LINE_GRID_WIDTH_REDUCTION) as usize).min(LINE_GRID_WIDTH - 1);
    let top = ((y - v) >> LINE_GRID_HEIGHT_REDUCTION).max(0) as usize;
    let bottom = (((y + ht + v) >> LINE_GRID_HEIGHT_REDUCTION) as usize).min(LINE_GRID_HEIGHT - 1);
    (left, top, right, bottom)
}

/// 条码跟踪代价: 码值不同为无穷大, 否则为中心距离平方
pub fn compare_barcodes(c0: &DecodedBarcode, c1: &DecodedBarcode) -> u32 {
    if c0.val != c1.val {
        return TR_MAXVAL;
    }
    let (x0, y0) = c0.outline.center();
    let (x1, y1) = c1.outline.center();
    let (dx, dy) = (x0 - x1, y0 - y1);
    (dx * dx + dy * dy) as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::grid::LINE_NODE_FLAG_HLINE;

    fn word(pos: u16, negative: bool) -> u16 {
        crate::event::ScanEvent::edge(pos, negative).to_edge_word()
    }

    /// 码值 10 的一行边沿: 窄窄 宽 宽 宽
    fn code10_row(shift: u16) -> Vec<u16> {
        [
            (100, true),
            (104, false),
            (108, true),
            (112, false),
            (124, true),
            (136, false),
            (148, true),
            (152, false),
            (156, true),
            (200, false),
        ]
        .iter()
        .map(|&(p, n)| word(p + shift, n))
        .collect()
    }

    #[test]
    fn test_detect_and_decode_value() {
        let edges = code10_row(0);
        let candidate = detect_code(&edges, None, 10).unwrap();
        assert_eq!(candidate.modules.len(), 8);
        assert_eq!(candidate.width, 56);
        assert_eq!(candidate.p0, Point16 { x: 100, y: 10 });
        assert_eq!(decode(&candidate.modules), Ok(10));

        let mut det = BarcodeDetector::new();
        det.detect_codes(10, &edges);
        assert_eq!(det.candidates().len(), 1);
        assert_eq!(det.candidates()[0].val, 10);
    }

    #[test]
    fn test_ratio_rejection() {
        let mut edges = code10_row(0);
        edges[2] = word(105, true);
        let candidate = detect_code(&edges, None, 10).unwrap();
        assert_eq!(decode(&candidate.modules), Err(DecodeError::Ratio));

        let mut det = BarcodeDetector::new();
        det.detect_codes(10, &edges);
        assert!(det.candidates().is_empty());
    }

    #[test]
    fn test_decode_errors() {
        let narrow = |negative| Module { width: 4, negative };
        // 全部为窄模块: 只能凑出 3 位
        let modules: Vec<Module> = (0..8).map(|i| narrow(i & 1 == 1)).collect();
        assert_eq!(decode(&modules), Err(DecodeError::Incomplete));
        // 极性交替被打乱
        let mut bad = modules.clone();
        bad[1].negative = false;
        assert_eq!(decode_with(&bad, 8), Err(DecodeError::Polarity));
    }

    #[test]
    fn test_quiet_period_required() {
        let mut edges = vec![word(98, false)];
        edges.extend(code10_row(0));
        let mut det = BarcodeDetector::new();
        det.detect_codes(10, &edges);
        assert!(det.candidates().is_empty());

        // 静默区足够
        let mut edges = vec![word(60, false)];
        edges.extend(code10_row(0));
        det.detect_codes(10, &edges);
        assert_eq!(det.candidates().len(), 1);
    }

    #[test]
    fn test_cluster_and_vote() {
        let mut det = BarcodeDetector::new();
        for row in 10..=14 {
            det.detect_codes(row, &code10_row(0));
        }
        let decoded = det.cluster_codes(4, 225).to_vec();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].val, 10);
        assert_eq!(
            decoded[0].outline,
            Rect {
                x: 104,
                y: 10,
                width: 57,
                height: 5
            }
        );
    }

    #[test]
    fn test_single_row_is_not_enough() {
        let mut det = BarcodeDetector::new();
        det.detect_codes(10, &code10_row(0));
        assert!(det.cluster_codes(4, 225).is_empty());
    }

    #[test]
    fn test_separate_clusters() {
        let mut det = BarcodeDetector::new();
        for row in 10..=12 {
            det.detect_codes(row, &code10_row(0));
            det.detect_codes(row, &code10_row(300));
        }
        let decoded = det.cluster_codes(4, 225);
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].outline.x, 404);
    }

    #[test]
    fn test_clear_grid_rect() {
        let outline = Rect {
            x: 104,
            y: 10,
            width: 57,
            height: 5,
        };
        assert_eq!(grid_rect(&outline), (12, 4, 21, 8));

        let mut det = BarcodeDetector::new();
        for row in 10..=14 {
            det.detect_codes(row, &code10_row(0));
        }
        det.cluster_codes(4, 225);
        let mut grid = LineGrid::new();
        for y in 0..12 {
            for x in 10..24 {
                grid.set_flag(x, y, LINE_NODE_FLAG_HLINE);
            }
        }
        det.clear_grid(&mut grid);
        // 向上延伸到第 0 行
        assert_eq!(grid.node(12, 0), 0);
        assert_eq!(grid.node(21, 8), 0);
        assert_ne!(grid.node(22, 8), 0);
        assert_ne!(grid.node(15, 9), 0);
    }

    #[test]
    fn test_compare_barcodes() {
        let a = DecodedBarcode {
            outline: Rect {
                x: 100,
                y: 10,
                width: 40,
                height: 6,
            },
            val: 3,
        };
        let mut b = a;
        b.outline.x += 3;
        b.outline.y += 4;
        assert_eq!(compare_barcodes(&a, &b), 25);
        b.val = 4;
        assert_eq!(compare_barcodes(&a, &b), TR_MAXVAL);
    }
}
