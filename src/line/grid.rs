//! 线检测网格
//! Coarse line grid fed by horizontal and vertical edge pairs

use crate::event::{edge_is_negative, edge_position};
use crate::types::{Point, EDGE_FRAME_HEIGHT, EDGE_FRAME_WIDTH};

// ========== 网格尺寸 ==========

/// 水平方向缩减 (>> 3)
pub const LINE_GRID_WIDTH_REDUCTION: u16 = 3;
/// 垂直方向缩减 (>> 1)
pub const LINE_GRID_HEIGHT_REDUCTION: u16 = 1;
pub const LINE_GRID_WIDTH: usize = (EDGE_FRAME_WIDTH >> LINE_GRID_WIDTH_REDUCTION) as usize;
pub const LINE_GRID_HEIGHT: usize = (EDGE_FRAME_HEIGHT >> LINE_GRID_HEIGHT_REDUCTION) as usize;
/// 垂直扫描列数
pub const LINE_VSIZE: usize = (EDGE_FRAME_WIDTH / 4) as usize;

// ========== 节点标志 ==========

pub const LINE_NODE_LINE_MASK: u16 = 0x03ff;
pub const LINE_NODE_FLAG_HLINE: u16 = 0x0400;
pub const LINE_NODE_FLAG_VLINE: u16 = 0x0800;
/// 任一方向的线标志
pub const LINE_NODE_FLAG_1: u16 = LINE_NODE_FLAG_HLINE | LINE_NODE_FLAG_VLINE;
/// 已访问
pub const LINE_NODE_FLAG_NULL: u16 = 0x8000;

/// 边沿对 → 网格标志的参数
#[derive(Clone, Copy, Debug)]
pub struct EdgeParams {
    pub min_width: u16,
    pub max_width: u16,
    pub edge_dist: u16,
    pub white_line: bool,
}

impl EdgeParams {
    #[inline]
    fn width_ok(&self, width: u16) -> bool {
        self.min_width < width && width < self.max_width
    }
}

/// 79×52 线网格 + 垂直扫描状态
pub struct LineGrid {
    nodes: Vec<u16>,
    vstate: Vec<u8>, // 每列下降沿所在行 + 1, 0 表示空
}

impl Default for LineGrid {
    fn default() -> Self {
        Self::new()
    }
}

impl LineGrid {
    pub fn new() -> Self {
        Self {
            nodes: vec![0; LINE_GRID_WIDTH * LINE_GRID_HEIGHT],
            vstate: vec![0; LINE_VSIZE],
        }
    }

    /// 新的一帧
    pub fn clear(&mut self) {
        self.nodes.fill(0);
        self.vstate.fill(0);
    }

    #[inline]
    pub fn index(x: usize, y: usize) -> usize {
        LINE_GRID_WIDTH * y + x
    }

    #[inline]
    pub fn in_bounds(x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && (x as usize) < LINE_GRID_WIDTH && (y as usize) < LINE_GRID_HEIGHT
    }

    #[inline]
    pub fn node(&self, x: usize, y: usize) -> u16 {
        self.nodes[Self::index(x, y)]
    }

    #[inline]
    pub fn node_at(&self, p: &Point) -> u16 {
        self.node(p.x as usize, p.y as usize)
    }

    /// 节点所属的线编号 (0 表示无)
    #[inline]
    pub fn line_at(&self, p: &Point) -> u8 {
        (self.node_at(p) & LINE_NODE_LINE_MASK) as u8
    }

    pub fn set_line(&mut self, p: &Point, index: u8) {
        let node = &mut self.nodes[Self::index(p.x as usize, p.y as usize)];
        *node = (*node & !LINE_NODE_LINE_MASK) | index as u16;
    }

    pub fn set_flag(&mut self, x: usize, y: usize, flag: u16) {
        self.nodes[Self::index(x, y)] |= flag;
    }

    /// 有线标志且未被访问
    #[inline]
    pub fn is_free(&self, x: usize, y: usize) -> bool {
        let node = self.node(x, y);
        node & LINE_NODE_FLAG_1 != 0 && node & LINE_NODE_FLAG_NULL == 0
    }

    fn flag_checked(&mut self, x: u16, y: u16, flag: u16) {
        if Self::in_bounds(x as i32, y as i32) {
            self.set_flag(x as usize, y as usize, flag);
        }
    }

    /// 水平扫描行: 相邻边沿对 (黑线为下降→上升, 白线相反)
    pub fn h_line(&mut self, row: u8, edges: &[u16], params: &EdgeParams) {
        for pair in edges.windows(2) {
            let neg0 = edge_is_negative(pair[0]);
            let neg1 = edge_is_negative(pair[1]);
            let opens = if params.white_line {
                !neg0 && neg1
            } else {
                neg0 && !neg1
            };
            if !opens {
                continue;
            }
            let col0 = edge_position(pair[0]);
            let col1 = edge_position(pair[1]);
            let width = col1.wrapping_sub(col0);
            if params.width_ok(width) {
                let x = (((col0 + col1) >> 1) + params.edge_dist) >> LINE_GRID_WIDTH_REDUCTION;
                self.flag_checked(x, row as u16 >> LINE_GRID_HEIGHT_REDUCTION, LINE_NODE_FLAG_HLINE);
            }
        }
    }

    /// 垂直扫描行: 每列记录开口行, 遇到闭合边沿时按宽度置标志
    pub fn v_line(&mut self, row: u8, edges: &[u16], params: &EdgeParams) {
        for &word in edges {
            let col = (edge_position(word) >> 2) as usize;
            if col >= LINE_VSIZE {
                continue;
            }
            let opens = edge_is_negative(word) != params.white_line;
            if opens {
                self.vstate[col] = row.saturating_add(1);
            } else if self.vstate[col] != 0 {
                let start = self.vstate[col] - 1;
                let width = (row.saturating_sub(start) as u16) << 2; // 垂直方向 4 倍下采样
                if params.width_ok(width) {
                    let y = (row as u16).saturating_sub(width >> 3) >> LINE_GRID_HEIGHT_REDUCTION;
                    self.flag_checked((col >> 1) as u16, y, LINE_NODE_FLAG_VLINE);
                }
                self.vstate[col] = 0;
            }
        }
    }

    /// 清零矩形 (含边界), 并向上延伸 4 倍高度
    pub fn clear_rect(&mut self, left: usize, top: usize, right: usize, bottom: usize) {
        let right = right.min(LINE_GRID_WIDTH - 1);
        let bottom = bottom.min(LINE_GRID_HEIGHT - 1);
        if left > right || top > bottom {
            return;
        }
        let height = (bottom - top) * 4;
        let r0 = top.saturating_sub(height);
        for y in r0..=bottom {
            let start = Self::index(left, y);
            self.nodes[start..=start + (right - left)].fill(0);
        }
    }

    /// 已置标志的节点数
    pub fn count_flags(&self, flag: u16) -> usize {
        self.nodes.iter().filter(|n| *n & flag != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ScanEvent;

    fn params(white_line: bool) -> EdgeParams {
        EdgeParams {
            min_width: 0,
            max_width: 100,
            edge_dist: 4,
            white_line,
        }
    }

    fn word(pos: u16, negative: bool) -> u16 {
        ScanEvent::edge(pos, negative).to_edge_word()
    }

    #[test]
    fn test_grid_dimensions() {
        assert_eq!(LINE_GRID_WIDTH, 79);
        assert_eq!(LINE_GRID_HEIGHT, 52);
        assert_eq!(LINE_VSIZE, 159);
    }

    #[test]
    fn test_h_line_dark_pair() {
        let mut grid = LineGrid::new();
        grid.h_line(20, &[word(300, true), word(316, false)], &params(false));
        // ((300+316)/2 + 4) >> 3 = 39, 20 >> 1 = 10
        assert!(grid.node(39, 10) & LINE_NODE_FLAG_HLINE != 0);
        assert_eq!(grid.count_flags(LINE_NODE_FLAG_1), 1);

        // 白线模式下同样的边沿不构成线
        let mut white = LineGrid::new();
        white.h_line(20, &[word(300, true), word(316, false)], &params(true));
        assert_eq!(white.count_flags(LINE_NODE_FLAG_1), 0);
    }

    #[test]
    fn test_h_line_width_limits() {
        let mut grid = LineGrid::new();
        grid.h_line(0, &[word(100, true), word(250, false)], &params(false));
        assert_eq!(grid.count_flags(LINE_NODE_FLAG_1), 0);
        // 超出网格右边界的标志被丢弃
        grid.h_line(0, &[word(630, true), word(635, false)], &params(false));
        assert_eq!(grid.count_flags(LINE_NODE_FLAG_1), 0);
    }

    #[test]
    fn test_v_line_pair_across_rows() {
        let mut grid = LineGrid::new();
        let p = params(false);
        // 第 10 列在第 20 行变暗, 第 25 行恢复: 宽度 (25-20)*4 = 20
        grid.v_line(20, &[word(10 << 2, true)], &p);
        grid.v_line(25, &[word(10 << 2, false)], &p);
        // y = (25 - (20 >> 3)) >> 1 = 11, x = 10 >> 1 = 5
        assert!(grid.node(5, 11) & LINE_NODE_FLAG_VLINE != 0);
        assert_eq!(grid.count_flags(LINE_NODE_FLAG_1), 1);

        // 状态已清除, 再次上升沿无效
        grid.v_line(30, &[word(10 << 2, false)], &p);
        assert_eq!(grid.count_flags(LINE_NODE_FLAG_1), 1);
    }

    #[test]
    fn test_line_labels_and_clear() {
        let mut grid = LineGrid::new();
        let p = Point::new(3, 4);
        grid.set_flag(3, 4, LINE_NODE_FLAG_HLINE);
        grid.set_line(&p, 7);
        assert_eq!(grid.line_at(&p), 7);
        assert!(grid.is_free(3, 4));
        grid.set_flag(3, 4, LINE_NODE_FLAG_NULL);
        assert!(!grid.is_free(3, 4));

        grid.clear_rect(2, 4, 5, 5);
        assert_eq!(grid.node(3, 4), 0);
        grid.set_flag(0, 0, LINE_NODE_FLAG_HLINE);
        grid.clear();
        assert_eq!(grid.count_flags(0xffff), 0);
    }
}
