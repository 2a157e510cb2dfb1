//! 线段提取
//! Walks flagged grid cells bottom-up, fits short segments and closes lines at kinks

use crate::line::geometry::{line_seg_error, tan_diff_abs1000, MAX_SEG_TAN};
use crate::line::graph::{LineGraph, LINE_MAX_LINES};
use crate::line::grid::{LineGrid, LINE_GRID_HEIGHT, LINE_GRID_WIDTH, LINE_NODE_FLAG_NULL};
use crate::types::Point;

/// 每帧拟合段上限
pub const LINE_MAX_SEGMENTS: usize = 0x100;
/// 每段点数
pub const LINE_POINTS_PER_SEG: usize = 12;
/// 拟合误差阈值
pub const LINE_MAX_SEG_ERROR: f32 = 0.9;

// 行进方向的候选偏移, 按优先级排列
const STEP_UP: [(i32, i32); 3] = [(0, -1), (-1, -1), (1, -1)];
const STEP_LEFT: [(i32, i32); 3] = [(-1, 0), (-1, -1), (-1, 1)];
const STEP_RIGHT: [(i32, i32); 3] = [(1, 0), (1, -1), (1, 1)];

/// 拟合段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineSeg {
    pub p0: Point,
    pub p1: Point,
    pub ls0: Option<usize>, // 前一段
    pub ls1: Option<usize>, // 后一段
    pub line: u8,           // 所属线编号
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Heading {
    Up,
    Left,
    Right,
}

/// 在网格上按方向走一步, 成功则把新点置为已访问并记录
fn step(grid: &mut LineGrid, p: &mut Point, ps: &mut Vec<Point>, dirs: &[(i32, i32)]) -> bool {
    for (dx, dy) in dirs {
        let x = p.x as i32 + dx;
        let y = p.y as i32 + dy;
        if !LineGrid::in_bounds(x, y) || !grid.is_free(x as usize, y as usize) {
            continue;
        }
        grid.set_flag(x as usize, y as usize, LINE_NODE_FLAG_NULL);
        *p = Point::new(x as u8, y as u8);
        ps.push(*p);
        return true;
    }
    false
}

/// 给点列打上线编号, 并把点列两侧 2 格内的节点置为已访问
///
/// 最后一个点两侧不清理, 便于下一段从这里接续。
pub fn clean_grid(grid: &mut LineGrid, index: u8, ps: &[Point]) {
    if index as usize >= LINE_MAX_LINES || ps.is_empty() {
        return;
    }
    let first = ps[0];
    let last = ps[ps.len() - 1];
    let xd = last.x as i32 - first.x as i32;
    let yd = last.y as i32 - first.y as i32;
    let vertical = yd.abs() > xd.abs();

    for p in &ps[..ps.len() - 1] {
        grid.set_line(p, index);
        for d in [-2i32, -1, 1, 2] {
            let (x, y) = if vertical {
                (p.x as i32 + d, p.y as i32)
            } else {
                (p.x as i32, p.y as i32 + d)
            };
            if LineGrid::in_bounds(x, y) {
                grid.set_flag(x as usize, y as usize, LINE_NODE_FLAG_NULL);
            }
        }
    }
    grid.set_line(&last, index);
}

/// 线段提取器, 持有本帧的拟合段
pub struct SegmentExtractor {
    segs: Vec<LineSeg>,
    truncated: u32,
}

impl Default for SegmentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SegmentExtractor {
    pub fn new() -> Self {
        Self {
            segs: Vec::with_capacity(LINE_MAX_SEGMENTS),
            truncated: 0,
        }
    }

    pub fn clear(&mut self) {
        self.segs.clear();
        self.truncated = 0;
    }

    pub fn segments(&self) -> &[LineSeg] {
        &self.segs
    }

    /// 因容量不足被丢弃的拟合次数
    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    fn push_seg(&mut self, seg: LineSeg) -> usize {
        self.segs.push(seg);
        self.segs.len() - 1
    }

    /// 拟合当前点列, 必要时在最大残差处拆成两段并结束当前线
    fn finish_grid_node(
        &mut self,
        grid: &mut LineGrid,
        graph: &mut LineGraph,
        ps: &[Point],
        prev: Option<usize>,
        p0: &mut Point,
    ) -> Option<usize> {
        if ps.is_empty() {
            return prev;
        }
        if self.segs.len() >= LINE_MAX_SEGMENTS - 1 || graph.next_index() as usize >= LINE_MAX_LINES - 1 {
            self.truncated += 1;
            return prev;
        }

        let n = ps.len();
        let (error, max_index) = line_seg_error(ps);
        if error < LINE_MAX_SEG_ERROR || n <= 5 || max_index + 1 >= n {
            let index = graph.next_index();
            clean_grid(grid, index, ps);
            self.push_seg(LineSeg {
                p0: ps[0],
                p1: ps[n - 1],
                ls0: prev,
                ls1: None,
                line: index,
            });
        } else {
            // 拆分
            let index = graph.next_index();
            clean_grid(grid, index, &ps[..=max_index]);
            let first = self.push_seg(LineSeg {
                p0: ps[0],
                p1: ps[max_index],
                ls0: prev,
                ls1: Some(self.segs.len() + 1),
                line: index,
            });

            graph.add_line(*p0, ps[max_index + 1]);
            *p0 = ps[max_index + 1];

            let index = graph.next_index();
            self.push_seg(LineSeg {
                p0: ps[max_index],
                p1: ps[n - 1],
                ls0: Some(first),
                ls1: None,
                line: index,
            });
            clean_grid(grid, index, &ps[max_index + 1..]);
        }
        Some(self.segs.len() - 1)
    }

    /// 从一个未访问节点出发走完一条线
    pub fn extract_from(&mut self, grid: &mut LineGrid, graph: &mut LineGraph, start: Point) {
        let mut ps: Vec<Point> = Vec::with_capacity(LINE_POINTS_PER_SEG);
        let mut heading = Heading::Up;
        let mut prev: Option<usize> = None;
        let mut p = start; // 当前点
        let mut p0 = start; // 当前线起点

        grid.set_flag(p.x as usize, p.y as usize, LINE_NODE_FLAG_NULL);
        ps.push(p);

        loop {
            let moved = match heading {
                Heading::Up => {
                    if step(grid, &mut p, &mut ps, &STEP_UP) {
                        true
                    } else if step(grid, &mut p, &mut ps, &STEP_LEFT) {
                        heading = Heading::Left;
                        true
                    } else if step(grid, &mut p, &mut ps, &STEP_RIGHT) {
                        heading = Heading::Right;
                        true
                    } else {
                        false
                    }
                }
                Heading::Left | Heading::Right => {
                    let side = if heading == Heading::Left { &STEP_LEFT } else { &STEP_RIGHT };
                    if step(grid, &mut p, &mut ps, side) {
                        true
                    } else if step(grid, &mut p, &mut ps, &STEP_UP) {
                        heading = Heading::Up;
                        true
                    } else {
                        false
                    }
                }
            };
            if !moved {
                break;
            }

            if ps.len() >= LINE_POINTS_PER_SEG {
                let this = self.finish_grid_node(grid, graph, &ps, prev, &mut p0);
                if let (Some(prev_seg), Some(this_seg)) = (prev, this) {
                    if this_seg != prev_seg {
                        // 拆分时与前半段比较
                        let cmp = if this_seg - prev_seg > 1 { this_seg - 1 } else { this_seg };
                        self.segs[prev_seg].ls1 = Some(cmp);
                        let a = self.segs[prev_seg];
                        let b = self.segs[cmp];
                        let angle = tan_diff_abs1000(&a.p0, &a.p1, &b.p0, &b.p1, false);
                        if angle > *MAX_SEG_TAN {
                            // 拐点: 结束当前线, 本段归入新线
                            graph.add_line(p0, a.p1);
                            let index = graph.next_index();
                            if (index as usize) < LINE_MAX_LINES {
                                self.segs[this_seg].line = index;
                                clean_grid(grid, index, &ps);
                            }
                            p0 = ps[0];
                        }
                    }
                }
                prev = this;
                ps.clear();
            }
        }

        // 已有前段, 或剩余点数足够时收尾
        if prev.is_some() || ps.len() > 2 {
            let this = self.finish_grid_node(grid, graph, &ps, prev, &mut p0);
            if let (Some(prev_seg), Some(this_seg)) = (prev, this) {
                if this_seg != prev_seg {
                    self.segs[prev_seg].ls1 = Some(this_seg);
                }
            }
            prev = this;
        }

        if let Some(last) = prev {
            graph.add_line(p0, self.segs[last].p1);
        }
    }

    /// 自下而上、从左到右扫描整个网格
    pub fn extract_all(&mut self, grid: &mut LineGrid, graph: &mut LineGraph) {
        for y in (0..LINE_GRID_HEIGHT).rev() {
            for x in 0..LINE_GRID_WIDTH {
                if grid.is_free(x, y) {
                    self.extract_from(grid, graph, Point::new(x as u8, y as u8));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::grid::LINE_NODE_FLAG_HLINE;

    fn flag(grid: &mut LineGrid, x: usize, y: usize) {
        grid.set_flag(x, y, LINE_NODE_FLAG_HLINE);
    }

    #[test]
    fn test_vertical_line_single_segment_chain() {
        let mut grid = LineGrid::new();
        let mut graph = LineGraph::new();
        let mut ex = SegmentExtractor::new();
        for y in 4..=47 {
            flag(&mut grid, 39, y);
        }
        ex.extract_all(&mut grid, &mut graph);

        assert_eq!(graph.num_lines(), 1);
        let (_, line) = graph.lines().next().unwrap();
        assert_eq!(line.index, 1);
        assert_eq!(line.p0, Point::new(39, 47));
        assert_eq!(line.p1, Point::new(39, 4));

        // 44 个点: 12 + 12 + 12 + 8
        assert_eq!(ex.segments().len(), 4);
        assert_eq!(ex.segments()[0].ls1, Some(1));
        assert_eq!(ex.segments()[3].ls0, Some(2));
        assert_eq!(grid.line_at(&Point::new(39, 20)), 1);
        assert_eq!(graph.endpoints(), &[Point::new(39, 47), Point::new(39, 4)]);
    }

    #[test]
    fn test_corner_closes_line() {
        let mut grid = LineGrid::new();
        let mut graph = LineGraph::new();
        let mut ex = SegmentExtractor::new();
        for y in 24..=47 {
            flag(&mut grid, 20, y);
        }
        for x in 21..=44 {
            flag(&mut grid, x, 24);
        }
        ex.extract_all(&mut grid, &mut graph);

        let lines: Vec<_> = graph.lines().map(|(_, l)| (l.index, l.p0, l.p1)).collect();
        assert_eq!(
            lines,
            vec![
                (1, Point::new(20, 47), Point::new(20, 24)),
                (2, Point::new(21, 24), Point::new(44, 24)),
            ]
        );
        assert_eq!(grid.line_at(&Point::new(20, 30)), 1);
        assert_eq!(grid.line_at(&Point::new(30, 24)), 2);
    }

    #[test]
    fn test_short_fragment_ignored() {
        let mut grid = LineGrid::new();
        let mut graph = LineGraph::new();
        let mut ex = SegmentExtractor::new();
        flag(&mut grid, 5, 5);
        flag(&mut grid, 5, 4);
        ex.extract_all(&mut grid, &mut graph);
        assert_eq!(graph.num_lines(), 0);
        assert!(!grid.is_free(5, 5));
    }

    #[test]
    fn test_clean_grid_nulls_neighbours() {
        let mut grid = LineGrid::new();
        let ps: Vec<Point> = (10..15).map(|y| Point::new(30, y)).collect();
        for x in 28..=32 {
            flag(&mut grid, x, 10);
        }
        clean_grid(&mut grid, 3, &ps);
        assert_eq!(grid.line_at(&Point::new(30, 14)), 3);
        assert!(!grid.is_free(28, 10));
        assert!(!grid.is_free(32, 10));
        // 超出编号范围不写入
        clean_grid(&mut grid, LINE_MAX_LINES as u8, &ps);
        assert_eq!(grid.line_at(&Point::new(30, 14)), 3);
    }
}
