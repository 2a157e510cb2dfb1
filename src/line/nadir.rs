//! 交点候选 (nadir) 与交叉点构建
//! Nadir discovery, reduction and intersection formation with line splitting

use log::trace;

use crate::line::graph::{End, IntersectionId, LineGraph, LINE_MAX_INTERSECTION_LINES, LINE_MAX_LINES};
use crate::line::grid::{LineGrid, LINE_GRID_HEIGHT, LINE_GRID_WIDTH};
use crate::types::Point;

/// 交点候选: 来自不同线的相近点
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Nadir {
    pub points: Vec<Point>,
    pub pavg: Point,
    pub dist: u32,
}

impl Nadir {
    fn pair(p0: Point, p1: Point, dist: u32) -> Self {
        Self {
            points: vec![p0, p1],
            pavg: p0.avg(&p1),
            dist,
        }
    }

    /// 合并另一个候选, 按线编号去重, 最多 8 个点
    pub fn merge(&mut self, other: &Nadir, grid: &LineGrid) {
        for p in &other.points {
            if self.points.len() >= LINE_MAX_INTERSECTION_LINES {
                break;
            }
            let label = grid.line_at(p);
            if !self.points.iter().any(|q| grid.line_at(q) == label) {
                self.points.push(*p);
            }
        }

        let n = self.points.len() as u32;
        let (sx, sy) = self
            .points
            .iter()
            .fold((0u32, 0u32), |(sx, sy), p| (sx + p.x as u32, sy + p.y as u32));
        self.pavg = Point::new(((sx + (n >> 1)) / n) as u8, ((sy + (n >> 1)) / n) as u8);
    }
}

/// 记录一对来自不同线的点; 同一对线已存在时保留更近的一对
pub fn add_nadir(nadirs: &mut Vec<Nadir>, grid: &LineGrid, p0: Point, p1: Point) {
    let dist = p0.dist2(&p1);
    let l0 = grid.line_at(&p0);
    let l1 = grid.line_at(&p1);
    if l0 == l1 {
        return;
    }
    // 小编号在前
    let (pp0, pp1, l0, l1) = if l0 < l1 { (p0, p1, l0, l1) } else { (p1, p0, l1, l0) };

    if let Some(n) = nadirs
        .iter_mut()
        .find(|n| grid.line_at(&n.points[0]) == l0 && grid.line_at(&n.points[1]) == l1)
    {
        if dist < n.dist {
            *n = Nadir::pair(pp0, pp1, dist);
        }
        return;
    }
    nadirs.push(Nadir::pair(pp0, pp1, dist));
}

/// 从端点出发沿四个方向在半径内查找其他线的节点
pub fn search(nadirs: &mut Vec<Nadir>, grid: &LineGrid, p: Point, radius: u8) {
    let label = grid.line_at(&p);
    let (x, y) = (p.x as usize, p.y as usize);
    let r = radius as usize;

    let mut visit = |q: Point| {
        let other = grid.line_at(&q);
        if other != 0 && other != label {
            add_nadir(nadirs, grid, p, q);
        }
    };

    // 上
    for yy in (y.saturating_sub(r)..y).rev() {
        visit(Point::new(p.x, yy as u8));
    }
    // 下
    for yy in y + 1..(y + r).min(LINE_GRID_HEIGHT) {
        visit(Point::new(p.x, yy as u8));
    }
    // 左
    for xx in (x.saturating_sub(r)..x).rev() {
        visit(Point::new(xx as u8, p.y));
    }
    // 右
    for xx in x + 1..(x + r).min(LINE_GRID_WIDTH) {
        visit(Point::new(xx as u8, p.y));
    }
}

/// 端点两两比较 + 网格搜索
pub fn find_nadirs(grid: &LineGrid, endpoints: &[Point], max_merge_dist: u8) -> Vec<Nadir> {
    let mut nadirs = Vec::new();
    let max_dist2 = max_merge_dist as u32 * max_merge_dist as u32;

    for (i, pi) in endpoints.iter().enumerate() {
        let li = grid.line_at(pi);
        for pj in &endpoints[i + 1..] {
            if li == grid.line_at(pj) {
                continue;
            }
            if pi.dist2(pj) <= max_dist2 {
                add_nadir(&mut nadirs, grid, *pi, *pj);
            }
        }
    }

    for p in endpoints {
        search(&mut nadirs, grid, *p, max_merge_dist);
    }
    nadirs
}

/// 合并相近的候选直到不再变化
pub fn reduce_nadirs(nadirs: &mut Vec<Nadir>, grid: &LineGrid, max_merge_dist: u8) {
    let max_dist2 = (max_merge_dist as u32 * max_merge_dist as u32 * 12) >> 3; // ×1.5

    loop {
        let mut merged = 0;
        let mut i = 0;
        while i < nadirs.len() {
            let mut j = i + 1;
            while j < nadirs.len() {
                if nadirs[i].pavg.dist2(&nadirs[j].pavg) < max_dist2 {
                    let other = nadirs.remove(j);
                    nadirs[i].merge(&other, grid);
                    merged += 1;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        if merged == 0 {
            break;
        }
    }
}

#[inline]
fn sign(v: i32) -> i32 {
    if v >= 0 {
        1
    } else {
        -1
    }
}

/// 在交叉点处把线 `label` 拆成两条
///
/// 原线保留 p0 一侧, 新线从交叉点到原 p1。尚未处理的候选中位于新线一侧的点改标为新线编号。
pub fn break_line(
    graph: &mut LineGraph,
    grid: &mut LineGrid,
    pending: &[Nadir],
    label: u8,
    inter: IntersectionId,
) -> bool {
    let Some(l0) = graph.line_by_index(label) else {
        return false;
    };
    let Some((ip, count)) = graph.intersection(inter).map(|i| (i.p, i.lines.len())) else {
        return false;
    };
    let Some(line0) = graph.line(l0) else {
        return false;
    };
    if graph.next_index() as usize >= LINE_MAX_LINES
        || count > LINE_MAX_INTERSECTION_LINES - 2
        || line0.p0 == line0.p1
    {
        return false;
    }
    let (p00, p01) = (line0.p0, line0.p1);

    let Some(l1) = graph.add_split_line(ip, p01) else {
        return false;
    };
    if let Some(line0) = graph.line_mut(l0) {
        line0.p1 = ip;
    }
    graph.attach(inter, l0, End::P1);
    graph.attach(inter, l1, End::P0);
    let new_label = graph.line(l1).map(|l| l.index).unwrap_or(0);
    trace!("✂️  拆分线 {} → {} @ ({}, {})", label, new_label, ip.x, ip.y);

    // 原 p1 端的交叉点改为指向新线
    graph.redirect_far_end(l0, l1, p01, inter);

    // 后续候选中落在新线上的点
    let horiz = (p00.x as i32 - p01.x as i32).abs() > (p00.y as i32 - p01.y as i32).abs();
    for nadir in pending {
        for pt in &nadir.points {
            if grid.line_at(pt) != label {
                continue;
            }
            let same_side = if horiz {
                sign(pt.x as i32 - ip.x as i32) == sign(p01.x as i32 - ip.x as i32)
            } else {
                sign(pt.y as i32 - ip.y as i32) == sign(p01.y as i32 - ip.y as i32)
            };
            if same_side {
                grid.set_line(pt, new_label);
            }
        }
    }
    true
}

/// 每个候选生成一个交叉点: 端点延伸到交叉点, 非端点则拆线
pub fn form_intersections(graph: &mut LineGraph, grid: &mut LineGrid, nadirs: &[Nadir]) {
    for (k, nadir) in nadirs.iter().enumerate() {
        let inter = graph.add_intersection(nadir.pavg);
        for pt in &nadir.points {
            let full = graph
                .intersection(inter)
                .map_or(true, |i| i.lines.len() >= LINE_MAX_INTERSECTION_LINES);
            if full {
                break;
            }
            let label = grid.line_at(pt);
            if label == 0 {
                continue;
            }
            let Some(lid) = graph.line_by_index(label) else {
                continue;
            };
            let Some(line) = graph.line(lid) else {
                continue;
            };

            let end = if *pt == line.p0 {
                Some(End::P0)
            } else if *pt == line.p1 {
                Some(End::P1)
            } else {
                None
            };

            match end {
                Some(end) => {
                    // 延伸到交叉点, 从旧交叉点摘除
                    let old = line.intersection(end);
                    if let Some(line) = graph.line_mut(lid) {
                        line.set_point(end, nadir.pavg);
                    }
                    if let Some(old) = old {
                        graph.detach(lid, old);
                    }
                    graph.attach(inter, lid, end);
                }
                None => {
                    break_line(graph, grid, &nadirs[k + 1..], label, inter);
                }
            }
        }
    }
}
