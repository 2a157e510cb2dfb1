//! 交叉点清理
//! Removes short and redundant lines, folds degree 0/1/2 intersections

use log::warn;

use crate::line::geometry::{tan_diff_abs1000, MAX_EQUIV_TAN};
use crate::line::graph::{End, IntersectionId, Line, LineGraph, LineId};
use crate::line::grid::{LINE_GRID_HEIGHT, LINE_GRID_WIDTH};
use crate::types::Point;

/// 清理循环的最大轮数
pub const MAX_CLEAN_PASSES: u32 = 16;

fn lines_of(graph: &LineGraph, inter: IntersectionId) -> Vec<LineId> {
    graph
        .intersection(inter)
        .map(|i| i.lines.clone())
        .unwrap_or_default()
}

/// 删除交叉点上一端悬空的短线, 每次删除最短的一条
pub fn remove_short_lines(graph: &mut LineGraph, min_len2: u32) -> u32 {
    let mut removed = 0;
    for inter in graph.intersection_ids() {
        loop {
            let shortest = lines_of(graph, inter)
                .into_iter()
                .filter_map(|id| graph.line(id).map(|l| (id, l.length2(), l.has_free_end())))
                .fold(None, |best: Option<(LineId, u32, bool)>, cur| match best {
                    Some(b) if b.1 <= cur.1 => Some(b),
                    _ => Some(cur),
                });
            match shortest {
                Some((id, len, true)) if len < min_len2 => {
                    graph.remove_line(id);
                    removed += 1;
                }
                _ => break,
            }
        }
    }
    removed
}

fn equivalent_lines(a: &Line, b: &Line) -> bool {
    (a.p0 == b.p0 && a.p1 == b.p1) || (a.p0 == b.p1 && a.p1 == b.p0)
}

/// 两条线在交叉点 `p` 处的夹角足够小
fn min_angle_lines(a: &Line, b: &Line, p: &Point) -> bool {
    let a1 = if *p == a.p0 { a.p1 } else { a.p0 };
    let b1 = if *p == b.p0 { b.p1 } else { b.p0 };
    tan_diff_abs1000(p, &a1, p, &b1, false) <= *MAX_EQUIV_TAN
}

/// 删除同一交叉点上重合或几乎同向的线
///
/// 同向时优先删除较短且一端悬空的线; 两端都已连接的线不删。
pub fn remove_redundant_lines(graph: &mut LineGraph) -> u32 {
    let mut removed = 0;
    for inter in graph.intersection_ids() {
        let Some(p) = graph.intersection(inter).map(|i| i.p) else {
            continue;
        };
        let mut i = 0;
        while i < lines_of(graph, inter).len() {
            let mut restart = false;
            let mut j = i + 1;
            loop {
                let lines = lines_of(graph, inter);
                if j >= lines.len() {
                    break;
                }
                let (li, lj) = (lines[i], lines[j]);
                let (Some(a), Some(b)) = (graph.line(li).cloned(), graph.line(lj).cloned()) else {
                    j += 1;
                    continue;
                };

                if equivalent_lines(&a, &b) {
                    graph.remove_line(lj);
                    removed += 1;
                    continue;
                }
                if min_angle_lines(&a, &b, &p) {
                    let (first, second) = if a.length2() > b.length2() {
                        ((lj, b.has_free_end()), (li, a.has_free_end()))
                    } else {
                        ((li, a.has_free_end()), (lj, b.has_free_end()))
                    };
                    let victim = if first.1 {
                        Some(first.0)
                    } else if second.1 {
                        Some(second.0)
                    } else {
                        None
                    };
                    if let Some(victim) = victim {
                        graph.remove_line(victim);
                        removed += 1;
                        if victim == li {
                            // 第 i 条被删, 从同一位置重新开始
                            restart = true;
                            break;
                        }
                        continue;
                    }
                }
                j += 1;
            }
            if !restart {
                i += 1;
            }
        }
    }
    removed
}

/// 处理只有 0/1/2 条线的交叉点
///
/// 两条线的交叉点 (靠近边界的除外) 把两条线合成一条。
pub fn simplify_intersections(graph: &mut LineGraph, min_len: u8) -> u32 {
    let min_len = min_len as i32;
    let mut n = 0;
    for inter in graph.intersection_ids() {
        let Some((p, lines)) = graph.intersection(inter).map(|i| (i.p, i.lines.clone())) else {
            continue;
        };
        match lines.len() {
            0 => {
                graph.remove_intersection(inter);
                n += 1;
            }
            1 => {
                if let Some(line) = graph.line_mut(lines[0]) {
                    if line.i0 == Some(inter) {
                        line.i0 = None;
                    }
                    if line.i1 == Some(inter) {
                        line.i1 = None;
                    }
                }
                graph.remove_intersection(inter);
                n += 1;
            }
            2 if (p.x as i32) > min_len
                && (p.x as i32) < LINE_GRID_WIDTH as i32 - min_len
                && (p.y as i32) > min_len
                && (p.y as i32) < LINE_GRID_HEIGHT as i32 - min_len =>
            {
                let (l0, l1) = (lines[0], lines[1]);
                let (Some(line0), Some(line1)) = (graph.line(l0).cloned(), graph.line(l1).cloned()) else {
                    continue;
                };
                graph.remove_intersection(inter);

                let e0 = if line0.i0 == Some(inter) {
                    End::P0
                } else {
                    End::P1
                };
                let far1 = if line1.i0 == Some(inter) {
                    End::P1
                } else {
                    End::P0
                };
                let far_inter = line1.intersection(far1);

                if far_inter.is_some() && line0.intersection(e0.other()) == far_inter {
                    // 合并后两端会落在同一个交叉点上
                    if let Some(line) = graph.line_mut(l0) {
                        line.set_intersection(e0, None);
                    }
                    graph.remove_line(l1);
                } else {
                    if let Some(line) = graph.line_mut(l0) {
                        line.set_point(e0, line1.point(far1));
                        line.set_intersection(e0, far_inter);
                    }
                    graph.replace_line(l0, l1);
                }
                n += 1;
            }
            _ => {}
        }
    }
    n
}

/// 反复清理直到没有变化
pub fn clean_intersections(graph: &mut LineGraph, min_len: u8) -> u32 {
    let min_len2 = min_len as u32 * min_len as u32;
    let mut passes = 0;
    loop {
        let n = remove_short_lines(graph, min_len2)
            + remove_redundant_lines(graph)
            + simplify_intersections(graph, min_len);
        passes += 1;
        if n == 0 {
            break;
        }
        if passes >= MAX_CLEAN_PASSES {
            warn!("⚠️  交叉点清理未收敛 ({} 轮)", passes);
            break;
        }
    }
    passes
}

/// 删除两端都未连接的短线
pub fn remove_min_lines(graph: &mut LineGraph, min_len2: u32) -> u32 {
    let mut removed = 0;
    for id in graph.line_ids() {
        let short = graph
            .line(id)
            .is_some_and(|l| l.length2() < min_len2 && l.i0.is_none() && l.i1.is_none());
        if short {
            graph.remove_line(id);
            removed += 1;
        }
    }
    removed
}
