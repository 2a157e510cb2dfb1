//! 线与交叉点拓扑图
//! Line/intersection graph held in two arenas with generation-checked handles

use log::warn;

use crate::types::Point;

/// 每帧线编号上限 (编号 0 表示空)
pub const LINE_MAX_LINES: usize = 0x80;
/// 每个交叉点最多连接的线数
pub const LINE_MAX_INTERSECTION_LINES: usize = 8;

// ========== 句柄与竞技场 ==========

/// 竞技场句柄: 槽位 + 代号, 跨帧或删除后失效
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    slot: u32,
    generation: u32,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// 只追加的竞技场, 遍历顺序即插入顺序
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    generation: u32,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            generation: 0,
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Handle {
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: self.generation,
            value: Some(value),
        });
        self.len += 1;
        Handle {
            slot,
            generation: self.generation,
        }
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self
            .slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)?;
        let value = slot.value.take();
        if value.is_some() {
            self.len -= 1;
        }
        value
    }

    /// 清空, 旧句柄全部失效
    pub fn clear(&mut self) {
        self.slots.clear();
        self.len = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        slot: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }
}

// ========== 线与交叉点 ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LineId(Handle);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IntersectionId(Handle);

/// 线的哪一端
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum End {
    P0,
    P1,
}

impl End {
    pub fn other(self) -> End {
        match self {
            End::P0 => End::P1,
            End::P1 => End::P0,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Line {
    pub p0: Point,
    pub p1: Point,
    pub index: u8,                      // 本帧编号, 与网格标签一致
    pub i0: Option<IntersectionId>,     // p0 端的交叉点
    pub i1: Option<IntersectionId>,     // p1 端的交叉点
    pub tracker: Option<u16>,           // 跟踪ID
}

impl Line {
    pub fn new(p0: Point, p1: Point, index: u8) -> Self {
        Self {
            p0,
            p1,
            index,
            i0: None,
            i1: None,
            tracker: None,
        }
    }

    pub fn length2(&self) -> u32 {
        self.p0.dist2(&self.p1)
    }

    pub fn point(&self, end: End) -> Point {
        match end {
            End::P0 => self.p0,
            End::P1 => self.p1,
        }
    }

    pub fn set_point(&mut self, end: End, p: Point) {
        match end {
            End::P0 => self.p0 = p,
            End::P1 => self.p1 = p,
        }
    }

    pub fn intersection(&self, end: End) -> Option<IntersectionId> {
        match end {
            End::P0 => self.i0,
            End::P1 => self.i1,
        }
    }

    pub fn set_intersection(&mut self, end: End, id: Option<IntersectionId>) {
        match end {
            End::P0 => self.i0 = id,
            End::P1 => self.i1 = id,
        }
    }

    /// 至少一端未连接
    pub fn has_free_end(&self) -> bool {
        self.i0.is_none() || self.i1.is_none()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Intersection {
    pub p: Point,
    pub lines: Vec<LineId>,
}

impl Intersection {
    pub fn new(p: Point) -> Self {
        Self {
            p,
            lines: Vec::with_capacity(LINE_MAX_INTERSECTION_LINES),
        }
    }
}

/// 拓扑一致性错误, 数字为检查项编号
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("线 {line} 的 {end:?} 端指向不存在的交叉点 (1/2)")]
    DanglingIntersection { line: u8, end: End },
    #[error("线 {line} 在 {end:?} 端交叉点中出现 {count} 次 (3/4)")]
    BackReference { line: u8, end: End, count: usize },
    #[error("交叉点 ({x}, {y}) 引用了不存在的线 (5)")]
    DanglingLine { x: u8, y: u8 },
    #[error("线 {line} 两端指向同一交叉点 (6)")]
    SameIntersection { line: u8 },
    #[error("线 {line} 没有指回交叉点 ({x}, {y}) (7)")]
    MissingBackPointer { line: u8, x: u8, y: u8 },
    #[error("线 {line} 的 {end:?} 端与交叉点位置不一致 (8/9)")]
    PointMismatch { line: u8, end: End },
    #[error("交叉点 ({x}, {y}) 重复引用线 {line} (10)")]
    DuplicateLine { x: u8, y: u8, line: u8 },
}

// ========== 拓扑图 ==========

/// 一帧的线拓扑
pub struct LineGraph {
    lines: Arena<Line>,
    intersections: Arena<Intersection>,
    by_index: Vec<Option<LineId>>, // 编号 → 线
    endpoints: Vec<Point>,         // 提取出的端点
    next_index: u8,
    truncated: u32,
}

impl Default for LineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl LineGraph {
    pub fn new() -> Self {
        Self {
            lines: Arena::new(),
            intersections: Arena::new(),
            by_index: vec![None; LINE_MAX_LINES],
            endpoints: Vec::new(),
            next_index: 1,
            truncated: 0,
        }
    }

    /// 新的一帧, 编号从 1 开始
    pub fn clear(&mut self) {
        self.lines.clear();
        self.intersections.clear();
        self.by_index.fill(None);
        self.endpoints.clear();
        self.next_index = 1;
        self.truncated = 0;
    }

    pub fn next_index(&self) -> u8 {
        self.next_index
    }

    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    fn insert_line(&mut self, p0: Point, p1: Point) -> Option<LineId> {
        if self.next_index as usize >= LINE_MAX_LINES {
            self.truncated += 1;
            return None;
        }
        let index = self.next_index;
        let id = LineId(self.lines.insert(Line::new(p0, p1, index)));
        self.by_index[index as usize] = Some(id);
        self.next_index += 1;
        Some(id)
    }

    /// 提取得到的线, 端点记入节点表
    pub fn add_line(&mut self, p0: Point, p1: Point) -> Option<LineId> {
        let id = self.insert_line(p0, p1)?;
        self.endpoints.push(p0);
        self.endpoints.push(p1);
        Some(id)
    }

    /// 拆分产生的线
    pub fn add_split_line(&mut self, p0: Point, p1: Point) -> Option<LineId> {
        self.insert_line(p0, p1)
    }

    pub fn add_intersection(&mut self, p: Point) -> IntersectionId {
        IntersectionId(self.intersections.insert(Intersection::new(p)))
    }

    pub fn endpoints(&self) -> &[Point] {
        &self.endpoints
    }

    pub fn line(&self, id: LineId) -> Option<&Line> {
        self.lines.get(id.0)
    }

    pub fn line_mut(&mut self, id: LineId) -> Option<&mut Line> {
        self.lines.get_mut(id.0)
    }

    pub fn intersection(&self, id: IntersectionId) -> Option<&Intersection> {
        self.intersections.get(id.0)
    }

    pub fn intersection_mut(&mut self, id: IntersectionId) -> Option<&mut Intersection> {
        self.intersections.get_mut(id.0)
    }

    /// 按编号查找 (拆分前的编号仍指向原线)
    pub fn line_by_index(&self, index: u8) -> Option<LineId> {
        self.by_index
            .get(index as usize)
            .copied()
            .flatten()
            .filter(|id| self.lines.contains(id.0))
    }

    /// 按跟踪ID查找本帧的线
    pub fn line_by_tracker(&self, tracker: u16) -> Option<(LineId, &Line)> {
        self.lines()
            .find(|(_, l)| l.tracker == Some(tracker))
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineId, &Line)> {
        self.lines.iter().map(|(h, l)| (LineId(h), l))
    }

    pub fn intersections(&self) -> impl Iterator<Item = (IntersectionId, &Intersection)> {
        self.intersections.iter().map(|(h, i)| (IntersectionId(h), i))
    }

    pub fn line_ids(&self) -> Vec<LineId> {
        self.lines.handles().into_iter().map(LineId).collect()
    }

    pub fn intersection_ids(&self) -> Vec<IntersectionId> {
        self.intersections
            .handles()
            .into_iter()
            .map(IntersectionId)
            .collect()
    }

    pub fn num_lines(&self) -> usize {
        self.lines.len()
    }

    pub fn num_intersections(&self) -> usize {
        self.intersections.len()
    }

    pub fn set_tracker(&mut self, id: LineId, tracker: Option<u16>) {
        if let Some(line) = self.line_mut(id) {
            line.tracker = tracker;
        }
    }

    // ========== 连接 ==========

    /// 把线的某一端挂到交叉点上
    ///
    /// 交叉点已满或已含该线时返回 false, 该端指针置空。
    pub fn attach(&mut self, inter: IntersectionId, line: LineId, end: End) -> bool {
        let added = match self.intersections.get_mut(inter.0) {
            Some(i) if i.lines.len() < LINE_MAX_INTERSECTION_LINES && !i.lines.contains(&line) => {
                i.lines.push(line);
                true
            }
            _ => false,
        };
        if let Some(l) = self.lines.get_mut(line.0) {
            l.set_intersection(end, if added { Some(inter) } else { None });
        }
        added
    }

    /// 从交叉点的列表中移除线, 返回移除次数 (线的指针不变)
    pub fn detach(&mut self, line: LineId, inter: IntersectionId) -> usize {
        match self.intersections.get_mut(inter.0) {
            Some(i) => {
                let before = i.lines.len();
                i.lines.retain(|l| *l != line);
                before - i.lines.len()
            }
            None => 0,
        }
    }

    /// 删除线并从两端交叉点中摘除
    pub fn remove_line(&mut self, line: LineId) {
        let Some(l) = self.lines.get(line.0) else {
            return;
        };
        let (i0, i1) = (l.i0, l.i1);
        if let Some(i0) = i0 {
            self.detach(line, i0);
        }
        if let Some(i1) = i1 {
            self.detach(line, i1);
        }
        self.lines.remove(line.0);
    }

    /// 所有交叉点中 `gone` 替换为 `keep`, 然后删除 `gone`
    pub fn replace_line(&mut self, keep: LineId, gone: LineId) {
        for slot in self.intersections.slots.iter_mut() {
            if let Some(i) = slot.value.as_mut() {
                for l in i.lines.iter_mut() {
                    if *l == gone {
                        *l = keep;
                    }
                }
            }
        }
        self.lines.remove(gone.0);
    }

    pub fn remove_intersection(&mut self, inter: IntersectionId) -> Option<Intersection> {
        self.intersections.remove(inter.0)
    }

    /// 把除 `exclude` 以外、位于 `p` 且含 `old` 的交叉点改指向 `new` 的 p1 端
    pub fn redirect_far_end(&mut self, old: LineId, new: LineId, p: Point, exclude: IntersectionId) {
        let mut hit = None;
        for (i, slot) in self.intersections.slots.iter_mut().enumerate() {
            let handle = Handle {
                slot: i as u32,
                generation: slot.generation,
            };
            if handle == exclude.0 {
                continue;
            }
            let Some(inter) = slot.value.as_mut() else {
                continue;
            };
            if inter.p != p {
                continue;
            }
            for l in inter.lines.iter_mut() {
                if *l == old {
                    *l = new;
                    hit = Some(IntersectionId(handle));
                }
            }
        }
        if let (Some(inter), Some(line)) = (hit, self.lines.get_mut(new.0)) {
            line.i1 = Some(inter);
        }
    }

    // ========== 一致性检查 ==========

    /// 校验所有交叉引用
    pub fn check_graph(&self) -> Result<(), GraphError> {
        for (id, line) in self.lines() {
            for end in [End::P0, End::P1] {
                let Some(inter_id) = line.intersection(end) else {
                    continue;
                };
                let Some(inter) = self.intersection(inter_id) else {
                    return Err(GraphError::DanglingIntersection {
                        line: line.index,
                        end,
                    });
                };
                let count = inter.lines.iter().filter(|l| **l == id).count();
                if count != 1 {
                    return Err(GraphError::BackReference {
                        line: line.index,
                        end,
                        count,
                    });
                }
            }
        }

        for (inter_id, inter) in self.intersections() {
            for (k, lid) in inter.lines.iter().enumerate() {
                let Some(line) = self.line(*lid) else {
                    return Err(GraphError::DanglingLine {
                        x: inter.p.x,
                        y: inter.p.y,
                    });
                };
                if line.i0 == line.i1 {
                    return Err(GraphError::SameIntersection { line: line.index });
                }
                if line.i0 != Some(inter_id) && line.i1 != Some(inter_id) {
                    return Err(GraphError::MissingBackPointer {
                        line: line.index,
                        x: inter.p.x,
                        y: inter.p.y,
                    });
                }
                for end in [End::P0, End::P1] {
                    if line.intersection(end) == Some(inter_id) && line.point(end) != inter.p {
                        return Err(GraphError::PointMismatch {
                            line: line.index,
                            end,
                        });
                    }
                }
                if inter.lines[k + 1..].contains(lid) {
                    return Err(GraphError::DuplicateLine {
                        x: inter.p.x,
                        y: inter.p.y,
                        line: line.index,
                    });
                }
            }
        }
        Ok(())
    }

    /// 调试用: 校验失败时记录
    pub fn debug_check(&self, stage: &str) -> bool {
        match self.check_graph() {
            Ok(()) => true,
            Err(e) => {
                warn!("⚠️  拓扑校验失败 [{}]: {}", stage, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_generation_checks() {
        let mut arena = Arena::new();
        let a = arena.insert(1);
        let b = arena.insert(2);
        assert_eq!(arena.get(a), Some(&1));
        assert_eq!(arena.remove(a), Some(1));
        assert!(arena.get(a).is_none());
        assert_eq!(arena.len(), 1);

        arena.clear();
        let c = arena.insert(3);
        // 清空后旧句柄失效, 即使槽位相同
        assert!(arena.get(b).is_none());
        assert!(arena.get(a).is_none());
        assert_eq!(arena.get(c), Some(&3));
    }

    #[test]
    fn test_line_indexes_start_at_one() {
        let mut g = LineGraph::new();
        let a = g.add_line(Point::new(0, 0), Point::new(0, 20)).unwrap();
        let b = g.add_line(Point::new(5, 0), Point::new(5, 20)).unwrap();
        assert_eq!(g.line(a).unwrap().index, 1);
        assert_eq!(g.line(b).unwrap().index, 2);
        assert_eq!(g.line_by_index(2), Some(b));
        assert_eq!(g.endpoints().len(), 4);

        g.clear();
        assert_eq!(g.next_index(), 1);
        assert!(g.line(a).is_none());
    }

    #[test]
    fn test_line_capacity_truncates() {
        let mut g = LineGraph::new();
        for i in 0..200u32 {
            g.add_line(Point::new((i % 70) as u8, 0), Point::new((i % 70) as u8, 10));
        }
        assert_eq!(g.num_lines(), LINE_MAX_LINES - 1);
        assert_eq!(g.truncated(), 200 - (LINE_MAX_LINES as u32 - 1));
    }

    #[test]
    fn test_attach_detach_and_check() {
        let mut g = LineGraph::new();
        let c = Point::new(20, 20);
        let a = g.add_line(c, Point::new(20, 40)).unwrap();
        let b = g.add_line(c, Point::new(40, 20)).unwrap();
        let i = g.add_intersection(c);
        assert!(g.attach(i, a, End::P0));
        assert!(g.attach(i, b, End::P0));
        // 重复连接被拒绝
        assert!(!g.attach(i, b, End::P1));
        g.line_mut(b).unwrap().i1 = None;
        g.line_mut(b).unwrap().i0 = Some(i);
        assert!(g.check_graph().is_ok());

        // 线的位置与交叉点不一致
        g.line_mut(a).unwrap().p0 = Point::new(21, 20);
        assert!(matches!(
            g.check_graph(),
            Err(GraphError::PointMismatch { line: 1, end: End::P0 })
        ));
        g.line_mut(a).unwrap().p0 = c;

        g.remove_line(a);
        assert_eq!(g.intersection(i).unwrap().lines, vec![b]);
        assert!(g.check_graph().is_ok());

        g.remove_intersection(i);
        assert!(matches!(
            g.check_graph(),
            Err(GraphError::DanglingIntersection { line: 2, end: End::P0 })
        ));
    }

    #[test]
    fn test_replace_line() {
        let mut g = LineGraph::new();
        let a = g.add_line(Point::new(10, 10), Point::new(10, 20)).unwrap();
        let b = g.add_line(Point::new(10, 30), Point::new(10, 20)).unwrap();
        let i = g.add_intersection(Point::new(10, 30));
        g.attach(i, b, End::P0);
        g.replace_line(a, b);
        assert!(g.line(b).is_none());
        assert_eq!(g.intersection(i).unwrap().lines, vec![a]);
    }
}
