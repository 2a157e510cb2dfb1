//! 主向量获取与路口转向
//! Primary line acquisition, primary/goal endpoint labeling and intersection turns

use log::{debug, info, warn};
use serde::Serialize;

use crate::config::LineConfig;
use crate::error::{FrameError, Result};
use crate::line::geometry::{bearing, xdirection};
use crate::line::graph::{Intersection, IntersectionId, LineGraph};
use crate::line::grid::LINE_GRID_HEIGHT;
use crate::line::TrackedLine;
use crate::tracking::{TrackEvents, TrackState, Tracker, TrackerSet, TR_FILTERING_MULTIPLIER};
use crate::types::Point;

// ========== 方向位图 ==========

pub const LINE_HT_UP: u8 = 0x01;
pub const LINE_HT_DOWN: u8 = 0x02;
pub const LINE_HT_LEFT: u8 = 0x04;
pub const LINE_HT_RIGHT: u8 = 0x08;

/// 获取主向量所需的最小长度平方
pub const LINE_MIN_ACQUISITION_LENGTH2: u32 = 15 * 15;
/// 输出的交叉点最多分支数
pub const LINE_MAX_FRAME_INTERSECTION_LINES: usize = 6;

/// 交叉点的一个分支
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct IntersectionLine {
    pub index: u16, // 跟踪ID
    pub angle: i16, // 方位角 (度)
}

/// 输出用的交叉点, 分支按角度升序
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FrameIntersection {
    pub x: u8,
    pub y: u8,
    pub lines: Vec<IntersectionLine>,
}

/// 只收录已有跟踪ID的线, 最多 6 条
pub fn format_intersection(graph: &LineGraph, intersection: &Intersection) -> FrameIntersection {
    let p = intersection.p;
    let mut lines: Vec<IntersectionLine> = intersection
        .lines
        .iter()
        .filter_map(|&id| graph.line(id))
        .filter_map(|l| {
            l.tracker.map(|index| IntersectionLine {
                index,
                angle: bearing(&l.p0, &l.p1, &p),
            })
        })
        .take(LINE_MAX_FRAME_INTERSECTION_LINES)
        .collect();
    lines.sort_by_key(|l| l.angle);
    FrameIntersection {
        x: p.x,
        y: p.y,
        lines,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimaryState {
    Acquiring,
    Tracking,
}

/// 主向量状态机
pub struct PrimaryTracker {
    state: PrimaryState,
    line: u16, // 主向量的跟踪ID
    point: Point,
    goal: Point,
    map: u8,
    active: bool,
    intersection: Tracker<FrameIntersection>,
    new_intersection: bool,

    // 模式与请求
    delayed_turn: bool,
    manual_select: bool,
    pending_select: Option<u16>,
    reverse: bool,
    next_turn: i16,
    default_turn: i16,
    new_turn: bool,
    min_line_length: u16,
}

impl PrimaryTracker {
    pub fn new(config: &LineConfig) -> Self {
        let leading = config.intersection_filtering as u32 * TR_FILTERING_MULTIPLIER;
        let mut intersection =
            Tracker::new(FrameIntersection::default(), 0, leading, (leading + 1) >> 1, 0);
        intersection.set_state(TrackState::Invalid);
        Self {
            state: PrimaryState::Acquiring,
            line: 0,
            point: Point::default(),
            goal: Point::default(),
            map: LINE_HT_DOWN,
            active: false,
            intersection,
            new_intersection: false,
            delayed_turn: config.delayed_turn,
            manual_select: config.manual_vector_select,
            pending_select: None,
            reverse: false,
            next_turn: config.default_turn_angle,
            default_turn: config.default_turn_angle,
            new_turn: false,
            min_line_length: config.min_line_length,
        }
    }

    /// 参数变化后同步 (状态保留)
    pub fn apply_config(&mut self, config: &LineConfig) {
        let leading = config.intersection_filtering as u32 * TR_FILTERING_MULTIPLIER;
        self.intersection.set_timing(leading, (leading + 1) >> 1);
        self.delayed_turn = config.delayed_turn;
        self.manual_select = config.manual_vector_select;
        self.default_turn = config.default_turn_angle;
        self.min_line_length = config.min_line_length;
    }

    // ========== 查询 ==========

    pub fn state(&self) -> PrimaryState {
        self.state
    }

    /// 正在跟踪的主向量ID
    pub fn primary_line(&self) -> Option<u16> {
        match self.state {
            PrimaryState::Tracking => Some(self.line),
            PrimaryState::Acquiring => None,
        }
    }

    pub fn point(&self) -> Point {
        self.point
    }

    pub fn goal(&self) -> Point {
        self.goal
    }

    pub fn map(&self) -> u8 {
        self.map
    }

    /// 主向量的跟踪器处于有效状态
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// 当前跟踪中的交叉点
    pub fn intersection(&self) -> Option<&FrameIntersection> {
        if self.intersection.state() == TrackState::Invalid {
            None
        } else {
            Some(self.intersection.object())
        }
    }

    pub fn intersection_state(&self) -> TrackState {
        self.intersection.state()
    }

    /// 新确认的交叉点只报告一次
    pub fn take_new_intersection(&mut self) -> Option<FrameIntersection> {
        if !self.new_intersection {
            return None;
        }
        self.new_intersection = false;
        Some(self.intersection.object().clone())
    }

    pub fn next_turn_angle(&self) -> i16 {
        self.next_turn
    }

    // ========== 设置 ==========

    pub fn set_delayed_turn(&mut self, delayed: bool) {
        self.delayed_turn = delayed;
    }

    pub fn set_manual_select(&mut self, manual: bool) {
        self.manual_select = manual;
    }

    pub fn set_next_turn_angle(&mut self, angle: i16) {
        self.next_turn = angle;
        self.new_turn = true;
    }

    pub fn set_default_turn_angle(&mut self, angle: i16) {
        self.default_turn = angle;
    }

    /// 手动选择模式下指定主向量 (下一帧生效)
    pub fn select_vector(&mut self, index: u16) {
        self.pending_select = Some(index);
    }

    /// 请求交换主点与目标点
    pub fn reverse_vector(&mut self) -> Result<()> {
        if !self.active {
            return Err(FrameError::InvalidState("主向量未激活"));
        }
        self.reverse = true;
        Ok(())
    }

    // ========== 状态机 ==========

    /// 每帧在线跟踪之后调用一次
    pub fn handle_state(&mut self, trackers: &TrackerSet<TrackedLine>, graph: &LineGraph, now_ms: u64) {
        match self.state {
            PrimaryState::Acquiring => self.acquire(trackers),
            PrimaryState::Tracking => self.track(trackers, graph, now_ms),
        }
    }

    /// 从图像最下方开始找第一条足够长的线
    fn acquire(&mut self, trackers: &TrackerSet<TrackedLine>) {
        if self.manual_select {
            if let Some(index) = self.pending_select.take() {
                self.set_primary_vector(trackers, index);
            }
            return;
        }

        let mut visited: Vec<u16> = Vec::new();
        loop {
            let mut ymax = 0;
            let mut lowest: Option<&Tracker<TrackedLine>> = None;
            for tracker in trackers.iter() {
                let Some(line) = tracker.get() else {
                    continue;
                };
                if visited.contains(&tracker.id()) {
                    continue;
                }
                if line.p0.y > ymax {
                    ymax = line.p0.y;
                    lowest = Some(tracker);
                } else if line.p1.y > ymax {
                    ymax = line.p1.y;
                    lowest = Some(tracker);
                }
            }
            let Some(lowest) = lowest else {
                break;
            };
            if lowest.object().length2() >= LINE_MIN_ACQUISITION_LENGTH2 {
                let id = lowest.id();
                self.set_primary_vector(trackers, id);
                break;
            }
            visited.push(lowest.id());
        }
    }

    /// 以指定跟踪器为主向量, 较低的端点为主点
    pub fn set_primary_vector(&mut self, trackers: &TrackerSet<TrackedLine>, index: u16) -> bool {
        let Some(tracker) = trackers.find(index) else {
            warn!("⚠️  主向量 {} 不存在", index);
            return false;
        };
        self.map = LINE_HT_DOWN;
        self.line = index;
        self.intersection.set_state(TrackState::Invalid);
        self.state = PrimaryState::Tracking;
        self.update_primary_point(tracker.object(), tracker.get().is_some());
        info!(
            "🎯 获取主向量: 线 {} ({},{}) → ({},{})",
            index, self.point.x, self.point.y, self.goal.x, self.goal.y
        );
        true
    }

    fn track(&mut self, trackers: &TrackerSet<TrackedLine>, graph: &LineGraph, now_ms: u64) {
        let Some(tracker) = trackers.find(self.line) else {
            info!("❌ 主向量 {} 丢失, 重新获取", self.line);
            self.state = PrimaryState::Acquiring;
            self.active = false;
            return;
        };

        if self.reverse {
            self.reverse = false;
            self.map = reverse_map(self.map);
        }
        self.update_primary_point(tracker.object(), tracker.get().is_some());

        // 本帧图中的主向量, 目标端的交叉点
        let Some((_, line)) = graph.line_by_tracker(self.line) else {
            return;
        };
        let inter = if line.p0 == self.goal { line.i0 } else { line.i1 };
        let events = self.update_primary_intersection(graph, inter, now_ms);

        if events.contains(TrackEvents::VALIDATED) {
            self.new_intersection = true;
            debug!("🔀 新交叉点 ({},{})", self.intersection.object().x, self.intersection.object().y);
            if !self.delayed_turn {
                self.intersection_turn(trackers);
            } else {
                self.new_turn = false;
            }
        } else if self.new_turn
            && self.delayed_turn
            && self.intersection.state() != TrackState::Invalid
        {
            self.intersection_turn(trackers);
        }
        if events.contains(TrackEvents::INVALIDATED) {
            self.new_intersection = false;
        }
    }

    /// 根据方向偏好标记主点与目标点
    fn update_primary_point(&mut self, line: &TrackedLine, active: bool) {
        self.active = active;
        let (p0, p1) = (line.p0, line.p1);
        if xdirection(&p0, &p1) {
            let (primary, goal) = if self.map & LINE_HT_RIGHT != 0 {
                self.map = LINE_HT_RIGHT;
                if p0.x > p1.x { (p0, p1) } else { (p1, p0) }
            } else {
                self.map = LINE_HT_LEFT;
                if p0.x < p1.x { (p0, p1) } else { (p1, p0) }
            };
            if primary.y > goal.y {
                self.map |= LINE_HT_DOWN;
            }
            self.point = primary;
            self.goal = goal;
        } else {
            let (primary, goal) = if self.map & LINE_HT_DOWN != 0 {
                self.map = LINE_HT_DOWN;
                if p0.y > p1.y { (p0, p1) } else { (p1, p0) }
            } else {
                self.map = LINE_HT_UP;
                if p0.y < p1.y { (p0, p1) } else { (p1, p0) }
            };
            if primary.x > goal.x {
                self.map |= LINE_HT_RIGHT;
            }
            self.point = primary;
            self.goal = goal;
        }
    }

    /// 跟踪目标端的交叉点, 分支数不变才视为同一个
    fn update_primary_intersection(
        &mut self,
        graph: &LineGraph,
        inter: Option<IntersectionId>,
        now_ms: u64,
    ) -> TrackEvents {
        self.intersection.reset_min();

        let margin = self.min_line_length as f32 * 1.4; // 离上下边界足够远
        if let Some(intersection) = inter.and_then(|id| graph.intersection(id)) {
            let y = intersection.p.y as f32;
            if y > margin && y < LINE_GRID_HEIGHT as f32 - margin {
                let same = self.intersection.state() == TrackState::Invalid
                    || intersection.lines.len() == self.intersection.object().lines.len();
                if same {
                    let fint = format_intersection(graph, intersection);
                    self.intersection.set_min(0, 0, fint);
                }
            }
        }
        self.intersection.update(now_ms)
    }

    /// 选出与期望转向角最接近的分支作为新的主向量
    fn intersection_turn(&mut self, trackers: &TrackerSet<TrackedLine>) {
        let fint = self.intersection.object();
        let next_turn = self.next_turn as i32;
        let Some(branch) = fint
            .lines
            .iter()
            .min_by_key(|l| (l.angle as i32 - next_turn).abs())
            .copied()
        else {
            return;
        };
        let at = Point::new(fint.x, fint.y);
        let Some(tracker) = trackers.find(branch.index) else {
            warn!("⚠️  转向目标 {} 没有跟踪器", branch.index);
            return;
        };
        let line = tracker.object();
        let (primary, goal) = if at == line.p0 { (line.p0, line.p1) } else { (line.p1, line.p0) };

        self.map = if xdirection(&line.p0, &line.p1) {
            if primary.x < goal.x { LINE_HT_LEFT } else { LINE_HT_RIGHT }
        } else if primary.y < goal.y {
            LINE_HT_UP
        } else {
            LINE_HT_DOWN
        };
        self.line = branch.index;
        self.point = primary;
        self.goal = goal;
        self.active = true;
        self.intersection.set_state(TrackState::Invalid);

        self.next_turn = self.default_turn;
        self.new_turn = false;
        info!("↪️  路口转向: 线 {} 角度 {}", branch.index, branch.angle);
    }
}

/// 上下、左右互换
fn reverse_map(map: u8) -> u8 {
    let mut map = map;
    if map & LINE_HT_UP != 0 {
        map = (map & !LINE_HT_UP) | LINE_HT_DOWN;
    } else if map & LINE_HT_DOWN != 0 {
        map = (map & !LINE_HT_DOWN) | LINE_HT_UP;
    }
    if map & LINE_HT_RIGHT != 0 {
        map = (map & !LINE_HT_RIGHT) | LINE_HT_LEFT;
    } else if map & LINE_HT_LEFT != 0 {
        map = (map & !LINE_HT_LEFT) | LINE_HT_RIGHT;
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::graph::{End, LineId};
    use crate::tracking::TR_MAXVAL;

    fn p(x: u8, y: u8) -> Point {
        Point::new(x, y)
    }

    /// 跑两帧 (0ms, 20ms) 让所有线进入 VALID, 同时写回图中的跟踪ID
    fn tracked(graph: &mut LineGraph) -> TrackerSet<TrackedLine> {
        let mut set = TrackerSet::new("线", 16);
        let ids: Vec<LineId> = graph.line_ids();
        let prims: Vec<TrackedLine> = ids
            .iter()
            .filter_map(|&id| graph.line(id).map(TrackedLine::from))
            .collect();
        let mut links = Vec::new();
        for now in [0, 20] {
            links = set.handle_tracking(&prims, 1, now, |t, l| {
                if t.object() == l {
                    0
                } else {
                    TR_MAXVAL
                }
            });
        }
        for (id, link) in ids.into_iter().zip(links) {
            graph.set_tracker(id, link);
        }
        set
    }

    fn config() -> LineConfig {
        LineConfig::default()
    }

    /// 竖线 (20,40)-(20,20), 上端是 T 字路口
    fn tee() -> (LineGraph, [LineId; 3]) {
        let mut graph = LineGraph::new();
        let stem = graph.add_line(p(20, 40), p(20, 20)).unwrap();
        let left = graph.add_line(p(20, 20), p(5, 20)).unwrap();
        let right = graph.add_line(p(20, 20), p(35, 20)).unwrap();
        let inter = graph.add_intersection(p(20, 20));
        graph.attach(inter, stem, End::P1);
        graph.attach(inter, left, End::P0);
        graph.attach(inter, right, End::P0);
        (graph, [stem, left, right])
    }

    fn tracker_of(graph: &LineGraph, id: LineId) -> u16 {
        graph.line(id).and_then(|l| l.tracker).unwrap()
    }

    #[test]
    fn test_acquire_lowest_long_line() {
        let mut graph = LineGraph::new();
        graph.add_line(p(10, 40), p(10, 20)).unwrap();
        let short = graph.add_line(p(30, 50), p(31, 48)).unwrap();
        let trackers = tracked(&mut graph);

        let mut primary = PrimaryTracker::new(&config());
        primary.handle_state(&trackers, &graph, 20);
        assert_eq!(primary.state(), PrimaryState::Tracking);
        assert_ne!(primary.primary_line(), Some(tracker_of(&graph, short)));
        assert_eq!(primary.point(), p(10, 40));
        assert_eq!(primary.goal(), p(10, 20));
        assert_eq!(primary.map(), LINE_HT_DOWN);
        assert!(primary.is_active());
    }

    #[test]
    fn test_no_long_line_keeps_acquiring() {
        let mut graph = LineGraph::new();
        graph.add_line(p(30, 50), p(31, 48)).unwrap();
        let trackers = tracked(&mut graph);
        let mut primary = PrimaryTracker::new(&config());
        primary.handle_state(&trackers, &graph, 20);
        assert_eq!(primary.state(), PrimaryState::Acquiring);
        assert!(primary.primary_line().is_none());
    }

    #[test]
    fn test_manual_select() {
        let mut graph = LineGraph::new();
        let a = graph.add_line(p(10, 40), p(10, 20)).unwrap();
        let b = graph.add_line(p(40, 30), p(40, 10)).unwrap();
        let trackers = tracked(&mut graph);

        let mut cfg = config();
        cfg.manual_vector_select = true;
        let mut primary = PrimaryTracker::new(&cfg);
        primary.handle_state(&trackers, &graph, 20);
        assert_eq!(primary.state(), PrimaryState::Acquiring);

        primary.select_vector(tracker_of(&graph, b));
        primary.handle_state(&trackers, &graph, 40);
        assert_eq!(primary.primary_line(), Some(tracker_of(&graph, b)));
        assert_ne!(primary.primary_line(), Some(tracker_of(&graph, a)));
        assert_eq!(primary.point(), p(40, 30));
    }

    #[test]
    fn test_horizontal_primary_point() {
        let mut graph = LineGraph::new();
        graph.add_line(p(10, 20), p(40, 22)).unwrap();
        let trackers = tracked(&mut graph);
        let mut primary = PrimaryTracker::new(&config());
        primary.handle_state(&trackers, &graph, 20);
        // 没有 RIGHT 偏好时取左端
        assert_eq!(primary.point(), p(10, 20));
        assert_eq!(primary.goal(), p(40, 22));
        assert_eq!(primary.map(), LINE_HT_LEFT);
    }

    #[test]
    fn test_reverse_vector() {
        let mut primary = PrimaryTracker::new(&config());
        assert!(matches!(primary.reverse_vector(), Err(FrameError::InvalidState(_))));

        let mut graph = LineGraph::new();
        graph.add_line(p(10, 40), p(10, 20)).unwrap();
        let trackers = tracked(&mut graph);
        primary.handle_state(&trackers, &graph, 20);
        primary.reverse_vector().unwrap();
        primary.handle_state(&trackers, &graph, 40);
        assert_eq!(primary.point(), p(10, 20));
        assert_eq!(primary.goal(), p(10, 40));
        assert_eq!(primary.map(), LINE_HT_UP);
        assert_eq!(reverse_map(LINE_HT_UP | LINE_HT_RIGHT), LINE_HT_DOWN | LINE_HT_LEFT);
    }

    #[test]
    fn test_lost_primary_reacquires() {
        let mut graph = LineGraph::new();
        graph.add_line(p(10, 40), p(10, 20)).unwrap();
        let trackers = tracked(&mut graph);
        let mut primary = PrimaryTracker::new(&config());
        primary.handle_state(&trackers, &graph, 20);

        let empty: TrackerSet<TrackedLine> = TrackerSet::new("线", 16);
        primary.handle_state(&empty, &LineGraph::new(), 40);
        assert_eq!(primary.state(), PrimaryState::Acquiring);
        assert!(!primary.is_active());
    }

    #[test]
    fn test_format_intersection_sorted() {
        let (mut graph, _) = tee();
        tracked(&mut graph);
        let (_, inter) = graph.intersections().next().unwrap();
        let fint = format_intersection(&graph, inter);
        let angles: Vec<i16> = fint.lines.iter().map(|l| l.angle).collect();
        assert_eq!(angles, vec![-90, 90, 180]);
        assert_eq!((fint.x, fint.y), (20, 20));
    }

    #[test]
    fn test_turn_at_intersection() {
        let (mut graph, [stem, left, _]) = tee();
        let trackers = tracked(&mut graph);
        let mut primary = PrimaryTracker::new(&config());

        primary.handle_state(&trackers, &graph, 20);
        assert_eq!(primary.primary_line(), Some(tracker_of(&graph, stem)));

        // 交叉点进入 LEADING
        primary.handle_state(&trackers, &graph, 40);
        assert_eq!(primary.intersection_state(), TrackState::Leading);

        primary.set_next_turn_angle(90);
        primary.handle_state(&trackers, &graph, 60);
        assert_eq!(primary.primary_line(), Some(tracker_of(&graph, left)));
        assert_eq!(primary.point(), p(20, 20));
        assert_eq!(primary.goal(), p(5, 20));
        assert_eq!(primary.map(), LINE_HT_RIGHT);
        assert_eq!(primary.intersection_state(), TrackState::Invalid);
        assert_eq!(primary.next_turn_angle(), 0);

        let fint = primary.take_new_intersection().unwrap();
        assert_eq!(fint.lines.len(), 3);
        assert!(primary.take_new_intersection().is_none());
    }

    #[test]
    fn test_delayed_turn() {
        let (mut graph, [stem, _, right]) = tee();
        let trackers = tracked(&mut graph);
        let mut cfg = config();
        cfg.delayed_turn = true;
        let mut primary = PrimaryTracker::new(&cfg);

        primary.handle_state(&trackers, &graph, 20);
        primary.handle_state(&trackers, &graph, 40);
        // 交叉点确认时不转向, 等待新的转向角
        primary.handle_state(&trackers, &graph, 60);
        assert_eq!(primary.intersection_state(), TrackState::Valid);
        assert_eq!(primary.primary_line(), Some(tracker_of(&graph, stem)));

        primary.set_next_turn_angle(-90);
        primary.handle_state(&trackers, &graph, 80);
        assert_eq!(primary.primary_line(), Some(tracker_of(&graph, right)));
        assert_eq!(primary.goal(), p(35, 20));
    }
}
