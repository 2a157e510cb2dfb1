//! 跟踪器集合与逐帧贪心最小代价分配
//! Tracker collection with the per-frame greedy min-cost assignment

use super::tracker::{TrackEvents, Tracker, TR_FILTERING_MULTIPLIER, TR_MAXVAL};
use log::{debug, warn};

/// 一组同类跟踪器
pub struct TrackerSet<T> {
    name: &'static str,
    trackers: Vec<Tracker<T>>,
    next_id: u16,    // 下一个跟踪ID (单调递增, 回绕)
    capacity: usize, // 跟踪器数量上限
    truncated: u32,  // 因容量不足而未能创建的跟踪器计数
}

impl<T: Clone> TrackerSet<T> {
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            trackers: Vec::with_capacity(capacity),
            next_id: 0,
            capacity,
            truncated: 0,
        }
    }

    /// 对本帧的基元执行分配与状态更新
    ///
    /// 返回每个基元对应的跟踪ID (容量不足时为 None)。
    pub fn handle_tracking<F>(
        &mut self,
        primitives: &[T],
        filtering: u16,
        now_ms: u64,
        mut cost: F,
    ) -> Vec<Option<u16>>
    where
        F: FnMut(&Tracker<T>, &T) -> u32,
    {
        // 基元 → 跟踪器下标
        let mut claims: Vec<Option<usize>> = vec![None; primitives.len()];
        for tracker in self.trackers.iter_mut() {
            tracker.reset_min();
        }

        let mut passes = 0;
        while self.assign_pass(primitives, &mut claims, &mut cost) > 0 {
            passes += 1;
        }

        let mut links: Vec<Option<u16>> = claims
            .iter()
            .map(|c| c.map(|ti| self.trackers[ti].id()))
            .collect();

        let before = self.trackers.len();
        self.trackers.retain_mut(|tracker| {
            let events = tracker.update(now_ms);
            !events.contains(TrackEvents::INVALIDATED)
        });
        let removed = before - self.trackers.len();

        // 未被认领的基元生成新跟踪器
        let leading = filtering as u32 * TR_FILTERING_MULTIPLIER;
        let trailing = (leading + 1) >> 1;
        let mut spawned = 0;
        for (index, primitive) in primitives.iter().enumerate() {
            if claims[index].is_some() {
                continue;
            }
            if self.trackers.len() >= self.capacity {
                self.truncated += 1;
                continue;
            }
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            self.trackers
                .push(Tracker::new(primitive.clone(), id, leading, trailing, now_ms));
            links[index] = Some(id);
            spawned += 1;
        }

        if links.iter().any(|l| l.is_none()) {
            warn!("⚠️  {} 跟踪器已满, 本帧部分基元未跟踪", self.name);
        }
        debug!(
            "🔗 {} 分配: 基元 {} 轮次 {} 新建 {} 移除 {} 当前 {}",
            self.name,
            primitives.len(),
            passes,
            spawned,
            removed,
            self.trackers.len()
        );
        links
    }

    /// 一轮分配, 返回本轮的分配次数
    fn assign_pass<F>(
        &mut self,
        primitives: &[T],
        claims: &mut [Option<usize>],
        cost: &mut F,
    ) -> usize
    where
        F: FnMut(&Tracker<T>, &T) -> u32,
    {
        let mut assigned = 0;
        for ti in 0..self.trackers.len() {
            if self.trackers[ti].has_min() {
                continue;
            }
            let mut min = TR_MAXVAL;
            let mut best = None;
            for (pi, primitive) in primitives.iter().enumerate() {
                let val = cost(&self.trackers[ti], primitive);
                let claimant = claims[pi].map(|ci| &self.trackers[ci]);
                if val < min && self.trackers[ti].swappable(val, claimant) {
                    min = val;
                    best = Some(pi);
                }
            }
            if let Some(pi) = best {
                if let Some(ci) = claims[pi] {
                    self.trackers[ci].reset_min();
                }
                claims[pi] = Some(ti);
                self.trackers[ti].set_min(min, pi, primitives[pi].clone());
                assigned += 1;
            }
        }
        assigned
    }

    pub fn find(&self, id: u16) -> Option<&Tracker<T>> {
        self.trackers.iter().find(|t| t.id() == id)
    }

    pub fn find_mut(&mut self, id: u16) -> Option<&mut Tracker<T>> {
        self.trackers.iter_mut().find(|t| t.id() == id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tracker<T>> {
        self.trackers.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Tracker<T>> {
        self.trackers.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }

    pub fn truncated(&self) -> u32 {
        self.truncated
    }

    /// 清空所有跟踪器 (ID 计数不回退)
    pub fn clear(&mut self) {
        self.trackers.clear();
    }
}
