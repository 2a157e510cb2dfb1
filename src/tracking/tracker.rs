//! 通用身份跟踪器
//! Generic four-state hysteresis tracker shared by blobs, lines and barcodes

use serde::Serialize;
use std::ops::{BitOr, BitOrAssign};

// ========== 常量 ==========

/// 代价无穷大 (不可匹配)
pub const TR_MAXVAL: u32 = u32::MAX;
/// 年龄上限 (饱和)
pub const TR_MAXAGE: u8 = 0xff;
/// 默认前导时间 (ms)
pub const TR_DEFAULT_LEADING_MS: u32 = 500;
/// 默认拖尾时间 (ms)
pub const TR_DEFAULT_TRAILING_MS: u32 = 500;
/// 滤波等级 → 前导时间的倍率 (ms)
pub const TR_FILTERING_MULTIPLIER: u32 = 16;

// ========== 事件位 ==========

/// 跟踪事件位 (可累积)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct TrackEvents(u8);

impl TrackEvents {
    pub const NONE: TrackEvents = TrackEvents(0);
    pub const INVALIDATED: TrackEvents = TrackEvents(0x01);
    pub const VALIDATED: TrackEvents = TrackEvents(0x02);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: TrackEvents) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(&mut self, other: TrackEvents) {
        self.0 &= !other.0;
    }
}

impl BitOr for TrackEvents {
    type Output = TrackEvents;

    fn bitor(self, rhs: TrackEvents) -> TrackEvents {
        TrackEvents(self.0 | rhs.0)
    }
}

impl BitOrAssign for TrackEvents {
    fn bitor_assign(&mut self, rhs: TrackEvents) {
        self.0 |= rhs.0;
    }
}

// ========== 状态 ==========

/// 跟踪状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum TrackState {
    /// 已确认
    Valid,
    /// 丢失后的保持期
    Trailing,
    /// 新出现, 等待确认
    Leading,
    /// 无效
    Invalid,
}

impl TrackState {
    /// 状态码 (输出记录使用)
    pub fn code(self) -> u8 {
        match self {
            TrackState::Valid => 0,
            TrackState::Trailing => 1,
            TrackState::Leading => 2,
            TrackState::Invalid => 3,
        }
    }

    /// 对外可见 (VALID / TRAILING)
    pub fn is_reportable(self) -> bool {
        matches!(self, TrackState::Valid | TrackState::Trailing)
    }
}

// ========== 跟踪器 ==========

/// 单个跟踪器: 持有对象副本, 通过"本帧是否匹配"驱动状态机
#[derive(Clone, Debug)]
pub struct Tracker<T> {
    object: T,
    id: u16,
    state: TrackState,
    age: u8,
    events: TrackEvents,        // 粘滞事件
    events_shadow: TrackEvents, // 已上报的事件
    timer_ms: u64,
    leading_ms: u32,
    trailing_ms: u32,

    // 本帧分配用的临时数据
    min_val: u32,
    min_index: Option<usize>,
    min_object: Option<T>,
}

impl<T: Clone> Tracker<T> {
    /// 新建跟踪器, 初始为 LEADING
    pub fn new(object: T, id: u16, leading_ms: u32, trailing_ms: u32, now_ms: u64) -> Self {
        Self {
            object,
            id,
            state: TrackState::Leading,
            age: 0,
            events: TrackEvents::NONE,
            events_shadow: TrackEvents::NONE,
            timer_ms: now_ms,
            leading_ms,
            trailing_ms,
            min_val: TR_MAXVAL,
            min_index: None,
            min_object: None,
        }
    }

    /// 重置为初始状态 (保留对象与阈值)
    pub fn reset(&mut self, now_ms: u64) {
        self.state = TrackState::Leading;
        self.age = 0;
        self.events = TrackEvents::NONE;
        self.events_shadow = TrackEvents::NONE;
        self.timer_ms = now_ms;
        self.reset_min();
    }

    pub fn set_timing(&mut self, leading_ms: u32, trailing_ms: u32) {
        self.leading_ms = leading_ms;
        self.trailing_ms = trailing_ms;
    }

    pub fn reset_min(&mut self) {
        self.min_val = TR_MAXVAL;
        self.min_index = None;
        self.min_object = None;
    }

    /// 记录本帧候选匹配
    pub fn set_min(&mut self, val: u32, index: usize, object: T) {
        self.min_val = val;
        self.min_index = Some(index);
        self.min_object = Some(object);
    }

    pub fn min_val(&self) -> u32 {
        self.min_val
    }

    pub fn min_index(&self) -> Option<usize> {
        self.min_index
    }

    pub fn has_min(&self) -> bool {
        self.min_val != TR_MAXVAL
    }

    /// 能否从当前占有者手中抢走某个候选
    pub fn swappable(&self, val: u32, claimant: Option<&Tracker<T>>) -> bool {
        let Some(claimant) = claimant else {
            return true;
        };
        if val >= claimant.min_val {
            return false;
        }
        if self.state.is_reportable() {
            return true;
        }
        matches!(claimant.state, TrackState::Leading | TrackState::Invalid)
    }

    /// 推进状态机, 返回本次产生的事件
    pub fn update(&mut self, now_ms: u64) -> TrackEvents {
        let matched = self.min_object.take();
        let success = matched.is_some();
        if let Some(object) = matched {
            self.object = object;
        }
        let elapsed = now_ms.saturating_sub(self.timer_ms);
        let mut events = TrackEvents::NONE;

        match self.state {
            TrackState::Invalid => {
                if success {
                    if self.leading_ms == 0 {
                        self.state = TrackState::Valid;
                        events = TrackEvents::VALIDATED;
                    } else {
                        self.state = TrackState::Leading;
                        self.timer_ms = now_ms;
                    }
                }
            }
            TrackState::Leading => {
                if success {
                    if elapsed >= self.leading_ms as u64 {
                        self.state = TrackState::Valid;
                        events = TrackEvents::VALIDATED;
                    }
                } else {
                    self.state = TrackState::Invalid;
                    events = TrackEvents::INVALIDATED;
                }
            }
            TrackState::Valid => {
                if !success {
                    if self.trailing_ms == 0 {
                        self.state = TrackState::Invalid;
                        events = TrackEvents::INVALIDATED;
                    } else {
                        self.state = TrackState::Trailing;
                        self.timer_ms = now_ms;
                    }
                }
                self.age = self.age.saturating_add(1).min(TR_MAXAGE);
            }
            TrackState::Trailing => {
                if success {
                    self.state = TrackState::Valid;
                    events = TrackEvents::VALIDATED;
                } else if elapsed >= self.trailing_ms as u64 {
                    self.state = TrackState::Invalid;
                    events = TrackEvents::INVALIDATED;
                }
                self.age = self.age.saturating_add(1).min(TR_MAXAGE);
            }
        }

        self.events |= events;
        events
    }

    /// 对外可见的对象 (仅 VALID / TRAILING)
    pub fn get(&self) -> Option<&T> {
        if self.state.is_reportable() {
            Some(&self.object)
        } else {
            None
        }
    }

    /// 最近一次匹配的对象 (不论状态)
    pub fn object(&self) -> &T {
        &self.object
    }

    pub fn state(&self) -> TrackState {
        self.state
    }

    pub fn set_state(&mut self, state: TrackState) {
        self.state = state;
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn age(&self) -> u8 {
        self.age
    }

    pub fn events(&self) -> TrackEvents {
        self.events
    }

    /// 读取并清空粘滞事件
    pub fn take_events(&mut self) -> TrackEvents {
        std::mem::take(&mut self.events)
    }

    pub fn events_shadow(&self) -> TrackEvents {
        self.events_shadow
    }

    /// 标记事件已上报
    pub fn mark_reported(&mut self, events: TrackEvents) {
        self.events_shadow |= events;
    }
}
