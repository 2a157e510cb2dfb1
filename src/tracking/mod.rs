//! 跨帧身份跟踪
//! Cross-frame identity tracking

pub mod assign;
pub mod tracker;

pub use assign::TrackerSet;
pub use tracker::{
    TrackEvents, TrackState, Tracker, TR_DEFAULT_LEADING_MS, TR_DEFAULT_TRAILING_MS,
    TR_FILTERING_MULTIPLIER, TR_MAXAGE, TR_MAXVAL,
};
