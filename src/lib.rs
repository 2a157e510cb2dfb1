pub mod config; // 引擎配置参数
pub mod error; // 帧级错误
pub mod event; // 扫描事件编码
pub mod types; // 公共几何类型

pub mod blobs; // 色块分割、合成与跟踪
pub mod line; // 线网格、拓扑、条码与主向量
pub mod tracking; // 通用身份跟踪器

pub mod pipeline; // 事件队列、上下文与结果发布
pub mod synth; // 合成场景

pub use crate::config::{BlobConfig, LineConfig, Program, VisionConfig};
pub use crate::error::{FrameError, Result};
pub use crate::event::ScanEvent;
pub use crate::pipeline::{event_queue, Detections, VisionContext};
pub use crate::tracking::{TrackState, Tracker, TrackerSet};
