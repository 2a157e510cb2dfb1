/// 帧处理流水线 (Frame Pipeline)
///
/// 两线程架构, 通过固定容量的事件队列通信:
/// - Producer: 采集端, 逐行写入扫描事件 (独立线程)
/// - Consumer: 视觉上下文, 每次处理一整帧并发布结果
pub mod context;
pub mod event_queue;
pub mod publish;

pub use context::{ContextStats, Engine, VisionContext};
pub use event_queue::{event_queue, EventConsumer, EventProducer};
pub use publish::{Detections, Published};
