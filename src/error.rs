//! 错误类型
//! Frame-level error taxonomy

/// 帧处理结果
pub type Result<T> = std::result::Result<T, FrameError>;

/// 帧处理错误
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// 事件队列溢出, 本帧作废
    #[error("事件队列溢出 (queue overrun)")]
    Overrun,

    /// 等待事件超时, 本帧作废
    #[error("等待事件超时 ({0} ms)")]
    Timeout(u64),

    /// 事件源已断开
    #[error("事件源已断开")]
    Disconnected,

    /// 检测结果正在写入
    #[error("检测结果正在更新 (not ready)")]
    NotReady,

    /// 自上次读取后没有新帧
    #[error("没有新的帧数据")]
    NoNewData,

    /// 跟踪索引无效
    #[error("无效的跟踪索引: {0}")]
    InvalidIndex(u16),

    /// 当前状态不允许该操作
    #[error("操作无效: {0}")]
    InvalidState(&'static str),

    /// 上下文未打开
    #[error("视觉上下文未打开")]
    NotOpen,
}

impl FrameError {
    /// 是否为中止当前帧的错误 (跟踪器保持不变, 下一帧可继续)
    pub fn is_frame_abort(&self) -> bool {
        matches!(self, FrameError::Overrun | FrameError::Timeout(_))
    }

    /// 是否为读取方可以稍后重试的错误
    pub fn is_retryable(&self) -> bool {
        matches!(self, FrameError::NotReady | FrameError::NoNewData)
    }
}
