use thiserror::Error;

use crate::core::BufferKind;

#[derive(Error, Debug)]
pub enum PlayerError {
    /// 缓冲池耗尽（瞬时状态，调用方退避即可，不会上报给用户）
    #[error("缓冲池已耗尽: {0:?}")]
    ResourceExhausted(BufferKind),

    /// 单个缓冲解码失败：记录日志并丢弃该缓冲，播放继续
    #[error("解码错误: {0}")]
    DecodeFailure(String),

    /// 媒体源无法打开
    #[error("无法打开媒体源: {0}")]
    FatalPrepareFailure(String),

    /// 播放中途媒体流不可用
    #[error("解码器不可恢复错误: {0}")]
    FatalDecodeFailure(String),

    /// 音视频输出拒绝了缓冲
    #[error("输出端拒绝缓冲: {0}")]
    SinkRejection(String),

    /// 句柄已被强制回收（seek/stop 后的旧句柄）
    #[error("过期的缓冲句柄: {kind:?}#{index}")]
    StaleBuffer { kind: BufferKind, index: u32 },

    /// 缓冲归属审计失败（同一缓冲出现在两个队列等）
    #[error("缓冲归属错误: {0}")]
    OwnershipViolation(String),

    #[error("非法状态转换: {0}")]
    InvalidTransition(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("线程错误: {0}")]
    Thread(String),

    #[error("IO 错误: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON 错误: {0}")]
    JsonError(#[from] serde_json::Error),

    #[cfg(feature = "ffmpeg")]
    #[error("FFmpeg 错误: {0}")]
    FFmpegError(#[from] ffmpeg_next::Error),
}

impl PlayerError {
    /// 是否会导致播放无法继续（需要上报为 Error 状态）
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PlayerError::FatalPrepareFailure(_) | PlayerError::FatalDecodeFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PlayerError>;
