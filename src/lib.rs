//! myy_engine：播放器的缓冲生命周期与音画同步引擎
//!
//! 解码线程把压缩包和解码帧放进固定容量的缓冲池，渲染线程按时钟基准调度
//! 视频帧、按输出端队列深度投递音频，[`player::PlaybackManager`] 负责
//! prepare / play / pause / seek / stop / release。

pub mod core;
pub mod player;

pub use crate::core::{EngineConfig, MediaInfo, PlayerError, Result};
pub use crate::player::{PlaybackManager, PlayerComponents, PlayerListener, PlayerState};
