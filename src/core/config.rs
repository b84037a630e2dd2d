use crate::core::{PlayerError, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// 引擎配置
///
/// 缓冲池容量在一次会话内固定，池耗尽是系统唯一的背压信号。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// 视频帧缓冲数量
    pub video_frame_capacity: usize,
    /// 音频帧缓冲数量
    pub audio_frame_capacity: usize,
    /// 压缩包缓冲数量（音视频共用）
    pub packet_capacity: usize,
    /// 每路包队列最多在途的包数
    pub max_packet_queue: usize,
    /// 音频输出内部队列最多在途的缓冲数
    pub max_audio_queue_count: usize,
    /// 流结束时在最后一帧之后额外等待的时间（毫秒）
    pub render_end_tail_ms: i64,
    /// seek 时为找到目标帧最多解码的帧数
    pub seek_max_decode_frames: usize,
    /// 超过该时间没有任何渲染视为卡顿（毫秒）
    pub stall_threshold_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            video_frame_capacity: 6,
            audio_frame_capacity: 12,
            packet_capacity: 64,
            max_packet_queue: 32,
            max_audio_queue_count: 4,
            render_end_tail_ms: 50,
            seek_max_decode_frames: 240,
            stall_threshold_ms: 2000,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载配置
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&text)?;
        info!("📝 已加载引擎配置: {}", path.display());
        Ok(config)
    }

    /// 播放中超过该时长没有渲染即视为卡顿
    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn validate(&self) -> Result<()> {
        let capacities = [
            ("video_frame_capacity", self.video_frame_capacity),
            ("audio_frame_capacity", self.audio_frame_capacity),
            ("packet_capacity", self.packet_capacity),
            ("max_packet_queue", self.max_packet_queue),
            ("max_audio_queue_count", self.max_audio_queue_count),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(PlayerError::Config(format!("{} 不能为 0", name)));
            }
        }
        if self.render_end_tail_ms < 0 {
            return Err(PlayerError::Config("render_end_tail_ms 不能为负数".to_string()));
        }
        if self.stall_threshold_ms == 0 {
            return Err(PlayerError::Config("stall_threshold_ms 不能为 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "video_frame_capacity": 3 }"#).unwrap();
        assert_eq!(config.video_frame_capacity, 3);
        assert_eq!(config.render_end_tail_ms, 50);
        assert_eq!(config.max_audio_queue_count, 4);
        assert_eq!(config.stall_threshold(), Duration::from_secs(2));
    }

    #[test]
    fn test_stall_threshold_from_json() {
        let config = EngineConfig::from_json_str(r#"{ "stall_threshold_ms": 750 }"#).unwrap();
        assert_eq!(config.stall_threshold(), Duration::from_millis(750));
        assert!(EngineConfig::from_json_str(r#"{ "stall_threshold_ms": 0 }"#).is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "packet_capacity": 0 }"#).unwrap_err();
        assert!(matches!(err, PlayerError::Config(_)));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            EngineConfig::from_json_str("{ not json"),
            Err(PlayerError::JsonError(_))
        ));
    }
}
