use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 基本流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    /// 该流解码后帧所在的缓冲池
    pub fn frame_kind(self) -> BufferKind {
        match self {
            StreamKind::Video => BufferKind::Video,
            StreamKind::Audio => BufferKind::Audio,
        }
    }
}

/// 缓冲池类型：视频帧、音频帧、压缩包
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BufferKind {
    Video,
    Audio,
    Packet,
}

/// 缓冲当前归属的逻辑队列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferState {
    Free,
    PendingDecode,
    Ready,
    Rendering,
}

/// 缓冲上的解码结果标记
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BufferResult {
    #[default]
    Empty,
    Success,
    /// 流结束标记帧，不包含可渲染数据
    EndOfStream,
    Error,
}

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Nv21,
    Rgba,
}

impl PixelFormat {
    /// 平面数量（RGBA 为单平面打包格式）
    pub fn plane_count(self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 | PixelFormat::Nv21 => 2,
            PixelFormat::Rgba => 1,
        }
    }

    pub fn is_planar(self) -> bool {
        !matches!(self, PixelFormat::Rgba)
    }
}

/// 解码后的视频图像（平面内存随缓冲复用）
#[derive(Debug, Clone)]
pub struct VideoPicture {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub planes: [Vec<u8>; 3],
}

impl Default for VideoPicture {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PixelFormat::Yuv420p,
            planes: [Vec::new(), Vec::new(), Vec::new()],
        }
    }
}

impl VideoPicture {
    /// 当前格式实际使用的平面
    pub fn active_planes(&self) -> &[Vec<u8>] {
        &self.planes[..self.format.plane_count()]
    }

    pub fn byte_size(&self) -> usize {
        self.active_planes().iter().map(|p| p.len()).sum()
    }
}

/// 缓冲负载，由外部解码器写入
#[derive(Debug, Clone)]
pub enum Payload {
    Packet(Vec<u8>),
    Video(VideoPicture),
    /// 交织 PCM 字节
    Audio(Vec<u8>),
}

/// 池化的媒体缓冲
#[derive(Debug, Clone)]
pub struct MediaBuffer {
    pub pts: i64,           // 显示时间戳（毫秒）
    pub duration: i64,      // 持续时间（毫秒）
    pub size: usize,        // 有效字节数
    pub result: BufferResult,
    pub payload: Payload,
}

impl MediaBuffer {
    /// 按池类型创建空缓冲
    pub fn new(kind: BufferKind) -> Self {
        let payload = match kind {
            BufferKind::Video => Payload::Video(VideoPicture::default()),
            BufferKind::Audio => Payload::Audio(Vec::new()),
            BufferKind::Packet => Payload::Packet(Vec::new()),
        };
        Self {
            pts: 0,
            duration: 0,
            size: 0,
            result: BufferResult::Empty,
            payload,
        }
    }

    /// 复用前清空（保留已分配的内存）
    pub fn reset(&mut self) {
        self.pts = 0;
        self.duration = 0;
        self.size = 0;
        self.result = BufferResult::Empty;
        match &mut self.payload {
            Payload::Packet(data) | Payload::Audio(data) => data.clear(),
            Payload::Video(picture) => {
                for plane in picture.planes.iter_mut() {
                    plane.clear();
                }
                picture.width = 0;
                picture.height = 0;
            }
        }
    }

    /// 是否为流结束标记
    pub fn is_last(&self) -> bool {
        self.result == BufferResult::EndOfStream
    }

    pub fn video(&self) -> Option<&VideoPicture> {
        match &self.payload {
            Payload::Video(picture) => Some(picture),
            _ => None,
        }
    }

    pub fn video_mut(&mut self) -> Option<&mut VideoPicture> {
        match &mut self.payload {
            Payload::Video(picture) => Some(picture),
            _ => None,
        }
    }

    /// 音频 PCM 或压缩包字节
    pub fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Packet(data) | Payload::Audio(data) => Some(data),
            Payload::Video(_) => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut Vec<u8>> {
        match &mut self.payload {
            Payload::Packet(data) | Payload::Audio(data) => Some(data),
            Payload::Video(_) => None,
        }
    }
}

/// 视频流信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStreamInfo {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    pub codec: String,
    pub bitrate: u64,
    pub pixel_format: PixelFormat,
}

/// 音频流信息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioStreamInfo {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub codec: String,
    pub bitrate: u64,
}

/// 媒体信息（prepare 成功后附着在播放器状态上）
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MediaInfo {
    pub duration: i64,          // 总时长（毫秒）
    pub metadata: BTreeMap<String, String>,
    pub video: Option<VideoStreamInfo>,
    pub audio: Option<AudioStreamInfo>,
}

impl MediaInfo {
    pub fn has_stream(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Video => self.video.is_some(),
            StreamKind::Audio => self.audio.is_some(),
        }
    }
}
