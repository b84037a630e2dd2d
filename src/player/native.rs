use crate::core::{MediaBuffer, MediaInfo, PixelFormat, Result, StreamKind};
use crate::player::buffer_pool::PlaneBufferPool;
use crate::player::state::PlayerState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 读包结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPacketResult {
    /// 读到一个属于该流的包
    Packet(StreamKind),
    /// 读到的包不属于需要的流，或需要再读一次
    NeedMore,
    /// 到达文件末尾
    EndOfStream,
}

/// 从解码器取帧的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    Frame,
    NeedMorePacket,
    EndOfStream,
}

/// 原生解码器抽象接口（解封装 + 解码 + 格式转换）
///
/// 不同实现（FFmpeg、测试替身等）都实现这个 trait。解码采用
/// send/receive 模型：`send_packet(None)` 表示送入排空信号。
pub trait NativeDecoder: Send {
    /// 打开媒体源
    fn open(&mut self, source: &str) -> Result<MediaInfo>;

    /// 读取下一个压缩包到 `packet`
    fn read_packet(&mut self, packet: &mut MediaBuffer) -> Result<ReadPacketResult>;

    /// 送入一个压缩包
    fn send_packet(&mut self, stream: StreamKind, packet: Option<&MediaBuffer>) -> Result<()>;

    /// 取出一帧写入 `frame`
    ///
    /// 单帧失败返回 `DecodeFailure`，流不可用返回 `FatalDecodeFailure`。
    fn receive_frame(&mut self, stream: StreamKind, frame: &mut MediaBuffer) -> Result<FrameStatus>;

    /// 丢弃解码器内部缓存的帧（seek 后使用）
    fn flush_codec(&mut self, stream: StreamKind);

    /// Seek 到指定位置（毫秒）
    fn seek(&mut self, target_ms: i64) -> Result<()>;

    fn close(&mut self);

    /// 获取描述信息（用于调试）
    fn description(&self) -> String {
        "native decoder".to_string()
    }
}

/// 视频帧被输出端消费后的回调
///
/// 消费自身，保证每次渲染最多回调一次；回调时把平面字节还给复用池。
pub struct FrameConsumed {
    planes: Arc<PlaneBufferPool>,
}

impl FrameConsumed {
    pub fn new(planes: Arc<PlaneBufferPool>) -> Self {
        Self { planes }
    }

    pub fn consumed(self, planes: Vec<Vec<u8>>) {
        for plane in planes {
            self.planes.recycle(plane);
        }
    }
}

/// 视频输出端（显示表面 + 像素上传）
pub trait VideoSink: Send {
    /// 平面格式：YUV420P 三个平面，NV12/NV21 两个平面
    fn render_planar_frame(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Vec<u8>>,
        on_consumed: FrameConsumed,
    );

    /// 打包格式（RGBA）
    fn render_packed_frame(&mut self, width: u32, height: u32, bytes: Vec<u8>, on_consumed: FrameConsumed);
}

/// 音频输出端接受缓冲的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Accepted,
    Rejected,
}

/// 音频输出端消费完一个缓冲时调用
///
/// 渲染侧每次 flush 都会推进纪元。输出端在接受缓冲时用 [`epoch`](Self::epoch)
/// 记下当时的纪元，消费完后原样带回；flush 之前的缓冲迟到的回调因此可以被识别并丢弃。
#[derive(Clone)]
pub struct AudioConsumed {
    epoch: Arc<AtomicU64>,
    notify: Arc<dyn Fn(u64) + Send + Sync>,
}

impl AudioConsumed {
    pub fn new(epoch: Arc<AtomicU64>, notify: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            epoch,
            notify: Arc::new(notify),
        }
    }

    /// 当前的 flush 纪元
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// `epoch` 为该缓冲入队时的纪元
    pub fn notify(&self, epoch: u64) {
        (self.notify)(epoch)
    }
}

/// 音频输出端
pub trait AudioSink: Send {
    /// 注册消费回调，每个被接受的缓冲消费完后带着它入队时的纪元回调一次
    fn attach(&mut self, on_consumed: AudioConsumed);

    fn enqueue(&mut self, pcm: &[u8], pts: i64) -> EnqueueResult;

    /// 内部队列中尚未消费的缓冲数
    fn queue_depth(&self) -> usize;

    fn play(&mut self);
    fn pause(&mut self);
    fn stop(&mut self);
    /// 丢弃内部队列，被丢弃的缓冲不再回调
    fn flush(&mut self);
    fn release(&mut self);
}

/// 播放器状态 / 进度监听
pub trait PlayerListener: Send + Sync {
    fn on_player_state(&self, state: &PlayerState);
    fn on_progress(&self, position_ms: i64, duration_ms: i64);
}
