//! 进程内的合成解码器与输出端
//!
//! 不依赖任何媒体库，按脚本生成包和帧；用于测试和演示程序。视频帧第一个
//! 平面、音频帧和压缩包的前 8 个字节都写入小端 pts，输出端据此还原帧序。

use crate::core::{
    BufferResult, MediaBuffer, MediaInfo, PixelFormat, PlayerError, Result, StreamKind, VideoStreamInfo,
    AudioStreamInfo,
};
use crate::player::native::{
    AudioConsumed, AudioSink, EnqueueResult, FrameConsumed, FrameStatus, NativeDecoder, PlayerListener,
    ReadPacketResult, VideoSink,
};
use crate::player::state::PlayerState;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// 一条合成轨道：等间隔的帧
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyntheticTrack {
    pub frame_count: usize,
    pub interval_ms: i64,
}

impl SyntheticTrack {
    fn duration(&self) -> i64 {
        self.frame_count as i64 * self.interval_ms
    }
}

/// 合成媒体描述
#[derive(Debug, Clone)]
pub struct SyntheticMedia {
    pub video: Option<SyntheticTrack>,
    pub audio: Option<SyntheticTrack>,
    pub pixel_format: PixelFormat,
    pub width: u32,
    pub height: u32,
    /// seek 落在目标之前最近的关键帧
    pub keyframe_interval: usize,
    /// 这些 pts 的视频帧解码失败（可恢复）
    pub corrupt_video_pts: Vec<i64>,
    /// 解码到该 pts 的视频帧时流不可用
    pub fatal_video_pts: Option<i64>,
    pub fail_open: bool,
}

impl SyntheticMedia {
    pub fn av(video_frames: usize, video_interval_ms: i64, audio_frames: usize, audio_interval_ms: i64) -> Self {
        Self {
            video: Some(SyntheticTrack {
                frame_count: video_frames,
                interval_ms: video_interval_ms,
            }),
            audio: Some(SyntheticTrack {
                frame_count: audio_frames,
                interval_ms: audio_interval_ms,
            }),
            pixel_format: PixelFormat::Yuv420p,
            width: 16,
            height: 8,
            keyframe_interval: 5,
            corrupt_video_pts: Vec::new(),
            fatal_video_pts: None,
            fail_open: false,
        }
    }

    pub fn video_only(frames: usize, interval_ms: i64) -> Self {
        Self {
            audio: None,
            ..Self::av(frames, interval_ms, 0, interval_ms)
        }
    }

    pub fn audio_only(frames: usize, interval_ms: i64) -> Self {
        Self {
            video: None,
            ..Self::av(0, interval_ms, frames, interval_ms)
        }
    }

    pub fn duration(&self) -> i64 {
        let video = self.video.map(|t| t.duration()).unwrap_or(0);
        let audio = self.audio.map(|t| t.duration()).unwrap_or(0);
        video.max(audio)
    }

    fn track(&self, stream: StreamKind) -> Option<SyntheticTrack> {
        match stream {
            StreamKind::Video => self.video,
            StreamKind::Audio => self.audio,
        }
    }

    fn media_info(&self) -> MediaInfo {
        let mut metadata = BTreeMap::new();
        metadata.insert("title".to_string(), "synthetic".to_string());
        MediaInfo {
            duration: self.duration(),
            metadata,
            video: self.video.map(|t| VideoStreamInfo {
                width: self.width,
                height: self.height,
                fps: 1000.0 / t.interval_ms.max(1) as f64,
                codec: "synthetic".to_string(),
                bitrate: 0,
                pixel_format: self.pixel_format,
            }),
            audio: self.audio.map(|_| AudioStreamInfo {
                channels: 2,
                sample_rate: 48_000,
                bits_per_sample: 16,
                codec: "synthetic".to_string(),
                bitrate: 0,
            }),
        }
    }
}

fn stream_slot(stream: StreamKind) -> usize {
    match stream {
        StreamKind::Video => 0,
        StreamKind::Audio => 1,
    }
}

fn pts_prefix(bytes: &[u8]) -> Option<i64> {
    let head: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(i64::from_le_bytes(head))
}

/// 合成解码器的调用记录
#[derive(Debug, Default)]
pub struct SyntheticStats {
    pub seeks: Mutex<Vec<i64>>,
    pub closed: Mutex<bool>,
}

/// 按脚本产生包和帧的解码器（一包一帧，无内部延迟）
pub struct SyntheticDecoder {
    media: SyntheticMedia,
    opened: bool,
    next_index: [usize; 2],
    codec_input: [VecDeque<i64>; 2],
    draining: [bool; 2],
    stats: Arc<SyntheticStats>,
}

impl SyntheticDecoder {
    pub fn new(media: SyntheticMedia) -> Self {
        Self {
            media,
            opened: false,
            next_index: [0, 0],
            codec_input: [VecDeque::new(), VecDeque::new()],
            draining: [false, false],
            stats: Arc::new(SyntheticStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        self.stats.clone()
    }

    fn next_pts(&self, stream: StreamKind) -> Option<i64> {
        let track = self.media.track(stream)?;
        let index = self.next_index[stream_slot(stream)];
        (index < track.frame_count).then(|| index as i64 * track.interval_ms)
    }

    fn fill_frame(&self, stream: StreamKind, pts: i64, frame: &mut MediaBuffer) {
        let interval = self.media.track(stream).map(|t| t.interval_ms).unwrap_or(0);
        frame.pts = pts;
        frame.duration = interval;
        frame.result = BufferResult::Success;
        let stamp = pts.to_le_bytes();
        match stream {
            StreamKind::Video => {
                let (width, height, format) = (self.media.width, self.media.height, self.media.pixel_format);
                let luma = (width * height) as usize;
                let sizes = match format {
                    PixelFormat::Yuv420p => [luma, luma / 4, luma / 4],
                    PixelFormat::Nv12 | PixelFormat::Nv21 => [luma, luma / 2, 0],
                    PixelFormat::Rgba => [luma * 4, 0, 0],
                };
                if let Some(picture) = frame.video_mut() {
                    picture.width = width;
                    picture.height = height;
                    picture.format = format;
                    for (plane, size) in picture.planes.iter_mut().zip(sizes) {
                        plane.clear();
                        plane.resize(size, 0x80);
                    }
                    if let Some(head) = picture.planes[0].get_mut(..8) {
                        head.copy_from_slice(&stamp);
                    }
                }
                frame.size = sizes.iter().sum();
            }
            StreamKind::Audio => {
                if let Some(pcm) = frame.bytes_mut() {
                    pcm.clear();
                    pcm.extend_from_slice(&stamp);
                    pcm.resize(64, 0);
                }
                frame.size = 64;
            }
        }
    }
}

impl NativeDecoder for SyntheticDecoder {
    fn open(&mut self, source: &str) -> Result<MediaInfo> {
        if self.media.fail_open || source.is_empty() {
            return Err(PlayerError::FatalPrepareFailure(format!("无法打开合成媒体: {:?}", source)));
        }
        self.opened = true;
        Ok(self.media.media_info())
    }

    fn read_packet(&mut self, packet: &mut MediaBuffer) -> Result<ReadPacketResult> {
        if !self.opened {
            return Err(PlayerError::FatalDecodeFailure("解码器未打开".to_string()));
        }
        let stream = match (self.next_pts(StreamKind::Video), self.next_pts(StreamKind::Audio)) {
            (Some(v), Some(a)) if a < v => StreamKind::Audio,
            (Some(_), _) => StreamKind::Video,
            (None, Some(_)) => StreamKind::Audio,
            (None, None) => return Ok(ReadPacketResult::EndOfStream),
        };
        let pts = self.next_pts(stream).unwrap_or_default();
        self.next_index[stream_slot(stream)] += 1;

        packet.pts = pts;
        packet.duration = self.media.track(stream).map(|t| t.interval_ms).unwrap_or(0);
        packet.result = BufferResult::Success;
        if let Some(bytes) = packet.bytes_mut() {
            bytes.clear();
            bytes.extend_from_slice(&pts.to_le_bytes());
        }
        packet.size = 8;
        Ok(ReadPacketResult::Packet(stream))
    }

    fn send_packet(&mut self, stream: StreamKind, packet: Option<&MediaBuffer>) -> Result<()> {
        let slot = stream_slot(stream);
        match packet {
            Some(packet) => {
                let pts = packet.bytes().and_then(pts_prefix).unwrap_or(packet.pts);
                self.codec_input[slot].push_back(pts);
            }
            None => self.draining[slot] = true,
        }
        Ok(())
    }

    fn receive_frame(&mut self, stream: StreamKind, frame: &mut MediaBuffer) -> Result<FrameStatus> {
        let slot = stream_slot(stream);
        let Some(pts) = self.codec_input[slot].pop_front() else {
            return Ok(if self.draining[slot] {
                FrameStatus::EndOfStream
            } else {
                FrameStatus::NeedMorePacket
            });
        };
        if stream == StreamKind::Video {
            if self.media.fatal_video_pts == Some(pts) {
                return Err(PlayerError::FatalDecodeFailure(format!("视频流在 {}ms 处不可用", pts)));
            }
            if self.media.corrupt_video_pts.contains(&pts) {
                return Err(PlayerError::DecodeFailure(format!("视频帧 {}ms 损坏", pts)));
            }
        }
        self.fill_frame(stream, pts, frame);
        Ok(FrameStatus::Frame)
    }

    fn flush_codec(&mut self, stream: StreamKind) {
        let slot = stream_slot(stream);
        self.codec_input[slot].clear();
        self.draining[slot] = false;
    }

    fn seek(&mut self, target_ms: i64) -> Result<()> {
        if !self.opened {
            return Err(PlayerError::FatalDecodeFailure("解码器未打开".to_string()));
        }
        let target = target_ms.max(0);
        for stream in [StreamKind::Video, StreamKind::Audio] {
            if let Some(track) = self.media.track(stream) {
                let mut index = ((target / track.interval_ms.max(1)) as usize).min(track.frame_count);
                if stream == StreamKind::Video && index < track.frame_count {
                    index -= index % self.media.keyframe_interval.max(1);
                }
                self.next_index[stream_slot(stream)] = index;
            }
        }
        self.stats.seeks.lock().push(target);
        Ok(())
    }

    fn close(&mut self) {
        self.opened = false;
        *self.stats.closed.lock() = true;
    }

    fn description(&self) -> String {
        format!(
            "synthetic(duration={}ms, video={:?}, audio={:?})",
            self.media.duration(),
            self.media.video,
            self.media.audio
        )
    }
}

/// 视频输出记录的一帧
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub plane_count: usize,
    /// 经由 `render_packed_frame` 交付
    pub packed: bool,
    pub at: Instant,
}

/// 记录每一帧的视频输出端（克隆共享同一份记录）
#[derive(Clone, Default)]
pub struct RecordingVideoSink {
    frames: Arc<Mutex<Vec<RenderedFrame>>>,
}

impl RecordingVideoSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frames(&self) -> Vec<RenderedFrame> {
        self.frames.lock().clone()
    }

    pub fn rendered_pts(&self) -> Vec<i64> {
        self.frames.lock().iter().map(|f| f.pts).collect()
    }

    fn record(&self, width: u32, height: u32, format: PixelFormat, planes: &[Vec<u8>], packed: bool) {
        let pts = planes.first().and_then(|p| pts_prefix(p)).unwrap_or(-1);
        self.frames.lock().push(RenderedFrame {
            pts,
            width,
            height,
            format,
            plane_count: planes.len(),
            packed,
            at: Instant::now(),
        });
    }
}

impl VideoSink for RecordingVideoSink {
    fn render_planar_frame(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Vec<u8>>,
        on_consumed: FrameConsumed,
    ) {
        self.record(width, height, format, &planes, false);
        on_consumed.consumed(planes);
    }

    fn render_packed_frame(&mut self, width: u32, height: u32, bytes: Vec<u8>, on_consumed: FrameConsumed) {
        let planes = vec![bytes];
        self.record(width, height, PixelFormat::Rgba, &planes, true);
        on_consumed.consumed(planes);
    }
}

/// 音频输出端的消费方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSinkMode {
    /// 播放状态下入队即消费
    Immediate,
    /// 由测试调用 `consume_one` 消费
    Manual,
}

struct AudioSinkState {
    mode: AudioSinkMode,
    on_consumed: Option<AudioConsumed>,
    /// (pts, 入队时的纪元)
    queue: VecDeque<(i64, u64)>,
    accepted: Vec<i64>,
    playing: bool,
    released: bool,
    reject_remaining: usize,
}

/// 合成音频输出端（克隆共享同一份状态）
#[derive(Clone)]
pub struct SyntheticAudioSink {
    state: Arc<Mutex<AudioSinkState>>,
}

impl SyntheticAudioSink {
    pub fn new(mode: AudioSinkMode) -> Self {
        Self {
            state: Arc::new(Mutex::new(AudioSinkState {
                mode,
                on_consumed: None,
                queue: VecDeque::new(),
                accepted: Vec::new(),
                playing: false,
                released: false,
                reject_remaining: 0,
            })),
        }
    }

    /// 接下来的 `count` 个缓冲会被拒绝
    pub fn reject_next(&self, count: usize) {
        self.state.lock().reject_remaining = count;
    }

    pub fn accepted(&self) -> Vec<i64> {
        self.state.lock().accepted.clone()
    }

    pub fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    /// 消费最早的一个缓冲并回调
    pub fn consume_one(&self) -> Option<i64> {
        let (entry, on_consumed) = {
            let mut state = self.state.lock();
            let entry = state.queue.pop_front()?;
            (entry, state.on_consumed.clone())
        };
        let (pts, epoch) = entry;
        if let Some(on_consumed) = on_consumed {
            on_consumed.notify(epoch);
        }
        Some(pts)
    }

    fn drain_if_immediate(&self) {
        let (consumed, on_consumed) = {
            let mut state = self.state.lock();
            if state.mode != AudioSinkMode::Immediate || !state.playing {
                return;
            }
            let consumed: Vec<(i64, u64)> = state.queue.drain(..).collect();
            (consumed, state.on_consumed.clone())
        };
        if let Some(on_consumed) = on_consumed {
            for (_, epoch) in consumed {
                on_consumed.notify(epoch);
            }
        }
    }
}

impl AudioSink for SyntheticAudioSink {
    fn attach(&mut self, on_consumed: AudioConsumed) {
        self.state.lock().on_consumed = Some(on_consumed);
    }

    fn enqueue(&mut self, _pcm: &[u8], pts: i64) -> EnqueueResult {
        {
            let mut state = self.state.lock();
            if state.released {
                return EnqueueResult::Rejected;
            }
            if state.reject_remaining > 0 {
                state.reject_remaining -= 1;
                return EnqueueResult::Rejected;
            }
            let epoch = state.on_consumed.as_ref().map(|c| c.epoch()).unwrap_or(0);
            state.accepted.push(pts);
            state.queue.push_back((pts, epoch));
        }
        self.drain_if_immediate();
        EnqueueResult::Accepted
    }

    fn queue_depth(&self) -> usize {
        self.state.lock().queue.len()
    }

    fn play(&mut self) {
        self.state.lock().playing = true;
        self.drain_if_immediate();
    }

    fn pause(&mut self) {
        self.state.lock().playing = false;
    }

    fn stop(&mut self) {
        self.state.lock().playing = false;
    }

    fn flush(&mut self) {
        self.state.lock().queue.clear();
    }

    fn release(&mut self) {
        let mut state = self.state.lock();
        state.released = true;
        state.playing = false;
        state.queue.clear();
    }
}

/// 收集所有回调的监听器
#[derive(Default)]
pub struct CollectingListener {
    states: Mutex<Vec<PlayerState>>,
    progress: Mutex<Vec<(i64, i64)>>,
}

impl CollectingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states(&self) -> Vec<PlayerState> {
        self.states.lock().clone()
    }

    pub fn state_names(&self) -> Vec<&'static str> {
        self.states.lock().iter().map(|s| s.name()).collect()
    }

    pub fn progress(&self) -> Vec<(i64, i64)> {
        self.progress.lock().clone()
    }

    /// 轮询等待最新状态满足条件
    pub fn wait_for(&self, timeout: Duration, predicate: impl Fn(&PlayerState) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.states.lock().last().map(&predicate).unwrap_or(false) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }
}

impl PlayerListener for CollectingListener {
    fn on_player_state(&self, state: &PlayerState) {
        self.states.lock().push(state.clone());
    }

    fn on_progress(&self, position_ms: i64, duration_ms: i64) {
        self.progress.lock().push((position_ms, duration_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BufferKind;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_seek_lands_on_keyframe() {
        let mut decoder = SyntheticDecoder::new(SyntheticMedia::video_only(20, 40));
        decoder.open("synthetic://seek").unwrap();
        decoder.seek(500).unwrap();
        // 500 / 40 = 12，回退到关键帧 10
        let mut packet = MediaBuffer::new(BufferKind::Packet);
        assert_eq!(decoder.read_packet(&mut packet).unwrap(), ReadPacketResult::Packet(StreamKind::Video));
        assert_eq!(packet.pts, 400);
        assert_eq!(*decoder.stats().seeks.lock(), vec![500]);
    }

    #[test]
    fn test_send_receive_drain() {
        let mut decoder = SyntheticDecoder::new(SyntheticMedia::audio_only(2, 20));
        decoder.open("synthetic://drain").unwrap();
        let mut packet = MediaBuffer::new(BufferKind::Packet);
        let mut frame = MediaBuffer::new(BufferKind::Audio);
        assert_eq!(decoder.receive_frame(StreamKind::Audio, &mut frame).unwrap(), FrameStatus::NeedMorePacket);
        decoder.read_packet(&mut packet).unwrap();
        decoder.send_packet(StreamKind::Audio, Some(&packet)).unwrap();
        assert_eq!(decoder.receive_frame(StreamKind::Audio, &mut frame).unwrap(), FrameStatus::Frame);
        assert_eq!(frame.pts, 0);
        decoder.send_packet(StreamKind::Audio, None).unwrap();
        assert_eq!(decoder.receive_frame(StreamKind::Audio, &mut frame).unwrap(), FrameStatus::EndOfStream);
    }

    #[test]
    fn test_manual_audio_sink_notifies_per_buffer() {
        let mut sink = SyntheticAudioSink::new(AudioSinkMode::Manual);
        let epoch = Arc::new(AtomicU64::new(3));
        let hits = Arc::new(Mutex::new(Vec::new()));
        let counter = hits.clone();
        sink.attach(AudioConsumed::new(epoch.clone(), move |e| counter.lock().push(e)));
        sink.reject_next(1);
        assert_eq!(sink.enqueue(&[], 0), EnqueueResult::Rejected);
        assert_eq!(sink.enqueue(&[], 20), EnqueueResult::Accepted);
        epoch.store(4, Ordering::SeqCst);
        assert_eq!(sink.enqueue(&[], 40), EnqueueResult::Accepted);
        assert_eq!(sink.queue_depth(), 2);
        assert_eq!(sink.consume_one(), Some(20));
        assert_eq!(sink.consume_one(), Some(40));
        // 回调带回的是入队时的纪元
        assert_eq!(*hits.lock(), vec![3, 4]);
        assert_eq!(sink.consume_one(), None);
    }
}
