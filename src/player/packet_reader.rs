use crate::core::StreamKind;
use crate::player::buffer_pool::{BufferHandle, BufferManager};
use crate::player::native::{NativeDecoder, ReadPacketResult};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

/// 单个流的压缩包队列（有界）
pub struct PacketQueue {
    stream: StreamKind,
    packets: VecDeque<BufferHandle>,
    max_in_flight: usize,
    closed: bool,
}

impl PacketQueue {
    pub fn new(stream: StreamKind, max_in_flight: usize) -> Self {
        Self {
            stream,
            packets: VecDeque::with_capacity(max_in_flight),
            max_in_flight,
            closed: false,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn push(&mut self, packet: BufferHandle) {
        self.packets.push_back(packet);
    }

    pub fn pop(&mut self) -> Option<BufferHandle> {
        self.packets.pop_front()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.packets.len() >= self.max_in_flight
    }

    /// 文件读完后关闭，队列排空即表示该流的包全部送出
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// 丢弃所有包并归还到缓冲池，同时重新打开队列
    pub fn flush(&mut self, buffers: &BufferManager) -> usize {
        let count = self.packets.len();
        for packet in self.packets.drain(..) {
            buffers.packet().recycle(packet);
        }
        self.closed = false;
        count
    }
}

/// 单次读包的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// 包已放入对应流的队列
    Queued(StreamKind),
    /// 读到的包被丢弃（不需要的流），可以继续读
    Dropped,
    /// 没有空闲包缓冲或队列已满，等待 packet_buffer_ready
    Skipped,
    Paused,
    /// 没有读请求
    Idle,
    EndOfStream,
}

/// 读包器：把原生解码器读出的压缩包放入各流的包队列
///
/// 只在解码线程中使用，不需要加锁。
pub struct PacketReader {
    buffers: Arc<BufferManager>,
    video: PacketQueue,
    audio: PacketQueue,
    has_video: bool,
    has_audio: bool,
    paused: bool,
    eof: bool,
    read_requested: bool,
    waiting_buffer: bool,
    video_packet_count: usize,
    audio_packet_count: usize,
}

impl PacketReader {
    pub fn new(buffers: Arc<BufferManager>, max_packet_queue: usize, has_video: bool, has_audio: bool) -> Self {
        Self {
            buffers,
            video: PacketQueue::new(StreamKind::Video, max_packet_queue),
            audio: PacketQueue::new(StreamKind::Audio, max_packet_queue),
            has_video,
            has_audio,
            paused: false,
            eof: false,
            read_requested: false,
            waiting_buffer: false,
            video_packet_count: 0,
            audio_packet_count: 0,
        }
    }

    fn queue_mut(&mut self, stream: StreamKind) -> &mut PacketQueue {
        match stream {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }

    pub fn queue(&self, stream: StreamKind) -> &PacketQueue {
        match stream {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }

    fn has_stream(&self, stream: StreamKind) -> bool {
        match stream {
            StreamKind::Video => self.has_video,
            StreamKind::Audio => self.has_audio,
        }
    }

    /// 安排一次读包
    pub fn request_read(&mut self) {
        if !self.eof {
            self.read_requested = true;
        }
    }

    /// 当前是否有可以执行的读请求
    pub fn wants_read(&self) -> bool {
        self.read_requested && !self.paused && !self.eof && !self.waiting_buffer
    }

    /// 有包缓冲被释放（空闲池或队列有了空位），恢复因背压跳过的读
    pub fn packet_buffer_ready(&mut self) {
        if self.waiting_buffer {
            self.waiting_buffer = false;
            self.request_read();
        }
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
        self.waiting_buffer = false;
        self.request_read();
    }

    /// 执行一次读包
    pub fn read_once(&mut self, native: &mut dyn NativeDecoder) -> ReadOutcome {
        self.read_once_for(native, &[StreamKind::Video, StreamKind::Audio])
    }

    /// 执行一次读包，只有 `limited` 中的流受队列上限约束
    ///
    /// seek 时已经找到目标帧的流不再限流，避免它占满队列后另一个流读不到包。
    pub fn read_once_for(&mut self, native: &mut dyn NativeDecoder, limited: &[StreamKind]) -> ReadOutcome {
        if self.paused {
            return ReadOutcome::Paused;
        }
        if self.eof {
            return ReadOutcome::EndOfStream;
        }
        if !self.read_requested {
            return ReadOutcome::Idle;
        }

        if limited.iter().any(|stream| self.queue(*stream).is_full()) {
            return self.skip();
        }
        let packet = match self.buffers.packet().acquire() {
            Ok(packet) => packet,
            Err(e) => {
                debug!("⏳ {}", e);
                return self.skip();
            }
        };

        let result = self
            .buffers
            .packet()
            .with_buffer_detached(&packet, |buffer| native.read_packet(buffer));
        let result = match result {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                // 读包出错按文件结束处理
                warn!("⚠️ 读包失败，按 EOF 处理: {}", e);
                ReadPacketResult::EndOfStream
            }
            Err(e) => {
                debug!("♻️ 包缓冲在读包期间被回收: {}", e);
                return ReadOutcome::Dropped;
            }
        };

        match result {
            ReadPacketResult::Packet(stream) if self.has_stream(stream) => {
                let count = match stream {
                    StreamKind::Video => {
                        self.video_packet_count += 1;
                        self.video_packet_count
                    }
                    StreamKind::Audio => {
                        self.audio_packet_count += 1;
                        self.audio_packet_count
                    }
                };
                if count <= 3 || count % 200 == 0 {
                    debug!("📦 读取 {:?} 包 #{}", stream, count);
                }
                self.queue_mut(stream).push(packet);
                ReadOutcome::Queued(stream)
            }
            ReadPacketResult::Packet(_) | ReadPacketResult::NeedMore => {
                self.buffers.packet().recycle(packet);
                ReadOutcome::Dropped
            }
            ReadPacketResult::EndOfStream => {
                self.buffers.packet().recycle(packet);
                self.eof = true;
                self.read_requested = false;
                self.video.close();
                self.audio.close();
                info!(
                    "📄 读包到达文件末尾（视频包 {}，音频包 {}）",
                    self.video_packet_count, self.audio_packet_count
                );
                ReadOutcome::EndOfStream
            }
        }
    }

    fn skip(&mut self) -> ReadOutcome {
        self.waiting_buffer = true;
        ReadOutcome::Skipped
    }

    /// 取出某个流最早的包
    pub fn pop_packet(&mut self, stream: StreamKind) -> Option<BufferHandle> {
        self.queue_mut(stream).pop()
    }

    /// 该流的包已全部送出且不会再有新包
    pub fn is_drained(&self, stream: StreamKind) -> bool {
        let queue = self.queue(stream);
        queue.is_closed() && queue.is_empty()
    }

    /// 清空两个包队列并重置读位置（seek 使用）
    pub fn flush(&mut self) {
        let video = self.video.flush(&self.buffers);
        let audio = self.audio.flush(&self.buffers);
        self.eof = false;
        self.waiting_buffer = false;
        self.video_packet_count = 0;
        self.audio_packet_count = 0;
        debug!("🧹 清空包队列：视频 {}，音频 {}", video, audio);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EngineConfig;
    use crate::player::synthetic::{SyntheticDecoder, SyntheticMedia};

    fn reader_with(packet_capacity: usize, max_queue: usize) -> (PacketReader, Arc<BufferManager>) {
        let config = EngineConfig {
            packet_capacity,
            ..Default::default()
        };
        let buffers = Arc::new(BufferManager::new(&config));
        (PacketReader::new(buffers.clone(), max_queue, true, true), buffers)
    }

    fn opened(media: SyntheticMedia) -> SyntheticDecoder {
        let mut decoder = SyntheticDecoder::new(media);
        decoder.open("synthetic://test").unwrap();
        decoder
    }

    #[test]
    fn test_reads_interleaved_packets_in_order() {
        let (mut reader, _buffers) = reader_with(16, 16);
        let mut decoder = opened(SyntheticMedia::av(3, 40, 3, 40));
        reader.request_read();
        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(reader.read_once(&mut decoder));
        }
        assert_eq!(outcomes.iter().filter(|o| **o == ReadOutcome::Queued(StreamKind::Video)).count(), 3);
        assert_eq!(reader.queue(StreamKind::Audio).len(), 3);
        assert_eq!(reader.read_once(&mut decoder), ReadOutcome::EndOfStream);
        assert!(reader.queue(StreamKind::Video).is_closed());
        assert!(!reader.wants_read());
    }

    #[test]
    fn test_skips_when_pool_exhausted_and_resumes() {
        let (mut reader, buffers) = reader_with(2, 16);
        let mut decoder = opened(SyntheticMedia::video_only(5, 40));
        reader.request_read();
        assert!(matches!(reader.read_once(&mut decoder), ReadOutcome::Queued(_)));
        assert!(matches!(reader.read_once(&mut decoder), ReadOutcome::Queued(_)));

        // 池耗尽：跳过而不是报错，也不会立即重试
        assert_eq!(reader.read_once(&mut decoder), ReadOutcome::Skipped);
        assert!(!reader.wants_read());

        let first = reader.pop_packet(StreamKind::Video).unwrap();
        assert_eq!(buffers.packet().pts(&first).unwrap(), 0);
        buffers.packet().recycle(first);
        reader.packet_buffer_ready();
        assert!(reader.wants_read());
        assert!(matches!(reader.read_once(&mut decoder), ReadOutcome::Queued(_)));

        // 没有丢包：剩下的包 pts 连续
        let mut pts = Vec::new();
        while let Some(p) = reader.pop_packet(StreamKind::Video) {
            pts.push(buffers.packet().pts(&p).unwrap());
            buffers.packet().recycle(p);
        }
        assert_eq!(pts, vec![40, 80]);
    }

    #[test]
    fn test_queue_limit_is_backpressure() {
        let (mut reader, _buffers) = reader_with(16, 2);
        let mut decoder = opened(SyntheticMedia::video_only(5, 40));
        reader.request_read();
        reader.read_once(&mut decoder);
        reader.read_once(&mut decoder);
        assert_eq!(reader.read_once(&mut decoder), ReadOutcome::Skipped);
        assert_eq!(reader.queue(StreamKind::Video).len(), 2);
    }

    #[test]
    fn test_queue_limit_only_applies_to_limited_streams() {
        let (mut reader, _buffers) = reader_with(16, 2);
        let mut decoder = opened(SyntheticMedia::av(2, 100, 10, 1));
        reader.request_read();
        // 音频不限流：队列超过上限后仍能读到后面的视频包
        let mut outcomes = Vec::new();
        for _ in 0..12 {
            outcomes.push(reader.read_once_for(&mut decoder, &[StreamKind::Video]));
        }
        assert!(!outcomes.contains(&ReadOutcome::Skipped));
        assert_eq!(reader.queue(StreamKind::Audio).len(), 10);
        assert_eq!(reader.queue(StreamKind::Video).len(), 2);

        // 恢复普通读包后，满的音频队列重新成为背压
        assert_eq!(reader.read_once(&mut decoder), ReadOutcome::Skipped);
    }

    #[test]
    fn test_pause_gates_reads_and_flush_returns_packets() {
        let (mut reader, buffers) = reader_with(8, 8);
        let mut decoder = opened(SyntheticMedia::video_only(5, 40));
        reader.request_read();
        reader.read_once(&mut decoder);
        reader.pause();
        assert_eq!(reader.read_once(&mut decoder), ReadOutcome::Paused);
        reader.resume();
        reader.read_once(&mut decoder);
        assert_eq!(buffers.packet().counts().pending_decode, 2);

        reader.flush();
        assert_eq!(buffers.packet().free_len(), 8);
        assert!(reader.queue(StreamKind::Video).is_empty());
        buffers.audit().unwrap();
    }

    #[test]
    fn test_packets_for_absent_stream_are_dropped() {
        let config = EngineConfig::default();
        let buffers = Arc::new(BufferManager::new(&config));
        let mut reader = PacketReader::new(buffers.clone(), 8, true, false);
        let mut decoder = opened(SyntheticMedia::av(1, 40, 1, 40));
        reader.request_read();
        let first = reader.read_once(&mut decoder);
        let second = reader.read_once(&mut decoder);
        assert!([first, second].contains(&ReadOutcome::Dropped));
        assert_eq!(reader.queue(StreamKind::Audio).len(), 0);
        assert_eq!(buffers.packet().counts().pending_decode, 1);
    }
}
