use crate::core::{BufferResult, BufferState, PlayerError, Result, StreamKind};
use crate::player::buffer_pool::{BufferHandle, BufferManager, BufferPool};
use crate::player::native::{FrameStatus, NativeDecoder};
use crate::player::packet_reader::PacketReader;
use log::{debug, info, warn};
use std::sync::Arc;

/// 单次解码的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// 解码出一帧，已放入就绪队列
    Success,
    /// 包队列为空，等待新包
    NeedMorePacket,
    /// 流结束标记已放入就绪队列（之后的调用也返回它）
    EndOfStream,
    /// 这一帧解码失败，缓冲已归还，流继续
    Error,
    /// 没有空闲帧缓冲，等待帧缓冲释放
    NoFreeBuffer,
    /// 早于 seek 目标的帧，缓冲已归还
    Dropped,
}

/// 单个流的解码调度
///
/// 采用 send/receive 模型：只在解码器要求输入时才送包；包队列关闭且
/// 排空后送一次排空信号，然后一直取帧直到流结束。
pub struct DecodeDispatcher {
    stream: StreamKind,
    buffers: Arc<BufferManager>,
    needs_packet: bool,
    drain_sent: bool,
    finished: bool,
    last_pts: i64,
    /// seek 没有找到目标帧时，早于该 pts 的帧直接丢弃
    skip_before: Option<i64>,
    decoded_count: u64,
    error_count: u64,
}

impl DecodeDispatcher {
    pub fn new(stream: StreamKind, buffers: Arc<BufferManager>) -> Self {
        Self {
            stream,
            buffers,
            needs_packet: true,
            drain_sent: false,
            finished: false,
            last_pts: 0,
            skip_before: None,
            decoded_count: 0,
            error_count: 0,
        }
    }

    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// 丢弃 pts 早于 `pts` 的帧，直到出现第一个不早于它的帧
    pub fn skip_before(&mut self, pts: i64) {
        self.skip_before = Some(pts);
    }

    /// 包队列为空且还会有新包：此时不占用帧缓冲
    fn waiting_packet(&self, reader: &PacketReader) -> bool {
        self.needs_packet
            && !self.drain_sent
            && reader.queue(self.stream).is_empty()
            && !reader.is_drained(self.stream)
    }

    fn frames(&self) -> &BufferPool {
        self.buffers.pool(self.stream.frame_kind())
    }

    /// 解码一帧并放入就绪队列
    ///
    /// 返回 Err 表示流不可用（需要上报为播放错误）。
    pub fn decode_next(&mut self, native: &mut dyn NativeDecoder, reader: &mut PacketReader) -> Result<DecodeResult> {
        let (result, frame) = self.decode_frame(native, reader)?;
        let Some(frame) = frame else {
            return Ok(result);
        };
        if let (DecodeResult::Success, Some(min_pts)) = (result, self.skip_before) {
            let pts = self.frames().pts(&frame).unwrap_or(min_pts);
            if pts < min_pts {
                self.frames().recycle(frame);
                return Ok(DecodeResult::Dropped);
            }
            self.skip_before = None;
        }
        if let Err(e) = self.frames().release(frame, BufferState::Ready) {
            debug!("♻️ {:?} 帧在解码期间被回收: {}", self.stream, e);
        }
        Ok(result)
    }

    /// 解码一帧，成功时把缓冲句柄交给调用方（仍处于 PendingDecode）
    ///
    /// EndOfStream 时返回结束标记缓冲；seek 用它挑选目标帧。
    pub fn decode_frame(
        &mut self,
        native: &mut dyn NativeDecoder,
        reader: &mut PacketReader,
    ) -> Result<(DecodeResult, Option<BufferHandle>)> {
        if self.finished {
            return Ok((DecodeResult::EndOfStream, None));
        }
        if self.waiting_packet(reader) {
            return Ok((DecodeResult::NeedMorePacket, None));
        }
        let frame = match self.frames().acquire() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("⏳ {:?} {}", self.stream, e);
                return Ok((DecodeResult::NoFreeBuffer, None));
            }
        };

        loop {
            if self.needs_packet && !self.drain_sent {
                if let Err(e) = self.feed_packet(native, reader) {
                    if e.is_fatal() {
                        self.frames().recycle(frame);
                        return Err(e);
                    }
                    // 坏包丢掉，继续取下一个
                    warn!("⚠️ {:?} 送包失败: {}", self.stream, e);
                    self.error_count += 1;
                    continue;
                }
                if self.needs_packet {
                    self.frames().recycle(frame);
                    return Ok((DecodeResult::NeedMorePacket, None));
                }
            }

            let stream = self.stream;
            let status = self
                .frames()
                .with_buffer_detached(&frame, |buffer| native.receive_frame(stream, buffer));
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    debug!("♻️ {:?} 帧在解码期间被回收: {}", self.stream, e);
                    return Ok((DecodeResult::Error, None));
                }
            };

            match status {
                Ok(FrameStatus::Frame) => {
                    self.decoded_count += 1;
                    self.last_pts = self.frames().pts(&frame).unwrap_or(self.last_pts);
                    return Ok((DecodeResult::Success, Some(frame)));
                }
                Ok(FrameStatus::NeedMorePacket) if !self.drain_sent => {
                    self.needs_packet = true;
                }
                Ok(FrameStatus::NeedMorePacket) | Ok(FrameStatus::EndOfStream) => {
                    return Ok((DecodeResult::EndOfStream, Some(self.finish(frame))));
                }
                Err(e) if e.is_fatal() => {
                    self.frames().recycle(frame);
                    return Err(e);
                }
                Err(e) => {
                    self.error_count += 1;
                    warn!("⚠️ {:?} 解码失败，丢弃该帧: {}", self.stream, e);
                    self.frames().recycle(frame);
                    return Ok((DecodeResult::Error, None));
                }
            }
        }
    }

    /// 送入一个包；包队列已关闭且为空时送排空信号
    fn feed_packet(&mut self, native: &mut dyn NativeDecoder, reader: &mut PacketReader) -> Result<()> {
        match reader.pop_packet(self.stream) {
            Some(packet) => {
                let stream = self.stream;
                let sent = self
                    .buffers
                    .packet()
                    .with_buffer_detached(&packet, |buffer| native.send_packet(stream, Some(buffer)));
                self.buffers.packet().recycle(packet);
                match sent {
                    Ok(result) => result?,
                    Err(e) => return Err(PlayerError::DecodeFailure(e.to_string())),
                }
                self.needs_packet = false;
            }
            None if reader.is_drained(self.stream) => {
                debug!("🚰 {:?} 包已全部送出，发送排空信号", self.stream);
                native.send_packet(self.stream, None)?;
                self.drain_sent = true;
                self.needs_packet = false;
            }
            None => {}
        }
        Ok(())
    }

    /// 把缓冲写成流结束标记
    fn finish(&mut self, frame: BufferHandle) -> BufferHandle {
        self.finished = true;
        self.skip_before = None;
        let last_pts = self.last_pts;
        let marked = self.frames().with_buffer_mut(&frame, |buffer| {
            buffer.reset();
            buffer.pts = last_pts;
            buffer.result = BufferResult::EndOfStream;
        });
        if let Err(e) = marked {
            debug!("♻️ {:?} 结束标记缓冲已失效: {}", self.stream, e);
        }
        info!(
            "🏁 {:?} 解码结束（{} 帧，{} 个错误）",
            self.stream, self.decoded_count, self.error_count
        );
        frame
    }

    /// 丢弃解码器内部状态（seek 后使用）
    pub fn flush(&mut self, native: &mut dyn NativeDecoder) {
        native.flush_codec(self.stream);
        self.needs_packet = true;
        self.drain_sent = false;
        self.finished = false;
        self.last_pts = 0;
        self.skip_before = None;
    }
}
