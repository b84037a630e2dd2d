//! 基于 FFmpeg 的原生解码器（feature `ffmpeg`）
//!
//! 压缩包字节拷贝进池化的包缓冲；视频统一输出 YUV420P 三平面，音频统一输出
//! 交织的 S16 PCM。

use crate::core::{
    AudioStreamInfo, BufferResult, MediaBuffer, MediaInfo, PixelFormat, PlayerError, Result, StreamKind,
    VideoStreamInfo,
};
use crate::player::native::{FrameStatus, NativeDecoder, ReadPacketResult};
use ffmpeg_next as ffmpeg;
use ffmpeg_next::{codec, format, media, software, util};
use log::{debug, info, warn};
use std::collections::BTreeMap;

/// 流时间基（秒）
fn time_base_of(stream: &format::stream::Stream) -> f64 {
    let tb = stream.time_base();
    if tb.denominator() == 0 {
        return 0.0;
    }
    tb.numerator() as f64 / tb.denominator() as f64
}

struct VideoCodec {
    index: usize,
    decoder: codec::decoder::Video,
    scaler: Option<software::scaling::Context>,
    time_base: f64,
}

impl VideoCodec {
    /// 转成 YUV420P 并按宽度紧密拷贝到三个平面
    fn write_frame(&mut self, frame: &util::frame::Video, buffer: &mut MediaBuffer) -> Result<()> {
        let width = frame.width();
        let height = frame.height();

        let converted;
        let source = if frame.format() == util::format::Pixel::YUV420P {
            frame
        } else {
            if self.scaler.is_none() {
                debug!("🔧 初始化像素转换: {:?} -> YUV420P ({}x{})", frame.format(), width, height);
                self.scaler = Some(software::scaling::Context::get(
                    frame.format(),
                    width,
                    height,
                    util::format::Pixel::YUV420P,
                    width,
                    height,
                    software::scaling::Flags::BILINEAR,
                )?);
            }
            let mut yuv = util::frame::Video::empty();
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(frame, &mut yuv)?;
            }
            converted = yuv;
            &converted
        };

        let chroma_width = (width as usize + 1) / 2;
        let chroma_height = (height as usize + 1) / 2;
        let sizes = [
            (width as usize, height as usize),
            (chroma_width, chroma_height),
            (chroma_width, chroma_height),
        ];

        buffer.pts = frame
            .timestamp()
            .map(|ts| (ts as f64 * self.time_base * 1000.0) as i64)
            .unwrap_or(0);
        buffer.result = BufferResult::Success;
        let picture = buffer
            .video_mut()
            .ok_or_else(|| PlayerError::DecodeFailure("视频帧写入了非视频缓冲".to_string()))?;
        picture.width = width;
        picture.height = height;
        picture.format = PixelFormat::Yuv420p;
        for (plane, (row_bytes, rows)) in sizes.into_iter().enumerate() {
            let stride = source.stride(plane);
            let data = source.data(plane);
            let dst = &mut picture.planes[plane];
            dst.clear();
            dst.reserve(row_bytes * rows);
            for y in 0..rows {
                let start = y * stride;
                match data.get(start..start + row_bytes) {
                    Some(row) => dst.extend_from_slice(row),
                    None => return Err(PlayerError::DecodeFailure(format!("平面 {} 数据不完整", plane))),
                }
            }
        }
        buffer.size = picture.byte_size();
        Ok(())
    }
}

struct AudioCodec {
    index: usize,
    decoder: codec::decoder::Audio,
    resampler: Option<software::resampling::Context>,
    time_base: f64,
    channels: u16,
    sample_rate: u32,
}

/// 音频输出格式：指定了输出端格式就用它，否则沿用源采样率并折成单声道 / 立体声
fn output_format(source_rate: u32, source_channels: u16, requested: Option<(u32, u16)>) -> (u32, u16) {
    match requested {
        Some((rate, channels)) if rate > 0 && channels > 0 => (rate, channels),
        _ => (source_rate, if source_channels == 1 { 1 } else { 2 }),
    }
}

impl AudioCodec {
    fn target_layout(&self) -> util::channel_layout::ChannelLayout {
        match self.channels {
            1 => util::channel_layout::ChannelLayout::MONO,
            2 => util::channel_layout::ChannelLayout::STEREO,
            n => util::channel_layout::ChannelLayout::default(n as i32),
        }
    }

    /// 重采样为输出端的采样率和声道数（交织 S16）
    fn write_frame(&mut self, frame: &util::frame::Audio, buffer: &mut MediaBuffer) -> Result<()> {
        if self.resampler.is_none() {
            debug!(
                "🔧 初始化音频重采样器: {:?} {}Hz/{}ch -> S16 packed {}Hz/{}ch",
                frame.format(),
                frame.rate(),
                frame.channels(),
                self.sample_rate,
                self.channels
            );
            self.resampler = Some(software::resampling::Context::get(
                frame.format(),
                frame.channel_layout(),
                frame.rate(),
                util::format::Sample::I16(util::format::sample::Type::Packed),
                self.target_layout(),
                self.sample_rate,
            )?);
        }
        let mut resampled = util::frame::Audio::empty();
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.run(frame, &mut resampled)?;
        }

        let byte_len = resampled.samples() * self.channels as usize * 2;
        let data = resampled.data(0);
        let pcm = data
            .get(..byte_len)
            .ok_or_else(|| PlayerError::DecodeFailure("重采样输出长度不足".to_string()))?;

        buffer.pts = frame
            .timestamp()
            .map(|ts| (ts as f64 * self.time_base * 1000.0) as i64)
            .unwrap_or(0);
        buffer.result = BufferResult::Success;
        let bytes = buffer
            .bytes_mut()
            .ok_or_else(|| PlayerError::DecodeFailure("音频帧写入了非音频缓冲".to_string()))?;
        bytes.clear();
        bytes.extend_from_slice(pcm);
        buffer.size = byte_len;
        Ok(())
    }
}

/// FFmpeg 解码器
pub struct FfmpegDecoder {
    input: Option<format::context::Input>,
    video: Option<VideoCodec>,
    audio: Option<AudioCodec>,
    /// 音频输出端实际使用的 (采样率, 声道数)
    audio_output: Option<(u32, u16)>,
    source: String,
}

// 转换上下文本身不是 Send；解码器只在解码线程中使用，创建后整体移交过去
unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn new() -> Self {
        Self {
            input: None,
            video: None,
            audio: None,
            audio_output: None,
            source: String::new(),
        }
    }

    /// 按输出端实际打开的格式重采样，避免变速变调
    pub fn with_audio_output(mut self, sample_rate: u32, channels: u16) -> Self {
        self.audio_output = Some((sample_rate, channels));
        self
    }

    fn open_video(stream: &format::stream::Stream) -> Result<(VideoCodec, VideoStreamInfo)> {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();
        let decoder = codec::context::Context::from_parameters(parameters)?.decoder().video()?;
        let fps = stream.avg_frame_rate();
        let fps = if fps.denominator() == 0 {
            0.0
        } else {
            fps.numerator() as f64 / fps.denominator() as f64
        };
        let info = VideoStreamInfo {
            width: decoder.width(),
            height: decoder.height(),
            fps,
            codec: codec_name,
            bitrate: decoder.bit_rate() as u64,
            pixel_format: PixelFormat::Yuv420p,
        };
        Ok((
            VideoCodec {
                index: stream.index(),
                decoder,
                scaler: None,
                time_base: time_base_of(stream),
            },
            info,
        ))
    }

    fn open_audio(
        stream: &format::stream::Stream,
        requested: Option<(u32, u16)>,
    ) -> Result<(AudioCodec, AudioStreamInfo)> {
        let parameters = stream.parameters();
        let codec_name = parameters.id().name().to_string();
        let decoder = codec::context::Context::from_parameters(parameters)?.decoder().audio()?;
        let (sample_rate, channels) = output_format(decoder.rate(), decoder.channels(), requested);
        if sample_rate != decoder.rate() {
            info!("🔊 音频 {}Hz 重采样到输出端的 {}Hz", decoder.rate(), sample_rate);
        }
        // 描述的是交给输出端的 PCM
        let info = AudioStreamInfo {
            channels,
            sample_rate,
            bits_per_sample: 16,
            codec: codec_name,
            bitrate: decoder.bit_rate() as u64,
        };
        Ok((
            AudioCodec {
                index: stream.index(),
                decoder,
                resampler: None,
                time_base: time_base_of(stream),
                channels,
                sample_rate,
            },
            info,
        ))
    }

    fn time_base(&self, stream: StreamKind) -> f64 {
        match stream {
            StreamKind::Video => self.video.as_ref().map(|c| c.time_base),
            StreamKind::Audio => self.audio.as_ref().map(|c| c.time_base),
        }
        .unwrap_or(0.0)
    }
}

impl Default for FfmpegDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeDecoder for FfmpegDecoder {
    fn open(&mut self, source: &str) -> Result<MediaInfo> {
        info!("正在打开文件: {}", source);
        ffmpeg::init().map_err(|e| PlayerError::FatalPrepareFailure(format!("FFmpeg 初始化失败: {}", e)))?;

        let input = format::input(&source)
            .map_err(|e| PlayerError::FatalPrepareFailure(format!("无法打开文件: {}", e)))?;

        let mut media_info = MediaInfo {
            duration: (input.duration() / 1000).max(0), // 微秒转毫秒
            metadata: BTreeMap::new(),
            video: None,
            audio: None,
        };
        for (key, value) in input.metadata().iter() {
            media_info.metadata.insert(key.to_string(), value.to_string());
        }

        if let Some(stream) = input.streams().best(media::Type::Video) {
            match Self::open_video(&stream) {
                Ok((codec, info)) => {
                    media_info.video = Some(info);
                    self.video = Some(codec);
                }
                Err(e) => warn!("⚠️ 视频流不可用，忽略: {}", e),
            }
        }
        if let Some(stream) = input.streams().best(media::Type::Audio) {
            match Self::open_audio(&stream, self.audio_output) {
                Ok((codec, info)) => {
                    media_info.audio = Some(info);
                    self.audio = Some(codec);
                }
                Err(e) => warn!("⚠️ 音频流不可用，忽略: {}", e),
            }
        }
        if self.video.is_none() && self.audio.is_none() {
            return Err(PlayerError::FatalPrepareFailure(format!("{} 中没有可解码的音视频流", source)));
        }

        debug!("视频流索引: {:?}", self.video.as_ref().map(|c| c.index));
        debug!("音频流索引: {:?}", self.audio.as_ref().map(|c| c.index));
        self.input = Some(input);
        self.source = source.to_string();
        Ok(media_info)
    }

    fn read_packet(&mut self, buffer: &mut MediaBuffer) -> Result<ReadPacketResult> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| PlayerError::FatalDecodeFailure("解码器未打开".to_string()))?;
        let mut packet = ffmpeg::Packet::empty();
        match packet.read(input) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(ReadPacketResult::EndOfStream),
            Err(e) => return Err(e.into()),
        }

        let index = packet.stream();
        let stream = if self.video.as_ref().is_some_and(|c| c.index == index) {
            StreamKind::Video
        } else if self.audio.as_ref().is_some_and(|c| c.index == index) {
            StreamKind::Audio
        } else {
            // 其他流的包直接跳过
            return Ok(ReadPacketResult::NeedMore);
        };

        let time_base = self.time_base(stream);
        let to_ms = |ts: i64| (ts as f64 * time_base * 1000.0) as i64;
        buffer.pts = packet.pts().or(packet.dts()).map(to_ms).unwrap_or(0);
        buffer.duration = to_ms(packet.duration());
        buffer.result = BufferResult::Success;
        let data = packet.data().unwrap_or(&[]);
        let bytes = buffer
            .bytes_mut()
            .ok_or_else(|| PlayerError::DecodeFailure("压缩包写入了非包缓冲".to_string()))?;
        bytes.clear();
        bytes.extend_from_slice(data);
        buffer.size = data.len();
        Ok(ReadPacketResult::Packet(stream))
    }

    fn send_packet(&mut self, stream: StreamKind, buffer: Option<&MediaBuffer>) -> Result<()> {
        let time_base = self.time_base(stream);
        let decoder: &mut codec::decoder::Opened = match stream {
            StreamKind::Video => self.video.as_mut().map(|c| &mut *c.decoder),
            StreamKind::Audio => self.audio.as_mut().map(|c| &mut *c.decoder),
        }
        .ok_or_else(|| PlayerError::DecodeFailure(format!("{:?} 解码器不存在", stream)))?;

        let Some(buffer) = buffer else {
            debug!("🚰 {:?} 解码器进入排空", stream);
            return decoder.send_eof().map_err(|e| PlayerError::DecodeFailure(e.to_string()));
        };

        let mut packet = ffmpeg::Packet::copy(buffer.bytes().unwrap_or(&[]));
        if time_base > 0.0 {
            packet.set_pts(Some((buffer.pts as f64 / 1000.0 / time_base).round() as i64));
        }
        match decoder.send_packet(&packet) {
            Ok(()) => Ok(()),
            Err(ffmpeg::Error::Eof) => {
                debug!("{:?} 解码器收到 EOF（send_packet），执行 flush 并忽略本次包", stream);
                decoder.flush();
                Ok(())
            }
            Err(e) => Err(PlayerError::DecodeFailure(format!("{:?} 送包失败: {}", stream, e))),
        }
    }

    fn receive_frame(&mut self, stream: StreamKind, buffer: &mut MediaBuffer) -> Result<FrameStatus> {
        match stream {
            StreamKind::Video => {
                let codec = self
                    .video
                    .as_mut()
                    .ok_or_else(|| PlayerError::FatalDecodeFailure("视频解码器不存在".to_string()))?;
                let mut decoded = util::frame::Video::empty();
                match codec.decoder.receive_frame(&mut decoded) {
                    Ok(()) => {
                        codec.write_frame(&decoded, buffer)?;
                        Ok(FrameStatus::Frame)
                    }
                    Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                        Ok(FrameStatus::NeedMorePacket)
                    }
                    Err(ffmpeg::Error::Eof) => Ok(FrameStatus::EndOfStream),
                    Err(e) => Err(PlayerError::DecodeFailure(format!("视频解码错误: {}", e))),
                }
            }
            StreamKind::Audio => {
                let codec = self
                    .audio
                    .as_mut()
                    .ok_or_else(|| PlayerError::FatalDecodeFailure("音频解码器不存在".to_string()))?;
                let mut decoded = util::frame::Audio::empty();
                match codec.decoder.receive_frame(&mut decoded) {
                    Ok(()) => {
                        codec.write_frame(&decoded, buffer)?;
                        Ok(FrameStatus::Frame)
                    }
                    Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::error::EAGAIN => {
                        Ok(FrameStatus::NeedMorePacket)
                    }
                    Err(ffmpeg::Error::Eof) => Ok(FrameStatus::EndOfStream),
                    Err(e) => Err(PlayerError::DecodeFailure(format!("音频解码错误: {}", e))),
                }
            }
        }
    }

    fn flush_codec(&mut self, stream: StreamKind) {
        match stream {
            StreamKind::Video => {
                if let Some(codec) = self.video.as_mut() {
                    codec.decoder.flush();
                }
            }
            StreamKind::Audio => {
                if let Some(codec) = self.audio.as_mut() {
                    codec.decoder.flush();
                }
            }
        }
    }

    fn seek(&mut self, target_ms: i64) -> Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| PlayerError::FatalDecodeFailure("解码器未打开".to_string()))?;
        let timestamp = target_ms.max(0) * 1000; // 毫秒转微秒
        input.seek(timestamp, ..timestamp)?;
        Ok(())
    }

    fn close(&mut self) {
        if self.input.take().is_some() {
            info!("关闭 FFmpeg 解码器: {}", self.source);
        }
        self.video = None;
        self.audio = None;
    }

    fn description(&self) -> String {
        format!("FFmpeg Decoder: {}", self.source)
    }
}
