use crate::core::{PlayerError, Result};
use crate::player::native::{AudioConsumed, AudioSink, EnqueueResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig, SupportedStreamConfigRange};
use crossbeam::queue::SegQueue;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// 一个已入队的 PCM 缓冲（已转成 f32）
struct AudioChunk {
    samples: Vec<f32>,
    epoch: u64,
    /// 入队时渲染侧的纪元，播完后原样回调
    token: u64,
}

/// 输出回调和控制端共享的状态
struct OutputShared {
    chunks: SegQueue<AudioChunk>,
    in_flight: AtomicUsize,
    playing: AtomicBool,
    /// flush 时递增，回调丢弃旧纪元的数据
    epoch: AtomicU64,
    volume: Mutex<f32>,
    on_consumed: Mutex<Option<AudioConsumed>>,
}

impl OutputShared {
    fn notify_consumed(&self, token: u64) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let on_consumed = self.on_consumed.lock().clone();
        if let Some(on_consumed) = on_consumed {
            on_consumed.notify(token);
        }
    }
}

/// 音频输出 - 使用 cpal 播放引擎投递的 S16 交织 PCM
///
/// 每个缓冲播放完后回调一次 [`AudioConsumed`]；引擎据此回收音频帧。
pub struct CpalAudioSink {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
    shared: Arc<OutputShared>,
    released: bool,
}

// cpal::Stream 本身不是 Send；输出流在 play() 中创建，之后只在渲染线程里使用
unsafe impl Send for CpalAudioSink {}

impl CpalAudioSink {
    /// 创建音频输出（支持非标准配置自动回退）
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        info!("初始化音频输出: {} Hz, {} 声道", sample_rate, channels);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| PlayerError::SinkRejection("无法找到音频输出设备".to_string()))?;

        debug!("使用音频设备: {}", device.name().unwrap_or_default());

        let requested = StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let config = if Self::is_supported(&device, &requested)? {
            requested
        } else {
            // 声道数不同会错位，只回退声道相同的配置
            warn!("⚠️  音频设备不支持 {} Hz, {} 声道配置，回退到标准配置", sample_rate, channels);
            let mut fallback = None;
            for rate in [48000, 44100] {
                let candidate = StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                if Self::is_supported(&device, &candidate)? {
                    info!("✅ 使用回退配置: {} Hz, {} 声道", rate, channels);
                    fallback = Some(candidate);
                    break;
                }
            }
            fallback.ok_or_else(|| {
                PlayerError::SinkRejection(format!(
                    "音频设备不支持任何标准配置 (原请求: {} Hz, {} 声道)",
                    sample_rate, channels
                ))
            })?
        };

        Ok(Self {
            device,
            config,
            stream: None,
            shared: Arc::new(OutputShared {
                chunks: SegQueue::new(),
                in_flight: AtomicUsize::new(0),
                playing: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                volume: Mutex::new(1.0),
                on_consumed: Mutex::new(None),
            }),
            released: false,
        })
    }

    fn is_supported(device: &Device, config: &StreamConfig) -> Result<bool> {
        let supported = device
            .supported_output_configs()
            .map_err(|e| PlayerError::SinkRejection(format!("无法获取支持的音频配置: {}", e)))?;
        Ok(supported
            .into_iter()
            .any(|range| Self::is_config_compatible(config, &range)))
    }

    /// 检查配置是否兼容
    fn is_config_compatible(config: &StreamConfig, supported: &SupportedStreamConfigRange) -> bool {
        let rate_in_range = config.sample_rate.0 >= supported.min_sample_rate().0
            && config.sample_rate.0 <= supported.max_sample_rate().0;

        let channels_match = config.channels == supported.channels();

        rate_in_range && channels_match
    }

    fn ensure_stream(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let shared = self.shared.clone();
        let mut current: Option<(AudioChunk, usize)> = None;

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if !shared.playing.load(Ordering::SeqCst) {
                        data.fill(0.0);
                        return;
                    }
                    let epoch = shared.epoch.load(Ordering::SeqCst);
                    let vol = *shared.volume.lock();
                    for sample in data.iter_mut() {
                        *sample = 0.0;
                        loop {
                            match current.as_mut() {
                                Some((chunk, _)) if chunk.epoch != epoch => current = None,
                                Some((chunk, offset)) if *offset < chunk.samples.len() => {
                                    *sample = chunk.samples[*offset] * vol;
                                    *offset += 1;
                                    break;
                                }
                                Some((chunk, _)) => {
                                    let token = chunk.token;
                                    current = None;
                                    shared.notify_consumed(token);
                                }
                                None => match shared.chunks.pop() {
                                    Some(chunk) if chunk.epoch == epoch => current = Some((chunk, 0)),
                                    Some(_) => {}
                                    None => break,
                                },
                            }
                        }
                    }
                },
                move |err| {
                    error!("音频流错误: {}", err);
                },
                None,
            )
            .map_err(|e| PlayerError::SinkRejection(format!("创建音频流失败: {}", e)))?;

        self.stream = Some(stream);
        info!("音频输出流已创建");
        Ok(())
    }

    /// 设置音量 (0.0 - 1.0)
    pub fn set_volume(&self, volume: f32) {
        *self.shared.volume.lock() = volume.clamp(0.0, 1.0);
    }

    /// 获取实际使用的音频配置
    pub fn get_config(&self) -> (u32, u16) {
        (self.config.sample_rate.0, self.config.channels)
    }
}

impl AudioSink for CpalAudioSink {
    fn attach(&mut self, on_consumed: AudioConsumed) {
        *self.shared.on_consumed.lock() = Some(on_consumed);
    }

    fn enqueue(&mut self, pcm: &[u8], _pts: i64) -> EnqueueResult {
        if self.released {
            return EnqueueResult::Rejected;
        }
        let samples: Vec<f32> = pcm
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect();
        if samples.is_empty() {
            return EnqueueResult::Rejected;
        }
        let token = self.shared.on_consumed.lock().as_ref().map(|c| c.epoch()).unwrap_or(0);
        self.shared.in_flight.fetch_add(1, Ordering::SeqCst);
        self.shared.chunks.push(AudioChunk {
            samples,
            epoch: self.shared.epoch.load(Ordering::SeqCst),
            token,
        });
        EnqueueResult::Accepted
    }

    fn queue_depth(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    fn play(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.ensure_stream() {
            error!("❌ {}", e);
            return;
        }
        self.shared.playing.store(true, Ordering::SeqCst);
        if let Some(stream) = self.stream.as_ref() {
            if let Err(e) = stream.play() {
                error!("❌ 启动音频流失败: {}", e);
            }
        }
        debug!("🔊 音频输出开始");
    }

    fn pause(&mut self) {
        self.shared.playing.store(false, Ordering::SeqCst);
        if let Some(stream) = self.stream.as_ref() {
            if let Err(e) = stream.pause() {
                warn!("⚠️ 暂停音频流失败: {}", e);
            }
        }
        debug!("🔇 音频输出暂停");
    }

    fn stop(&mut self) {
        self.pause();
        if self.stream.take().is_some() {
            info!("音频输出已停止");
        }
    }

    fn flush(&mut self) {
        self.shared.epoch.fetch_add(1, Ordering::SeqCst);
        while self.shared.chunks.pop().is_some() {}
        self.shared.in_flight.store(0, Ordering::SeqCst);
    }

    fn release(&mut self) {
        self.stop();
        self.flush();
        *self.shared.on_consumed.lock() = None;
        self.released = true;
    }
}

impl Drop for CpalAudioSink {
    fn drop(&mut self) {
        self.release();
    }
}
