use anyhow::{Context, Result};
use log::{debug, info, warn};
use myy_engine::core::{EngineConfig, PixelFormat};
use myy_engine::player::synthetic::{AudioSinkMode, SyntheticAudioSink, SyntheticDecoder, SyntheticMedia};
use myy_engine::player::{
    AudioSink, FrameConsumed, NativeDecoder, PlaybackManager, PlayerComponents, PlayerListener, PlayerState,
    VideoSink,
};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 只记录帧信息的视频输出端
struct LogVideoSink {
    frames: u64,
}

impl VideoSink for LogVideoSink {
    fn render_planar_frame(
        &mut self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: Vec<Vec<u8>>,
        on_consumed: FrameConsumed,
    ) {
        self.frames += 1;
        if self.frames % 25 == 1 {
            info!("🖼 第 {} 帧: {}x{} {:?}", self.frames, width, height, format);
        }
        on_consumed.consumed(planes);
    }

    fn render_packed_frame(&mut self, width: u32, height: u32, bytes: Vec<u8>, on_consumed: FrameConsumed) {
        self.frames += 1;
        if self.frames % 25 == 1 {
            info!("🖼 第 {} 帧: {}x{} RGBA", self.frames, width, height);
        }
        on_consumed.consumed(vec![bytes]);
    }
}

/// 打印进度并在播放结束时唤醒主线程
struct ConsoleListener {
    finished: Mutex<Option<PlayerState>>,
    done: Condvar,
}

impl PlayerListener for ConsoleListener {
    fn on_player_state(&self, state: &PlayerState) {
        info!("📣 状态: {}", state.name());
        if matches!(state, PlayerState::PlayEnd(_) | PlayerState::Error(_)) {
            *self.finished.lock() = Some(state.clone());
            self.done.notify_all();
        }
    }

    fn on_progress(&self, position_ms: i64, duration_ms: i64) {
        debug!("⏱ {} / {} ms", position_ms, duration_ms);
    }
}

fn synthetic_components() -> (Box<dyn NativeDecoder>, Box<dyn AudioSink>) {
    (
        Box::new(SyntheticDecoder::new(SyntheticMedia::av(125, 40, 250, 20))),
        Box::new(SyntheticAudioSink::new(AudioSinkMode::Immediate)),
    )
}

#[cfg(feature = "ffmpeg")]
fn native_components(source: &str) -> (Box<dyn NativeDecoder>, Box<dyn AudioSink>) {
    if source.starts_with("synthetic://") {
        return synthetic_components();
    }
    let (audio_sink, output) = device_audio_sink();
    let mut decoder = myy_engine::player::FfmpegDecoder::new();
    if let Some((sample_rate, channels)) = output {
        decoder = decoder.with_audio_output(sample_rate, channels);
    }
    (Box::new(decoder), audio_sink)
}

#[cfg(not(feature = "ffmpeg"))]
fn native_components(source: &str) -> (Box<dyn NativeDecoder>, Box<dyn AudioSink>) {
    if !source.starts_with("synthetic://") {
        warn!("⚠️ 未启用 ffmpeg feature，改用合成媒体");
    }
    synthetic_components()
}

/// 音频输出端及其实际打开的 (采样率, 声道数)
#[cfg(all(feature = "ffmpeg", feature = "cpal"))]
fn device_audio_sink() -> (Box<dyn AudioSink>, Option<(u32, u16)>) {
    match myy_engine::player::CpalAudioSink::new(48_000, 2) {
        Ok(sink) => {
            let output = sink.get_config();
            (Box::new(sink), Some(output))
        }
        Err(e) => {
            warn!("⚠️ 音频设备不可用，改用静音输出: {}", e);
            (Box::new(SyntheticAudioSink::new(AudioSinkMode::Immediate)), None)
        }
    }
}

#[cfg(all(feature = "ffmpeg", not(feature = "cpal")))]
fn device_audio_sink() -> (Box<dyn AudioSink>, Option<(u32, u16)>) {
    (Box::new(SyntheticAudioSink::new(AudioSinkMode::Immediate)), None)
}

fn main() -> Result<()> {
    // 初始化日志
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY Engine 演示启动");

    let mut args = std::env::args().skip(1);
    let source = args.next().unwrap_or_else(|| "synthetic://demo".to_string());
    let config = match args.next() {
        Some(path) => EngineConfig::load(&path).with_context(|| format!("读取配置失败: {}", path))?,
        None => EngineConfig::default(),
    };

    let listener = Arc::new(ConsoleListener {
        finished: Mutex::new(None),
        done: Condvar::new(),
    });
    let stall_threshold = config.stall_threshold();
    let mut manager = PlaybackManager::new(config, listener.clone())?;

    let (decoder, audio_sink) = native_components(&source);
    let media = manager
        .prepare(
            &source,
            PlayerComponents {
                decoder,
                video_sink: Box::new(LogVideoSink { frames: 0 }),
                audio_sink: Some(audio_sink),
            },
        )
        .with_context(|| format!("无法播放: {}", source))?;
    info!("✅ 媒体信息: {}ms, video={:?}, audio={:?}", media.duration, media.video, media.audio);

    manager.play()?;

    let deadline = Instant::now() + Duration::from_millis(media.duration.max(0) as u64) + Duration::from_secs(10);
    let mut finished = listener.finished.lock();
    let mut stalled = false;
    while finished.is_none() && Instant::now() < deadline {
        listener.done.wait_for(&mut finished, stall_threshold);
        // 只在进入卡顿时提示一次
        let now_stalled = manager.is_stalled(stall_threshold);
        if now_stalled && !stalled {
            warn!("⚠️ 超过 {}ms 没有渲染，当前位置 {}ms", stall_threshold.as_millis(), manager.progress());
        }
        stalled = now_stalled;
    }
    match finished.take() {
        Some(PlayerState::Error(msg)) => warn!("❌ 播放失败: {}", msg),
        Some(state) => info!("🏁 播放结束: {}", state.name()),
        None => warn!("⚠️ 等待播放结束超时，当前位置 {}ms", manager.progress()),
    }
    drop(finished);

    manager.release();
    info!("👋 退出");
    Ok(())
}
