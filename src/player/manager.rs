//! 播放管理器
//!
//! [`PlaybackManager`] 是播放器对外的命令入口：打开媒体、启动解码线程和渲染
//! 线程，把 play / pause / seek / stop / release 翻译成两个线程的命令，并通过
//! 单独的回调线程按顺序把状态和进度通知给 [`PlayerListener`]。

use crate::core::{EngineConfig, MediaInfo, PlayerError, Result};
use crate::player::buffer_pool::BufferManager;
use crate::player::decode_thread::{DecodeThread, FatalErrorHook, WorkerCommand};
use crate::player::native::{AudioSink, NativeDecoder, PlayerListener, VideoSink};
use crate::player::scheduler::{RenderEvent, RenderObserver, RenderSinks, SchedulerThread};
use crate::player::state::{PlayerEvent, PlayerState, PlayerStateCell, RendererState};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use std::process;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 一次 prepare 所需的外部组件
pub struct PlayerComponents {
    pub decoder: Box<dyn NativeDecoder>,
    pub video_sink: Box<dyn VideoSink>,
    pub audio_sink: Option<Box<dyn AudioSink>>,
}

/// 回调线程的消息
enum Notification {
    State(PlayerState),
    Progress(i64, i64),
    Shutdown,
}

/// 回调线程：按提交顺序调用监听器
struct CallbackThread {
    notify_tx: Sender<Notification>,
    thread_handle: Option<JoinHandle<()>>,
}

impl CallbackThread {
    fn start(listener: Arc<dyn PlayerListener>) -> Result<Self> {
        let (notify_tx, notify_rx) = unbounded::<Notification>();
        let thread_handle = thread::Builder::new()
            .name("callback".to_string())
            .spawn(move || Self::run(listener, notify_rx))
            .map_err(|e| PlayerError::Thread(format!("启动回调线程失败: {}", e)))?;
        Ok(Self {
            notify_tx,
            thread_handle: Some(thread_handle),
        })
    }

    fn run(listener: Arc<dyn PlayerListener>, notify_rx: Receiver<Notification>) {
        debug!("{} 📣 回调线程启动", log_ctx());
        for notification in notify_rx {
            match notification {
                Notification::State(state) => listener.on_player_state(&state),
                Notification::Progress(position, duration) => listener.on_progress(position, duration),
                Notification::Shutdown => break,
            }
        }
        debug!("{} 📣 回调线程退出", log_ctx());
    }

    /// 投递完剩余通知后退出
    fn shutdown(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.notify_tx.send(Notification::Shutdown);
            if handle.join().is_err() {
                warn!("{} ⚠ 回调线程异常退出（监听器 panic）", log_ctx());
            }
        }
    }
}

/// 当前会话的命令通道
struct SessionControl {
    worker_tx: Sender<WorkerCommand>,
    render_tx: Sender<RenderEvent>,
}

impl SessionControl {
    fn worker(&self, command: WorkerCommand) {
        if self.worker_tx.send(command).is_err() {
            debug!("解码线程已退出，忽略命令 {:?}", command);
        }
    }

    fn render(&self, event: RenderEvent) {
        if self.render_tx.send(event).is_err() {
            debug!("渲染线程已退出，忽略事件");
        }
    }
}

/// 控制线程、解码线程和渲染线程共享的播放器状态
struct PlayerShared {
    state: PlayerStateCell,
    /// 状态变化和通知投递在同一把锁内完成，保证通知顺序
    transition: Mutex<()>,
    position: AtomicI64,
    last_render: Mutex<Option<Instant>>,
    notify_tx: Sender<Notification>,
    control: RwLock<Option<SessionControl>>,
}

impl PlayerShared {
    /// 应用事件；状态变化时通知监听器
    fn apply(&self, event: &PlayerEvent) -> Option<PlayerState> {
        let _guard = self.transition.lock();
        let next = self.state.apply(event)?;
        info!("{} 🎮 播放器状态 -> {}", log_ctx(), next.name());
        let _ = self.notify_tx.send(Notification::State(next.clone()));
        Some(next)
    }

    fn dispatch_progress(&self, position_ms: i64) {
        let _guard = self.transition.lock();
        let state = self.state.get();
        if !state.allows_progress() {
            return;
        }
        self.position.store(position_ms, Ordering::SeqCst);
        let duration = state.media_info().map(|info| info.duration).unwrap_or(0);
        let _ = self.notify_tx.send(Notification::Progress(position_ms, duration));
    }

    fn touch_render(&self) {
        *self.last_render.lock() = Some(Instant::now());
    }

    fn with_control(&self, f: impl FnOnce(&SessionControl)) {
        match self.control.read().as_ref() {
            Some(control) => f(control),
            None => debug!("没有活动的会话，忽略命令"),
        }
    }

    /// 暂停两个线程并让解码线程定位到 `target_ms`
    fn begin_seek(&self, target_ms: i64) {
        self.with_control(|control| {
            control.render(RenderEvent::RequestPause { keep_pending: false });
            control.render(RenderEvent::AudioPause);
            control.render(RenderEvent::AudioFlush);
            control.worker(WorkerCommand::Pause);
            control.worker(WorkerCommand::Seek(target_ms));
        });
    }

    /// 播放无法继续：进入 Error 并停止渲染
    fn fail(&self, message: String) {
        error!("{} ❌ 播放失败: {}", log_ctx(), message);
        if self.apply(&PlayerEvent::Fail(message)).is_some() {
            self.with_control(|control| {
                control.render(RenderEvent::RequestPause { keep_pending: false });
                control.render(RenderEvent::AudioStop);
            });
        }
    }
}

impl RenderObserver for PlayerShared {
    fn on_progress(&self, pts: i64) {
        self.dispatch_progress(pts);
    }

    fn on_render_success(&self) {
        self.touch_render();
    }

    fn on_render_end(&self) {
        if self.apply(&PlayerEvent::RenderEnd).is_some() {
            info!("{} 🏁 播放结束", log_ctx());
        }
    }

    fn on_seek_finished(&self, success: bool, position_ms: i64) {
        // 期间被 stop / release 时不再恢复
        let Some(restored) = self.apply(&PlayerEvent::SeekFinished) else {
            debug!("{} ⏭ seek 完成时已不在 Seeking 状态，忽略", log_ctx());
            return;
        };
        if !success {
            warn!("{} ⚠️ Seek 失败，恢复为 {}", log_ctx(), restored.name());
        }
        self.with_control(|control| {
            control.worker(WorkerCommand::Resume);
            if restored.is_playing() {
                control.render(RenderEvent::RequestRender);
                control.render(RenderEvent::AudioPlay);
            }
        });
        self.touch_render();
        if success {
            self.dispatch_progress(position_ms);
        }
    }
}

/// 一次 prepare 启动的线程和缓冲
struct Session {
    decode: DecodeThread,
    render: SchedulerThread,
    buffers: Arc<BufferManager>,
    media: Arc<MediaInfo>,
}

/// 播放管理器
pub struct PlaybackManager {
    config: EngineConfig,
    shared: Arc<PlayerShared>,
    session: Option<Session>,
    callbacks: Option<CallbackThread>,
}

impl PlaybackManager {
    pub fn new(config: EngineConfig, listener: Arc<dyn PlayerListener>) -> Result<Self> {
        config.validate()?;
        let callbacks = CallbackThread::start(listener)?;
        let shared = Arc::new(PlayerShared {
            state: PlayerStateCell::new(),
            transition: Mutex::new(()),
            position: AtomicI64::new(0),
            last_render: Mutex::new(None),
            notify_tx: callbacks.notify_tx.clone(),
            control: RwLock::new(None),
        });
        info!("{} 🎮 创建播放管理器", log_ctx());
        Ok(Self {
            config,
            shared,
            session: None,
            callbacks: Some(callbacks),
        })
    }

    /// 打开媒体并启动解码 / 渲染线程
    ///
    /// 已有会话时先关闭它。打开失败时进入 Error 并返回 `FatalPrepareFailure`。
    pub fn prepare(&mut self, source: &str, components: PlayerComponents) -> Result<Arc<MediaInfo>> {
        if self.shared.state.get() == PlayerState::Released {
            return Err(PlayerError::InvalidTransition("播放器已释放，不能 prepare".to_string()));
        }
        info!("{} 📂 准备播放: {}", log_ctx(), source);
        self.close_session();

        let PlayerComponents {
            mut decoder,
            video_sink,
            audio_sink,
        } = components;

        let media = match decoder.open(source) {
            Ok(info) => Arc::new(info),
            Err(e) => {
                decoder.close();
                self.shared.apply(&PlayerEvent::Fail(format!("Prepare player fail: {}", e)));
                return Err(match e {
                    PlayerError::FatalPrepareFailure(_) => e,
                    other => PlayerError::FatalPrepareFailure(other.to_string()),
                });
            }
        };
        info!(
            "{} ✅ 媒体已打开: {}ms, video={}, audio={}",
            log_ctx(),
            media.duration,
            media.video.is_some(),
            media.audio.is_some()
        );

        // 没有音频流时不占用音频输出
        let audio_sink = match audio_sink {
            Some(mut sink) if media.audio.is_none() => {
                sink.release();
                None
            }
            sink => sink,
        };

        let buffers = Arc::new(BufferManager::new(&self.config));
        let observer: Arc<dyn RenderObserver> = self.shared.clone();
        let mut render = SchedulerThread::start(
            &self.config,
            &media,
            buffers.clone(),
            RenderSinks {
                video: video_sink,
                audio: audio_sink,
            },
            observer,
        )?;

        let weak: Weak<PlayerShared> = Arc::downgrade(&self.shared);
        let on_fatal: FatalErrorHook = Arc::new(move |e| {
            if let Some(shared) = weak.upgrade() {
                shared.fail(e.to_string());
            }
        });
        let decode = match DecodeThread::start(decoder, &media, &self.config, buffers.clone(), render.sender(), on_fatal) {
            Ok(decode) => decode,
            Err(e) => {
                render.stop();
                self.shared.apply(&PlayerEvent::Fail(format!("Prepare player fail: {}", e)));
                return Err(e);
            }
        };

        *self.shared.control.write() = Some(SessionControl {
            worker_tx: decode.sender(),
            render_tx: render.sender(),
        });
        self.shared.position.store(0, Ordering::SeqCst);
        *self.shared.last_render.lock() = None;
        self.shared.apply(&PlayerEvent::Prepared(media.clone()));
        decode.send(WorkerCommand::RequestRead);

        self.session = Some(Session {
            decode,
            render,
            buffers,
            media: media.clone(),
        });
        Ok(media)
    }

    /// 开始或继续播放；停止 / 播放结束后从头重新播放
    pub fn play(&self) -> Result<()> {
        match self.shared.state.get() {
            PlayerState::Prepared(_) | PlayerState::Paused(_) => {
                if self.shared.apply(&PlayerEvent::Play).is_none() {
                    return Err(self.rejected("play"));
                }
                info!("{} ▶️ 播放", log_ctx());
                self.shared.touch_render();
                self.shared.with_control(|control| {
                    control.render(RenderEvent::RequestRender);
                    control.render(RenderEvent::AudioPlay);
                });
                Ok(())
            }
            PlayerState::Stopped(_) | PlayerState::PlayEnd(_) => {
                if self.shared.apply(&PlayerEvent::Replay).is_none() {
                    return Err(self.rejected("play"));
                }
                info!("{} 🔁 从头重新播放", log_ctx());
                self.shared.begin_seek(0);
                Ok(())
            }
            PlayerState::Playing(_) => {
                debug!("{} 已在播放中", log_ctx());
                Ok(())
            }
            _ => Err(self.rejected("play")),
        }
    }

    /// 暂停；已解码未渲染的缓冲保留，恢复时按原顺序继续
    pub fn pause(&self) -> Result<()> {
        if self.shared.apply(&PlayerEvent::Pause).is_none() {
            return Err(self.rejected("pause"));
        }
        info!("{} ⏸ 暂停", log_ctx());
        self.shared.with_control(|control| {
            control.render(RenderEvent::RequestPause { keep_pending: true });
            control.render(RenderEvent::AudioPause);
        });
        Ok(())
    }

    /// 跳转到 `position_ms`（限制在 [0, 总时长]）
    pub fn seek_to(&self, position_ms: i64) -> Result<()> {
        let duration = self.media_info().map(|info| info.duration).unwrap_or(0);
        let target = if duration > 0 {
            position_ms.clamp(0, duration)
        } else {
            position_ms.max(0)
        };
        if self.shared.apply(&PlayerEvent::SeekStart).is_none() {
            return Err(self.rejected("seek"));
        }
        info!("{} 🎯 Seek 到: {} ms", log_ctx(), target);
        self.shared.begin_seek(target);
        Ok(())
    }

    /// 停止：丢弃所有在途缓冲，解码线程暂停
    pub fn stop(&self) -> Result<()> {
        if self.shared.apply(&PlayerEvent::Stop).is_none() {
            return Err(self.rejected("stop"));
        }
        info!("{} ⏹️ 停止播放", log_ctx());
        self.shared.with_control(|control| {
            control.render(RenderEvent::RequestPause { keep_pending: false });
            control.render(RenderEvent::AudioStop);
            control.render(RenderEvent::AudioFlush);
            control.worker(WorkerCommand::Pause);
        });
        Ok(())
    }

    /// 释放所有线程和缓冲；可重复调用
    pub fn release(&mut self) {
        if self.shared.apply(&PlayerEvent::Release).is_some() {
            info!("{} 🗑 释放播放器", log_ctx());
        }
        self.close_session();
        if let Some(mut callbacks) = self.callbacks.take() {
            callbacks.shutdown();
        }
    }

    fn close_session(&mut self) {
        self.shared.control.write().take();
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.decode.stop();
        session.render.stop();
        session.buffers.set_free_listener(None);
        if let Err(e) = session.buffers.audit() {
            warn!("{} ⚠ 会话结束时缓冲归属异常: {}", log_ctx(), e);
        }
        info!("{} ✅ 会话已关闭，所有线程已结束", log_ctx());
    }

    fn rejected(&self, command: &str) -> PlayerError {
        let state = self.shared.state.get();
        warn!("{} ⚠️ 状态 {} 下忽略 {}", log_ctx(), state.name(), command);
        PlayerError::InvalidTransition(format!("{} 不能在 {} 状态下执行", command, state.name()))
    }

    /// 最近一次分发的播放位置（毫秒）
    pub fn progress(&self) -> i64 {
        self.shared.position.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> PlayerState {
        self.shared.state.get()
    }

    pub fn media_info(&self) -> Option<Arc<MediaInfo>> {
        self.session.as_ref().map(|session| session.media.clone())
    }

    /// 播放中且超过 `threshold` 没有渲染成功
    pub fn is_stalled(&self, threshold: Duration) -> bool {
        if !self.shared.state.get().is_playing() {
            return false;
        }
        match *self.shared.last_render.lock() {
            Some(last) => last.elapsed() >= threshold,
            None => false,
        }
    }

    pub fn buffers(&self) -> Option<Arc<BufferManager>> {
        self.session.as_ref().map(|session| session.buffers.clone())
    }

    pub fn renderer_state(&self) -> Option<RendererState> {
        self.session.as_ref().map(|session| session.render.state())
    }
}

impl Drop for PlaybackManager {
    fn drop(&mut self) {
        if self.session.is_some() || self.callbacks.is_some() {
            self.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::BufferKind;
    use crate::player::synthetic::{
        AudioSinkMode, CollectingListener, RecordingVideoSink, SyntheticAudioSink, SyntheticDecoder, SyntheticMedia,
    };

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        condition()
    }

    struct Fixture {
        manager: PlaybackManager,
        listener: Arc<CollectingListener>,
        video: RecordingVideoSink,
    }

    fn components(media: SyntheticMedia, video: &RecordingVideoSink) -> PlayerComponents {
        PlayerComponents {
            decoder: Box::new(SyntheticDecoder::new(media)),
            video_sink: Box::new(video.clone()),
            audio_sink: Some(Box::new(SyntheticAudioSink::new(AudioSinkMode::Immediate))),
        }
    }

    fn prepared(media: SyntheticMedia) -> Fixture {
        let _ = env_logger::builder().is_test(true).try_init();
        let listener = CollectingListener::new();
        let mut manager = PlaybackManager::new(EngineConfig::default(), listener.clone()).unwrap();
        let video = RecordingVideoSink::new();
        manager.prepare("synthetic://test", components(media, &video)).unwrap();
        Fixture {
            manager,
            listener,
            video,
        }
    }

    fn steps(from: i64, to: i64, step: i64) -> Vec<i64> {
        (from..=to).step_by(step as usize).collect()
    }

    fn all_free(buffers: &BufferManager) -> bool {
        [BufferKind::Video, BufferKind::Audio, BufferKind::Packet]
            .into_iter()
            .all(|kind| buffers.pool(kind).free_len() == buffers.pool(kind).capacity())
    }

    #[test]
    fn test_plays_to_end_and_frees_all_buffers() {
        let f = prepared(SyntheticMedia::av(10, 20, 20, 10));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));

        assert_eq!(f.video.rendered_pts(), steps(0, 180, 20));
        let buffers = f.manager.buffers().unwrap();
        assert!(wait_until(TIMEOUT, || all_free(&buffers)));
        buffers.audit().unwrap();

        assert!(f.listener.wait_for(TIMEOUT, |s| matches!(s, PlayerState::PlayEnd(_))));
        assert_eq!(f.listener.state_names(), vec!["Prepared", "Playing", "PlayEnd"]);
        assert!(f.listener.progress().iter().all(|&(_, duration)| duration == 200));
    }

    #[test]
    fn test_prepare_failure_enters_error() {
        let listener = CollectingListener::new();
        let mut manager = PlaybackManager::new(EngineConfig::default(), listener.clone()).unwrap();
        let mut media = SyntheticMedia::video_only(5, 20);
        media.fail_open = true;
        let video = RecordingVideoSink::new();

        let err = manager.prepare("synthetic://broken", components(media, &video)).unwrap_err();
        assert!(matches!(err, PlayerError::FatalPrepareFailure(_)));
        assert!(matches!(manager.state(), PlayerState::Error(ref msg) if msg.starts_with("Prepare player fail")));
        assert!(manager.buffers().is_none());
        assert!(listener.wait_for(TIMEOUT, |s| matches!(s, PlayerState::Error(_))));
        assert!(manager.play().is_err());
    }

    #[test]
    fn test_pause_resume_renders_every_frame_once() {
        let f = prepared(SyntheticMedia::video_only(30, 20));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || f.video.rendered_pts().len() >= 5));

        f.manager.pause().unwrap();
        assert!(matches!(f.manager.state(), PlayerState::Paused(_)));
        assert!(wait_until(TIMEOUT, || f.manager.renderer_state() == Some(RendererState::Paused)));
        let paused_at = f.video.rendered_pts().len();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(f.video.rendered_pts().len(), paused_at);
        assert!(!f.manager.is_stalled(Duration::ZERO));

        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert_eq!(f.video.rendered_pts(), steps(0, 580, 20));
    }

    #[test]
    fn test_seek_while_paused_resumes_from_target() {
        let f = prepared(SyntheticMedia::video_only(50, 20));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || f.video.rendered_pts().len() >= 3));
        f.manager.pause().unwrap();
        assert!(wait_until(TIMEOUT, || f.manager.renderer_state() == Some(RendererState::Paused)));

        f.manager.seek_to(500).unwrap();
        assert!(matches!(f.manager.state(), PlayerState::Seeking(_) | PlayerState::Paused(_)));
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::Paused(_))));
        assert!(wait_until(TIMEOUT, || f.manager.progress() == 500));
        assert!(wait_until(TIMEOUT, || f.listener.progress().contains(&(500, 1000))));

        let before = f.video.rendered_pts().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.video.rendered_pts().len(), before);

        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert_eq!(f.video.rendered_pts()[before..].to_vec(), steps(500, 980, 20));
    }

    #[test]
    fn test_seek_target_clamped_to_duration() {
        let f = prepared(SyntheticMedia::video_only(25, 20));
        f.manager.play().unwrap();
        f.manager.seek_to(-300).unwrap();
        assert!(wait_until(TIMEOUT, || !matches!(f.manager.state(), PlayerState::Seeking(_))));
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert_eq!(f.video.rendered_pts().last(), Some(&480));
    }

    #[test]
    fn test_stop_then_replay_from_start() {
        let f = prepared(SyntheticMedia::video_only(25, 20));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || f.video.rendered_pts().len() >= 3));

        f.manager.stop().unwrap();
        assert!(matches!(f.manager.state(), PlayerState::Stopped(_)));
        assert!(wait_until(TIMEOUT, || f.manager.renderer_state() == Some(RendererState::Paused)));
        let stopped_at = f.video.rendered_pts().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(f.video.rendered_pts().len(), stopped_at);
        assert!(f.manager.pause().is_err());

        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert_eq!(f.video.rendered_pts()[stopped_at..].to_vec(), steps(0, 480, 20));
    }

    #[test]
    fn test_replay_after_end() {
        let f = prepared(SyntheticMedia::av(5, 20, 10, 10));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));

        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || f.video.rendered_pts().len() == 10
            && matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert_eq!(f.video.rendered_pts(), [steps(0, 80, 20), steps(0, 80, 20)].concat());
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut f = prepared(SyntheticMedia::av(10, 20, 20, 10));
        f.manager.play().unwrap();
        f.manager.release();
        f.manager.release();

        assert_eq!(f.manager.state(), PlayerState::Released);
        assert!(f.manager.buffers().is_none());
        assert!(f.manager.play().is_err());
        assert!(f.manager.seek_to(0).is_err());
        let video = RecordingVideoSink::new();
        assert!(f
            .manager
            .prepare("synthetic://again", components(SyntheticMedia::video_only(1, 20), &video))
            .is_err());
        // 回调线程已在 release 时投递完毕
        assert_eq!(f.listener.state_names().last(), Some(&"Released"));
        assert_eq!(f.listener.state_names().iter().filter(|name| **name == "Released").count(), 1);
    }

    #[test]
    fn test_fatal_decode_error_stops_playback() {
        let mut media = SyntheticMedia::video_only(20, 20);
        media.fatal_video_pts = Some(300);
        let f = prepared(media);
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::Error(_))));
        assert!(f.listener.wait_for(TIMEOUT, |s| matches!(s, PlayerState::Error(_))));
        assert!(f.video.rendered_pts().iter().all(|&pts| pts < 300));
        assert!(f.manager.pause().is_err());
    }

    #[test]
    fn test_reprepare_replaces_session() {
        let mut f = prepared(SyntheticMedia::video_only(10, 20));
        let first = f.manager.buffers().unwrap();
        let video = RecordingVideoSink::new();
        let info = f
            .manager
            .prepare("synthetic://second", components(SyntheticMedia::audio_only(10, 10), &video))
            .unwrap();
        assert!(info.video.is_none());
        assert!(!Arc::ptr_eq(&first, &f.manager.buffers().unwrap()));
        assert!(matches!(f.manager.state(), PlayerState::Prepared(_)));
        f.manager.play().unwrap();
        assert!(wait_until(TIMEOUT, || matches!(f.manager.state(), PlayerState::PlayEnd(_))));
        assert!(video.rendered_pts().is_empty());
    }

    #[test]
    fn test_stall_detection() {
        let f = prepared(SyntheticMedia::video_only(50, 20));
        assert!(!f.manager.is_stalled(Duration::ZERO));
        f.manager.play().unwrap();
        assert!(!f.manager.is_stalled(Duration::from_secs(10)));
        thread::sleep(Duration::from_millis(5));
        f.manager.pause().unwrap();
        assert!(!f.manager.is_stalled(Duration::ZERO));
    }
}
