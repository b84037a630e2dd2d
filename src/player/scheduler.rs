//! 音视频同步调度
//!
//! [`SyncScheduler`] 是渲染侧的单线程状态机：从就绪队列取帧，相对时钟基准
//! 计算每帧的渲染延迟，按延迟投递视频帧，按输出端队列深度投递音频，检测流
//! 结束并回收缓冲。它不读取系统时间，所有处理函数都接收 `now`；
//! [`SchedulerThread`] 在独立线程里用真实时间驱动它。

use crate::core::{BufferState, EngineConfig, MediaInfo, PixelFormat, PlayerError, RenderClock, Result};
use crate::player::buffer_pool::{BufferHandle, BufferManager, BufferPool, PlaneBufferPool};
use crate::player::native::{AudioConsumed, AudioSink, EnqueueResult, FrameConsumed, VideoSink};
use crate::player::state::{AtomicRendererState, RendererState};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, info, warn};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 渲染侧回调（由播放器实现）
pub trait RenderObserver: Send + Sync {
    /// 渲染或消费了一个缓冲，`pts` 为其时间戳
    fn on_progress(&self, pts: i64);
    fn on_render_success(&self);
    fn on_render_end(&self);
    /// seek 目标帧已就位，`position_ms` 为目标帧的时间戳
    fn on_seek_finished(&self, success: bool, position_ms: i64);
}

/// 解码线程 seek 完成后交给渲染侧的目标帧
#[derive(Debug)]
pub struct SeekTargets {
    pub video: Option<BufferHandle>,
    pub audio: Option<BufferHandle>,
    pub success: bool,
    pub target_ms: i64,
}

/// 渲染线程事件
#[derive(Debug)]
pub enum RenderEvent {
    Tick,
    RenderVideo,
    RenderAudio,
    /// 音频输出端消费完一个缓冲，`epoch` 为该缓冲入队时的 flush 纪元
    AudioConsumed { epoch: u64 },
    /// 解码线程放入了新的就绪帧
    FrameReady,
    RequestRender,
    /// `keep_pending` 为 true 时待渲染缓冲放回就绪队列，否则直接回收
    RequestPause { keep_pending: bool },
    RenderEnd,
    SeekBuffers(SeekTargets),
    AudioPlay,
    AudioPause,
    AudioStop,
    AudioFlush,
    Release,
}

/// 自投递的延时事件
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TimerKind {
    Tick,
    RenderVideo,
    RenderAudio,
    RenderEnd,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Timer {
    deadline: Instant,
    seq: u64,
    kind: TimerKind,
}

/// 音视频输出端
pub struct RenderSinks {
    pub video: Box<dyn VideoSink>,
    pub audio: Option<Box<dyn AudioSink>>,
}

/// 同步调度器
pub struct SyncScheduler {
    state: Arc<AtomicRendererState>,
    buffers: Arc<BufferManager>,
    planes: Arc<PlaneBufferPool>,
    video_sink: Box<dyn VideoSink>,
    audio_sink: Option<Box<dyn AudioSink>>,
    observer: Arc<dyn RenderObserver>,
    clock: RenderClock,
    timers: BinaryHeap<Reverse<Timer>>,
    seq: u64,

    pending_video: VecDeque<BufferHandle>,
    pending_audio: VecDeque<BufferHandle>,
    rendering_audio: VecDeque<BufferHandle>,
    /// 每次丢弃输出端中的音频时递增
    audio_epoch: Arc<AtomicU64>,

    has_video: bool,
    has_audio: bool,
    duration: i64,
    last_video_pts: Option<i64>,
    last_audio_pts: Option<i64>,
    video_ended: bool,
    audio_ended: bool,

    max_audio_queue_count: usize,
    render_end_tail_ms: i64,
}

impl SyncScheduler {
    pub fn new(
        config: &EngineConfig,
        media: &MediaInfo,
        buffers: Arc<BufferManager>,
        state: Arc<AtomicRendererState>,
        sinks: RenderSinks,
        observer: Arc<dyn RenderObserver>,
    ) -> Self {
        state.set(RendererState::Prepared);
        Self {
            state,
            buffers,
            planes: Arc::new(PlaneBufferPool::new(config.video_frame_capacity * 3)),
            video_sink: sinks.video,
            audio_sink: sinks.audio,
            observer,
            clock: RenderClock::new(),
            timers: BinaryHeap::new(),
            seq: 0,
            pending_video: VecDeque::new(),
            pending_audio: VecDeque::new(),
            rendering_audio: VecDeque::new(),
            audio_epoch: Arc::new(AtomicU64::new(0)),
            has_video: media.video.is_some(),
            has_audio: media.audio.is_some(),
            duration: media.duration,
            last_video_pts: None,
            last_audio_pts: None,
            video_ended: false,
            audio_ended: false,
            max_audio_queue_count: config.max_audio_queue_count,
            render_end_tail_ms: config.render_end_tail_ms,
        }
    }

    pub fn state(&self) -> RendererState {
        self.state.get()
    }

    /// 向音频输出端注册消费回调
    pub fn attach_audio(&mut self, notify: impl Fn(u64) + Send + Sync + 'static) {
        let on_consumed = AudioConsumed::new(self.audio_epoch.clone(), notify);
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.attach(on_consumed);
        }
    }

    pub fn audio_epoch(&self) -> u64 {
        self.audio_epoch.load(Ordering::SeqCst)
    }

    /// 最近一个延时事件的触发时刻
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|Reverse(t)| t.deadline)
    }

    /// 当前排队的延时事件（按触发顺序）
    pub fn timers(&self) -> Vec<(Instant, TimerKind)> {
        let mut timers: Vec<_> = self.timers.iter().map(|Reverse(t)| (t.deadline, t.seq, t.kind)).collect();
        timers.sort();
        timers.into_iter().map(|(deadline, _, kind)| (deadline, kind)).collect()
    }

    fn post_at(&mut self, kind: TimerKind, deadline: Instant) {
        self.seq += 1;
        self.timers.push(Reverse(Timer {
            deadline,
            seq: self.seq,
            kind,
        }));
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.timers.retain(|Reverse(t)| t.kind != kind);
    }

    fn has_timer(&self, kind: TimerKind) -> bool {
        self.timers.iter().any(|Reverse(t)| t.kind == kind)
    }

    fn pop_due(&mut self, now: Instant) -> Option<TimerKind> {
        if self.timers.peek().is_some_and(|Reverse(t)| t.deadline <= now) {
            self.timers.pop().map(|Reverse(t)| t.kind)
        } else {
            None
        }
    }

    /// 执行所有已到期的延时事件
    pub fn fire_due(&mut self, now: Instant) {
        while let Some(kind) = self.pop_due(now) {
            let event = match kind {
                TimerKind::Tick => RenderEvent::Tick,
                TimerKind::RenderVideo => RenderEvent::RenderVideo,
                TimerKind::RenderAudio => RenderEvent::RenderAudio,
                TimerKind::RenderEnd => RenderEvent::RenderEnd,
            };
            self.handle(event, now);
        }
    }

    /// 处理一个事件
    pub fn handle(&mut self, event: RenderEvent, now: Instant) {
        if self.state.get() == RendererState::Released {
            debug!("🗑 渲染器已释放，丢弃事件 {:?}", event);
            return;
        }
        match event {
            RenderEvent::Tick => self.on_tick(now),
            RenderEvent::RenderVideo => self.on_render_video(),
            RenderEvent::RenderAudio => self.on_render_audio(),
            RenderEvent::AudioConsumed { epoch } => self.on_audio_consumed(epoch, now),
            RenderEvent::FrameReady => {
                if self
                    .state
                    .compare_and_set(RendererState::WaitingDecoder, RendererState::Rendering)
                {
                    self.post_at(TimerKind::Tick, now);
                }
            }
            RenderEvent::RequestRender => self.on_request_render(now),
            RenderEvent::RequestPause { keep_pending } => self.on_request_pause(keep_pending),
            RenderEvent::RenderEnd => self.on_render_end(),
            RenderEvent::SeekBuffers(targets) => self.on_seek_buffers(targets),
            RenderEvent::AudioPlay => {
                if let Some(sink) = self.audio_sink.as_mut() {
                    sink.play();
                }
            }
            RenderEvent::AudioPause => {
                if let Some(sink) = self.audio_sink.as_mut() {
                    sink.pause();
                }
            }
            RenderEvent::AudioStop => {
                if let Some(sink) = self.audio_sink.as_mut() {
                    sink.stop();
                }
            }
            RenderEvent::AudioFlush => self.audio_flush(),
            RenderEvent::Release => self.release(),
        }
    }

    fn on_tick(&mut self, now: Instant) {
        if self.state.get() != RendererState::Rendering {
            return;
        }
        let video = self.buffers.video().take_ready();
        let audio = self.buffers.audio().take_ready();

        if video.is_none() && audio.is_none() {
            self.state
                .compare_and_set(RendererState::Rendering, RendererState::WaitingDecoder);
            // 暂停前已经消费过结束标记时，在这里补上结束计时
            if self.streams_ended() && !self.has_timer(TimerKind::RenderEnd) {
                self.schedule_render_end(now);
            }
            return;
        }
        if let Some(video) = video {
            self.schedule_video(video, now);
        }
        if let Some(audio) = audio {
            self.schedule_audio(audio, now);
        }
        self.post_at(TimerKind::Tick, now);
    }

    fn schedule_video(&mut self, frame: BufferHandle, now: Instant) {
        let (pts, last) = match self.buffers.video().with_buffer(&frame, |b| (b.pts, b.is_last())) {
            Ok(info) => info,
            Err(e) => {
                debug!("♻️ 跳过失效的视频帧: {}", e);
                return;
            }
        };
        if last {
            self.buffers.video().recycle(frame);
            self.video_ended = true;
            debug!("🏁 视频流结束标记");
            if self.streams_ended() {
                self.schedule_render_end(now);
            }
            return;
        }

        self.clock.check_and_update(pts, now);
        let delay = self.clock.delay_for(pts, now);
        self.last_video_pts = Some(pts);
        self.pending_video.push_back(frame);
        self.post_at(TimerKind::RenderVideo, now + delay);
    }

    fn schedule_audio(&mut self, frame: BufferHandle, now: Instant) {
        let (pts, last) = match self.buffers.audio().with_buffer(&frame, |b| (b.pts, b.is_last())) {
            Ok(info) => info,
            Err(e) => {
                debug!("♻️ 跳过失效的音频帧: {}", e);
                return;
            }
        };
        if last {
            self.buffers.audio().recycle(frame);
            self.audio_ended = true;
            debug!("🏁 音频流结束标记");
            if self.streams_ended() {
                self.schedule_render_end(now);
            }
            return;
        }

        // 纯音频流以第一帧音频锚定时钟
        if !self.has_video {
            self.clock.check_and_update(pts, now);
        }
        self.last_audio_pts = Some(pts);
        self.pending_audio.push_back(frame);
        if self.pending_audio.len() == 1 {
            self.post_at(TimerKind::RenderAudio, now);
        }
    }

    fn streams_ended(&self) -> bool {
        (self.video_ended || !self.has_video) && (self.audio_ended || !self.has_audio)
    }

    /// 以所有已知帧中最大的 pts（找不到时用总时长）加上尾部余量安排结束
    fn schedule_render_end(&mut self, now: Instant) {
        let last_pts = [
            self.last_audio_pts,
            self.last_video_pts,
            self.buffers.video().peek_last_ready_pts(),
            self.buffers.audio().peek_last_ready_pts(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(self.duration);

        let delay = if self.clock.is_anchored() {
            self.clock.delay_for(last_pts + self.render_end_tail_ms, now)
        } else {
            Duration::from_millis(self.render_end_tail_ms.max(0) as u64)
        };
        info!("⏱ 最后一帧 pts={}ms，{}ms 后结束渲染", last_pts, delay.as_millis());
        self.cancel(TimerKind::RenderEnd);
        self.post_at(TimerKind::RenderEnd, now + delay);
    }

    fn on_render_video(&mut self) {
        let Some(frame) = self.pending_video.pop_front() else {
            return;
        };
        let planes = &self.planes;
        let picture = self.buffers.video().with_buffer(&frame, |b| {
            b.video().map(|picture| {
                let copies: Vec<Vec<u8>> = picture
                    .active_planes()
                    .iter()
                    .map(|plane| {
                        let mut bytes = planes.request(plane.len());
                        bytes.copy_from_slice(plane);
                        bytes
                    })
                    .collect();
                (b.pts, picture.width, picture.height, picture.format, copies)
            })
        });

        match picture {
            Ok(Some((pts, width, height, format, copies))) => {
                let on_consumed = FrameConsumed::new(self.planes.clone());
                if format == PixelFormat::Rgba {
                    let bytes = copies.into_iter().next().unwrap_or_default();
                    self.video_sink.render_packed_frame(width, height, bytes, on_consumed);
                } else {
                    self.video_sink
                        .render_planar_frame(width, height, format, copies, on_consumed);
                }
                self.observer.on_progress(pts);
                self.buffers.video().recycle(frame);
                self.observer.on_render_success();
            }
            Ok(None) => {
                warn!("⚠️ 视频缓冲没有图像数据");
                self.buffers.video().recycle(frame);
            }
            Err(e) => debug!("♻️ 视频帧在渲染前被回收: {}", e),
        }
    }

    fn on_render_audio(&mut self) {
        let Some(sink) = self.audio_sink.as_mut() else {
            for frame in self.pending_audio.drain(..) {
                self.buffers.audio().recycle(frame);
            }
            return;
        };
        while sink.queue_depth() < self.max_audio_queue_count {
            let Some(frame) = self.pending_audio.pop_front() else {
                break;
            };
            let outcome = self
                .buffers
                .audio()
                .with_buffer(&frame, |b| sink.enqueue(b.bytes().unwrap_or(&[]), b.pts));
            match outcome {
                Ok(EnqueueResult::Accepted) => self.rendering_audio.push_back(frame),
                Ok(EnqueueResult::Rejected) => {
                    let e = PlayerError::SinkRejection("音频输出拒绝缓冲".to_string());
                    warn!("⚠️ {}", e);
                    self.buffers.audio().recycle(frame);
                }
                Err(e) => debug!("♻️ 音频帧在投递前被回收: {}", e),
            }
        }
    }

    fn on_audio_consumed(&mut self, epoch: u64, now: Instant) {
        if epoch != self.audio_epoch() {
            debug!("♻️ 忽略 flush 之前的音频消费回调（纪元 {}）", epoch);
            return;
        }
        let Some(frame) = self.rendering_audio.pop_front() else {
            return;
        };
        let pts = self.buffers.audio().pts(&frame);
        self.buffers.audio().recycle(frame);
        if let Ok(pts) = pts {
            self.observer.on_progress(pts);
        }
        self.observer.on_render_success();
        if !self.pending_audio.is_empty() {
            self.post_at(TimerKind::RenderAudio, now);
        }
    }

    fn on_request_render(&mut self, now: Instant) {
        let current = self.state.get();
        let Some(next) = current.on_request_render() else {
            debug!("⏭ 渲染器状态 {:?} 不接受 RequestRender", current);
            return;
        };
        if matches!(
            current,
            RendererState::Paused | RendererState::Prepared | RendererState::RenderEnd
        ) {
            self.clock.reset();
        }
        self.state.set(next);
        self.cancel(TimerKind::Tick);
        self.post_at(TimerKind::Tick, now);
        debug!("▶️ 渲染器 {:?} -> {:?}", current, next);
    }

    /// 不保留待渲染缓冲的暂停（seek / stop 使用）在任何状态下都会清掉计时和待渲染缓冲
    fn on_request_pause(&mut self, keep_pending: bool) {
        let current = self.state.get();
        let next = current.on_request_pause();
        if next.is_none() && keep_pending {
            debug!("⏭ 渲染器状态 {:?} 不接受 RequestPause", current);
            return;
        }
        self.cancel_all();
        self.drain_pending(keep_pending);
        if let Some(next) = next {
            self.state.set(next);
            debug!("⏸ 渲染器 {:?} -> {:?}（保留待渲染缓冲: {}）", current, next, keep_pending);
        }
    }

    fn cancel_all(&mut self) {
        self.timers.clear();
    }

    /// 待渲染缓冲从最后一个开始放回就绪队列头部，保持原顺序
    fn drain_pending(&mut self, keep_pending: bool) {
        let groups = [
            (&mut self.pending_video, self.buffers.video()),
            (&mut self.pending_audio, self.buffers.audio()),
        ];
        for (pending, pool) in groups {
            while let Some(frame) = pending.pop_back() {
                if keep_pending {
                    if let Err(e) = pool.requeue_front(frame) {
                        debug!("♻️ 放回就绪队列失败: {}", e);
                    }
                } else {
                    pool.recycle(frame);
                }
            }
        }
    }

    fn on_render_end(&mut self) {
        if self
            .state
            .compare_and_set(RendererState::Rendering, RendererState::RenderEnd)
            || self
                .state
                .compare_and_set(RendererState::WaitingDecoder, RendererState::RenderEnd)
        {
            self.cancel(TimerKind::Tick);
            info!("🏁 渲染结束");
            self.observer.on_render_end();
        }
    }

    fn on_seek_buffers(&mut self, targets: SeekTargets) {
        self.cancel_all();
        self.drain_pending(false);
        self.retire_rendering_audio();

        let SeekTargets {
            video,
            audio,
            success,
            target_ms,
        } = targets;
        let mut position = None;
        for (target, pool) in [(video, self.buffers.video()), (audio, self.buffers.audio())] {
            let keep: Vec<&BufferHandle> = target.iter().collect();
            let flushed = pool.flush_all_except(&keep);
            debug!("🧹 seek 回收 {:?} 缓冲 {} 个", pool.kind(), flushed);
            if let Some(frame) = target {
                if position.is_none() {
                    position = pool.with_buffer(&frame, |b| (!b.is_last()).then_some(b.pts)).ok().flatten();
                }
                place_seek_target(pool, frame, success);
            }
        }

        self.clock.reset();
        self.last_video_pts = None;
        self.last_audio_pts = None;
        self.video_ended = false;
        self.audio_ended = false;

        let position = if success { position.unwrap_or(target_ms) } else { target_ms };
        info!("⏩ seek 缓冲就位: success={} position={}ms", success, position);
        self.observer.on_seek_finished(success, position);
    }

    /// 回收已交给输出端的音频帧，之后到达的旧回调都会被忽略
    fn retire_rendering_audio(&mut self) {
        self.audio_epoch.fetch_add(1, Ordering::SeqCst);
        for frame in self.rendering_audio.drain(..) {
            self.buffers.audio().recycle(frame);
        }
    }

    fn audio_flush(&mut self) {
        self.retire_rendering_audio();
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.flush();
        }
    }

    fn release(&mut self) {
        self.cancel_all();
        self.drain_pending(false);
        self.audio_flush();
        if let Some(sink) = self.audio_sink.as_mut() {
            sink.release();
        }
        self.state.set(RendererState::Released);
        info!("{} 🗑 渲染器已释放", log_ctx());
    }
}

/// seek 成功时目标帧进入就绪队列，失败则回收
fn place_seek_target(pool: &BufferPool, frame: BufferHandle, success: bool) {
    let placed = if success {
        pool.release(frame, BufferState::Ready)
    } else {
        pool.release(frame, BufferState::Free)
    };
    if let Err(e) = placed {
        warn!("⚠️ seek 目标帧失效: {}", e);
    }
}

/// 渲染线程
pub struct SchedulerThread {
    event_tx: Sender<RenderEvent>,
    state: Arc<AtomicRendererState>,
    thread_handle: Option<JoinHandle<()>>,
}

impl SchedulerThread {
    pub fn start(
        config: &EngineConfig,
        media: &MediaInfo,
        buffers: Arc<BufferManager>,
        sinks: RenderSinks,
        observer: Arc<dyn RenderObserver>,
    ) -> Result<Self> {
        let (event_tx, event_rx) = unbounded::<RenderEvent>();

        let state = Arc::new(AtomicRendererState::new(RendererState::NotInit));
        let mut scheduler = SyncScheduler::new(config, media, buffers, state.clone(), sinks, observer);
        // 音频消费回调转成渲染线程事件
        let consumed_tx = event_tx.clone();
        scheduler.attach_audio(move |epoch| {
            let _ = consumed_tx.send(RenderEvent::AudioConsumed { epoch });
        });
        let thread_handle = thread::Builder::new()
            .name("render".to_string())
            .spawn(move || Self::render_loop(scheduler, event_rx))
            .map_err(|e| PlayerError::Thread(format!("启动渲染线程失败: {}", e)))?;

        Ok(Self {
            event_tx,
            state,
            thread_handle: Some(thread_handle),
        })
    }

    fn render_loop(mut scheduler: SyncScheduler, event_rx: Receiver<RenderEvent>) {
        info!("{} 🎞 渲染线程启动", log_ctx());
        loop {
            let received = match scheduler.next_deadline() {
                Some(deadline) => event_rx.recv_deadline(deadline),
                None => event_rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(RenderEvent::Release) => {
                    scheduler.handle(RenderEvent::Release, Instant::now());
                    break;
                }
                Ok(event) => scheduler.handle(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    scheduler.handle(RenderEvent::Release, Instant::now());
                    break;
                }
            }
            scheduler.fire_due(Instant::now());
        }
        info!("{} 🛑 渲染线程退出", log_ctx());
    }

    pub fn post(&self, event: RenderEvent) {
        if self.event_tx.send(event).is_err() {
            debug!("渲染线程已退出，忽略事件");
        }
    }

    pub fn sender(&self) -> Sender<RenderEvent> {
        self.event_tx.clone()
    }

    pub fn state(&self) -> RendererState {
        self.state.get()
    }

    /// 释放渲染器并等待线程退出（可重复调用）
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = self.event_tx.send(RenderEvent::Release);
            if handle.join().is_err() {
                warn!("{} ⚠ 渲染线程异常退出", log_ctx());
            }
        }
    }
}

impl Drop for SchedulerThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ SchedulerThread 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}
