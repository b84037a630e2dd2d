use crate::core::{BufferKind, EngineConfig, MediaInfo, PlayerError, Result, StreamKind};
use crate::player::buffer_pool::{BufferHandle, BufferManager};
use crate::player::decode_dispatcher::{DecodeDispatcher, DecodeResult};
use crate::player::native::NativeDecoder;
use crate::player::packet_reader::{PacketReader, ReadOutcome};
use crate::player::scheduler::{RenderEvent, SeekTargets};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, info, warn};
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}

/// 解码线程命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerCommand {
    RequestRead,
    /// 有包缓冲回到空闲池
    PacketBufferReady,
    /// 有帧缓冲回到空闲池
    FrameBufferReady(StreamKind),
    Pause,
    Resume,
    Seek(i64), // ms
    Stop,
}

/// 流不可用时的回调（在解码线程中调用）
pub type FatalErrorHook = Arc<dyn Fn(PlayerError) + Send + Sync>;

/// 单个流的解码状态
struct StreamDecode {
    dispatcher: DecodeDispatcher,
    armed: bool,
    /// 上次因为没有空闲帧缓冲而停下
    waiting_frame: bool,
}

/// seek 期间单次解码的结果
enum SeekFrame {
    Target(BufferHandle),
    /// 解码出的帧早于目标，已回收
    Dropped,
    /// 这一轮没有解码出帧
    Pending,
}

/// 读包 + 解码线程
///
/// 持有原生解码器、读包器和两个解码调度器。所有缓冲的背压都来自池耗尽：
/// 读不到空闲包缓冲时等待 PacketBufferReady，拿不到空闲帧缓冲时等待
/// FrameBufferReady，两者都由缓冲池的空闲回调投递。
struct DecodeWorker {
    native: Box<dyn NativeDecoder>,
    buffers: Arc<BufferManager>,
    reader: PacketReader,
    video: Option<StreamDecode>,
    audio: Option<StreamDecode>,
    render_tx: Sender<RenderEvent>,
    on_fatal: FatalErrorHook,
    paused: bool,
    failed: bool,
    seek_max_decode_frames: usize,
}

impl DecodeWorker {
    fn stream_mut(&mut self, stream: StreamKind) -> Option<&mut StreamDecode> {
        match stream {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        }
    }

    fn arm(&mut self, stream: StreamKind) {
        if let Some(decode) = self.stream_mut(stream) {
            decode.armed = true;
        }
    }

    /// 帧缓冲释放只唤醒在等帧缓冲的流
    fn frame_buffer_ready(&mut self, stream: StreamKind) {
        if let Some(decode) = self.stream_mut(stream) {
            if decode.waiting_frame {
                decode.waiting_frame = false;
                decode.armed = true;
            }
        }
    }

    fn arm_all(&mut self) {
        self.arm(StreamKind::Video);
        self.arm(StreamKind::Audio);
    }

    fn needs_target(&self, stream: StreamKind, targets: &SeekTargets) -> bool {
        match stream {
            StreamKind::Video => self.video.is_some() && targets.video.is_none(),
            StreamKind::Audio => self.audio.is_some() && targets.audio.is_none(),
        }
    }

    fn has_work(&self) -> bool {
        if self.paused || self.failed {
            return false;
        }
        self.reader.wants_read()
            || self.video.as_ref().is_some_and(|d| d.armed)
            || self.audio.as_ref().is_some_and(|d| d.armed)
    }

    fn run(&mut self, command_rx: Receiver<WorkerCommand>) {
        info!("{} 🎬 解码线程启动: {}", log_ctx(), self.native.description());
        loop {
            // 有活干时只取已到达的命令，否则阻塞等待
            let command = if self.has_work() {
                match command_rx.try_recv() {
                    Ok(command) => Some(command),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match command_rx.recv() {
                    Ok(command) => Some(command),
                    Err(_) => break,
                }
            };

            match command {
                Some(WorkerCommand::Stop) => {
                    info!("{} ⏹ 解码线程收到停止命令", log_ctx());
                    break;
                }
                Some(command) => self.handle_command(command),
                None => self.step(),
            }
        }
        self.native.close();
        info!("{} 🛑 解码线程退出", log_ctx());
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::RequestRead => self.reader.request_read(),
            WorkerCommand::PacketBufferReady => self.reader.packet_buffer_ready(),
            WorkerCommand::FrameBufferReady(stream) => self.frame_buffer_ready(stream),
            WorkerCommand::Pause => {
                debug!("{} ⏸ 解码线程暂停", log_ctx());
                self.paused = true;
                self.reader.pause();
            }
            WorkerCommand::Resume => {
                debug!("{} ▶️ 解码线程恢复", log_ctx());
                self.paused = false;
                self.reader.resume();
                self.arm_all();
            }
            WorkerCommand::Seek(target_ms) => {
                info!("{} ⏩ 解码线程收到 Seek 命令: {}ms", log_ctx(), target_ms);
                self.seek(target_ms);
            }
            WorkerCommand::Stop => {}
        }
    }

    /// 执行一轮：读一个包，每个流解码一帧
    fn step(&mut self) {
        match self.reader.read_once(&mut *self.native) {
            ReadOutcome::Queued(stream) => self.arm(stream),
            // 文件读完，让解码端排空
            ReadOutcome::EndOfStream => self.arm_all(),
            _ => {}
        }

        for stream in [StreamKind::Video, StreamKind::Audio] {
            if let Err(e) = self.decode_step(stream) {
                error!("{} ❌ {:?} 解码不可恢复: {}", log_ctx(), stream, e);
                self.failed = true;
                (self.on_fatal)(e);
                return;
            }
        }
    }

    fn decode_step(&mut self, stream: StreamKind) -> Result<()> {
        let Some(decode) = (match stream {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        }) else {
            return Ok(());
        };
        if !decode.armed {
            return Ok(());
        }

        match decode.dispatcher.decode_next(&mut *self.native, &mut self.reader)? {
            DecodeResult::Success => {
                let _ = self.render_tx.send(RenderEvent::FrameReady);
            }
            DecodeResult::EndOfStream => {
                decode.armed = false;
                let _ = self.render_tx.send(RenderEvent::FrameReady);
            }
            DecodeResult::NeedMorePacket => decode.armed = false,
            DecodeResult::NoFreeBuffer => {
                decode.armed = false;
                decode.waiting_frame = true;
            }
            DecodeResult::Error | DecodeResult::Dropped => {}
        }
        Ok(())
    }

    /// Seek：清空包队列和解码器，定位后一直解码到两个流都找到不早于目标的帧
    ///
    /// 目标帧连同结果一起交给渲染线程；解码线程保持暂停，等播放器恢复。
    fn seek(&mut self, target_ms: i64) {
        self.paused = true;
        self.reader.flush();
        for decode in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            decode.dispatcher.flush(&mut *self.native);
            decode.armed = false;
            decode.waiting_frame = false;
        }
        // 旧帧全部回收；渲染线程手里的旧句柄随之失效
        self.buffers.video().flush_all();
        self.buffers.audio().flush_all();

        let success = match self.native.seek(target_ms) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} ⚠️ Seek 失败: {}", log_ctx(), e);
                false
            }
        };

        let mut targets = SeekTargets {
            video: None,
            audio: None,
            success,
            target_ms,
        };
        if success {
            if let Err(e) = self.decode_seek_targets(target_ms, &mut targets) {
                error!("{} ❌ Seek 解码不可恢复: {}", log_ctx(), e);
                self.failed = true;
                (self.on_fatal)(e);
            }
        }
        self.reader.pause();

        info!(
            "{} 🎯 Seek 目标帧: video={} audio={}",
            log_ctx(),
            targets.video.is_some(),
            targets.audio.is_some()
        );
        if self.render_tx.send(RenderEvent::SeekBuffers(targets)).is_err() {
            warn!("{} ⚠ 渲染线程已退出，丢弃 seek 结果", log_ctx());
        }
    }

    fn decode_seek_targets(&mut self, target_ms: i64, targets: &mut SeekTargets) -> Result<()> {
        self.reader.resume();
        let mut attempts = 0;
        let result = loop {
            let needed: Vec<StreamKind> = [StreamKind::Video, StreamKind::Audio]
                .into_iter()
                .filter(|stream| self.needs_target(*stream, targets))
                .collect();
            if needed.is_empty() {
                break Ok(());
            }
            if attempts >= self.seek_max_decode_frames {
                warn!("{} ⚠️ Seek 在 {} 次解码内没有找到全部目标帧", log_ctx(), attempts);
                break Ok(());
            }
            attempts += 1;
            let outcome = self.reader.read_once_for(&mut *self.native, &needed);

            let mut progressed = false;
            for stream in needed.iter().copied() {
                match self.decode_seek_frame(stream, target_ms)? {
                    SeekFrame::Target(frame) => {
                        progressed = true;
                        match stream {
                            StreamKind::Video => targets.video = Some(frame),
                            StreamKind::Audio => targets.audio = Some(frame),
                        }
                    }
                    SeekFrame::Dropped => progressed = true,
                    SeekFrame::Pending => {}
                }
            }
            // 包缓冲全被已就位的流占着，再读也读不到
            let starved = needed.iter().all(|stream| self.reader.queue(*stream).is_empty());
            if outcome == ReadOutcome::Skipped && starved && !progressed {
                warn!("{} ⚠️ Seek 时包缓冲耗尽，停止寻找目标帧", log_ctx());
                break Ok(());
            }
        };

        // 没找到目标帧的流，恢复后继续丢弃早于目标的帧
        for stream in [StreamKind::Video, StreamKind::Audio] {
            if self.needs_target(stream, targets) {
                if let Some(decode) = self.stream_mut(stream) {
                    decode.dispatcher.skip_before(target_ms);
                }
            }
        }
        result
    }

    /// 解码一帧：早于目标的帧直接回收，结束标记也算作目标
    fn decode_seek_frame(&mut self, stream: StreamKind, target_ms: i64) -> Result<SeekFrame> {
        let pool = self.buffers.pool(stream.frame_kind());
        let Some(decode) = (match stream {
            StreamKind::Video => self.video.as_mut(),
            StreamKind::Audio => self.audio.as_mut(),
        }) else {
            return Ok(SeekFrame::Pending);
        };
        let (result, frame) = decode.dispatcher.decode_frame(&mut *self.native, &mut self.reader)?;
        let Some(frame) = frame else {
            return Ok(match result {
                DecodeResult::Error => SeekFrame::Dropped,
                _ => SeekFrame::Pending,
            });
        };
        match result {
            DecodeResult::EndOfStream => Ok(SeekFrame::Target(frame)),
            _ => {
                let pts = pool.pts(&frame)?;
                if pts >= target_ms {
                    Ok(SeekFrame::Target(frame))
                } else {
                    pool.recycle(frame);
                    Ok(SeekFrame::Dropped)
                }
            }
        }
    }
}

/// 解码线程管理器
pub struct DecodeThread {
    thread_handle: Option<JoinHandle<()>>,
    command_tx: Sender<WorkerCommand>,
}

impl DecodeThread {
    /// 启动解码线程并注册缓冲池的空闲回调
    pub fn start(
        native: Box<dyn NativeDecoder>,
        media: &MediaInfo,
        config: &EngineConfig,
        buffers: Arc<BufferManager>,
        render_tx: Sender<RenderEvent>,
        on_fatal: FatalErrorHook,
    ) -> Result<Self> {
        let (command_tx, command_rx) = unbounded::<WorkerCommand>();

        let ready_tx = command_tx.clone();
        buffers.set_free_listener(Some(Arc::new(move |kind| {
            let command = match kind {
                BufferKind::Packet => WorkerCommand::PacketBufferReady,
                BufferKind::Video => WorkerCommand::FrameBufferReady(StreamKind::Video),
                BufferKind::Audio => WorkerCommand::FrameBufferReady(StreamKind::Audio),
            };
            let _ = ready_tx.send(command);
        })));

        let has_video = media.has_stream(StreamKind::Video);
        let has_audio = media.has_stream(StreamKind::Audio);
        let stream_decode = |stream| StreamDecode {
            dispatcher: DecodeDispatcher::new(stream, buffers.clone()),
            armed: false,
            waiting_frame: false,
        };
        let mut worker = DecodeWorker {
            native,
            reader: PacketReader::new(buffers.clone(), config.max_packet_queue, has_video, has_audio),
            video: has_video.then(|| stream_decode(StreamKind::Video)),
            audio: has_audio.then(|| stream_decode(StreamKind::Audio)),
            buffers: buffers.clone(),
            render_tx,
            on_fatal,
            paused: false,
            failed: false,
            seek_max_decode_frames: config.seek_max_decode_frames,
        };

        let thread_handle = thread::Builder::new()
            .name("decode".to_string())
            .spawn(move || worker.run(command_rx))
            .map_err(|e| PlayerError::Thread(format!("启动解码线程失败: {}", e)))?;

        Ok(Self {
            thread_handle: Some(thread_handle),
            command_tx,
        })
    }

    pub fn send(&self, command: WorkerCommand) {
        if self.command_tx.send(command).is_err() {
            debug!("解码线程已退出，忽略命令 {:?}", command);
        }
    }

    pub fn sender(&self) -> Sender<WorkerCommand> {
        self.command_tx.clone()
    }

    /// 停止线程并等待退出
    pub fn stop(&mut self) {
        if let Some(handle) = self.thread_handle.take() {
            info!("{} 🛑 DecodeThread::stop() called", log_ctx());
            let _ = self.command_tx.send(WorkerCommand::Stop);
            if handle.join().is_err() {
                warn!("{} ⚠ 解码线程异常退出", log_ctx());
            }
        }
    }
}

impl Drop for DecodeThread {
    fn drop(&mut self) {
        if self.thread_handle.is_some() {
            warn!("{} ⚠ DecodeThread 被 drop，但可能未调用 stop()，正在尝试优雅停止", log_ctx());
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::player::synthetic::{SyntheticDecoder, SyntheticMedia};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn start(media: SyntheticMedia, config: EngineConfig) -> (DecodeThread, Arc<BufferManager>, Receiver<RenderEvent>, Arc<Mutex<Vec<String>>>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut native = SyntheticDecoder::new(media);
        let info = native.open("synthetic://worker").unwrap();
        let buffers = Arc::new(BufferManager::new(&config));
        let (render_tx, render_rx) = unbounded();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        let worker = DecodeThread::start(
            Box::new(native),
            &info,
            &config,
            buffers.clone(),
            render_tx,
            Arc::new(move |e| sink.lock().push(e.to_string())),
        )
        .unwrap();
        (worker, buffers, render_rx, errors)
    }

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

    #[test]
    fn test_fills_ready_queues_until_pool_exhausted() {
        let config = EngineConfig::default();
        let (mut worker, buffers, _render_rx, _) = start(SyntheticMedia::av(50, 40, 100, 20), config.clone());
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || {
            buffers.video().ready_len() == config.video_frame_capacity
                && buffers.audio().ready_len() == config.audio_frame_capacity
        }));
        assert_eq!(buffers.video().ready_pts(), vec![0, 40, 80, 120, 160, 200]);
        worker.stop();
        buffers.audit().unwrap();
    }

    #[test]
    fn test_resumes_when_frames_are_recycled() {
        let config = EngineConfig {
            video_frame_capacity: 2,
            ..Default::default()
        };
        let (mut worker, buffers, _render_rx, _) = start(SyntheticMedia::video_only(4, 40), config);
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || buffers.video().ready_len() == 2));

        let mut rendered = Vec::new();
        while rendered.len() < 5 {
            if let Some(frame) = buffers.video().take_ready() {
                let (pts, last) = buffers.video().with_buffer(&frame, |b| (b.pts, b.is_last())).unwrap();
                rendered.push((pts, last));
                buffers.video().recycle(frame);
            } else {
                thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(rendered, vec![(0, false), (40, false), (80, false), (120, false), (120, true)]);
        worker.stop();
    }

    #[test]
    fn test_seek_hands_targets_to_renderer() {
        let (mut worker, buffers, render_rx, _) = start(SyntheticMedia::av(50, 40, 100, 20), EngineConfig::default());
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || buffers.video().ready_len() > 0));

        worker.send(WorkerCommand::Pause);
        worker.send(WorkerCommand::Seek(500));
        let targets = loop {
            match render_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                RenderEvent::SeekBuffers(targets) => break targets,
                _ => continue,
            }
        };
        assert!(targets.success);
        let video = targets.video.unwrap();
        let audio = targets.audio.unwrap();
        // 视频从关键帧 400 开始解码，第一个不早于 500 的帧是 520
        assert_eq!(buffers.video().pts(&video).unwrap(), 520);
        assert_eq!(buffers.audio().pts(&audio).unwrap(), 500);
        // 旧帧全部回收
        assert_eq!(buffers.video().ready_len(), 0);
        worker.stop();
    }

    fn seek_targets(worker: &DecodeThread, render_rx: &Receiver<RenderEvent>, target_ms: i64) -> SeekTargets {
        worker.send(WorkerCommand::Pause);
        worker.send(WorkerCommand::Seek(target_ms));
        loop {
            match render_rx.recv_timeout(Duration::from_secs(2)).unwrap() {
                RenderEvent::SeekBuffers(targets) => return targets,
                _ => continue,
            }
        }
    }

    #[test]
    fn test_blocked_worker_stays_idle() {
        let config = EngineConfig {
            audio_frame_capacity: 1,
            max_packet_queue: 2,
            ..Default::default()
        };
        let (mut worker, buffers, _render_rx, _) = start(SyntheticMedia::av(200, 40, 400, 20), config);

        // 统计视频帧缓冲的释放次数，再转交给解码线程
        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let ready_tx = worker.sender();
        buffers.set_free_listener(Some(Arc::new(move |kind| {
            let command = match kind {
                BufferKind::Packet => WorkerCommand::PacketBufferReady,
                BufferKind::Video => {
                    counter.fetch_add(1, Ordering::SeqCst);
                    WorkerCommand::FrameBufferReady(StreamKind::Video)
                }
                BufferKind::Audio => WorkerCommand::FrameBufferReady(StreamKind::Audio),
            };
            let _ = ready_tx.send(command);
        })));

        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || buffers.audio().ready_len() == 1));
        thread::sleep(Duration::from_millis(200));

        // 音频队列满、视频等包：没有任何缓冲进出
        released.store(0, Ordering::SeqCst);
        let counts = buffers.video().counts();
        thread::sleep(Duration::from_millis(300));
        assert_eq!(released.load(Ordering::SeqCst), 0);
        assert_eq!(buffers.video().counts(), counts);
        worker.stop();
    }

    #[test]
    fn test_seek_finds_target_behind_dense_stream() {
        let config = EngineConfig {
            max_packet_queue: 4,
            ..Default::default()
        };
        let mut media = SyntheticMedia::av(30, 40, 1000, 1);
        media.keyframe_interval = 1;
        let (mut worker, buffers, render_rx, _) = start(media, config);
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || buffers.video().ready_len() > 0));

        // 音频目标 500 之后还有 19 个音频包排在视频 520 之前
        let targets = seek_targets(&worker, &render_rx, 500);
        assert!(targets.success);
        assert_eq!(buffers.video().pts(targets.video.as_ref().unwrap()).unwrap(), 520);
        assert_eq!(buffers.audio().pts(targets.audio.as_ref().unwrap()).unwrap(), 500);
        worker.stop();
    }

    #[test]
    fn test_frames_before_target_dropped_after_incomplete_seek() {
        let config = EngineConfig {
            seek_max_decode_frames: 1,
            ..Default::default()
        };
        let (mut worker, buffers, render_rx, _) = start(SyntheticMedia::av(50, 40, 100, 20), config);
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || buffers.video().ready_len() > 0));

        let targets = seek_targets(&worker, &render_rx, 500);
        assert!(targets.video.is_none());
        assert!(targets.audio.is_none());

        worker.send(WorkerCommand::Resume);
        assert!(wait_until(Duration::from_secs(2), || {
            buffers.video().ready_len() >= 3 && buffers.audio().ready_len() >= 3
        }));
        // 关键帧 400 起的 400/440/480 都不会进入就绪队列
        assert_eq!(buffers.video().ready_pts().first(), Some(&520));
        assert!(buffers.audio().ready_pts().iter().all(|pts| *pts >= 500));
        worker.stop();
        buffers.audit().unwrap();
    }

    #[test]
    fn test_fatal_error_reported_once() {
        let mut media = SyntheticMedia::video_only(10, 40);
        media.fatal_video_pts = Some(80);
        let (mut worker, _buffers, _render_rx, errors) = start(media, EngineConfig::default());
        worker.send(WorkerCommand::RequestRead);
        assert!(wait_until(Duration::from_secs(2), || !errors.lock().is_empty()));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(errors.lock().len(), 1);
        worker.stop();
    }
}
