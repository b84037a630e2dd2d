//! 播放器与渲染器状态机
//!
//! 状态转换写成纯函数 `(state, event) -> Option<state>`，返回 None 表示
//! 当前状态不接受该事件；状态单元只负责原子地存储结果。

use crate::core::MediaInfo;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// 渲染器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RendererState {
    NotInit = 0,
    Prepared = 1,
    Rendering = 2,
    Paused = 3,
    WaitingDecoder = 4,
    RenderEnd = 5,
    Released = 6,
}

impl RendererState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => RendererState::Prepared,
            2 => RendererState::Rendering,
            3 => RendererState::Paused,
            4 => RendererState::WaitingDecoder,
            5 => RendererState::RenderEnd,
            6 => RendererState::Released,
            _ => RendererState::NotInit,
        }
    }

    /// Request-Render：暂停 / 等待解码 / 渲染结束 / 已准备 -> 渲染中
    pub fn on_request_render(self) -> Option<Self> {
        match self {
            RendererState::RenderEnd
            | RendererState::WaitingDecoder
            | RendererState::Paused
            | RendererState::Prepared => Some(RendererState::Rendering),
            _ => None,
        }
    }

    /// Request-Pause：渲染中 / 等待解码 -> 暂停
    pub fn on_request_pause(self) -> Option<Self> {
        match self {
            RendererState::Rendering | RendererState::WaitingDecoder => Some(RendererState::Paused),
            _ => None,
        }
    }
}

/// 渲染器状态单元（单写者，读不阻塞）
#[derive(Debug)]
pub struct AtomicRendererState {
    value: AtomicU8,
}

impl AtomicRendererState {
    pub fn new(state: RendererState) -> Self {
        Self {
            value: AtomicU8::new(state as u8),
        }
    }

    pub fn get(&self) -> RendererState {
        RendererState::from_u8(self.value.load(Ordering::Acquire))
    }

    pub fn set(&self, state: RendererState) {
        self.value.store(state as u8, Ordering::Release);
    }

    /// 仅当当前值为 `current` 时写入 `new`
    pub fn compare_and_set(&self, current: RendererState, new: RendererState) -> bool {
        self.value
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// 播放器状态
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerState {
    NoInit,
    Prepared(Arc<MediaInfo>),
    Playing(Arc<MediaInfo>),
    Paused(Arc<MediaInfo>),
    /// 包裹 seek 结束后要恢复的状态
    Seeking(Box<PlayerState>),
    Stopped(Arc<MediaInfo>),
    PlayEnd(Arc<MediaInfo>),
    Error(String),
    Released,
}

/// 驱动播放器状态变化的事件
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    Prepared(Arc<MediaInfo>),
    Play,
    Pause,
    SeekStart,
    /// 从停止 / 播放结束重新从头播放
    Replay,
    SeekFinished,
    Stop,
    RenderEnd,
    Fail(String),
    Release,
}

impl PlayerState {
    pub fn media_info(&self) -> Option<&Arc<MediaInfo>> {
        match self {
            PlayerState::Prepared(info)
            | PlayerState::Playing(info)
            | PlayerState::Paused(info)
            | PlayerState::Stopped(info)
            | PlayerState::PlayEnd(info) => Some(info),
            PlayerState::Seeking(last) => last.media_info(),
            PlayerState::NoInit | PlayerState::Error(_) | PlayerState::Released => None,
        }
    }

    /// 纯状态转换；None 表示该事件在当前状态下非法
    pub fn transition(&self, event: &PlayerEvent) -> Option<PlayerState> {
        use PlayerState as S;
        match (self, event) {
            (S::Released, _) => None,
            (_, PlayerEvent::Release) => Some(S::Released),
            (_, PlayerEvent::Fail(msg)) => Some(S::Error(msg.clone())),
            (_, PlayerEvent::Prepared(info)) => Some(S::Prepared(info.clone())),

            (S::Prepared(info) | S::Paused(info), PlayerEvent::Play) => Some(S::Playing(info.clone())),
            (S::Playing(info), PlayerEvent::Pause) => Some(S::Paused(info.clone())),

            (S::Playing(_) | S::Paused(_), PlayerEvent::SeekStart) => Some(S::Seeking(Box::new(self.clone()))),
            (S::Stopped(info) | S::PlayEnd(info), PlayerEvent::Replay) => {
                Some(S::Seeking(Box::new(S::Playing(info.clone()))))
            }
            (S::Seeking(last), PlayerEvent::SeekFinished) => Some((**last).clone()),

            (
                S::Prepared(info) | S::Playing(info) | S::Paused(info) | S::PlayEnd(info),
                PlayerEvent::Stop,
            ) => Some(S::Stopped(info.clone())),
            (S::Seeking(last), PlayerEvent::Stop) => last.media_info().map(|info| S::Stopped(info.clone())),

            (S::Playing(info), PlayerEvent::RenderEnd) => Some(S::PlayEnd(info.clone())),
            _ => None,
        }
    }

    /// 该状态下是否分发进度
    pub fn allows_progress(&self) -> bool {
        !matches!(
            self,
            PlayerState::PlayEnd(_)
                | PlayerState::Error(_)
                | PlayerState::Stopped(_)
                | PlayerState::Seeking(_)
                | PlayerState::NoInit
        )
    }

    pub fn is_playing(&self) -> bool {
        matches!(self, PlayerState::Playing(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            PlayerState::NoInit => "NoInit",
            PlayerState::Prepared(_) => "Prepared",
            PlayerState::Playing(_) => "Playing",
            PlayerState::Paused(_) => "Paused",
            PlayerState::Seeking(_) => "Seeking",
            PlayerState::Stopped(_) => "Stopped",
            PlayerState::PlayEnd(_) => "PlayEnd",
            PlayerState::Error(_) => "Error",
            PlayerState::Released => "Released",
        }
    }
}

/// 播放器状态单元
pub struct PlayerStateCell {
    inner: RwLock<PlayerState>,
}

impl PlayerStateCell {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PlayerState::NoInit),
        }
    }

    pub fn get(&self) -> PlayerState {
        self.inner.read().clone()
    }

    /// 应用事件；状态实际发生变化时返回新状态
    pub fn apply(&self, event: &PlayerEvent) -> Option<PlayerState> {
        let mut state = self.inner.write();
        let next = state.transition(event)?;
        if next == *state {
            return None;
        }
        *state = next.clone();
        Some(next)
    }
}

impl Default for PlayerStateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> Arc<MediaInfo> {
        Arc::new(MediaInfo {
            duration: 10_000,
            ..Default::default()
        })
    }

    #[test]
    fn test_renderer_transitions() {
        use RendererState::*;
        for s in [RenderEnd, WaitingDecoder, Paused, Prepared] {
            assert_eq!(s.on_request_render(), Some(Rendering));
        }
        for s in [NotInit, Rendering, Released] {
            assert_eq!(s.on_request_render(), None);
        }
        assert_eq!(Rendering.on_request_pause(), Some(Paused));
        assert_eq!(WaitingDecoder.on_request_pause(), Some(Paused));
        assert_eq!(Prepared.on_request_pause(), None);
        assert_eq!(RenderEnd.on_request_pause(), None);
    }

    #[test]
    fn test_atomic_renderer_state_cas() {
        let cell = AtomicRendererState::new(RendererState::WaitingDecoder);
        assert!(!cell.compare_and_set(RendererState::Paused, RendererState::Rendering));
        assert!(cell.compare_and_set(RendererState::WaitingDecoder, RendererState::Rendering));
        assert_eq!(cell.get(), RendererState::Rendering);
    }

    #[test]
    fn test_player_happy_path() {
        let info = info();
        let s = PlayerState::NoInit.transition(&PlayerEvent::Prepared(info.clone())).unwrap();
        let s = s.transition(&PlayerEvent::Play).unwrap();
        assert!(s.is_playing());
        let s = s.transition(&PlayerEvent::Pause).unwrap();
        assert_eq!(s, PlayerState::Paused(info.clone()));
        let s = s.transition(&PlayerEvent::SeekStart).unwrap();
        assert_eq!(s.media_info(), Some(&info));
        let s = s.transition(&PlayerEvent::SeekFinished).unwrap();
        assert_eq!(s, PlayerState::Paused(info.clone()));
        let s = s.transition(&PlayerEvent::Play).unwrap();
        let s = s.transition(&PlayerEvent::RenderEnd).unwrap();
        assert_eq!(s, PlayerState::PlayEnd(info.clone()));
        let s = s.transition(&PlayerEvent::Replay).unwrap();
        assert_eq!(s.transition(&PlayerEvent::SeekFinished), Some(PlayerState::Playing(info)));
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let info = info();
        assert_eq!(PlayerState::NoInit.transition(&PlayerEvent::Play), None);
        assert_eq!(PlayerState::Paused(info.clone()).transition(&PlayerEvent::Pause), None);
        assert_eq!(PlayerState::Paused(info.clone()).transition(&PlayerEvent::RenderEnd), None);
        assert_eq!(PlayerState::Prepared(info.clone()).transition(&PlayerEvent::SeekStart), None);
        assert_eq!(PlayerState::NoInit.transition(&PlayerEvent::Stop), None);
        // Released 是终态
        assert_eq!(PlayerState::Released.transition(&PlayerEvent::Prepared(info)), None);
        assert_eq!(PlayerState::Released.transition(&PlayerEvent::Release), None);
    }

    #[test]
    fn test_error_and_release_from_anywhere() {
        let info = info();
        let states = [
            PlayerState::NoInit,
            PlayerState::Prepared(info.clone()),
            PlayerState::Seeking(Box::new(PlayerState::Playing(info.clone()))),
            PlayerState::Stopped(info),
        ];
        for s in states {
            assert!(matches!(s.transition(&PlayerEvent::Fail("x".into())), Some(PlayerState::Error(_))));
            assert_eq!(s.transition(&PlayerEvent::Release), Some(PlayerState::Released));
        }
    }

    #[test]
    fn test_progress_suppressed_states() {
        let info = info();
        assert!(PlayerState::Playing(info.clone()).allows_progress());
        assert!(PlayerState::Paused(info.clone()).allows_progress());
        assert!(!PlayerState::Seeking(Box::new(PlayerState::Playing(info.clone()))).allows_progress());
        assert!(!PlayerState::PlayEnd(info.clone()).allows_progress());
        assert!(!PlayerState::Stopped(info).allows_progress());
        assert!(!PlayerState::NoInit.allows_progress());
        assert!(!PlayerState::Error("e".into()).allows_progress());
    }

    #[test]
    fn test_cell_ignores_noop_changes() {
        let cell = PlayerStateCell::new();
        let info = info();
        assert!(cell.apply(&PlayerEvent::Prepared(info.clone())).is_some());
        // 相同状态不会重复通知
        assert!(cell.apply(&PlayerEvent::Prepared(info)).is_none());
        assert!(cell.apply(&PlayerEvent::Pause).is_none());
        assert!(cell.apply(&PlayerEvent::Play).is_some());
        assert!(cell.apply(&PlayerEvent::Release).is_some());
        assert!(cell.apply(&PlayerEvent::Release).is_none());
    }
}
