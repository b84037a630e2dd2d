//! 固定容量的缓冲池
//!
//! 每个缓冲槽在池初始化时分配一次，会话内不增不减。槽上有显式的
//! [`BufferState`] 标记和代数（generation），句柄只能通过移动转移归属；
//! 强制回收（seek/stop）会让旧句柄失效，之后再归还会被拒绝而不是重复释放。

use crate::core::{BufferKind, BufferState, EngineConfig, MediaBuffer, PlayerError, Result};
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;

/// 缓冲句柄（不可复制，归属随移动转移）
#[derive(Debug, PartialEq, Eq)]
pub struct BufferHandle {
    kind: BufferKind,
    index: u32,
    generation: u32,
}

impl BufferHandle {
    pub fn kind(&self) -> BufferKind {
        self.kind
    }
}

/// 缓冲回到空闲队列时的通知
pub type FreeListener = Arc<dyn Fn(BufferKind) + Send + Sync>;

/// 各逻辑队列中的缓冲数量
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolCounts {
    pub free: usize,
    pub pending_decode: usize,
    pub ready: usize,
    pub rendering: usize,
}

impl PoolCounts {
    pub fn total(&self) -> usize {
        self.free + self.pending_decode + self.ready + self.rendering
    }
}

struct Slot {
    state: BufferState,
    generation: u32,
    buffer: MediaBuffer,
}

struct PoolInner {
    slots: Vec<Slot>,
    free: VecDeque<u32>,
    ready: VecDeque<u32>,
}

impl PoolInner {
    fn slot_mut(&mut self, handle: &BufferHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot)
                if slot.generation == handle.generation
                    && matches!(slot.state, BufferState::PendingDecode | BufferState::Rendering) =>
            {
                Ok(slot)
            }
            _ => Err(PlayerError::StaleBuffer {
                kind: handle.kind,
                index: handle.index,
            }),
        }
    }
}

/// 单一类型的缓冲池
pub struct BufferPool {
    kind: BufferKind,
    capacity: usize,
    inner: Mutex<PoolInner>,
    free_listener: RwLock<Option<FreeListener>>,
}

impl BufferPool {
    pub fn new(kind: BufferKind, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| Slot {
                state: BufferState::Free,
                generation: 0,
                buffer: MediaBuffer::new(kind),
            })
            .collect();
        Self {
            kind,
            capacity,
            inner: Mutex::new(PoolInner {
                slots,
                free: (0..capacity as u32).collect(),
                ready: VecDeque::with_capacity(capacity),
            }),
            free_listener: RwLock::new(None),
        }
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn set_free_listener(&self, listener: Option<FreeListener>) {
        *self.free_listener.write() = listener;
    }

    fn notify_free(&self) {
        let listener = self.free_listener.read().clone();
        if let Some(listener) = listener {
            listener(self.kind);
        }
    }

    /// 取一个空闲缓冲（非阻塞，池耗尽返回 None）
    ///
    /// 取出的缓冲已清空，状态为 PendingDecode。
    pub fn acquire_free(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock();
        let index = inner.free.pop_front()?;
        let slot = &mut inner.slots[index as usize];
        slot.state = BufferState::PendingDecode;
        slot.buffer.reset();
        Some(BufferHandle {
            kind: self.kind,
            index,
            generation: slot.generation,
        })
    }

    /// 取一个空闲缓冲，池耗尽时返回 `ResourceExhausted`
    pub fn acquire(&self) -> Result<BufferHandle> {
        self.acquire_free().ok_or(PlayerError::ResourceExhausted(self.kind))
    }

    /// 把缓冲移动到指定队列
    pub fn release(&self, handle: BufferHandle, destination: BufferState) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            let slot = inner.slot_mut(&handle)?;
            slot.state = destination;
            match destination {
                BufferState::Free => inner.free.push_back(handle.index),
                BufferState::Ready => inner.ready.push_back(handle.index),
                BufferState::PendingDecode | BufferState::Rendering => {}
            }
        }
        if destination == BufferState::Free {
            self.notify_free();
        }
        Ok(())
    }

    /// 归还到空闲队列；过期句柄只记录日志
    pub fn recycle(&self, handle: BufferHandle) {
        match self.release(handle, BufferState::Free) {
            Ok(()) => {}
            // 强制回收之后归还旧句柄是正常情况
            Err(e @ PlayerError::StaleBuffer { .. }) => debug!("♻️ 忽略过期句柄: {}", e),
            Err(e) => warn!("⚠️ 回收缓冲失败: {}", e),
        }
    }

    /// 取出最早就绪的缓冲，状态变为 Rendering
    pub fn take_ready(&self) -> Option<BufferHandle> {
        let mut inner = self.inner.lock();
        let index = inner.ready.pop_front()?;
        let slot = &mut inner.slots[index as usize];
        slot.state = BufferState::Rendering;
        Some(BufferHandle {
            kind: self.kind,
            index,
            generation: slot.generation,
        })
    }

    /// 放回就绪队列头部（暂停时保留待渲染缓冲）
    pub fn requeue_front(&self, handle: BufferHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(&handle)?;
        slot.state = BufferState::Ready;
        inner.ready.push_front(handle.index);
        Ok(())
    }

    pub fn with_buffer<R>(&self, handle: &BufferHandle, f: impl FnOnce(&MediaBuffer) -> R) -> Result<R> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        Ok(f(&slot.buffer))
    }

    pub fn with_buffer_mut<R>(
        &self,
        handle: &BufferHandle,
        f: impl FnOnce(&mut MediaBuffer) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.lock();
        let slot = inner.slot_mut(handle)?;
        Ok(f(&mut slot.buffer))
    }

    /// 在锁外读写缓冲内容（解码等耗时操作使用）
    ///
    /// 句柄持有者独占该槽，期间槽内暂放一个空缓冲；只有持有句柄的线程会
    /// 取用空闲缓冲，所以归还时不会覆盖别人的数据。
    pub fn with_buffer_detached<R>(
        &self,
        handle: &BufferHandle,
        f: impl FnOnce(&mut MediaBuffer) -> R,
    ) -> Result<R> {
        let mut buffer = {
            let mut inner = self.inner.lock();
            let slot = inner.slot_mut(handle)?;
            std::mem::replace(&mut slot.buffer, MediaBuffer::new(self.kind))
        };
        let result = f(&mut buffer);
        if let Some(slot) = self.inner.lock().slots.get_mut(handle.index as usize) {
            slot.buffer = buffer;
        }
        Ok(result)
    }

    pub fn pts(&self, handle: &BufferHandle) -> Result<i64> {
        self.with_buffer(handle, |b| b.pts)
    }

    /// 就绪队列中最后一个非结束标记缓冲的 pts
    pub fn peek_last_ready_pts(&self) -> Option<i64> {
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .rev()
            .map(|&i| &inner.slots[i as usize].buffer)
            .find(|b| !b.is_last())
            .map(|b| b.pts)
    }

    /// 就绪队列中各缓冲的 pts（按出队顺序）
    pub fn ready_pts(&self) -> Vec<i64> {
        let inner = self.inner.lock();
        inner
            .ready
            .iter()
            .map(|&i| inner.slots[i as usize].buffer.pts)
            .collect()
    }

    /// 强制把所有非空闲缓冲收回空闲队列
    pub fn flush_all(&self) -> usize {
        self.flush_all_except(&[])
    }

    /// 强制回收，保留 `keep` 中的句柄；被回收的句柄全部失效
    pub fn flush_all_except(&self, keep: &[&BufferHandle]) -> usize {
        let flushed = {
            let mut inner = self.inner.lock();
            let mut flushed = Vec::new();
            for (index, slot) in inner.slots.iter_mut().enumerate() {
                let kept = keep
                    .iter()
                    .any(|h| h.index as usize == index && h.generation == slot.generation);
                if slot.state != BufferState::Free && !kept {
                    slot.state = BufferState::Free;
                    slot.generation = slot.generation.wrapping_add(1);
                    flushed.push(index as u32);
                }
            }
            inner.ready.clear();
            inner.free.extend(flushed.iter().copied());
            flushed.len()
        };
        if flushed > 0 {
            debug!("🧹 {:?} 缓冲池强制回收 {} 个缓冲", self.kind, flushed);
            self.notify_free();
        }
        flushed
    }

    pub fn counts(&self) -> PoolCounts {
        let inner = self.inner.lock();
        let mut counts = PoolCounts::default();
        for slot in &inner.slots {
            match slot.state {
                BufferState::Free => counts.free += 1,
                BufferState::PendingDecode => counts.pending_decode += 1,
                BufferState::Ready => counts.ready += 1,
                BufferState::Rendering => counts.rendering += 1,
            }
        }
        counts
    }

    pub fn free_len(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// 归属审计：每个缓冲只出现在其标记对应的队列里，且只出现一次
    pub fn audit(&self) -> Result<()> {
        let inner = self.inner.lock();
        let mut seen = vec![false; inner.slots.len()];
        let queues = [
            ("free", &inner.free, BufferState::Free),
            ("ready", &inner.ready, BufferState::Ready),
        ];
        for (name, queue, expected) in queues {
            for &index in queue.iter() {
                let i = index as usize;
                if seen[i] {
                    return Err(PlayerError::OwnershipViolation(format!(
                        "{:?}#{} 同时出现在多个队列（{}）",
                        self.kind, index, name
                    )));
                }
                seen[i] = true;
                if inner.slots[i].state != expected {
                    return Err(PlayerError::OwnershipViolation(format!(
                        "{:?}#{} 在 {} 队列中但标记为 {:?}",
                        self.kind, index, name, inner.slots[i].state
                    )));
                }
            }
        }
        for (i, slot) in inner.slots.iter().enumerate() {
            let queued = matches!(slot.state, BufferState::Free | BufferState::Ready);
            if queued && !seen[i] {
                return Err(PlayerError::OwnershipViolation(format!(
                    "{:?}#{} 标记为 {:?} 但不在对应队列中",
                    self.kind, i, slot.state
                )));
            }
        }
        Ok(())
    }
}

/// 缓冲管理器：视频帧、音频帧、压缩包三个池
pub struct BufferManager {
    video: BufferPool,
    audio: BufferPool,
    packet: BufferPool,
}

impl BufferManager {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            video: BufferPool::new(BufferKind::Video, config.video_frame_capacity),
            audio: BufferPool::new(BufferKind::Audio, config.audio_frame_capacity),
            packet: BufferPool::new(BufferKind::Packet, config.packet_capacity),
        }
    }

    pub fn pool(&self, kind: BufferKind) -> &BufferPool {
        match kind {
            BufferKind::Video => &self.video,
            BufferKind::Audio => &self.audio,
            BufferKind::Packet => &self.packet,
        }
    }

    pub fn video(&self) -> &BufferPool {
        &self.video
    }

    pub fn audio(&self) -> &BufferPool {
        &self.audio
    }

    pub fn packet(&self) -> &BufferPool {
        &self.packet
    }

    /// 按句柄类型回收
    pub fn recycle(&self, handle: BufferHandle) {
        self.pool(handle.kind()).recycle(handle);
    }

    pub fn set_free_listener(&self, listener: Option<FreeListener>) {
        for pool in [&self.video, &self.audio, &self.packet] {
            pool.set_free_listener(listener.clone());
        }
    }

    pub fn audit(&self) -> Result<()> {
        self.video.audit()?;
        self.audio.audit()?;
        self.packet.audit()
    }
}

/// 交给视频输出的平面字节缓冲（输出端消费完后归还）
pub struct PlaneBufferPool {
    cached: Mutex<Vec<Vec<u8>>>,
    max_cached: usize,
}

impl PlaneBufferPool {
    pub fn new(max_cached: usize) -> Self {
        Self {
            cached: Mutex::new(Vec::with_capacity(max_cached)),
            max_cached,
        }
    }

    /// 取一个长度为 `size` 的字节缓冲，优先复用容量足够的旧缓冲
    pub fn request(&self, size: usize) -> Vec<u8> {
        let mut cached = self.cached.lock();
        let reuse = cached
            .iter()
            .enumerate()
            .filter(|(_, b)| b.capacity() >= size)
            .min_by_key(|(_, b)| b.capacity())
            .map(|(i, _)| i);
        let mut bytes = match reuse {
            Some(i) => cached.swap_remove(i),
            None => Vec::with_capacity(size),
        };
        bytes.clear();
        bytes.resize(size, 0);
        bytes
    }

    pub fn recycle(&self, bytes: Vec<u8>) {
        let mut cached = self.cached.lock();
        if cached.len() < self.max_cached {
            cached.push(bytes);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cached.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn assert_partition(pool: &BufferPool) {
        assert_eq!(pool.counts().total(), pool.capacity());
        pool.audit().unwrap();
    }

    #[test]
    fn test_exhaustion_returns_none() {
        let pool = BufferPool::new(BufferKind::Video, 2);
        let a = pool.acquire_free().unwrap();
        let b = pool.acquire_free().unwrap();
        assert!(pool.acquire_free().is_none());
        assert!(matches!(pool.acquire(), Err(PlayerError::ResourceExhausted(BufferKind::Video))));
        assert_eq!(pool.counts().pending_decode, 2);
        pool.recycle(a);
        assert!(pool.acquire_free().is_some());
        pool.recycle(b);
    }

    #[test]
    fn test_partition_holds_for_random_sequences() {
        // 简单 LCG，保证可重复
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        let pool = BufferPool::new(BufferKind::Audio, 5);
        let mut decoding: Vec<BufferHandle> = Vec::new();
        let mut rendering: Vec<BufferHandle> = Vec::new();

        for _ in 0..2000 {
            match next() % 6 {
                0 => {
                    if let Some(h) = pool.acquire_free() {
                        decoding.push(h);
                    }
                }
                1 if !decoding.is_empty() => {
                    let h = decoding.swap_remove(next() % decoding.len());
                    pool.release(h, BufferState::Ready).unwrap();
                }
                2 => {
                    if let Some(h) = pool.take_ready() {
                        rendering.push(h);
                    }
                }
                3 if !rendering.is_empty() => {
                    let h = rendering.swap_remove(next() % rendering.len());
                    pool.release(h, BufferState::Free).unwrap();
                }
                4 if !rendering.is_empty() => {
                    let h = rendering.swap_remove(next() % rendering.len());
                    pool.requeue_front(h).unwrap();
                }
                5 if !decoding.is_empty() => {
                    let h = decoding.swap_remove(next() % decoding.len());
                    pool.release(h, BufferState::Free).unwrap();
                }
                _ => {}
            }
            assert_partition(&pool);
            let counts = pool.counts();
            assert_eq!(counts.pending_decode, decoding.len());
            assert_eq!(counts.rendering, rendering.len());
        }
    }

    #[test]
    fn test_flush_invalidates_outstanding_handles() {
        let pool = BufferPool::new(BufferKind::Video, 3);
        let a = pool.acquire_free().unwrap();
        let b = pool.acquire_free().unwrap();
        pool.release(b, BufferState::Ready).unwrap();

        assert_eq!(pool.flush_all(), 2);
        assert_eq!(pool.counts().free, 3);
        assert_partition(&pool);

        // 旧句柄被拒绝，不会重复入队
        let err = pool.release(a, BufferState::Free).unwrap_err();
        assert!(matches!(err, PlayerError::StaleBuffer { .. }));
        assert_eq!(pool.free_len(), 3);
        assert_partition(&pool);
    }

    #[test]
    fn test_flush_except_keeps_target() {
        let pool = BufferPool::new(BufferKind::Video, 4);
        let target = pool.acquire_free().unwrap();
        let other = pool.acquire_free().unwrap();
        pool.release(other, BufferState::Ready).unwrap();
        let _rendering = pool.acquire_free().unwrap();

        assert_eq!(pool.flush_all_except(&[&target]), 2);
        assert_eq!(pool.counts().pending_decode, 1);
        pool.release(target, BufferState::Ready).unwrap();
        assert_eq!(pool.ready_len(), 1);
        assert_partition(&pool);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let pool = BufferPool::new(BufferKind::Video, 3);
        for pts in [10, 20, 30] {
            let h = pool.acquire_free().unwrap();
            pool.with_buffer_mut(&h, |b| b.pts = pts).unwrap();
            pool.release(h, BufferState::Ready).unwrap();
        }
        let first = pool.take_ready().unwrap();
        let second = pool.take_ready().unwrap();
        // 按后进先放回的顺序还原
        pool.requeue_front(second).unwrap();
        pool.requeue_front(first).unwrap();
        assert_eq!(pool.ready_pts(), vec![10, 20, 30]);
        assert_eq!(pool.peek_last_ready_pts(), Some(30));
    }

    #[test]
    fn test_detached_access_writes_back() {
        let pool = BufferPool::new(BufferKind::Audio, 1);
        let h = pool.acquire_free().unwrap();
        pool.with_buffer_detached(&h, |b| {
            b.pts = 42;
            b.bytes_mut().unwrap().extend_from_slice(&[1, 2, 3]);
        })
        .unwrap();
        assert_eq!(pool.pts(&h).unwrap(), 42);
        assert_eq!(pool.with_buffer(&h, |b| b.bytes().unwrap().len()).unwrap(), 3);
        pool.recycle(h);
    }

    #[test]
    fn test_free_listener_fires_on_release() {
        let pool = BufferPool::new(BufferKind::Packet, 1);
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        pool.set_free_listener(Some(Arc::new(move |kind| {
            assert_eq!(kind, BufferKind::Packet);
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        let h = pool.acquire_free().unwrap();
        pool.release(h, BufferState::Free).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_plane_buffer_reuse() {
        let planes = PlaneBufferPool::new(2);
        let bytes = planes.request(64);
        assert_eq!(bytes.len(), 64);
        let ptr = bytes.as_ptr();
        planes.recycle(bytes);
        let again = planes.request(32);
        assert_eq!(again.len(), 32);
        assert_eq!(again.as_ptr(), ptr);
        assert_eq!(planes.cached_len(), 0);
    }
}
