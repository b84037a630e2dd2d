use std::time::{Duration, Instant};

/// 时钟基准：(基准 PTS, 设置基准时的墙钟时刻)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockBase {
    pub pts: i64,           // 基准 PTS（毫秒）
    pub instant: Instant,   // 基准时刻
}

/// 渲染时钟 - 用于计算每帧的渲染延迟
///
/// 每次（重新）开始渲染后的第一帧记录基准，之后所有延迟都相对基准和
/// 基准以来流逝的墙钟时间计算，不累加逐帧差值，避免漂移。
#[derive(Debug, Default, Clone)]
pub struct RenderClock {
    base: Option<ClockBase>,
}

impl RenderClock {
    pub fn new() -> Self {
        Self { base: None }
    }

    /// 若尚未锚定则以该帧锚定基准，返回当前基准
    pub fn check_and_update(&mut self, pts: i64, now: Instant) -> ClockBase {
        *self.base.get_or_insert(ClockBase { pts, instant: now })
    }

    /// 清除基准（暂停恢复、seek 后重新锚定）
    pub fn reset(&mut self) {
        self.base = None;
    }

    pub fn base(&self) -> Option<ClockBase> {
        self.base
    }

    pub fn is_anchored(&self) -> bool {
        self.base.is_some()
    }

    /// 计算渲染延迟：max(0, (pts - 基准pts) - 基准以来流逝时间)
    ///
    /// 未锚定时返回 0。
    pub fn delay_for(&self, pts: i64, now: Instant) -> Duration {
        match self.base {
            Some(base) => {
                let elapsed = now.saturating_duration_since(base.instant).as_millis() as i64;
                let delay = (pts - base.pts) - elapsed;
                Duration::from_millis(delay.max(0) as u64)
            }
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_relative_to_base() {
        let t0 = Instant::now();
        let mut clock = RenderClock::new();
        assert_eq!(clock.delay_for(500, t0), Duration::ZERO);

        clock.check_and_update(1000, t0);
        // 第二次调用不会改变基准
        clock.check_and_update(5000, t0 + Duration::from_millis(10));
        assert_eq!(clock.base().map(|b| b.pts), Some(1000));

        assert_eq!(clock.delay_for(1040, t0), Duration::from_millis(40));
        assert_eq!(clock.delay_for(1040, t0 + Duration::from_millis(30)), Duration::from_millis(10));
        // 已经迟到的帧延迟为 0
        assert_eq!(clock.delay_for(1040, t0 + Duration::from_millis(100)), Duration::ZERO);
    }

    #[test]
    fn test_reset_reanchors() {
        let t0 = Instant::now();
        let mut clock = RenderClock::new();
        clock.check_and_update(0, t0);
        clock.reset();
        assert!(!clock.is_anchored());
        let later = t0 + Duration::from_secs(3);
        clock.check_and_update(3000, later);
        assert_eq!(clock.delay_for(3040, later), Duration::from_millis(40));
    }
}
