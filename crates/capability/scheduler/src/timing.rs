//! 节拍计算与时间轮。
//!
//! 节拍边界相对 Unix 纪元计算：`k * interval + offset`，
//! 同周期不同偏移的通道不会同时触发。

use domain::now_epoch_ms;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Duration;
use tokio::time::Instant;

/// 纪元毫秒时钟（以 tokio 单调时钟推进）。
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    base_epoch_ms: i64,
    base: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            base_epoch_ms: now_epoch_ms(),
            base: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.base_epoch_ms + self.base.elapsed().as_millis() as i64
    }

    /// 纪元毫秒对应的单调时刻。
    pub fn instant_at(&self, epoch_ms: i64) -> Instant {
        let offset = (epoch_ms - self.base_epoch_ms).max(0) as u64;
        self.base + Duration::from_millis(offset)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// 不早于 `now` 的第一个边界。
pub fn first_fire(now: i64, interval: i64, offset: i64) -> i64 {
    let offset = offset.rem_euclid(interval);
    let candidate = (now - offset).div_euclid(interval) * interval + offset;
    if candidate >= now {
        candidate
    } else {
        candidate + interval
    }
}

/// 下一次触发时间与被合并（跳过）的边界数。
///
/// `previous + interval` 仍在 `now` 之后时按原节奏继续；否则说明已滞后
/// 一个周期以上，跳到 `now` 之后的第一个边界，不补发，返回值从不早于 `now`。
pub fn next_fire(previous: i64, interval: i64, now: i64) -> (i64, u64) {
    let candidate = previous + interval;
    if candidate > now {
        return (candidate, 0);
    }
    let missed = (now - previous).div_euclid(interval);
    (previous + (missed + 1) * interval, missed as u64)
}

/// 按下次触发时间排序的时间轮。
#[derive(Debug, Default)]
pub(crate) struct TimingWheel {
    heap: BinaryHeap<Reverse<(i64, usize)>>,
}

impl TimingWheel {
    pub(crate) fn schedule(&mut self, fire_at: i64, unit: usize) {
        self.heap.push(Reverse((fire_at, unit)));
    }

    pub(crate) fn next_fire(&self) -> Option<i64> {
        self.heap.peek().map(|Reverse((fire_at, _))| *fire_at)
    }

    /// 弹出一个已到期的条目。
    pub(crate) fn pop_due(&mut self, now: i64) -> Option<(i64, usize)> {
        if self.next_fire()? > now {
            return None;
        }
        self.heap.pop().map(|Reverse(entry)| entry)
    }

    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_respects_offset() {
        assert_eq!(first_fire(1_000, 100, 0), 1_000);
        assert_eq!(first_fire(1_001, 100, 0), 1_100);
        assert_eq!(first_fire(1_001, 100, 30), 1_030);
        assert_eq!(first_fire(1_050, 100, 30), 1_130);
        // 偏移大于周期时按周期取模
        assert_eq!(first_fire(1_001, 100, 230), 1_030);
    }

    #[test]
    fn on_time_and_slightly_late_ticks_do_not_drift() {
        assert_eq!(next_fire(1_000, 100, 1_000), (1_100, 0));
        assert_eq!(next_fire(1_000, 100, 1_040), (1_100, 0));
        assert_eq!(next_fire(1_000, 100, 1_099), (1_100, 0));
    }

    #[test]
    fn tick_late_by_more_than_one_interval_never_schedules_into_the_past() {
        assert_eq!(next_fire(1_000, 100, 1_100), (1_200, 1));
        assert_eq!(next_fire(1_000, 100, 1_150), (1_200, 1));
        assert_eq!(next_fire(1_000, 100, 1_199), (1_200, 1));
        for now in 1_000..1_500 {
            let (next, _) = next_fire(1_000, 100, now);
            assert!(next > now, "now={now} next={next}");
        }
    }

    #[test]
    fn missed_ticks_are_coalesced() {
        assert_eq!(next_fire(1_000, 100, 1_200), (1_300, 2));
        assert_eq!(next_fire(1_000, 100, 1_750), (1_800, 7));
        let (next, _) = next_fire(1_000, 100, 1_750);
        assert!(next > 1_750);
        assert_eq!((next - 1_000) % 100, 0);
    }

    #[test]
    fn wheel_pops_in_fire_order() {
        let mut wheel = TimingWheel::default();
        wheel.schedule(300, 0);
        wheel.schedule(100, 1);
        wheel.schedule(200, 2);
        assert_eq!(wheel.next_fire(), Some(100));
        assert_eq!(wheel.pop_due(250), Some((100, 1)));
        assert_eq!(wheel.pop_due(250), Some((200, 2)));
        assert_eq!(wheel.pop_due(250), None);
        assert_eq!(wheel.len(), 1);
    }
}
