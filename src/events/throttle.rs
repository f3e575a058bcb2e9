//! 进度事件节流器
//!
//! 控制进度类事件的发布频率，避免高频分发造成事件风暴
//! 终态事件（完成/失败/暂停）应使用 `force_emit` 强制发布

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_STATS_THROTTLE_MS: u64 = 200;

/// 进度事件节流器
///
/// 基于原子 CAS 的最小间隔闸门，无锁，可被多个发布方共享。
/// 典型用法：进度更新时调用 `should_emit()`，返回 true 才发布事件。
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 上次放行的时刻（相对基准时刻的毫秒数）
    last_pass_ms: AtomicU64,
    /// 最小发布间隔（毫秒）
    interval_ms: u64,
    /// 基准时刻
    epoch: Instant,
}

impl ProgressThrottler {
    /// 创建节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            last_pass_ms: AtomicU64::new(0),
            interval_ms: interval.as_millis() as u64,
            epoch: Instant::now(),
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该放行本次发布
    ///
    /// 距上次放行已超过间隔时返回 true 并推进时间戳；
    /// CAS 失败说明被并发发布方抢先，本次不放行
    pub fn should_emit(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        let last = self.last_pass_ms.load(Ordering::Relaxed);

        if now_ms.saturating_sub(last) < self.interval_ms && last != 0 {
            return false;
        }

        self.last_pass_ms
            .compare_exchange(last, now_ms.max(1), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制放行（终态事件、批次收尾时使用）
    pub fn force_emit(&self) -> bool {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.last_pass_ms.store(now_ms.max(1), Ordering::Relaxed);
        true
    }

    /// 重置节流状态，下一次 `should_emit` 必然放行
    pub fn reset(&self) {
        self.last_pass_ms.store(0, Ordering::Relaxed);
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_STATS_THROTTLE_MS)
    }
}
