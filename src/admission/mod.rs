//! 准入控制模块
//!
//! 提供出站请求的两类准入原语：
//! - `rate_limiter.rs`: 滑动窗口限流（带封禁冷却）
//! - `concurrency.rs`: 并发许可控制（FIFO 等待队列）
//!
//! 两者都以 (identifier, action) 为粒度，状态进程内自治，
//! 跨进程的全局限额需要外部协调器，不在本模块职责内

mod concurrency;
mod rate_limiter;

pub use concurrency::{
    default_limits, ConcurrencyController, ACTION_ANALYSIS, DEFAULT_MAX_CONCURRENT,
};
pub use rate_limiter::{
    default_profiles, RateLimitProfile, RateLimiter, ACTION_API_CALL, ACTION_CHAT_MESSAGE,
    ACTION_FILE_UPLOAD, ACTION_LOGIN_ATTEMPT,
};
