//! 事件模块
//!
//! 定义任务事件类型和分发工具
//! - `types.rs`: 上传任务事件与优先级
//! - `throttle.rs`: 进度事件节流器
//! - `hub.rs`: 进程内订阅中心

mod hub;
mod throttle;
mod types;

pub use hub::{EventHub, EventSubscription};
pub use throttle::{ProgressThrottler, DEFAULT_STATS_THROTTLE_MS};
pub use types::{EventPriority, UploadEvent};
