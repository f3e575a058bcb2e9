// Batch Ingest Rust Library
// 批量上传准入与调度核心库

// 准入控制模块（限流 + 并发许可）
pub mod admission;

// 配置管理模块
pub mod config;

// 事件模块
pub mod events;

// 上传边界模块（入库服务抽象 + 重试执行器）
pub mod ingest;

// 日志模块
pub mod logging;

// 上传调度模块
pub mod uploader;

// 导出常用类型
pub use admission::{ConcurrencyController, RateLimitProfile, RateLimiter, ACTION_FILE_UPLOAD};
pub use config::{AppConfig, LogConfig, RetrySettings, UploadConfig};
pub use events::{EventHub, EventSubscription, ProgressThrottler, UploadEvent};
pub use ingest::{
    FilePayload, IngestClient, IngestError, IngestResponse, ProgressFn, RetryPolicy,
    RetryingExecutor,
};
pub use logging::{init_logging, LogGuard};
pub use uploader::{UploadBatchStats, UploadScheduler, UploadTask, UploadTaskStatus};
