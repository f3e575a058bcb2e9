// 上传边界模块
//
// 定义远端入库服务的抽象与错误分类，以及带指数退避的重试执行器

pub mod executor;
pub mod types;

pub use executor::{
    RetryCondition, RetryPolicy, RetryingExecutor, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY_MS,
};
pub use types::{FilePayload, IngestClient, IngestError, IngestResponse, ProgressFn};
