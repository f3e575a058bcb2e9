// 指数退避重试执行器
//
// 把单次异步操作包装成带重试的执行：
// - 最多尝试 max_retries + 1 次，尝试序号从 1 计起
// - 第 n 次失败后等待 retry_delay * 2^(n-1) 再试
// - 重试条件默认取 IngestError::is_retriable，可注入自定义判定
// - 退避等待期间观察取消令牌；取消永远不重试
// - 每次尝试彼此独立，传输进度不跨尝试保留

use super::types::IngestError;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 默认初始退避延迟（毫秒）
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;

/// 自定义重试判定
pub type RetryCondition = Arc<dyn Fn(&IngestError) -> bool + Send + Sync>;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次尝试）
    pub max_retries: u32,
    /// 初始退避延迟
    pub retry_delay: Duration,
}

impl RetryPolicy {
    /// 创建重试策略
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            max_retries,
            retry_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

/// 重试执行器
pub struct RetryingExecutor {
    policy: RetryPolicy,
    retry_condition: Option<RetryCondition>,
}

impl RetryingExecutor {
    /// 使用指定策略创建执行器
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            retry_condition: None,
        }
    }

    /// 注入自定义重试判定
    ///
    /// 判定只对普通错误生效，取消不受其影响
    pub fn with_retry_condition<F>(mut self, condition: F) -> Self
    where
        F: Fn(&IngestError) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Some(Arc::new(condition));
        self
    }

    /// 当前策略
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 计算第 attempt 次尝试失败后的退避延迟
    fn backoff_delay(&self, attempt: u32) -> Duration {
        self.policy.retry_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    fn should_retry(&self, error: &IngestError) -> bool {
        match &self.retry_condition {
            Some(condition) => condition(error),
            None => error.is_retriable(),
        }
    }

    /// 执行操作，瞬时失败时按策略重试
    ///
    /// attempt_fn 的参数是本次尝试的序号（从 1 计起）。
    /// 重试耗尽后返回最后一次的错误，消息中标注总尝试次数
    pub async fn execute<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, IngestError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, IngestError>>,
    {
        let total_attempts = self.policy.max_retries + 1;
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            if cancel.is_cancelled() {
                return Err(IngestError::Cancelled);
            }

            match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!("第 {} 次尝试成功", attempt);
                    }
                    return Ok(value);
                }
                Err(IngestError::Cancelled) => return Err(IngestError::Cancelled),
                Err(e) => {
                    if !self.should_retry(&e) {
                        debug!("错误不可重试，直接返回: {}", e);
                        return Err(e);
                    }

                    if attempt < total_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!(
                            "第 {}/{} 次尝试失败，等待 {}ms 后重试: {}",
                            attempt,
                            total_attempts,
                            delay.as_millis(),
                            e
                        );
                        tokio::select! {
                            _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }

                    last_error = Some(e);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| IngestError::Network("上传失败".to_string()));
        error!("重试耗尽（共 {} 次尝试）: {}", total_attempts, err);
        Err(err.with_attempts(total_attempts))
    }
}

impl Default for RetryingExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
