// 配置管理模块

use crate::admission::{
    default_limits, default_profiles, ConcurrencyController, RateLimitProfile, RateLimiter,
};
use crate::ingest::{RetryPolicy, RetryingExecutor};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 上传调度配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 限流配置
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// 并发控制配置
    #[serde(default)]
    pub concurrency: ConcurrencySettings,
    /// 重试配置
    #[serde(default)]
    pub retry: RetrySettings,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 上传调度配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传任务数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 统计/进度事件节流间隔（毫秒）
    #[serde(default = "default_stats_throttle_ms")]
    pub stats_throttle_ms: u64,
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_stats_throttle_ms() -> u64 {
    200
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            stats_throttle_ms: default_stats_throttle_ms(),
        }
    }
}

/// 限流配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// action -> 限流档位；未列出的 action 使用内置档位
    #[serde(default = "default_profiles")]
    pub profiles: HashMap<String, RateLimitProfile>,
    /// 后台清理间隔（秒）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            profiles: default_profiles(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

impl RateLimitSettings {
    /// 按配置构建限流器
    pub fn build(&self) -> RateLimiter {
        RateLimiter::with_profiles(self.profiles.clone())
    }

    /// 清理间隔
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 并发控制配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencySettings {
    /// action -> 并发上限；未列出的 action 使用默认上限
    #[serde(default = "default_limits")]
    pub limits: HashMap<String, usize>,
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self {
            limits: default_limits(),
        }
    }
}

impl ConcurrencySettings {
    /// 按配置构建并发控制器
    pub fn build(&self) -> ConcurrencyController {
        ConcurrencyController::with_limits(self.limits.clone())
    }
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    /// 最大重试次数（不含首次尝试）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 初始退避延迟（毫秒）
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl RetrySettings {
    /// 转换为重试策略
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.retry_delay_ms))
    }

    /// 按配置构建重试执行器
    pub fn build(&self) -> RetryingExecutor {
        RetryingExecutor::new(self.to_policy())
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从 TOML 文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;
        let config: AppConfig =
            toml::from_str(&content).with_context(|| format!("解析配置文件失败: {:?}", path))?;
        Ok(config)
    }

    /// 保存配置到 TOML 文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
        }
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::ACTION_FILE_UPLOAD;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();

        assert_eq!(config.upload.max_concurrent_uploads, 3);
        assert_eq!(config.upload.stats_throttle_ms, 200);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.retry_delay_ms, 1000);
        assert!(config.log.enabled);
        assert_eq!(config.log.level, "info");

        // 内置限流档位齐备
        let upload_profile = &config.rate_limit.profiles[ACTION_FILE_UPLOAD];
        assert_eq!(upload_profile.max_requests, 10);
        assert_eq!(upload_profile.block_duration_ms, 5 * 60 * 1000);

        assert_eq!(config.concurrency.limits[ACTION_FILE_UPLOAD], 3);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            max_concurrent_uploads = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.max_concurrent_uploads, 5);
        // 未给出的字段回落默认值
        assert_eq!(config.upload.stats_throttle_ms, 200);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_to_policy() {
        let retry = RetrySettings {
            max_retries: 5,
            retry_delay_ms: 250,
        };
        let policy = retry.to_policy();
        assert_eq!(policy.max_retries, 5);
        assert_eq!(policy.retry_delay, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/app.toml");

        let mut config = AppConfig::default();
        config.upload.max_concurrent_uploads = 8;
        config.retry.retry_delay_ms = 500;
        config.save_to_file(&path).await.unwrap();

        let loaded = AppConfig::load_from_file(&path).await.unwrap();
        assert_eq!(loaded.upload.max_concurrent_uploads, 8);
        assert_eq!(loaded.retry.retry_delay_ms, 500);
        assert_eq!(loaded.upload.stats_throttle_ms, 200);
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let result = AppConfig::load_from_file("no/such/config.toml").await;
        assert!(result.is_err());
    }
}
