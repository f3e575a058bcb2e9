// 滑动窗口限流器
//
// 按 (identifier, action) 维度做请求准入控制：
// - 窗口内只统计未过期的请求时间戳，惰性清理
// - 达到上限后进入封禁期（封禁时长独立于窗口，阻止重试风暴）
// - 各 action 使用独立的限流档位，未识别的 action 回落到 api-call 档位

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 文件上传动作
pub const ACTION_FILE_UPLOAD: &str = "file-upload";
/// 普通 API 调用动作（兜底档位）
pub const ACTION_API_CALL: &str = "api-call";
/// 聊天消息动作
pub const ACTION_CHAT_MESSAGE: &str = "chat-message";
/// 登录尝试动作
pub const ACTION_LOGIN_ATTEMPT: &str = "login-attempt";

/// 限流档位配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitProfile {
    /// 时间窗口（毫秒）
    pub window_ms: u64,
    /// 窗口内最大请求数
    pub max_requests: usize,
    /// 封禁时长（毫秒）
    pub block_duration_ms: u64,
}

impl RateLimitProfile {
    /// 窗口时长
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// 封禁时长
    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }
}

/// 内置限流档位表
pub fn default_profiles() -> HashMap<String, RateLimitProfile> {
    let mut profiles = HashMap::new();
    profiles.insert(
        ACTION_FILE_UPLOAD.to_string(),
        RateLimitProfile {
            window_ms: 60 * 1000,
            max_requests: 10,
            block_duration_ms: 5 * 60 * 1000,
        },
    );
    profiles.insert(
        ACTION_API_CALL.to_string(),
        RateLimitProfile {
            window_ms: 60 * 1000,
            max_requests: 100,
            block_duration_ms: 60 * 1000,
        },
    );
    profiles.insert(
        ACTION_CHAT_MESSAGE.to_string(),
        RateLimitProfile {
            window_ms: 60 * 1000,
            max_requests: 30,
            block_duration_ms: 2 * 60 * 1000,
        },
    );
    profiles.insert(
        ACTION_LOGIN_ATTEMPT.to_string(),
        RateLimitProfile {
            window_ms: 15 * 60 * 1000,
            max_requests: 5,
            block_duration_ms: 30 * 60 * 1000,
        },
    );
    profiles
}

/// 单个 key 的滑动窗口状态
#[derive(Debug, Default)]
struct RateLimitBucket {
    /// 窗口内的请求时刻（惰性清理，按插入顺序递增）
    timestamps: Vec<Instant>,
    /// 封禁截止时刻；在此之前所有请求直接拒绝
    blocked_until: Option<Instant>,
}

impl RateLimitBucket {
    /// 清理窗口外的时间戳
    fn prune(&mut self, now: Instant, window: Duration) {
        self.timestamps
            .retain(|t| now.saturating_duration_since(*t) < window);
    }

    fn is_empty(&self) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none()
    }
}

/// 滑动窗口限流器
///
/// 显式构造、按引用注入，多实例互不影响；
/// 周期清理由持有方通过 `spawn_cleanup` 启动，不依赖全局定时器
pub struct RateLimiter {
    /// 各 key 的窗口状态
    buckets: DashMap<String, RateLimitBucket>,
    /// action -> 档位
    profiles: HashMap<String, RateLimitProfile>,
    /// 未识别 action 的兜底档位
    fallback: RateLimitProfile,
}

impl RateLimiter {
    /// 使用内置档位表创建限流器
    pub fn new() -> Self {
        Self::with_profiles(default_profiles())
    }

    /// 使用指定档位表创建限流器
    ///
    /// 表中缺少 api-call 档位时补入内置值，保证兜底档位始终存在
    pub fn with_profiles(mut profiles: HashMap<String, RateLimitProfile>) -> Self {
        let builtin = default_profiles();
        for (action, profile) in builtin {
            profiles.entry(action).or_insert(profile);
        }
        let fallback = profiles[ACTION_API_CALL].clone();

        Self {
            buckets: DashMap::new(),
            profiles,
            fallback,
        }
    }

    /// 查找 action 对应的档位
    fn profile_for(&self, action: &str) -> &RateLimitProfile {
        self.profiles.get(action).unwrap_or(&self.fallback)
    }

    fn bucket_key(identifier: &str, action: &str) -> String {
        format!("{}:{}", identifier, action)
    }

    /// 检查并记录一次请求
    ///
    /// 允许时把当前时刻计入窗口并返回 true；
    /// 窗口已满时拒绝并进入封禁期，封禁从本次拒绝时刻起算
    pub fn is_allowed(&self, identifier: &str, action: &str) -> bool {
        let profile = self.profile_for(action).clone();
        let key = Self::bucket_key(identifier, action);
        let now = Instant::now();

        let mut bucket = self.buckets.entry(key.clone()).or_default();

        if let Some(until) = bucket.blocked_until {
            if now < until {
                return false;
            }
            // 封禁已到期，解除
            bucket.blocked_until = None;
        }

        bucket.prune(now, profile.window());

        if bucket.timestamps.len() >= profile.max_requests {
            bucket.blocked_until = Some(now + profile.block_duration());
            debug!(
                "限流触发: key={}, 窗口内请求数={}, 封禁 {}ms",
                key,
                bucket.timestamps.len(),
                profile.block_duration_ms
            );
            return false;
        }

        bucket.timestamps.push(now);
        true
    }

    /// 查询剩余可用请求数（只读，不记录请求）
    pub fn get_remaining_requests(&self, identifier: &str, action: &str) -> usize {
        let profile = self.profile_for(action);
        let key = Self::bucket_key(identifier, action);
        let now = Instant::now();

        let valid = self
            .buckets
            .get(&key)
            .map(|bucket| {
                bucket
                    .timestamps
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) < profile.window())
                    .count()
            })
            .unwrap_or(0);

        profile.max_requests.saturating_sub(valid)
    }

    /// 查询窗口重置时刻（最早一条记录离开窗口的时刻）
    pub fn get_reset_time(&self, identifier: &str, action: &str) -> Instant {
        let profile = self.profile_for(action);
        let key = Self::bucket_key(identifier, action);
        let now = Instant::now();

        self.buckets
            .get(&key)
            .and_then(|bucket| bucket.timestamps.iter().min().copied())
            .map(|oldest| oldest + profile.window())
            .unwrap_or(now)
    }

    /// 计算调用方还需等待多久才可能被放行
    ///
    /// 封禁中返回封禁剩余时长，否则返回窗口重置剩余时长
    pub fn retry_after(&self, identifier: &str, action: &str) -> Duration {
        let key = Self::bucket_key(identifier, action);
        let now = Instant::now();

        if let Some(bucket) = self.buckets.get(&key) {
            if let Some(until) = bucket.blocked_until {
                if until > now {
                    return until.saturating_duration_since(now);
                }
            }
        }

        self.get_reset_time(identifier, action)
            .saturating_duration_since(now)
    }

    /// 重置限流记录
    ///
    /// 指定 action 时只清除单个 key，否则清除该 identifier 下的所有记录
    pub fn reset(&self, identifier: &str, action: Option<&str>) {
        match action {
            Some(action) => {
                self.buckets.remove(&Self::bucket_key(identifier, action));
            }
            None => {
                let prefix = format!("{}:", identifier);
                self.buckets.retain(|key, _| !key.starts_with(&prefix));
            }
        }
        info!("限流记录已重置: identifier={}, action={:?}", identifier, action);
    }

    /// 清理过期数据
    ///
    /// 移除窗口外的时间戳、已到期的封禁和空桶；
    /// 可与 `is_allowed` 并发调用（分片锁保证一致性）
    pub fn cleanup(&self) {
        let now = Instant::now();

        self.buckets.retain(|key, bucket| {
            // key 形如 "identifier:action"，action 为末段
            let action = key.rsplit_once(':').map(|(_, a)| a).unwrap_or("");
            let window = self.profile_for(action).window();

            bucket.prune(now, window);
            if let Some(until) = bucket.blocked_until {
                if now >= until {
                    bucket.blocked_until = None;
                }
            }
            !bucket.is_empty()
        });
    }

    /// 当前跟踪的 key 数量（调试用）
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// 启动周期清理后台任务
    ///
    /// 返回任务句柄；通过取消令牌停止
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = self.clone();
        tokio::spawn(async move {
            info!("限流清理任务已启动: 间隔={:?}", interval);
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => {
                        info!("限流清理任务已停止");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        limiter.cleanup();
                    }
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
