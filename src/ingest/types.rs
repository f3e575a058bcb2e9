// 上传边界类型定义
//
// 远端分析/入库服务对本库是不透明的异步操作：接受一个文件负载，
// 返回成功、失败或可重试的瞬时错误。具体传输由调用方注入的
// IngestClient 实现承担。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// 进度回调（0-100）
pub type ProgressFn = Arc<dyn Fn(u8) + Send + Sync>;

/// 待上传的文件负载
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilePayload {
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件名（用于展示和日志）
    pub file_name: String,
    /// 文件大小（字节）
    pub size: u64,
}

impl FilePayload {
    /// 创建文件负载
    pub fn new(local_path: impl Into<PathBuf>, file_name: impl Into<String>, size: u64) -> Self {
        Self {
            local_path: local_path.into(),
            file_name: file_name.into(),
            size,
        }
    }
}

/// 入库服务响应
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestResponse {
    /// 本次入库的记录数
    pub records_count: u64,
    /// 入库生成的文档 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    /// 服务端附加消息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// 上传错误分类
///
/// 只有网络级失败（无结构化响应）和服务端 5xx 允许自动重试；
/// 4xx、限流拒绝与主动取消一律不重试
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IngestError {
    /// 触发限流，需等待后重试
    #[error("请求过于频繁，请等待 {retry_after_secs} 秒后重试")]
    RateLimited {
        /// 建议等待秒数
        retry_after_secs: u64,
    },
    /// 并发许可等待超时（仅当调用方对 acquire 自行加超时才会出现）
    #[error("并发请求数已达上限")]
    ConcurrencyLimitExceeded,
    /// 网络级失败，无结构化响应
    #[error("网络连接失败: {0}")]
    Network(String),
    /// 服务端错误 (5xx)
    #[error("服务器错误 (HTTP {status}): {message}")]
    Server { status: u16, message: String },
    /// 请求错误 (4xx)，不可重试
    #[error("请求失败 (HTTP {status}): {message}")]
    Request { status: u16, message: String },
    /// 任务被主动取消，不计入失败
    #[error("上传已取消")]
    Cancelled,
}

impl IngestError {
    /// 根据 HTTP 状态码分类
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 {
            IngestError::Server { status, message }
        } else {
            IngestError::Request { status, message }
        }
    }

    /// 是否允许自动重试
    pub fn is_retriable(&self) -> bool {
        matches!(self, IngestError::Network(_) | IngestError::Server { .. })
    }

    /// 在错误消息上追加尝试次数标注（种类保持不变）
    pub fn with_attempts(self, attempts: u32) -> Self {
        let note = format!("（已尝试 {} 次）", attempts);
        match self {
            IngestError::Network(msg) => IngestError::Network(format!("{}{}", msg, note)),
            IngestError::Server { status, message } => IngestError::Server {
                status,
                message: format!("{}{}", message, note),
            },
            IngestError::Request { status, message } => IngestError::Request {
                status,
                message: format!("{}{}", message, note),
            },
            other => other,
        }
    }
}

/// 入库服务客户端
///
/// 实现方负责真正的传输：通过 progress 上报 0-100 的传输进度，
/// 协作式观察 cancel 令牌并在取消时返回 `IngestError::Cancelled`。
/// 每次调用都是独立的一次尝试，进度从 0 重新开始。
#[async_trait]
pub trait IngestClient: Send + Sync {
    /// 上传一个文件负载
    async fn ingest(
        &self,
        payload: FilePayload,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<IngestResponse, IngestError>;
}
