// 上传任务定义

use crate::ingest::FilePayload;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待调度
    Pending,
    /// 上传中
    Uploading,
    /// 已暂停（主动取消，可重新入队）
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
}

impl UploadTaskStatus {
    /// 获取状态的中文描述
    pub fn description(&self) -> &'static str {
        match self {
            UploadTaskStatus::Pending => "等待中",
            UploadTaskStatus::Uploading => "上传中",
            UploadTaskStatus::Paused => "已暂停",
            UploadTaskStatus::Completed => "已完成",
            UploadTaskStatus::Failed => "失败",
        }
    }

    /// 是否为终止状态
    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadTaskStatus::Completed | UploadTaskStatus::Failed)
    }
}

/// 上传任务
///
/// 状态只能由调度器转换：
/// Pending -> Uploading -> {Completed | Failed | Paused}，
/// Failed 经重试回到 Pending；任意状态均可删除
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务 ID
    pub id: String,
    /// 文件负载
    pub payload: FilePayload,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 传输进度 (0-100)，Uploading 期间单调不减，重试时归零
    pub progress: u8,
    /// 是否选中参与批量上传
    pub selected: bool,
    /// 错误信息（仅 Failed 状态存在）
    pub error: Option<String>,
    /// 本次入库的记录数（完成后填充）
    pub records_count: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(payload: FilePayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            status: UploadTaskStatus::Pending,
            progress: 0,
            selected: true,
            error: None,
            records_count: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为已完成
    pub fn mark_completed(&mut self, records_count: u64) {
        self.status = UploadTaskStatus::Completed;
        self.progress = 100;
        self.records_count = records_count;
        self.completed_at = Some(chrono::Utc::now().timestamp());
    }

    /// 标记为失败
    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
    }

    /// 标记为暂停
    ///
    /// 暂停不是错误，不携带错误信息
    pub fn mark_paused(&mut self) {
        self.status = UploadTaskStatus::Paused;
    }

    /// 重置回等待状态（重试）
    ///
    /// 清除错误并把进度归零
    pub fn mark_pending(&mut self) {
        self.status = UploadTaskStatus::Pending;
        self.progress = 0;
        self.error = None;
    }
}
