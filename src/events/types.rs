//! 上传事件类型定义
//!
//! 定义调度器对外发布的全部任务事件，供进程内订阅方消费

use crate::uploader::UploadBatchStats;
use serde::{Deserialize, Serialize};

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、删除等关键事件
    High = 2,
}

/// 上传任务事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 任务创建（提交入队）
    Created {
        task_id: String,
        file_name: String,
        size: u64,
    },
    /// 任务开始上传
    Started { task_id: String },
    /// 进度更新
    Progress {
        task_id: String,
        /// 进度百分比 (0-100)
        progress: u8,
    },
    /// 任务完成
    Completed {
        task_id: String,
        completed_at: i64,
        records_count: u64,
    },
    /// 任务失败
    Failed { task_id: String, error: String },
    /// 任务暂停（主动取消，不计入失败）
    Paused { task_id: String },
    /// 任务重试（回到等待队列）
    Resumed { task_id: String },
    /// 任务删除
    Deleted { task_id: String },
    /// 聚合统计变更
    StatsChanged { stats: UploadBatchStats },
    /// 批次全部结束
    BatchFinished { stats: UploadBatchStats },
}

impl UploadEvent {
    /// 获取任务 ID（批次级事件返回 None）
    pub fn task_id(&self) -> Option<&str> {
        match self {
            UploadEvent::Created { task_id, .. } => Some(task_id),
            UploadEvent::Started { task_id } => Some(task_id),
            UploadEvent::Progress { task_id, .. } => Some(task_id),
            UploadEvent::Completed { task_id, .. } => Some(task_id),
            UploadEvent::Failed { task_id, .. } => Some(task_id),
            UploadEvent::Paused { task_id } => Some(task_id),
            UploadEvent::Resumed { task_id } => Some(task_id),
            UploadEvent::Deleted { task_id } => Some(task_id),
            UploadEvent::StatsChanged { .. } | UploadEvent::BatchFinished { .. } => None,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::Progress { .. } | UploadEvent::StatsChanged { .. } => EventPriority::Low,
            UploadEvent::Created { .. } | UploadEvent::Started { .. } | UploadEvent::Resumed { .. } => {
                EventPriority::Medium
            }
            UploadEvent::Completed { .. }
            | UploadEvent::Failed { .. }
            | UploadEvent::Paused { .. }
            | UploadEvent::Deleted { .. }
            | UploadEvent::BatchFinished { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::Created { .. } => "created",
            UploadEvent::Started { .. } => "started",
            UploadEvent::Progress { .. } => "progress",
            UploadEvent::Completed { .. } => "completed",
            UploadEvent::Failed { .. } => "failed",
            UploadEvent::Paused { .. } => "paused",
            UploadEvent::Resumed { .. } => "resumed",
            UploadEvent::Deleted { .. } => "deleted",
            UploadEvent::StatsChanged { .. } => "stats_changed",
            UploadEvent::BatchFinished { .. } => "batch_finished",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = UploadEvent::Progress {
            task_id: "test-123".to_string(),
            progress: 42,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("progress"));
        assert!(json.contains("test-123"));

        let parsed: UploadEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id(), Some("test-123"));
        assert_eq!(parsed.event_type_name(), "progress");
    }

    #[test]
    fn test_event_priority() {
        let progress = UploadEvent::Progress {
            task_id: "1".to_string(),
            progress: 0,
        };
        assert_eq!(progress.priority(), EventPriority::Low);

        let failed = UploadEvent::Failed {
            task_id: "1".to_string(),
            error: "网络错误".to_string(),
        };
        assert_eq!(failed.priority(), EventPriority::High);
    }

    #[test]
    fn test_batch_event_has_no_task_id() {
        let event = UploadEvent::BatchFinished {
            stats: UploadBatchStats::default(),
        };
        assert!(event.task_id().is_none());
        assert_eq!(event.event_type_name(), "batch_finished");
    }
}
