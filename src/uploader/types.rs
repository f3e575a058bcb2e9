// 上传模块类型定义

use serde::{Deserialize, Serialize};

/// 批次聚合统计
///
/// 始终由任务状态重新计算得出，不做独立累加，
/// 避免状态转换与计数在竞态下出现重复统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadBatchStats {
    /// 批次内任务总数
    pub total_files: usize,
    /// 已完成数
    pub completed_files: usize,
    /// 失败数
    pub failed_files: usize,
    /// 累计入库记录数
    pub total_records: u64,
    /// 批次耗时（毫秒）；批次进行中为已流逝时间
    pub upload_time_ms: u64,
}

impl UploadBatchStats {
    /// 批次是否已全部落定（暂停中的任务不计入等式）
    pub fn is_settled(&self) -> bool {
        self.total_files > 0 && self.completed_files + self.failed_files == self.total_files
    }

    /// 整体完成度百分比：terminal 任务数 / 总数
    ///
    /// 注意这是完成度口径，不是在途进度的字节加权平均
    pub fn overall_progress(&self) -> u8 {
        if self.total_files == 0 {
            return 0;
        }
        let done = self.completed_files + self.failed_files;
        ((done * 100 + self.total_files / 2) / self.total_files) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_progress() {
        let mut stats = UploadBatchStats::default();
        assert_eq!(stats.overall_progress(), 0);

        stats.total_files = 10;
        stats.completed_files = 2;
        stats.failed_files = 1;
        assert_eq!(stats.overall_progress(), 30);

        stats.completed_files = 9;
        stats.failed_files = 1;
        assert_eq!(stats.overall_progress(), 100);
    }

    #[test]
    fn test_overall_progress_rounds() {
        let stats = UploadBatchStats {
            total_files: 3,
            completed_files: 1,
            failed_files: 0,
            ..Default::default()
        };
        // 1/3 = 33.3% -> 四舍五入 33
        assert_eq!(stats.overall_progress(), 33);

        let stats = UploadBatchStats {
            total_files: 3,
            completed_files: 2,
            failed_files: 0,
            ..Default::default()
        };
        // 2/3 = 66.7% -> 四舍五入 67
        assert_eq!(stats.overall_progress(), 67);
    }

    #[test]
    fn test_is_settled() {
        let mut stats = UploadBatchStats::default();
        assert!(!stats.is_settled());

        stats.total_files = 5;
        stats.completed_files = 3;
        stats.failed_files = 1;
        assert!(!stats.is_settled());

        stats.failed_files = 2;
        assert!(stats.is_settled());
    }
}
