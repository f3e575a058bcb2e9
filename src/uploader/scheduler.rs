// 批量上传调度器
//
// 驱动一批上传任务的有界并发流水线：
// - FIFO 派发选中的等待任务，活跃数不超过 max_concurrent_uploads
// - 每个任务依次经过 并发许可 -> 限流检查 -> 带重试的传输
// - 许可在任务落定前无条件归还，空出的槽位立即回填
// - 聚合统计与状态转换在同一把调度锁内完成，避免竞态下重复计数
// - 暂停是主动取消，不是错误；任务完成与取消的竞态以完成为准

use crate::admission::{ConcurrencyController, RateLimiter, ACTION_FILE_UPLOAD};
use crate::config::UploadConfig;
use crate::events::{EventHub, EventSubscription, ProgressThrottler, UploadEvent};
use crate::ingest::{
    FilePayload, IngestClient, IngestError, IngestResponse, ProgressFn, RetryingExecutor,
};
use crate::uploader::{UploadBatchStats, UploadTask, UploadTaskStatus};
use anyhow::{Context, Result};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// 默认最大同时上传任务数
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

/// 上传任务信息（任务 + 控制句柄）
pub struct UploadTaskInfo {
    /// 任务
    pub task: Arc<RwLock<UploadTask>>,
    /// 取消令牌；每次派发时更换，暂停即取消
    pub cancel_token: CancellationToken,
    /// 实时进度 (0-100)，传输回调直接写入
    pub progress: Arc<AtomicU8>,
}

/// 调度状态
///
/// 「统计活跃数并补满到上限」必须是单一原子步骤，
/// 队列、活跃计数、批次归属与批次计时统一由这把锁保护
struct DispatchState {
    /// 全部已提交任务 ID（按提交顺序）
    submitted: Vec<String>,
    /// 等待队列（FIFO）
    queue: VecDeque<String>,
    /// 当前活跃任务数
    active: usize,
    /// 当前批次的任务 ID
    batch: Vec<String>,
    /// 批次开始时刻
    started_at: Option<Instant>,
    /// 批次是否进行中
    running: bool,
}

impl DispatchState {
    fn new() -> Self {
        Self {
            submitted: Vec::new(),
            queue: VecDeque::new(),
            active: 0,
            batch: Vec::new(),
            started_at: None,
            running: false,
        }
    }
}

/// 批量上传调度器
#[derive(Clone)]
pub struct UploadScheduler {
    /// 准入维度标识（如会话/用户 ID）
    identifier: String,
    /// 入库服务客户端
    client: Arc<dyn IngestClient>,
    /// 限流器
    rate_limiter: Arc<RateLimiter>,
    /// 并发许可控制器
    concurrency: Arc<ConcurrencyController>,
    /// 重试执行器
    executor: Arc<RetryingExecutor>,
    /// 所有任务（task_id -> TaskInfo）
    tasks: Arc<DashMap<String, UploadTaskInfo>>,
    /// 调度状态
    dispatch: Arc<Mutex<DispatchState>>,
    /// 最大同时上传任务数（动态可调整）
    max_concurrent_uploads: Arc<AtomicUsize>,
    /// 事件订阅中心
    events: Arc<EventHub>,
    /// 进度/统计事件节流器
    throttler: Arc<ProgressThrottler>,
    /// 最近一次聚合统计快照
    stats: Arc<parking_lot::RwLock<UploadBatchStats>>,
}

impl UploadScheduler {
    /// 创建调度器
    pub fn new(
        identifier: impl Into<String>,
        client: Arc<dyn IngestClient>,
        rate_limiter: Arc<RateLimiter>,
        concurrency: Arc<ConcurrencyController>,
        executor: Arc<RetryingExecutor>,
        config: &UploadConfig,
    ) -> Self {
        let identifier = identifier.into();
        info!(
            "创建批量上传调度器: identifier={}, 最大并发上传数={}",
            identifier, config.max_concurrent_uploads
        );

        Self {
            identifier,
            client,
            rate_limiter,
            concurrency,
            executor,
            tasks: Arc::new(DashMap::new()),
            dispatch: Arc::new(Mutex::new(DispatchState::new())),
            max_concurrent_uploads: Arc::new(AtomicUsize::new(config.max_concurrent_uploads)),
            events: Arc::new(EventHub::new()),
            throttler: Arc::new(ProgressThrottler::with_millis(config.stats_throttle_ms)),
            stats: Arc::new(parking_lot::RwLock::new(UploadBatchStats::default())),
        }
    }

    /// 使用默认准入组件创建调度器
    pub fn with_defaults(identifier: impl Into<String>, client: Arc<dyn IngestClient>) -> Self {
        Self::new(
            identifier,
            client,
            Arc::new(RateLimiter::new()),
            Arc::new(ConcurrencyController::new()),
            Arc::new(RetryingExecutor::default()),
            &UploadConfig::default(),
        )
    }

    /// 动态调整最大并发上传数
    ///
    /// 扩大上限时立即尝试补充派发
    pub async fn update_max_concurrent_uploads(&self, new_max: usize) {
        let old_max = self.max_concurrent_uploads.swap(new_max, Ordering::SeqCst);
        info!("🔧 动态调整最大并发上传数: {} -> {}", old_max, new_max);

        let mut ds = self.dispatch.lock().await;
        let started = self.fill_slots_locked(&mut ds).await;
        drop(ds);
        self.emit_started(started);
    }

    /// 当前最大并发上传数
    pub fn max_concurrent_uploads(&self) -> usize {
        self.max_concurrent_uploads.load(Ordering::SeqCst)
    }

    /// 批次是否进行中
    pub async fn is_uploading(&self) -> bool {
        self.dispatch.lock().await.running
    }

    // =====================================================
    // 任务提交与选择
    // =====================================================

    /// 提交一批上传任务
    ///
    /// 任务以 Pending 状态入列，默认选中；返回分配的任务 ID
    pub async fn submit(&self, payloads: Vec<FilePayload>) -> Vec<String> {
        let mut ids = Vec::with_capacity(payloads.len());
        let mut created = Vec::with_capacity(payloads.len());

        for payload in payloads {
            let task = UploadTask::new(payload);
            let id = task.id.clone();
            created.push(UploadEvent::Created {
                task_id: id.clone(),
                file_name: task.payload.file_name.clone(),
                size: task.payload.size,
            });

            self.tasks.insert(
                id.clone(),
                UploadTaskInfo {
                    task: Arc::new(RwLock::new(task)),
                    cancel_token: CancellationToken::new(),
                    progress: Arc::new(AtomicU8::new(0)),
                },
            );
            ids.push(id);
        }

        {
            let mut ds = self.dispatch.lock().await;
            ds.submitted.extend(ids.iter().cloned());
        }

        info!("提交 {} 个上传任务", ids.len());
        for event in &created {
            self.events.emit(event);
        }
        ids
    }

    /// 设置任务是否参与批量上传
    pub async fn set_selected(&self, task_id: &str, selected: bool) -> Result<()> {
        let entry = self.tasks.get(task_id).context("任务不存在")?;
        let mut task = entry.task.write().await;
        task.selected = selected;
        Ok(())
    }

    /// 全选/取消全选
    pub async fn select_all(&self, selected: bool) {
        for entry in self.tasks.iter() {
            entry.task.write().await.selected = selected;
        }
    }

    // =====================================================
    // 批次控制
    // =====================================================

    /// 启动批量上传
    ///
    /// 已在进行中时为幂等空操作；没有选中的任务时不重置统计、不派发。
    /// 选中任务全部处于终态时直接按现有统计收尾
    pub async fn start(&self) -> Result<()> {
        let mut ds = self.dispatch.lock().await;
        if ds.running {
            info!("批量上传已在进行中，忽略重复启动");
            return Ok(());
        }

        // 按提交顺序收集选中的任务
        let submitted = ds.submitted.clone();
        let mut selected = Vec::new();
        let mut pending = Vec::new();
        for id in &submitted {
            let Some(entry) = self.tasks.get(id) else { continue };
            let task = entry.task.read().await;
            if task.selected {
                selected.push(id.clone());
                if task.status == UploadTaskStatus::Pending {
                    pending.push(id.clone());
                }
            }
        }

        if selected.is_empty() {
            info!("没有选中的上传任务，跳过启动");
            return Ok(());
        }

        if pending.is_empty() {
            // 选中任务全部已落定，直接报告批次结束
            let stats = self.stats.read().clone();
            drop(ds);
            info!("选中任务均已处于终态，批次直接结束");
            self.events.emit(&UploadEvent::BatchFinished { stats });
            return Ok(());
        }

        info!("启动批量上传: 选中 {} 个任务，其中 {} 个待上传", selected.len(), pending.len());

        ds.batch = pending.clone();
        ds.queue = pending.into();
        ds.started_at = Some(Instant::now());
        ds.running = true;
        self.throttler.reset();

        let stats = self.recompute_stats_locked(&ds).await;
        let started = self.fill_slots_locked(&mut ds).await;
        drop(ds);

        self.emit_started(started);
        self.emit_stats(stats, true);
        Ok(())
    }

    /// 暂停一个上传中的任务
    ///
    /// 通过取消令牌协作式终止传输；任务随后落定为 Paused。
    /// 取消与完成竞态时以任务自身的完成结果为准
    pub async fn pause(&self, task_id: &str) -> Result<()> {
        let entry = self.tasks.get(task_id).context("任务不存在")?;
        let status = entry.task.read().await.status;
        if status != UploadTaskStatus::Uploading {
            anyhow::bail!("任务当前状态为「{}」，只有上传中的任务可以暂停", status.description());
        }

        entry.cancel_token.cancel();
        info!("请求暂停上传任务: {}", task_id);
        Ok(())
    }

    /// 重试一个失败或已暂停的任务
    ///
    /// 清除错误、进度归零后回到等待队列，并立即尝试派发
    pub async fn retry(&self, task_id: &str) -> Result<()> {
        let mut ds = self.dispatch.lock().await;

        {
            let entry = self.tasks.get(task_id).context("任务不存在")?;
            let mut task = entry.task.write().await;
            match task.status {
                UploadTaskStatus::Failed | UploadTaskStatus::Paused => task.mark_pending(),
                status => anyhow::bail!(
                    "任务当前状态为「{}」，只有失败或已暂停的任务可以重试",
                    status.description()
                ),
            }
            entry.progress.store(0, Ordering::SeqCst);
        }

        if !ds.batch.iter().any(|id| id == task_id) {
            ds.batch.push(task_id.to_string());
        }
        ds.queue.push_back(task_id.to_string());
        ds.running = true;
        if ds.started_at.is_none() {
            ds.started_at = Some(Instant::now());
        }

        info!("重试上传任务: {}", task_id);
        let stats = self.recompute_stats_locked(&ds).await;
        let started = self.fill_slots_locked(&mut ds).await;
        drop(ds);

        self.events.emit(&UploadEvent::Resumed {
            task_id: task_id.to_string(),
        });
        self.emit_started(started);
        self.emit_stats(stats, true);
        Ok(())
    }

    /// 删除任务（任意状态均可）
    ///
    /// 上传中的任务先被取消；其许可由执行流程无条件归还，不会悬挂
    pub async fn remove(&self, task_id: &str) -> Result<()> {
        let mut ds = self.dispatch.lock().await;

        let Some((_, info)) = self.tasks.remove(task_id) else {
            anyhow::bail!("任务不存在");
        };
        info.cancel_token.cancel();

        ds.submitted.retain(|id| id != task_id);
        ds.queue.retain(|id| id != task_id);
        ds.batch.retain(|id| id != task_id);

        let stats = self.recompute_stats_locked(&ds).await;
        let finished = ds.running && ds.queue.is_empty() && ds.active == 0;
        if finished {
            ds.running = false;
        }
        drop(ds);

        info!("删除上传任务: {}", task_id);
        self.events.emit(&UploadEvent::Deleted {
            task_id: task_id.to_string(),
        });
        self.emit_stats(stats.clone(), true);
        if finished {
            self.events.emit(&UploadEvent::BatchFinished { stats });
        }
        Ok(())
    }

    // =====================================================
    // 查询
    // =====================================================

    /// 获取单个任务快照（含实时进度）
    pub async fn get_task(&self, task_id: &str) -> Option<UploadTask> {
        let entry = self.tasks.get(task_id)?;
        let mut task = entry.task.read().await.clone();
        if task.status == UploadTaskStatus::Uploading {
            task.progress = entry.progress.load(Ordering::SeqCst);
        }
        Some(task)
    }

    /// 获取所有任务快照（按提交顺序）
    pub async fn get_all_tasks(&self) -> Vec<UploadTask> {
        let submitted = self.dispatch.lock().await.submitted.clone();
        futures::future::join_all(submitted.iter().map(|id| self.get_task(id)))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// 最近一次聚合统计快照
    pub fn stats(&self) -> UploadBatchStats {
        self.stats.read().clone()
    }

    /// 整体完成度百分比
    pub fn overall_progress(&self) -> u8 {
        self.stats.read().overall_progress()
    }

    /// 订阅全部上传事件
    pub fn subscribe<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// 订阅聚合统计变更
    pub fn on_stats_change<F>(&self, callback: F) -> EventSubscription
    where
        F: Fn(UploadBatchStats) + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| match event {
            UploadEvent::StatsChanged { stats } | UploadEvent::BatchFinished { stats } => {
                callback(stats.clone());
            }
            _ => {}
        })
    }

    // =====================================================
    // 调度内部
    // =====================================================

    /// 把活跃任务补满到上限（必须持有调度锁调用）
    ///
    /// 返回本轮进入上传状态的任务 ID，事件由调用方在锁外发布
    async fn fill_slots_locked(&self, ds: &mut DispatchState) -> Vec<String> {
        let max = self.max_concurrent_uploads.load(Ordering::SeqCst);
        let mut started = Vec::new();

        while ds.active < max {
            let Some(task_id) = ds.queue.pop_front() else { break };
            // 排队期间任务可能已被删除或状态已变化
            let Some(mut entry) = self.tasks.get_mut(&task_id) else { continue };

            let payload = {
                let mut task = entry.task.write().await;
                if task.status != UploadTaskStatus::Pending || !task.selected {
                    continue;
                }
                task.mark_uploading();
                task.payload.clone()
            };

            // 旧令牌可能已处于取消态，派发时更换
            entry.cancel_token = CancellationToken::new();
            entry.progress.store(0, Ordering::SeqCst);
            let cancel_token = entry.cancel_token.clone();
            let progress = entry.progress.clone();
            drop(entry);

            ds.active += 1;
            started.push(task_id.clone());
            self.spawn_upload(task_id, payload, progress, cancel_token);
        }

        started
    }

    /// 启动单个任务的上传执行
    fn spawn_upload(
        &self,
        task_id: String,
        payload: FilePayload,
        progress: Arc<AtomicU8>,
        cancel_token: CancellationToken,
    ) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let outcome = scheduler
                .run_upload(&task_id, payload, progress, cancel_token)
                .await;
            scheduler.settle_task(&task_id, outcome).await;
        });
    }

    /// 执行一个任务的准入与传输
    ///
    /// 返回前保证已归还占用的并发许可
    async fn run_upload(
        &self,
        task_id: &str,
        payload: FilePayload,
        progress: Arc<AtomicU8>,
        cancel_token: CancellationToken,
    ) -> Result<IngestResponse, IngestError> {
        // 1. 并发许可；等待期间被暂停时尚未持有许可，无需归还
        let permit_id = tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                return Err(IngestError::Cancelled);
            }
            permit = self.concurrency.acquire(&self.identifier, ACTION_FILE_UPLOAD) => permit,
        };

        // 2. 限流检查；拒绝时先归还许可再失败，不额外占用并发额度
        if !self.rate_limiter.is_allowed(&self.identifier, ACTION_FILE_UPLOAD) {
            self.concurrency
                .release(&self.identifier, ACTION_FILE_UPLOAD, &permit_id);
            let retry_after = self.rate_limiter.retry_after(&self.identifier, ACTION_FILE_UPLOAD);
            warn!(
                "任务 {} 被限流拒绝，建议等待 {}s",
                task_id,
                retry_after.as_secs()
            );
            return Err(IngestError::RateLimited {
                retry_after_secs: retry_after.as_secs(),
            });
        }

        // 3. 带重试执行传输
        let progress_cb: ProgressFn = {
            let progress = progress.clone();
            let throttler = self.throttler.clone();
            let events = self.events.clone();
            let task_id = task_id.to_string();
            Arc::new(move |p: u8| {
                let p = p.min(100);
                // 单次尝试内进度单调不减
                let prev = progress.fetch_max(p, Ordering::SeqCst);
                if p > prev && throttler.should_emit() {
                    events.emit(&UploadEvent::Progress {
                        task_id: task_id.clone(),
                        progress: p,
                    });
                }
            })
        };

        let client = self.client.clone();
        let result = self
            .executor
            .execute(&cancel_token, |_attempt| {
                let client = client.clone();
                let payload = payload.clone();
                let progress = progress.clone();
                let progress_cb = progress_cb.clone();
                let cancel = cancel_token.clone();
                async move {
                    // 每次尝试都从 0 重新传输
                    progress.store(0, Ordering::SeqCst);
                    client.ingest(payload, progress_cb, cancel).await
                }
            })
            .await;

        // 4. 无论结果如何，先归还许可再进入状态落定
        self.concurrency
            .release(&self.identifier, ACTION_FILE_UPLOAD, &permit_id);
        result
    }

    /// 任务落定：写终态、重算统计、回填空位、判断批次收尾
    ///
    /// 全程持有调度锁，统计与状态转换对外表现为原子变化
    async fn settle_task(&self, task_id: &str, outcome: Result<IngestResponse, IngestError>) {
        let mut ds = self.dispatch.lock().await;
        ds.active = ds.active.saturating_sub(1);

        // 任务可能在上传途中被删除；此时只回收槽位
        let mut event = None;
        if let Some(entry) = self.tasks.get(task_id) {
            let mut task = entry.task.write().await;
            match outcome {
                Ok(response) => {
                    task.mark_completed(response.records_count);
                    entry.progress.store(100, Ordering::SeqCst);
                    info!(
                        "✓ 上传任务完成: {} ({}), 入库记录 {} 条",
                        task_id, task.payload.file_name, response.records_count
                    );
                    event = Some(UploadEvent::Completed {
                        task_id: task_id.to_string(),
                        completed_at: task.completed_at.unwrap_or_default(),
                        records_count: response.records_count,
                    });
                }
                Err(IngestError::Cancelled) => {
                    task.mark_paused();
                    info!("上传任务已暂停: {}", task_id);
                    event = Some(UploadEvent::Paused {
                        task_id: task_id.to_string(),
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    task.mark_failed(message.clone());
                    error!("上传任务失败: {} - {}", task_id, message);
                    event = Some(UploadEvent::Failed {
                        task_id: task_id.to_string(),
                        error: message,
                    });
                }
            }
        }

        let stats = self.recompute_stats_locked(&ds).await;
        let started = self.fill_slots_locked(&mut ds).await;

        let finished = ds.running && ds.queue.is_empty() && ds.active == 0;
        if finished {
            ds.running = false;
        }
        drop(ds);

        if let Some(event) = event {
            self.events.emit(&event);
        }
        self.emit_started(started);
        self.emit_stats(stats.clone(), true);
        if finished {
            info!(
                "批量上传批次结束: 共 {} 个, 完成 {}, 失败 {}, 耗时 {}ms",
                stats.total_files, stats.completed_files, stats.failed_files, stats.upload_time_ms
            );
            self.events.emit(&UploadEvent::BatchFinished { stats });
        }
    }

    /// 由任务状态重算批次统计（必须持有调度锁调用）
    async fn recompute_stats_locked(&self, ds: &DispatchState) -> UploadBatchStats {
        let mut stats = UploadBatchStats::default();
        for id in &ds.batch {
            let Some(entry) = self.tasks.get(id) else { continue };
            let task = entry.task.read().await;
            stats.total_files += 1;
            match task.status {
                UploadTaskStatus::Completed => {
                    stats.completed_files += 1;
                    stats.total_records += task.records_count;
                }
                UploadTaskStatus::Failed => stats.failed_files += 1,
                _ => {}
            }
        }
        stats.upload_time_ms = ds
            .started_at
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(0);

        *self.stats.write() = stats.clone();
        stats
    }

    fn emit_started(&self, started: Vec<String>) {
        for task_id in started {
            self.events.emit(&UploadEvent::Started { task_id });
        }
    }

    fn emit_stats(&self, stats: UploadBatchStats, force: bool) {
        if force {
            self.throttler.force_emit();
        } else if !self.throttler.should_emit() {
            return;
        }
        self.events.emit(&UploadEvent::StatsChanged { stats });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    /// 可编排的入库服务桩
    ///
    /// 按文件名编排每次调用的结果；没有剧本的文件默认成功
    struct MockIngestClient {
        /// 单次传输耗时
        delay: Duration,
        /// file_name -> 依次弹出的结果剧本
        script: SyncMutex<HashMap<String, VecDeque<Result<IngestResponse, IngestError>>>>,
        /// 总调用次数
        calls: AtomicU32,
    }

    impl MockIngestClient {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                script: SyncMutex::new(HashMap::new()),
                calls: AtomicU32::new(0),
            }
        }

        fn script_results(
            &self,
            file_name: &str,
            results: Vec<Result<IngestResponse, IngestError>>,
        ) {
            self.script
                .lock()
                .insert(file_name.to_string(), results.into());
        }

        fn call_count(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl IngestClient for MockIngestClient {
        async fn ingest(
            &self,
            payload: FilePayload,
            progress: ProgressFn,
            cancel: CancellationToken,
        ) -> Result<IngestResponse, IngestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            progress(10);

            tokio::select! {
                _ = cancel.cancelled() => return Err(IngestError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }

            let scripted = self
                .script
                .lock()
                .get_mut(&payload.file_name)
                .and_then(|queue| queue.pop_front());
            match scripted {
                Some(result) => {
                    if result.is_ok() {
                        progress(100);
                    }
                    result
                }
                None => {
                    progress(100);
                    Ok(IngestResponse {
                        records_count: 7,
                        ..Default::default()
                    })
                }
            }
        }
    }

    fn payloads(n: usize) -> Vec<FilePayload> {
        (0..n)
            .map(|i| FilePayload::new(format!("./reports/r{}.json", i), format!("r{}.json", i), 1024))
            .collect()
    }

    async fn scheduler_with(client: Arc<MockIngestClient>) -> UploadScheduler {
        UploadScheduler::with_defaults("session-1", client)
    }

    async fn uploading_count(scheduler: &UploadScheduler) -> usize {
        scheduler
            .get_all_tasks()
            .await
            .iter()
            .filter(|t| t.status == UploadTaskStatus::Uploading)
            .count()
    }

    /// 轮询等待批次结束
    async fn wait_for_finish(scheduler: &UploadScheduler) {
        for _ in 0..1000 {
            if !scheduler.is_uploading().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("批次未在预期时间内结束");
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_concurrency_and_backfill() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(100)));
        let scheduler = scheduler_with(client.clone()).await;

        scheduler.submit(payloads(10)).await;
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;

        // 启动后恰好 3 个任务处于上传中
        assert_eq!(uploading_count(&scheduler).await, 3);

        // 全程活跃数不超过上限
        loop {
            if !scheduler.is_uploading().await {
                break;
            }
            assert!(uploading_count(&scheduler).await <= 3);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let stats = scheduler.stats();
        assert_eq!(stats.total_files, 10);
        assert_eq!(stats.completed_files, 10);
        assert_eq!(stats.failed_files, 0);
        assert_eq!(stats.total_records, 70);
        assert!(stats.is_settled());
        assert_eq!(scheduler.overall_progress(), 100);
        assert_eq!(client.call_count(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_selected_is_noop() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        let scheduler = scheduler_with(client.clone()).await;

        scheduler.submit(payloads(3)).await;
        scheduler.select_all(false).await;
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;

        // 不派发、不重置统计
        assert_eq!(uploading_count(&scheduler).await, 0);
        assert!(!scheduler.is_uploading().await);
        assert_eq!(scheduler.stats(), UploadBatchStats::default());
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_is_idempotent() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(50)));
        let scheduler = scheduler_with(client.clone()).await;

        scheduler.submit(payloads(5)).await;
        scheduler.start().await.unwrap();
        // 批次进行中重复启动被忽略
        scheduler.start().await.unwrap();
        scheduler.start().await.unwrap();

        wait_for_finish(&scheduler).await;
        assert_eq!(client.call_count(), 5);
        assert_eq!(scheduler.stats().completed_files, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_task_records_error_and_others_continue() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(20)));
        client.script_results(
            "r1.json",
            vec![Err(IngestError::from_status(422, "格式不合法"))],
        );
        let scheduler = scheduler_with(client.clone()).await;

        let ids = scheduler.submit(payloads(3)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        let stats = scheduler.stats();
        assert_eq!(stats.total_files, 3);
        assert_eq!(stats.completed_files, 2);
        assert_eq!(stats.failed_files, 1);
        assert!(stats.is_settled());

        let failed = scheduler.get_task(&ids[1]).await.unwrap();
        assert_eq!(failed.status, UploadTaskStatus::Failed);
        assert!(failed.error.as_deref().unwrap().contains("格式不合法"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_retried_then_succeeds() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        client.script_results(
            "r0.json",
            vec![
                Err(IngestError::from_status(503, "service unavailable")),
                Err(IngestError::from_status(503, "service unavailable")),
            ],
        );
        let scheduler = scheduler_with(client.clone()).await;

        scheduler.submit(payloads(1)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        // 两次 503 后第三次成功，任务最终完成
        assert_eq!(client.call_count(), 3);
        let stats = scheduler.stats();
        assert_eq!(stats.completed_files, 1);
        assert_eq!(stats.failed_files, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_task_fails_without_retry() {
        let mut profiles = crate::admission::default_profiles();
        profiles.insert(
            ACTION_FILE_UPLOAD.to_string(),
            crate::admission::RateLimitProfile {
                window_ms: 60_000,
                max_requests: 2,
                block_duration_ms: 300_000,
            },
        );
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        let scheduler = UploadScheduler::new(
            "session-1",
            client.clone(),
            Arc::new(RateLimiter::with_profiles(profiles)),
            Arc::new(ConcurrencyController::new()),
            Arc::new(RetryingExecutor::default()),
            &UploadConfig::default(),
        );

        let ids = scheduler.submit(payloads(3)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        let stats = scheduler.stats();
        assert_eq!(stats.completed_files, 2);
        assert_eq!(stats.failed_files, 1);
        // 被限流的任务只做了准入检查，没有发起传输
        assert_eq!(client.call_count(), 2);

        let failed = scheduler.get_task(&ids[2]).await.unwrap();
        assert!(failed.error.as_deref().unwrap().contains("请求过于频繁"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_releases_permit_and_backfills() {
        let client = Arc::new(MockIngestClient::new(Duration::from_secs(60)));
        let concurrency = Arc::new(ConcurrencyController::new());
        let scheduler = UploadScheduler::new(
            "session-1",
            client.clone(),
            Arc::new(RateLimiter::new()),
            concurrency.clone(),
            Arc::new(RetryingExecutor::default()),
            &UploadConfig {
                max_concurrent_uploads: 1,
                ..Default::default()
            },
        );

        let ids = scheduler.submit(payloads(2)).await;
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;

        let first = scheduler.get_task(&ids[0]).await.unwrap();
        assert_eq!(first.status, UploadTaskStatus::Uploading);
        let second = scheduler.get_task(&ids[1]).await.unwrap();
        assert_eq!(second.status, UploadTaskStatus::Pending);
        assert_eq!(concurrency.get_current_concurrency("session-1", ACTION_FILE_UPLOAD), 1);

        // 暂停第一个任务：许可归还、状态转为 Paused、第二个任务补位
        scheduler.pause(&ids[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let first = scheduler.get_task(&ids[0]).await.unwrap();
        assert_eq!(first.status, UploadTaskStatus::Paused);
        assert!(first.error.is_none());

        let second = scheduler.get_task(&ids[1]).await.unwrap();
        assert_eq!(second.status, UploadTaskStatus::Uploading);
        assert_eq!(concurrency.get_current_concurrency("session-1", ACTION_FILE_UPLOAD), 1);

        // 暂停不计入失败
        assert_eq!(scheduler.stats().failed_files, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_failed_task_reenters_dispatch() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        client.script_results(
            "r0.json",
            vec![Err(IngestError::from_status(400, "bad request"))],
        );
        let scheduler = scheduler_with(client.clone()).await;

        let ids = scheduler.submit(payloads(1)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        let task = scheduler.get_task(&ids[0]).await.unwrap();
        assert_eq!(task.status, UploadTaskStatus::Failed);
        assert_eq!(scheduler.stats().failed_files, 1);

        // 重试后错误清除、进度归零，重新派发并成功
        scheduler.retry(&ids[0]).await.unwrap();
        let task = scheduler.get_task(&ids[0]).await.unwrap();
        assert!(task.error.is_none());

        wait_for_finish(&scheduler).await;
        let stats = scheduler.stats();
        assert_eq!(stats.completed_files, 1);
        assert_eq!(stats.failed_files, 0);
        assert!(stats.is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_illegal_transitions_rejected() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        let scheduler = scheduler_with(client.clone()).await;

        let ids = scheduler.submit(payloads(1)).await;

        // Pending 任务既不能暂停也不能重试
        assert!(scheduler.pause(&ids[0]).await.is_err());
        assert!(scheduler.retry(&ids[0]).await.is_err());

        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        // 已完成的任务同样拒绝
        assert!(scheduler.pause(&ids[0]).await.is_err());
        assert!(scheduler.retry(&ids[0]).await.is_err());

        // 未知任务
        assert!(scheduler.pause("no-such-task").await.is_err());
        assert!(scheduler.remove("no-such-task").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_active_task_releases_permit() {
        let client = Arc::new(MockIngestClient::new(Duration::from_secs(60)));
        let concurrency = Arc::new(ConcurrencyController::new());
        let scheduler = UploadScheduler::new(
            "session-1",
            client.clone(),
            Arc::new(RateLimiter::new()),
            concurrency.clone(),
            Arc::new(RetryingExecutor::default()),
            &UploadConfig::default(),
        );

        let ids = scheduler.submit(payloads(1)).await;
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(concurrency.get_current_concurrency("session-1", ACTION_FILE_UPLOAD), 1);

        // 删除上传中的任务：隐式取消，许可不悬挂
        scheduler.remove(&ids[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(scheduler.get_task(&ids[0]).await.is_none());
        assert_eq!(concurrency.get_current_concurrency("session-1", ACTION_FILE_UPLOAD), 0);
        assert!(!scheduler.is_uploading().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_finished_event_and_aggregate_consistency() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(20)));
        client.script_results("r2.json", vec![Err(IngestError::from_status(400, "坏请求"))]);
        let scheduler = scheduler_with(client.clone()).await;

        let finished = Arc::new(SyncMutex::new(Vec::new()));
        let _sub = {
            let finished = finished.clone();
            scheduler.subscribe(move |event| {
                if let UploadEvent::BatchFinished { stats } = event {
                    finished.lock().push(stats.clone());
                }
            })
        };

        scheduler.submit(payloads(6)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        let finished = finished.lock();
        assert_eq!(finished.len(), 1);
        let stats = &finished[0];
        assert_eq!(stats.total_files, 6);
        assert_eq!(stats.completed_files + stats.failed_files, stats.total_files);
        assert_eq!(stats.failed_files, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_all_terminal_reports_finished() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        let scheduler = scheduler_with(client.clone()).await;

        scheduler.submit(payloads(2)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;
        assert_eq!(client.call_count(), 2);

        let finished = Arc::new(SyncMutex::new(0usize));
        let _sub = {
            let finished = finished.clone();
            scheduler.subscribe(move |event| {
                if matches!(event, UploadEvent::BatchFinished { .. }) {
                    *finished.lock() += 1;
                }
            })
        };

        // 所有任务均已终态：再次启动直接按现有统计收尾，不重新派发
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(*finished.lock(), 1);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_order_independent_of_dispatch_order() {
        let client = Arc::new(MockIngestClient::new(Duration::from_millis(10)));
        let scheduler = scheduler_with(client.clone()).await;

        let order = Arc::new(SyncMutex::new(Vec::new()));
        let _sub = {
            let order = order.clone();
            scheduler.subscribe(move |event| {
                if let UploadEvent::Completed { task_id, .. } = event {
                    order.lock().push(task_id.clone());
                }
            })
        };

        let ids = scheduler.submit(payloads(5)).await;
        scheduler.start().await.unwrap();
        wait_for_finish(&scheduler).await;

        // 完成顺序不做保证，但全部任务恰好完成一次
        let mut completed = order.lock().clone();
        completed.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(completed, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_raising_upload_limit_backfills() {
        let client = Arc::new(MockIngestClient::new(Duration::from_secs(60)));
        let scheduler = UploadScheduler::new(
            "session-1",
            client.clone(),
            Arc::new(RateLimiter::new()),
            Arc::new(ConcurrencyController::new()),
            Arc::new(RetryingExecutor::default()),
            &UploadConfig {
                max_concurrent_uploads: 1,
                ..Default::default()
            },
        );

        scheduler.submit(payloads(3)).await;
        scheduler.start().await.unwrap();
        tokio::task::yield_now().await;
        assert_eq!(uploading_count(&scheduler).await, 1);

        scheduler.update_max_concurrent_uploads(3).await;
        tokio::task::yield_now().await;
        assert_eq!(uploading_count(&scheduler).await, 3);
    }
}
