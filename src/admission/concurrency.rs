// 并发许可控制器
//
// 按 (identifier, action) 维度限制同时在途的操作数：
// - acquire 挂起等待空位，永不拒绝；有界等待由调用方自行包超时
// - release 幂等，未知许可号为空操作
// - 等待者严格 FIFO 唤醒，后来者不得插队
// - 某个 key 的最后一个许可释放后整个条目被移除，一次性 key 不积累内存

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};
use uuid::Uuid;

use super::rate_limiter::{ACTION_API_CALL, ACTION_FILE_UPLOAD};

/// 分析动作
pub const ACTION_ANALYSIS: &str = "analysis";

/// 未配置 action 的默认并发上限
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// 内置并发上限表
pub fn default_limits() -> HashMap<String, usize> {
    let mut limits = HashMap::new();
    limits.insert(ACTION_FILE_UPLOAD.to_string(), 3);
    limits.insert(ACTION_API_CALL.to_string(), 10);
    limits.insert(ACTION_ANALYSIS.to_string(), 2);
    limits
}

/// 单个 key 的许可状态
#[derive(Default)]
struct PermitSlot {
    /// 在途许可号集合；每个许可恰好对应一次成功的 acquire
    active: HashSet<String>,
    /// 等待者队列（FIFO）
    waiters: VecDeque<u64>,
    /// 等待者共享的唤醒信号
    notify: Arc<Notify>,
}

/// 并发许可控制器
///
/// 显式构造、按引用注入；内部状态由单把互斥锁保护，
/// 临界区内不产生任何 await 点
pub struct ConcurrencyController {
    /// key -> 许可状态
    slots: Mutex<HashMap<String, PermitSlot>>,
    /// action -> 并发上限
    limits: Mutex<HashMap<String, usize>>,
    /// 等待者编号分配器
    next_waiter_id: AtomicU64,
}

impl ConcurrencyController {
    /// 使用内置上限表创建控制器
    pub fn new() -> Self {
        Self::with_limits(default_limits())
    }

    /// 使用指定上限表创建控制器
    pub fn with_limits(limits: HashMap<String, usize>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            limits: Mutex::new(limits),
            next_waiter_id: AtomicU64::new(1),
        }
    }

    fn slot_key(identifier: &str, action: &str) -> String {
        format!("{}:{}", identifier, action)
    }

    fn new_permit_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// 查询 action 的并发上限
    pub fn max_concurrency(&self, action: &str) -> usize {
        self.limits
            .lock()
            .get(action)
            .copied()
            .unwrap_or(DEFAULT_MAX_CONCURRENT)
    }

    /// 调整 action 的并发上限
    ///
    /// 扩容时唤醒相关等待者
    pub fn set_max_concurrency(&self, action: &str, max: usize) {
        {
            let mut limits = self.limits.lock();
            limits.insert(action.to_string(), max);
        }
        info!("🔧 动态调整并发上限: action={}, max={}", action, max);

        let suffix = format!(":{}", action);
        let slots = self.slots.lock();
        for (key, slot) in slots.iter() {
            if key.ends_with(&suffix) && !slot.waiters.is_empty() {
                slot.notify.notify_waiters();
            }
        }
    }

    /// 获取一个许可
    ///
    /// 有空位时立即返回许可号；否则挂起直到空位出现。
    /// 等待途中放弃（future 被丢弃）会自动出队并把唤醒转交给后继，
    /// 放弃等待的调用方一定不要调用 `release`。
    pub async fn acquire(&self, identifier: &str, action: &str) -> String {
        let key = Self::slot_key(identifier, action);

        // 快速路径：没有等待者且有空位，直接占用
        let (waiter_id, notify) = {
            let max = self.max_concurrency(action);
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.clone()).or_default();

            if slot.waiters.is_empty() && slot.active.len() < max {
                let permit_id = Self::new_permit_id();
                slot.active.insert(permit_id.clone());
                return permit_id;
            }

            let waiter_id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
            slot.waiters.push_back(waiter_id);
            (waiter_id, slot.notify.clone())
        };

        debug!("并发许可排队: key={}, waiter_id={}", key, waiter_id);
        let mut guard = WaiterGuard {
            controller: self,
            key: key.clone(),
            waiter_id,
            armed: true,
        };

        loop {
            // 先注册唤醒意向再检查条件，避免 release 在两者之间发生时丢失唤醒
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let max = self.max_concurrency(action);
                let mut slots = self.slots.lock();
                if let Some(slot) = slots.get_mut(&key) {
                    // 只有队首等待者可以占用空位，保证 FIFO
                    if slot.active.len() < max && slot.waiters.front() == Some(&waiter_id) {
                        slot.waiters.pop_front();
                        let permit_id = Self::new_permit_id();
                        slot.active.insert(permit_id.clone());

                        // 仍有富余空位时继续唤醒后继等待者
                        if slot.active.len() < max && !slot.waiters.is_empty() {
                            slot.notify.notify_waiters();
                        }

                        guard.armed = false;
                        debug!("并发许可获得: key={}, waiter_id={}", key, waiter_id);
                        return permit_id;
                    }
                }
            }

            notified.await;
        }
    }

    /// 释放许可
    ///
    /// 对同一许可号的重复释放、以及从未发放过的许可号均为空操作
    pub fn release(&self, identifier: &str, action: &str, permit_id: &str) {
        let key = Self::slot_key(identifier, action);
        let mut slots = self.slots.lock();

        if let Some(slot) = slots.get_mut(&key) {
            if slot.active.remove(permit_id) {
                if slot.active.is_empty() && slot.waiters.is_empty() {
                    slots.remove(&key);
                } else {
                    slot.notify.notify_waiters();
                }
            }
        }
    }

    /// 查询当前在途并发数
    pub fn get_current_concurrency(&self, identifier: &str, action: &str) -> usize {
        let key = Self::slot_key(identifier, action);
        self.slots
            .lock()
            .get(&key)
            .map(|slot| slot.active.len())
            .unwrap_or(0)
    }

    /// 查询当前排队等待数（调试用）
    pub fn waiting_count(&self, identifier: &str, action: &str) -> usize {
        let key = Self::slot_key(identifier, action);
        self.slots
            .lock()
            .get(&key)
            .map(|slot| slot.waiters.len())
            .unwrap_or(0)
    }

    /// 当前跟踪的 key 数量（调试用）
    pub fn tracked_key_count(&self) -> usize {
        self.slots.lock().len()
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new()
    }
}

/// 等待者出队守卫
///
/// acquire 的 future 在排队途中被丢弃时负责清理队列，
/// 并把可能已落到自己头上的唤醒转交给后继等待者
struct WaiterGuard<'a> {
    controller: &'a ConcurrencyController,
    key: String,
    waiter_id: u64,
    armed: bool,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let mut slots = self.controller.slots.lock();
        if let Some(slot) = slots.get_mut(&self.key) {
            slot.waiters.retain(|id| *id != self.waiter_id);
            if slot.active.is_empty() && slot.waiters.is_empty() {
                slots.remove(&self.key);
            } else {
                slot.notify.notify_waiters();
            }
        }
        debug!("并发等待者放弃排队: key={}, waiter_id={}", self.key, self.waiter_id);
    }
}
