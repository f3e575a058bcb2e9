//! 进程内事件订阅中心
//!
//! 调度器通过 EventHub 向订阅方分发任务事件，订阅句柄析构时自动退订

use crate::events::UploadEvent;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::debug;

/// 事件回调
type EventCallback = Box<dyn Fn(&UploadEvent) + Send + Sync>;

/// 事件订阅中心
///
/// 回调在发布方的任务上下文中同步执行，订阅方不应在回调里做阻塞操作
#[derive(Default)]
pub struct EventHub {
    /// 订阅者表（subscription_id -> callback）
    subscribers: DashMap<u64, EventCallback>,
    /// 订阅 ID 分配器
    next_id: AtomicU64,
}

impl EventHub {
    /// 创建事件中心
    pub fn new() -> Self {
        Self::default()
    }

    /// 订阅事件
    ///
    /// 返回的句柄析构时自动退订，也可调用 `unsubscribe` 显式退订
    pub fn subscribe<F>(self: &Arc<Self>, callback: F) -> EventSubscription
    where
        F: Fn(&UploadEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, Box::new(callback));
        debug!("新增事件订阅: id={}, 当前订阅数={}", id, self.subscribers.len());

        EventSubscription {
            hub: Arc::downgrade(self),
            id,
        }
    }

    /// 发布事件给所有订阅者
    pub fn emit(&self, event: &UploadEvent) {
        for entry in self.subscribers.iter() {
            (entry.value())(event);
        }
    }

    /// 当前订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn remove(&self, id: u64) {
        self.subscribers.remove(&id);
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// 事件订阅句柄
///
/// 持有期间订阅有效；析构即退订
pub struct EventSubscription {
    hub: Weak<EventHub>,
    id: u64,
}

impl EventSubscription {
    /// 显式退订
    pub fn unsubscribe(self) {
        // 析构逻辑完成退订
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove(self.id);
            debug!("事件订阅已退订: id={}", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn progress_event() -> UploadEvent {
        UploadEvent::Progress {
            task_id: "t1".to_string(),
            progress: 50,
        }
    }

    #[test]
    fn test_subscribe_and_emit() {
        let hub = Arc::new(EventHub::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        let _sub = hub.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        hub.emit(&progress_event());
        hub.emit(&progress_event());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let hub = Arc::new(EventHub::new());
        let counter = Arc::new(AtomicUsize::new(0));

        {
            let c = counter.clone();
            let _sub = hub.subscribe(move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
            assert_eq!(hub.subscriber_count(), 1);
        }

        // 句柄析构后不再收到事件
        assert_eq!(hub.subscriber_count(), 0);
        hub.emit(&progress_event());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multiple_subscribers() {
        let hub = Arc::new(EventHub::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let c1 = counter.clone();
        let _s1 = hub.subscribe(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        });
        let c2 = counter.clone();
        let _s2 = hub.subscribe(move |_| {
            c2.fetch_add(10, Ordering::SeqCst);
        });

        hub.emit(&progress_event());
        assert_eq!(counter.load(Ordering::SeqCst), 11);
    }

    #[test]
    fn test_explicit_unsubscribe() {
        let hub = Arc::new(EventHub::new());
        let sub = hub.subscribe(|_| {});
        assert_eq!(hub.subscriber_count(), 1);

        sub.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }
}
