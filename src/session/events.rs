//! 会话事件：轮次与上下文的增删改
//!
//! TurnStore / SessionContext 发布，CallSession 持有同一个 EventHub 统一转发，复制队列订阅。
//! 事件在发布方持有内部锁时同步投递，保证与修改顺序一致；监听者不得回调发布方。

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::turns::{Turn, TurnId};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    TurnAdded { turn: Turn },
    TurnUpdated { turn: Turn },
    TurnDeleted { id: TurnId },
    ContextUpdated { key: String, value: Value, version: u64 },
    ContextRemoved { key: String, version: u64 },
}

/// 订阅方契约：同步、不可阻塞、不得重入发布方
pub trait SessionListener: Send + Sync {
    fn on_event(&self, event: &SessionEvent);
}

impl SessionListener for mpsc::UnboundedSender<SessionEvent> {
    fn on_event(&self, event: &SessionEvent) {
        let _ = self.send(event.clone());
    }
}

/// 一次通话内的事件分发
#[derive(Clone, Default)]
pub struct EventHub {
    listeners: Arc<RwLock<Vec<Arc<dyn SessionListener>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn SessionListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    /// 便捷订阅：返回无界 channel 的接收端
    pub fn channel(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(Arc::new(tx));
        rx
    }

    pub fn publish(&self, event: &SessionEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for l in listeners.iter() {
            l.on_event(event);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_out_to_every_listener() {
        let hub = EventHub::new();
        let mut a = hub.channel();
        let mut b = hub.channel();
        hub.publish(&SessionEvent::TurnDeleted { id: "t1".into() });

        assert!(matches!(a.try_recv(), Ok(SessionEvent::TurnDeleted { id }) if id == "t1"));
        assert!(matches!(b.try_recv(), Ok(SessionEvent::TurnDeleted { .. })));
        assert_eq!(hub.listener_count(), 2);
    }

    #[test]
    fn test_dropped_receiver_does_not_break_publish() {
        let hub = EventHub::new();
        drop(hub.channel());
        let mut live = hub.channel();
        hub.publish(&SessionEvent::ContextRemoved { key: "user".into(), version: 1 });
        assert!(live.try_recv().is_ok());
    }
}
