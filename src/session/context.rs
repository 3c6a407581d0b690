//! 会话上下文：一次通话的版本化键值集合（user / call / company / 业务键）
//!
//! 每次顶层键变更都会推进全局版本并发布 ContextUpdated；把键设为 null 视为删除。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::core::{ChangeCallback, Versioned};
use crate::session::{EventHub, SessionEvent};

#[derive(Debug, Clone)]
pub struct SessionContext {
    entries: Arc<Mutex<BTreeMap<String, Versioned<Value>>>>,
    version: Arc<AtomicU64>,
    hub: EventHub,
}

impl SessionContext {
    pub fn new(hub: EventHub) -> Self {
        Self {
            entries: Arc::new(Mutex::new(BTreeMap::new())),
            version: Arc::new(AtomicU64::new(0)),
            hub,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Versioned<Value>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 全局上下文版本
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).map(|v| v.get().clone())
    }

    /// 当前全部键值的快照（用于渲染系统提示）
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.get().clone()))
            .collect()
    }

    /// 写入顶层键；value 为 null 时等同 remove。返回新的全局版本
    pub fn set(&self, key: &str, value: Value) -> u64 {
        if value.is_null() {
            return self.remove(key);
        }
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.set(value);
        } else {
            let mut entry = Versioned::with_callback(Value::Null, self.change_callback(key));
            entry.set(value);
            entries.insert(key.to_string(), entry);
        }
        self.version()
    }

    /// 对已有键做嵌套修改（如 user.name）；键不存在返回 None
    pub fn update<R>(&self, key: &str, f: impl FnOnce(&mut Value) -> R) -> Option<R> {
        let mut entries = self.lock();
        entries.get_mut(key).map(|entry| entry.update(f))
    }

    pub fn remove(&self, key: &str) -> u64 {
        let mut entries = self.lock();
        if entries.remove(key).is_none() {
            return self.version();
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.hub.publish(&SessionEvent::ContextRemoved {
            key: key.to_string(),
            version,
        });
        version
    }

    fn change_callback(&self, key: &str) -> ChangeCallback<Value> {
        let key = key.to_string();
        let hub = self.hub.clone();
        let global = self.version.clone();
        Arc::new(move |value: &Value, _entry_version: u64| {
            let version = global.fetch_add(1, Ordering::SeqCst) + 1;
            hub.publish(&SessionEvent::ContextUpdated {
                key: key.clone(),
                value: value.clone(),
                version,
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_bumps_global_version_per_key_change() {
        let hub = EventHub::new();
        let mut rx = hub.channel();
        let ctx = SessionContext::new(hub);

        assert_eq!(ctx.set("user", json!({"name": "Ada"})), 1);
        assert_eq!(ctx.set("call", json!({"sid": "CA1"})), 2);
        assert_eq!(ctx.set("user", json!({"name": "Grace"})), 3);

        let mut keys = Vec::new();
        while let Ok(SessionEvent::ContextUpdated { key, version, .. }) = rx.try_recv() {
            keys.push((key, version));
        }
        assert_eq!(
            keys,
            vec![("user".into(), 1), ("call".into(), 2), ("user".into(), 3)]
        );
        assert_eq!(ctx.get("user").unwrap()["name"], "Grace");
    }

    #[test]
    fn test_nested_update_publishes_once() {
        let hub = EventHub::new();
        let mut rx = hub.channel();
        let ctx = SessionContext::new(hub);
        ctx.set("user", json!({"name": "Ada", "tier": "basic"}));
        let _ = rx.try_recv();

        ctx.update("user", |u| {
            u["tier"] = json!("gold");
            u["points"] = json!(10);
        });

        assert!(matches!(
            rx.try_recv(),
            Ok(SessionEvent::ContextUpdated { value, .. }) if value["tier"] == "gold"
        ));
        assert!(rx.try_recv().is_err());
        assert!(ctx.update("missing", |_| ()).is_none());
    }

    #[test]
    fn test_null_removes_key() {
        let hub = EventHub::new();
        let mut rx = hub.channel();
        let ctx = SessionContext::new(hub);
        ctx.set("company", json!("Acme"));
        let v = ctx.set("company", Value::Null);

        assert_eq!(v, 2);
        assert!(ctx.get("company").is_none());
        let _ = rx.try_recv();
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::ContextRemoved { key, .. }) if key == "company"));
        // 删除不存在的键不推进版本
        assert_eq!(ctx.remove("company"), 2);
    }
}
