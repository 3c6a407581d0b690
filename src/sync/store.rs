//! 外部同步存储抽象
//!
//! 每通电话按 (call, kind) 分成两张 key/value 映射：turns 与 context，值是不透明的 JSON。
//! 存储端自带限流与 not-found 错误形状，复制队列对这两类错误特殊处理。
//! 每个 trait 方法对应一次远端写入，映射本身由 prepare_map 单独创建。

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// 复制对象种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaKind {
    Turn,
    Context,
}

impl ReplicaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicaKind::Turn => "turns",
            ReplicaKind::Context => "context",
        }
    }

    /// 某通电话此类对象所在的映射名
    pub fn map_name(&self, call_id: &str) -> String {
        format!("{}_{}", call_id, self.as_str())
    }
}

/// 复制键：(callId, kind, id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ReplicaKey {
    pub call_id: String,
    pub kind: ReplicaKind,
    pub id: String,
}

impl ReplicaKey {
    pub fn new(call_id: impl Into<String>, kind: ReplicaKind, id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            kind,
            id: id.into(),
        }
    }

    pub fn turn(call_id: impl Into<String>, id: impl Into<String>) -> Self {
        Self::new(call_id, ReplicaKind::Turn, id)
    }

    pub fn context(call_id: impl Into<String>, key: impl Into<String>) -> Self {
        Self::new(call_id, ReplicaKind::Context, key)
    }

    /// 外部存储中的映射名
    pub fn map_name(&self) -> String {
        self.kind.map_name(&self.call_id)
    }
}

impl fmt::Display for ReplicaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.call_id, self.kind.as_str(), self.id)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Sync request failed: {0}")]
    Request(String),

    #[error("Sync write timed out after {0}ms")]
    Timeout(u64),
}

/// 外部同步存储
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// 创建 (call, kind) 对应的映射；已存在视为成功
    async fn prepare_map(&self, _call_id: &str, _kind: ReplicaKind) -> Result<(), SyncError> {
        Ok(())
    }

    /// 新实体首次写入；实体已存在时可返回 AlreadyExists，由调用方改走 update
    async fn create(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError>;

    /// 已存在实体的覆盖写
    async fn update(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError>;

    /// 删除；不存在时返回 NotFound
    async fn remove(&self, key: &ReplicaKey) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOpKind {
    Create,
    Update,
    Remove,
}

/// 内存存储记录的一次成功写入
#[derive(Debug, Clone)]
pub struct SyncOp {
    pub at: tokio::time::Instant,
    pub kind: SyncOpKind,
    pub key: ReplicaKey,
    pub value: Option<Value>,
}

#[derive(Debug, Default)]
struct MemoryState {
    items: HashMap<ReplicaKey, Value>,
    ops: Vec<SyncOp>,
    failures: VecDeque<SyncError>,
}

/// 内存同步存储：本地运行与测试用，记录全部写入，可注入延迟与失败
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    state: Mutex<MemoryState>,
    latency: Duration,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Default::default()
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 让接下来的写入依次失败
    pub fn fail_next(&self, error: SyncError) {
        self.lock().failures.push_back(error);
    }

    pub fn get(&self, key: &ReplicaKey) -> Option<Value> {
        self.lock().items.get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn ops(&self) -> Vec<SyncOp> {
        self.lock().ops.clone()
    }

    /// 某个键的写入历史
    pub fn ops_for(&self, key: &ReplicaKey) -> Vec<SyncOp> {
        self.lock()
            .ops
            .iter()
            .filter(|op| &op.key == key)
            .cloned()
            .collect()
    }

    async fn apply(&self, kind: SyncOpKind, key: &ReplicaKey, value: Option<&Value>) -> Result<(), SyncError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.lock();
        if let Some(err) = state.failures.pop_front() {
            return Err(err);
        }
        match (kind, value) {
            (SyncOpKind::Remove, _) => {
                if state.items.remove(key).is_none() {
                    return Err(SyncError::NotFound(key.to_string()));
                }
            }
            (_, Some(v)) => {
                state.items.insert(key.clone(), v.clone());
            }
            (_, None) => return Err(SyncError::Request(format!("{kind:?} without value"))),
        }
        state.ops.push(SyncOp {
            at: tokio::time::Instant::now(),
            kind,
            key: key.clone(),
            value: value.cloned(),
        });
        Ok(())
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn create(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError> {
        self.apply(SyncOpKind::Create, key, Some(value)).await
    }

    async fn update(&self, key: &ReplicaKey, value: &Value) -> Result<(), SyncError> {
        self.apply(SyncOpKind::Update, key, Some(value)).await
    }

    async fn remove(&self, key: &ReplicaKey) -> Result<(), SyncError> {
        self.apply(SyncOpKind::Remove, key, None).await
    }
}
