//! 复制队列：把轮次 / 上下文的修改镜像到外部同步存储
//!
//! - 每个 (callId, kind, id) 一条单并发、有容量上限的本地队列（lane），保证同键写入有序；
//! - lane 内的合并计数：执行更新时若后面还有排队的更新，直接跳过，只写最新状态；
//! - 两个共享的突发限流器（turns / context），新建实体优先于更新；每次远端写入都先取额度，
//!   包括首次写入前的建表和重放创建后改走的更新；
//! - 轮次更新先经过防抖（最小延迟 + 最长等待），流式输出时不会每个 token 写一次；
//! - 写入超时即丢弃，NotFound / RateLimited 记日志后吞掉，其余错误记为队列错误；
//! - 已删除的轮次记墓碑，删除之后才到达的更新直接丢弃；
//! - lane 空闲即拆除。

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::OnceCell;

use crate::session::{SessionEvent, SessionListener};
use crate::sync::debounce::Debouncer;
use crate::sync::limiter::{BurstLimiter, WritePriority};
use crate::sync::store::{ReplicaKey, ReplicaKind, SyncError, SyncStore};

/// 复制参数
#[derive(Debug, Clone)]
pub struct ReplicatorSettings {
    pub burst_limit: usize,
    pub burst_window: Duration,
    pub write_timeout: Duration,
    pub debounce_min: Duration,
    pub debounce_max_wait: Duration,
    pub lane_capacity: usize,
}

impl Default for ReplicatorSettings {
    fn default() -> Self {
        Self {
            burst_limit: 10,
            burst_window: Duration::from_millis(1000),
            write_timeout: Duration::from_millis(5000),
            debounce_min: Duration::from_millis(150),
            debounce_max_wait: Duration::from_millis(1000),
            lane_capacity: 64,
        }
    }
}

#[derive(Debug, Clone)]
enum Job {
    Create(Value),
    Update(Value),
    Remove,
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Job::Create(_) => "create",
            Job::Update(_) => "update",
            Job::Remove => "remove",
        }
    }

    fn priority(&self) -> WritePriority {
        match self {
            Job::Create(_) => WritePriority::High,
            _ => WritePriority::Low,
        }
    }
}

#[derive(Debug, Default)]
struct Lane {
    jobs: VecDeque<Job>,
    /// 已排队尚未执行的更新数
    pending_updates: usize,
}

/// 复制统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStats {
    pub writes: u64,
    pub coalesced: u64,
    pub swallowed: u64,
    pub failed: u64,
    pub timed_out: u64,
}

#[derive(Debug, Default)]
struct Counters {
    writes: AtomicU64,
    coalesced: AtomicU64,
    swallowed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
}

pub struct Replicator {
    call_id: String,
    store: Arc<dyn SyncStore>,
    settings: ReplicatorSettings,
    turn_limiter: BurstLimiter,
    context_limiter: BurstLimiter,
    lanes: Mutex<HashMap<ReplicaKey, Lane>>,
    /// 已创建过的上下文键：首次写入走 create
    known_context: Mutex<HashSet<String>>,
    /// 已删除的轮次
    deleted: Mutex<HashSet<ReplicaKey>>,
    turn_map: OnceCell<()>,
    context_map: OnceCell<()>,
    debouncer: Debouncer<ReplicaKey, Value>,
    counters: Counters,
    this: Weak<Replicator>,
}

impl Replicator {
    /// 需在 tokio 运行时内创建（lane 与防抖计时任务通过 tokio::spawn 运行）
    pub fn new(
        call_id: impl Into<String>,
        store: Arc<dyn SyncStore>,
        settings: ReplicatorSettings,
    ) -> Arc<Self> {
        let call_id = call_id.into();
        Arc::new_cyclic(|this: &Weak<Replicator>| {
            let sink = {
                let this = this.clone();
                move |key: ReplicaKey, value: Value| {
                    if let Some(replicator) = this.upgrade() {
                        replicator.enqueue(key, Job::Update(value));
                    }
                }
            };
            Self {
                turn_limiter: BurstLimiter::new(
                    "turns",
                    settings.burst_limit,
                    settings.burst_window,
                ),
                context_limiter: BurstLimiter::new(
                    "context",
                    settings.burst_limit,
                    settings.burst_window,
                ),
                debouncer: Debouncer::new(settings.debounce_min, settings.debounce_max_wait, sink),
                call_id,
                store,
                settings,
                lanes: Mutex::new(HashMap::new()),
                known_context: Mutex::new(HashSet::new()),
                deleted: Mutex::new(HashSet::new()),
                turn_map: OnceCell::new(),
                context_map: OnceCell::new(),
                counters: Counters::default(),
                this: this.clone(),
            }
        })
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<ReplicaKey, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 仍有待写或写入中的键数
    pub fn pending_lanes(&self) -> usize {
        self.lanes().len()
    }

    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            writes: self.counters.writes.load(Ordering::Relaxed),
            coalesced: self.counters.coalesced.load(Ordering::Relaxed),
            swallowed: self.counters.swallowed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
        }
    }

    /// 立即触发全部防抖中的更新，并等待队列排空；超时返回 false
    pub async fn flush(&self, max_wait: Duration) -> bool {
        let fired = self.debouncer.flush();
        tracing::debug!(call_id = %self.call_id, fired, "replication flush");
        let drained = tokio::time::timeout(max_wait, async {
            while self.pending_lanes() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                call_id = %self.call_id,
                pending = self.pending_lanes(),
                "replication flush timed out"
            );
        }
        drained.is_ok()
    }

    fn limiter(&self, kind: ReplicaKind) -> &BurstLimiter {
        match kind {
            ReplicaKind::Turn => &self.turn_limiter,
            ReplicaKind::Context => &self.context_limiter,
        }
    }

    fn is_deleted(&self, key: &ReplicaKey) -> bool {
        self.deleted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn enqueue(&self, key: ReplicaKey, job: Job) {
        if matches!(job, Job::Update(_)) && self.is_deleted(&key) {
            tracing::trace!(call_id = %self.call_id, key = %key, "update after delete dropped");
            return;
        }
        let mut lanes = self.lanes();
        let spawn_worker = !lanes.contains_key(&key);
        let lane = lanes.entry(key.clone()).or_default();

        if lane.jobs.len() >= self.settings.lane_capacity {
            match (&job, lane.jobs.back_mut()) {
                (Job::Update(value), Some(Job::Update(tail))) => {
                    *tail = value.clone();
                    self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                }
                _ => {
                    tracing::warn!(
                        call_id = %self.call_id,
                        key = %key,
                        job = job.label(),
                        "replication lane full, job dropped"
                    );
                }
            }
            return;
        }

        if matches!(job, Job::Update(_)) {
            lane.pending_updates += 1;
        }
        lane.jobs.push_back(job);
        drop(lanes);

        if spawn_worker {
            if let Some(this) = self.this.upgrade() {
                tokio::spawn(async move { this.run_lane(key).await });
            }
        }
    }

    /// lane 工作循环：一次只执行一个写入，队列空即拆除
    async fn run_lane(self: Arc<Self>, key: ReplicaKey) {
        loop {
            let job = {
                let mut lanes = self.lanes();
                let Some(lane) = lanes.get_mut(&key) else {
                    return;
                };
                match lane.jobs.pop_front() {
                    Some(Job::Update(value)) => {
                        let superseded = lane.pending_updates > 1;
                        lane.pending_updates = lane.pending_updates.saturating_sub(1);
                        if superseded {
                            self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                            continue;
                        }
                        Job::Update(value)
                    }
                    Some(job) => job,
                    None => {
                        lanes.remove(&key);
                        tracing::trace!(call_id = %self.call_id, key = %key, "replication lane idle, removed");
                        return;
                    }
                }
            };
            self.execute(&key, job).await;
        }
    }

    async fn timed(&self, write: impl Future<Output = Result<(), SyncError>>) -> Result<(), SyncError> {
        match tokio::time::timeout(self.settings.write_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.settings.write_timeout.as_millis() as u64)),
        }
    }

    /// 每种映射只建一次，建表本身也占一次写入额度；失败时下次写入重试
    async fn prepare_map(&self, kind: ReplicaKind) -> Result<(), SyncError> {
        let cell = match kind {
            ReplicaKind::Turn => &self.turn_map,
            ReplicaKind::Context => &self.context_map,
        };
        cell.get_or_try_init(|| async {
            self.limiter(kind).acquire(WritePriority::High).await;
            self.timed(self.store.prepare_map(&self.call_id, kind)).await?;
            tracing::debug!(call_id = %self.call_id, map = %kind.map_name(&self.call_id), "sync map prepared");
            Ok::<(), SyncError>(())
        })
        .await
        .map(|_| ())
    }

    /// 取一次额度后发出一次远端写入
    async fn write(&self, key: &ReplicaKey, job: &Job) -> Result<(), SyncError> {
        self.limiter(key.kind).acquire(job.priority()).await;
        self.timed(async {
            match job {
                Job::Create(value) => self.store.create(key, value).await,
                Job::Update(value) => self.store.update(key, value).await,
                Job::Remove => self.store.remove(key).await,
            }
        })
        .await
    }

    async fn execute(&self, key: &ReplicaKey, job: Job) {
        let label = job.label();
        if !matches!(job, Job::Remove) {
            if let Err(e) = self.prepare_map(key.kind).await {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(call_id = %self.call_id, key = %key, job = label, error = %e, "sync map not ready, write dropped");
                return;
            }
        }

        let mut result = self.write(key, &job).await;
        let replay = match (&result, &job) {
            (Err(SyncError::AlreadyExists(_)), Job::Create(value)) => Some(Job::Update(value.clone())),
            _ => None,
        };
        if let Some(update) = replay {
            tracing::debug!(call_id = %self.call_id, key = %key, "entity already in sync store, writing as update");
            result = self.write(key, &update).await;
        }

        match result {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(call_id = %self.call_id, key = %key, job = label, "replicated");
            }
            Err(SyncError::NotFound(_)) if matches!(job, Job::Remove) => {
                self.counters.swallowed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(call_id = %self.call_id, key = %key, "already removed from sync store");
            }
            Err(e @ (SyncError::NotFound(_) | SyncError::RateLimited(_))) => {
                self.counters.swallowed.fetch_add(1, Ordering::Relaxed);
                tracing::info!(call_id = %self.call_id, key = %key, job = label, error = %e, "replication write skipped");
            }
            Err(e @ SyncError::Timeout(_)) => {
                self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(call_id = %self.call_id, key = %key, job = label, error = %e, "replication write dropped");
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(call_id = %self.call_id, key = %key, job = label, error = %e, "replication queue error");
            }
        }
    }

    fn turn_value(turn: &crate::turns::Turn) -> Option<Value> {
        match serde_json::to_value(turn) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::error!(turn_id = %turn.id, error = %e, "turn not serializable");
                None
            }
        }
    }
}

impl SessionListener for Replicator {
    fn on_event(&self, event: &SessionEvent) {
        match event {
            SessionEvent::TurnAdded { turn } => {
                if let Some(value) = Self::turn_value(turn) {
                    self.enqueue(ReplicaKey::turn(&self.call_id, &turn.id), Job::Create(value));
                }
            }
            SessionEvent::TurnUpdated { turn } => {
                if let Some(value) = Self::turn_value(turn) {
                    self.debouncer
                        .call(ReplicaKey::turn(&self.call_id, &turn.id), value);
                }
            }
            SessionEvent::TurnDeleted { id } => {
                let key = ReplicaKey::turn(&self.call_id, id);
                self.deleted
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone());
                self.debouncer.cancel(&key);
                self.enqueue(key, Job::Remove);
            }
            SessionEvent::ContextUpdated { key, value, .. } => {
                let created = self
                    .known_context
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone());
                let job = if created {
                    Job::Create(value.clone())
                } else {
                    Job::Update(value.clone())
                };
                self.enqueue(ReplicaKey::context(&self.call_id, key), job);
            }
            SessionEvent::ContextRemoved { key, .. } => {
                self.known_context
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(key);
                self.enqueue(ReplicaKey::context(&self.call_id, key), Job::Remove);
            }
        }
    }
}

impl std::fmt::Debug for Replicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replicator")
            .field("call_id", &self.call_id)
            .field("pending_lanes", &self.pending_lanes())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{EventHub, SessionContext};
    use crate::sync::store::{InMemorySyncStore, SyncOpKind};
    use crate::turns::{BotTextParams, HumanParams, TurnStatus, TurnStore};
    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    /// 记录每一次远端写入（含建表）；预置的键 create 时返回 AlreadyExists
    #[derive(Default)]
    struct CountingStore {
        writes: Mutex<Vec<(Instant, ReplicaKind, &'static str)>>,
        existing: Mutex<HashSet<ReplicaKey>>,
    }

    impl CountingStore {
        fn record(&self, kind: ReplicaKind, what: &'static str) {
            self.writes.lock().unwrap().push((Instant::now(), kind, what));
        }
    }

    #[async_trait]
    impl SyncStore for CountingStore {
        async fn prepare_map(&self, _call_id: &str, kind: ReplicaKind) -> Result<(), SyncError> {
            self.record(kind, "map");
            Ok(())
        }

        async fn create(&self, key: &ReplicaKey, _value: &Value) -> Result<(), SyncError> {
            self.record(key.kind, "create");
            if !self.existing.lock().unwrap().insert(key.clone()) {
                return Err(SyncError::AlreadyExists(key.to_string()));
            }
            Ok(())
        }

        async fn update(&self, key: &ReplicaKey, _value: &Value) -> Result<(), SyncError> {
            self.record(key.kind, "update");
            Ok(())
        }

        async fn remove(&self, key: &ReplicaKey) -> Result<(), SyncError> {
            self.record(key.kind, "remove");
            Ok(())
        }
    }

    fn settings() -> ReplicatorSettings {
        ReplicatorSettings {
            burst_limit: 100,
            burst_window: Duration::from_secs(1),
            write_timeout: Duration::from_millis(500),
            debounce_min: Duration::from_millis(100),
            debounce_max_wait: Duration::from_millis(400),
            lane_capacity: 16,
        }
    }

    fn setup(
        settings: ReplicatorSettings,
    ) -> (Arc<InMemorySyncStore>, Arc<Replicator>, TurnStore, SessionContext) {
        let memory = Arc::new(InMemorySyncStore::new());
        let replicator = Replicator::new("CA1", memory.clone(), settings);
        let hub = EventHub::new();
        hub.subscribe(replicator.clone());
        (
            memory,
            replicator,
            TurnStore::new("CA1", hub.clone()),
            SessionContext::new(hub),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_streaming_turn_written_once_after_debounce() {
        let (memory, replicator, store, _) = setup(settings());
        let turn = store.add_bot_text(BotTextParams::new("Your"));
        for word in [" total", " is", " $42.50"] {
            turn.append_content(word).unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        turn.set_status(TurnStatus::Complete);
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let key = ReplicaKey::turn("CA1", turn.id());
        let kinds: Vec<_> = memory.ops_for(&key).iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![SyncOpKind::Create, SyncOpKind::Update]);
        let stored = memory.get(&key).unwrap();
        assert_eq!(stored["content"], "Your total is $42.50");
        assert_eq!(stored["status"], "complete");
        assert_eq!(replicator.pending_lanes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_updates_coalesce_to_latest() {
        let memory = Arc::new(InMemorySyncStore::with_latency(Duration::from_millis(50)));
        let replicator = Replicator::new("CA1", memory.clone(), settings());
        let key = ReplicaKey::turn("CA1", "turn_1");

        replicator.enqueue(key.clone(), Job::Create(json!({"v": 0})));
        replicator.enqueue(key.clone(), Job::Update(json!({"v": 1})));
        replicator.enqueue(key.clone(), Job::Update(json!({"v": 2})));
        replicator.enqueue(key.clone(), Job::Update(json!({"v": 3})));
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let ops = memory.ops_for(&key);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[1].kind, SyncOpKind::Update);
        assert_eq!(ops[1].value, Some(json!({"v": 3})));
        assert_eq!(replicator.stats().coalesced, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_limit_defers_but_delivers_all() {
        let (memory, replicator, _, context) = setup(ReplicatorSettings {
            burst_limit: 2,
            ..settings()
        });
        for i in 0..5 {
            context.set(&format!("k{i}"), json!(i));
        }
        assert!(replicator.flush(Duration::from_secs(10)).await);

        let ops = memory.ops();
        assert_eq!(ops.len(), 5);
        let start = ops[0].at;
        for window in 0..3u64 {
            let count = ops
                .iter()
                .filter(|op| op.at.duration_since(start).as_secs() == window)
                .count();
            assert!(count <= 2);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_pending_update_and_not_found_is_swallowed() {
        let (memory, replicator, store, _) = setup(settings());
        let turn = store.add_bot_text(BotTextParams::new("Sure"));
        turn.append_content(", one moment").unwrap();
        store.delete(turn.id());
        store.delete(turn.id());
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let key = ReplicaKey::turn("CA1", turn.id());
        let kinds: Vec<_> = memory.ops_for(&key).iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![SyncOpKind::Create, SyncOpKind::Remove]);
        assert!(memory.get(&key).is_none());

        replicator.enqueue(key.clone(), Job::Remove);
        assert!(replicator.flush(Duration::from_secs(5)).await);
        assert_eq!(replicator.stats().swallowed, 1);
        assert_eq!(replicator.stats().failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_fired_after_delete_does_not_resurrect_turn() {
        let (memory, replicator, store, _) = setup(settings());
        let turn = store.add_bot_text(BotTextParams::new("Sure"));
        turn.append_content(", one moment").unwrap();
        let late = serde_json::to_value(turn.snapshot().unwrap()).unwrap();
        store.delete(turn.id());

        // 防抖计时在 cancel 之后才交付，更新排在删除之后
        let key = ReplicaKey::turn("CA1", turn.id());
        replicator.enqueue(key.clone(), Job::Update(late));
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let kinds: Vec<_> = memory.ops_for(&key).iter().map(|op| op.kind).collect();
        assert_eq!(kinds, vec![SyncOpKind::Create, SyncOpKind::Remove]);
        assert!(memory.get(&key).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_remote_write_counts_against_burst_limit() {
        let counting = Arc::new(CountingStore::default());
        counting
            .existing
            .lock()
            .unwrap()
            .insert(ReplicaKey::context("CA1", "call"));
        let start = Instant::now();
        let replicator = Replicator::new(
            "CA1",
            counting.clone(),
            ReplicatorSettings {
                burst_limit: 2,
                ..settings()
            },
        );
        let hub = EventHub::new();
        hub.subscribe(replicator.clone());
        let store = TurnStore::new("CA1", hub.clone());
        let context = SessionContext::new(hub);

        for key in ["call", "user", "company"] {
            context.set(key, json!(key));
        }
        store.add_human_text(HumanParams::new("hello"));
        store.add_bot_text(BotTextParams::new("Hi there").with_status(TurnStatus::Complete));
        assert!(replicator.flush(Duration::from_secs(30)).await);

        let writes = counting.writes.lock().unwrap().clone();
        for kind in [ReplicaKind::Turn, ReplicaKind::Context] {
            let of_kind: Vec<_> = writes.iter().filter(|w| w.1 == kind).collect();
            assert_eq!(of_kind[0].2, "map");
            assert_eq!(of_kind.iter().filter(|w| w.2 == "map").count(), 1);
            let last = of_kind.last().unwrap().0.duration_since(start).as_secs();
            for window in 0..=last {
                let count = of_kind
                    .iter()
                    .filter(|w| w.0.duration_since(start).as_secs() == window)
                    .count();
                assert!(count <= 2, "{kind:?} window {window} had {count} writes");
            }
        }
        // 建表 + 三次创建 + 一次重放改写的更新
        let context_writes: Vec<_> = writes
            .iter()
            .filter(|w| w.1 == ReplicaKind::Context)
            .map(|w| w.2)
            .collect();
        assert_eq!(context_writes.len(), 5);
        assert_eq!(context_writes.iter().filter(|w| **w == "update").count(), 1);
        assert_eq!(writes.iter().filter(|w| w.1 == ReplicaKind::Turn).count(), 3);
        assert_eq!(replicator.stats().failed, 0);
        assert_eq!(replicator.stats().writes, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_non_fatal() {
        let (memory, replicator, _, context) = setup(settings());
        memory.fail_next(SyncError::RateLimited("slow down".into()));
        memory.fail_next(SyncError::Request("HTTP 500".into()));
        context.set("user", json!({"name": "Ada"}));
        context.set("call", json!({"sid": "CA1"}));
        context.set("company", json!("Owl Shoes"));
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let stats = replicator.stats();
        assert_eq!(stats.swallowed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(memory.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_write_times_out_and_is_dropped() {
        let memory = Arc::new(InMemorySyncStore::with_latency(Duration::from_secs(2)));
        let replicator = Replicator::new("CA1", memory.clone(), settings());
        replicator.enqueue(ReplicaKey::context("CA1", "user"), Job::Create(json!(1)));
        assert!(replicator.flush(Duration::from_secs(5)).await);
        assert_eq!(replicator.stats().timed_out, 1);
        assert!(memory.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_context_create_then_update_then_remove() {
        let (memory, replicator, _, context) = setup(settings());
        context.set("user", json!({"name": "Ada"}));
        assert!(replicator.flush(Duration::from_secs(5)).await);
        context.set("user", json!({"name": "Grace"}));
        assert!(replicator.flush(Duration::from_secs(5)).await);
        context.remove("user");
        assert!(replicator.flush(Duration::from_secs(5)).await);

        let key = ReplicaKey::context("CA1", "user");
        let kinds: Vec<_> = memory.ops_for(&key).iter().map(|op| op.kind).collect();
        assert_eq!(
            kinds,
            vec![SyncOpKind::Create, SyncOpKind::Update, SyncOpKind::Remove]
        );
    }
}
