//! 按键防抖：尾沿最小延迟 + 最长等待上限
//!
//! 每次调用刷新尾沿计时并记下最新值；尾沿到期或自首次调用起超过 max_wait 时触发一次，
//! 只交付最新值。每个待触发的键有一个计时任务。

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

type Sink<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Slot<V> {
    value: V,
    /// 尾沿到期时间
    trailing: Instant,
    /// 最长等待到期时间
    deadline: Instant,
    generation: u64,
}

impl<V> Slot<V> {
    fn due(&self) -> Instant {
        self.trailing.min(self.deadline)
    }
}

struct DebounceInner<K, V> {
    min_delay: Duration,
    max_wait: Duration,
    slots: Mutex<HashMap<K, Slot<V>>>,
    next_generation: Mutex<u64>,
    sink: Sink<K, V>,
}

pub struct Debouncer<K, V> {
    inner: Arc<DebounceInner<K, V>>,
}

impl<K, V> Clone for Debouncer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Debouncer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + 'static,
{
    pub fn new(
        min_delay: Duration,
        max_wait: Duration,
        sink: impl Fn(K, V) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(DebounceInner {
                min_delay,
                max_wait: max_wait.max(min_delay),
                slots: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                sink: Arc::new(sink),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.inner.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_generation(&self) -> u64 {
        let mut g = self
            .inner
            .next_generation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *g += 1;
        *g
    }

    /// 记下最新值并刷新尾沿计时
    pub fn call(&self, key: K, value: V) {
        let now = Instant::now();
        let mut slots = self.slots();
        if let Some(slot) = slots.get_mut(&key) {
            slot.value = value;
            slot.trailing = now + self.inner.min_delay;
            return;
        }
        let generation = self.next_generation();
        slots.insert(
            key.clone(),
            Slot {
                value,
                trailing: now + self.inner.min_delay,
                deadline: now + self.inner.max_wait,
                generation,
            },
        );
        drop(slots);

        let debouncer = self.clone();
        tokio::spawn(async move { debouncer.wait_and_fire(key, generation).await });
    }

    async fn wait_and_fire(self, key: K, generation: u64) {
        loop {
            let due = match self.slots().get(&key) {
                Some(slot) if slot.generation == generation => slot.due(),
                _ => return,
            };
            tokio::time::sleep_until(due).await;

            let fired = {
                let mut slots = self.slots();
                match slots.get(&key) {
                    Some(slot) if slot.generation == generation => {
                        if Instant::now() >= slot.due() {
                            slots.remove(&key).map(|s| s.value)
                        } else {
                            None
                        }
                    }
                    _ => return,
                }
            };
            if let Some(value) = fired {
                (self.inner.sink)(key, value);
                return;
            }
        }
    }

    /// 丢弃某个键尚未触发的值
    pub fn cancel(&self, key: &K) -> bool {
        self.slots().remove(key).is_some()
    }

    /// 立即触发全部待触发的值
    pub fn flush(&self) -> usize {
        let drained: Vec<(K, V)> = self
            .slots()
            .drain()
            .map(|(k, slot)| (k, slot.value))
            .collect();
        let count = drained.len();
        for (key, value) in drained {
            (self.inner.sink)(key, value);
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.slots().len()
    }
}
