//! 突发写入限流：固定窗口内最多 N 次写入
//!
//! 超额的写入不会被丢弃，而是排队到后续窗口；排队分两档优先级，新建实体优先于更新。
//! 窗口到期时由一个计时任务按优先级放行排队者，放行数不超过窗口额度。

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

/// 写入优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePriority {
    /// 新建实体
    High,
    /// 已存在实体的更新 / 删除
    Low,
}

#[derive(Debug)]
struct WindowState {
    started: Instant,
    used: usize,
    high: VecDeque<oneshot::Sender<()>>,
    low: VecDeque<oneshot::Sender<()>>,
    timer_armed: bool,
}

impl WindowState {
    fn roll(&mut self, now: Instant, window: Duration) {
        if now.duration_since(self.started) >= window {
            self.started = now;
            self.used = 0;
        }
    }

    fn has_waiters(&self) -> bool {
        !self.high.is_empty() || !self.low.is_empty()
    }

    fn waiting(&self) -> usize {
        self.high.len() + self.low.len()
    }
}

#[derive(Debug)]
struct LimiterInner {
    name: &'static str,
    limit: usize,
    window: Duration,
    state: Mutex<WindowState>,
}

/// 固定窗口限流器；Clone 共享同一个窗口
#[derive(Debug, Clone)]
pub struct BurstLimiter {
    inner: Arc<LimiterInner>,
}

impl BurstLimiter {
    pub fn new(name: &'static str, limit: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(LimiterInner {
                name,
                limit: limit.max(1),
                window,
                state: Mutex::new(WindowState {
                    started: Instant::now(),
                    used: 0,
                    high: VecDeque::new(),
                    low: VecDeque::new(),
                    timer_armed: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 当前排队中的写入数
    pub fn waiting(&self) -> usize {
        self.lock().waiting()
    }

    /// 获取一次写入额度；窗口已满时排队等待后续窗口
    pub async fn acquire(&self, priority: WritePriority) {
        let rx = {
            let mut state = self.lock();
            state.roll(Instant::now(), self.inner.window);
            if !state.has_waiters() && state.used < self.inner.limit {
                state.used += 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            match priority {
                WritePriority::High => state.high.push_back(tx),
                WritePriority::Low => state.low.push_back(tx),
            }
            tracing::debug!(
                limiter = self.inner.name,
                waiting = state.waiting(),
                "write deferred to next burst window"
            );
            self.arm(&mut state);
            rx
        };
        // 发送端只会在放行时使用；计时任务存活期间不会被丢弃
        let _ = rx.await;
    }

    fn arm(&self, state: &mut WindowState) {
        if state.timer_armed {
            return;
        }
        state.timer_armed = true;
        let at = state.started + self.inner.window;
        let limiter = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(at).await;
            limiter.dispatch();
        });
    }

    /// 新窗口开始：按优先级放行排队者
    fn dispatch(&self) {
        let mut state = self.lock();
        state.timer_armed = false;
        state.roll(Instant::now(), self.inner.window);
        while state.used < self.inner.limit {
            let next = match state.high.pop_front() {
                Some(tx) => tx,
                None => match state.low.pop_front() {
                    Some(tx) => tx,
                    None => break,
                },
            };
            // 等待方已放弃（任务被取消）时不占用额度
            if next.send(()).is_ok() {
                state.used += 1;
            }
        }
        if state.has_waiters() {
            self.arm(&mut state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn test_excess_writes_deferred_not_dropped() {
        let limiter = BurstLimiter::new("turns", 3, Duration::from_secs(1));
        let start = Instant::now();
        let grants = Arc::new(StdMutex::new(Vec::new()));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let limiter = limiter.clone();
            let grants = grants.clone();
            tasks.push(tokio::spawn(async move {
                limiter.acquire(WritePriority::Low).await;
                grants.lock().unwrap().push((i, start.elapsed()));
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let grants = grants.lock().unwrap();
        assert_eq!(grants.len(), 8);
        for window in 0..3u64 {
            let in_window = grants
                .iter()
                .filter(|(_, at)| at.as_secs() == window)
                .count();
            assert!(in_window <= 3, "window {window} had {in_window} writes");
        }
        assert_eq!(grants.iter().filter(|(_, at)| at.as_secs() == 0).count(), 3);
        assert_eq!(limiter.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_entities_released_before_updates() {
        let limiter = BurstLimiter::new("turns", 1, Duration::from_secs(1));
        limiter.acquire(WritePriority::Low).await;

        let order = Arc::new(StdMutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (name, priority) in [
            ("update-a", WritePriority::Low),
            ("update-b", WritePriority::Low),
            ("create", WritePriority::High),
        ] {
            let limiter = limiter.clone();
            let order = order.clone();
            tasks.push(tokio::spawn(async move {
                limiter.acquire(priority).await;
                order.lock().unwrap().push(name);
            }));
            tokio::task::yield_now().await;
        }
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["create", "update-a", "update-b"]);
    }
}
