//! Per-category admission control with a priority-ordered wait queue.
//!
//! Each [`TaskCategory`] has its own ceiling on simultaneously running
//! requests. Requests over the ceiling wait in a single queue ordered by
//! descending priority, ties kept in arrival order. Whenever a running request
//! finishes (or a limit is raised) the queue is rescanned front to back and
//! every request whose category has room is admitted.
//!
//! Running requests are never preempted and cannot be cancelled here.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use relay_core::{Priority, TaskCategory};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, info};

use crate::config::ConcurrencyConfig;
use crate::error::{ExecutionError, Result};

/// Snapshot of one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryStats {
    /// Category
    pub category: TaskCategory,
    /// Configured ceiling
    pub limit: usize,
    /// Requests currently running
    pub running: usize,
    /// Requests waiting for admission
    pub queued: usize,
}

struct Running {
    id: String,
    category: TaskCategory,
}

struct Waiting {
    ticket: u64,
    id: String,
    category: TaskCategory,
    priority: Priority,
    enqueued_at: Instant,
    admit: oneshot::Sender<()>,
}

struct State {
    config: ConcurrencyConfig,
    next_ticket: u64,
    running: HashMap<u64, Running>,
    queue: Vec<Waiting>,
}

impl State {
    fn running_in(&self, category: TaskCategory) -> usize {
        self.running.values().filter(|r| r.category == category).count()
    }

    fn has_capacity(&self, category: TaskCategory) -> bool {
        self.running_in(category) < self.config.limit_for(category)
    }

    fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    /// Insert before the first entry with strictly lower priority.
    fn enqueue(&mut self, waiting: Waiting) {
        let pos = self
            .queue
            .iter()
            .position(|w| w.priority < waiting.priority)
            .unwrap_or(self.queue.len());
        self.queue.insert(pos, waiting);
    }

    /// Admit every queued request whose category has room, in queue order.
    fn drain(&mut self) {
        let mut i = 0;
        while i < self.queue.len() {
            if !self.has_capacity(self.queue[i].category) {
                i += 1;
                continue;
            }

            let waiting = self.queue.remove(i);
            self.running.insert(
                waiting.ticket,
                Running {
                    id: waiting.id.clone(),
                    category: waiting.category,
                },
            );

            if waiting.admit.send(()).is_err() {
                // Caller went away while queued.
                self.running.remove(&waiting.ticket);
                debug!("Dropped abandoned request {}", waiting.id);
                continue;
            }

            info!(
                "Admitted {} ({}, {:?}) after {:?} in queue",
                waiting.id,
                waiting.category,
                waiting.priority,
                waiting.enqueued_at.elapsed()
            );
        }
    }
}

/// Bounds how many requests of each category run at once.
pub struct ConcurrencyManager {
    state: Mutex<State>,
    idle: Notify,
}

/// Releases a request's slot (queued or running) when its future completes or is dropped.
struct TicketGuard<'a> {
    manager: &'a ConcurrencyManager,
    ticket: u64,
}

impl Drop for TicketGuard<'_> {
    fn drop(&mut self) {
        self.manager.release(self.ticket);
    }
}

impl ConcurrencyManager {
    /// Create a manager with the given limits.
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                next_ticket: 0,
                running: HashMap::new(),
                queue: Vec::new(),
            }),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, ticket: u64) {
        let mut state = self.lock();
        state.queue.retain(|w| w.ticket != ticket);
        if let Some(running) = state.running.remove(&ticket) {
            debug!("Released {} ({})", running.id, running.category);
            state.drain();
        }
        if state.is_idle() {
            self.idle.notify_waiters();
        }
    }

    /// Run `handler` once `category` has capacity.
    ///
    /// Runs immediately when the category is below its limit, otherwise waits
    /// in the queue. Returns [`ExecutionError::Cancelled`] if the request is
    /// removed with [`cancel`](Self::cancel) before it is admitted.
    pub async fn execute<F, Fut, T>(
        &self,
        id: impl Into<String>,
        category: TaskCategory,
        priority: Priority,
        handler: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let id = id.into();

        let (ticket, admission) = {
            let mut state = self.lock();
            let ticket = state.next_ticket;
            state.next_ticket += 1;

            if state.has_capacity(category) {
                state.running.insert(ticket, Running { id: id.clone(), category });
                debug!("Running {} ({}) immediately", id, category);
                (ticket, None)
            } else {
                let (tx, rx) = oneshot::channel();
                state.enqueue(Waiting {
                    ticket,
                    id: id.clone(),
                    category,
                    priority,
                    enqueued_at: Instant::now(),
                    admit: tx,
                });
                info!(
                    "Queued {} ({}, {:?}): {} running, {} waiting",
                    id,
                    category,
                    priority,
                    state.running_in(category),
                    state.queue.len()
                );
                (ticket, Some(rx))
            }
        };

        let _guard = TicketGuard { manager: self, ticket };

        if let Some(rx) = admission {
            if rx.await.is_err() {
                return Err(ExecutionError::Cancelled(id));
            }
        }

        Ok(handler().await)
    }

    /// Remove a queued request. Returns false if it is running or unknown.
    pub fn cancel(&self, id: &str) -> bool {
        let mut state = self.lock();
        let Some(pos) = state.queue.iter().position(|w| w.id == id) else {
            if state.running.values().any(|r| r.id == id) {
                debug!("Not cancelling {}: already running", id);
            }
            return false;
        };

        // Dropping the sender rejects the waiting caller.
        let waiting = state.queue.remove(pos);
        info!("Cancelled queued request {} ({})", waiting.id, waiting.category);
        if state.is_idle() {
            self.idle.notify_waiters();
        }
        true
    }

    /// Change a category's ceiling and admit whatever now fits.
    pub fn update_concurrency_limit(&self, category: TaskCategory, limit: usize) {
        let mut state = self.lock();
        state.config.limits.insert(category, limit);
        info!("Concurrency limit for {} set to {}", category, limit);
        state.drain();
    }

    /// Change the limit used by categories without an explicit entry.
    pub fn set_default_limit(&self, limit: usize) {
        let mut state = self.lock();
        state.config.default_limit = limit;
        info!("Default concurrency limit set to {}", limit);
        state.drain();
    }

    /// Effective limit for `category`.
    pub fn limit(&self, category: TaskCategory) -> usize {
        self.lock().config.limit_for(category)
    }

    /// Per-category snapshot.
    pub fn stats(&self) -> Vec<CategoryStats> {
        let state = self.lock();
        TaskCategory::ALL
            .into_iter()
            .map(|category| CategoryStats {
                category,
                limit: state.config.limit_for(category),
                running: state.running_in(category),
                queued: state.queue.iter().filter(|w| w.category == category).count(),
            })
            .collect()
    }

    /// Snapshot for one category.
    pub fn category_stats(&self, category: TaskCategory) -> CategoryStats {
        let state = self.lock();
        CategoryStats {
            category,
            limit: state.config.limit_for(category),
            running: state.running_in(category),
            queued: state.queue.iter().filter(|w| w.category == category).count(),
        }
    }

    /// Whether nothing is running or queued.
    pub fn is_idle(&self) -> bool {
        self.lock().is_idle()
    }

    /// Wait until nothing is running or queued.
    pub async fn wait_for_all(&self, timeout: Option<Duration>) -> Result<()> {
        let wait = async {
            loop {
                let notified = self.idle.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.is_idle() {
                    return;
                }
                notified.await;
            }
        };

        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait)
                .await
                .map_err(|_| ExecutionError::Timeout(limit)),
            None => {
                wait.await;
                Ok(())
            }
        }
    }
}

impl Default for ConcurrencyManager {
    fn default() -> Self {
        Self::new(ConcurrencyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn wait_until_queued(manager: &ConcurrencyManager, category: TaskCategory, n: usize) {
        for _ in 0..200 {
            if manager.category_stats(category).queued >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} queued requests", n);
    }

    #[tokio::test]
    async fn test_runs_immediately_under_limit() {
        let manager = ConcurrencyManager::new(ConcurrencyConfig::uniform(2));
        let value = manager
            .execute("a", TaskCategory::Api, Priority::Normal, || async { 42 })
            .await
            .unwrap();
        assert_eq!(value, 42);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_peak_never_exceeds_limit() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(3)));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..20 {
            let manager = manager.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .execute(format!("req-{}", i), TaskCategory::Api, Priority::Normal, || async {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let manager = Arc::new(ConcurrencyManager::new(
            ConcurrencyConfig::uniform(1).with_limit(TaskCategory::Api, 1),
        ));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("api-1", TaskCategory::Api, Priority::Normal, || async {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The api slot is taken but workflow has its own.
        let value = manager
            .execute("wf-1", TaskCategory::Workflow, Priority::Normal, || async { "ok" })
            .await
            .unwrap();
        assert_eq!(value, "ok");

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_priority_order_with_fifo_ties() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(1)));
        let order = Arc::new(Mutex::new(Vec::new()));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("blocker", TaskCategory::Custom, Priority::Normal, || async {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut handles = Vec::new();
        let submissions = [
            ("low", Priority::Low),
            ("normal", Priority::Normal),
            ("high-1", Priority::High),
            ("high-2", Priority::High),
            ("critical", Priority::Critical),
        ];
        for (n, (name, priority)) in submissions.into_iter().enumerate() {
            let manager_ref = manager.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                manager_ref
                    .execute(name, TaskCategory::Custom, priority, || async move {
                        order.lock().unwrap().push(name);
                    })
                    .await
            }));
            wait_until_queued(&manager, TaskCategory::Custom, n + 1).await;
        }

        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let order = order.lock().unwrap().clone();
        assert_eq!(order, vec!["critical", "high-1", "high-2", "normal", "low"]);
    }

    #[tokio::test]
    async fn test_cancel_queued_rejects_caller() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(1)));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let ran = Arc::new(AtomicUsize::new(0));

        let running = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("running", TaskCategory::Plugin, Priority::Normal, || async {
                        let _ = release_rx.await;
                        "finished"
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = {
            let manager = manager.clone();
            let ran = ran.clone();
            tokio::spawn(async move {
                manager
                    .execute("queued", TaskCategory::Plugin, Priority::High, || async move {
                        ran.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            })
        };
        wait_until_queued(&manager, TaskCategory::Plugin, 1).await;

        assert!(manager.cancel("queued"));
        assert!(matches!(queued.await.unwrap(), Err(ExecutionError::Cancelled(id)) if id == "queued"));

        // Running work cannot be cancelled and still completes.
        assert!(!manager.cancel("running"));
        release_tx.send(()).unwrap();
        assert_eq!(running.await.unwrap().unwrap(), "finished");
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!manager.cancel("unknown"));
    }

    #[tokio::test]
    async fn test_raising_limit_drains_queue() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(0)));

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("paused", TaskCategory::Api, Priority::Normal, || async { 7 })
                    .await
            })
        };
        wait_until_queued(&manager, TaskCategory::Api, 1).await;

        manager.update_concurrency_limit(TaskCategory::Api, 1);
        assert_eq!(pending.await.unwrap().unwrap(), 7);
        assert_eq!(manager.limit(TaskCategory::Api), 1);
    }

    #[tokio::test]
    async fn test_wait_for_all() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(1)));
        for i in 0..3 {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute(format!("job-{}", i), TaskCategory::Custom, Priority::Normal, || async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    })
                    .await
            });
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        manager.wait_for_all(Some(Duration::from_secs(2))).await.unwrap();
        assert!(manager.is_idle());
    }

    #[tokio::test]
    async fn test_wait_for_all_times_out() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(1)));
        let (_hold_tx, hold_rx) = oneshot::channel::<()>();
        {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("stuck", TaskCategory::Custom, Priority::Normal, || async {
                        let _ = hold_rx.await;
                    })
                    .await
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = manager.wait_for_all(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(ExecutionError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_dropped_caller_frees_queue_slot() {
        let manager = Arc::new(ConcurrencyManager::new(ConcurrencyConfig::uniform(1)));
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let blocker = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("blocker", TaskCategory::Api, Priority::Normal, || async {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let abandoned = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .execute("abandoned", TaskCategory::Api, Priority::Normal, || async {})
                    .await
            })
        };
        wait_until_queued(&manager, TaskCategory::Api, 1).await;
        abandoned.abort();
        let _ = abandoned.await;

        assert_eq!(manager.category_stats(TaskCategory::Api).queued, 0);
        release_tx.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        assert!(manager.is_idle());
    }
}
