//! Session Manager
//!
//! Tracks every outstanding request, download and upload of one provider
//! instance so `cancel_all` can reach them. Each task gets a child of the
//! session's cancellation token; `cancel_all` cancels and forgets all of them
//! before returning, and completion callbacks of forgotten tasks are dropped.
//!
//! Uploads and downloads open a `TransferLease`, an ephemeral registration with
//! the long transfer timeout that deregisters itself on drop.

use std::cell::Cell;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::ProviderError;

thread_local! {
    /// Session whose completion callback this thread is running, 0 if none
    static DELIVERING: Cell<usize> = const { Cell::new(0) };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Request,
    Download,
    Upload,
}

struct TaskEntry {
    kind: TaskKind,
    token: CancellationToken,
}

struct SessionInner {
    label: String,
    tasks: Mutex<HashMap<u64, TaskEntry>>,
    /// Readers deliver completions, `cancel_all` takes it exclusively
    delivery_gate: RwLock<()>,
    next_id: AtomicU64,
    transfer_timeout: Duration,
}

impl SessionInner {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }

    fn deregister(&self, id: u64) -> bool {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.remove(&id).is_some()
    }
}

/// Set of in-flight operations of one provider instance
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(label: &str, transfer_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                label: label.to_string(),
                tasks: Mutex::new(HashMap::new()),
                delivery_gate: RwLock::new(()),
                next_id: AtomicU64::new(1),
                transfer_timeout,
            }),
        }
    }

    /// Fresh, empty session with the same settings
    pub fn fork(&self) -> Self {
        Self::new(&self.inner.label, self.inner.transfer_timeout)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn in_flight_of(&self, kind: TaskKind) -> usize {
        let tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.values().filter(|t| t.kind == kind).count()
    }

    /// Register a task and get the guard that deregisters it
    pub fn begin(&self, kind: TaskKind) -> TaskGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.insert(id, TaskEntry { kind, token: token.clone() });
        TaskGuard {
            id,
            token,
            inner: self.inner.clone(),
        }
    }

    /// Ephemeral registration for one upload or download
    pub fn open_transfer(&self, kind: TaskKind) -> TransferLease {
        debug!("[{}] opening {:?} session", self.inner.label, kind);
        TransferLease {
            guard: self.begin(kind),
            timeout: self.inner.transfer_timeout,
        }
    }

    /// Run `fut` as a tracked task; resolves to `Cancelled` if `cancel_all` runs first
    pub async fn run<F, T>(&self, kind: TaskKind, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let guard = self.begin(kind);
        guard.run(fut).await
    }

    /// Spawn `fut` and hand its result to `on_complete`, unless `cancel_all` ran first
    pub fn spawn_with<F, T, C>(&self, kind: TaskKind, fut: F, on_complete: C) -> JoinHandle<()>
    where
        F: Future<Output = Result<T, ProviderError>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(Result<T, ProviderError>) + Send + 'static,
    {
        let guard = self.begin(kind);
        tokio::spawn(async move {
            let result = guard.run(fut).await;
            guard.deliver(move || on_complete(result));
        })
    }

    /// Cancel every registered task.
    ///
    /// When this returns the in-flight count is zero and no callback of a
    /// cancelled task will run. Returns how many tasks were cancelled.
    pub fn cancel_all(&self) -> usize {
        // A callback cancelling its own session already holds the gate for reading
        let _gate = if DELIVERING.with(Cell::get) == self.inner.key() {
            None
        } else {
            Some(self.inner.delivery_gate.write().unwrap_or_else(|e| e.into_inner()))
        };
        let drained: Vec<TaskEntry> = {
            let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.token.cancel();
        }
        if !drained.is_empty() {
            info!("[{}] cancelled {} in-flight task(s)", self.inner.label, drained.len());
        }
        drained.len()
    }
}

/// Registration of one in-flight task
pub struct TaskGuard {
    id: u64,
    token: CancellationToken,
    inner: Arc<SessionInner>,
}

impl TaskGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn run<F, T>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(ProviderError::Cancelled),
            result = fut => result,
        };
        // Under the gate: either cancel_all has not started, or its cancel is visible
        let _gate = self.inner.delivery_gate.read().unwrap_or_else(|e| e.into_inner());
        if self.token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        result
    }

    /// Run `callback` only if this task is still registered, then deregister it
    fn deliver(self, callback: impl FnOnce()) {
        let _gate = self.inner.delivery_gate.read().unwrap_or_else(|e| e.into_inner());
        if !self.inner.deregister(self.id) {
            debug!("[{}] dropping completion of cancelled task {}", self.inner.label, self.id);
            return;
        }
        let outer = DELIVERING.with(|d| d.replace(self.inner.key()));
        callback();
        DELIVERING.with(|d| d.set(outer));
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.inner.deregister(self.id);
    }
}

/// Ephemeral session for one long-running transfer
pub struct TransferLease {
    guard: TaskGuard,
    timeout: Duration,
}

impl TransferLease {
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn token(&self) -> &CancellationToken {
        self.guard.token()
    }

    pub async fn run<F, T>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        self.guard.run(fut).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn session() -> SessionManager {
        SessionManager::new("test", Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_guard_deregisters_on_drop() {
        let session = session();
        let guard = session.begin(TaskKind::Request);
        assert_eq!(session.in_flight(), 1);
        drop(guard);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_completes_normally() {
        let session = session();
        let value = session.run(TaskKind::Request, async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_all_drops_count_to_zero_and_discards_callbacks() {
        let session = session();
        let delivered = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..5 {
            let delivered = delivered.clone();
            handles.push(session.spawn_with(
                TaskKind::Request,
                async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                },
                move |_| {
                    delivered.fetch_add(1, Ordering::SeqCst);
                },
            ));
        }
        assert_eq!(session.in_flight(), 5);

        assert_eq!(session.cancel_all(), 5);
        assert_eq!(session.in_flight(), 0);

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_completed_tasks_deliver_once() {
        let session = session();
        let (tx, rx) = tokio::sync::oneshot::channel();
        session
            .spawn_with(TaskKind::Request, async { Ok("done") }, move |result| {
                let _ = tx.send(result);
            })
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap(), Ok("done"));
        assert_eq!(session.in_flight(), 0);
        assert_eq!(session.cancel_all(), 0);
    }

    #[tokio::test]
    async fn test_run_resolves_cancelled() {
        let session = Arc::new(session());
        let runner = session.clone();
        let task = tokio::spawn(async move {
            runner
                .run(TaskKind::Request, async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                })
                .await
        });
        while session.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        session.cancel_all();
        assert_eq!(task.await.unwrap(), Err(ProviderError::Cancelled));
    }

    #[tokio::test]
    async fn test_transfer_lease_registers_until_dropped() {
        let session = session();
        let lease = session.open_transfer(TaskKind::Upload);
        assert_eq!(session.in_flight_of(TaskKind::Upload), 1);
        assert_eq!(lease.timeout(), Duration::from_secs(3600));
        session.cancel_all();
        assert!(lease.token().is_cancelled());
        assert_eq!(lease.run(async { Ok(()) }).await, Err(ProviderError::Cancelled));
        drop(lease);
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_from_callback_does_not_deadlock() {
        let session = Arc::new(session());
        let inner = session.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        session.spawn_with(TaskKind::Request, async { Ok(()) }, move |_| {
            let _ = tx.send(inner.cancel_all());
        });
        assert_eq!(rx.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_result_racing_cancel_all_is_discarded() {
        let session = session();
        // The task finishes in the same poll that cancels the session
        let result = session
            .run(TaskKind::Request, async {
                session.cancel_all();
                Ok(1)
            })
            .await;
        assert_eq!(result, Err(ProviderError::Cancelled));
        assert_eq!(session.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_from_other_sessions_callback_waits_for_delivery() {
        let first = session();
        let second = Arc::new(session());
        let started = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));

        let (on_start, on_finish) = (started.clone(), finished.clone());
        let slow = second.spawn_with(TaskKind::Request, async { Ok(()) }, move |_| {
            on_start.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(100));
            on_finish.store(true, Ordering::SeqCst);
        });

        let (tx, rx) = tokio::sync::oneshot::channel();
        let (target, wait_for) = (second.clone(), started.clone());
        let finished_seen = finished.clone();
        first.spawn_with(
            TaskKind::Request,
            async move {
                while !wait_for.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                Ok(())
            },
            move |_| {
                target.cancel_all();
                // The other session's callback is over by the time cancel_all returns
                let _ = tx.send(finished_seen.load(Ordering::SeqCst));
            },
        );

        assert!(rx.await.unwrap());
        slow.await.unwrap();
    }

    #[tokio::test]
    async fn test_forked_session_is_isolated() {
        let session = session();
        let fork = session.fork();
        let _guard = fork.begin(TaskKind::Download);
        assert_eq!(session.cancel_all(), 0);
        assert_eq!(fork.in_flight(), 1);
    }
}
