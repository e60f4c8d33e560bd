//! Named single-consumer task queues.
//!
//! Every mutable resource in the core is owned by exactly one serializer.
//! Tasks submitted to a serializer run in submission order, one at a time,
//! so no additional locking is required for the owned state.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::{Error, Result};

type Task = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Tracks every serializer drain task so teardown can join them with a
/// bounded timeout.
#[derive(Clone)]
pub struct ShutdownGroup {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Default for ShutdownGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownGroup {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Spawn an auxiliary task tracked by this group.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Signal every member to stop and join them.
    ///
    /// Returns the number of tasks that were still running when `timeout`
    /// expired. A non-zero residue means some serializer is stuck on a task.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        self.token.cancel();
        self.tracker.close();

        if tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_err()
        {
            self.tracker.len()
        } else {
            0
        }
    }
}

/// Handle to a named serializer.
///
/// Cheap to clone; the queue lives until the last handle is dropped or the
/// owning [`ShutdownGroup`] is shut down.
#[derive(Clone)]
pub struct Serializer {
    name: Arc<str>,
    tx: mpsc::UnboundedSender<Task>,
    depth: Arc<AtomicUsize>,
}

impl std::fmt::Debug for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Serializer")
            .field("name", &self.name)
            .field("depth", &self.depth.load(Ordering::Relaxed))
            .finish()
    }
}

impl Serializer {
    /// Create the serializer and spawn its drain task into `group`.
    pub fn spawn(name: impl Into<String>, group: &ShutdownGroup) -> Self {
        let name: Arc<str> = name.into().into();
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        group.tracker.spawn(drain(
            name.clone(),
            rx,
            depth.clone(),
            group.token.clone(),
        ));

        Self { name, tx, depth }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of tasks waiting in (or running on) this serializer.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Queue a task. Tasks run in submission order.
    pub fn submit<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(Box::pin(future)).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            Error::SerializerClosed(self.name.to_string())
        })
    }

    /// Queue a task and wait for its result.
    ///
    /// This is the synchronous cross-serializer wait of the concurrency
    /// model; only the `management` serializer may use it for structural
    /// changes, anything else risks deadlock by cyclic waiting.
    pub async fn send_wait<T, F>(&self, future: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();

        self.submit(async move {
            let _ = tx.send(future.await);
        })?;

        rx.await
            .map_err(|_| Error::SerializerClosed(self.name.to_string()))
    }
}

async fn drain(
    name: Arc<str>,
    mut rx: mpsc::UnboundedReceiver<Task>,
    depth: Arc<AtomicUsize>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                // Refuse new work but finish what is already queued
                rx.close();

                while let Some(task) = rx.recv().await {
                    task.await;
                    depth.fetch_sub(1, Ordering::Relaxed);
                }

                break;
            }
            task = rx.recv() => match task {
                Some(task) => {
                    task.await;
                    depth.fetch_sub(1, Ordering::Relaxed);
                }
                None => break,
            },
        }
    }

    log::debug!("serializer {name} drained");
}

/// Registry of serializers addressed by name, e.g. `pjsip/options/<aor>`.
#[derive(Default)]
pub struct SerializerRegistry {
    map: Mutex<HashMap<String, Serializer>>,
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Serializer> {
        self.map.lock().get(name).cloned()
    }

    pub fn get_or_create(&self, name: &str, group: &ShutdownGroup) -> Serializer {
        self.map
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Serializer::spawn(name, group))
            .clone()
    }

    /// Drop the registry's handle. The drain task exits once every other
    /// handle is gone and the queue is empty.
    pub fn remove(&self, name: &str) -> Option<Serializer> {
        self.map.lock().remove(name)
    }
}

/// A fixed partition of serializers used for messages that have no dialog
/// (and therefore no home serializer) yet.
pub struct SerializerPool {
    members: Vec<Serializer>,
    next: AtomicUsize,
    high_water: usize,
}

impl SerializerPool {
    /// `high_water` is the per-pool queue length past which the distributor
    /// starts shedding load (see the request distributor).
    pub fn spawn(prefix: &str, size: usize, high_water: usize, group: &ShutdownGroup) -> Self {
        let members = (0..size)
            .map(|i| Serializer::spawn(format!("{prefix}/{i}"), group))
            .collect();

        Self {
            members,
            next: AtomicUsize::new(0),
            high_water,
        }
    }

    /// Pick the next serializer round-robin.
    pub fn pick(&self) -> Serializer {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.members.len();
        self.members[i].clone()
    }

    /// Sum of the queue depths of all members.
    pub fn queued(&self) -> usize {
        self.members.iter().map(Serializer::depth).sum()
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }

    /// True once the aggregate queue exceeds three times the high-water
    /// mark; new requests should be answered 503 instead of enqueued.
    pub fn overloaded(&self) -> bool {
        self.queued() > 3 * self.high_water
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let group = ShutdownGroup::new();
        let serializer = Serializer::spawn("test/order", &group);

        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100u32 {
            let seen = seen.clone();
            serializer
                .submit(async move {
                    seen.lock().push(i);
                })
                .unwrap();
        }

        // Synchronize on the queue end
        serializer.send_wait(async {}).await.unwrap();

        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn send_wait_returns_task_output() {
        let group = ShutdownGroup::new();
        let serializer = Serializer::spawn("test/wait", &group);

        let out = serializer.send_wait(async { 7u32 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_tasks() {
        let group = ShutdownGroup::new();
        let serializer = Serializer::spawn("test/shutdown", &group);

        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..10 {
            let counter = counter.clone();
            serializer
                .submit(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }

        let residue = group.shutdown(Duration::from_secs(5)).await;
        assert_eq!(residue, 0);
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        assert!(serializer.submit(async {}).is_err());
    }

    #[tokio::test]
    async fn pool_reports_overload() {
        let group = ShutdownGroup::new();
        let pool = SerializerPool::spawn("test/pool", 2, 1, &group);

        assert!(!pool.overloaded());

        // Block both members so submitted work piles up
        for _ in 0..2 {
            pool.pick()
                .submit(async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                })
                .unwrap();
        }

        for _ in 0..8 {
            pool.pick().submit(async {}).unwrap();
        }

        assert!(pool.overloaded());
    }
}
