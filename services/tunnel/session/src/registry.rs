//! Registry of background tasks.
//!
//! Every long-running task (session drivers, accept loops, heartbeats) is
//! spawned through a [`TaskRegistry`]. A task receives a [`ShutdownSignal`],
//! is listed while it runs and removes itself when it returns. `shutdown`
//! signals every task and joins them.

use futures::future::join_all;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use tunnel_connector::lock;

/// Cooperative stop request for a registered task
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request the task to stop
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// True once a stop was requested
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once a stop was requested
    pub async fn triggered(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|stop| *stop).await;
    }
}

struct RegisteredTask {
    name: String,
    signal: ShutdownSignal,
    join: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct RegistryInner {
    tasks: Mutex<HashMap<u64, RegisteredTask>>,
    next_id: AtomicU64,
}

impl RegistryInner {
    fn deregister(&self, id: u64) {
        if let Some(task) = lock(&self.tasks).remove(&id) {
            debug!("task {} ({}) deregistered", id, task.name);
        }
    }
}

/// Deregisters a task and marks it done when its future ends or unwinds
struct Completion {
    id: u64,
    registry: Weak<RegistryInner>,
    done: watch::Sender<bool>,
}

impl Drop for Completion {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
        self.done.send_replace(true);
    }
}

/// Process-wide list of running background tasks, passed explicitly
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and register it until it returns
    pub fn spawn<F, Fut>(&self, name: &str, task: F) -> TaskHandle
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let signal = ShutdownSignal::new();

        lock(&self.inner.tasks).insert(
            id,
            RegisteredTask {
                name: name.to_string(),
                signal: signal.clone(),
                join: None,
            },
        );

        let (done_tx, done) = watch::channel(false);
        let completion = Completion {
            id,
            registry: Arc::downgrade(&self.inner),
            done: done_tx,
        };
        let future = task(signal.clone());
        let join = tokio::spawn(async move {
            let _completion = completion;
            future.await;
        });

        // The task may already have finished and removed itself
        if let Some(entry) = lock(&self.inner.tasks).get_mut(&id) {
            entry.join = Some(join);
        }
        debug!("task {} ({}) registered", id, name);

        TaskHandle { id, signal, done }
    }

    /// Number of running tasks
    pub fn active(&self) -> usize {
        lock(&self.inner.tasks).len()
    }

    /// Names of running tasks, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.inner.tasks)
            .values()
            .map(|task| task.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Signal every task and wait for all of them
    pub async fn shutdown(&self) {
        let tasks: Vec<RegisteredTask> = lock(&self.inner.tasks).drain().map(|(_, task)| task).collect();
        if tasks.is_empty() {
            return;
        }
        debug!("shutting down {} tasks", tasks.len());

        for task in &tasks {
            task.signal.trigger();
        }
        let joins = tasks.into_iter().filter_map(|task| task.join);
        for result in join_all(joins).await {
            if let Err(e) = result {
                warn!("task ended abnormally: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry").field("tasks", &self.names()).finish()
    }
}

/// Handle to a registered task.
///
/// `stop` waits for the task to end, so it must not be awaited from within
/// that task. It waits even when `TaskRegistry::shutdown` already took the
/// task out of the registry.
#[derive(Debug)]
pub struct TaskHandle {
    id: u64,
    signal: ShutdownSignal,
    done: watch::Receiver<bool>,
}

impl TaskHandle {
    /// True until the task's future has ended
    pub fn is_running(&self) -> bool {
        !*self.done.borrow()
    }

    /// Ask the task to stop without waiting for it
    pub fn trigger(&self) {
        self.signal.trigger();
    }

    /// Signal the task and wait for it to finish
    pub async fn stop(mut self) {
        self.signal.trigger();
        // The sender is dropped only after marking the task done
        let _ = self.done.wait_for(|done| *done).await;
        debug!("task {} stopped", self.id);
    }
}
