//! Tracking of the background workers a role spawns.
//!
//! Every worker runs under a child of the owner's cancellation token
//! and reports how it ended on the set's event channel.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{TaskError, WallError};

pub type WorkerId = u64;

pub type WorkerEventSender = mpsc::Sender<WorkerEvent>;

type FinishedCallback = Box<dyn Fn(WorkerId) + Send + Sync + 'static>;

#[derive(Debug)]
pub enum WorkerEvent {
    Finished(WorkerId),
    Failed(WorkerId, String),
    Cancelled(WorkerId),
}

impl WorkerEvent {
    pub fn id(&self) -> WorkerId {
        match self {
            WorkerEvent::Finished(id) | WorkerEvent::Failed(id, _) | WorkerEvent::Cancelled(id) => {
                *id
            }
        }
    }
}

struct Worker {
    name: &'static str,
    handle: JoinHandle<()>,
}

pub struct WorkerSet {
    workers: HashMap<WorkerId, Worker>,
    next_id: WorkerId,
    cancel: CancellationToken,
    events_rx: mpsc::Receiver<WorkerEvent>,
    events_tx: WorkerEventSender,
    finished_callbacks: Vec<FinishedCallback>,
}

impl WorkerSet {
    pub fn new(cancel: CancellationToken) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            workers: HashMap::new(),
            next_id: 1,
            cancel,
            events_rx,
            events_tx,
            finished_callbacks: Vec::new(),
        }
    }

    /// Spawn `f` with a child token; the worker ends early if the token
    /// fires.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, f: F) -> WorkerId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), WallError>> + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let token = self.cancel.child_token();
        let fut = f(token.clone());
        let events = self.events_tx.clone();
        let handle = tokio::spawn(async move {
            let event = tokio::select! {
                res = fut => match res {
                    Ok(()) => WorkerEvent::Finished(id),
                    Err(WallError::Cancelled) => WorkerEvent::Cancelled(id),
                    Err(e) => WorkerEvent::Failed(id, e.to_string()),
                },
                _ = token.cancelled() => WorkerEvent::Cancelled(id),
            };
            let _ = events.send(event).await;
        });
        debug!(worker = id, name, "worker spawned");
        self.workers.insert(id, Worker { name, handle });
        id
    }

    /// Run `f` with a deadline; expiry counts as a failure.
    pub fn spawn_with_timeout<F, Fut>(&mut self, name: &'static str, limit: Duration, f: F) -> WorkerId
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<(), WallError>> + Send + 'static,
    {
        self.spawn(name, move |token| {
            let fut = f(token);
            async move {
                match tokio::time::timeout(limit, fut).await {
                    Ok(res) => res,
                    Err(_) => Err(TaskError::Timeout(limit).into()),
                }
            }
        })
    }

    pub fn on_finished<F>(&mut self, f: F)
    where
        F: Fn(WorkerId) + Send + Sync + 'static,
    {
        self.finished_callbacks.push(Box::new(f));
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn clone_tx(&self) -> WorkerEventSender {
        self.events_tx.clone()
    }

    pub async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events_rx.recv().await
    }

    pub fn process_event(&mut self, event: &WorkerEvent) {
        let id = event.id();
        let name = self.workers.remove(&id).map(|w| w.name).unwrap_or("?");
        match event {
            WorkerEvent::Finished(_) => debug!(worker = id, name, "worker finished"),
            WorkerEvent::Cancelled(_) => debug!(worker = id, name, "worker cancelled"),
            WorkerEvent::Failed(_, err) => warn!(worker = id, name, error = %err, "worker failed"),
        }
        for callback in &self.finished_callbacks {
            callback(id);
        }
    }

    /// Wait until worker `id` reports, processing other events on the way.
    pub async fn wait_for(&mut self, id: WorkerId) -> Option<WorkerEvent> {
        while let Some(event) = self.events_rx.recv().await {
            self.process_event(&event);
            if event.id() == id {
                return Some(event);
            }
        }
        None
    }

    /// Cancel everything and wait up to `grace` for workers to stop;
    /// stragglers are aborted.
    pub async fn shutdown(&mut self, grace: Duration) {
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + grace;
        for (id, worker) in self.workers.drain() {
            let mut handle = worker.handle;
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                warn!(worker = id, name = worker.name, "worker ignored cancellation, aborting");
                handle.abort();
            }
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        for worker in self.workers.values() {
            worker.handle.abort();
        }
    }
}
