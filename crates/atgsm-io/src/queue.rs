//! Operation queue: strictly sequential, idle-gated units of work.
//!
//! Every outward command sequence runs as a queue entry. Entries execute
//! one at a time in submission order; before each dequeue the queue waits
//! for the device idle signal, so a notification being processed or a
//! multi-step send in progress holds back the next entry. A failing entry
//! is logged and the queue moves on.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use atgsm_core::error::{Error, Result};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One step of a multi-step entry.
pub type Step<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

struct Entry {
    label: String,
    job: Job,
}

/// Handle to the queue task.
pub struct OperationQueue {
    entry_tx: mpsc::UnboundedSender<Entry>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl OperationQueue {
    /// Spawn the queue task, gated by `idle`.
    pub fn spawn(idle: watch::Receiver<bool>) -> Self {
        let (entry_tx, entry_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let pending = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(queue_loop(
            entry_rx,
            idle,
            cancel.clone(),
            Arc::clone(&pending),
        ));

        OperationQueue {
            entry_tx,
            cancel,
            task: Mutex::new(Some(task)),
            pending,
        }
    }

    /// Queue `operation` and await its result.
    pub async fn run<T, F>(&self, label: impl Into<String>, operation: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let (reply_tx, reply_rx) = oneshot::channel();
        let log_label = label.clone();
        let job: Job = Box::pin(async move {
            let result = operation.await;
            log_outcome(&log_label, &result);
            let _ = reply_tx.send(result);
        });
        self.enqueue(label, job)?;

        reply_rx.await.map_err(|_| Error::NotConnected)?
    }

    /// Queue `operation` without waiting for it.
    pub fn submit<F>(&self, label: impl Into<String>, operation: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let label = label.into();
        let log_label = label.clone();
        let job: Job = Box::pin(async move {
            let result = operation.await;
            log_outcome(&log_label, &result);
        });
        self.enqueue(label, job)
    }

    fn enqueue(&self, label: String, job: Job) -> Result<()> {
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.entry_tx.send(Entry { label, job }).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            Error::NotConnected
        })
    }

    /// Entries queued or running.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Stop the queue. The running entry is dropped; queued entries are
    /// discarded and their callers see [`Error::NotConnected`].
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn log_outcome<T>(label: &str, result: &Result<T>) {
    match result {
        Ok(_) => debug!("Queue {label} [OK]"),
        Err(e) => warn!(error = %e, "Queue {label} [FAILED]"),
    }
}

async fn queue_loop(
    mut entry_rx: mpsc::UnboundedReceiver<Entry>,
    mut idle: watch::Receiver<bool>,
    cancel: CancellationToken,
    pending: Arc<AtomicUsize>,
) {
    loop {
        let entry = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            entry = entry_rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
        };

        let gate = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            gate = async { idle.wait_for(|idle| *idle).await.map(|_| ()) } => gate,
        };
        if gate.is_err() {
            debug!("idle signal closed, stopping queue");
            break;
        }

        debug!(label = %entry.label, "queue entry started");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = entry.job => {}
        }
        pending.fetch_sub(1, Ordering::SeqCst);
    }
    debug!("operation queue stopped");
}

/// Run `steps` in order. The first failing step aborts the rest.
pub async fn sequence<T>(steps: impl IntoIterator<Item = Step<T>>) -> Result<Vec<T>> {
    let mut results = Vec::new();
    for step in steps {
        results.push(step.await?);
    }
    Ok(results)
}
