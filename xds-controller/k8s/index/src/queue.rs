//! A single-consumer work queue with delayed retries.
//!
//! Watch callbacks enqueue tasks without blocking; a single worker processes
//! them in order. Tasks that fail are re-queued after a fixed delay.

use crate::metrics::QueueMetrics;
use std::time::Duration;
use tokio::{sync::mpsc, task::JoinSet};

/// Processes tasks taken from a [`Worker`]'s queue.
pub trait Handler<T> {
    fn handle(&mut self, task: &T) -> anyhow::Result<()>;
}

/// Enqueues tasks. Cheap to clone.
#[derive(Debug)]
pub struct Queue<T> {
    tx: mpsc::UnboundedSender<T>,
    metrics: QueueMetrics,
}

#[derive(Debug)]
pub struct Worker<T> {
    rx: mpsc::UnboundedReceiver<T>,
    retries: JoinSet<T>,
    retry_delay: Duration,
    metrics: QueueMetrics,
}

pub fn channel<T>(retry_delay: Duration, metrics: QueueMetrics) -> (Queue<T>, Worker<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Queue {
        tx,
        metrics: metrics.clone(),
    };
    let worker = Worker {
        rx,
        retries: JoinSet::new(),
        retry_delay,
        metrics,
    };
    (queue, worker)
}

// === impl Queue ===

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<T> Queue<T> {
    /// Enqueues a task. Tasks pushed after the worker has shut down are
    /// dropped.
    pub fn push(&self, task: T) {
        if self.tx.send(task).is_err() {
            tracing::debug!("Work queue is closed; dropping task");
            self.metrics.dropped.inc();
            return;
        }
        self.metrics.queued.inc();
    }
}

// === impl Worker ===

impl<T> Worker<T>
where
    T: std::fmt::Debug + Send + 'static,
{
    /// Processes tasks until the process begins shutting down or every
    /// [`Queue`] handle has been dropped. Pending retries are abandoned on
    /// shutdown.
    pub async fn run<H: Handler<T>>(mut self, mut handler: H, drain: drain::Watch) {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        let mut closed = false;
        while !(closed && self.retries.is_empty()) {
            let task = tokio::select! {
                biased;

                _ = &mut shutdown => {
                    tracing::debug!("Work queue shutting down");
                    break;
                }

                task = self.rx.recv(), if !closed => match task {
                    Some(task) => task,
                    None => {
                        closed = true;
                        continue;
                    }
                },

                Some(res) = self.retries.join_next(), if !self.retries.is_empty() => match res {
                    Ok(task) => task,
                    Err(error) => {
                        tracing::debug!(%error, "Retry was cancelled");
                        continue;
                    }
                },
            };

            self.process(&mut handler, task);
        }

        self.rx.close();
        self.retries.abort_all();
        while self.rx.try_recv().is_ok() {
            self.metrics.dropped.inc();
        }
    }

    fn process<H: Handler<T>>(&mut self, handler: &mut H, task: T) {
        match handler.handle(&task) {
            Ok(()) => {
                self.metrics.processed.inc();
            }
            Err(error) => {
                tracing::warn!(?task, %error, delay = ?self.retry_delay, "Task failed; retrying");
                self.metrics.retried.inc();
                let delay = self.retry_delay;
                self.retries.spawn(async move {
                    tokio::time::sleep(delay).await;
                    task
                });
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}
