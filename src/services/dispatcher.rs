use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::models::work_item::WorkItem;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("queue full: {depth} items pending (limit {limit})")]
    QueueFull { depth: usize, limit: usize },

    #[error("dispatcher closed to new submissions")]
    Closed,
}

/// Processes one dequeued item end to end.
#[async_trait]
pub trait ItemHandler: Send + Sync + 'static {
    async fn handle(&self, item: WorkItem, cancel: CancellationToken);
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_concurrency: usize,
    pub batch_size: usize,
    pub queue_depth: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            batch_size: 32,
            queue_depth: 256,
        }
    }
}

#[derive(Default)]
struct QueueInner {
    pending: VecDeque<WorkItem>,
    batch: VecDeque<WorkItem>,
    closed: bool,
}

impl QueueInner {
    fn depth(&self) -> usize {
        self.pending.len() + self.batch.len()
    }
}

/// Bounded multi-producer queue drained by a fixed pool of workers.
///
/// Submissions are cut into batches of `batch_size`; inside a batch items are
/// handed out by priority, so a low-priority item waits at most one batch.
/// Every item is handled independently: a slow or failing item only ever
/// occupies the worker that picked it up.
pub struct BatchDispatcher {
    config: DispatcherConfig,
    queue: Mutex<QueueInner>,
    notify: Notify,
    in_flight: AtomicUsize,
    batches_formed: AtomicU64,
    workers: tokio::sync::Mutex<JoinSet<()>>,
}

impl BatchDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            in_flight: AtomicUsize::new(0),
            batches_formed: AtomicU64::new(0),
            workers: tokio::sync::Mutex::new(JoinSet::new()),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    /// Enqueue an item, failing fast when the queue is at its depth limit.
    pub fn submit(&self, item: WorkItem) -> Result<(), DispatchError> {
        let depth = {
            let mut queue = self.lock_queue();
            if queue.closed {
                return Err(DispatchError::Closed);
            }
            let depth = queue.depth();
            if depth >= self.config.queue_depth {
                return Err(DispatchError::QueueFull {
                    depth,
                    limit: self.config.queue_depth,
                });
            }
            queue.pending.push_back(item);
            depth + 1
        };
        metrics::gauge!("dispatch_queue_depth").set(depth as f64);
        self.notify.notify_one();
        Ok(())
    }

    /// Spawn `max_concurrency` workers that pull from the queue until it is
    /// closed and empty, or until `cancel` fires.
    pub async fn drain<H: ItemHandler>(
        self: &Arc<Self>,
        handler: Arc<H>,
        max_concurrency: usize,
        cancel: CancellationToken,
    ) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker_id in 0..max_concurrency.max(1) {
            let dispatcher = Arc::clone(self);
            let handler = Arc::clone(&handler);
            let cancel = cancel.clone();
            workers.spawn(async move { dispatcher.run_worker(worker_id, handler, cancel).await });
        }
        tracing::info!(
            workers = max_concurrency.max(1),
            batch_size = self.config.batch_size,
            queue_depth = self.config.queue_depth,
            "dispatcher draining"
        );
    }

    async fn run_worker<H: ItemHandler>(&self, worker_id: usize, handler: Arc<H>, cancel: CancellationToken) {
        loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                item = self.next() => item,
            };
            let Some(item) = item else { break };

            self.in_flight.fetch_add(1, Ordering::AcqRel);
            tracing::trace!(worker_id, work_id = %item.id, "worker picked up item");
            handler.handle(item, cancel.clone()).await;
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::debug!(worker_id, "worker exiting");
    }

    /// Wait for the next item. Returns `None` once the queue is closed and empty.
    async fn next(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut queue = self.lock_queue();
                if queue.batch.is_empty() && !queue.pending.is_empty() {
                    self.form_batch(&mut queue);
                }
                if let Some(item) = queue.batch.pop_front() {
                    metrics::gauge!("dispatch_queue_depth").set(queue.depth() as f64);
                    return Some(item);
                }
                if queue.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    fn form_batch(&self, queue: &mut QueueInner) {
        let take = self.config.batch_size.max(1).min(queue.pending.len());
        let mut batch: Vec<WorkItem> = queue.pending.drain(..take).collect();
        batch.sort_by_key(|item| item.priority);
        queue.batch.extend(batch);
        self.batches_formed.fetch_add(1, Ordering::Relaxed);
    }

    /// Stop accepting submissions. Workers keep draining what is queued.
    pub fn close(&self) {
        self.lock_queue().closed = true;
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.lock_queue().closed
    }

    /// Remove everything still queued, in dispatch order.
    pub fn take_pending(&self) -> Vec<WorkItem> {
        let mut queue = self.lock_queue();
        let mut items: Vec<WorkItem> = queue.batch.drain(..).collect();
        items.extend(queue.pending.drain(..));
        items
    }

    /// Wait for all workers to exit. Safe to call again after being
    /// interrupted by a timeout; unfinished workers stay tracked.
    pub async fn join_workers(&self) {
        let mut workers = self.workers.lock().await;
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "dispatcher worker terminated abnormally");
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.lock_queue().depth()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn batches_formed(&self) -> u64 {
        self.batches_formed.load(Ordering::Relaxed)
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
