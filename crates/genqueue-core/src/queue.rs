//! Bounded task queue drained by a fixed number of generation workers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use genqueue_common::config::TaskQueueConfig;
use genqueue_common::{GenqueueError, Result};
use genqueue_obs::metrics;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::store::{TaskRecord, TaskStatus, TaskStore};
use crate::worker::{JobOutcome, Worker};

struct Job {
    task_id: String,
    prompt: String,
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Job>,
    store: Arc<TaskStore>,
    worker: Arc<Worker>,
    slots: Arc<Semaphore>,
    pub queue_depth: Arc<AtomicUsize>,
    closing: Arc<watch::Sender<bool>>,
    consumers: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl TaskQueue {
    /// Spawns `cfg.workers` consumers on the current tokio runtime.
    pub fn start(worker: Arc<Worker>, store: Arc<TaskStore>, cfg: &TaskQueueConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Job>(cfg.max_pending.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let (closing, _) = watch::channel(false);
        let mut consumers = Vec::new();
        let mut queue = Self {
            tx,
            store,
            worker,
            slots: Arc::new(Semaphore::new(cfg.workers.max(1))),
            queue_depth: Arc::new(AtomicUsize::new(0)),
            closing: Arc::new(closing),
            consumers: Arc::new(Mutex::new(Vec::new())),
        };
        for n in 0..cfg.workers.max(1) {
            let rx = rx.clone();
            let mut closing = queue.closing.subscribe();
            // the loop ends once the queue is closed and drained, or every handle is dropped
            let consumer = Consumer {
                store: queue.store.clone(),
                worker: queue.worker.clone(),
                slots: queue.slots.clone(),
                queue_depth: queue.queue_depth.clone(),
            };
            consumers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut rx = rx.lock().await;
                        tokio::select! {
                            job = rx.recv() => job,
                            _ = wait_closed(&mut closing) => {
                                rx.close();
                                rx.recv().await
                            }
                        }
                    };
                    let Some(job) = job else { break };
                    consumer.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    metrics::QUEUE_DEPTH.dec();
                    let _ = consumer.process(job).await;
                }
                tracing::debug!(target: "queue", "consumer {n} stopped");
            }));
        }
        queue.consumers = Arc::new(Mutex::new(consumers));
        queue
    }

    pub fn store(&self) -> &Arc<TaskStore> { &self.store }

    pub fn worker(&self) -> &Arc<Worker> { &self.worker }

    /// Stops accepting tasks. Queued and running tasks still finish.
    pub fn close(&self) {
        self.closing.send_replace(true);
    }

    /// Closes the queue and waits until every consumer has drained it.
    pub async fn shutdown(&self) {
        self.close();
        let consumers = std::mem::take(&mut *self.consumers.lock().await);
        tracing::info!(target: "queue", "draining {} queued tasks", self.queue_depth.load(Ordering::Relaxed));
        for handle in consumers {
            if let Err(e) = handle.await {
                tracing::error!(target: "queue", "consumer ended abnormally: {e}");
            }
        }
    }

    /// Accepts a task for asynchronous processing.
    pub async fn submit(&self, prompt: String) -> Result<TaskRecord> {
        if *self.closing.borrow() {
            return Err(GenqueueError::QueueClosed);
        }
        let permit = match self.tx.try_reserve() {
            Ok(permit) => permit,
            Err(mpsc::error::TrySendError::Closed(())) => return Err(GenqueueError::QueueClosed),
            Err(mpsc::error::TrySendError::Full(())) => {
                metrics::TASKS_REJECTED.inc();
                tracing::warn!(target: "queue", "rejecting task: queue full");
                return Err(GenqueueError::QueueFull);
            }
        };
        let record = self.store.create(prompt.clone()).await;
        self.queue_depth.fetch_add(1, Ordering::Relaxed);
        metrics::QUEUE_DEPTH.inc();
        metrics::TASKS_SUBMITTED.inc();
        permit.send(Job { task_id: record.task_id.clone(), prompt });
        tracing::info!(target: "queue", task_id = %record.task_id, "task queued");
        Ok(record)
    }

    /// Copies the store's per-status counts into the `genqueue_tasks` gauge.
    pub async fn export_status_counts(&self) {
        let counts = self.store.counts().await;
        for status in [TaskStatus::Pending, TaskStatus::Running, TaskStatus::Complete, TaskStatus::Failed] {
            let n = counts.get(&status).copied().unwrap_or(0);
            metrics::TASKS_BY_STATUS.with_label_values(&[status.as_str()]).set(n as i64);
        }
    }

    /// Runs a task right away, waiting for a free worker slot.
    pub async fn run_now(&self, prompt: String) -> Result<(TaskRecord, JobOutcome)> {
        let record = self.store.create(prompt.clone()).await;
        metrics::TASKS_SUBMITTED.inc();
        let consumer = Consumer {
            store: self.store.clone(),
            worker: self.worker.clone(),
            slots: self.slots.clone(),
            queue_depth: self.queue_depth.clone(),
        };
        let outcome = consumer.process(Job { task_id: record.task_id.clone(), prompt }).await?;
        let record = self.store.get(&record.task_id).await.unwrap_or(record);
        Ok((record, outcome))
    }

    /// Loads the model in the background so the first task does not pay for it.
    pub fn warm_up(&self) {
        let worker = self.worker.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = worker.ensure_loaded() {
                tracing::error!(target: "queue", "model warm-up failed: {e}");
            }
        });
    }
}

async fn wait_closed(closing: &mut watch::Receiver<bool>) {
    while !*closing.borrow_and_update() {
        if closing.changed().await.is_err() {
            // sender gone: the queue itself was dropped, never closed
            std::future::pending::<()>().await;
        }
    }
}

struct Consumer {
    store: Arc<TaskStore>,
    worker: Arc<Worker>,
    slots: Arc<Semaphore>,
    queue_depth: Arc<AtomicUsize>,
}

impl Consumer {
    async fn process(&self, job: Job) -> Result<JobOutcome> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| GenqueueError::Message("worker pool closed".into()))?;
        self.store.mark_running(&job.task_id).await?;
        metrics::RUNNING_TASKS.inc();
        let worker = self.worker.clone();
        let task_id = job.task_id.clone();
        let result = tokio::task::spawn_blocking(move || worker.run_task(&task_id, &job.prompt))
            .await
            .unwrap_or_else(|e| Err(GenqueueError::Message(format!("generation panicked: {e}"))));
        metrics::RUNNING_TASKS.dec();

        match result {
            Ok(outcome) => {
                self.store.mark_complete(&job.task_id, outcome.outputs.clone(), outcome.new_tokens).await?;
                metrics::TASKS_FINISHED.with_label_values(&[TaskStatus::Complete.as_str()]).inc();
                tracing::info!(target: "queue", task_id = %job.task_id, "task complete");
                Ok(outcome)
            }
            Err(e) => {
                tracing::error!(target: "queue", task_id = %job.task_id, "task failed: {e}");
                self.store.mark_failed(&job.task_id, e.to_string()).await?;
                metrics::TASKS_FINISHED.with_label_values(&[TaskStatus::Failed.as_str()]).inc();
                Err(e)
            }
        }
    }
}
