//! Queue consumer: pull, process, settle.
//!
//! Each delivery moves through `Received → Processing → {Acked | Retrying |
//! DeadLettered}`. The transition out of `Processing` is made by [`decide`]
//! and nothing else.
//!
//! # Concurrency
//!
//! One dispatcher pulls and routes by `device_shard(device_id, workers)` to a
//! fixed pool of workers over bounded channels. A device always lands on the
//! same worker, so its readings are processed in delivery order. When a
//! worker's channel is full the dispatcher stops pulling and unacked messages
//! stay on the queue.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{ProcessingError, QueueError, TransientError};
use crate::pipeline::IngestionPipeline;
use crate::queue::{DeadLetter, Delivery, MessageQueue};
use crate::reading::Reading;
use crate::stats::PipelineStats;
use crate::window::device_shard;

// ---------------------------------------------------------------------------
// Delivery tracking
// ---------------------------------------------------------------------------

/// Attempt bookkeeping for one in-flight message.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryAttempt {
    pub message_id: String,
    pub attempt_count: u32,
    pub first_seen_at: DateTime<Utc>,
}

/// In-flight attempts keyed by message id. Entries go away on ack or
/// dead-letter.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    attempts: Mutex<HashMap<String, DeliveryAttempt>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a delivery and return the updated attempt.
    ///
    /// The queue's own counter wins when it is ahead, so attempts survive a
    /// consumer restart.
    pub fn observe(&self, message_id: &str, queue_attempt: u32) -> DeliveryAttempt {
        let mut attempts = self.lock();
        let entry = attempts
            .entry(message_id.to_string())
            .and_modify(|a| a.attempt_count += 1)
            .or_insert_with(|| DeliveryAttempt {
                message_id: message_id.to_string(),
                attempt_count: 1,
                first_seen_at: Utc::now(),
            });
        entry.attempt_count = entry.attempt_count.max(queue_attempt);
        entry.clone()
    }

    pub fn discard(&self, message_id: &str) {
        self.lock().remove(message_id);
    }

    pub fn get(&self, message_id: &str) -> Option<DeliveryAttempt> {
        self.lock().get(message_id).cloned()
    }

    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, DeliveryAttempt>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Disposition
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Ack,
    Retry,
    DeadLetter(String),
}

/// Settle a processed delivery.
///
/// Validation failures dead-letter on the first attempt. Transient failures
/// retry until `attempt_count` reaches `max_attempts`.
pub fn decide<T>(
    outcome: &Result<T, ProcessingError>,
    attempt_count: u32,
    max_attempts: u32,
) -> Disposition {
    match outcome {
        Ok(_) => Disposition::Ack,
        Err(err) if err.is_fatal() => Disposition::DeadLetter(err.to_string()),
        Err(err) if attempt_count >= max_attempts => Disposition::DeadLetter(format!(
            "gave up after {attempt_count} delivery attempts: {err}"
        )),
        Err(_) => Disposition::Retry,
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub worker_buffer: usize,
    pub max_delivery_attempts: u32,
    pub processing_timeout: Duration,
    pub shutdown_grace: Duration,
    pub pull_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for ConsumerConfig {
    fn from(c: &PipelineConfig) -> Self {
        Self {
            workers: c.workers.max(1),
            worker_buffer: c.worker_buffer.max(1),
            max_delivery_attempts: c.max_delivery_attempts,
            processing_timeout: c.processing_timeout(),
            shutdown_grace: c.shutdown_grace(),
            pull_timeout: c.pull_timeout(),
        }
    }
}

struct Job {
    delivery: Delivery,
    attempt: DeliveryAttempt,
    reading: Reading,
}

/// State shared by the dispatcher and workers.
struct Settler {
    queue: Arc<dyn MessageQueue>,
    pipeline: Arc<IngestionPipeline>,
    tracker: Arc<DeliveryTracker>,
    stats: Arc<PipelineStats>,
    max_attempts: u32,
    processing_timeout: Duration,
}

impl Settler {
    async fn process(&self, job: Job) {
        let outcome = match tokio::time::timeout(
            self.processing_timeout,
            self.pipeline.handle(job.reading),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransientError::Timeout(self.processing_timeout).into()),
        };
        if let Err(err) = &outcome {
            log::warn!(
                "message {} attempt {} failed: {err}",
                job.delivery.message_id,
                job.attempt.attempt_count
            );
        }
        let disposition = decide(&outcome, job.attempt.attempt_count, self.max_attempts);
        self.settle(&job.delivery, &job.attempt, disposition).await;
    }

    async fn settle(&self, delivery: &Delivery, attempt: &DeliveryAttempt, disposition: Disposition) {
        match disposition {
            Disposition::Ack => {
                if let Err(err) = self.queue.ack(&delivery.ack_handle).await {
                    log::warn!("ack failed for {}: {err}", delivery.message_id);
                    return;
                }
                self.tracker.discard(&delivery.message_id);
                self.stats.record_acked();
            }
            Disposition::Retry => self.release(delivery).await,
            Disposition::DeadLetter(reason) => {
                log::error!(
                    "dead-lettering message {} after {} attempt(s): {reason}",
                    delivery.message_id,
                    attempt.attempt_count
                );
                let letter = DeadLetter::new(
                    &delivery.message_id,
                    &delivery.payload,
                    reason,
                    attempt.attempt_count,
                );
                if let Err(err) = self.queue.publish_dead_letter(letter).await {
                    log::warn!(
                        "dead-letter publish failed for {}: {err}; releasing for redelivery",
                        delivery.message_id
                    );
                    self.release(delivery).await;
                    return;
                }
                if let Err(err) = self.queue.ack(&delivery.ack_handle).await {
                    log::warn!("ack after dead-letter failed for {}: {err}", delivery.message_id);
                }
                self.tracker.discard(&delivery.message_id);
                self.stats.record_dead_lettered();
            }
        }
    }

    /// Hand a delivery back to the queue for redelivery after backoff.
    async fn release(&self, delivery: &Delivery) {
        match self.queue.nack(&delivery.ack_handle).await {
            Ok(()) => self.stats.record_retried(),
            Err(err) => log::warn!(
                "nack failed for {}: {err}; lease expiry will redeliver",
                delivery.message_id
            ),
        }
    }
}

pub struct Consumer {
    settler: Arc<Settler>,
    config: ConsumerConfig,
}

impl Consumer {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        pipeline: Arc<IngestionPipeline>,
        config: ConsumerConfig,
    ) -> Self {
        let stats = Arc::clone(pipeline.stats());
        Self {
            settler: Arc::new(Settler {
                queue,
                pipeline,
                tracker: Arc::new(DeliveryTracker::new()),
                stats,
                max_attempts: config.max_delivery_attempts,
                processing_timeout: config.processing_timeout,
            }),
            config,
        }
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.settler.tracker
    }

    /// Consume until `shutdown` fires or the queue closes.
    ///
    /// On shutdown, workers finish the message in hand and nack what is still
    /// buffered. Workers still busy after the grace period are aborted; their
    /// leases expire and the queue redelivers.
    pub async fn run(self, shutdown: CancellationToken) {
        let workers = self.config.workers.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut tasks = JoinSet::new();
        for id in 0..workers {
            let (tx, rx) = mpsc::channel(self.config.worker_buffer.max(1));
            senders.push(tx);
            tasks.spawn(worker(id, rx, Arc::clone(&self.settler), shutdown.clone()));
        }
        log::info!(
            "consumer started: {workers} workers, max {} attempts",
            self.config.max_delivery_attempts
        );

        self.dispatch(&senders, &shutdown).await;
        drop(senders);

        if shutdown.is_cancelled() {
            let grace = self.config.shutdown_grace;
            let drained = tokio::time::timeout(grace, async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if drained.is_err() {
                log::warn!("workers still busy after {grace:?}, aborting");
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        } else {
            while tasks.join_next().await.is_some() {}
        }
        log::info!("consumer stopped");
    }

    async fn dispatch(&self, senders: &[mpsc::Sender<Job>], shutdown: &CancellationToken) {
        let settler = &self.settler;
        loop {
            let pulled = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                pulled = settler.queue.pull(self.config.pull_timeout) => pulled,
            };
            let delivery = match pulled {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(QueueError::Closed) => {
                    log::info!("queue closed, dispatcher stopping");
                    break;
                }
                Err(err) => {
                    log::warn!("pull failed: {err}");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.pull_timeout) => continue,
                    }
                }
            };

            settler.stats.record_received();
            let attempt = settler
                .tracker
                .observe(&delivery.message_id, delivery.delivery_attempt);

            let reading = match Reading::from_slice(&delivery.payload) {
                Ok(reading) => reading,
                Err(err) => {
                    settler.stats.record_validation_failure();
                    let outcome: Result<(), ProcessingError> = Err(err.into());
                    let disposition = decide(&outcome, attempt.attempt_count, settler.max_attempts);
                    settler.settle(&delivery, &attempt, disposition).await;
                    continue;
                }
            };

            let tx = &senders[device_shard(&reading.device_id, senders.len())];
            let job = Job {
                delivery,
                attempt,
                reading,
            };
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    settler.release(&job.delivery).await;
                    break;
                }
                permit = tx.reserve() => permit,
            };
            match permit {
                Ok(permit) => permit.send(job),
                Err(_) => {
                    settler.release(&job.delivery).await;
                    break;
                }
            }
        }
    }
}

async fn worker(
    id: usize,
    mut rx: mpsc::Receiver<Job>,
    settler: Arc<Settler>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => return,
            },
        };
        settler.process(job).await;
    }

    rx.close();
    let mut released = 0usize;
    while let Some(job) = rx.recv().await {
        settler.release(&job.delivery).await;
        released += 1;
    }
    if released > 0 {
        log::info!("worker {id} released {released} buffered message(s)");
    }
}
