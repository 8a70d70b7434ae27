//! Durable-queue collaborator.
//!
//! The core needs only pull/ack/nack plus a dead-letter publish. Redelivery
//! timing belongs to the queue: a nacked message comes back after an
//! exponential backoff, and a message whose lease expires without an ack is
//! handed out again.
//!
//! [`InMemoryQueue`] implements the contract in-process, with backoff modelled
//! as a delayed re-enqueue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;

/// Default time a delivery may stay unacknowledged before redelivery.
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(60);

/// Opaque lease token for one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AckHandle(String);

impl AckHandle {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AckHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to the consumer under a lease.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub ack_handle: AckHandle,
    /// Queue-side delivery counter, starting at 1.
    pub delivery_attempt: u32,
}

/// A message routed off the main stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    /// Original payload, lossily decoded as UTF-8.
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(message_id: &str, payload: &[u8], reason: impl Into<String>, attempts: u32) -> Self {
        Self {
            message_id: message_id.to_string(),
            payload: String::from_utf8_lossy(payload).into_owned(),
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Pull-based durable queue with per-message leases.
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Wait up to `timeout` for a message. `Ok(None)` on timeout.
    async fn pull(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle a delivery; it will not be redelivered.
    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    /// Release a delivery for redelivery after backoff.
    async fn nack(&self, handle: &AckHandle) -> Result<(), QueueError>;

    /// Publish to the dead-letter destination.
    async fn publish_dead_letter(&self, letter: DeadLetter) -> Result<(), QueueError>;

    /// Whether the connection is usable.
    fn is_alive(&self) -> bool;
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential redelivery backoff clamped to `[minimum, maximum]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub minimum_secs: f64,
    pub maximum_secs: f64,
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            minimum_secs: 10.0,
            maximum_secs: 600.0,
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay before redelivering a message that has failed `attempt` times.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.minimum_secs * self.multiplier.powi(exp);
        let secs = if secs.is_nan() { self.maximum_secs } else { secs };
        Duration::from_secs_f64(secs.clamp(self.minimum_secs, self.maximum_secs).max(0.0))
    }
}

// ---------------------------------------------------------------------------
// In-memory queue
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Message {
    id: String,
    payload: Vec<u8>,
    deliveries: u32,
}

struct Lease {
    message: Message,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    leased: HashMap<String, Lease>,
    dead_letters: Vec<DeadLetter>,
    acked: u64,
    closed: bool,
}

impl QueueState {
    /// Move due retries and expired leases back to the ready list.
    fn promote(&mut self, now: Instant) {
        let mut due: Vec<(Instant, Message)> = Vec::new();
        self.delayed.retain(|(at, msg)| {
            if *at <= now {
                due.push((*at, msg.clone()));
                false
            } else {
                true
            }
        });
        due.sort_by_key(|(at, _)| *at);
        self.ready.extend(due.into_iter().map(|(_, m)| m));

        let expired: Vec<String> = self
            .leased
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for lease_id in expired {
            if let Some(lease) = self.leased.remove(&lease_id) {
                log::warn!(
                    "lease expired for message {}, redelivering",
                    lease.message.id
                );
                self.ready.push_back(lease.message);
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let retry = self.delayed.iter().map(|(at, _)| *at).min();
        let lease = self.leased.values().map(|l| l.deadline).min();
        match (retry, lease) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// In-process queue with leases, backoff redelivery and a dead-letter list.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    ack_deadline: Duration,
    backoff: BackoffPolicy,
}

impl InMemoryQueue {
    pub fn new(ack_deadline: Duration, backoff: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            ack_deadline,
            backoff,
        }
    }

    /// Enqueue a payload; returns its message id.
    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> String {
        let id = Uuid::new_v4().to_string();
        self.lock().ready.push_back(Message {
            id: id.clone(),
            payload: payload.into(),
            deliveries: 0,
        });
        self.notify.notify_one();
        id
    }

    /// Stop handing out messages. Pending pulls return [`QueueError::Closed`].
    pub fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.lock().dead_letters.clone()
    }

    pub fn acked_count(&self) -> u64 {
        self.lock().acked
    }

    /// Messages not yet acknowledged: ready, waiting on backoff, or leased.
    pub fn pending_count(&self) -> usize {
        let st = self.lock();
        st.ready.len() + st.delayed.len() + st.leased.len()
    }

    pub fn is_drained(&self) -> bool {
        self.pending_count() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new(DEFAULT_ACK_DEADLINE, BackoffPolicy::default())
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn pull(&self, timeout: Duration) -> Result<Option<Delivery>, QueueError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut st = self.lock();
                if st.closed {
                    return Err(QueueError::Closed);
                }
                let now = Instant::now();
                st.promote(now);
                if let Some(mut message) = st.ready.pop_front() {
                    message.deliveries += 1;
                    let lease_id = Uuid::new_v4().to_string();
                    let delivery = Delivery {
                        message_id: message.id.clone(),
                        payload: message.payload.clone(),
                        ack_handle: AckHandle::new(lease_id.clone()),
                        delivery_attempt: message.deliveries,
                    };
                    st.leased.insert(
                        lease_id,
                        Lease {
                            message,
                            deadline: now + self.ack_deadline,
                        },
                    );
                    return Ok(Some(delivery));
                }
                if now >= deadline {
                    return Ok(None);
                }
                st.next_wake().map_or(deadline, |at| at.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn ack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        let mut st = self.lock();
        match st.leased.remove(handle.as_str()) {
            Some(_) => {
                st.acked += 1;
                Ok(())
            }
            None => Err(QueueError::UnknownLease(handle.to_string())),
        }
    }

    async fn nack(&self, handle: &AckHandle) -> Result<(), QueueError> {
        {
            let mut st = self.lock();
            let lease = st
                .leased
                .remove(handle.as_str())
                .ok_or_else(|| QueueError::UnknownLease(handle.to_string()))?;
            let delay = self.backoff.delay(lease.message.deliveries);
            log::debug!(
                "message {} nacked, redelivery in {:?}",
                lease.message.id,
                delay
            );
            st.delayed.push((Instant::now() + delay, lease.message));
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn publish_dead_letter(&self, letter: DeadLetter) -> Result<(), QueueError> {
        let mut st = self.lock();
        if st.closed {
            return Err(QueueError::Closed);
        }
        st.dead_letters.push(letter);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.lock().closed
    }
}
