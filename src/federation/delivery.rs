//! Outbound fan-out engine
//!
//! A bounded in-memory queue of `(activity, inbox)` pairs drained by a
//! semaphore-limited worker pool. Each permit carries exactly one pair so
//! a slow destination never blocks the others. Failed endpoints
//! accumulate strikes toward removal; transient failures re-enqueue with
//! exponential backoff.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use super::client::{Client, DeliveryOutcome};
use crate::data::{Instance, Store};
use crate::error::{AppError, Result};
use crate::metrics::DELIVERIES_TOTAL;
use crate::policy::PolicySnapshot;

/// Maximum pending `(activity, inbox)` pairs
pub const QUEUE_CAPACITY: usize = 10_000;

/// Retry budget per pair; the attempt index runs 0..MAX_ATTEMPTS
pub const MAX_ATTEMPTS: u32 = 6;

/// How long an enqueue may block the ingest handler before 503
const ENQUEUE_WAIT: std::time::Duration = std::time::Duration::from_secs(30);

/// Continuous failure span after which an inbox row is removed
const FAILURE_EXPIRY_DAYS: i64 = 7;

/// Delay before retrying `attempt` (0-indexed): min(60 * 2^attempt, 3600)
pub fn backoff_delay(attempt: u32) -> std::time::Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let secs = 60u64.saturating_mul(factor).min(3600);
    std::time::Duration::from_secs(secs)
}

/// How a job relates to the subscriber table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// A rebroadcast to a subscriber; failures count against its row,
    /// and the job is dropped if the row disappeared since enqueue
    Broadcast,
    /// A handshake (Accept/Reject/Follow/Undo) addressed directly to an
    /// inbox; delivered even when no subscriber row exists
    Response,
}

/// One queued delivery
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub domain: String,
    pub inbox: String,
    pub activity: Arc<Value>,
    pub attempt: u32,
    pub kind: JobKind,
}

/// Handle for enqueueing deliveries
#[derive(Clone)]
pub struct Delivery {
    tx: mpsc::Sender<DeliveryJob>,
}

impl Delivery {
    /// Start the dispatcher and worker pool
    ///
    /// The returned join handle completes once the queue is drained or
    /// shutdown was signalled and in-flight deliveries finished.
    pub fn start(
        store: Arc<Store>,
        client: Arc<Client>,
        worker_count: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let engine = Engine {
            store,
            client,
            retry_tx: tx.clone(),
            worker_count,
        };

        let handle = tokio::spawn(engine.run(rx, shutdown));

        (Self { tx }, handle)
    }

    /// Queue one delivery, waiting up to 30 s for space
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<()> {
        self.tx
            .send_timeout(job, ENQUEUE_WAIT)
            .await
            .map_err(|_| AppError::Backpressure)
    }

    /// Queue one activity for a set of recipients; returns how many
    /// pairs were enqueued
    pub async fn broadcast(&self, activity: Value, recipients: Vec<Instance>) -> Result<usize> {
        let activity = Arc::new(activity);
        let mut queued = 0;

        for recipient in recipients {
            self.enqueue(DeliveryJob {
                domain: recipient.domain,
                inbox: recipient.inbox,
                activity: activity.clone(),
                attempt: 0,
                kind: JobKind::Broadcast,
            })
            .await?;
            queued += 1;
        }

        Ok(queued)
    }
}

struct Engine {
    store: Arc<Store>,
    client: Arc<Client>,
    retry_tx: mpsc::Sender<DeliveryJob>,
    worker_count: usize,
}

impl Engine {
    async fn run(self, mut rx: mpsc::Receiver<DeliveryJob>, mut shutdown: watch::Receiver<bool>) {
        let engine = Arc::new(self);
        let permits = Arc::new(Semaphore::new(engine.worker_count));

        tracing::info!(workers = engine.worker_count, "Fan-out workers started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };

                    // one permit per (job, recipient) pair in flight
                    let permit = match permits.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let engine = engine.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if !*shutdown.borrow() {
                            engine.deliver(job).await;
                        }
                        drop(permit);
                    });
                }
            }
        }

        // wait for in-flight deliveries to finish their current POST
        let _ = permits.acquire_many(engine.worker_count as u32).await;
        tracing::info!("Fan-out workers stopped");
    }

    /// Deliver one pair; all errors are recorded, never propagated
    async fn deliver(&self, job: DeliveryJob) {
        let (inbox, software) = match job.kind {
            JobKind::Broadcast => match self.store.get_inbox(&job.domain).await {
                Ok(Some(instance)) => (instance.inbox, instance.software),
                Ok(None) => return, // removed since enqueue
                Err(error) => {
                    tracing::error!(domain = %job.domain, %error, "Inbox lookup failed");
                    return;
                }
            },
            JobKind::Response => (job.inbox.clone(), None),
        };

        // the policy may have changed since the job was queued
        match PolicySnapshot::load(&self.store).await {
            Ok(snapshot) => {
                if !snapshot
                    .evaluate(&job.domain, software.as_deref())
                    .is_allowed()
                {
                    tracing::debug!(domain = %job.domain, "Dropping delivery to blocked domain");
                    DELIVERIES_TOTAL.with_label_values(&["blocked"]).inc();
                    return;
                }
            }
            Err(error) => {
                tracing::error!(%error, "Policy snapshot failed; delivery skipped");
                return;
            }
        }

        let outcome = self.client.post_signed(&inbox, &job.activity).await;

        match outcome {
            DeliveryOutcome::Success => {
                DELIVERIES_TOTAL.with_label_values(&["success"]).inc();
                tracing::debug!(domain = %job.domain, attempt = job.attempt, "Delivered");
                if job.kind == JobKind::Broadcast {
                    if let Err(error) = self.store.record_delivery_success(&job.domain).await {
                        tracing::error!(domain = %job.domain, %error, "Failure reset failed");
                    }
                }
            }
            DeliveryOutcome::Gone => {
                DELIVERIES_TOTAL.with_label_values(&["gone"]).inc();
                tracing::info!(domain = %job.domain, "Endpoint gone (410)");
                self.record_failure(&job, true).await;
            }
            DeliveryOutcome::NotFound => {
                DELIVERIES_TOTAL.with_label_values(&["not_found"]).inc();
                tracing::debug!(domain = %job.domain, "Endpoint answered 404");
                self.record_failure(&job, false).await;
            }
            DeliveryOutcome::Transient(reason) => {
                DELIVERIES_TOTAL.with_label_values(&["transient"]).inc();
                self.record_failure(&job, false).await;
                self.schedule_retry(job, reason);
            }
            DeliveryOutcome::Permanent(reason) => {
                DELIVERIES_TOTAL.with_label_values(&["permanent"]).inc();
                tracing::warn!(domain = %job.domain, %reason, "Delivery rejected");
                self.record_failure(&job, false).await;
            }
        }
    }

    /// Count a strike and auto-remove endpoints failing for over a week
    async fn record_failure(&self, job: &DeliveryJob, hard: bool) {
        if job.kind != JobKind::Broadcast {
            return;
        }

        let updated = match self.store.record_delivery_failure(&job.domain, hard).await {
            Ok(updated) => updated,
            Err(error) => {
                tracing::error!(domain = %job.domain, %error, "Failure accounting failed");
                return;
            }
        };

        let Some(instance) = updated else { return };

        let expired = instance
            .failed_since
            .map(|since| Utc::now() - since > ChronoDuration::days(FAILURE_EXPIRY_DAYS))
            .unwrap_or(false);

        if expired {
            tracing::info!(
                domain = %job.domain,
                failures = instance.failures,
                "Removing inbox after a week of continuous failure"
            );
            if let Err(error) = self.store.del_inbox(&job.domain).await {
                tracing::error!(domain = %job.domain, %error, "Inbox removal failed");
            }
        }
    }

    fn schedule_retry(&self, mut job: DeliveryJob, reason: String) {
        job.attempt += 1;

        if job.attempt >= MAX_ATTEMPTS {
            tracing::warn!(
                domain = %job.domain,
                attempts = job.attempt,
                %reason,
                "Dropping delivery after retry budget"
            );
            DELIVERIES_TOTAL.with_label_values(&["dropped"]).inc();
            return;
        }

        let delay = backoff_delay(job.attempt - 1);
        tracing::debug!(
            domain = %job.domain,
            attempt = job.attempt,
            delay_secs = delay.as_secs(),
            %reason,
            "Re-queueing delivery with backoff"
        );

        let retry_tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // a closed channel just means we are shutting down
            let _ = retry_tx.send(job).await;
        });
    }
}
