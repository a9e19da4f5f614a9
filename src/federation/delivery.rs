//! Delivery worker (C6).
//!
//! Pulls due tasks from the durable `delivery_tasks` queue and attempts
//! HTTP delivery with bounded concurrency, grounded on the teacher's
//! `ActivityDelivery::deliver_to_followers` (the `Semaphore`-bounded
//! parallel-dispatch shape is kept); the teacher's immediate fire-and-forget
//! `tokio::spawn` delivery is replaced with reservation from a durable queue
//! so a crash mid-delivery doesn't silently drop an activity.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::clock::Clock;
use crate::data::{DeliveryTask, Store};
use crate::error::AppError;
use crate::federation::signature;
use crate::metrics::{DELIVERY_ATTEMPTS_TOTAL, DELIVERY_QUEUE_DEPTH};

/// How many tasks a single poll reserves at once.
const BATCH_SIZE: i64 = 50;
/// Default bounded concurrency for in-flight HTTP deliveries.
const DEFAULT_CONCURRENCY: usize = 4;
/// Reservation lease: long enough to cover `HTTP_TIMEOUT` plus scheduling
/// jitter, short enough that a crashed worker's tasks become due again
/// quickly.
const RESERVATION_LEASE: Duration = Duration::from_secs(60);
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Poll interval when the queue was empty on the last pass.
const IDLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Delivered,
    PermanentFailure,
    TransientFailure,
}

pub struct DeliveryWorker {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    http_client: reqwest::Client,
    concurrency: usize,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<Self, AppError> {
        let http_client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| AppError::Internal(anyhow::anyhow!(e)))?;
        Ok(Self {
            store,
            clock,
            http_client,
            concurrency: DEFAULT_CONCURRENCY,
        })
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Runs forever, polling for due tasks and delivering them with bounded
    /// concurrency. Intended to be spawned as a background task at startup.
    pub async fn run(self) {
        let worker = Arc::new(self);
        loop {
            match worker.poll_and_deliver_once().await {
                Ok(0) => tokio::time::sleep(IDLE_POLL_INTERVAL).await,
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "delivery worker poll failed");
                    tokio::time::sleep(IDLE_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Reserves one batch of due tasks and delivers them concurrently.
    /// Returns the number of tasks processed, so `run` can skip the idle
    /// sleep when there's more work to do.
    async fn poll_and_deliver_once(self: &Arc<Self>) -> Result<usize, AppError> {
        let now = self.clock.now();
        let reserved_until = now + chrono::Duration::from_std(RESERVATION_LEASE).unwrap();
        let tasks = self
            .store
            .reserve_due_delivery_tasks(BATCH_SIZE, now, reserved_until)
            .await?;

        if tasks.is_empty() {
            return Ok(0);
        }

        DELIVERY_QUEUE_DEPTH.set(tasks.len() as i64);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::with_capacity(tasks.len());

        for task in tasks {
            let worker = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                worker.process_task(task).await;
            }));
        }

        let count = handles.len();
        for handle in handles {
            let _ = handle.await;
        }

        Ok(count)
    }

    async fn process_task(&self, task: DeliveryTask) {
        let outcome = self.attempt_delivery(&task).await;

        match outcome {
            Outcome::Delivered => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["success"]).inc();
                if let Err(e) = self.store.delete_delivery_task(task.id).await {
                    tracing::error!(error = %e, task_id = %task.id, "failed to delete delivered task");
                }
            }
            Outcome::PermanentFailure => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["permanent_failure"]).inc();
                tracing::warn!(task_id = %task.id, inbox = %task.target_inbox, "permanent delivery failure, dropping task");
                if let Err(e) = self.store.delete_delivery_task(task.id).await {
                    tracing::error!(error = %e, task_id = %task.id, "failed to delete permanently failed task");
                }
            }
            Outcome::TransientFailure => {
                DELIVERY_ATTEMPTS_TOTAL.with_label_values(&["transient_failure"]).inc();
                let attempt = task.attempt + 1;
                let now = self.clock.now();
                let next_attempt_at = now + chrono::Duration::seconds(crate::data::backoff_for_attempt(attempt));

                if next_attempt_at - task.created_at > chrono::Duration::hours(24) {
                    tracing::warn!(task_id = %task.id, inbox = %task.target_inbox, attempt, "delivery task older than 24h at next attempt, dropping");
                    if let Err(e) = self.store.delete_delivery_task(task.id).await {
                        tracing::error!(error = %e, task_id = %task.id, "failed to delete expired task");
                    }
                    return;
                }

                if let Err(e) = self
                    .store
                    .reschedule_delivery_task(
                        task.id,
                        attempt,
                        next_attempt_at,
                        "transient delivery failure",
                    )
                    .await
                {
                    tracing::error!(error = %e, task_id = %task.id, "failed to reschedule task");
                }
            }
        }
    }

    async fn attempt_delivery(&self, task: &DeliveryTask) -> Outcome {
        let signed = match signature::sign_request(
            "POST",
            &task.target_inbox,
            Some(&task.body_bytes),
            &task.private_key_pem,
            &task.key_id,
        ) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, task_id = %task.id, "failed to sign delivery request");
                return Outcome::PermanentFailure;
            }
        };

        let carried_headers: Vec<(String, String)> =
            serde_json::from_str(&task.headers_json).unwrap_or_default();

        let mut request = self
            .http_client
            .post(&task.target_inbox)
            .header("Date", &signed.date)
            .header("Signature", &signed.signature);

        for (name, value) in &carried_headers {
            request = request.header(name, value);
        }
        if let Some(digest) = &signed.digest {
            request = request.header("Digest", digest);
        }

        let response = match request.body(task.body_bytes.clone()).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Outcome::TransientFailure,
            Err(e) => {
                tracing::warn!(error = %e, inbox = %task.target_inbox, "delivery network error");
                return Outcome::TransientFailure;
            }
        };

        let status = response.status();
        if status.is_success() {
            return Outcome::Delivered;
        }
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            return Outcome::TransientFailure;
        }
        Outcome::PermanentFailure
    }
}

/// Spawns the delivery worker loop as a background task, returning its
/// `JoinHandle` so callers can track or abort it.
pub fn spawn(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Result<tokio::task::JoinHandle<()>, AppError> {
    let worker = DeliveryWorker::new(store, clock)?;
    Ok(tokio::spawn(worker.run()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_task(attempt: i64) -> DeliveryTask {
        DeliveryTask {
            id: Uuid::new_v4(),
            target_inbox: "https://peer.example/inbox".to_string(),
            body_bytes: b"{}".to_vec(),
            headers_json: serde_json::to_string(&vec![(
                "Content-Type".to_string(),
                "application/activity+json".to_string(),
            )])
            .unwrap(),
            key_id: "https://self.example/users/alice#main-key".to_string(),
            private_key_pem: String::new(),
            attempt,
            next_attempt_at: Utc::now(),
            last_error: None,
            created_at: Utc::now(),
            reserved_until: None,
        }
    }

    #[test]
    fn backoff_schedule_caps_at_24h() {
        let last = crate::data::backoff_for_attempt(crate::data::BACKOFF_SCHEDULE_SECS.len() as i64);
        assert_eq!(last, *crate::data::BACKOFF_SCHEDULE_SECS.last().unwrap());
        assert_eq!(last, 86_400);
    }

    #[test]
    fn carried_headers_round_trip() {
        let task = sample_task(0);
        let headers: Vec<(String, String)> = serde_json::from_str(&task.headers_json).unwrap();
        assert_eq!(headers[0].0, "Content-Type");
    }
}
