//! Pending webhook deliveries and the single worker that drains them.
//!
//! Each delivery has at most one attempt in flight; different deliveries are
//! attempted concurrently. Failed attempts are rescheduled with capped
//! exponential backoff until the target's retry budget runs out.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rand::Rng;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{DeliveryTarget, WebhookConfig, WebhookEvent};
use super::error::WebhookError;
use super::signature::{SIGNATURE_PREFIX, generate_signature};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random delay added to each retry.
    pub max_jitter: Duration,
    /// Attempts remembered per delivery.
    pub history_limit: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(1000),
            history_limit: 10,
        }
    }
}

impl QueueConfig {
    /// `min(max_delay, base_delay * 2^retry_count)` plus jitter.
    pub fn retry_delay(&self, retry_count: u32) -> Duration {
        let backoff = RetryPolicy {
            max_attempts: 1,
            min_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: 2.0,
            jitter: false,
        };
        let delay = backoff.delay_for_attempt(retry_count);
        let spread = self.max_jitter.as_millis() as u64;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::rng().random_range(0..spread))
    }
}

/// The outcome of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct QueuedDelivery {
    id: String,
    target: DeliveryTarget,
    event: WebhookEvent,
    retry_count: u32,
    next_attempt_at: Option<Instant>,
}

impl QueuedDelivery {
    fn is_due(&self, now: Instant) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

struct Shared {
    client: Client,
    config: QueueConfig,
    pending: Mutex<HashMap<String, QueuedDelivery>>,
    results: Mutex<HashMap<String, VecDeque<DeliveryResult>>>,
    running: AtomicBool,
    wake: Notify,
    pending_count: watch::Sender<usize>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, QueuedDelivery>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn results(&self) -> MutexGuard<'_, HashMap<String, VecDeque<DeliveryResult>>> {
        self.results.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish_count(&self, count: usize) {
        self.pending_count.send_replace(count);
    }

    fn record(&self, id: &str, result: DeliveryResult) {
        let mut results = self.results();
        let history = results.entry(id.to_string()).or_default();
        history.push_back(result);
        while history.len() > self.config.history_limit {
            history.pop_front();
        }
    }
}

/// Cheap to clone; clones share the same queue and worker.
#[derive(Clone)]
pub struct WebhookQueue {
    shared: Arc<Shared>,
}

impl WebhookQueue {
    pub fn new(config: QueueConfig) -> Result<Self, WebhookError> {
        // Timeouts are per delivery target, set on each request.
        let client = Client::builder().build()?;
        let (pending_count, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(Shared {
                client,
                config,
                pending: Mutex::new(HashMap::new()),
                results: Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                wake: Notify::new(),
                pending_count,
            }),
        })
    }

    /// Enqueues `event` for delivery and returns its id without waiting for
    /// the first attempt.
    pub fn queue_webhook(
        &self,
        config: &WebhookConfig,
        event: WebhookEvent,
    ) -> Result<String, WebhookError> {
        let target = config.resolve()?;
        let id = Uuid::new_v4().to_string();
        debug!(delivery = %id, url = %target.url, event = %event.event_type, "queued webhook");

        let count = {
            let mut pending = self.shared.pending();
            pending.insert(
                id.clone(),
                QueuedDelivery {
                    id: id.clone(),
                    target,
                    event,
                    retry_count: 0,
                    next_attempt_at: None,
                },
            );
            pending.len()
        };
        self.shared.publish_count(count);
        self.ensure_worker();
        Ok(id)
    }

    /// Recorded attempts for a delivery, oldest first. Kept after the delivery
    /// leaves the queue.
    pub fn delivery_results(&self, delivery_id: &str) -> Vec<DeliveryResult> {
        self.shared
            .results()
            .get(delivery_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_pending(&self, delivery_id: &str) -> bool {
        self.shared.pending().contains_key(delivery_id)
    }

    /// Ids of deliveries still waiting for a successful attempt, sorted.
    pub fn pending_deliveries(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.pending().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Resolves once no delivery is pending.
    pub async fn drained(&self) {
        let mut count = self.shared.pending_count.subscribe();
        // The sender lives in `self`, so this cannot fail.
        let _ = count.wait_for(|n| *n == 0).await;
    }

    fn ensure_worker(&self) {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            tokio::spawn(process(Arc::clone(&self.shared)));
        } else {
            self.shared.wake.notify_one();
        }
    }
}

impl std::fmt::Debug for WebhookQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookQueue")
            .field("pending", &self.shared.pending().len())
            .field("running", &self.shared.running.load(Ordering::SeqCst))
            .finish()
    }
}

async fn process(shared: Arc<Shared>) {
    debug!("webhook worker started");
    loop {
        let now = Instant::now();
        let (due, next_wake) = {
            let pending = shared.pending();
            let due: Vec<QueuedDelivery> = pending
                .values()
                .filter(|d| d.is_due(now))
                .cloned()
                .collect();
            let next_wake = pending
                .values()
                .filter_map(|d| d.next_attempt_at)
                .filter(|at| *at > now)
                .min();
            (due, next_wake)
        };

        if !due.is_empty() {
            join_all(due.into_iter().map(|d| attempt(&shared, d))).await;
            continue;
        }

        let Some(wake_at) = next_wake else {
            shared.running.store(false, Ordering::SeqCst);
            // A delivery queued after the emptiness check saw the flag still
            // set and did not spawn a worker; pick it up here.
            if shared.pending().is_empty()
                || shared
                    .running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
            {
                debug!("webhook worker idle");
                return;
            }
            continue;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = shared.wake.notified() => {}
        }
    }
}

async fn attempt(shared: &Shared, delivery: QueuedDelivery) {
    let outcome = deliver(&shared.client, &delivery).await;
    let result = match &outcome {
        Ok(status) => DeliveryResult {
            success: true,
            status_code: Some(*status),
            error: None,
            retry_count: delivery.retry_count,
            timestamp: Utc::now(),
        },
        Err(err) => DeliveryResult {
            success: false,
            status_code: err.status_code(),
            error: Some(err.to_string()),
            retry_count: delivery.retry_count,
            timestamp: Utc::now(),
        },
    };
    shared.record(&delivery.id, result);

    let count = {
        let mut pending = shared.pending();
        match outcome {
            Ok(status) => {
                info!(delivery = %delivery.id, status, "webhook delivered");
                pending.remove(&delivery.id);
            }
            Err(err) if delivery.retry_count + 1 > delivery.target.max_retries => {
                warn!(
                    delivery = %delivery.id,
                    attempts = delivery.retry_count + 1,
                    error = %err,
                    "dropping webhook after exhausting retries"
                );
                pending.remove(&delivery.id);
            }
            Err(err) => {
                let delay = shared.config.retry_delay(delivery.retry_count);
                debug!(
                    delivery = %delivery.id,
                    retry = delivery.retry_count + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "webhook attempt failed, rescheduling"
                );
                if let Some(entry) = pending.get_mut(&delivery.id) {
                    entry.retry_count = delivery.retry_count + 1;
                    entry.next_attempt_at = Some(Instant::now() + delay);
                }
            }
        }
        pending.len()
    };
    shared.publish_count(count);
}

async fn deliver(client: &Client, delivery: &QueuedDelivery) -> Result<u16, WebhookError> {
    let body = serde_json::to_vec(&delivery.event)?;
    let target = &delivery.target;

    let mut request = client
        .post(target.url.clone())
        .header(CONTENT_TYPE, "application/json")
        .header("X-Webhook-Id", &delivery.id)
        .header("X-Event-Type", &delivery.event.event_type)
        .header("X-Timestamp", delivery.event.timestamp.to_rfc3339())
        .timeout(target.timeout);
    if let Some(secret) = &target.secret {
        let signature = generate_signature(&body, secret)?;
        request = request.header("X-Signature", format!("{SIGNATURE_PREFIX}{signature}"));
    }

    let response = request.body(body).send().await.map_err(|err| {
        if err.is_timeout() {
            WebhookError::Timeout(target.timeout)
        } else {
            WebhookError::Http(err)
        }
    })?;

    let status = response.status();
    if status.is_success() {
        Ok(status.as_u16())
    } else {
        Err(WebhookError::Status(status.as_u16()))
    }
}
