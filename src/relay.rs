//! Wires the poller, the push transport and the webhook queue together.
//!
//! The poller reports into an unbounded channel; a single dispatcher task
//! drains it, publishes every event to subscribed push connections and turns
//! status transitions into webhook deliveries for jobs that registered one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::RelayError;
use crate::events::{RelayEvent, resource_uri};
use crate::poller::JobPoller;
use crate::push::{ConnectionId, Connector, PushTransport};
use crate::replicate::{CreatePrediction, PredictionApi};
use crate::retry::{Retrier, RetryPolicy};
use crate::state_machine::{Job, JobStatus, StatusTransition};
use crate::webhook::{WebhookConfig, WebhookError, WebhookEvent, WebhookQueue, validate_webhook_config};

type Registrations = Arc<Mutex<HashMap<String, WebhookConfig>>>;
/// Final-payload tasks still fetching a prediction's result.
type Finalizers = Arc<Mutex<Vec<JoinHandle<()>>>>;

/// Webhook event type for a status, e.g. `prediction.succeeded`.
pub fn webhook_event_type(status: JobStatus) -> String {
    format!("prediction.{status}")
}

pub struct Relay<A, C> {
    api: Arc<A>,
    poller: JobPoller<A>,
    transport: Arc<PushTransport<C>>,
    webhooks: WebhookQueue,
    registrations: Registrations,
    stop: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    finalizers: Finalizers,
}

impl<A: PredictionApi, C: Connector> Relay<A, C> {
    /// Builds every component from `config` and starts the dispatcher.
    /// Must be called inside a tokio runtime.
    pub fn new(api: A, connector: C, config: &RelayConfig) -> Result<Self, RelayError> {
        let api = Arc::new(api);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poller = JobPoller::new(Arc::clone(&api), config.poller(), events_tx);
        let transport = Arc::new(PushTransport::new(connector, config.transport()));
        let webhooks = WebhookQueue::new(config.webhook_queue())?;
        let registrations: Registrations = Arc::new(Mutex::new(HashMap::new()));
        let stop = CancellationToken::new();
        let finalizers: Finalizers = Arc::new(Mutex::new(Vec::new()));

        let dispatcher = Dispatcher {
            api: Arc::clone(&api),
            transport: Arc::clone(&transport),
            webhooks: webhooks.clone(),
            registrations: Arc::clone(&registrations),
            fetch_policy: config.poller().fetch_policy,
            finalizers: Arc::clone(&finalizers),
        };
        let handle = tokio::spawn(dispatcher.run(events_rx, stop.clone()));

        Ok(Self {
            api,
            poller,
            transport,
            webhooks,
            registrations,
            stop,
            dispatcher: Mutex::new(Some(handle)),
            finalizers,
        })
    }

    /// Starts tracking an existing prediction. `Ok(false)` means it was
    /// already tracked (or recently finished) and nothing changed.
    pub fn track(&self, job_id: &str, webhook: Option<WebhookConfig>) -> Result<bool, RelayError> {
        self.track_from(job_id, JobStatus::Starting, webhook)
    }

    fn track_from(
        &self,
        job_id: &str,
        status: JobStatus,
        webhook: Option<WebhookConfig>,
    ) -> Result<bool, RelayError> {
        let Some(webhook) = webhook else {
            return Ok(self.poller.start_tracking_from(job_id, status));
        };
        let problems = validate_webhook_config(&webhook);
        if !problems.is_empty() {
            return Err(WebhookError::Validation(problems).into());
        }

        // Registered first so the earliest transition already sees it.
        let previous = lock(&self.registrations).insert(job_id.to_string(), webhook);
        let started = self.poller.start_tracking_from(job_id, status);
        if !started {
            let mut registrations = lock(&self.registrations);
            match previous {
                Some(previous) => registrations.insert(job_id.to_string(), previous),
                None => registrations.remove(job_id),
            };
        }
        Ok(started)
    }

    /// Creates a prediction and tracks it from the status the API reported.
    pub async fn submit(
        &self,
        request: &CreatePrediction,
        webhook: Option<WebhookConfig>,
    ) -> Result<Job, RelayError> {
        if let Some(webhook) = &webhook {
            let problems = validate_webhook_config(webhook);
            if !problems.is_empty() {
                return Err(WebhookError::Validation(problems).into());
            }
        }
        // Creation is not idempotent, so it is never retried.
        let job = self.api.create_prediction(request).await?;
        info!(job_id = %job.id, status = %job.status, "prediction created");
        self.track_from(&job.id, job.status, webhook)?;
        Ok(job)
    }

    /// Asks the API to cancel; the poller reports the resulting transition.
    pub async fn cancel(&self, job_id: &str) -> Result<Job, RelayError> {
        Ok(self.api.cancel_prediction(job_id).await?)
    }

    pub fn stop_tracking(&self, job_id: &str) -> bool {
        lock(&self.registrations).remove(job_id);
        self.poller.stop_tracking(job_id)
    }

    /// Opens a push connection and subscribes it to `job_ids`.
    pub async fn connect(&self, job_ids: &[&str]) -> Result<ConnectionId, RelayError> {
        let id = self.transport.connect().await?;
        for job_id in job_ids {
            self.transport.subscribe(&id, &resource_uri(job_id))?;
        }
        Ok(id)
    }

    pub fn transport(&self) -> &PushTransport<C> {
        &self.transport
    }

    pub fn webhooks(&self) -> &WebhookQueue {
        &self.webhooks
    }

    pub fn poller(&self) -> &JobPoller<A> {
        &self.poller
    }

    pub fn is_tracking(&self, job_id: &str) -> bool {
        self.poller.is_tracking(job_id)
    }

    pub fn last_known_status(&self, job_id: &str) -> Option<JobStatus> {
        self.poller.last_known_status(job_id)
    }

    /// The webhook registered for a job that has not finished yet.
    pub fn webhook_for(&self, job_id: &str) -> Option<WebhookConfig> {
        lock(&self.registrations).get(job_id).cloned()
    }

    /// Stops every polling task, flushes events already reported (final
    /// webhooks included), then closes all push connections. Webhook
    /// deliveries already queued keep running.
    pub async fn shutdown(&self) {
        self.poller.stop_all();
        self.stop.cancel();
        let handle = lock(&self.dispatcher).take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
        {
            warn!(error = %err, "dispatcher ended abnormally");
        }
        let finalizers: Vec<_> = lock(&self.finalizers).drain(..).collect();
        for task in finalizers {
            if let Err(err) = task.await {
                warn!(error = %err, "final webhook task ended abnormally");
            }
        }
        self.transport.disconnect().await;
        info!("relay shut down");
    }
}

impl<A, C> Drop for Relay<A, C> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Dispatcher<A, C> {
    api: Arc<A>,
    transport: Arc<PushTransport<C>>,
    webhooks: WebhookQueue,
    registrations: Registrations,
    fetch_policy: RetryPolicy,
    finalizers: Finalizers,
}

impl<A: PredictionApi, C: Connector> Dispatcher<A, C> {
    async fn run(self, mut events: mpsc::UnboundedReceiver<RelayEvent>, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = events.try_recv() {
                        self.dispatch(event);
                    }
                    break;
                }
            }
        }
        debug!("dispatcher finished");
    }

    /// Must not await: network I/O for a job goes into a spawned task so
    /// other jobs' events keep flowing.
    fn dispatch(&self, event: RelayEvent) {
        let delivered = self.transport.notify(&event);
        debug!(job_id = %event.job_id(), delivered, "event dispatched");

        let RelayEvent::Status(transition) = event else {
            return;
        };
        let webhook = {
            let mut registrations = lock(&self.registrations);
            if transition.to.is_terminal() {
                registrations.remove(&transition.job_id)
            } else {
                registrations.get(&transition.job_id).cloned()
            }
        };
        let Some(webhook) = webhook else {
            return;
        };

        if !transition.to.is_terminal() {
            let event = WebhookEvent::new(
                webhook_event_type(transition.to),
                transition_data(&transition),
            );
            enqueue(&self.webhooks, &webhook, event);
            return;
        }

        // The terminal event is the job's last, so enqueueing it later keeps
        // the per-job webhook order.
        let task = tokio::spawn(deliver_final(
            Arc::clone(&self.api),
            self.webhooks.clone(),
            webhook,
            transition,
            self.fetch_policy.clone(),
        ));
        let mut finalizers = lock(&self.finalizers);
        finalizers.retain(|task| !task.is_finished());
        finalizers.push(task);
    }
}

/// Queues the terminal webhook once the prediction's output and error are
/// known; the transition itself does not carry them.
async fn deliver_final<A: PredictionApi>(
    api: Arc<A>,
    webhooks: WebhookQueue,
    webhook: WebhookConfig,
    transition: StatusTransition,
    fetch_policy: RetryPolicy,
) {
    let mut data = transition_data(&transition);
    let retrier = Retrier::new(fetch_policy);
    match retrier
        .execute(|| api.get_prediction(&transition.job_id))
        .await
    {
        Ok(job) => {
            if let Value::Object(map) = &mut data {
                map.insert("output".into(), job.output.clone().unwrap_or(Value::Null));
                map.insert("error".into(), json!(job.error_message()));
                map.insert("completedAt".into(), json!(job.completed_at));
            }
        }
        Err(err) => {
            warn!(job_id = %transition.job_id, error = %err, "final snapshot unavailable, sending webhook without output");
        }
    }
    let event = WebhookEvent::new(webhook_event_type(transition.to), data);
    enqueue(&webhooks, &webhook, event);
}

fn transition_data(transition: &StatusTransition) -> Value {
    json!({
        "id": transition.job_id,
        "status": transition.to,
        "previousStatus": transition.from,
        "timestamp": transition.timestamp,
    })
}

fn enqueue(webhooks: &WebhookQueue, webhook: &WebhookConfig, event: WebhookEvent) {
    let event_type = event.event_type.clone();
    match webhooks.queue_webhook(webhook, event) {
        Ok(id) => debug!(delivery = %id, event = %event_type, "webhook queued"),
        Err(err) => warn!(event = %event_type, error = %err, "webhook rejected"),
    }
}
