//! Polls tracked predictions and turns status snapshots into [`RelayEvent`]s.
//!
//! Every tracked job gets its own task with its own cancellation token. The
//! task awaits each fetch before waiting for the next tick, so there is never
//! more than one request in flight per job; ticks missed while a slow fetch
//! was running are skipped rather than replayed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::RelayEvent;
use crate::replicate::PredictionApi;
use crate::retry::{Retrier, RetryPolicy};
use crate::state_machine::{Job, JobStatus, StatusTransition, estimate_progress};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// How long a terminal status stays queryable after tracking stopped.
    pub status_retention: Duration,
    pub fetch_policy: RetryPolicy,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            status_retention: Duration::from_secs(300),
            fetch_policy: RetryPolicy {
                max_attempts: 3,
                min_delay: Duration::from_millis(500),
                max_delay: Duration::from_millis(5000),
                backoff_factor: 2.0,
                jitter: true,
            },
        }
    }
}

#[derive(Debug)]
struct TrackedJob {
    status: JobStatus,
    /// `Some` while a polling task is running.
    cancel: Option<CancellationToken>,
    finished_at: Option<Instant>,
}

type JobTable = Arc<Mutex<HashMap<String, TrackedJob>>>;

/// Owns the last-known-status table; nothing else writes to it.
pub struct JobPoller<A> {
    api: Arc<A>,
    config: PollerConfig,
    jobs: JobTable,
    events: UnboundedSender<RelayEvent>,
}

impl<A: PredictionApi> JobPoller<A> {
    pub fn new(api: Arc<A>, config: PollerConfig, events: UnboundedSender<RelayEvent>) -> Self {
        Self {
            api,
            config,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Starts tracking a freshly created job, assumed to be `Starting`.
    pub fn start_tracking(&self, job_id: &str) -> bool {
        self.start_tracking_from(job_id, JobStatus::Starting)
    }

    /// Starts tracking with `status` as the baseline. Returns `false` when the
    /// job is already tracked or its terminal status is still retained.
    pub fn start_tracking_from(&self, job_id: &str, status: JobStatus) -> bool {
        let cancel = CancellationToken::new();
        {
            let mut jobs = self.table();
            prune_expired(&mut jobs, self.config.status_retention);
            if jobs.contains_key(job_id) {
                debug!(job_id, "already tracked");
                return false;
            }
            if status.is_terminal() {
                jobs.insert(
                    job_id.to_string(),
                    TrackedJob {
                        status,
                        cancel: None,
                        finished_at: Some(Instant::now()),
                    },
                );
                return false;
            }
            jobs.insert(
                job_id.to_string(),
                TrackedJob {
                    status,
                    cancel: Some(cancel.clone()),
                    finished_at: None,
                },
            );
        }

        info!(job_id, %status, "tracking started");
        tokio::spawn(poll_job(
            Arc::clone(&self.api),
            Arc::clone(&self.jobs),
            self.events.clone(),
            job_id.to_string(),
            self.config.clone(),
            cancel,
        ));
        true
    }

    /// Cancels the polling task for `job_id`, forgetting the job.
    pub fn stop_tracking(&self, job_id: &str) -> bool {
        match self.table().remove(job_id) {
            Some(job) => {
                if let Some(cancel) = job.cancel {
                    cancel.cancel();
                }
                true
            }
            None => false,
        }
    }

    /// Cancels every polling task. Retained terminal statuses stay queryable.
    pub fn stop_all(&self) {
        self.table().retain(|_, job| match job.cancel.take() {
            Some(cancel) => {
                cancel.cancel();
                false
            }
            None => true,
        });
    }

    pub fn is_tracking(&self, job_id: &str) -> bool {
        self.table()
            .get(job_id)
            .is_some_and(|job| job.cancel.is_some())
    }

    pub fn last_known_status(&self, job_id: &str) -> Option<JobStatus> {
        let mut jobs = self.table();
        prune_expired(&mut jobs, self.config.status_retention);
        jobs.get(job_id).map(|job| job.status)
    }

    /// Number of jobs with a running polling task.
    pub fn active_count(&self) -> usize {
        self.table().values().filter(|job| job.cancel.is_some()).count()
    }

    fn table(&self) -> MutexGuard<'_, HashMap<String, TrackedJob>> {
        lock(&self.jobs)
    }
}

impl<A> Drop for JobPoller<A> {
    fn drop(&mut self) {
        for job in lock(&self.jobs).values() {
            if let Some(cancel) = &job.cancel {
                cancel.cancel();
            }
        }
    }
}

fn lock(jobs: &JobTable) -> MutexGuard<'_, HashMap<String, TrackedJob>> {
    jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn prune_expired(jobs: &mut HashMap<String, TrackedJob>, retention: Duration) {
    jobs.retain(|_, job| match job.finished_at {
        Some(at) => at.elapsed() < retention,
        None => true,
    });
}

async fn poll_job<A: PredictionApi>(
    api: Arc<A>,
    jobs: JobTable,
    events: UnboundedSender<RelayEvent>,
    job_id: String,
    config: PollerConfig,
    cancel: CancellationToken,
) {
    let retrier = Retrier::new(config.fetch_policy.clone());
    let mut ticker = tokio::time::interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break,
            result = retrier.execute(|| api.get_prediction(&job_id)) => result,
        };

        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(job_id = %job_id, error = %err, "status fetch failed, retrying next tick");
                continue;
            }
        };

        if observe(&jobs, &events, &snapshot) {
            break;
        }
    }
    debug!(job_id = %job_id, "polling task finished");
}

/// Applies one snapshot to the table and emits what changed. Returns `true`
/// when polling for this job must stop.
fn observe(jobs: &JobTable, events: &UnboundedSender<RelayEvent>, snapshot: &Job) -> bool {
    let transition = {
        let mut table = lock(jobs);
        let Some(entry) = table.get_mut(&snapshot.id) else {
            return true;
        };
        let Some(transition) = StatusTransition::detect(entry.status, snapshot) else {
            return false;
        };
        entry.status = transition.to;
        if transition.to.is_terminal() {
            entry.cancel = None;
            entry.finished_at = Some(Instant::now());
        }
        transition
    };

    info!(job_id = %transition.job_id, from = %transition.from, to = %transition.to, "status changed");
    let to = transition.to;
    let timestamp = transition.timestamp;
    emit(events, RelayEvent::Status(transition));

    if to == JobStatus::Processing {
        emit(
            events,
            RelayEvent::Progress {
                job_id: snapshot.id.clone(),
                status: to,
                progress: estimate_progress(snapshot),
                timestamp,
            },
        );
    }

    if to == JobStatus::Failed
        && let Some(error) = snapshot.error_message()
    {
        emit(
            events,
            RelayEvent::Failed {
                job_id: snapshot.id.clone(),
                error,
                timestamp,
            },
        );
    }

    to.is_terminal()
}

fn emit(events: &UnboundedSender<RelayEvent>, event: RelayEvent) {
    if events.send(event).is_err() {
        debug!("event receiver dropped");
    }
}
