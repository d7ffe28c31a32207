//! Job submission and the worker pool that drains it.
//!
//! Jobs due now go straight onto a bounded channel. Jobs due later get a timer
//! task that sleeps until the due instant and only then enqueues, so a waiting
//! job never holds a worker. Workers share one receiver.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;

use crate::error::MailError;
use crate::mail::Mail;
use crate::worker::{DeliveryWorker, JobOutcome};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKERS: usize = 4;
/// Default capacity of the ready-job queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// One delivery attempt for one mail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryJob {
    pub id: Ulid,
    pub mail_id: i64,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the job becomes due.
    pub run_at: DateTime<Utc>,
}

/// Receipt for a submitted job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_id: Ulid,
    pub mail_id: i64,
    pub attempt: u32,
    pub run_at: DateTime<Utc>,
    timer: Option<CancellationToken>,
}

impl JobHandle {
    /// Whether the job is waiting on a timer rather than sitting in the queue.
    pub fn is_delayed(&self) -> bool {
        self.timer.is_some()
    }

    /// Stop a job that has not fired yet. Returns `false` for jobs that were
    /// already queued; those are dropped by the worker if their mail is gone.
    pub fn cancel(&self) -> bool {
        match &self.timer {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

/// Pool sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Counters for pool monitoring.
#[derive(Debug, Default)]
pub struct PoolStats {
    sent: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub sent: u64,
    pub retried: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl PoolStats {
    fn record(&self, outcome: &JobOutcome) {
        let counter = match outcome {
            JobOutcome::Sent { .. } => &self.sent,
            JobOutcome::RetryScheduled { .. } => &self.retried,
            JobOutcome::Failed { .. } => &self.failed,
            JobOutcome::Skipped => &self.skipped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Submits delivery jobs. Cheap to clone.
///
/// Does not deduplicate: scheduling the same mail twice queues two jobs.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::Sender<DeliveryJob>,
    runtime: Handle,
    shutdown: CancellationToken,
}

impl Dispatcher {
    /// Submit the first attempt for `mail`, now or at its scheduled time.
    pub fn schedule(&self, mail: &Mail) -> Result<JobHandle, MailError> {
        let now = Utc::now();
        let run_at = match mail.scheduled_time {
            Some(at) if !mail.is_due(now) => at,
            _ => now,
        };
        let job = DeliveryJob {
            id: Ulid::new(),
            mail_id: mail.id,
            attempt: 1,
            run_at,
        };
        let delay = (run_at - now).to_std().ok().filter(|d| !d.is_zero());
        self.submit(job, delay)
    }

    /// Submit attempt number `attempt` of `job`'s mail after `delay`.
    ///
    /// Retries always go through a timer task, even with a zero delay, so a
    /// full queue makes the retry wait for room instead of dropping it.
    pub fn retry(
        &self,
        job: &DeliveryJob,
        attempt: u32,
        delay: Duration,
    ) -> Result<JobHandle, MailError> {
        let run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| Utc::now().checked_add_signed(d))
            .unwrap_or_else(Utc::now);
        let next = DeliveryJob {
            id: Ulid::new(),
            mail_id: job.mail_id,
            attempt,
            run_at,
        };
        self.submit(next, Some(delay))
    }

    fn submit(&self, job: DeliveryJob, delay: Option<Duration>) -> Result<JobHandle, MailError> {
        if self.shutdown.is_cancelled() || self.tx.is_closed() {
            return Err(MailError::Dispatch("delivery queue is shut down".into()));
        }

        let mut handle = JobHandle {
            job_id: job.id,
            mail_id: job.mail_id,
            attempt: job.attempt,
            run_at: job.run_at,
            timer: None,
        };

        match delay {
            None => {
                self.tx.try_send(job).map_err(|e| match e {
                    mpsc::error::TrySendError::Full(_) => {
                        MailError::Dispatch("delivery queue is full".into())
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        MailError::Dispatch("delivery queue is shut down".into())
                    }
                })?;
                tracing::debug!(mail_id = handle.mail_id, attempt = handle.attempt, "Job queued");
            }
            Some(delay) => {
                let token = self.shutdown.child_token();
                let tx = self.tx.clone();
                let timer = token.clone();
                self.runtime.spawn(async move {
                    tokio::select! {
                        _ = timer.cancelled() => {
                            tracing::debug!(mail_id = job.mail_id, "Scheduled job cancelled");
                        }
                        _ = tokio::time::sleep(delay) => {
                            if tx.send(job).await.is_err() {
                                tracing::warn!("Delivery queue closed before scheduled job fired");
                            }
                        }
                    }
                });
                tracing::debug!(
                    mail_id = handle.mail_id,
                    attempt = handle.attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job scheduled"
                );
                handle.timer = Some(token);
            }
        }
        Ok(handle)
    }
}

/// A running set of delivery workers.
pub struct DeliveryPool {
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
}

impl DeliveryPool {
    /// Spawn `config.workers` workers on the current Tokio runtime.
    pub fn start(config: PoolConfig, worker: DeliveryWorker) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let shutdown = CancellationToken::new();
        let stats = Arc::new(PoolStats::default());
        let worker = Arc::new(worker);

        let dispatcher = Dispatcher {
            tx,
            runtime: Handle::current(),
            shutdown: shutdown.clone(),
        };

        let count = config.workers.max(1);
        tracing::info!(workers = count, queue_capacity = config.queue_capacity, "Starting delivery pool");

        let workers = (0..count)
            .map(|id| {
                tokio::spawn(worker_loop(
                    id,
                    rx.clone(),
                    worker.clone(),
                    dispatcher.clone(),
                    shutdown.clone(),
                    stats.clone(),
                ))
            })
            .collect();

        Self {
            dispatcher,
            shutdown,
            workers,
            stats,
        }
    }

    /// Handle for submitting jobs.
    pub fn dispatcher(&self) -> Dispatcher {
        self.dispatcher.clone()
    }

    /// Outcome counters since startup.
    pub fn stats(&self) -> PoolSnapshot {
        self.stats.snapshot()
    }

    /// Stop accepting jobs, cancel pending timers and wait for workers to
    /// finish their current attempt.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down delivery pool");
        self.shutdown.cancel();
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Delivery worker panicked");
            }
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<DeliveryJob>>>,
    worker: Arc<DeliveryWorker>,
    dispatcher: Dispatcher,
    shutdown: CancellationToken,
    stats: Arc<PoolStats>,
) {
    tracing::debug!(worker = id, "Delivery worker started");
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = async { rx.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        let mut outcome = worker.run(&job).await;
        if let JobOutcome::RetryScheduled { attempt, delay } = outcome {
            if let Err(e) = dispatcher.retry(&job, attempt, delay) {
                tracing::error!(error = %e, mail_id = job.mail_id, attempt, "Could not schedule retry");
                outcome = worker
                    .abandon(&job, format!("retry could not be queued: {}", e))
                    .await;
            }
        }
        stats.record(&outcome);
    }
    tracing::debug!(worker = id, "Delivery worker stopped");
}

#[cfg(all(test, feature = "local"))]
mod tests {
    use super::*;
    use crate::compose::Composer;
    use crate::identifier::PublicKey;
    use crate::mail::NewMail;
    use crate::providers::LocalMailer;
    use crate::storage::{MailStore, MemoryStore};
    use crate::email::Email;
    use crate::error::DeliveryError;
    use crate::mail::MailStatus;
    use crate::mailer::{DeliveryResult, Mailer};
    use crate::worker::RetryPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// Holds the first delivery until released, then fails it transiently.
    #[derive(Default)]
    struct GateMailer {
        calls: AtomicUsize,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Mailer for GateMailer {
        async fn deliver(&self, _email: &Email) -> Result<DeliveryResult, DeliveryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                self.entered.notify_one();
                self.release.notified().await;
                return Err(DeliveryError::Transient("421 try again".into()));
            }
            Ok(DeliveryResult::new(format!("gate-{}", n)))
        }
    }

    async fn wait_until_final(store: &MemoryStore, id: i64) -> MailStatus {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let status = store.mail(id).await.unwrap().unwrap().status;
                if status.is_final() {
                    return status;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    async fn mail(store: &MemoryStore, key: &str, at: Option<DateTime<Utc>>) -> Mail {
        store
            .insert_mail(NewMail {
                public_key: PublicKey::new(key),
                subject: "Hi".into(),
                body: "b".into(),
                recipient: "a@b.com".into(),
                scheduled_time: at,
                tags: vec![],
                carbon_copies: vec![],
                attachment_ids: vec![],
                trackers: vec![],
            })
            .await
            .unwrap()
    }

    fn pool(store: Arc<MemoryStore>, mailer: &LocalMailer) -> DeliveryPool {
        let worker = DeliveryWorker::new(
            store,
            Arc::new(mailer.clone()),
            Composer::new().from("noreply@example.com"),
        );
        DeliveryPool::start(PoolConfig::default(), worker)
    }

    #[tokio::test(start_paused = true)]
    async fn test_future_job_waits_for_timer() {
        let store = Arc::new(MemoryStore::new());
        let mailer = LocalMailer::new();
        let pool = pool(store.clone(), &mailer);

        let later = mail(&store, "k1", Some(Utc::now() + chrono::Duration::seconds(60))).await;
        let handle = pool.dispatcher().schedule(&later).unwrap();
        assert!(handle.is_delayed());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mailer.attempts(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(mailer.email_count(), 1);
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let store = Arc::new(MemoryStore::new());
        let mailer = LocalMailer::new();
        let pool = pool(store.clone(), &mailer);

        let later = mail(&store, "k1", Some(Utc::now() + chrono::Duration::seconds(5))).await;
        let handle = pool.dispatcher().schedule(&later).unwrap();
        assert!(handle.cancel());
        assert!(!handle.cancel());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(mailer.attempts(), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_schedule_after_shutdown_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let mailer = LocalMailer::new();
        let pool = pool(store.clone(), &mailer);
        let dispatcher = pool.dispatcher();
        pool.shutdown().await;

        let now = mail(&store, "k1", None).await;
        assert!(matches!(dispatcher.schedule(&now), Err(MailError::Dispatch(_))));
    }

    #[tokio::test]
    async fn test_immediate_retry_waits_for_room_in_full_queue() {
        let store = Arc::new(MemoryStore::new());
        let mailer = Arc::new(GateMailer::default());
        let worker = DeliveryWorker::new(
            store.clone(),
            mailer.clone(),
            Composer::new().from("noreply@example.com"),
        )
        .retry_policy(RetryPolicy {
            max_attempts: 5,
            delay: Duration::ZERO,
        });
        let pool = DeliveryPool::start(
            PoolConfig {
                workers: 1,
                queue_capacity: 1,
            },
            worker,
        );
        let dispatcher = pool.dispatcher();

        let first = mail(&store, "k1", None).await;
        dispatcher.schedule(&first).unwrap();
        mailer.entered.notified().await;

        // The only worker is busy; this fills the queue.
        let second = mail(&store, "k2", None).await;
        dispatcher.schedule(&second).unwrap();
        mailer.release.notify_one();

        assert_eq!(wait_until_final(&store, first.id).await, MailStatus::Sent);
        assert_eq!(wait_until_final(&store, second.id).await, MailStatus::Sent);
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            pool.stats(),
            PoolSnapshot {
                sent: 2,
                retried: 1,
                failed: 0,
                skipped: 0
            }
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_after_shutdown_is_an_error() {
        let store = Arc::new(MemoryStore::new());
        let mailer = LocalMailer::new();
        let pool = pool(store.clone(), &mailer);
        let dispatcher = pool.dispatcher();
        pool.shutdown().await;

        let job = DeliveryJob {
            id: Ulid::new(),
            mail_id: 1,
            attempt: 1,
            run_at: Utc::now(),
        };
        assert!(matches!(
            dispatcher.retry(&job, 2, Duration::ZERO),
            Err(MailError::Dispatch(_))
        ));
    }

    #[tokio::test]
    async fn test_past_schedule_runs_immediately() {
        let store = Arc::new(MemoryStore::new());
        let mailer = LocalMailer::new();
        let pool = pool(store.clone(), &mailer);

        let past = mail(&store, "k1", Some(Utc::now() - chrono::Duration::hours(1))).await;
        let handle = pool.dispatcher().schedule(&past).unwrap();
        assert!(!handle.is_delayed());
        pool.shutdown().await;
    }
}
