//! Worker runtime: the poll loop and the sweep loop side by side, stopped
//! together by a broadcast shutdown signal.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use keel_core::WorkerId;
use keel_store::Repositories;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::dispatch::DriverRegistry;
use crate::error::{Error, Result};
use crate::poller::{OutboxPoller, PollerStats};
use crate::reconcile::{Finalizer, Reconciler};
use crate::retry::RetryPolicy;
use crate::sweeper::{DriftSweeper, SweeperStats};

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM signal received
    Sigterm,
    /// SIGINT signal received (Ctrl+C)
    Sigint,
    /// Programmatic shutdown requested
    Programmatic,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sigterm => write!(f, "SIGTERM"),
            Self::Sigint => write!(f, "SIGINT"),
            Self::Programmatic => write!(f, "PROGRAMMATIC"),
        }
    }
}

/// Cloneable trigger for stopping a running [`Worker`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<ShutdownSignal>,
    initiated: Arc<AtomicBool>,
}

impl ShutdownHandle {
    fn new() -> Self {
        let (tx, _) = broadcast::channel(16);
        Self {
            tx,
            initiated: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.tx.subscribe()
    }

    /// Check if shutdown has been initiated
    pub fn is_shutdown_initiated(&self) -> bool {
        self.initiated.load(Ordering::Acquire)
    }

    /// Ask both loops to stop after their in-flight iteration. Duplicate
    /// signals are ignored.
    pub fn initiate(&self, signal: ShutdownSignal) {
        if self
            .initiated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            info!("Shutdown already in progress, ignoring duplicate signal");
            return;
        }

        info!(signal = %signal, subscribers = self.tx.receiver_count(), "Initiating graceful shutdown");
        if let Err(e) = self.tx.send(signal) {
            debug!("No active subscribers for shutdown signal: {}", e);
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub worker_id: WorkerId,
    pub poll_interval: Duration,
    /// Events drained per poll tick at most.
    pub max_events_per_tick: usize,
    /// Run the drift sweeper on this worker. Exactly one replica should.
    pub sweep_enabled: bool,
    pub sweep_interval: Duration,
    pub sweep_batch_size: usize,
    pub driver_timeout: Option<Duration>,
    pub retry: RetryPolicy,
}

impl WorkerConfig {
    #[must_use]
    pub fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            poll_interval: Duration::from_millis(500),
            max_events_per_tick: 16,
            sweep_enabled: true,
            sweep_interval: Duration::from_secs(5),
            sweep_batch_size: 200,
            driver_timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
        }
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_max_events_per_tick(mut self, max: usize) -> Self {
        self.max_events_per_tick = max;
        self
    }

    #[must_use]
    pub const fn with_sweep(mut self, enabled: bool, interval: Duration, batch_size: usize) -> Self {
        self.sweep_enabled = enabled;
        self.sweep_interval = interval;
        self.sweep_batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_driver_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.driver_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Reject settings the loops cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad setting.
    pub fn validate(&self) -> Result<()> {
        if self.worker_id.as_str().is_empty() {
            return Err(Error::invalid_config("worker id must not be empty"));
        }
        if self.poll_interval.is_zero() {
            return Err(Error::invalid_config("poll interval must be positive"));
        }
        if self.max_events_per_tick == 0 {
            return Err(Error::invalid_config("max events per tick must be positive"));
        }
        if self.sweep_interval.is_zero() {
            return Err(Error::invalid_config("sweep interval must be positive"));
        }
        if self.sweep_batch_size == 0 {
            return Err(Error::invalid_config("sweep batch size must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(Error::invalid_config("retry multiplier must be at least 1"));
        }
        if self.retry.max_attempts == Some(0) {
            return Err(Error::invalid_config("retry max attempts must be positive"));
        }
        Ok(())
    }

    /// Whether a driver call can outlive the outbox `lease`, letting another
    /// worker claim the same event mid-attempt.
    #[must_use]
    pub fn lease_may_expire_mid_attempt(&self, lease: Duration) -> bool {
        self.driver_timeout.is_none_or(|timeout| timeout >= lease)
    }
}

/// Totals returned by [`Worker::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub poller: PollerStats,
    /// `None` when the sweeper was disabled.
    pub sweeper: Option<SweeperStats>,
}

/// One reconciliation worker process.
///
/// Shutdown receivers are subscribed at construction, so a signal sent
/// before [`Worker::run`] still stops both loops.
#[derive(Debug)]
pub struct Worker {
    config: WorkerConfig,
    poller: OutboxPoller,
    sweeper: DriftSweeper,
    shutdown: ShutdownHandle,
    poll_rx: broadcast::Receiver<ShutdownSignal>,
    sweep_rx: broadcast::Receiver<ShutdownSignal>,
}

impl Worker {
    /// Build a worker from validated configuration. The lease is the one the
    /// outbox in `repos` claims with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration or the outbox
    /// lease is invalid.
    pub fn new(
        config: WorkerConfig,
        registry: Arc<DriverRegistry>,
        repos: Repositories,
    ) -> Result<Self> {
        Self::with_finalizer(config, registry, repos, None)
    }

    /// Like [`Worker::new`] with a custom finalizer hook.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the configuration is invalid.
    pub fn with_finalizer(
        config: WorkerConfig,
        registry: Arc<DriverRegistry>,
        repos: Repositories,
        finalizer: Option<Arc<dyn Finalizer>>,
    ) -> Result<Self> {
        config.validate()?;
        let lease = repos.outbox.lease();
        if lease.is_zero() {
            return Err(Error::invalid_config("outbox lease must be positive"));
        }
        if config.lease_may_expire_mid_attempt(lease) {
            warn!(
                lease_ms = lease.as_millis(),
                driver_timeout = ?config.driver_timeout,
                "Driver timeout is not shorter than the outbox lease; events may be processed twice"
            );
        }

        let mut reconciler =
            Reconciler::new(registry, repos).with_driver_timeout(config.driver_timeout);
        if let Some(finalizer) = finalizer {
            reconciler = reconciler.with_finalizer(finalizer);
        }

        let poller = OutboxPoller::new(config.worker_id.clone(), reconciler.clone())
            .with_retry_policy(config.retry.clone())
            .with_max_events_per_tick(config.max_events_per_tick);
        let sweeper =
            DriftSweeper::new(config.worker_id.clone(), reconciler, config.sweep_batch_size);

        let shutdown = ShutdownHandle::new();
        Ok(Self {
            config,
            poller,
            sweeper,
            poll_rx: shutdown.subscribe(),
            sweep_rx: shutdown.subscribe(),
            shutdown,
        })
    }

    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Handle for stopping [`Worker::run`].
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run both loops until shutdown is initiated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskFailed`] if a loop task panicked or was
    /// cancelled. The other loop is stopped before returning.
    pub async fn run(self) -> Result<WorkerStats> {
        info!(
            worker_id = %self.config.worker_id,
            sweep_enabled = self.config.sweep_enabled,
            "Worker starting"
        );

        let poll_rx = self.poll_rx;
        let poll_interval = self.config.poll_interval;
        let poller = self.poller;
        let poll_task = tokio::spawn(async move { poller.run(poll_interval, poll_rx).await });

        let sweep_rx = self.sweep_rx;
        let sweep_task = self.config.sweep_enabled.then(|| {
            let sweep_interval = self.config.sweep_interval;
            let sweeper = self.sweeper;
            tokio::spawn(async move { sweeper.run(sweep_interval, sweep_rx).await })
        });

        let poller = match poll_task.await {
            Ok(stats) => stats,
            Err(e) => {
                error!(worker_id = %self.config.worker_id, error = %e, "Outbox poller task failed");
                if let Some(task) = sweep_task {
                    task.abort();
                    // Cancellation is the expected outcome here.
                    let _ = task.await;
                }
                return Err(Error::task_failed(format!("outbox poller: {e}")));
            }
        };
        let sweeper = match sweep_task {
            Some(task) => Some(
                task.await
                    .map_err(|e| Error::task_failed(format!("drift sweeper: {e}")))?,
            ),
            None => None,
        };

        info!(
            worker_id = %self.config.worker_id,
            reconciled = poller.reconciled,
            failed = poller.failed,
            "Worker stopped"
        );

        Ok(WorkerStats { poller, sweeper })
    }
}

/// Install OS signal handlers (SIGTERM, SIGINT) that initiate shutdown.
pub fn install_signal_handlers(handle: ShutdownHandle) -> tokio::task::JoinHandle<()> {
    info!("Installing OS signal handlers");

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    return;
                }
            };
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "Failed to install SIGINT handler");
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => handle.initiate(ShutdownSignal::Sigterm),
                _ = sigint.recv() => handle.initiate(ShutdownSignal::Sigint),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            handle.initiate(ShutdownSignal::Sigint);
        }
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use keel_core::{EventId, OutboxEvent};
    use keel_store::{
        CacheConfig, InMemoryBackend, InMemoryOutbox, OutboxConfig, OutboxQueue,
        PersistenceResult,
    };

    use super::*;
    use crate::sim::SimulatedInfrastructure;

    /// Outbox whose claim panics, taking the poller task down with it.
    struct BrokenOutbox(Arc<InMemoryOutbox>);

    #[async_trait]
    impl OutboxQueue for BrokenOutbox {
        fn lease(&self) -> Duration {
            self.0.lease()
        }

        async fn enqueue(&self, event: OutboxEvent) -> PersistenceResult<OutboxEvent> {
            self.0.enqueue(event).await
        }

        async fn claim_next(&self, _worker: &WorkerId) -> PersistenceResult<Option<OutboxEvent>> {
            panic!("outbox claim exploded");
        }

        async fn mark_done(&self, event_id: &EventId) -> PersistenceResult<OutboxEvent> {
            self.0.mark_done(event_id).await
        }

        async fn mark_failed(
            &self,
            event_id: &EventId,
            error: &str,
        ) -> PersistenceResult<OutboxEvent> {
            self.0.mark_failed(event_id, error).await
        }

        async fn mark_failed_until(
            &self,
            event_id: &EventId,
            error: &str,
            retry_at: DateTime<Utc>,
        ) -> PersistenceResult<OutboxEvent> {
            self.0.mark_failed_until(event_id, error, retry_at).await
        }

        async fn dead_letter(
            &self,
            event_id: &EventId,
            error: &str,
        ) -> PersistenceResult<OutboxEvent> {
            self.0.dead_letter(event_id, error).await
        }

        async fn get(&self, event_id: &EventId) -> PersistenceResult<Option<OutboxEvent>> {
            self.0.get(event_id).await
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::new(WorkerId::from("w-test"))
    }

    fn registry() -> Arc<DriverRegistry> {
        Arc::new(Arc::new(SimulatedInfrastructure::new()).registry())
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = config();
        assert!(config.validate().is_ok());
        assert!(!config.lease_may_expire_mid_attempt(OutboxConfig::default().lease));
    }

    #[test]
    fn test_validate_rejects_zero_settings() {
        let cases = [
            config().with_poll_interval(Duration::ZERO),
            config().with_max_events_per_tick(0),
            config().with_sweep(true, Duration::ZERO, 10),
            config().with_sweep(true, Duration::from_secs(1), 0),
            config().with_retry(RetryPolicy::default().with_max_attempts(Some(0))),
        ];
        for case in cases {
            assert!(
                matches!(case.validate(), Err(Error::InvalidConfig { .. })),
                "{case:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_timeout_longer_than_lease_is_flagged() {
        let lease = Duration::from_secs(10);
        let config = config().with_driver_timeout(Some(Duration::from_secs(10)));
        assert!(config.lease_may_expire_mid_attempt(lease));
        assert!(!config.lease_may_expire_mid_attempt(Duration::from_secs(11)));
        assert!(config.with_driver_timeout(None).lease_may_expire_mid_attempt(lease));
    }

    #[test]
    fn test_zero_outbox_lease_is_rejected() {
        let backend = InMemoryBackend::new(
            OutboxConfig::default().with_lease(Duration::ZERO),
            CacheConfig::default(),
        );
        let worker = Worker::new(config(), registry(), backend.repositories());
        assert!(matches!(worker, Err(Error::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_shutdown_is_ignored() {
        let handle = ShutdownHandle::new();
        let mut rx = handle.subscribe();

        handle.initiate(ShutdownSignal::Programmatic);
        handle.initiate(ShutdownSignal::Sigterm);

        assert!(handle.is_shutdown_initiated());
        assert_eq!(rx.recv().await.ok(), Some(ShutdownSignal::Programmatic));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_stops_both_loops() {
        let backend = InMemoryBackend::default();
        let worker = Worker::new(
            config()
                .with_poll_interval(Duration::from_millis(10))
                .with_sweep(true, Duration::from_millis(10), 10),
            registry(),
            backend.repositories(),
        );
        assert!(worker.is_ok());
        let Ok(worker) = worker else { return };

        let handle = worker.shutdown_handle();
        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.initiate(ShutdownSignal::Programmatic);

        let stats = task.await.ok().and_then(Result::ok);
        assert!(stats.is_some_and(|s| s.poller.ticks >= 1 && s.sweeper.is_some()));
    }

    #[tokio::test]
    async fn test_shutdown_before_run_stops_both_loops() {
        let backend = InMemoryBackend::default();
        let worker = Worker::new(
            config().with_sweep(true, Duration::from_millis(10), 10),
            registry(),
            backend.repositories(),
        );
        assert!(worker.is_ok());
        let Ok(worker) = worker else { return };

        worker.shutdown_handle().initiate(ShutdownSignal::Sigterm);

        let stats = tokio::time::timeout(Duration::from_secs(2), worker.run()).await;
        assert!(
            matches!(stats, Ok(Ok(WorkerStats { sweeper: Some(_), .. }))),
            "run should return promptly after an early signal"
        );
    }

    #[tokio::test]
    async fn test_poller_failure_stops_sweeper() {
        let backend = InMemoryBackend::default();
        let mut repos = backend.repositories();
        repos.outbox = Arc::new(BrokenOutbox(Arc::clone(&backend.outbox)));
        let worker = Worker::new(
            config()
                .with_poll_interval(Duration::from_millis(10))
                .with_sweep(true, Duration::from_millis(10), 10),
            registry(),
            repos,
        );
        assert!(worker.is_ok());
        let Ok(worker) = worker else { return };

        let outcome = tokio::time::timeout(Duration::from_secs(2), worker.run()).await;
        assert!(matches!(outcome, Ok(Err(Error::TaskFailed { .. }))));

        // Only the backend still holds the resources handle once the sweeper
        // future has been dropped.
        assert_eq!(Arc::strong_count(&backend.resources), 1);
    }

    #[tokio::test]
    async fn test_sweeper_can_be_disabled() {
        let backend = InMemoryBackend::default();
        let worker = Worker::new(
            config()
                .with_poll_interval(Duration::from_millis(10))
                .with_sweep(false, Duration::from_secs(5), 200),
            registry(),
            backend.repositories(),
        );
        assert!(worker.is_ok());
        let Ok(worker) = worker else { return };

        let handle = worker.shutdown_handle();
        let task = tokio::spawn(worker.run());
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.initiate(ShutdownSignal::Programmatic);

        let stats = task.await.ok().and_then(Result::ok);
        assert!(stats.is_some_and(|s| s.sweeper.is_none()));
    }
}
