//! Command-line and environment configuration for the worker.

use std::time::Duration;

use clap::{ArgAction, Parser};
use keel_core::WorkerId;
use keel_reconciler::{RetryPolicy, WorkerConfig};
use keel_store::{CacheConfig, OutboxConfig, StoreConfig};

/// keel - reconciliation worker
#[derive(Parser, Debug)]
#[command(name = "keel")]
#[command(version)]
#[command(about = "Converges declared infrastructure resources with what actually exists")]
#[command(
    long_about = "keel claims resource change events from the control-plane outbox, drives each resource to its desired state through a per-kind driver, and periodically sweeps for drift."
)]
pub struct Cli {
    /// SurrealDB endpoint ("mem://" runs an embedded store)
    #[arg(long, env = "KEEL_STORE_URL", default_value = "mem://")]
    pub store_url: String,

    #[arg(long, env = "KEEL_STORE_NAMESPACE", default_value = "keel")]
    pub store_namespace: String,

    #[arg(long, env = "KEEL_STORE_DATABASE", default_value = "control_plane")]
    pub store_database: String,

    #[arg(long, env = "KEEL_STORE_USER", requires = "store_pass")]
    pub store_user: Option<String>,

    #[arg(long, env = "KEEL_STORE_PASS", hide_env_values = true)]
    pub store_pass: Option<String>,

    /// Lease holder identity (defaults to host name plus a ULID)
    #[arg(long, env = "KEEL_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "KEEL_POLL_INTERVAL_MS", default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Events drained per poll tick at most
    #[arg(long, env = "KEEL_MAX_EVENTS_PER_TICK", default_value_t = 16)]
    pub max_events_per_tick: usize,

    /// Run the drift sweeper (enable on exactly one replica)
    #[arg(long, env = "KEEL_SWEEP_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub sweep_enabled: bool,

    #[arg(long, env = "KEEL_SWEEP_INTERVAL_MS", default_value_t = 5_000)]
    pub sweep_interval_ms: u64,

    #[arg(long, env = "KEEL_SWEEP_BATCH_SIZE", default_value_t = 200)]
    pub sweep_batch_size: usize,

    /// Outbox claim lease; keep it above the driver timeout
    #[arg(long, env = "KEEL_LEASE_SECS", default_value_t = 60)]
    pub lease_secs: u64,

    #[arg(long, env = "KEEL_CACHE_TTL_SECS", default_value_t = 120)]
    pub cache_ttl_secs: u64,

    #[arg(long, env = "KEEL_CACHE_CAPACITY", default_value_t = 100_000)]
    pub cache_capacity: u64,

    /// Per-attempt driver timeout; 0 disables it
    #[arg(long, env = "KEEL_DRIVER_TIMEOUT_SECS", default_value_t = 30)]
    pub driver_timeout_secs: u64,

    #[arg(long, env = "KEEL_RETRY_BASE_MS", default_value_t = 1_000)]
    pub retry_base_ms: u64,

    #[arg(long, env = "KEEL_RETRY_MAX_MS", default_value_t = 60_000)]
    pub retry_max_ms: u64,

    /// Dead-letter an event after this many attempts (unbounded if unset)
    #[arg(long, env = "KEEL_RETRY_MAX_ATTEMPTS")]
    pub retry_max_attempts: Option<u32>,
}

impl Cli {
    pub fn store_config(&self) -> StoreConfig {
        let config = StoreConfig::remote(self.store_url.clone())
            .with_namespace(self.store_namespace.clone())
            .with_database(self.store_database.clone());

        match (&self.store_user, &self.store_pass) {
            (Some(user), Some(pass)) => config.with_credentials(user.clone(), pass.clone()),
            _ => config,
        }
    }

    pub fn outbox_config(&self) -> OutboxConfig {
        OutboxConfig::default().with_lease(Duration::from_secs(self.lease_secs))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::default()
            .with_ttl(Duration::from_secs(self.cache_ttl_secs))
            .with_max_capacity(self.cache_capacity)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let worker_id = self.worker_id.as_deref().map_or_else(
            || WorkerId::generate(&host_name()),
            WorkerId::from,
        );
        let driver_timeout =
            (self.driver_timeout_secs > 0).then(|| Duration::from_secs(self.driver_timeout_secs));
        let retry = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(self.retry_base_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_ms))
            .with_max_attempts(self.retry_max_attempts);

        WorkerConfig::new(worker_id)
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_max_events_per_tick(self.max_events_per_tick)
            .with_sweep(
                self.sweep_enabled,
                Duration::from_millis(self.sweep_interval_ms),
                self.sweep_batch_size,
            )
            .with_driver_timeout(driver_timeout)
            .with_retry(retry)
    }
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "keel".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Option<Cli> {
        Cli::try_parse_from(std::iter::once("keel").chain(args.iter().copied())).ok()
    }

    #[test]
    fn test_defaults_match_worker_defaults() {
        let cli = parse(&[]);
        assert!(cli.is_some(), "no flags should parse");
        let Some(cli) = cli else {
            return;
        };
        let config = cli.worker_config();
        let lease = cli.outbox_config().lease;

        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.sweep_interval, Duration::from_secs(5));
        assert_eq!(config.sweep_batch_size, 200);
        assert_eq!(lease, Duration::from_secs(60));
        assert_eq!(config.driver_timeout, Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
        assert!(!config.lease_may_expire_mid_attempt(lease));
    }

    #[test]
    fn test_zero_driver_timeout_disables_it() {
        let cli = parse(&["--driver-timeout-secs", "0", "--worker-id", "w-7"]);
        let config = cli.map(|c| c.worker_config());

        assert_eq!(config.as_ref().map(|c| c.driver_timeout), Some(None));
        assert_eq!(config.map(|c| c.worker_id), Some(WorkerId::from("w-7")));
    }

    #[test]
    fn test_sweep_can_be_switched_off() {
        let cli = parse(&["--sweep-enabled", "false"]);
        assert_eq!(cli.map(|c| c.worker_config().sweep_enabled), Some(false));
    }

    #[test]
    fn test_credentials_require_both_halves() {
        assert!(parse(&["--store-user", "root"]).is_none());

        let cli = parse(&["--store-user", "root", "--store-pass", "secret"]);
        let store = cli.map(|c| c.store_config());
        assert!(store.is_some_and(|s| s.credentials.is_some()));
    }
}
