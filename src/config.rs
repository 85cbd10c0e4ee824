//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `TIERBATCH_DATABASE_URL`: PostgreSQL connection string (required)
//! - `TIERBATCH_LISTEN_ADDR`: Cluster HTTP endpoint bind address (default: 0.0.0.0:24210)
//! - `TIERBATCH_ADVERTISE_ADDR`: Address peers use to reach this member (default: listen addr)
//! - `TIERBATCH_PROCESS_INDEX`: Process index recorded in membership (default: 0)
//! - `TIERBATCH_WORKER_COUNT`: Partitions / worker tasks per stage (default: 6)
//! - `TIERBATCH_CHUNK_SIZE`: Items per chunk (default: 1000)
//! - `TIERBATCH_BATCH_SIZE`: Apply page size and coupon insert batch (default: 500)
//! - `TIERBATCH_CHUNK_TIMEOUT_MS`: Per-chunk timeout, 0 disables (default: 300000)
//! - `TIERBATCH_HEARTBEAT_INTERVAL_MS`: Membership heartbeat interval (default: 10000)
//! - `TIERBATCH_HEARTBEAT_TIMEOUT_MS`: Liveness threshold (default: 30000)
//! - `TIERBATCH_RESTORE_INTERVAL_MS`: Restore trigger interval (default: 15000)
//! - `TIERBATCH_CYCLE_ENABLED`: Enable the periodic full-batch scheduler (default: true)
//! - `TIERBATCH_CYCLE_INTERVAL_MS`: Periodic cycle interval (default: 3600000)
//! - `TIERBATCH_NOTIFY_TIMEOUT_MS`: Peer notification request timeout (default: 5000)
//! - `TIERBATCH_SILVER_BADGES` / `TIERBATCH_GOLD_BADGES` / `TIERBATCH_PLATINUM_BADGES`:
//!   Tier thresholds for the default rules (default: 1 / 3 / 5)

use std::{env, net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::cluster::MembershipConfig;
use crate::domain::ThresholdRules;
use crate::executor::ExecutorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::restore::RestoreConfig;
use crate::scheduler::CycleConfig;

/// Default bind address for the cluster endpoint
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:24210";

/// Process configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection URL
    pub database_url: String,

    /// Cluster HTTP endpoint bind address
    pub listen_addr: SocketAddr,

    /// Address recorded in membership for peers to call
    pub advertise_addr: String,

    pub process_index: i32,

    /// Partitions per stage
    pub worker_count: usize,

    pub chunk_size: usize,

    /// Apply page size and coupon insert batch
    pub batch_size: usize,

    /// Per-chunk timeout; `None` disables it
    pub chunk_timeout: Option<Duration>,

    pub heartbeat_interval: Duration,

    pub heartbeat_timeout: Duration,

    pub restore_interval: Duration,

    pub cycle_enabled: bool,

    pub cycle_interval: Duration,

    pub notify_timeout: Duration,

    pub rules: ThresholdRules,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// Loads `.env` file if present, then reads from environment.
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let database_url = lookup("TIERBATCH_DATABASE_URL")
            .context("TIERBATCH_DATABASE_URL environment variable is required")?;

        let listen_addr =
            lookup("TIERBATCH_LISTEN_ADDR").unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr = SocketAddr::from_str(&listen_addr)
            .context("invalid TIERBATCH_LISTEN_ADDR format")?;

        let advertise_addr =
            lookup("TIERBATCH_ADVERTISE_ADDR").unwrap_or_else(|| listen_addr.to_string());

        let process_index = parse_or(&lookup, "TIERBATCH_PROCESS_INDEX", 0)?;
        let worker_count = parse_or(&lookup, "TIERBATCH_WORKER_COUNT", 6usize)?.max(1);
        let chunk_size = parse_or(&lookup, "TIERBATCH_CHUNK_SIZE", 1000usize)?.max(1);
        let batch_size = parse_or(&lookup, "TIERBATCH_BATCH_SIZE", 500usize)?.max(1);

        let chunk_timeout_ms = parse_or(&lookup, "TIERBATCH_CHUNK_TIMEOUT_MS", 300_000u64)?;
        let chunk_timeout = (chunk_timeout_ms > 0).then(|| Duration::from_millis(chunk_timeout_ms));

        let heartbeat_interval = millis_or(&lookup, "TIERBATCH_HEARTBEAT_INTERVAL_MS", 10_000)?;
        let heartbeat_timeout = millis_or(&lookup, "TIERBATCH_HEARTBEAT_TIMEOUT_MS", 30_000)?;
        if heartbeat_timeout <= heartbeat_interval {
            anyhow::bail!(
                "TIERBATCH_HEARTBEAT_TIMEOUT_MS must be larger than TIERBATCH_HEARTBEAT_INTERVAL_MS"
            );
        }

        let restore_interval = millis_or(&lookup, "TIERBATCH_RESTORE_INTERVAL_MS", 15_000)?;
        let cycle_enabled = lookup("TIERBATCH_CYCLE_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(true);
        let cycle_interval = millis_or(&lookup, "TIERBATCH_CYCLE_INTERVAL_MS", 3_600_000)?;
        let notify_timeout = millis_or(&lookup, "TIERBATCH_NOTIFY_TIMEOUT_MS", 5_000)?;

        let defaults = ThresholdRules::default();
        let rules = ThresholdRules {
            silver_badges: parse_or(&lookup, "TIERBATCH_SILVER_BADGES", defaults.silver_badges)?,
            gold_badges: parse_or(&lookup, "TIERBATCH_GOLD_BADGES", defaults.gold_badges)?,
            platinum_badges: parse_or(
                &lookup,
                "TIERBATCH_PLATINUM_BADGES",
                defaults.platinum_badges,
            )?,
        };

        Ok(Self {
            database_url,
            listen_addr,
            advertise_addr,
            process_index,
            worker_count,
            chunk_size,
            batch_size,
            chunk_timeout,
            heartbeat_interval,
            heartbeat_timeout,
            restore_interval,
            cycle_enabled,
            cycle_interval,
            notify_timeout,
            rules,
        })
    }

    /// Listen address for a one-shot run: the configured interface on an
    /// ephemeral port, so it can share a host with a serving member.
    pub fn one_shot_listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_addr.ip(), 0)
    }

    /// The advertised host with `port` in place of the configured one.
    pub fn advertise_with_port(&self, port: u16) -> String {
        let host = self
            .advertise_addr
            .rsplit_once(':')
            .map_or(self.advertise_addr.as_str(), |(host, _)| host);
        format!("{host}:{port}")
    }

    pub fn executor(&self) -> ExecutorConfig {
        ExecutorConfig {
            workers: self.worker_count,
            chunk_size: self.chunk_size,
            chunk_timeout: self.chunk_timeout,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            executor: self.executor(),
            default_batch_size: self.batch_size,
        }
    }

    pub fn membership(&self) -> MembershipConfig {
        MembershipConfig {
            heartbeat_interval: self.heartbeat_interval,
            heartbeat_timeout: self.heartbeat_timeout,
        }
    }

    pub fn restore(&self) -> RestoreConfig {
        RestoreConfig {
            interval: self.restore_interval,
            batch_size: Some(self.batch_size),
        }
    }

    pub fn cycle(&self) -> CycleConfig {
        CycleConfig {
            interval: self.cycle_interval,
            batch_size: Some(self.batch_size),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid {key} value: {raw}")),
        None => Ok(default),
    }
}

fn millis_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default_ms: u64,
) -> Result<Duration> {
    parse_or(lookup, key, default_ms).map(Duration::from_millis)
}

/// Get the database URL from environment
pub fn database_url() -> Result<String> {
    dotenvy::dotenv().ok();
    env::var("TIERBATCH_DATABASE_URL")
        .context("TIERBATCH_DATABASE_URL environment variable is required")
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_lookup(lookup(&[("TIERBATCH_DATABASE_URL", "postgres://test")])).unwrap();
        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR.parse::<SocketAddr>().unwrap());
        assert_eq!(config.advertise_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.worker_count, 6);
        assert_eq!(config.chunk_size, 1000);
        assert_eq!(config.batch_size, 500);
        assert_eq!(config.chunk_timeout, Some(Duration::from_secs(300)));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert!(config.cycle_enabled);
        assert_eq!(config.rules.gold_badges, 3);
    }

    #[test]
    fn test_database_url_is_required() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("TIERBATCH_DATABASE_URL"));
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("TIERBATCH_DATABASE_URL", "postgres://test"),
            ("TIERBATCH_LISTEN_ADDR", "127.0.0.1:9000"),
            ("TIERBATCH_ADVERTISE_ADDR", "batch-2.internal:9000"),
            ("TIERBATCH_WORKER_COUNT", "3"),
            ("TIERBATCH_CHUNK_TIMEOUT_MS", "0"),
            ("TIERBATCH_CYCLE_ENABLED", "false"),
            ("TIERBATCH_PLATINUM_BADGES", "8"),
        ]))
        .unwrap();
        assert_eq!(config.advertise_addr, "batch-2.internal:9000");
        assert_eq!(config.executor().workers, 3);
        assert_eq!(config.chunk_timeout, None);
        assert!(!config.cycle_enabled);
        assert_eq!(config.rules.platinum_badges, 8);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("TIERBATCH_DATABASE_URL", "postgres://test"),
            ("TIERBATCH_CHUNK_SIZE", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("TIERBATCH_CHUNK_SIZE"));

        let err = Config::from_lookup(lookup(&[
            ("TIERBATCH_DATABASE_URL", "postgres://test"),
            ("TIERBATCH_HEARTBEAT_TIMEOUT_MS", "5000"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("HEARTBEAT_TIMEOUT"));
    }

    #[test]
    fn test_one_shot_addresses() {
        let config = Config::from_lookup(lookup(&[
            ("TIERBATCH_DATABASE_URL", "postgres://test"),
            ("TIERBATCH_LISTEN_ADDR", "10.1.2.3:9000"),
            ("TIERBATCH_ADVERTISE_ADDR", "batch-2.internal:9000"),
        ]))
        .unwrap();
        assert_eq!(config.one_shot_listen_addr(), "10.1.2.3:0".parse::<SocketAddr>().unwrap());
        assert_eq!(config.advertise_with_port(41234), "batch-2.internal:41234");

        let config = Config::from_lookup(lookup(&[
            ("TIERBATCH_DATABASE_URL", "postgres://test"),
            ("TIERBATCH_ADVERTISE_ADDR", "[::1]:24210"),
        ]))
        .unwrap();
        assert_eq!(config.advertise_with_port(5000), "[::1]:5000");
    }
}
