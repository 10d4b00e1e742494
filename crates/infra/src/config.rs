//! Configuration loading and representation.
//!
//! Values come from an optional file plus `DEPOT__*` environment variables,
//! with `__` separating sections (`DEPOT__WORKER__CONCURRENCY=8`). Every field
//! has a default, so an empty environment yields a working local setup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::jobs::ledger::LedgerConfig;
use crate::jobs::scheduler::SchedulerConfig;
use crate::jobs::worker::WorkerConfig;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DEPOT";

/// Main job-system configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DepotConfig {
    pub redis: RedisSettings,

    /// Prefix of every store key (`<namespace>:job_queue:high`, ...)
    pub namespace: String,

    pub worker: WorkerSettings,
    pub scheduler: SchedulerSettings,
    pub ledger: LedgerSettings,
    pub log: LogSettings,
}

impl Default for DepotConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            namespace: "depot".to_string(),
            worker: WorkerSettings::default(),
            scheduler: SchedulerSettings::default(),
            ledger: LedgerSettings::default(),
            log: LogSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker tasks per process
    pub concurrency: usize,
    /// Blocking pop timeout; bounds how long shutdown waits on an idle worker
    pub pop_timeout_ms: u64,
    /// Longest sleep after popping a job that is not yet due
    pub early_pop_sleep_cap_ms: u64,
    /// Minimum delay before a job requeued during shutdown becomes due again
    pub shutdown_grace_secs: u64,
    /// Pause after an unexpected worker-loop error
    pub error_cooldown_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            pop_timeout_ms: 1_000,
            early_pop_sleep_cap_ms: 1_000,
            shutdown_grace_secs: 5,
            error_cooldown_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub lock_ttl_secs: u64,
    /// Evaluation interval; `None` means a third of the lock TTL
    pub tick_secs: Option<u64>,
    /// Evaluate the periodic registry once at startup instead of every tick
    pub single_pass: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            lock_ttl_secs: 15,
            tick_secs: None,
            single_pass: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Retention window for success and cancelled outcomes
    pub success_retention_secs: u64,
    pub page_size: usize,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            success_retention_secs: 1_000,
            page_size: 50,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: true,
        }
    }
}

impl DepotConfig {
    /// Load configuration from an optional file, overridden by the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let w = &self.worker;
        WorkerConfig {
            concurrency: w.concurrency.max(1),
            pop_timeout: Duration::from_millis(w.pop_timeout_ms),
            early_pop_sleep_cap: Duration::from_millis(w.early_pop_sleep_cap_ms),
            shutdown_grace: Duration::from_secs(w.shutdown_grace_secs),
            error_cooldown: Duration::from_millis(w.error_cooldown_ms),
            ..WorkerConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        let s = &self.scheduler;
        let lock_ttl = Duration::from_secs(s.lock_ttl_secs.max(1));
        SchedulerConfig {
            lock_ttl,
            tick: s.tick_secs.map(Duration::from_secs).unwrap_or(lock_ttl / 3),
            single_pass: s.single_pass,
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            retention: Duration::from_secs(self.ledger.success_retention_secs),
            page_size: self.ledger.page_size.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = DepotConfig::default();
        assert_eq!(config.namespace, "depot");

        let worker = config.worker_config();
        assert_eq!(worker.pop_timeout, Duration::from_secs(1));
        assert_eq!(worker.early_pop_sleep_cap, Duration::from_secs(1));
        assert_eq!(worker.error_cooldown, Duration::from_secs(5));

        let scheduler = config.scheduler_config();
        assert_eq!(scheduler.lock_ttl, Duration::from_secs(15));
        assert_eq!(scheduler.tick, Duration::from_secs(5));
        assert!(!scheduler.single_pass);

        let ledger = config.ledger_config();
        assert_eq!(ledger.retention, Duration::from_secs(1000));
        assert_eq!(ledger.page_size, 50);
    }

    #[test]
    fn partial_sections_fill_in_defaults() {
        let config: DepotConfig = serde_json::from_str(
            r#"{"namespace": "erp", "worker": {"concurrency": 9}, "scheduler": {"tick_secs": 2}}"#,
        )
        .unwrap();

        assert_eq!(config.namespace, "erp");
        assert_eq!(config.worker.concurrency, 9);
        assert_eq!(config.worker.pop_timeout_ms, 1_000);
        assert_eq!(config.scheduler_config().tick, Duration::from_secs(2));
        assert_eq!(config.redis.url, "redis://localhost:6379");
    }

    #[test]
    fn zero_sizes_are_clamped() {
        let mut config = DepotConfig::default();
        config.worker.concurrency = 0;
        config.ledger.page_size = 0;
        assert_eq!(config.worker_config().concurrency, 1);
        assert_eq!(config.ledger_config().page_size, 1);
    }
}
