//! Kernel configuration.
//!
//! Sources in priority order (lowest to highest):
//! 1. Code defaults
//! 2. TOML file named by `GPU_TENANT_CONFIG`, if set
//! 3. Environment variables prefixed `GPU_TENANT_`
//!    (e.g. `GPU_TENANT_WORKER_THREADS=8`)

use crate::pool::MatchPolicy;
use crate::scheduler::QueuePolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationErrors};

/// Environment variable naming an optional TOML config file.
pub const CONFIG_PATH_ENV: &str = "GPU_TENANT_CONFIG";

/// Prefix for per-field environment overrides.
pub const ENV_PREFIX: &str = "GPU_TENANT_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to extract configuration: {0}")]
    Extraction(#[from] Box<figment::Error>),

    #[error("configuration validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct KernelConfig {
    /// Device `initialize` uses when `select_device` was not called.
    pub device_ordinal: usize,

    /// Number of equally sized partitions in the initial memory layout.
    #[validate(range(min = 1))]
    pub memory_partitions: usize,

    /// Scheduler sleep between passes.
    #[validate(range(min = 1))]
    pub poll_interval_ms: u64,

    /// Threads running task jobs.
    #[validate(range(min = 1))]
    pub worker_threads: usize,

    /// How long `shutdown` waits for running jobs before tearing down.
    pub shutdown_grace_ms: u64,

    pub match_policy: MatchPolicy,
    pub queue_policy: QueuePolicy,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            device_ordinal: 0,
            memory_partitions: 10,
            poll_interval_ms: 100,
            worker_threads: 4,
            shutdown_grace_ms: 5000,
            match_policy: MatchPolicy::FirstFit,
            queue_policy: QueuePolicy::Fifo,
        }
    }
}

impl KernelConfig {
    /// Defaults, then the optional TOML file, then the environment.
    pub fn figment() -> Figment {
        let mut figment = Figment::new().merge(Serialized::defaults(KernelConfig::default()));
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed(ENV_PREFIX).ignore(&["CONFIG", "LOG"]))
    }

    /// Load from the default sources and validate.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// Extract from any provider and validate.
    pub fn from_figment<T: Provider>(provider: T) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(provider)
            .extract()
            .map_err(|e| ConfigError::Extraction(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Build the thread pool that runs task jobs.
    pub fn build_worker_pool(&self) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_threads)
            .thread_name(|i| format!("gpu-tenant-worker-{i}"))
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use rstest::rstest;

    #[test]
    fn defaults_match_documented_values() {
        let config = KernelConfig::default();
        assert_eq!(config.memory_partitions, 10);
        assert_eq!(config.poll_interval(), Duration::from_millis(100));
        assert_eq!(config.match_policy, MatchPolicy::FirstFit);
        assert_eq!(config.queue_policy, QueuePolicy::Fifo);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.set_env("GPU_TENANT_WORKER_THREADS", "8");
            jail.set_env("GPU_TENANT_MATCH_POLICY", "best_fit");
            jail.set_env("GPU_TENANT_LOG", "debug");

            let config = KernelConfig::load().expect("config loads");
            assert_eq!(config.worker_threads, 8);
            assert_eq!(config.match_policy, MatchPolicy::BestFit);
            assert_eq!(config.memory_partitions, 10);
            Ok(())
        });
    }

    #[test]
    fn toml_file_sits_between_defaults_and_env() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "kernel.toml",
                r#"
                    memory_partitions = 4
                    poll_interval_ms = 20
                    queue_policy = "priority"
                "#,
            )?;
            jail.set_env("GPU_TENANT_CONFIG", "kernel.toml");
            jail.set_env("GPU_TENANT_POLL_INTERVAL_MS", "5");

            let config = KernelConfig::load().expect("config loads");
            assert_eq!(config.memory_partitions, 4);
            assert_eq!(config.queue_policy, QueuePolicy::Priority);
            assert_eq!(config.poll_interval_ms, 5);
            Ok(())
        });
    }

    #[test]
    fn worker_pool_has_configured_size() {
        let config = KernelConfig {
            worker_threads: 2,
            ..Default::default()
        };
        let pool = config.build_worker_pool().expect("pool builds");
        assert_eq!(pool.current_num_threads(), 2);
    }

    #[rstest]
    #[case::no_partitions("memory_partitions", 0)]
    #[case::zero_poll("poll_interval_ms", 0)]
    #[case::no_workers("worker_threads", 0)]
    fn out_of_range_values_are_rejected(#[case] key: &str, #[case] value: u64) {
        let figment = Figment::from(Serialized::defaults(KernelConfig::default()))
            .merge((key, value));
        assert!(matches!(
            KernelConfig::from_figment(figment),
            Err(ConfigError::Validation(_))
        ));
    }
}
