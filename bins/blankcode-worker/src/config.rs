// Worker runtime settings: queue behavior, concurrency and the health listener.
use anyhow::{bail, Context, Result};
use blankcode_common::config::env_or;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub concurrency: usize,
    /// Deliveries per job, first one included.
    pub job_attempts: u32,
    pub backoff_base_ms: u64,
    pub lock_ms: u64,
    pub stalled_check_ms: u64,
    pub stale_submission_secs: u64,
    /// `None` disables the health/metrics listener.
    pub health_addr: Option<SocketAddr>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            concurrency: 5,
            job_attempts: 3,
            backoff_base_ms: 1_000,
            lock_ms: 60_000,
            stalled_check_ms: 30_000,
            stale_submission_secs: 300,
            health_addr: Some(SocketAddr::from(([0, 0, 0, 0], 9090))),
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let health_addr = match std::env::var("HEALTH_ADDR") {
            Ok(raw) if raw.trim().eq_ignore_ascii_case("off") => None,
            Ok(raw) if !raw.trim().is_empty() => Some(
                raw.trim()
                    .parse()
                    .with_context(|| format!("Invalid value for HEALTH_ADDR: {}", raw))?,
            ),
            _ => defaults.health_addr,
        };

        let config = Self {
            redis_url: std::env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency)?,
            job_attempts: env_or("JOB_ATTEMPTS", defaults.job_attempts)?,
            backoff_base_ms: env_or("JOB_BACKOFF_MS", defaults.backoff_base_ms)?,
            lock_ms: env_or("JOB_LOCK_MS", defaults.lock_ms)?,
            stalled_check_ms: env_or("STALLED_CHECK_MS", defaults.stalled_check_ms)?,
            stale_submission_secs: env_or("STALE_SUBMISSION_SECS", defaults.stale_submission_secs)?,
            health_addr,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            bail!("WORKER_CONCURRENCY must be at least 1");
        }
        if self.job_attempts == 0 {
            bail!("JOB_ATTEMPTS must be at least 1");
        }
        if self.lock_ms < 1_000 {
            bail!("JOB_LOCK_MS must be at least 1000");
        }
        Ok(())
    }

    /// Exponential backoff before redelivery: `base * 2^(attempts_made)`.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        let factor = 1u64.checked_shl(attempts_made.min(16)).unwrap_or(u64::MAX);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor))
    }

    /// How often the processing lock is renewed while a job runs.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.lock_ms / 3)
    }

    pub fn stalled_check_interval(&self) -> Duration {
        Duration::from_millis(self.stalled_check_ms.max(1_000))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_submission_secs)
    }
}
