//! Server configuration.
//!
//! Library defaults with `JDOCS_*` environment overrides; the CLI applies
//! its own overrides on top through the builder methods.
//!
//! ```rust,ignore
//! let config = ServerConfig::from_env().port(9000).workers(4);
//! ```

use std::time::Duration;

use crate::env::{env_get, env_get_millis, env_get_str};
use crate::error::{Error, Result};

pub mod defaults {
    pub const PORT: u16 = 7788;
    /// 0 = one worker per available CPU.
    pub const WORKERS: usize = 0;
    pub const QUEUE_DEPTH: u32 = 2048;
    pub const FD_TABLE_SIZE: u32 = 2048;
    pub const BACKLOG: i32 = 1024;
    pub const IDLE_TIMEOUT_MS: u64 = 60_000;
    pub const TICK_MS: u64 = 100;
    pub const LOG_LEVEL: &str = "info";
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP port, bound on all interfaces.
    pub port: u16,
    /// Worker threads; 0 resolves to available parallelism.
    pub workers: usize,
    /// Submission queue entries per ring.
    pub queue_depth: u32,
    /// Direct descriptor slots per ring.
    pub fd_table_size: u32,
    pub backlog: i32,
    pub idle_timeout: Duration,
    /// Timer wheel granularity.
    pub tick: Duration,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ServerConfig {
    /// Environment variables (all optional):
    /// - `JDOCS_PORT`
    /// - `JDOCS_WORKERS`
    /// - `JDOCS_QUEUE_DEPTH`
    /// - `JDOCS_FD_TABLE_SIZE`
    /// - `JDOCS_BACKLOG`
    /// - `JDOCS_IDLE_TIMEOUT_MS`
    /// - `JDOCS_TICK_MS`
    /// - `JDOCS_LOG`
    pub fn from_env() -> Self {
        Self {
            port: env_get("JDOCS_PORT", defaults::PORT),
            workers: env_get("JDOCS_WORKERS", defaults::WORKERS),
            queue_depth: env_get("JDOCS_QUEUE_DEPTH", defaults::QUEUE_DEPTH),
            fd_table_size: env_get("JDOCS_FD_TABLE_SIZE", defaults::FD_TABLE_SIZE),
            backlog: env_get("JDOCS_BACKLOG", defaults::BACKLOG),
            idle_timeout: env_get_millis(
                "JDOCS_IDLE_TIMEOUT_MS",
                Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
            ),
            tick: env_get_millis("JDOCS_TICK_MS", Duration::from_millis(defaults::TICK_MS)),
            log_level: env_get_str("JDOCS_LOG", defaults::LOG_LEVEL),
        }
    }

    /// Library defaults only, no environment.
    pub fn new() -> Self {
        Self {
            port: defaults::PORT,
            workers: defaults::WORKERS,
            queue_depth: defaults::QUEUE_DEPTH,
            fd_table_size: defaults::FD_TABLE_SIZE,
            backlog: defaults::BACKLOG,
            idle_timeout: Duration::from_millis(defaults::IDLE_TIMEOUT_MS),
            tick: Duration::from_millis(defaults::TICK_MS),
            log_level: defaults::LOG_LEVEL.to_string(),
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn tick(mut self, d: Duration) -> Self {
        self.tick = d;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn resolved_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.queue_depth.is_power_of_two() {
            return Err(Error::Config(format!(
                "queue depth {} is not a power of two",
                self.queue_depth
            )));
        }
        if self.fd_table_size == 0 || self.fd_table_size > u16::MAX as u32 {
            return Err(Error::Config(format!(
                "fd table size {} out of range",
                self.fd_table_size
            )));
        }
        if self.tick.is_zero() {
            return Err(Error::Config("timer tick must be non-zero".into()));
        }
        if self.idle_timeout < self.tick {
            return Err(Error::Config("idle timeout shorter than one tick".into()));
        }
        Ok(())
    }
}
