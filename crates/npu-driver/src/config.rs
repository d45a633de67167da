// SPDX-License-Identifier: AGPL-3.0-only

//! Driver configuration

use crate::error::{NpuError, Result};
use std::str::FromStr;
use std::time::Duration;

/// Retry policy for pushes onto a full request ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// First sleep
    pub initial: Duration,
    /// Sleep ceiling
    pub max: Duration,
    /// Push attempts before giving up
    pub attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_micros(50),
            max: Duration::from_millis(2),
            attempts: 256,
        }
    }
}

impl Backoff {
    /// Sleep before retry number `attempt` (zero-based), doubling up to the cap
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Protocol worker deadlines per request class and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    /// Frame not forwarded to firmware in time
    pub frame_requested: Duration,
    /// Frame not answered by firmware in time
    pub frame_processing: Duration,
    /// Network command not forwarded in time
    pub network_requested: Duration,
    /// Network command not answered in time
    pub network_processing: Duration,
    /// Stuck request kept for a late answer before it is reclaimed
    pub stuck_grace: Duration,
}

impl Default for WorkerTimeouts {
    fn default() -> Self {
        Self {
            frame_requested: Duration::from_secs(5),
            frame_processing: Duration::from_secs(10),
            network_requested: Duration::from_secs(5),
            network_processing: Duration::from_millis(500),
            stuck_grace: Duration::from_secs(30),
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    /// I/O buffer slots per session
    pub io_slots: usize,
    /// Concurrently open sessions
    pub max_sessions: usize,
    /// Capacity of each request ring
    pub queue_depth: usize,
    /// Wait for the worker to accept a network command
    pub accept_timeout: Duration,
    /// Wait for the firmware result once accepted
    pub complete_timeout: Duration,
    /// Wait for a completed frame in dequeue
    pub dequeue_timeout: Duration,
    /// Full-ring retry policy
    pub backoff: Backoff,
    /// Worker-side deadlines
    pub worker: WorkerTimeouts,
    /// Worker sleep when both rings are empty
    pub idle_poll: Duration,
    /// Lock host DMA memory into RAM
    pub lock_pages: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            io_slots: 16,
            max_sessions: 32,
            queue_depth: 64,
            accept_timeout: Duration::from_secs(2),
            complete_timeout: Duration::from_secs(15),
            dequeue_timeout: Duration::from_secs(12),
            backoff: Backoff::default(),
            worker: WorkerTimeouts::default(),
            idle_poll: Duration::from_millis(1),
            lock_pages: false,
        }
    }
}

impl DriverConfig {
    /// Defaults with `NPU_*` environment overrides applied
    ///
    /// # Errors
    ///
    /// [`NpuError::InvalidArgument`] if the overrides break [`Self::validate`].
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        override_from_env("NPU_IO_SLOTS", &mut config.io_slots);
        override_from_env("NPU_MAX_SESSIONS", &mut config.max_sessions);
        override_from_env("NPU_QUEUE_DEPTH", &mut config.queue_depth);
        override_from_env("NPU_LOCK_PAGES", &mut config.lock_pages);

        for (key, field) in [
            ("NPU_ACCEPT_TIMEOUT_MS", &mut config.accept_timeout),
            ("NPU_COMPLETE_TIMEOUT_MS", &mut config.complete_timeout),
            ("NPU_DEQUEUE_TIMEOUT_MS", &mut config.dequeue_timeout),
        ] {
            let mut millis = u64::try_from(field.as_millis()).unwrap_or(u64::MAX);
            override_from_env(key, &mut millis);
            *field = Duration::from_millis(millis);
        }

        tracing::debug!("Driver config: {config:?}");
        config.validate()?;
        Ok(config)
    }

    /// Check the timeout ordering and sizes
    ///
    /// STREAMOFF and UNLOAD are answered only once every outstanding frame
    /// has finished, so the completion wait must outlast a frame plus a
    /// network command. Acceptance must be the shorter of the two waits.
    ///
    /// # Errors
    ///
    /// [`NpuError::InvalidArgument`] naming the first broken rule.
    pub fn validate(&self) -> Result<()> {
        if self.io_slots == 0 || self.queue_depth == 0 || self.max_sessions == 0 {
            return Err(NpuError::invalid_argument(format!(
                "io_slots {}, queue_depth {} and max_sessions {} must be non-zero",
                self.io_slots, self.queue_depth, self.max_sessions
            )));
        }
        let drain = self.worker.frame_processing + self.worker.network_processing;
        if self.complete_timeout <= drain {
            return Err(NpuError::invalid_argument(format!(
                "complete timeout {:?} must exceed frame plus network processing {drain:?}",
                self.complete_timeout
            )));
        }
        if self.accept_timeout >= self.complete_timeout {
            return Err(NpuError::invalid_argument(format!(
                "accept timeout {:?} must be shorter than complete timeout {:?}",
                self.accept_timeout, self.complete_timeout
            )));
        }
        Ok(())
    }

    /// Short timeouts for tests and demos
    pub fn fast() -> Self {
        Self {
            accept_timeout: Duration::from_millis(500),
            complete_timeout: Duration::from_secs(3),
            dequeue_timeout: Duration::from_secs(3),
            worker: WorkerTimeouts {
                frame_requested: Duration::from_secs(2),
                frame_processing: Duration::from_secs(2),
                network_requested: Duration::from_secs(2),
                network_processing: Duration::from_millis(200),
                stuck_grace: Duration::from_secs(2),
            },
            ..Self::default()
        }
    }
}

fn override_from_env<T: FromStr>(key: &str, field: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => {
            tracing::debug!("{key}={raw} overrides default");
            *field = value;
        }
        Err(_) => tracing::warn!("Ignoring malformed {key}={raw:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = DriverConfig::default();
        assert_eq!(config.io_slots, 16);
        assert_eq!(config.queue_depth, 64);
        assert_eq!(config.worker.network_processing, Duration::from_millis(500));
        assert!(!config.lock_pages);
        config.validate().unwrap();
        DriverConfig::fast().validate().unwrap();
    }

    #[test]
    fn completion_must_outlast_a_frame() {
        let config = DriverConfig {
            complete_timeout: Duration::from_secs(2),
            ..DriverConfig::default()
        };
        assert!(matches!(config.validate(), Err(NpuError::InvalidArgument { .. })));

        let config = DriverConfig {
            accept_timeout: Duration::from_secs(20),
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());

        let config = DriverConfig {
            io_slots: 0,
            ..DriverConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn from_env_rejects_inverted_timeouts() {
        std::env::set_var("NPU_COMPLETE_TIMEOUT_MS", "2000");
        let result = DriverConfig::from_env();
        std::env::remove_var("NPU_COMPLETE_TIMEOUT_MS");
        assert!(result.is_err());
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::from_micros(50));
        assert_eq!(backoff.delay(1), Duration::from_micros(100));
        assert_eq!(backoff.delay(10), Duration::from_millis(2));
        assert_eq!(backoff.delay(200), Duration::from_millis(2));
    }

    #[test]
    fn env_override_parses_and_ignores_garbage() {
        let mut slots = 16usize;
        std::env::set_var("NPU_TEST_SLOTS_OK", "4");
        override_from_env("NPU_TEST_SLOTS_OK", &mut slots);
        assert_eq!(slots, 4);

        std::env::set_var("NPU_TEST_SLOTS_BAD", "four");
        override_from_env("NPU_TEST_SLOTS_BAD", &mut slots);
        assert_eq!(slots, 4);
    }
}
