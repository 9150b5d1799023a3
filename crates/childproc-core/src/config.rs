use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ProcessError, Result};
use crate::input::Input;

/// Polling cadence and I/O sizing used by the controller and the pipe strategies
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Timings {
    /// Upper bound for one readiness wait inside a blocking multiplexing pass (in milliseconds)
    #[serde(default = "default_poll_quantum_ms")]
    pub poll_quantum_ms: u64,

    /// Number of bytes requested per read from a child stream
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Interval between liveness checks while `stop()` waits for the grace period (in milliseconds)
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,

    /// Interval between liveness checks once all pipes are closed (in milliseconds)
    #[serde(default = "default_reap_poll_interval_ms")]
    pub reap_poll_interval_ms: u64,

    /// How long `start()` waits for the side channel to report the real pid (in milliseconds)
    #[serde(default = "default_side_channel_wait_ms")]
    pub side_channel_wait_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_quantum_ms: default_poll_quantum_ms(),
            chunk_size: default_chunk_size(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            reap_poll_interval_ms: default_reap_poll_interval_ms(),
            side_channel_wait_ms: default_side_channel_wait_ms(),
        }
    }
}

impl Timings {
    /// Validate the timings and return errors if invalid
    pub fn validate(&self) -> Result<()> {
        if self.poll_quantum_ms == 0 {
            return Err(ProcessError::configuration(
                "poll_quantum_ms must be greater than zero",
            ));
        }

        if self.chunk_size == 0 {
            return Err(ProcessError::configuration(
                "chunk_size must be greater than zero",
            ));
        }

        if self.poll_quantum_ms > 60_000 {
            return Err(ProcessError::configuration(
                "poll_quantum_ms should not exceed 60 seconds",
            ));
        }

        Ok(())
    }

    pub fn poll_quantum(&self) -> Duration {
        Duration::from_millis(self.poll_quantum_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    pub fn reap_poll_interval(&self) -> Duration {
        Duration::from_millis(self.reap_poll_interval_ms)
    }

    pub fn side_channel_wait(&self) -> Duration {
        Duration::from_millis(self.side_channel_wait_ms)
    }
}

/// Everything needed to launch one child process
///
/// A `LaunchSpec` is a plain value: a restarted process gets a brand-new
/// handle built from a clone of the same spec.
#[derive(Debug, Clone, Builder)]
#[builder(
    setter(into, strip_option),
    build_fn(validate = "Self::validate", error = "ProcessError")
)]
pub struct LaunchSpec {
    /// Shell command line (`/bin/sh -c` on POSIX, `cmd /C` on Windows)
    pub command: String,
    #[builder(default)]
    pub working_directory: Option<PathBuf>,
    #[builder(default)]
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    /// Start from the parent's environment before applying `env`
    #[builder(default = "true")]
    pub inherit_env: bool,
    #[builder(default)]
    pub input: Input,
    #[builder(default = "Some(Duration::from_secs(60))")]
    pub timeout: Option<Duration>,
    #[builder(default)]
    pub idle_timeout: Option<Duration>,
    #[builder(default)]
    pub tty: bool,
    #[builder(default)]
    pub pty: bool,
    #[builder(default)]
    pub output_disabled: bool,
    /// Recover pid and exit code through an out-of-band descriptor (POSIX only)
    #[builder(default)]
    pub sigchild_compat: bool,
    #[builder(default)]
    pub timings: Timings,
}

impl LaunchSpec {
    pub fn builder() -> LaunchSpecBuilder {
        LaunchSpecBuilder::default()
    }

    /// Shorthand for a spec with every option at its default
    pub fn new(command: impl Into<String>) -> Result<Self> {
        Self::builder().command(command).build()
    }

    /// Check the same rules the builder enforces
    ///
    /// Fields are public, so a spec edited after `build()` is checked again
    /// before it is launched.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(ProcessError::configuration("The command line is empty."));
        }

        if self.idle_timeout.is_some() && self.output_disabled {
            return Err(ProcessError::configuration(
                "Idle timeout can not be set while the output is disabled.",
            ));
        }

        self.timings.validate()
    }
}

impl LaunchSpecBuilder {
    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());

        self
    }

    pub fn env_multi<T: ToString, I: IntoIterator<Item = (T, T)>>(&mut self, iter: I) -> &mut Self {
        let env = self.env.get_or_insert_with(HashMap::new);
        for (key, value) in iter {
            env.insert(key.to_string(), value.to_string());
        }
        self
    }

    /// Disable the overall deadline
    pub fn no_timeout(&mut self) -> &mut Self {
        self.timeout = Some(None);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.command.as_deref() == Some("") {
            return Err(ProcessError::configuration("The command line is empty."));
        }

        let idle_timeout = self.idle_timeout.flatten();
        if idle_timeout.is_some() && self.output_disabled == Some(true) {
            return Err(ProcessError::configuration(
                "Idle timeout can not be set while the output is disabled.",
            ));
        }

        if let Some(timings) = &self.timings {
            timings.validate()?;
        }

        Ok(())
    }
}

/// Convert a timeout expressed in (fractional) seconds
///
/// `0` disables the deadline, negative or non-finite values are rejected.
pub fn timeout_from_secs(secs: f64) -> Result<Option<Duration>> {
    if secs == 0.0 {
        return Ok(None);
    }

    if secs < 0.0 {
        return Err(ProcessError::configuration(
            "The timeout value must be a valid positive integer or float number.",
        ));
    }

    Duration::try_from_secs_f64(secs)
        .map(Some)
        .map_err(|e| ProcessError::configuration(format!("Invalid timeout {secs}: {e}")))
}

// Default value functions for serde
fn default_poll_quantum_ms() -> u64 {
    200
}
fn default_chunk_size() -> usize {
    16384
}
fn default_stop_poll_interval_ms() -> u64 {
    1
}
fn default_reap_poll_interval_ms() -> u64 {
    1
}
fn default_side_channel_wait_ms() -> u64 {
    2_000
}
