//! Emulator configuration

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Clock driving timeouts and the guest tick counter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeSourceKind {
    /// Host monotonic clock
    #[default]
    Host,
    /// Advanced explicitly; deterministic
    Manual,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Emulated CPU cores
    pub cores: usize,
    /// Upper bound on instructions per translated block
    pub max_block_insts: usize,
    /// Instructions a thread runs before it is rotated
    pub slice_budget: u64,
    /// Skip translation and interpret every instruction
    pub interpreter_only: bool,
    /// Handles per process
    pub handle_capacity: usize,
    /// Threads per process
    pub max_threads: usize,
    /// Requests a session queues before senders get `Busy`
    pub session_capacity: usize,
    /// Sessions a port accepts when the creator does not say
    pub default_max_sessions: usize,
    pub time_source: TimeSourceKind,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        EmulatorConfig {
            cores: 4,
            max_block_insts: 64,
            slice_budget: 10_000,
            interpreter_only: false,
            handle_capacity: 1024,
            max_threads: 256,
            session_capacity: 16,
            default_max_sessions: 64,
            time_source: TimeSourceKind::Host,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("core count must be between 1 and 64, got {0}")]
    Cores(usize),
    #[error("{0} must be non-zero")]
    Zero(&'static str),
}

impl EmulatorConfig {
    /// Deterministic single-core setup used by tests and the wasm facade
    pub fn deterministic(cores: usize) -> Self {
        EmulatorConfig { cores, time_source: TimeSourceKind::Manual, ..Default::default() }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cores == 0 || self.cores > 64 {
            return Err(ConfigError::Cores(self.cores));
        }
        for (name, value) in [
            ("max_block_insts", self.max_block_insts as u64),
            ("slice_budget", self.slice_budget),
            ("handle_capacity", self.handle_capacity as u64),
            ("max_threads", self.max_threads as u64),
            ("session_capacity", self.session_capacity as u64),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }
        Ok(())
    }

    /// Mask with one bit per emulated core
    pub fn core_mask(&self) -> u64 {
        if self.cores >= 64 {
            u64::MAX
        } else {
            (1u64 << self.cores) - 1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EmulatorConfig::default();
        assert_eq!(config.cores, 4);
        assert_eq!(config.max_block_insts, 64);
        assert_eq!(config.slice_budget, 10_000);
        assert_eq!(config.handle_capacity, 1024);
        assert_eq!(config.max_threads, 256);
        assert_eq!(config.core_mask(), 0xF);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let config = EmulatorConfig { cores: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Cores(0)));
        let config = EmulatorConfig { slice_budget: 0, ..Default::default() };
        assert_eq!(config.validate(), Err(ConfigError::Zero("slice_budget")));
    }
}
