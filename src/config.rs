// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging core configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::LogError;

/// Tuning knobs for the logging core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogConfig {
    /// How long the I/O thread waits between polls of the swap ring.
    #[serde(default = "default_poll_period")]
    pub poll_period: Duration,

    /// Number of producer threads the swap ring is sized for. The ring gets
    /// `2 * max_threads` slots. Registration beyond this bound warns through
    /// the synchronous error path but still proceeds.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
}

fn default_poll_period() -> Duration {
    Duration::from_millis(10)
}

fn default_max_threads() -> usize {
    1024
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            poll_period: default_poll_period(),
            max_threads: default_max_threads(),
        }
    }
}

impl LogConfig {
    pub fn validate(&self) -> Result<(), LogError> {
        if self.max_threads == 0 {
            return Err(LogError::InvalidConfig(
                "max_threads must be nonzero".to_string(),
            ));
        }
        Ok(())
    }
}
