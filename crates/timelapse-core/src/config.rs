use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::SessionError;
use crate::types::ResolutionClass;
use crate::{DEFAULT_SPEED_MULTIPLIER, OUTPUT_FPS};

/// Parameters accepted when a recording session starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How many times faster than real time the output plays back.
    #[serde(alias = "speedMultiplier")]
    pub speed_multiplier: u32,
    #[serde(alias = "targetResolutionClass")]
    pub resolution: ResolutionClass,
    #[serde(alias = "showTimestampOverlay")]
    pub show_timestamp: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            speed_multiplier: DEFAULT_SPEED_MULTIPLIER,
            resolution: ResolutionClass::default(),
            show_timestamp: false,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.speed_multiplier == 0 {
            return Err(SessionError::InvalidConfig {
                reason: "speed multiplier must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Spacing between capture requests: `(1000 ms / 30) × speed`.
    pub fn capture_interval(&self) -> Duration {
        let nanos = 1_000_000_000u64 * self.speed_multiplier as u64 / OUTPUT_FPS as u64;
        Duration::from_nanos(nanos)
    }

    /// [`capture_interval`](Self::capture_interval) rounded to whole milliseconds.
    pub fn capture_interval_ms(&self) -> u64 {
        let fps = OUTPUT_FPS as u64;
        (1000 * self.speed_multiplier as u64 + fps / 2) / fps
    }
}
