//! Bounded time windows for telemetry queries.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A closed, bounded slice of history.
///
/// Uses a half-open interval `[start, end)` - start is inclusive, end is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    /// Create a window, rejecting `end < start`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        if end < start {
            return Err(Error::Configuration(format!(
                "window end {} is before start {}",
                end.to_rfc3339(),
                start.to_rfc3339()
            )));
        }
        Ok(Self { start, end })
    }

    /// Window from `start` up to now.
    pub fn until_now(start: DateTime<Utc>) -> Result<Self> {
        Self::new(start, Utc::now())
    }

    /// The last `duration` ending now.
    pub fn trailing(duration: Duration) -> Self {
        let end = Utc::now();
        Self {
            start: end - duration,
            end,
        }
    }

    /// Returns the duration of this window.
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Returns true if the given instant falls within this window.
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.start && instant < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}
