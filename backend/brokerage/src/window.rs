//! Marketplace trading window.
//!
//! Trading is open for exactly one hour a day, evaluated in a single
//! reference timezone so that every caller sees the same window regardless
//! of their own locale. The default is 22:00–23:00 `Europe/London`.
//!
//! The gate is hour-exact: 22:00:00 is open, 22:59:59 is open, 23:00:00 is
//! closed. There is no minute-level fencing at either edge.

use std::fmt;

use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use serde::Serialize;

use crate::errors::{BrokerageError, Result};

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Europe::London;
pub const DEFAULT_OPEN_HOUR: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowGate {
    timezone: Tz,
    open_hour: u32,
}

/// Time left until the window changes state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum TimeRemaining {
    /// Window is open; minutes until it closes.
    ClosesIn { minutes: u32 },
    /// Window is closed; whole hours until it next opens.
    OpensIn { hours: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub is_open: bool,
    pub time_remaining: TimeRemaining,
}

impl WindowGate {
    pub fn new(timezone: Tz, open_hour: u32) -> Result<Self> {
        if open_hour > 23 {
            return Err(BrokerageError::Config(format!(
                "market open hour must be 0-23, got {open_hour}"
            )));
        }
        Ok(Self {
            timezone,
            open_hour,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    pub fn open_hour(&self) -> u32 {
        self.open_hour
    }

    /// `true` iff the reference-timezone hour equals the opening hour.
    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        now.with_timezone(&self.timezone).hour() == self.open_hour
    }

    pub fn status(&self, now: DateTime<Utc>) -> WindowStatus {
        let local = now.with_timezone(&self.timezone);
        let hour = local.hour();

        if hour == self.open_hour {
            return WindowStatus {
                is_open: true,
                time_remaining: TimeRemaining::ClosesIn {
                    minutes: 60 - local.minute(),
                },
            };
        }

        let hours = (self.open_hour as i32 - hour as i32).rem_euclid(24) as u32;
        WindowStatus {
            is_open: false,
            time_remaining: TimeRemaining::OpensIn {
                // Unreachable while closed, but never report "0 hours".
                hours: if hours == 0 { 24 } else { hours },
            },
        }
    }
}

impl Default for WindowGate {
    fn default() -> Self {
        Self {
            timezone: DEFAULT_TIMEZONE,
            open_hour: DEFAULT_OPEN_HOUR,
        }
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ClosesIn { minutes } => {
                write!(f, "{minutes} minute{}", plural(minutes))
            }
            Self::OpensIn { hours } => write!(f, "Opens in {hours} hour{}", plural(hours)),
        }
    }
}

impl From<TimeRemaining> for String {
    fn from(value: TimeRemaining) -> Self {
        value.to_string()
    }
}

fn plural(n: u32) -> &'static str {
    if n == 1 {
        ""
    } else {
        "s"
    }
}
