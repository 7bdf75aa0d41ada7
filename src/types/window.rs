//! Arrival-time windows

use std::time::SystemTime;

/// Inclusive window over chunk arrival times. An unset bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: Option<SystemTime>,
    pub until: Option<SystemTime>,
}

impl TimeWindow {
    /// Every arrival time.
    pub const ALL: Self = Self { from: None, until: None };

    pub fn between(from: SystemTime, until: SystemTime) -> Self {
        Self { from: Some(from), until: Some(until) }
    }

    pub fn since(from: SystemTime) -> Self {
        Self { from: Some(from), until: None }
    }

    pub fn until(until: SystemTime) -> Self {
        Self { from: None, until: Some(until) }
    }

    pub fn contains(&self, at: SystemTime) -> bool {
        self.from.is_none_or(|from| at >= from) && self.until.is_none_or(|until| at <= until)
    }

    pub fn is_unbounded(&self) -> bool {
        self.from.is_none() && self.until.is_none()
    }
}
