use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Error captured on a failed execution attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
}

impl EventError {
    pub fn new(err: &anyhow::Error) -> Self {
        // Alternate formatting keeps the full cause chain so the original
        // error text stays visible in the record.
        Self {
            message: format!("{err:#}"),
        }
    }
}

/// One render+apply attempt for a task.
///
/// Invariants: `end_time >= start_time`; a successful event carries no
/// `event_error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub success: bool,
    pub event_error: Option<EventError>,
}

impl Event {
    /// Start recording an attempt. The end time is stamped by [`Event::end`].
    pub fn begin(task_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            task_name: task_name.into(),
            start_time: now,
            end_time: now,
            success: false,
            event_error: None,
        }
    }

    /// Close out the attempt, marking success when no error is given.
    pub fn end(mut self, err: Option<&anyhow::Error>) -> Self {
        self.end_time = Utc::now();
        match err {
            Some(err) => {
                self.success = false;
                self.event_error = Some(EventError::new(err));
            }
            None => {
                self.success = true;
                self.event_error = None;
            }
        }
        self
    }
}
