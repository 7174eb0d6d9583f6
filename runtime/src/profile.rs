use std::fmt;
use std::time::Duration;

use conduit_device::{EventStatus, Timestamps};

/// Profiling data of one task's last launch.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TaskProfile {
    pub task: String,
    pub device: Option<String>,
    /// `None` if the task has not been launched.
    pub status: Option<EventStatus>,
    pub timestamps: Timestamps,
}

impl TaskProfile {
    /// Kernel execution time, `end - start`.
    pub fn execution_time(&self) -> Option<Duration> {
        Some(Duration::from_nanos(self.timestamps.end?.saturating_sub(self.timestamps.start?)))
    }

    /// Time between submission and the kernel starting.
    pub fn queue_time(&self) -> Option<Duration> {
        Some(Duration::from_nanos(self.timestamps.start?.saturating_sub(self.timestamps.submit?)))
    }
}

impl fmt::Display for TaskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.task)?;
        if let Some(device) = &self.device {
            write!(f, " on {device}")?;
        }
        match self.status {
            Some(status) => write!(f, " [{status}]")?,
            None => write!(f, " [not launched]")?,
        }
        if let Some(time) = self.execution_time() {
            write!(f, " {:.6}s", time.as_secs_f64())?;
        }
        Ok(())
    }
}
