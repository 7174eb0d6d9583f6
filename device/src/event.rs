//! Completion events for asynchronous device operations.
//!
//! Every enqueue returns an [`Event`]. Its status only moves forward:
//!
//! ```text
//! QUEUED -> SUBMITTED -> RUNNING -> COMPLETE
//!                                \-> ERROR
//! ```
//!
//! `UNKNOWN` is terminal as well and marks commands that were dropped before running,
//! for example by a device reset. Timestamps are nanoseconds since the owning device
//! was created and are only recorded when the device supports profiling.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use snafu::ensure;

use crate::error::{DeviceExecutionSnafu, Result, TimeoutSnafu};
use crate::sync::Generation;

/// Events a command waits for before it may start.
pub type WaitList = SmallVec<[Event; 4]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(strum::Display, strum::EnumIter)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error,
    Unknown,
}

impl EventStatus {
    const fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Submitted => 1,
            Self::Running => 2,
            Self::Complete | Self::Error | Self::Unknown => 3,
        }
    }

    pub const fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Error | Self::Unknown)
    }
}

/// Profiling timestamps in nanoseconds relative to the device clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Timestamps {
    pub submit: Option<u64>,
    pub start: Option<u64>,
    pub end: Option<u64>,
}

/// Lets a waiter push a still-queued command to its device.
pub(crate) trait Flush: Send + Sync {
    fn flush(&self) -> Result<()>;
}

#[derive(Debug)]
struct EventState {
    status: EventStatus,
    timestamps: Timestamps,
    reason: Option<String>,
}

struct EventData {
    name: String,
    tag: u64,
    generation: Generation,
    clock: Instant,
    profiling: bool,
    queue: Weak<dyn Flush>,
    state: Mutex<EventState>,
    condvar: Condvar,
}

/// Handle to the completion of one enqueued operation.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventData>,
}

impl Event {
    pub(crate) fn new(
        description: &str,
        tag: u64,
        generation: Generation,
        clock: Instant,
        profiling: bool,
        queue: Weak<dyn Flush>,
    ) -> Self {
        let state = EventState { status: EventStatus::Queued, timestamps: Timestamps::default(), reason: None };
        Self {
            inner: Arc::new(EventData {
                name: format!("{description}: 0x{tag:x}"),
                tag,
                generation,
                clock,
                profiling,
                queue,
                state: Mutex::new(state),
                condvar: Condvar::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Queue-local sequence number.
    pub fn tag(&self) -> u64 {
        self.inner.tag
    }

    /// Device generation the event was created in.
    pub fn generation(&self) -> u64 {
        self.inner.generation.value()
    }

    pub fn is_stale(&self) -> bool {
        self.inner.generation.is_stale()
    }

    pub fn ensure_current(&self) -> Result<()> {
        self.inner.generation.ensure_current(format!("event '{}'", self.inner.name))
    }

    pub fn status(&self) -> EventStatus {
        self.inner.state.lock().status
    }

    pub fn is_complete(&self) -> bool {
        self.status() == EventStatus::Complete
    }

    pub fn timestamps(&self) -> Timestamps {
        self.inner.state.lock().timestamps
    }

    /// Failure reason for events that ended in `ERROR` or `UNKNOWN`.
    pub fn failure(&self) -> Option<String> {
        self.inner.state.lock().reason.clone()
    }

    /// Device-side execution time, `end - start`.
    pub fn execution_time(&self) -> Option<Duration> {
        let Timestamps { start, end, .. } = self.timestamps();
        Some(Duration::from_nanos(end?.saturating_sub(start?)))
    }

    pub fn execution_time_secs(&self) -> Option<f64> {
        self.execution_time().map(|time| time.as_secs_f64())
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Block until the operation finishes.
    ///
    /// A still-queued command is flushed to its device first. Waiting on an event
    /// from an earlier device generation fails with `StaleHandle`; an operation that
    /// ended in `ERROR` or `UNKNOWN` fails with `DeviceExecution`.
    pub fn wait_on(&self) -> Result<()> {
        self.ensure_current()?;
        self.flush_if_queued()?;

        let mut state = self.inner.state.lock();
        while !state.status.is_terminal() {
            self.inner.condvar.wait(&mut state);
        }
        self.outcome(&state)
    }

    /// Like [`Event::wait_on`], giving up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        self.ensure_current()?;
        self.flush_if_queued()?;

        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while !state.status.is_terminal() {
            let timed_out = self.inner.condvar.wait_until(&mut state, deadline).timed_out();
            ensure!(
                !timed_out || state.status.is_terminal(),
                TimeoutSnafu {
                    operation: self.inner.name.clone(),
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            );
        }
        self.outcome(&state)
    }

    fn flush_if_queued(&self) -> Result<()> {
        if self.status() == EventStatus::Queued
            && let Some(queue) = self.inner.queue.upgrade()
        {
            queue.flush()?;
        }
        Ok(())
    }

    fn outcome(&self, state: &EventState) -> Result<()> {
        self.ensure_current()?;
        match state.status {
            EventStatus::Complete => Ok(()),
            status => DeviceExecutionSnafu {
                operation: self.inner.name.clone(),
                status,
                reason: state.reason.clone().unwrap_or_default(),
            }
            .fail(),
        }
    }

    fn elapsed_nanos(&self) -> u64 {
        u64::try_from(self.inner.clock.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    fn transition(&self, status: EventStatus, reason: Option<String>) -> bool {
        let mut state = self.inner.state.lock();
        if state.status.is_terminal() || status.rank() <= state.status.rank() {
            return false;
        }

        if self.inner.profiling {
            let now = self.elapsed_nanos();
            match status {
                EventStatus::Queued => {}
                EventStatus::Submitted => state.timestamps.submit = Some(now),
                EventStatus::Running => state.timestamps.start = Some(now),
                EventStatus::Complete | EventStatus::Error | EventStatus::Unknown => state.timestamps.end = Some(now),
            }
        }
        state.status = status;
        state.reason = reason;
        drop(state);

        self.inner.condvar.notify_all();
        true
    }

    pub(crate) fn mark_submitted(&self) {
        self.transition(EventStatus::Submitted, None);
    }

    /// Driver side: the command started executing.
    pub fn mark_running(&self) {
        self.transition(EventStatus::Running, None);
    }

    /// Driver side: the command finished successfully.
    pub fn mark_complete(&self) {
        self.transition(EventStatus::Complete, None);
    }

    /// Driver side: the command failed.
    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.transition(EventStatus::Error, Some(reason.into()));
    }

    /// The command will never run.
    pub(crate) fn abandon(&self, reason: &str) {
        if self.transition(EventStatus::Unknown, Some(reason.to_string())) {
            tracing::trace!(event = %self.inner.name, reason, "event abandoned");
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.inner.name)
            .field("generation", &self.inner.generation.value())
            .field("status", &self.status())
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.status(), self.inner.name)
    }
}
