//! Device generations.
//!
//! A device's generation is a monotonically increasing counter that advances on every
//! reset. Buffers and events capture the generation they were created in and become
//! stale as soon as the device moves past it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use snafu::ensure;

use crate::error::{Result, StaleHandleSnafu};

/// Shared generation counter of one device.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    value: AtomicU64,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Move to the next generation and return it.
    ///
    /// Callers must hold the owning device's state lock so that buffer table changes
    /// and the generation bump are observed together.
    pub(crate) fn advance(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A generation captured at creation time of a buffer or event.
#[derive(Debug, Clone)]
pub struct Generation {
    counter: Arc<GenerationCounter>,
    value: u64,
}

impl Generation {
    pub fn capture(counter: &Arc<GenerationCounter>) -> Self {
        Self { counter: Arc::clone(counter), value: counter.current() }
    }

    /// The generation this handle was created in.
    pub fn value(&self) -> u64 {
        self.value
    }

    /// The owning device's generation right now.
    pub fn current(&self) -> u64 {
        self.counter.current()
    }

    pub fn is_stale(&self) -> bool {
        self.current() != self.value
    }

    pub fn ensure_current(&self, what: impl Into<String>) -> Result<()> {
        let current = self.current();
        ensure!(current == self.value, StaleHandleSnafu { what: what.into(), generation: self.value, current });
        Ok(())
    }
}
