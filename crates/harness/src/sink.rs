//! Per-connection sample storage.
//!
//! A [`SampleSink`] is append-only while its connection is live and becomes
//! read-only once drained. Writers reach it through a [`SinkSlot`]; the
//! harness reclaims sole ownership of the sink only after every writer has
//! been dropped, so a drain can never race an append.

use std::sync::Arc;

use parking_lot::Mutex;
use wslat_core::error::FeedError;
use wslat_core::types::Sample;

/// Ordered samples for one logical connection.
///
/// Samples keep arrival order. `client_timestamp` is non-decreasing as long
/// as the injected clock is monotonic; the sink does not reorder.
#[derive(Debug, Default)]
pub struct SampleSink {
    samples: Vec<Sample>,
    drained: bool,
}

impl SampleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one sample. Fails once the sink has been drained.
    pub fn append(&mut self, sample: Sample) -> Result<(), FeedError> {
        if self.drained {
            return Err(FeedError::InvalidState(format!(
                "append of update {} after sink was drained",
                sample.update_id
            )));
        }
        self.samples.push(sample);
        Ok(())
    }

    /// Take every sample in arrival order and make the sink read-only.
    ///
    /// A second drain is an error rather than an empty series, so a result
    /// cannot silently lose data.
    pub fn drain(&mut self) -> Result<Vec<Sample>, FeedError> {
        if self.drained {
            return Err(FeedError::InvalidState("sink drained twice".to_string()));
        }
        self.drained = true;
        Ok(std::mem::take(&mut self.samples))
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn is_drained(&self) -> bool {
        self.drained
    }
}

/// Shared handle to a [`SampleSink`].
///
/// Cloned into the execution unit that writes the sink. Under the
/// shared-socket strategy all slots are written by the same receive loop.
#[derive(Debug, Clone, Default)]
pub struct SinkSlot {
    inner: Arc<Mutex<SampleSink>>,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append through the shared handle.
    pub fn append(&self, sample: Sample) -> Result<(), FeedError> {
        self.inner.lock().append(sample)
    }

    /// Number of samples recorded so far.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Take back exclusive ownership of the sink.
    ///
    /// Fails with [`FeedError::InvalidState`] while any other handle to the
    /// same sink is still alive, i.e. while its writer has not stopped.
    pub fn reclaim(self) -> Result<SampleSink, FeedError> {
        Arc::try_unwrap(self.inner)
            .map(Mutex::into_inner)
            .map_err(|_| FeedError::InvalidState("sink still has an active writer".to_string()))
    }
}
