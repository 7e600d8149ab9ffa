//! Time sources for packet timestamps and paced loops
//!
//! Outgoing frames carry a microsecond timestamp in their header, and
//! simulation hosts pace their cycles by a fixed delta step. A time source
//! bundles both: a monotonic clock and the configured step. The real source
//! follows the wall clock from its creation; the virtual source only moves
//! when advanced, which keeps simulated runs deterministic.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of microsecond timestamps with a configured cycle step
pub trait TimeSource: Send + Sync {
    /// Elapsed time in microseconds since the source started
    fn now_usec(&self) -> i64;

    /// The configured cycle step in microseconds
    fn delta_usec(&self) -> i64;

    /// Block (or advance, for virtual time) for one cycle step
    fn sleep_delta(&self);

    /// Move virtual time forward. Real sources ignore this.
    fn advance_usec(&self, _delta: i64) {}
}

/// Monotonic wall-clock time, counted from construction
#[derive(Debug)]
pub struct RealTimeSource {
    start: Instant,
    delta_usec: i64,
}

impl RealTimeSource {
    pub fn new() -> Self {
        Self::with_delta(0)
    }

    pub fn with_delta(delta_usec: i64) -> Self {
        Self {
            start: Instant::now(),
            delta_usec,
        }
    }
}

impl Default for RealTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for RealTimeSource {
    fn now_usec(&self) -> i64 {
        self.start.elapsed().as_micros() as i64
    }

    fn delta_usec(&self) -> i64 {
        self.delta_usec
    }

    fn sleep_delta(&self) {
        if self.delta_usec > 0 {
            std::thread::sleep(Duration::from_micros(self.delta_usec as u64));
        }
    }
}

/// Manually advanced time for simulation and deterministic tests
#[derive(Debug)]
pub struct VirtualTimeSource {
    now_usec: AtomicI64,
    delta_usec: i64,
}

impl VirtualTimeSource {
    pub fn new() -> Self {
        Self::with_delta(0)
    }

    pub fn with_delta(delta_usec: i64) -> Self {
        Self {
            now_usec: AtomicI64::new(0),
            delta_usec,
        }
    }

    pub fn set_usec(&self, usec: i64) {
        self.now_usec.store(usec, Ordering::SeqCst);
    }
}

impl Default for VirtualTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for VirtualTimeSource {
    fn now_usec(&self) -> i64 {
        self.now_usec.load(Ordering::SeqCst)
    }

    fn delta_usec(&self) -> i64 {
        self.delta_usec
    }

    /// Virtual time does not block; a cycle step just moves the clock.
    fn sleep_delta(&self) {
        self.advance_usec(self.delta_usec);
    }

    fn advance_usec(&self, delta: i64) {
        self.now_usec.fetch_add(delta, Ordering::SeqCst);
    }
}

/// Build a time source from its config name (`"real"` or `"virtual"`).
///
/// A simulator-backed source is the host's business: implement
/// [`TimeSource`] over the simulator clock and hand it to the comms
/// directly.
pub fn create_time_source(kind: &str, delta_usec: i64) -> Result<Arc<dyn TimeSource>> {
    match kind {
        "real" => Ok(Arc::new(RealTimeSource::with_delta(delta_usec))),
        "virtual" => Ok(Arc::new(VirtualTimeSource::with_delta(delta_usec))),
        other => Err(Error::InvalidConfig(format!(
            "unknown time source type '{}'",
            other
        ))),
    }
}
