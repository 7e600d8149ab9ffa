//! In-memory PDU stores
//!
//! A cache holds the most recent payload(s) per resolved key on behalf of an
//! endpoint. Two variants share the contract: [`LatestCache`] keeps a single
//! overwritten slot per key, [`QueueCache`] keeps a bounded FIFO. Writers are
//! usually comm receive threads; readers are application threads calling
//! `Endpoint::recv`. All access is serialized by one internal mutex per
//! cache instance.

use crate::error::Result;
use crate::types::PduResolvedKey;
use std::path::Path;

mod latest;
mod queue;

pub use latest::LatestCache;
pub use queue::QueueCache;

/// Store contract shared by the cache variants
pub trait PduCache: Send + Sync {
    /// Load store configuration. Callable once per instance.
    fn open(&self, config_path: &Path) -> Result<()>;

    /// Drop all entries and leave the stopped state. Idempotent.
    fn close(&self);

    fn start(&self);

    fn stop(&self);

    fn is_running(&self) -> bool;

    /// Store a payload for a key. Fails with `NotRunning` before `start`.
    fn write(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()>;

    /// Copy the stored payload for a key into `buf`, returning its length.
    ///
    /// Fails with `NoEntry` when nothing is stored and with
    /// `NoSpace { required }` when `buf` is too small; a queue keeps its
    /// head in place on `NoSpace` so the caller can retry with a larger
    /// buffer.
    fn read(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize>;
}
