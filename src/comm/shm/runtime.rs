//! Host runtime contract for the shared-memory transport
//!
//! The simulator process that hosts this library owns the actual shared
//! memory. The comm only sees this trait: channel allocation, PDU read/write
//! keyed by `(robot, channel_id)`, and receive-event plumbing. Callback-mode
//! runtimes announce new data by invoking [`crate::comm::shm::dispatch_recv_event`]
//! with the registered event id from a thread they own; poll-mode runtimes
//! answer [`ShmRuntime::poll_recv_event`] instead.

use crate::error::Result;

pub trait ShmRuntime: Send + Sync {
    /// Allocate a PDU channel. Called before `open` for every declared PDU.
    fn create_channel(&self, robot: &str, channel_id: u32, pdu_size: usize) -> Result<()>;

    fn write_pdu(&self, robot: &str, channel_id: u32, data: &[u8]) -> Result<()>;

    /// Read the current PDU into `buf`, returning the copied length.
    fn read_pdu(&self, robot: &str, channel_id: u32, buf: &mut [u8]) -> Result<usize>;

    /// Register interest in a channel and return a runtime-scoped event id.
    fn register_recv_event(&self, robot: &str, channel_id: u32) -> Result<i32>;

    /// Release an event registration made by `register_recv_event`.
    fn unregister_recv_event(&self, event_id: i32) -> Result<()>;

    /// Poll mode: report and clear the pending-data flag for one event.
    fn poll_recv_event(&self, event_id: i32) -> bool;
}
