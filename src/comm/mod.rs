//! Transport comms behind one contract
//!
//! A comm moves PDU bodies for resolved keys over one transport. The raw
//! family (UDP, TCP, WebSocket) frames bodies with the packet codec and
//! delivers inbound frames through a registered callback; the SHM family
//! talks to a host simulator runtime directly and also supports synchronous
//! reads. Endpoints own comms through this trait and never see the
//! transport underneath.

use crate::error::Result;
use crate::pdudef::PduDefinition;
use crate::types::PduResolvedKey;
use std::path::Path;
use std::sync::Arc;

mod raw;
pub mod shm;
mod tcp;
mod tcp_mux;
mod udp;
mod websocket;

pub use raw::FrameLink;
pub use shm::ShmComm;
pub use tcp::TcpComm;
pub use tcp_mux::{CommMultiplexer, TcpCommMultiplexer};
pub use udp::UdpComm;
pub use websocket::WebSocketComm;

/// Callback invoked with the resolved key and body of every received PDU
pub type RecvCallback = Arc<dyn Fn(&PduResolvedKey, &[u8]) + Send + Sync>;

/// Transport contract used by endpoints
pub trait PduComm: Send + Sync {
    /// Pre-open hook for comms that must allocate PDU channels in advance.
    /// Callers may skip this and just use `open`.
    fn create_pdu_lchannels(&self, _config_path: &Path) -> Result<()> {
        Ok(())
    }

    /// Load comm configuration. Callable once per instance.
    fn open(&self, config_path: &Path) -> Result<()>;

    /// Close and release resources. Idempotent.
    fn close(&self) -> Result<()>;

    /// Start background processing if any.
    fn start(&self) -> Result<()>;

    /// Optional extra setup after `start`.
    fn post_start(&self) -> Result<()> {
        Ok(())
    }

    /// Stop background processing if any.
    fn stop(&self) -> Result<()>;

    fn is_running(&self) -> bool;

    /// Send PDU data for a resolved key.
    fn send(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()>;

    /// Synchronous receive. Raw comms return `Unsupported`; receive data
    /// flows through the callback instead.
    fn recv(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize>;

    fn set_on_recv_callback(&self, callback: RecvCallback);

    /// Only meaningful for SHM poll comms; everything else is a no-op.
    fn process_recv_events(&self) {}

    fn set_pdu_definition(&self, _def: Arc<PduDefinition>) {}
}
