//! SetuPdu - PDU messaging endpoints over pluggable transports
//!
//! This library gives a simulation or robotics process a uniform way to
//! publish and consume named PDUs (messages routed by robot name and
//! channel id) across in-process buffers, UDP, TCP, WebSocket and shared
//! memory, without tying application code to any one transport.
//!
//! The central object is the [`Endpoint`]: a cache plus an optional comm
//! behind one send/recv/subscribe API. [`EndpointContainer`] materializes a
//! node's endpoints from a JSON manifest; [`EndpointCommMultiplexer`] turns
//! inbound TCP sessions into ready endpoints.

pub mod cache;
pub mod comm;
pub mod endpoint;
pub mod error;
pub mod factory;
pub mod net;
pub mod pdudef;
pub mod time_source;
pub mod types;
pub mod wire;

// Re-export commonly used types
pub use endpoint::{Endpoint, EndpointCommMultiplexer, EndpointContainer};
pub use error::{Error, Result};
pub use pdudef::{PduDef, PduDefinition};
pub use types::{Direction, PduKey, PduResolvedKey};
