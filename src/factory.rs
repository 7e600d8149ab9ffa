//! Cache and comm construction from config files
//!
//! Endpoints never name concrete cache or comm types; the factories pick
//! the variant from the JSON config at runtime.

use crate::cache::{LatestCache, PduCache, QueueCache};
use crate::comm::shm::{self, ShmComm};
use crate::comm::{PduComm, TcpComm, UdpComm, WebSocketComm};
use crate::error::{Error, Result};
use std::path::Path;
use std::sync::Arc;

fn load_json(config_path: &Path) -> Result<serde_json::Value> {
    let text = std::fs::read_to_string(config_path)
        .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
    Ok(serde_json::from_str(&text)?)
}

/// Create a cache from its config file (`store.mode` selects the variant).
/// The caller still opens it.
pub fn create_cache(config_path: &Path) -> Result<Arc<dyn PduCache>> {
    let config = load_json(config_path)?;
    let mode = config
        .pointer("/store/mode")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::InvalidConfig("cache config missing store.mode".to_string()))?;

    match mode {
        "latest" => Ok(Arc::new(LatestCache::new())),
        "queue" => Ok(Arc::new(QueueCache::new())),
        other => Err(Error::InvalidConfig(format!(
            "unknown cache mode '{}'",
            other
        ))),
    }
}

/// Create a comm from its config file (`protocol` selects the transport).
/// The caller still opens it.
pub fn create_comm(config_path: &Path) -> Result<Arc<dyn PduComm>> {
    let config = load_json(config_path)?;
    let protocol = config
        .get("protocol")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::InvalidConfig("comm config missing protocol".to_string()))?;

    match protocol {
        "udp" => Ok(Arc::new(UdpComm::new())),
        "tcp" => Ok(Arc::new(TcpComm::new())),
        "websocket" => Ok(Arc::new(WebSocketComm::new())),
        "shm" => {
            let runtime = shm::default_runtime().ok_or_else(|| {
                Error::InvalidConfig("no shared-memory runtime registered".to_string())
            })?;
            Ok(Arc::new(ShmComm::new(runtime)))
        }
        other => Err(Error::InvalidConfig(format!(
            "unknown comm protocol '{}'",
            other
        ))),
    }
}
