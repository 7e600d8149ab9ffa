//! Endpoint-level comm multiplexer
//!
//! Wraps a comm multiplexer and turns each accepted session into a fresh,
//! started endpoint. Every session endpoint reuses the same endpoint config,
//! so cache and subscriber wiring are identical across sessions.

use crate::comm::{CommMultiplexer, TcpCommMultiplexer};
use crate::endpoint::{resolve_under, Endpoint};
use crate::error::{Error, Result};
use crate::types::Direction;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Produces ready endpoints from inbound mux sessions. Protocol-agnostic:
/// the comm multiplexer is selected by the comm config.
pub struct EndpointCommMultiplexer {
    name: String,
    direction: Direction,
    comm: Mutex<Option<Arc<dyn CommMultiplexer>>>,
    endpoint_config_path: Mutex<Option<PathBuf>>,
    endpoint_seq: AtomicUsize,
}

impl EndpointCommMultiplexer {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            comm: Mutex::new(None),
            endpoint_config_path: Mutex::new(None),
            endpoint_seq: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn create_comm_mux(comm_config_path: &Path) -> Result<Arc<dyn CommMultiplexer>> {
        let text = std::fs::read_to_string(comm_config_path)
            .map_err(|_| Error::FileNotFound(comm_config_path.display().to_string()))?;
        let config: serde_json::Value = serde_json::from_str(&text)?;
        let protocol = config
            .get("protocol")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| Error::InvalidConfig("mux comm config missing protocol".to_string()))?;
        match protocol {
            "tcp" => Ok(Arc::new(TcpCommMultiplexer::new())),
            other => Err(Error::InvalidConfig(format!(
                "no comm multiplexer for protocol '{}'",
                other
            ))),
        }
    }

    /// Load the endpoint-level mux config and open the comm multiplexer.
    pub fn open(&self, endpoint_mux_config_path: &Path) -> Result<()> {
        if self.comm.lock().is_some() {
            return Err(Error::Busy);
        }

        let base_dir = endpoint_mux_config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let text = std::fs::read_to_string(endpoint_mux_config_path)
            .map_err(|_| Error::FileNotFound(endpoint_mux_config_path.display().to_string()))?;
        let config: serde_json::Value = serde_json::from_str(&text)?;

        if config.get("cache").map_or(true, serde_json::Value::is_null) {
            return Err(Error::InvalidConfig(
                "mux endpoint config missing cache".to_string(),
            ));
        }
        let comm_rel = match config.get("comm").and_then(serde_json::Value::as_str) {
            Some(path) => path,
            None => {
                return Err(Error::InvalidConfig(
                    "mux endpoint config missing comm".to_string(),
                ))
            }
        };

        let comm_config_path = resolve_under(&base_dir, comm_rel);
        let comm = Self::create_comm_mux(&comm_config_path)?;
        comm.open(&comm_config_path)?;

        *self.comm.lock() = Some(comm);
        *self.endpoint_config_path.lock() = Some(endpoint_mux_config_path.to_path_buf());
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        match self.comm.lock().as_ref() {
            Some(comm) => comm.close(),
            None => Ok(()),
        }
    }

    pub fn start(&self) -> Result<()> {
        match self.comm.lock().as_ref() {
            Some(comm) => comm.start(),
            None => Err(Error::InvalidConfig("mux is not open".to_string())),
        }
    }

    pub fn stop(&self) -> Result<()> {
        match self.comm.lock().as_ref() {
            Some(comm) => comm.stop(),
            None => Ok(()),
        }
    }

    /// Non-blocking: wrap any newly accepted sessions into opened, started
    /// endpoints. Sessions that fail to open or start are discarded without
    /// affecting their siblings.
    pub fn take_endpoints(&self) -> Vec<Arc<Endpoint>> {
        let mut endpoints = Vec::new();
        let comm = match self.comm.lock().clone() {
            Some(comm) => comm,
            None => return endpoints,
        };
        let config_path = match self.endpoint_config_path.lock().clone() {
            Some(path) => path,
            None => return endpoints,
        };

        for session in comm.take_sessions() {
            let seq = self.endpoint_seq.fetch_add(1, Ordering::SeqCst) + 1;
            let endpoint = Arc::new(Endpoint::new(
                format!("{}_{}", self.name, seq),
                self.direction,
            ));
            endpoint.set_comm(session);

            if let Err(e) = endpoint.open(&config_path) {
                log::error!("mux endpoint open failed: {}", e);
                continue;
            }
            if let Err(e) = endpoint.start() {
                log::error!("mux endpoint start failed: {}", e);
                let _ = endpoint.close();
                continue;
            }
            let _ = endpoint.post_start();

            endpoints.push(endpoint);
        }
        endpoints
    }

    pub fn connected_count(&self) -> usize {
        self.comm
            .lock()
            .as_ref()
            .map(|c| c.connected_count())
            .unwrap_or(0)
    }

    pub fn expected_count(&self) -> usize {
        self.comm
            .lock()
            .as_ref()
            .map(|c| c.expected_count())
            .unwrap_or(0)
    }

    pub fn is_ready(&self) -> bool {
        self.comm
            .lock()
            .as_ref()
            .map(|c| c.is_ready())
            .unwrap_or(false)
    }
}
