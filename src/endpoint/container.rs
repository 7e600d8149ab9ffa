//! Manifest-driven endpoint container
//!
//! Owns every endpoint of one node id. The container manifest is an array
//! of node entries; only the entry matching this container's node id is
//! used. `initialize` creates and opens each declared endpoint, rolling
//! everything back on the first failure; `start_all`/`stop_all` drive the
//! whole set.

use crate::endpoint::{resolve_under, Endpoint};
use crate::error::{Error, Result};
use crate::types::Direction;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct NodeEntry {
    #[serde(rename = "nodeId")]
    node_id: String,
    endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Deserialize)]
struct EndpointDescriptor {
    id: String,
    config_path: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    mode: Option<String>,
}

#[derive(Debug, Clone)]
struct EndpointEntry {
    id: String,
    config_path: PathBuf,
    direction: Direction,
    // declared in the manifest but not interpreted by the container
    #[allow(dead_code)]
    mode: Option<String>,
}

#[derive(Default)]
struct ContainerState {
    entries: Vec<EndpointEntry>,
    endpoints: HashMap<String, Arc<Endpoint>>,
    started: HashMap<String, bool>,
    initialized: bool,
    last_error: String,
}

/// Lifecycle owner for the endpoints of a single node id
pub struct EndpointContainer {
    node_id: String,
    container_config_path: PathBuf,
    state: Mutex<ContainerState>,
}

impl EndpointContainer {
    pub fn new(node_id: impl Into<String>, container_config_path: impl Into<PathBuf>) -> Self {
        Self {
            node_id: node_id.into(),
            container_config_path: container_config_path.into(),
            state: Mutex::new(ContainerState::default()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Human-readable detail of the most recent failure
    pub fn last_error(&self) -> String {
        self.state.lock().last_error.clone()
    }

    fn parse_entries(&self, state: &mut ContainerState) -> Result<Vec<EndpointEntry>> {
        let text = std::fs::read_to_string(&self.container_config_path).map_err(|_| {
            state.last_error = format!(
                "failed to open container config: {}",
                self.container_config_path.display()
            );
            Error::FileNotFound(self.container_config_path.display().to_string())
        })?;
        let root: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            state.last_error = format!("invalid JSON: {}", e);
            Error::InvalidJson(e.to_string())
        })?;
        let nodes: Vec<NodeEntry> = serde_json::from_value(root).map_err(|e| {
            state.last_error = format!("bad container manifest: {}", e);
            Error::InvalidConfig(e.to_string())
        })?;

        let node = match nodes.into_iter().find(|n| n.node_id == self.node_id) {
            Some(node) => node,
            None => {
                state.last_error = format!("no endpoint entry found for nodeId: {}", self.node_id);
                return Err(Error::NoEntry);
            }
        };

        let base_dir = self
            .container_config_path
            .parent()
            .unwrap_or_else(|| Path::new(""));
        Ok(node
            .endpoints
            .into_iter()
            .map(|descriptor| EndpointEntry {
                id: descriptor.id,
                config_path: resolve_under(base_dir, &descriptor.config_path),
                direction: descriptor
                    .direction
                    .as_deref()
                    .map(Direction::parse)
                    .unwrap_or(Direction::InOut),
                mode: descriptor.mode,
            })
            .collect())
    }

    fn rollback(state: &mut ContainerState) {
        for endpoint in state.endpoints.values() {
            let _ = endpoint.close();
        }
        state.endpoints.clear();
        state.started.clear();
    }

    /// Parse the manifest, create and open every endpoint of this node.
    /// Any failure closes the already-opened endpoints and leaves the
    /// container uninitialized.
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.initialized {
            state.last_error = "container is already initialized".to_string();
            return Err(Error::InvalidConfig(state.last_error.clone()));
        }
        state.last_error.clear();
        state.entries = self.parse_entries(&mut state)?;

        let entries = state.entries.clone();
        for entry in &entries {
            let endpoint = state
                .endpoints
                .entry(entry.id.clone())
                .or_insert_with(|| Arc::new(Endpoint::new(entry.id.clone(), entry.direction)))
                .clone();
            if let Err(e) = endpoint.open(&entry.config_path) {
                state.last_error = format!(
                    "endpoint open failed: id={} config={} err={}",
                    entry.id,
                    entry.config_path.display(),
                    e
                );
                Self::rollback(&mut state);
                return Err(e);
            }
            state.started.insert(entry.id.clone(), false);
        }

        state.initialized = true;
        Ok(())
    }

    /// Walk the manifest and pre-create PDU channels on every endpoint
    /// instead of opening them. Used by shared-memory transports that must
    /// allocate channels before the runtime starts.
    pub fn create_pdu_lchannels(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.last_error.clear();
        state.entries = self.parse_entries(&mut state)?;

        let entries = state.entries.clone();
        for entry in &entries {
            let endpoint = state
                .endpoints
                .entry(entry.id.clone())
                .or_insert_with(|| Arc::new(Endpoint::new(entry.id.clone(), entry.direction)))
                .clone();
            if let Err(e) = endpoint.create_pdu_lchannels(&entry.config_path) {
                state.last_error = format!(
                    "create_pdu_lchannels failed: id={} err={}",
                    entry.id, e
                );
                Self::rollback(&mut state);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Start every endpoint. Returns the first error but keeps starting the
    /// remaining endpoints; already-started endpoints are skipped.
    pub fn start_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.last_error.clear();
        if !state.initialized {
            state.last_error = "container is not initialized".to_string();
            return Err(Error::InvalidConfig(state.last_error.clone()));
        }

        let mut first_err = None;
        let ids: Vec<String> = state.endpoints.keys().cloned().collect();
        for id in ids {
            if state.started.get(&id).copied().unwrap_or(false) {
                continue;
            }
            let endpoint = Arc::clone(&state.endpoints[&id]);
            match endpoint.start() {
                Ok(()) => {
                    state.started.insert(id, true);
                }
                Err(e) => {
                    if first_err.is_none() {
                        state.last_error = format!("start_all failed at endpoint id={}: {}", id, e);
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop and close every endpoint, then forget them. The container must
    /// be initialized again before further use.
    pub fn stop_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.last_error.clear();
        if !state.initialized {
            state.last_error = "container is not initialized".to_string();
            return Err(Error::InvalidConfig(state.last_error.clone()));
        }

        let mut first_err = None;
        let mut first_err_msg = None;
        for (id, endpoint) in state.endpoints.iter() {
            if let Err(e) = endpoint.stop() {
                if first_err.is_none() {
                    first_err_msg =
                        Some(format!("stop_all: stop failed at endpoint id={}: {}", id, e));
                    first_err = Some(e);
                }
            }
            if let Err(e) = endpoint.close() {
                if first_err.is_none() {
                    first_err_msg =
                        Some(format!("stop_all: close failed at endpoint id={}: {}", id, e));
                    first_err = Some(e);
                }
            }
        }
        if let Some(msg) = first_err_msg {
            state.last_error = msg;
        }
        state.endpoints.clear();
        state.started.clear();
        state.initialized = false;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn start(&self, endpoint_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.last_error.clear();
        if !state.initialized {
            state.last_error = "container is not initialized".to_string();
            return Err(Error::InvalidConfig(state.last_error.clone()));
        }
        let endpoint = match state.endpoints.get(endpoint_id) {
            Some(endpoint) => Arc::clone(endpoint),
            None => {
                state.last_error = format!("start: endpoint not found: id={}", endpoint_id);
                return Err(Error::InvalidConfig(state.last_error.clone()));
            }
        };
        if state.started.get(endpoint_id).copied().unwrap_or(false) {
            return Ok(());
        }
        if let Err(e) = endpoint.start() {
            state.last_error = format!("start failed: id={}: {}", endpoint_id, e);
            return Err(e);
        }
        state.started.insert(endpoint_id.to_string(), true);
        Ok(())
    }

    /// Stop and close one endpoint and evict it so it can be re-created.
    /// Stopping an unknown endpoint is not an error.
    pub fn stop(&self, endpoint_id: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.last_error.clear();
        if !state.initialized {
            state.last_error = "container is not initialized".to_string();
            return Err(Error::InvalidConfig(state.last_error.clone()));
        }
        let endpoint = match state.endpoints.get(endpoint_id) {
            Some(endpoint) => Arc::clone(endpoint),
            None => return Ok(()),
        };

        let mut first_err = None;
        if let Err(e) = endpoint.stop() {
            state.last_error = format!("stop failed: id={}: {}", endpoint_id, e);
            first_err = Some(e);
        }
        if let Err(e) = endpoint.close() {
            if first_err.is_none() {
                state.last_error = format!("stop: close failed: id={}: {}", endpoint_id, e);
                first_err = Some(e);
            }
        }
        state.endpoints.remove(endpoint_id);
        state.started.remove(endpoint_id);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Borrow an endpoint by id
    pub fn ref_endpoint(&self, endpoint_id: &str) -> Option<Arc<Endpoint>> {
        let mut state = self.state.lock();
        state.last_error.clear();
        if !state.initialized {
            state.last_error = "container is not initialized".to_string();
            return None;
        }
        match state.endpoints.get(endpoint_id) {
            Some(endpoint) => Some(Arc::clone(endpoint)),
            None => {
                state.last_error = format!("ref: endpoint not found: id={}", endpoint_id);
                None
            }
        }
    }

    pub fn list_endpoint_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|e| e.id.clone())
            .collect()
    }

    pub fn is_running_all(&self) -> bool {
        let state = self.state.lock();
        if !state.initialized || state.endpoints.is_empty() {
            return false;
        }
        state.endpoints.values().all(|e| e.is_running())
    }
}
