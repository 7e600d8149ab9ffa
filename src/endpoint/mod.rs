//! Endpoints: one cache plus an optional comm behind a single API
//!
//! An endpoint is the application-facing object of the stack. `send` and
//! `recv` hide whether bytes go through a network comm, shared memory, or
//! only the in-process cache. When a comm is bound, received PDUs are
//! written into the cache and fanned out to subscribers; cache-only
//! endpoints fan out synchronously on the sending thread.

use crate::cache::PduCache;
use crate::comm::{PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::factory;
use crate::pdudef::PduDefinition;
use crate::types::{Direction, PduKey, PduResolvedKey};
use parking_lot::Mutex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

mod container;
mod mux;

pub use container::EndpointContainer;
pub use mux::EndpointCommMultiplexer;

#[derive(Debug, Deserialize)]
struct EndpointConfig {
    #[serde(default)]
    pdu_def_path: Option<String>,
    #[serde(default)]
    cache: Option<String>,
    #[serde(default)]
    comm: Option<String>,
}

pub(crate) fn resolve_under(base_dir: &Path, maybe_rel: &str) -> PathBuf {
    let path = Path::new(maybe_rel);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

fn load_endpoint_config(config_path: &Path) -> Result<(EndpointConfig, PathBuf)> {
    let base_dir = config_path
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let text = std::fs::read_to_string(config_path)
        .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
    let root: serde_json::Value = serde_json::from_str(&text)?;
    let config: EndpointConfig = serde_json::from_value(root)
        .map_err(|e| Error::InvalidConfig(format!("bad endpoint config: {}", e)))?;
    Ok((config, base_dir))
}

type SubscriberList = Mutex<Vec<(PduResolvedKey, RecvCallback)>>;

// Copy the matching callbacks out of the lock before invoking them, so a
// subscriber may call back into the endpoint without deadlocking.
fn fan_out(subscribers: &SubscriberList, key: &PduResolvedKey, data: &[u8]) {
    let matched: Vec<RecvCallback> = subscribers
        .lock()
        .iter()
        .filter(|(k, _)| k == key)
        .map(|(_, callback)| Arc::clone(callback))
        .collect();
    for callback in matched {
        callback(key, data);
    }
}

/// A named, directional PDU endpoint
pub struct Endpoint {
    name: String,
    direction: Direction,
    pdu_def: Mutex<Option<Arc<PduDefinition>>>,
    cache: Mutex<Option<Arc<dyn PduCache>>>,
    comm: Mutex<Option<Arc<dyn PduComm>>>,
    injected_comm: Mutex<Option<Arc<dyn PduComm>>>,
    subscribers: Arc<SubscriberList>,
}

impl Endpoint {
    pub fn new(name: impl Into<String>, direction: Direction) -> Self {
        Self {
            name: name.into(),
            direction,
            pdu_def: Mutex::new(None),
            cache: Mutex::new(None),
            comm: Mutex::new(None),
            injected_comm: Mutex::new(None),
            subscribers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Inject a ready-made comm (e.g. a mux session) used by the next
    /// `open` instead of the factory.
    pub fn set_comm(&self, comm: Arc<dyn PduComm>) {
        *self.injected_comm.lock() = Some(comm);
    }

    /// Wire up the endpoint from its config file. Paths inside the config
    /// are resolved relative to the config file's directory.
    pub fn open(&self, config_path: &Path) -> Result<()> {
        if self.cache.lock().is_some() {
            return Err(Error::Busy);
        }
        let (config, base_dir) = load_endpoint_config(config_path)?;

        if let Some(def_path) = &config.pdu_def_path {
            let def = PduDefinition::load(&resolve_under(&base_dir, def_path))?;
            *self.pdu_def.lock() = Some(Arc::new(def));
        }

        let cache_path = config
            .cache
            .as_ref()
            .ok_or_else(|| Error::InvalidConfig("endpoint config missing cache".to_string()))?;
        let cache_path = resolve_under(&base_dir, cache_path);
        let cache = factory::create_cache(&cache_path)?;
        cache.open(&cache_path)?;
        *self.cache.lock() = Some(Arc::clone(&cache));

        if let Some(comm_path) = &config.comm {
            let comm_path = resolve_under(&base_dir, comm_path);
            let comm = match self.injected_comm.lock().take() {
                Some(comm) => comm,
                None => factory::create_comm(&comm_path)?,
            };
            if let Some(def) = self.pdu_def.lock().clone() {
                comm.set_pdu_definition(def);
            }
            comm.open(&comm_path)?;

            // received bytes land in the cache, then subscribers fire
            let recv_cache = Arc::clone(&cache);
            let subscribers = Arc::clone(&self.subscribers);
            comm.set_on_recv_callback(Arc::new(move |key, data| {
                if let Err(e) = recv_cache.write(key, data) {
                    log::warn!("recv write to cache failed for {}: {}", key, e);
                    return;
                }
                fan_out(&subscribers, key, data);
            }));
            *self.comm.lock() = Some(comm);
        }
        Ok(())
    }

    /// Pre-create PDU channels for transports that need them before the
    /// runtime starts. Walks the same config as `open` without opening.
    pub fn create_pdu_lchannels(&self, config_path: &Path) -> Result<()> {
        let (config, base_dir) = load_endpoint_config(config_path)?;

        let pdu_def = match &config.pdu_def_path {
            Some(def_path) => Some(Arc::new(PduDefinition::load(&resolve_under(
                &base_dir, def_path,
            ))?)),
            None => self.pdu_def.lock().clone(),
        };

        if let Some(comm_path) = &config.comm {
            let comm_path = resolve_under(&base_dir, comm_path);
            let comm = match self.injected_comm.lock().clone() {
                Some(comm) => comm,
                None => factory::create_comm(&comm_path)?,
            };
            if let Some(def) = pdu_def {
                comm.set_pdu_definition(def);
            }
            comm.create_pdu_lchannels(&comm_path)?;
        }
        Ok(())
    }

    pub fn start(&self) -> Result<()> {
        let cache = self.cache.lock().clone().ok_or(Error::InvalidConfig(
            "endpoint is not open".to_string(),
        ))?;
        cache.start();
        if let Some(comm) = self.comm.lock().clone() {
            comm.start()?;
        }
        Ok(())
    }

    pub fn post_start(&self) -> Result<()> {
        match self.comm.lock().clone() {
            Some(comm) => comm.post_start(),
            None => Ok(()),
        }
    }

    pub fn stop(&self) -> Result<()> {
        let mut first_err = None;
        if let Some(comm) = self.comm.lock().clone() {
            if let Err(e) = comm.stop() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(cache) = self.cache.lock().clone() {
            cache.stop();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Close comm and cache, reporting the first error but always running
    /// both steps. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut first_err = None;
        if let Some(comm) = self.comm.lock().take() {
            if let Err(e) = comm.close() {
                first_err.get_or_insert(e);
            }
        }
        if let Some(cache) = self.cache.lock().take() {
            cache.close();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn is_running(&self) -> bool {
        let cache_running = self
            .cache
            .lock()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(false);
        let comm_running = self
            .comm
            .lock()
            .as_ref()
            .map(|c| c.is_running())
            .unwrap_or(true);
        cache_running && comm_running
    }

    /// Send PDU bytes. With a comm bound this is a pure transport send;
    /// subscribers fire when the bytes come back as a receive. Cache-only
    /// endpoints write the cache and fan out synchronously before
    /// returning.
    pub fn send(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()> {
        if let Some(comm) = self.comm.lock().clone() {
            return comm.send(key, data);
        }
        let cache = self.cache.lock().clone().ok_or(Error::NotRunning)?;
        cache.write(key, data)?;
        fan_out(&self.subscribers, key, data);
        Ok(())
    }

    /// Receive PDU bytes into `buf`. The cache is consulted first; a bound
    /// comm gets a chance when the cache has nothing (meaningful for shared
    /// memory, raw comms report `Unsupported` and the cache error stands).
    pub fn recv(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize> {
        let cache = self.cache.lock().clone().ok_or(Error::NotRunning)?;
        let cache_err = match cache.read(key, buf) {
            Ok(received) => return Ok(received),
            Err(e) => e,
        };
        if let Some(comm) = self.comm.lock().clone() {
            return match comm.recv(key, buf) {
                Ok(received) => Ok(received),
                Err(Error::Unsupported) => Err(cache_err),
                Err(e) => Err(e),
            };
        }
        Err(cache_err)
    }

    /// Register a callback for every delivery of `key`. Callbacks fire in
    /// subscription order on whichever thread produced the event.
    pub fn subscribe_on_recv_callback(&self, key: PduResolvedKey, callback: RecvCallback) {
        self.subscribers.lock().push((key, callback));
    }

    /// Drive poll-mode comms; no-op for everything else.
    pub fn process_recv_events(&self) {
        if let Some(comm) = self.comm.lock().clone() {
            comm.process_recv_events();
        }
    }

    fn resolve_key(&self, key: &PduKey) -> Result<PduResolvedKey> {
        let guard = self.pdu_def.lock();
        let def = guard.as_ref().ok_or(Error::Unsupported)?;
        let resolved = def
            .resolve(&key.robot, &key.pdu)
            .ok_or_else(|| Error::InvalidPduKey(format!("{}/{}", key.robot, key.pdu)))?;
        Ok(PduResolvedKey::new(key.robot.clone(), resolved.channel_id))
    }

    /// Name-based send; requires a loaded PDU definition.
    pub fn send_named(&self, key: &PduKey, data: &[u8]) -> Result<()> {
        let resolved = self.resolve_key(key)?;
        self.send(&resolved, data)
    }

    /// Name-based receive; requires a loaded PDU definition.
    pub fn recv_named(&self, key: &PduKey, buf: &mut [u8]) -> Result<usize> {
        let resolved = self.resolve_key(key)?;
        self.recv(&resolved, buf)
    }

    /// PDU byte size for a name-based key, 0 when unknown
    pub fn pdu_size(&self, key: &PduKey) -> usize {
        self.pdu_def
            .lock()
            .as_ref()
            .map(|def| def.pdu_size(&key.robot, &key.pdu))
            .unwrap_or(0)
    }

    /// Channel id for a name-based key
    pub fn pdu_channel_id(&self, key: &PduKey) -> Option<u32> {
        self.pdu_def
            .lock()
            .as_ref()
            .and_then(|def| def.channel_id(&key.robot, &key.pdu))
    }
}
