//! Shared-memory comm
//!
//! Bypasses the packet codec entirely: PDU bodies move through the host
//! simulator runtime's channels, keyed by `(robot, channel_id)`. Two receive
//! styles exist, selected by the `impl_type` config field:
//!
//! - **callback**: the runtime announces new data by calling
//!   [`dispatch_recv_event`] from a thread it owns; a process-wide registry
//!   routes the event id back to the owning comm.
//! - **poll**: the comm records `(key, event_id)` entries and
//!   `process_recv_events` queries the runtime for each one.
//!
//! `create_pdu_lchannels` must run before `open`; it allocates one channel
//! per declared PDU using sizes from the PDU definition.

use crate::comm::{PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::pdudef::PduDefinition;
use crate::types::PduResolvedKey;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

mod mock;
mod runtime;

pub use mock::MemoryShmRuntime;
pub use runtime::ShmRuntime;

// Routes runtime event ids to the owning comm. One mutex guards the only
// process-wide state in the crate.
static EVENT_TARGETS: Mutex<BTreeMap<i32, Weak<ShmShared>>> = Mutex::new(BTreeMap::new());

// The runtime handed to factory-created comms.
static DEFAULT_RUNTIME: Mutex<Option<Arc<dyn ShmRuntime>>> = Mutex::new(None);

/// Install the runtime used by comms created from config files.
/// Call once, before any container or endpoint opens an SHM comm.
pub fn set_default_runtime(runtime: Arc<dyn ShmRuntime>) {
    *DEFAULT_RUNTIME.lock() = Some(runtime);
}

pub fn default_runtime() -> Option<Arc<dyn ShmRuntime>> {
    DEFAULT_RUNTIME.lock().clone()
}

/// Entry point for callback-mode runtimes: deliver one receive event to
/// whichever comm registered it.
pub fn dispatch_recv_event(event_id: i32) {
    let target = EVENT_TARGETS.lock().get(&event_id).cloned();
    if let Some(shared) = target.and_then(|weak| weak.upgrade()) {
        shared.handle_recv_event(event_id);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ImplType {
    Callback,
    Poll,
}

#[derive(Debug, Deserialize)]
struct ShmConfig {
    protocol: String,
    #[serde(default = "default_impl_type")]
    impl_type: String,
    #[serde(default)]
    asset_name: Option<String>,
    io: ShmIoConfig,
}

#[derive(Debug, Deserialize)]
struct ShmIoConfig {
    robots: Vec<ShmRobotConfig>,
}

#[derive(Debug, Deserialize)]
struct ShmRobotConfig {
    name: String,
    pdu: Vec<ShmPduConfig>,
}

#[derive(Debug, Deserialize)]
struct ShmPduConfig {
    name: String,
    #[serde(default)]
    notify_on_recv: bool,
}

fn default_impl_type() -> String {
    "callback".to_string()
}

struct ShmShared {
    runtime: Arc<dyn ShmRuntime>,
    running: AtomicBool,
    pdu_def: Mutex<Option<Arc<PduDefinition>>>,
    callback: RwLock<Option<RecvCallback>>,
    // event id -> resolved key, for both impl types
    events: Mutex<HashMap<i32, PduResolvedKey>>,
    io_lock: Mutex<()>,
}

impl ShmShared {
    fn handle_recv_event(&self, event_id: i32) {
        if !self.running.load(Ordering::Relaxed) {
            return;
        }
        let callback = self.callback.read().clone();
        let Some(callback) = callback else {
            return;
        };
        let key = match self.events.lock().get(&event_id) {
            Some(key) => key.clone(),
            None => return,
        };
        let pdu_size = {
            let guard = self.pdu_def.lock();
            let Some(def) = guard.as_ref() else { return };
            match def.resolve_channel(&key.robot, key.channel_id) {
                Some(d) => d.pdu_size,
                None => {
                    log::warn!("shm comm: no definition for received event on {}", key);
                    return;
                }
            }
        };

        let mut buffer = vec![0u8; pdu_size];
        let received = {
            let _guard = self.io_lock.lock();
            self.runtime.read_pdu(&key.robot, key.channel_id, &mut buffer)
        };
        match received {
            Ok(n) => callback(&key, &buffer[..n]),
            Err(e) => log::debug!("shm comm: read for event {} failed: {}", event_id, e),
        }
    }
}

/// Shared-memory comm bound to a host runtime
pub struct ShmComm {
    shared: Arc<ShmShared>,
    impl_type: Mutex<ImplType>,
}

impl ShmComm {
    pub fn new(runtime: Arc<dyn ShmRuntime>) -> Self {
        Self {
            shared: Arc::new(ShmShared {
                runtime,
                running: AtomicBool::new(false),
                pdu_def: Mutex::new(None),
                callback: RwLock::new(None),
                events: Mutex::new(HashMap::new()),
                io_lock: Mutex::new(()),
            }),
            impl_type: Mutex::new(ImplType::Callback),
        }
    }

    fn load_config(config_path: &Path) -> Result<ShmConfig> {
        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: ShmConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad shm config: {}", e)))?;
        if config.protocol != "shm" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'shm'",
                config.protocol
            )));
        }
        Ok(config)
    }

    fn require_def(&self) -> Result<Arc<PduDefinition>> {
        self.shared
            .pdu_def
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidConfig("PDU definition is not set".to_string()))
    }
}

impl PduComm for ShmComm {
    fn create_pdu_lchannels(&self, config_path: &Path) -> Result<()> {
        let def = self.require_def()?;
        let config = Self::load_config(config_path)?;
        for robot in &config.io.robots {
            for pdu in &robot.pdu {
                let resolved = def.resolve(&robot.name, &pdu.name).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "cannot resolve PDU '{}' for robot '{}'",
                        pdu.name, robot.name
                    ))
                })?;
                self.shared.runtime.create_channel(
                    &robot.name,
                    resolved.channel_id,
                    resolved.pdu_size,
                )?;
            }
        }
        Ok(())
    }

    fn open(&self, config_path: &Path) -> Result<()> {
        let def = self.require_def()?;
        let config = Self::load_config(config_path)?;

        let impl_type = match config.impl_type.as_str() {
            "callback" => ImplType::Callback,
            "poll" => ImplType::Poll,
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown shm impl_type '{}'",
                    other
                )))
            }
        };
        *self.impl_type.lock() = impl_type;
        if let Some(asset_name) = &config.asset_name {
            log::info!("shm comm: opening for asset '{}'", asset_name);
        }

        for robot in &config.io.robots {
            for pdu in &robot.pdu {
                if !pdu.notify_on_recv {
                    continue;
                }
                let resolved = def.resolve(&robot.name, &pdu.name).ok_or_else(|| {
                    Error::InvalidConfig(format!(
                        "cannot resolve PDU '{}' for robot '{}'",
                        pdu.name, robot.name
                    ))
                })?;
                let key = PduResolvedKey::new(robot.name.clone(), resolved.channel_id);
                let event_id = self
                    .shared
                    .runtime
                    .register_recv_event(&robot.name, resolved.channel_id)?;
                self.shared.events.lock().insert(event_id, key);
                if impl_type == ImplType::Callback {
                    EVENT_TARGETS
                        .lock()
                        .insert(event_id, Arc::downgrade(&self.shared));
                }
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let events: Vec<i32> = self.shared.events.lock().keys().copied().collect();
        for event_id in events {
            if let Err(e) = self.shared.runtime.unregister_recv_event(event_id) {
                log::warn!("shm comm: unregister of event {} failed: {}", event_id, e);
            }
            EVENT_TARGETS.lock().remove(&event_id);
        }
        self.shared.events.lock().clear();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        self.shared.running.store(true, Ordering::SeqCst);
        // receive events are pushed by the runtime, nothing else to start
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.shared.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    fn send(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()> {
        let _guard = self.shared.io_lock.lock();
        self.shared.runtime.write_pdu(&key.robot, key.channel_id, data)
    }

    fn recv(&self, key: &PduResolvedKey, buf: &mut [u8]) -> Result<usize> {
        let def = self.require_def()?;
        let resolved = def
            .resolve_channel(&key.robot, key.channel_id)
            .ok_or_else(|| Error::InvalidPduKey(key.to_string()))?;
        if buf.is_empty() {
            return Err(Error::InvalidArgument("empty receive buffer".to_string()));
        }
        let read_len = buf.len().min(resolved.pdu_size);
        let _guard = self.shared.io_lock.lock();
        self.shared
            .runtime
            .read_pdu(&key.robot, key.channel_id, &mut buf[..read_len])
    }

    fn set_on_recv_callback(&self, callback: RecvCallback) {
        *self.shared.callback.write() = Some(callback);
    }

    fn process_recv_events(&self) {
        if *self.impl_type.lock() != ImplType::Poll {
            return;
        }
        let event_ids: Vec<i32> = self.shared.events.lock().keys().copied().collect();
        for event_id in event_ids {
            if self.shared.runtime.poll_recv_event(event_id) {
                self.shared.handle_recv_event(event_id);
            }
        }
    }

    fn set_pdu_definition(&self, def: Arc<PduDefinition>) {
        *self.shared.pdu_def.lock() = Some(def);
    }
}

impl Drop for ShmComm {
    fn drop(&mut self) {
        let _ = self.stop();
        let _ = self.close();
    }
}
