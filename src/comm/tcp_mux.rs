//! TCP comm multiplexer
//!
//! Accepts many inbound TCP connections and exposes each as its own session
//! comm. Sessions are drained by the endpoint-level multiplexer through
//! `take_sessions`; the accept loop never blocks a caller.

use crate::comm::raw::{read_frame, FrameRead};
use crate::comm::{FrameLink, PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::net::{self, AddressConfig, TcpOptions};
use crate::types::{Direction, PduResolvedKey};
use crate::wire::PacketVersion;
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Accept loop producing a stream of session comms
pub trait CommMultiplexer: Send + Sync {
    /// Load mux comm configuration.
    fn open(&self, config_path: &std::path::Path) -> Result<()>;
    /// Close and release resources. Idempotent.
    fn close(&self) -> Result<()>;
    /// Start accepting connections.
    fn start(&self) -> Result<()>;
    /// Stop accepting connections.
    fn stop(&self) -> Result<()>;

    /// Non-blocking: drain newly accepted session comms; empty if none.
    fn take_sessions(&self) -> Vec<Arc<dyn PduComm>>;

    fn connected_count(&self) -> usize;
    fn expected_count(&self) -> usize;

    fn is_ready(&self) -> bool {
        self.connected_count() >= self.expected_count()
    }
}

#[derive(Debug, Deserialize)]
struct TcpMuxConfig {
    protocol: String,
    local: AddressConfig,
    expected_clients: usize,
    #[serde(default)]
    options: Option<TcpOptions>,
}

#[derive(Debug, Deserialize)]
struct SessionConfig {
    protocol: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    comm_raw_version: Option<String>,
    #[serde(default)]
    options: Option<TcpOptions>,
}

/// One accepted connection, framed per its session config (`v1` or `v2`)
struct TcpSessionComm {
    link: Arc<FrameLink>,
    running: Arc<AtomicBool>,
    direction: Mutex<Direction>,
    stream: Mutex<Option<TcpStream>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpSessionComm {
    fn new(stream: TcpStream) -> Self {
        Self {
            link: Arc::new(FrameLink::new(PacketVersion::V2)),
            running: Arc::new(AtomicBool::new(false)),
            direction: Mutex::new(Direction::InOut),
            stream: Mutex::new(Some(stream)),
            recv_thread: Mutex::new(None),
        }
    }
}

impl PduComm for TcpSessionComm {
    fn open(&self, config_path: &std::path::Path) -> Result<()> {
        let guard = self.stream.lock();
        let stream = guard.as_ref().ok_or(Error::NotRunning)?;

        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: SessionConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad session config: {}", e)))?;
        if config.protocol != "tcp" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'tcp'",
                config.protocol
            )));
        }
        if let Some(direction) = &config.direction {
            *self.direction.lock() = Direction::parse(direction);
        }
        if let Some(version) = &config.comm_raw_version {
            let version = PacketVersion::parse(version).ok_or_else(|| {
                Error::InvalidConfig(format!("unsupported comm_raw_version '{}'", version))
            })?;
            self.link.set_version(version);
        }
        net::apply_stream_options(stream, &config.options.unwrap_or_default())?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        *self.stream.lock() = None;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }
        let mut stream = match self.stream.lock().as_ref().map(TcpStream::try_clone) {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            None => {
                self.running.store(false, Ordering::SeqCst);
                return Err(Error::NotRunning);
            }
        };

        let link = Arc::clone(&self.link);
        let running = Arc::clone(&self.running);
        let handle = thread::Builder::new()
            .name("tcp-session-recv".to_string())
            .spawn(move || {
                loop {
                    match read_frame(&mut stream, link.version()) {
                        FrameRead::Frame(frame) => link.deliver(&frame),
                        FrameRead::Idle => {
                            if !running.load(Ordering::Relaxed) {
                                break;
                            }
                        }
                        FrameRead::Disconnected => break,
                    }
                }
                running.store(false, Ordering::SeqCst);
                log::debug!("tcp session recv loop exiting");
            })
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Io(e.to_string())
            })?;
        *self.recv_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            // the recv loop may have exited on its own; still reap it
            if let Some(handle) = self.recv_thread.lock().take() {
                let _ = handle.join();
            }
            return Ok(());
        }
        if let Some(stream) = self.stream.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.recv_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send(&self, key: &PduResolvedKey, data: &[u8]) -> Result<()> {
        if *self.direction.lock() == Direction::In {
            return Err(Error::InvalidArgument(
                "send on an input-only session".to_string(),
            ));
        }
        let guard = self.stream.lock();
        let stream = guard.as_ref().ok_or(Error::NotRunning)?;
        self.link.send_frame(key, data, |bytes| {
            (&*stream).write_all(bytes)?;
            Ok(())
        })
    }

    fn recv(&self, _key: &PduResolvedKey, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::Unsupported)
    }

    fn set_on_recv_callback(&self, callback: RecvCallback) {
        self.link.set_callback(callback);
    }
}

impl Drop for TcpSessionComm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// TCP mux comm: accepts clients and queues each as a pending session
pub struct TcpCommMultiplexer {
    running: Arc<AtomicBool>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    expected_clients: AtomicUsize,
    connected_clients: Arc<AtomicUsize>,
    pending_sessions: Arc<Mutex<Vec<Arc<dyn PduComm>>>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TcpCommMultiplexer {
    fn default() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
            listener: Mutex::new(None),
            expected_clients: AtomicUsize::new(0),
            connected_clients: Arc::new(AtomicUsize::new(0)),
            pending_sessions: Arc::new(Mutex::new(Vec::new())),
            accept_thread: Mutex::new(None),
        }
    }
}

impl TcpCommMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn accept_loop(
        listener: Arc<TcpListener>,
        running: Arc<AtomicBool>,
        pending: Arc<Mutex<Vec<Arc<dyn PduComm>>>>,
        connected: Arc<AtomicUsize>,
    ) {
        while running.load(Ordering::Relaxed) {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    log::debug!("tcp mux accept failed: {}", e);
                    continue;
                }
            };
            log::info!("tcp mux: session connected: {}", peer);
            let session: Arc<dyn PduComm> = Arc::new(TcpSessionComm::new(stream));
            pending.lock().push(session);
            connected.fetch_add(1, Ordering::SeqCst);
        }
        log::debug!("tcp mux accept loop exiting");
    }
}

impl CommMultiplexer for TcpCommMultiplexer {
    fn open(&self, config_path: &std::path::Path) -> Result<()> {
        if self.listener.lock().is_some() {
            return Err(Error::Busy);
        }

        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: TcpMuxConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad tcp mux config: {}", e)))?;
        if config.protocol != "tcp" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'tcp'",
                config.protocol
            )));
        }

        let options = config.options.unwrap_or_default();
        let listener = net::listen(net::resolve_address(&config.local)?, &options)?;
        self.expected_clients
            .store(config.expected_clients, Ordering::SeqCst);
        *self.listener.lock() = Some(Arc::new(listener));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        *self.listener.lock() = None;
        self.pending_sessions.lock().clear();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidConfig("tcp mux not open".to_string()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }

        let running = Arc::clone(&self.running);
        let pending = Arc::clone(&self.pending_sessions);
        let connected = Arc::clone(&self.connected_clients);
        let handle = thread::Builder::new()
            .name("tcp-mux-accept".to_string())
            .spawn(move || Self::accept_loop(listener, running, pending, connected))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                Error::Io(e.to_string())
            })?;
        *self.accept_thread.lock() = Some(handle);
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().as_ref() {
            net::shutdown_listener(listener);
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn take_sessions(&self) -> Vec<Arc<dyn PduComm>> {
        std::mem::take(&mut *self.pending_sessions.lock())
    }

    fn connected_count(&self) -> usize {
        self.connected_clients.load(Ordering::SeqCst)
    }

    fn expected_count(&self) -> usize {
        self.expected_clients.load(Ordering::SeqCst)
    }
}

impl Drop for TcpCommMultiplexer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
