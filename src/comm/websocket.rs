//! WebSocket comm
//!
//! Binary WebSocket frames carry whole V2-framed PDUs. A server accepts any
//! number of sessions and fans application sends out to all of them; a
//! client holds a single session. Each session is owned by its own thread;
//! outgoing data goes through a per-session queue so writes never interleave
//! within one session.

use crate::comm::{FrameLink, PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::net::{self, AddressConfig};
use crate::time_source::TimeSource;
use crate::types::{Direction, PduResolvedKey};
use crate::wire::PacketVersion;
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tungstenite::{Message, WebSocket};

#[derive(Debug, Deserialize)]
struct WebSocketConfig {
    protocol: String,
    #[serde(default)]
    direction: Option<String>,
    role: String,
    // server side
    local: Option<AddressConfig>,
    // client side
    host: Option<String>,
    port: Option<u16>,
    #[serde(default = "default_path")]
    path: String,
    #[serde(default)]
    options: WsOptions,
}

#[derive(Debug, Clone, Deserialize)]
struct WsOptions {
    #[serde(default = "net::default_timeout_ms")]
    connect_timeout_ms: u64,
    #[serde(default = "net::default_true")]
    reuse_address: bool,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: net::default_timeout_ms(),
            reuse_address: true,
        }
    }
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// How often a session thread wakes up to drain its write queue
const SESSION_POLL: Duration = Duration::from_millis(50);

/// Per-session state shared with the comm for queued writes
struct WsSession {
    id: u64,
    queue: Mutex<VecDeque<Vec<u8>>>,
    open: AtomicBool,
}

impl WsSession {
    fn new(id: u64) -> Self {
        Self {
            id,
            queue: Mutex::new(VecDeque::new()),
            open: AtomicBool::new(true),
        }
    }
}

/// WebSocket comm for one configured role
pub struct WebSocketComm {
    link: Arc<FrameLink>,
    running: Arc<AtomicBool>,
    role: Mutex<Role>,
    direction: Mutex<Direction>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    client_target: Mutex<Option<(String, u16, String, WsOptions)>>,
    sessions: Arc<Mutex<Vec<Arc<WsSession>>>>,
    next_session_id: Arc<AtomicU64>,
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Default for WebSocketComm {
    fn default() -> Self {
        Self {
            link: Arc::new(FrameLink::new(PacketVersion::V2)),
            running: Arc::new(AtomicBool::new(false)),
            role: Mutex::new(Role::Server),
            direction: Mutex::new(Direction::InOut),
            listener: Mutex::new(None),
            client_target: Mutex::new(None),
            sessions: Arc::new(Mutex::new(Vec::new())),
            next_session_id: Arc::new(AtomicU64::new(0)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl WebSocketComm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp outgoing frames from the given time source instead of the
    /// wall clock
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            link: Arc::new(FrameLink::with_time_source(PacketVersion::V2, time_source)),
            running: Arc::new(AtomicBool::new(false)),
            role: Mutex::new(Role::Server),
            direction: Mutex::new(Direction::InOut),
            listener: Mutex::new(None),
            client_target: Mutex::new(None),
            sessions: Arc::new(Mutex::new(Vec::new())),
            next_session_id: Arc::new(AtomicU64::new(0)),
            threads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Serve one established session until close or stop. Drains the write
    /// queue between reads so queued sends never interleave.
    fn session_loop(
        mut ws: WebSocket<TcpStream>,
        session: Arc<WsSession>,
        link: Arc<FrameLink>,
        running: Arc<AtomicBool>,
        sessions: Arc<Mutex<Vec<Arc<WsSession>>>>,
    ) {
        let _ = ws.get_ref().set_read_timeout(Some(SESSION_POLL));

        while running.load(Ordering::Relaxed) && session.open.load(Ordering::Relaxed) {
            loop {
                let next = session.queue.lock().pop_front();
                match next {
                    Some(bytes) => {
                        if let Err(e) = ws.send(Message::Binary(bytes)) {
                            log::debug!("websocket write failed: {}", e);
                            session.open.store(false, Ordering::SeqCst);
                            break;
                        }
                    }
                    None => break,
                }
            }
            if !session.open.load(Ordering::Relaxed) {
                break;
            }

            match ws.read() {
                Ok(Message::Binary(data)) => link.deliver(&data),
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(tungstenite::Error::Io(ref e))
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(tungstenite::Error::ConnectionClosed) => break,
                Err(e) => {
                    log::debug!("websocket read failed: {}", e);
                    break;
                }
            }
        }

        let _ = ws.close(None);
        sessions.lock().retain(|s| s.id != session.id);
        log::debug!("websocket session {} closed", session.id);
    }

    fn spawn_session(
        &self,
        ws: WebSocket<TcpStream>,
        name: &str,
    ) -> Result<()> {
        let session = Arc::new(WsSession::new(
            self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1,
        ));
        self.sessions.lock().push(Arc::clone(&session));

        let link = Arc::clone(&self.link);
        let running = Arc::clone(&self.running);
        let sessions = Arc::clone(&self.sessions);
        let session_id = session.id;
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::session_loop(ws, session, link, running, sessions))
            .map_err(|e| {
                self.sessions.lock().retain(|s| s.id != session_id);
                Error::Io(e.to_string())
            })?;
        self.threads.lock().push(handle);
        Ok(())
    }

    fn accept_loop(
        listener: Arc<TcpListener>,
        link: Arc<FrameLink>,
        running: Arc<AtomicBool>,
        sessions: Arc<Mutex<Vec<Arc<WsSession>>>>,
        next_session_id: Arc<AtomicU64>,
        threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
    ) {
        while running.load(Ordering::Relaxed) {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    log::debug!("websocket accept failed: {}", e);
                    continue;
                }
            };
            let ws = match tungstenite::accept(stream) {
                Ok(ws) => ws,
                Err(e) => {
                    log::debug!("websocket handshake with {} failed: {}", peer, e);
                    continue;
                }
            };
            log::info!("websocket session connected: {}", peer);

            let session = Arc::new(WsSession::new(
                next_session_id.fetch_add(1, Ordering::SeqCst) + 1,
            ));
            sessions.lock().push(Arc::clone(&session));

            let link = Arc::clone(&link);
            let running = Arc::clone(&running);
            let session_list = Arc::clone(&sessions);
            let spawned = thread::Builder::new()
                .name("ws-session".to_string())
                .spawn(move || Self::session_loop(ws, session, link, running, session_list));
            match spawned {
                Ok(handle) => threads.lock().push(handle),
                Err(e) => log::error!("cannot spawn websocket session thread: {}", e),
            }
        }
        log::debug!("websocket accept loop exiting");
    }
}

impl PduComm for WebSocketComm {
    fn open(&self, config_path: &std::path::Path) -> Result<()> {
        if self.listener.lock().is_some() || self.client_target.lock().is_some() {
            return Err(Error::Busy);
        }

        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: WebSocketConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad websocket config: {}", e)))?;
        if config.protocol != "websocket" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'websocket'",
                config.protocol
            )));
        }
        if let Some(direction) = &config.direction {
            *self.direction.lock() = Direction::parse(direction);
        }

        match config.role.as_str() {
            "server" => {
                let local = config
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("missing local address".to_string()))?;
                let mut listen_options = net::TcpOptions::default();
                listen_options.reuse_address = config.options.reuse_address;
                let listener = net::listen(net::resolve_address(local)?, &listen_options)?;
                *self.listener.lock() = Some(Arc::new(listener));
                *self.role.lock() = Role::Server;
            }
            "client" => {
                let host = config
                    .host
                    .ok_or_else(|| Error::InvalidConfig("missing host".to_string()))?;
                let port = config
                    .port
                    .ok_or_else(|| Error::InvalidConfig("missing port".to_string()))?;
                *self.client_target.lock() =
                    Some((host, port, config.path.clone(), config.options.clone()));
                *self.role.lock() = Role::Client;
            }
            other => {
                return Err(Error::InvalidConfig(format!(
                    "unknown websocket role '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        *self.listener.lock() = None;
        *self.client_target.lock() = None;
        self.sessions.lock().clear();
        Ok(())
    }

    fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }

        match *self.role.lock() {
            Role::Server => {
                let listener = self.listener.lock().clone().ok_or_else(|| {
                    self.running.store(false, Ordering::SeqCst);
                    Error::InvalidConfig("websocket server comm not open".to_string())
                })?;
                let link = Arc::clone(&self.link);
                let running = Arc::clone(&self.running);
                let sessions = Arc::clone(&self.sessions);
                let next_session_id = Arc::clone(&self.next_session_id);
                let threads = Arc::clone(&self.threads);
                let handle = thread::Builder::new()
                    .name("ws-comm-accept".to_string())
                    .spawn(move || {
                        Self::accept_loop(listener, link, running, sessions, next_session_id, threads)
                    })
                    .map_err(|e| {
                        self.running.store(false, Ordering::SeqCst);
                        Error::Io(e.to_string())
                    })?;
                self.threads.lock().push(handle);
            }
            Role::Client => {
                let (host, port, path, options) =
                    self.client_target.lock().clone().ok_or_else(|| {
                        self.running.store(false, Ordering::SeqCst);
                        Error::InvalidConfig("websocket client comm not open".to_string())
                    })?;
                let addr = net::resolve_address(&AddressConfig {
                    address: host.clone(),
                    port,
                })
                .map_err(|e| {
                    self.running.store(false, Ordering::SeqCst);
                    e
                })?;
                let connect_timeout = net::socket_timeout(options.connect_timeout_ms)
                    .unwrap_or(Duration::from_secs(1));
                let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(|e| {
                    self.running.store(false, Ordering::SeqCst);
                    Error::from(e)
                })?;
                let url = format!("ws://{}:{}{}", host, port, path);
                let (ws, _response) = tungstenite::client(url.as_str(), stream).map_err(|e| {
                    self.running.store(false, Ordering::SeqCst);
                    Error::Io(format!("websocket handshake failed: {}", e))
                })?;
                log::info!("websocket client connected to {}", url);
                self.spawn_session(ws, "ws-comm-client").map_err(|e| {
                    self.running.store(false, Ordering::SeqCst);
                    e
                })?;
            }
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().as_ref() {
            net::shutdown_listener(listener);
        }
        for session in self.sessions.lock().iter() {
            session.open.store(false, Ordering::SeqCst);
        }
        let handles = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
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
                "send on an input-only comm".to_string(),
            ));
        }
        self.link.send_frame(key, data, |bytes| {
            let sessions = self.sessions.lock();
            for session in sessions.iter() {
                if session.open.load(Ordering::Relaxed) {
                    session.queue.lock().push_back(bytes.to_vec());
                }
            }
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

impl Drop for WebSocketComm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
