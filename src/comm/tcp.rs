//! TCP stream comm
//!
//! A server comm binds, listens and serves one connection at a time in its
//! own thread; a client comm connects with a timeout and retries every
//! second until stopped. Frames are read as exactly 304 header bytes
//! followed by `body_len` body bytes; a partial read is a hard disconnect.

use crate::comm::raw::{read_frame, FrameRead};
use crate::comm::{FrameLink, PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::net::{self, AddressConfig, TcpOptions};
use crate::time_source::TimeSource;
use crate::types::{Direction, PduResolvedKey};
use crate::wire::PacketVersion;
use parking_lot::Mutex;
use serde::Deserialize;
use std::io::Write;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Deserialize)]
struct TcpConfig {
    protocol: String,
    direction: String,
    role: String,
    local: Option<AddressConfig>,
    remote: Option<AddressConfig>,
    #[serde(default)]
    options: Option<TcpOptions>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Server,
    Client,
}

/// Delay between client reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// TCP comm for one configured peer. The background thread runs either the
/// accept+recv loop (server) or the connect+recv loop (client).
pub struct TcpComm {
    link: Arc<FrameLink>,
    running: Arc<AtomicBool>,
    role: Mutex<Role>,
    direction: Mutex<Direction>,
    options: Mutex<TcpOptions>,
    listener: Mutex<Option<Arc<TcpListener>>>,
    remote: Mutex<Option<SocketAddr>>,
    conn: Arc<Mutex<Option<TcpStream>>>,
    comm_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for TcpComm {
    fn default() -> Self {
        Self {
            link: Arc::new(FrameLink::new(PacketVersion::V2)),
            running: Arc::new(AtomicBool::new(false)),
            role: Mutex::new(Role::Client),
            direction: Mutex::new(Direction::InOut),
            options: Mutex::new(TcpOptions::default()),
            listener: Mutex::new(None),
            remote: Mutex::new(None),
            conn: Arc::new(Mutex::new(None)),
            comm_thread: Mutex::new(None),
        }
    }
}

impl TcpComm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp outgoing frames from the given time source instead of the
    /// wall clock
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            link: Arc::new(FrameLink::with_time_source(PacketVersion::V2, time_source)),
            running: Arc::new(AtomicBool::new(false)),
            role: Mutex::new(Role::Client),
            direction: Mutex::new(Direction::InOut),
            options: Mutex::new(TcpOptions::default()),
            listener: Mutex::new(None),
            remote: Mutex::new(None),
            conn: Arc::new(Mutex::new(None)),
            comm_thread: Mutex::new(None),
        }
    }

    fn recv_until_disconnect(
        stream: &mut TcpStream,
        link: &FrameLink,
        running: &AtomicBool,
    ) {
        loop {
            match read_frame(stream, link.version()) {
                FrameRead::Frame(frame) => link.deliver(&frame),
                FrameRead::Idle => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                }
                FrameRead::Disconnected => break,
            }
        }
    }

    fn server_loop(
        listener: Arc<TcpListener>,
        link: Arc<FrameLink>,
        running: Arc<AtomicBool>,
        conn: Arc<Mutex<Option<TcpStream>>>,
        options: TcpOptions,
    ) {
        while running.load(Ordering::Relaxed) {
            let (mut stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    log::debug!("tcp accept failed: {}", e);
                    continue;
                }
            };
            log::info!("tcp comm: client connected: {}", peer);
            if let Err(e) = net::apply_stream_options(&stream, &options) {
                log::warn!("tcp comm: failed to apply socket options: {}", e);
            }
            match stream.try_clone() {
                Ok(writer) => *conn.lock() = Some(writer),
                Err(e) => {
                    log::warn!("tcp comm: cannot register connection: {}", e);
                    continue;
                }
            }

            Self::recv_until_disconnect(&mut stream, &link, &running);

            *conn.lock() = None;
            let _ = stream.shutdown(Shutdown::Both);
            log::info!("tcp comm: client disconnected: {}", peer);
        }
        log::debug!("tcp server loop exiting");
    }

    fn client_loop(
        remote: SocketAddr,
        link: Arc<FrameLink>,
        running: Arc<AtomicBool>,
        conn: Arc<Mutex<Option<TcpStream>>>,
        options: TcpOptions,
    ) {
        while running.load(Ordering::Relaxed) {
            let connect_timeout = net::socket_timeout(options.connect_timeout_ms)
                .unwrap_or(Duration::from_secs(1));
            let mut stream = match TcpStream::connect_timeout(&remote, connect_timeout) {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("tcp connect to {} failed: {}", remote, e);
                    thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            };
            log::info!("tcp comm: connected to {}", remote);
            if let Err(e) = net::apply_stream_options(&stream, &options) {
                log::warn!("tcp comm: failed to apply socket options: {}", e);
            }
            match stream.try_clone() {
                Ok(writer) => *conn.lock() = Some(writer),
                Err(e) => {
                    log::warn!("tcp comm: cannot register connection: {}", e);
                    thread::sleep(RECONNECT_DELAY);
                    continue;
                }
            }

            Self::recv_until_disconnect(&mut stream, &link, &running);

            *conn.lock() = None;
            let _ = stream.shutdown(Shutdown::Both);
            log::info!("tcp comm: disconnected from {}", remote);
        }
        log::debug!("tcp client loop exiting");
    }
}

impl PduComm for TcpComm {
    fn open(&self, config_path: &std::path::Path) -> Result<()> {
        if self.listener.lock().is_some() || self.remote.lock().is_some() {
            return Err(Error::Busy);
        }

        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: TcpConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad tcp config: {}", e)))?;
        if config.protocol != "tcp" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'tcp'",
                config.protocol
            )));
        }

        let role = match config.role.as_str() {
            "server" => Role::Server,
            "client" => Role::Client,
            other => {
                return Err(Error::InvalidConfig(format!("unknown tcp role '{}'", other)))
            }
        };
        let options = config.options.unwrap_or_default();

        match role {
            Role::Server => {
                let local = config
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("missing local address".to_string()))?;
                let listener = net::listen(net::resolve_address(local)?, &options)?;
                *self.listener.lock() = Some(Arc::new(listener));
            }
            Role::Client => {
                let remote = config
                    .remote
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("missing remote address".to_string()))?;
                *self.remote.lock() = Some(net::resolve_address(remote)?);
            }
        }

        *self.role.lock() = role;
        *self.direction.lock() = Direction::parse(&config.direction);
        *self.options.lock() = options;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        *self.listener.lock() = None;
        *self.remote.lock() = None;
        *self.conn.lock() = None;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let role = *self.role.lock();
        let listener = self.listener.lock().clone();
        let remote = *self.remote.lock();
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }

        let link = Arc::clone(&self.link);
        let running = Arc::clone(&self.running);
        let conn = Arc::clone(&self.conn);
        let options = self.options.lock().clone();

        let spawned = match (role, listener, remote) {
            (Role::Server, Some(listener), _) => thread::Builder::new()
                .name("tcp-comm-server".to_string())
                .spawn(move || Self::server_loop(listener, link, running, conn, options))
                .map_err(|e| Error::Io(e.to_string())),
            (Role::Client, _, Some(remote)) => thread::Builder::new()
                .name("tcp-comm-client".to_string())
                .spawn(move || Self::client_loop(remote, link, running, conn, options))
                .map_err(|e| Error::Io(e.to_string())),
            _ => Err(Error::InvalidConfig("tcp comm not open".to_string())),
        };
        match spawned {
            Ok(handle) => {
                *self.comm_thread.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().as_ref() {
            net::shutdown_listener(listener);
        }
        if let Some(stream) = self.conn.lock().as_ref() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.comm_thread.lock().take() {
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
        let conn = self.conn.lock();
        let stream = conn.as_ref().ok_or(Error::NotRunning)?;
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

impl Drop for TcpComm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
