//! UDP datagram comm
//!
//! Connectionless transport with explicit direction. Each datagram carries
//! one complete V2 frame. An `inout` comm without a fixed remote replies to
//! whichever peer sent the last datagram.

use crate::comm::{FrameLink, PduComm, RecvCallback};
use crate::error::{Error, Result};
use crate::net::{self, AddressConfig};
use crate::time_source::TimeSource;
use crate::types::{Direction, PduResolvedKey};
use crate::wire::PacketVersion;
use parking_lot::Mutex;
use serde::Deserialize;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

#[derive(Debug, Deserialize)]
struct UdpConfig {
    protocol: String,
    direction: String,
    #[allow(dead_code)]
    pdu_key: PduResolvedKey,
    local: Option<AddressConfig>,
    remote: Option<AddressConfig>,
    #[serde(default)]
    options: UdpOptions,
}

#[derive(Debug, Clone, Deserialize)]
struct UdpOptions {
    #[serde(default = "net::default_buffer_size")]
    buffer_size: usize,
    #[serde(default = "net::default_timeout_ms")]
    timeout_ms: u64,
    #[serde(default = "net::default_true")]
    blocking: bool,
    #[serde(default = "net::default_true")]
    reuse_address: bool,
    #[serde(default)]
    broadcast: bool,
    #[serde(default)]
    multicast: MulticastOptions,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            buffer_size: net::default_buffer_size(),
            timeout_ms: net::default_timeout_ms(),
            blocking: true,
            reuse_address: true,
            broadcast: false,
            multicast: MulticastOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct MulticastOptions {
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    group: String,
    #[serde(default = "default_mc_interface")]
    interface: String,
    #[serde(default = "default_mc_ttl")]
    ttl: u32,
}

impl Default for MulticastOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            group: String::new(),
            interface: default_mc_interface(),
            ttl: default_mc_ttl(),
        }
    }
}

fn default_mc_interface() -> String {
    "0.0.0.0".to_string()
}

fn default_mc_ttl() -> u32 {
    1
}

/// Maximum UDP datagram size, and so the receive buffer size
const MAX_DATAGRAM_LEN: usize = 65536;

/// UDP comm. One background thread runs the receive loop for `in`/`inout`
/// directions; `out` comms have no thread.
pub struct UdpComm {
    link: Arc<FrameLink>,
    running: Arc<AtomicBool>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    direction: Mutex<Direction>,
    fixed_remote: Mutex<Option<SocketAddr>>,
    last_sender: Arc<Mutex<Option<SocketAddr>>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for UdpComm {
    fn default() -> Self {
        Self {
            link: Arc::new(FrameLink::new(PacketVersion::V2)),
            running: Arc::new(AtomicBool::new(false)),
            socket: Mutex::new(None),
            direction: Mutex::new(Direction::InOut),
            fixed_remote: Mutex::new(None),
            last_sender: Arc::new(Mutex::new(None)),
            recv_thread: Mutex::new(None),
        }
    }
}

impl UdpComm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp outgoing frames from the given time source instead of the
    /// wall clock
    pub fn with_time_source(time_source: Arc<dyn TimeSource>) -> Self {
        Self {
            link: Arc::new(FrameLink::with_time_source(PacketVersion::V2, time_source)),
            running: Arc::new(AtomicBool::new(false)),
            socket: Mutex::new(None),
            direction: Mutex::new(Direction::InOut),
            fixed_remote: Mutex::new(None),
            last_sender: Arc::new(Mutex::new(None)),
            recv_thread: Mutex::new(None),
        }
    }

    fn configure_multicast(
        socket: &UdpSocket,
        direction: Direction,
        options: &MulticastOptions,
    ) -> Result<()> {
        if options.group.is_empty() {
            return Err(Error::InvalidArgument(
                "multicast enabled without a group".to_string(),
            ));
        }
        let group: Ipv4Addr = options
            .group
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad multicast group {}", options.group)))?;
        let interface: Ipv4Addr = options.interface.parse().map_err(|_| {
            Error::InvalidArgument(format!("bad multicast interface {}", options.interface))
        })?;

        if direction != Direction::Out {
            socket.join_multicast_v4(&group, &interface)?;
        }
        if direction != Direction::In {
            socket.set_multicast_ttl_v4(options.ttl)?;
        }
        Ok(())
    }

    fn recv_loop(
        socket: Arc<UdpSocket>,
        link: Arc<FrameLink>,
        running: Arc<AtomicBool>,
        last_sender: Arc<Mutex<Option<SocketAddr>>>,
        capture_sender: bool,
    ) {
        let mut buffer = vec![0u8; MAX_DATAGRAM_LEN];
        while running.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buffer) {
                Ok((received, from)) => {
                    if capture_sender {
                        *last_sender.lock() = Some(from);
                    }
                    link.deliver(&buffer[..received]);
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock
                            | std::io::ErrorKind::TimedOut
                            | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    log::debug!("udp recv error: {}", e);
                }
            }
        }
        log::debug!("udp recv loop exiting");
    }
}

impl PduComm for UdpComm {
    fn open(&self, config_path: &std::path::Path) -> Result<()> {
        if self.socket.lock().is_some() {
            return Err(Error::Busy);
        }

        let text = std::fs::read_to_string(config_path)
            .map_err(|_| Error::FileNotFound(config_path.display().to_string()))?;
        let root: serde_json::Value = serde_json::from_str(&text)?;
        let config: UdpConfig = serde_json::from_value(root)
            .map_err(|e| Error::InvalidConfig(format!("bad udp config: {}", e)))?;
        if config.protocol != "udp" {
            return Err(Error::InvalidConfig(format!(
                "protocol is '{}', expected 'udp'",
                config.protocol
            )));
        }

        let direction = Direction::parse(&config.direction);
        let mut options = config.options.clone();
        if options.timeout_ms == 0 {
            options.timeout_ms = net::default_timeout_ms();
        }

        let local = match direction {
            Direction::In | Direction::InOut => Some(
                config
                    .local
                    .as_ref()
                    .ok_or_else(|| Error::InvalidConfig("missing local address".to_string()))
                    .and_then(net::resolve_address)?,
            ),
            Direction::Out => None,
        };
        let remote = match (&config.remote, direction) {
            (Some(addr), Direction::Out) | (Some(addr), Direction::InOut) => {
                Some(net::resolve_address(addr)?)
            }
            (None, Direction::Out) => {
                return Err(Error::InvalidConfig("missing remote address".to_string()))
            }
            _ => None,
        };

        let family_addr = local.or(remote).ok_or_else(|| {
            Error::InvalidConfig("neither local nor remote address given".to_string())
        })?;

        let socket = Socket::new(
            Domain::for_address(family_addr),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        if options.reuse_address {
            socket.set_reuse_address(true)?;
        }
        if options.broadcast {
            socket.set_broadcast(true)?;
        }
        if options.buffer_size > 0 {
            socket.set_recv_buffer_size(options.buffer_size)?;
        }
        socket.set_read_timeout(net::socket_timeout(options.timeout_ms))?;
        socket.set_write_timeout(net::socket_timeout(options.timeout_ms))?;
        if !options.blocking {
            socket.set_nonblocking(true)?;
        }
        if let Some(local) = local {
            socket.bind(&local.into())?;
        }
        let socket: UdpSocket = socket.into();

        if options.multicast.enabled {
            Self::configure_multicast(&socket, direction, &options.multicast)?;
        }

        *self.direction.lock() = direction;
        *self.fixed_remote.lock() = remote;
        *self.socket.lock() = Some(Arc::new(socket));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop()?;
        *self.socket.lock() = None;
        *self.fixed_remote.lock() = None;
        *self.last_sender.lock() = None;
        Ok(())
    }

    fn start(&self) -> Result<()> {
        let socket = self
            .socket
            .lock()
            .clone()
            .ok_or_else(|| Error::InvalidArgument("udp comm not open".to_string()))?;
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Busy);
        }

        let direction = *self.direction.lock();
        if direction == Direction::Out {
            // no receive thread for a pure sender
            return Ok(());
        }

        let link = Arc::clone(&self.link);
        let running = Arc::clone(&self.running);
        let last_sender = Arc::clone(&self.last_sender);
        let capture_sender = direction == Direction::InOut && self.fixed_remote.lock().is_none();
        let handle = thread::Builder::new()
            .name("udp-comm-recv".to_string())
            .spawn(move || {
                Self::recv_loop(socket, link, running, last_sender, capture_sender);
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
            return Ok(());
        }
        if let Some(socket) = self.socket.lock().as_ref() {
            // unblock a pending recv_from
            let _ = SockRef::from(socket.as_ref()).shutdown(Shutdown::Read);
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
        if data.is_empty() {
            return Err(Error::InvalidArgument("empty payload".to_string()));
        }
        let direction = *self.direction.lock();
        if direction == Direction::In {
            return Err(Error::InvalidArgument(
                "send on an input-only comm".to_string(),
            ));
        }
        let socket = self.socket.lock().clone().ok_or(Error::NotRunning)?;

        let target = match *self.fixed_remote.lock() {
            Some(addr) => addr,
            None => match *self.last_sender.lock() {
                Some(addr) => addr,
                None => return Err(Error::Io("no reply target yet".to_string())),
            },
        };

        self.link.send_frame(key, data, |bytes| {
            socket.send_to(bytes, target)?;
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

impl Drop for UdpComm {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
