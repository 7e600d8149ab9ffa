//! Socket helpers shared by the network comms

use crate::error::{Error, Result};
use serde::Deserialize;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Host/port pair as written in comm config files
#[derive(Debug, Clone, Deserialize)]
pub struct AddressConfig {
    pub address: String,
    pub port: u16,
}

/// Resolve a config address to a socket address (first match wins)
pub fn resolve_address(addr: &AddressConfig) -> Result<SocketAddr> {
    let mut candidates = (addr.address.as_str(), addr.port)
        .to_socket_addrs()
        .map_err(|e| {
            Error::InvalidArgument(format!(
                "cannot resolve {}:{}: {}",
                addr.address, addr.port, e
            ))
        })?;
    candidates.next().ok_or_else(|| {
        Error::InvalidArgument(format!("no address for {}:{}", addr.address, addr.port))
    })
}

/// Stream socket options shared by the TCP comm and the TCP mux
#[derive(Debug, Clone, Deserialize)]
pub struct TcpOptions {
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default = "default_true")]
    pub reuse_address: bool,
    #[serde(default = "default_true")]
    pub keepalive: bool,
    #[serde(default = "default_true")]
    pub no_delay: bool,
    #[serde(default = "default_buffer_size")]
    pub recv_buffer_size: usize,
    #[serde(default = "default_buffer_size")]
    pub send_buffer_size: usize,
    #[serde(default)]
    pub linger: LingerOptions,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LingerOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub timeout_sec: u64,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            backlog: default_backlog(),
            connect_timeout_ms: default_timeout_ms(),
            read_timeout_ms: default_timeout_ms(),
            write_timeout_ms: default_timeout_ms(),
            blocking: true,
            reuse_address: true,
            keepalive: true,
            no_delay: true,
            recv_buffer_size: default_buffer_size(),
            send_buffer_size: default_buffer_size(),
            linger: LingerOptions::default(),
        }
    }
}

pub(crate) fn default_backlog() -> i32 {
    5
}

pub(crate) fn default_timeout_ms() -> u64 {
    1000
}

pub(crate) fn default_true() -> bool {
    true
}

pub(crate) fn default_buffer_size() -> usize {
    8192
}

/// Turn a millisecond config value into a socket timeout (0 disables)
pub fn socket_timeout(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

/// Bind and listen on a stream socket with SO_REUSEADDR applied before bind
pub fn listen(addr: SocketAddr, options: &TcpOptions) -> Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    if options.reuse_address {
        socket.set_reuse_address(true)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;
    Ok(socket.into())
}

/// Apply the configured options to a connected stream
pub fn apply_stream_options(stream: &TcpStream, options: &TcpOptions) -> Result<()> {
    let sock = SockRef::from(stream);
    if options.keepalive {
        sock.set_keepalive(true)?;
    }
    if options.recv_buffer_size > 0 {
        sock.set_recv_buffer_size(options.recv_buffer_size)?;
    }
    if options.send_buffer_size > 0 {
        sock.set_send_buffer_size(options.send_buffer_size)?;
    }
    if options.linger.enabled {
        sock.set_linger(Some(Duration::from_secs(options.linger.timeout_sec)))?;
    }
    if options.no_delay {
        stream.set_nodelay(true)?;
    }
    stream.set_read_timeout(socket_timeout(options.read_timeout_ms))?;
    stream.set_write_timeout(socket_timeout(options.write_timeout_ms))?;
    if !options.blocking {
        stream.set_nonblocking(true)?;
    }
    Ok(())
}

/// Unblock a pending accept. Used by `stop` before joining the accept thread.
pub fn shutdown_listener(listener: &TcpListener) {
    let _ = SockRef::from(listener).shutdown(Shutdown::Read);
}
