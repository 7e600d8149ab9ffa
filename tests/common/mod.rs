//! Shared helpers for the integration tests
#![allow(dead_code)]

use std::net::{TcpListener, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Route comm thread logs through the test harness. Only the first call
/// installs the logger; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(true)
        .try_init();
}

/// Write a config fixture into the test directory
pub fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Cache config for a latest-mode store
pub fn latest_cache_config(dir: &Path) -> PathBuf {
    write_file(
        dir,
        "cache_latest.json",
        r#"{"type":"buffer","store":{"mode":"latest"}}"#,
    )
}

/// Cache config for a queue-mode store
pub fn queue_cache_config(dir: &Path, depth: usize) -> PathBuf {
    write_file(
        dir,
        "cache_queue.json",
        &format!(
            r#"{{"type":"buffer","store":{{"mode":"queue","depth":{}}}}}"#,
            depth
        ),
    )
}

/// Grab an ephemeral TCP port on loopback
pub fn free_tcp_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Grab an ephemeral UDP port on loopback
pub fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Poll a condition until it holds or the timeout elapses
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
