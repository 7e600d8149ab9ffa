//! TCP mux: many inbound sessions become ready endpoints

mod common;

use common::{free_tcp_port, init_logging, latest_cache_config, wait_until, write_file};
use setu_pdu::wire::{DataPacket, PacketVersion};
use setu_pdu::{Direction, Endpoint, EndpointCommMultiplexer, PduResolvedKey};
use std::io::Write as IoWrite;
use std::net::TcpStream;
use std::path::PathBuf;
use std::time::Duration;

fn mux_config(dir: &std::path::Path, port: u16, expected: usize, version: &str) -> PathBuf {
    latest_cache_config(dir);
    write_file(
        dir,
        "mux_comm.json",
        &format!(
            r#"{{
              "protocol": "tcp",
              "local": {{"address": "127.0.0.1", "port": {port}}},
              "expected_clients": {expected},
              "comm_raw_version": "{version}",
              "options": {{"read_timeout_ms": 100}}
            }}"#
        ),
    );
    write_file(
        dir,
        "mux_endpoint.json",
        r#"{"cache":"cache_latest.json","comm":"mux_comm.json"}"#,
    )
}

fn client_endpoint(dir: &std::path::Path, port: u16, tag: &str) -> Endpoint {
    write_file(
        dir,
        &format!("tcp_client_{tag}.json"),
        &format!(
            r#"{{
              "protocol": "tcp",
              "direction": "inout",
              "role": "client",
              "remote": {{"address": "127.0.0.1", "port": {port}}},
              "options": {{"connect_timeout_ms": 1000, "read_timeout_ms": 100}}
            }}"#
        ),
    );
    let config = write_file(
        dir,
        &format!("ep_client_{tag}.json"),
        &format!(r#"{{"cache":"cache_latest.json","comm":"tcp_client_{tag}.json"}}"#),
    );
    let endpoint = Endpoint::new(format!("client_{tag}"), Direction::InOut);
    endpoint.open(&config).unwrap();
    endpoint.start().unwrap();
    endpoint
}

#[test]
fn test_mux_hands_out_started_endpoints() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_tcp_port();
    let config = mux_config(dir.path(), port, 2, "v2");

    let mux = EndpointCommMultiplexer::new("session_mux", Direction::InOut);
    mux.open(&config).unwrap();
    mux.start().unwrap();
    assert_eq!(mux.expected_count(), 2);
    assert!(!mux.is_ready());

    let client_a = client_endpoint(dir.path(), port, "a");
    let client_b = client_endpoint(dir.path(), port, "b");

    assert!(
        wait_until(Duration::from_secs(5), || mux.is_ready()),
        "mux never became ready"
    );
    assert_eq!(mux.connected_count(), 2);

    let mut endpoints = Vec::new();
    wait_until(Duration::from_secs(2), || {
        endpoints.extend(mux.take_endpoints());
        endpoints.len() >= 2
    });
    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0].name(), "session_mux_1");
    assert_eq!(endpoints[1].name(), "session_mux_2");
    assert!(endpoints.iter().all(|e| e.is_running()));

    // data from either client lands in the matching session endpoint
    let key = PduResolvedKey::new("robot_mux", 30);
    let mut buf = [0u8; 16];
    let delivered = wait_until(Duration::from_secs(5), || {
        let _ = client_a.send(&key, b"ping");
        endpoints
            .iter()
            .any(|e| matches!(e.recv(&key, &mut buf), Ok(4)))
    });
    assert!(delivered, "no session endpoint saw the ping");
    assert_eq!(&buf[..4], b"ping");

    for endpoint in &endpoints {
        endpoint.stop().unwrap();
        endpoint.close().unwrap();
    }
    client_a.stop().unwrap();
    client_a.close().unwrap();
    client_b.stop().unwrap();
    client_b.close().unwrap();
    mux.stop().unwrap();
    mux.close().unwrap();
}

#[test]
fn test_mux_v1_session_framing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_tcp_port();
    let config = mux_config(dir.path(), port, 1, "v1");

    let mux = EndpointCommMultiplexer::new("legacy_mux", Direction::InOut);
    mux.open(&config).unwrap();
    mux.start().unwrap();

    // a hand-rolled legacy client speaking v1 frames
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || mux.is_ready()),
        "mux never saw the legacy client"
    );

    let mut endpoints = Vec::new();
    wait_until(Duration::from_secs(2), || {
        endpoints.extend(mux.take_endpoints());
        !endpoints.is_empty()
    });
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].name(), "legacy_mux_1");

    let frame = DataPacket::new("robot_v1", 31, b"legacy".to_vec()).encode(PacketVersion::V1);
    stream.write_all(&frame).unwrap();

    let key = PduResolvedKey::new("robot_v1", 31);
    let mut buf = [0u8; 16];
    let delivered = wait_until(Duration::from_secs(5), || {
        matches!(endpoints[0].recv(&key, &mut buf), Ok(6))
    });
    assert!(delivered, "v1 frame never arrived");
    assert_eq!(&buf[..6], b"legacy");

    endpoints[0].stop().unwrap();
    endpoints[0].close().unwrap();
    mux.stop().unwrap();
    mux.close().unwrap();
}
