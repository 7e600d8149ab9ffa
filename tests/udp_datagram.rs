//! UDP endpoints over loopback

mod common;

use common::{free_udp_port, init_logging, latest_cache_config, wait_until, write_file};
use setu_pdu::{Direction, Endpoint, PduResolvedKey};
use std::time::Duration;

#[test]
fn test_udp_one_way() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_udp_port();
    latest_cache_config(dir.path());

    write_file(
        dir.path(),
        "udp_server.json",
        &format!(
            r#"{{
              "protocol": "udp",
              "direction": "inout",
              "pdu_key": {{"robot": "robot_udp", "channel_id": 20}},
              "local": {{"address": "127.0.0.1", "port": {port}}},
              "options": {{"timeout_ms": 100}}
            }}"#
        ),
    );
    write_file(
        dir.path(),
        "udp_client.json",
        &format!(
            r#"{{
              "protocol": "udp",
              "direction": "out",
              "pdu_key": {{"robot": "robot_udp", "channel_id": 20}},
              "remote": {{"address": "127.0.0.1", "port": {port}}},
              "options": {{"timeout_ms": 100}}
            }}"#
        ),
    );
    let server_config = write_file(
        dir.path(),
        "ep_server.json",
        r#"{"cache":"cache_latest.json","comm":"udp_server.json"}"#,
    );
    let client_config = write_file(
        dir.path(),
        "ep_client.json",
        r#"{"cache":"cache_latest.json","comm":"udp_client.json"}"#,
    );

    let server = Endpoint::new("udp_server", Direction::InOut);
    server.open(&server_config).unwrap();
    server.start().unwrap();

    let client = Endpoint::new("udp_client", Direction::Out);
    client.open(&client_config).unwrap();
    client.start().unwrap();

    let key = PduResolvedKey::new("robot_udp", 20);
    let mut buf = [0u8; 16];
    let delivered = wait_until(Duration::from_secs(2), || {
        let _ = client.send(&key, b"hello");
        matches!(server.recv(&key, &mut buf), Ok(5))
    });
    assert!(delivered, "server never received the datagram");
    assert_eq!(&buf[..5], b"hello");

    client.stop().unwrap();
    client.close().unwrap();
    server.stop().unwrap();
    server.close().unwrap();
}

#[test]
fn test_udp_inout_replies_to_last_sender() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port_a = free_udp_port();
    let port_b = free_udp_port();
    latest_cache_config(dir.path());

    // A binds a local port only; its reply target is whoever talked last
    write_file(
        dir.path(),
        "udp_a.json",
        &format!(
            r#"{{
              "protocol": "udp",
              "direction": "inout",
              "pdu_key": {{"robot": "robot_udp", "channel_id": 21}},
              "local": {{"address": "127.0.0.1", "port": {port_a}}},
              "options": {{"timeout_ms": 100}}
            }}"#
        ),
    );
    // B pins A as its fixed remote
    write_file(
        dir.path(),
        "udp_b.json",
        &format!(
            r#"{{
              "protocol": "udp",
              "direction": "inout",
              "pdu_key": {{"robot": "robot_udp", "channel_id": 21}},
              "local": {{"address": "127.0.0.1", "port": {port_b}}},
              "remote": {{"address": "127.0.0.1", "port": {port_a}}},
              "options": {{"timeout_ms": 100}}
            }}"#
        ),
    );
    let a_config = write_file(
        dir.path(),
        "ep_a.json",
        r#"{"cache":"cache_latest.json","comm":"udp_a.json"}"#,
    );
    let b_config = write_file(
        dir.path(),
        "ep_b.json",
        r#"{"cache":"cache_latest.json","comm":"udp_b.json"}"#,
    );

    let a = Endpoint::new("udp_a", Direction::InOut);
    a.open(&a_config).unwrap();
    a.start().unwrap();

    let b = Endpoint::new("udp_b", Direction::InOut);
    b.open(&b_config).unwrap();
    b.start().unwrap();

    let key = PduResolvedKey::new("robot_udp", 21);

    let mut buf = [0u8; 16];
    let request_seen = wait_until(Duration::from_secs(2), || {
        let _ = b.send(&key, b"marco");
        matches!(a.recv(&key, &mut buf), Ok(5))
    });
    assert!(request_seen, "A never received the request");

    // A replies without any configured remote
    let mut reply = [0u8; 16];
    let reply_seen = wait_until(Duration::from_secs(2), || {
        let _ = a.send(&key, b"polo!");
        matches!(b.recv(&key, &mut reply), Ok(5))
    });
    assert!(reply_seen, "B never received the reply");
    assert_eq!(&reply[..5], b"polo!");

    a.stop().unwrap();
    a.close().unwrap();
    b.stop().unwrap();
    b.close().unwrap();
}
