//! WebSocket endpoints over loopback

mod common;

use common::{free_tcp_port, init_logging, latest_cache_config, wait_until, write_file};
use setu_pdu::{Direction, Endpoint, PduResolvedKey};
use std::time::Duration;

#[test]
fn test_websocket_ping_pong() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_tcp_port();
    latest_cache_config(dir.path());

    write_file(
        dir.path(),
        "ws_server.json",
        &format!(
            r#"{{
              "protocol": "websocket",
              "direction": "inout",
              "role": "server",
              "local": {{"address": "127.0.0.1", "port": {port}}}
            }}"#
        ),
    );
    write_file(
        dir.path(),
        "ws_client.json",
        &format!(
            r#"{{
              "protocol": "websocket",
              "direction": "inout",
              "role": "client",
              "host": "127.0.0.1",
              "port": {port},
              "path": "/pdu"
            }}"#
        ),
    );
    let server_config = write_file(
        dir.path(),
        "ep_server.json",
        r#"{"cache":"cache_latest.json","comm":"ws_server.json"}"#,
    );
    let client_config = write_file(
        dir.path(),
        "ep_client.json",
        r#"{"cache":"cache_latest.json","comm":"ws_client.json"}"#,
    );

    let server = Endpoint::new("ws_server", Direction::InOut);
    server.open(&server_config).unwrap();
    server.start().unwrap();

    let client = Endpoint::new("ws_client", Direction::InOut);
    client.open(&client_config).unwrap();
    client.start().unwrap();

    let key = PduResolvedKey::new("robot_ws", 40);

    let mut buf = [0u8; 16];
    let delivered = wait_until(Duration::from_secs(5), || {
        let _ = client.send(&key, b"ping");
        matches!(server.recv(&key, &mut buf), Ok(4))
    });
    assert!(delivered, "server never received the ping");
    assert_eq!(&buf[..4], b"ping");

    // server sends fan out to every session, including our client
    let mut reply = [0u8; 16];
    let answered = wait_until(Duration::from_secs(5), || {
        let _ = server.send(&key, b"pong");
        matches!(client.recv(&key, &mut reply), Ok(4))
    });
    assert!(answered, "client never received the pong");
    assert_eq!(&reply[..4], b"pong");

    client.stop().unwrap();
    client.close().unwrap();
    server.stop().unwrap();
    server.close().unwrap();
}
