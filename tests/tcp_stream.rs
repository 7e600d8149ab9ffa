//! TCP client/server endpoints over loopback

mod common;

use common::{free_tcp_port, init_logging, latest_cache_config, wait_until, write_file};
use parking_lot::Mutex;
use setu_pdu::{Direction, Endpoint, PduResolvedKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn tcp_endpoint_pair(dir: &std::path::Path, port: u16) -> (PathBuf, PathBuf) {
    latest_cache_config(dir);
    write_file(
        dir,
        "tcp_server.json",
        &format!(
            r#"{{
              "protocol": "tcp",
              "direction": "inout",
              "role": "server",
              "local": {{"address": "127.0.0.1", "port": {port}}},
              "options": {{"read_timeout_ms": 100}}
            }}"#
        ),
    );
    write_file(
        dir,
        "tcp_client.json",
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
    let server = write_file(
        dir,
        "ep_server.json",
        r#"{"cache":"cache_latest.json","comm":"tcp_server.json"}"#,
    );
    let client = write_file(
        dir,
        "ep_client.json",
        r#"{"cache":"cache_latest.json","comm":"tcp_client.json"}"#,
    );
    (server, client)
}

#[test]
fn test_tcp_loopback_ping_pong() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_tcp_port();
    let (server_config, client_config) = tcp_endpoint_pair(dir.path(), port);

    let server = Endpoint::new("tcp_server", Direction::InOut);
    server.open(&server_config).unwrap();
    server.start().unwrap();

    let client = Endpoint::new("tcp_client", Direction::InOut);
    client.open(&client_config).unwrap();
    client.start().unwrap();

    let key = PduResolvedKey::new("robot_tcp", 10);

    // keep sending until the connection is up and the frame lands
    let mut buf = [0u8; 16];
    let delivered = wait_until(Duration::from_secs(5), || {
        let _ = client.send(&key, b"ping");
        matches!(server.recv(&key, &mut buf), Ok(4))
    });
    assert!(delivered, "server never received the ping");
    assert_eq!(&buf[..4], b"ping");

    // reply on the same session
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

#[test]
fn test_tcp_delivery_preserves_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let port = free_tcp_port();
    let (server_config, client_config) = tcp_endpoint_pair(dir.path(), port);

    let server = Endpoint::new("tcp_order_server", Direction::InOut);
    server.open(&server_config).unwrap();

    let key = PduResolvedKey::new("robot_tcp", 11);
    let bodies: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&bodies);
    server.subscribe_on_recv_callback(
        key.clone(),
        Arc::new(move |_, data| {
            sink.lock().push(data.to_vec());
        }),
    );
    server.start().unwrap();

    let client = Endpoint::new("tcp_order_client", Direction::InOut);
    client.open(&client_config).unwrap();
    client.start().unwrap();

    // wait for the connection by spinning on a sync marker
    let synced = wait_until(Duration::from_secs(5), || {
        let _ = client.send(&key, b"sync");
        !bodies.lock().is_empty()
    });
    assert!(synced, "connection never came up");

    for body in [b"aa".as_slice(), b"bb", b"cc"] {
        client.send(&key, body).unwrap();
    }

    let complete = wait_until(Duration::from_secs(5), || {
        bodies
            .lock()
            .iter()
            .filter(|b| b.as_slice() != b"sync")
            .count()
            >= 3
    });
    assert!(complete, "not all bodies arrived");

    let ordered: Vec<Vec<u8>> = bodies
        .lock()
        .iter()
        .filter(|b| b.as_slice() != b"sync")
        .cloned()
        .collect();
    assert_eq!(ordered, vec![b"aa".to_vec(), b"bb".to_vec(), b"cc".to_vec()]);

    client.stop().unwrap();
    client.close().unwrap();
    server.stop().unwrap();
    server.close().unwrap();
}
