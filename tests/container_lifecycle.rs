//! Container: manifest-driven endpoint lifecycle for one node id

mod common;

use common::{latest_cache_config, queue_cache_config, write_file};
use setu_pdu::{EndpointContainer, Error, PduResolvedKey};

fn write_manifest(dir: &std::path::Path) -> std::path::PathBuf {
    latest_cache_config(dir);
    queue_cache_config(dir, 3);
    write_file(dir, "ep1.json", r#"{"cache":"cache_latest.json"}"#);
    write_file(dir, "ep2.json", r#"{"cache":"cache_queue.json"}"#);
    write_file(
        dir,
        "container.json",
        r#"[
          {
            "nodeId": "node1",
            "endpoints": [
              {"id": "ep1", "config_path": "ep1.json"},
              {"id": "ep2", "config_path": "ep2.json", "direction": "inout"}
            ]
          },
          {
            "nodeId": "other_node",
            "endpoints": [
              {"id": "ignored", "config_path": "does_not_exist.json"}
            ]
          }
        ]"#,
    )
}

#[test]
fn test_initialize_and_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path());

    let container = EndpointContainer::new("node1", &manifest);
    container.initialize().unwrap();

    let mut ids = container.list_endpoint_ids();
    ids.sort();
    assert_eq!(ids, vec!["ep1".to_string(), "ep2".to_string()]);

    container.start_all().unwrap();
    assert!(container.is_running_all());

    let ep1 = container.ref_endpoint("ep1").unwrap();
    let key = PduResolvedKey::new("robot", 1);
    ep1.send(&key, &[0x42]).unwrap();

    // a second start_all is a no-op: endpoints stay running, data survives
    container.start_all().unwrap();
    let mut buf = [0u8; 4];
    assert_eq!(ep1.recv(&key, &mut buf).unwrap(), 1);
    assert_eq!(buf[0], 0x42);

    container.stop_all().unwrap();
    assert!(!container.is_running_all());
    // stopped and cleared: lifecycle calls need a fresh initialize
    assert!(matches!(
        container.start_all(),
        Err(Error::InvalidConfig(_))
    ));

    container.initialize().unwrap();
    container.start_all().unwrap();
    assert!(container.is_running_all());
    container.stop_all().unwrap();
}

#[test]
fn test_per_endpoint_start_stop() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path());

    let container = EndpointContainer::new("node1", &manifest);
    container.initialize().unwrap();

    container.start("ep1").unwrap();
    assert!(container.ref_endpoint("ep1").unwrap().is_running());
    assert!(!container.ref_endpoint("ep2").unwrap().is_running());

    // starting twice is a no-op
    container.start("ep1").unwrap();

    // stop closes and evicts the endpoint
    container.stop("ep1").unwrap();
    assert!(container.ref_endpoint("ep1").is_none());
    assert!(!container.last_error().is_empty());

    // stopping an unknown endpoint is fine
    container.stop("no_such_endpoint").unwrap();

    container.stop_all().unwrap();
}

#[test]
fn test_unknown_node_id() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path());

    let container = EndpointContainer::new("node_that_is_not_there", &manifest);
    assert!(matches!(container.initialize(), Err(Error::NoEntry)));
    assert!(container.last_error().contains("node_that_is_not_there"));
}

#[test]
fn test_initialize_rolls_back_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    latest_cache_config(dir.path());
    write_file(dir.path(), "good.json", r#"{"cache":"cache_latest.json"}"#);
    // second endpoint misses its cache entry and fails to open
    write_file(dir.path(), "bad.json", r#"{}"#);
    let manifest = write_file(
        dir.path(),
        "container.json",
        r#"[
          {
            "nodeId": "node1",
            "endpoints": [
              {"id": "good", "config_path": "good.json"},
              {"id": "bad", "config_path": "bad.json"}
            ]
          }
        ]"#,
    );

    let container = EndpointContainer::new("node1", &manifest);
    assert!(container.initialize().is_err());
    assert!(!container.last_error().is_empty());

    // rollback left the container uninitialized
    assert!(container.ref_endpoint("good").is_none());
    assert!(matches!(
        container.start_all(),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_double_initialize_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = write_manifest(dir.path());

    let container = EndpointContainer::new("node1", &manifest);
    container.initialize().unwrap();
    assert!(matches!(
        container.initialize(),
        Err(Error::InvalidConfig(_))
    ));
    container.stop_all().unwrap();
}
