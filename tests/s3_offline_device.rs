//! S3 (§8): a device with nothing listening on its configured port should
//! emit only Unavailable readings - a connection failure must never be
//! silently dropped or mistaken for a Good zero.

mod common;

use std::time::Duration;

use daq_ingest::Orchestrator;

#[tokio::test]
async fn offline_device_emits_only_unavailable_readings() {
    let port = common::free_port().await; // nothing ever binds this port

    let store = common::InMemoryStore::new();
    let mut config = common::base_app_config(common::tmp_dir("s3"));
    config.devices.push(common::device_config("ghost", port, 800, 500, 0));

    let mut orchestrator = Orchestrator::new(config, store.clone()).await.unwrap();
    orchestrator.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    orchestrator.stop().await;

    let readings = store.all_readings().await;
    assert!(!readings.is_empty(), "expected at least one emitted reading");
    assert!(readings.iter().all(|r| r.quality.is_unavailable()), "offline device produced a non-unavailable reading");
}
