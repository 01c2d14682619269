//! S4 (§8): after the peer restarts on the same port following an outage,
//! polling should resume producing Good readings within a bounded window,
//! with the outage itself visible as Unavailable readings rather than a gap.

mod common;

use std::time::Duration;

use daq_ingest::Orchestrator;

#[tokio::test]
async fn device_reconnects_after_the_peer_restarts() {
    let port = common::free_port().await;
    let responder = common::spawn_counter_responder(port, 10);

    let store = common::InMemoryStore::new();
    let mut config = common::base_app_config(common::tmp_dir("s4"));
    config.devices.push(common::device_config("flaky", port, 500, 500, 1));

    let mut orchestrator = Orchestrator::new(config, store.clone()).await.unwrap();
    orchestrator.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(6)).await;

    // Stop and restart the simulator on the same port.
    responder.abort();
    let _responder2 = common::spawn_counter_responder(port, 10);

    tokio::time::sleep(Duration::from_secs(4)).await;
    orchestrator.stop().await;

    let readings = store.all_readings().await;
    assert!(readings.iter().any(|r| r.quality.is_unavailable()), "expected at least one unavailable reading spanning the outage");

    let last = readings.last().expect("expected at least one reading");
    assert!(last.quality.is_good(), "expected polling to have resumed with a good reading by the end of the run");
}
