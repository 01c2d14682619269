//! S6 (§8): a counter advancing at a steady rate through a wraparound must
//! never produce a rate spike - the overflow adjustment should make the
//! wrap invisible to the computed rate.

use daq_ingest::core::reading::{ChannelConfig, DataType, RegisterType};
use daq_ingest::processor::DataProcessor;

#[test]
fn counter_overflow_never_produces_a_rate_spike() {
    let processor = DataProcessor::new();
    let channel = ChannelConfig {
        channel_number: 1,
        start_register: 0,
        register_count: 1,
        register_type: RegisterType::Holding,
        data_type: DataType::UInt16,
        scale: 1.0,
        offset: 0.0,
        unit: "count".to_string(),
        min: None,
        max: None,
        max_change_rate: None,
        rate_window_seconds: 30,
        enabled: true,
    };
    processor.register_modbus_device("wrap-sim", &[channel]);

    // A 16-bit counter advancing at 600 units/min (10 u/s), starting near
    // the wrap boundary so it rolls over partway through the run.
    let start_raw: i64 = 65470;
    let t0 = chrono::Utc::now();
    let mut saw_rate = false;

    for i in 0..10i64 {
        let raw = (start_raw + i * 10) % 65536;
        let ts = t0 + chrono::Duration::seconds(i + 1);
        let r = processor.process_success("wrap-sim", 1, ts, raw);
        if let Some(rate) = r.rate {
            saw_rate = true;
            assert!((-20.0..=20.0).contains(&rate), "rate {rate} outside [-20, 20] at step {i}");
        }
    }

    assert!(saw_rate, "expected at least one computed rate over the run");
}
