use daq_telemetry::TelemetryMetrics;

#[test]
fn counters_accumulate_per_instance() {
    let metrics = TelemetryMetrics::new();
    metrics.record_sample(true);
    metrics.record_sample(false);
    metrics.record_sample(false);
    metrics.record_ticks_coalesced(3);
    metrics.record_write(false);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.samples_valid, 1);
    assert_eq!(snapshot.samples_failed, 2);
    assert_eq!(snapshot.ticks_coalesced, 3);
    assert_eq!(snapshot.writes, 1);
    assert_eq!(snapshot.write_failures, 1);

    let other = TelemetryMetrics::new();
    assert_eq!(other.snapshot().samples_valid, 0);
}

#[test]
fn init_tracing_is_idempotent() {
    daq_telemetry::init_tracing();
    daq_telemetry::init_tracing();
}
