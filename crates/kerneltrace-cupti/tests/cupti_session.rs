//! CUPTI source sessions.
//!
//! Hardware tests are ignored by default. Run with:
//! `cargo test -p kerneltrace-cupti --features cupti -- --ignored`

use kerneltrace_cupti::{is_cupti_available, CuptiSource};

#[cfg(not(feature = "cupti"))]
#[test]
fn test_tracer_construction_fails_without_feature() {
    assert!(!is_cupti_available());
    let err = CuptiSource::new().unwrap_err();
    assert!(err.to_string().contains("CUPTI"));
}

#[cfg(feature = "cupti")]
#[test]
#[ignore = "requires CUPTI"]
fn test_enable_disable_cycle() {
    use kerneltrace_core::prelude::*;

    assert!(is_cupti_available());

    let config = TracerConfigBuilder::new()
        .with_fault_policy(FaultPolicy::Propagate)
        .build();
    let tracer = ActivityTracer::new(CuptiSource::new().unwrap(), config).unwrap();

    for _ in 0..2 {
        tracer.enable().unwrap();
        assert!(tracer.is_enabled());
        tracer.disable().unwrap();
        assert!(!tracer.is_enabled());
    }
    assert!(tracer.gen_profile().end_ns >= tracer.gen_profile().start_ns);
}
