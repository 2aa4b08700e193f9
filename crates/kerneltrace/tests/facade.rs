//! Facade-level tests: backend selection, context, report export.

use std::sync::Arc;
use std::thread;

use kerneltrace::prelude::*;
use kerneltrace::synthetic::SyntheticSource;

#[test]
fn test_inert_context_records_nothing() {
    let ctx = kerneltrace::context(Backend::Inert, TracerConfig::default());
    assert!(!ctx.is_initialized());

    let tracer = ctx.tracer();
    tracer.enable().unwrap();
    tracer.add_annotation(7, "matmul_0");
    tracer.add_kernel_record(KernelRecord {
        start_ns: 1000,
        end_ns: 1500,
        device_id: 0,
        stream_id: 1,
        correlation_id: 7,
    });
    tracer.disable().unwrap();

    assert!(ctx.is_initialized());
    assert!(tracer.gen_profile().is_empty());
}

#[test]
fn test_context_shared_across_threads() {
    let ctx = Arc::new(kerneltrace::context(Backend::Auto, TracerConfig::default()));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            thread::spawn(move || Arc::as_ptr(ctx.tracer()) as *const () as usize)
        })
        .collect();
    let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(addrs.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn test_cupti_context_falls_back_when_unavailable() {
    if kerneltrace::is_cupti_available() {
        return;
    }
    let ctx = kerneltrace::context(Backend::Cupti, TracerConfig::default());
    let tracer = ctx.tracer();
    tracer.enable().unwrap();
    assert!(!tracer.is_enabled());
}

#[test]
fn test_profile_exports_as_json() {
    let source = Arc::new(SyntheticSource::new());
    let config = TracerConfigBuilder::new()
        .with_fault_policy(FaultPolicy::Propagate)
        .build();
    let tracer: Arc<dyn DeviceTracer> =
        Arc::new(ActivityTracer::with_shared_source(Arc::clone(&source), config).unwrap());
    let ctx = TracerContext::with_tracer(Arc::clone(&tracer));

    source.set_clock(10);
    ctx.tracer().enable().unwrap();
    {
        let _op = annotate("matmul_0");
        source.launch(7, Some("sgemm"));
    }
    source.complete_kernel(KernelRecord {
        start_ns: 1000,
        end_ns: 1500,
        device_id: 0,
        stream_id: 1,
        correlation_id: 7,
    });
    source.complete_kernel(KernelRecord {
        start_ns: 1600,
        end_ns: 1700,
        device_id: 0,
        stream_id: 1,
        correlation_id: 99,
    });
    source.set_clock(2000);
    ctx.tracer().disable().unwrap();

    let profile = ctx.tracer().gen_profile();
    let json: serde_json::Value = serde_json::from_str(&profile.to_json().unwrap()).unwrap();
    assert_eq!(json["start_ns"], 10);
    assert_eq!(json["end_ns"], 2000);
    assert_eq!(json["unresolved"], 1);
    assert_eq!(json["events"][0]["name"], "matmul_0");
    assert_eq!(json["events"][0]["stream_id"], 1);
    assert_eq!(json["events"].as_array().map(Vec::len), Some(1));
}
