//! Synthetic Tracing Session Example
//!
//! This example drives a tracer with the in-process synthetic source:
//! - Annotated launches from several worker threads
//! - A kernel record with no matching launch
//! - Per-name summary and JSON export
//!
//! Run with: `cargo run -p kerneltrace --example synthetic_session`

use std::sync::Arc;
use std::thread;

use kerneltrace::prelude::*;
use kerneltrace::synthetic::SyntheticSource;

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    kerneltrace::init_logging();

    let source = Arc::new(SyntheticSource::new());
    let tracer = ActivityTracer::with_shared_source(Arc::clone(&source), TracerConfig::from_env()?)?;

    source.set_clock(0);
    tracer.enable()?;

    let ops = ["conv2d_0", "relu_0", "matmul_0"];
    let workers: Vec<_> = ops
        .iter()
        .enumerate()
        .map(|(worker, op)| {
            let source = Arc::clone(&source);
            let op = op.to_string();
            thread::spawn(move || {
                let _scope = annotate(&op);
                for i in 0..4u32 {
                    let id = worker as u32 * 100 + i;
                    let start = u64::from(id) * 1_000;
                    source.launch(id, Some("generic_kernel"));
                    source.complete_kernel(KernelRecord {
                        start_ns: start,
                        end_ns: start + 250 * (worker as u64 + 1),
                        device_id: 0,
                        stream_id: worker as u32 + 1,
                        correlation_id: id,
                    });
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().map_err(|_| "worker panicked")?;
    }

    // A record whose launch was never observed.
    source.complete_kernel(KernelRecord {
        start_ns: 90_000,
        end_ns: 91_000,
        device_id: 0,
        stream_id: 9,
        correlation_id: 9_999,
    });

    source.set_clock(1_000_000);
    tracer.disable()?;

    let profile = tracer.gen_profile();
    println!("\n=== Summary ===");
    for (name, summary) in profile.summary() {
        println!(
            "{name:>10}: {:>8.4} ms over {} kernels",
            summary.total_ms(),
            summary.count
        );
    }
    println!("unresolved records: {}", profile.unresolved);
    println!("\n{}", profile.to_json()?);

    Ok(())
}
