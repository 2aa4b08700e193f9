//! # KernelTrace
//!
//! GPU kernel execution tracer. Records which host operation launched each
//! kernel and how long the kernel ran on the device.
//!
//! ## Features
//!
//! - `cupti` - CUPTI activity source (requires the CUDA toolkit at runtime)
//!
//! ## Quick Start
//!
//! ```ignore
//! use kerneltrace::prelude::*;
//!
//! kerneltrace::init_logging();
//! let ctx = kerneltrace::context(Backend::Auto, TracerConfig::default());
//! let tracer = ctx.tracer();
//!
//! tracer.enable()?;
//! {
//!     let _op = annotate("matmul_0");
//!     // ... launch kernels ...
//! }
//! tracer.disable()?;
//!
//! for (name, summary) in tracer.gen_profile().summary() {
//!     println!("{name}: {:.3} ms, {} kernels", summary.total_ms(), summary.count);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

pub use kerneltrace_core::*;
pub use kerneltrace_cupti::{is_cupti_available, CuptiSource};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::Backend;
    pub use kerneltrace_core::prelude::*;
}

/// Activity source backing a tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    /// CUPTI when available, otherwise inert.
    #[default]
    Auto,
    /// NVIDIA CUPTI.
    Cupti,
    /// Records nothing.
    Inert,
}

/// Build a tracer over the requested backend.
///
/// `Backend::Cupti` fails when the `cupti` feature is disabled or the library
/// cannot be loaded; `Backend::Auto` falls back to an inert tracer instead.
pub fn build_tracer(backend: Backend, config: TracerConfig) -> Result<Arc<dyn DeviceTracer>> {
    match backend {
        Backend::Auto => build_auto(config),
        Backend::Cupti => {
            let tracer = ActivityTracer::new(CuptiSource::new()?, config)?;
            Ok(Arc::new(tracer))
        }
        Backend::Inert => Ok(Arc::new(InertTracer::new())),
    }
}

fn build_auto(config: TracerConfig) -> Result<Arc<dyn DeviceTracer>> {
    if is_cupti_available() {
        tracing::info!("Auto-selected CUPTI backend");
        return build_tracer(Backend::Cupti, config);
    }

    tracing::info!("Auto-selected inert tracer (CUPTI not available)");
    Ok(Arc::new(InertTracer::new()))
}

/// Create a context whose tracer is built on first access.
///
/// If the backend cannot be constructed the failure is logged and the
/// context falls back to an inert tracer.
pub fn context(backend: Backend, config: TracerConfig) -> TracerContext {
    TracerContext::new(move || match build_tracer(backend, config.clone()) {
        Ok(tracer) => tracer,
        Err(err) => {
            tracing::warn!(?backend, error = %err, "falling back to inert tracer");
            Arc::new(InertTracer::new())
        }
    })
}

/// Backends usable in this process.
pub fn available_backends() -> Vec<Backend> {
    let mut backends = vec![Backend::Inert];
    if is_cupti_available() {
        backends.push(Backend::Cupti);
    }
    backends
}

/// Install a `tracing` subscriber filtered by `RUST_LOG`, defaulting to `info`.
///
/// Does nothing if a global subscriber is already set.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
