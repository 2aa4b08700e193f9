//! Lazily constructed, process-wide tracer handle.
//!
//! A [`TracerContext`] builds its tracer on first access from a factory and
//! hands out the same instance afterwards. Concurrent first accesses construct
//! exactly one tracer.
//!
//! ```
//! use std::sync::{Arc, OnceLock};
//! use kerneltrace_core::context::TracerContext;
//! use kerneltrace_core::inert::InertTracer;
//!
//! static TRACER: OnceLock<TracerContext> = OnceLock::new();
//!
//! let ctx = TRACER.get_or_init(|| TracerContext::new(|| Arc::new(InertTracer::new())));
//! assert!(!ctx.tracer().is_enabled());
//! ```

use std::sync::{Arc, OnceLock};

use crate::inert::InertTracer;
use crate::tracer::DeviceTracer;

type TracerFactory = Box<dyn Fn() -> Arc<dyn DeviceTracer> + Send + Sync>;

/// Owner of the one tracer instance.
pub struct TracerContext {
    tracer: OnceLock<Arc<dyn DeviceTracer>>,
    factory: TracerFactory,
}

impl TracerContext {
    /// Create a context that builds its tracer with `factory` on first use.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Arc<dyn DeviceTracer> + Send + Sync + 'static,
    {
        Self {
            tracer: OnceLock::new(),
            factory: Box::new(factory),
        }
    }

    /// Create a context around an already built tracer.
    pub fn with_tracer(tracer: Arc<dyn DeviceTracer>) -> Self {
        let ctx = Self::new(|| Arc::new(InertTracer::new()));
        let _ = ctx.tracer.set(tracer);
        ctx
    }

    /// Context whose tracer is an [`InertTracer`].
    pub fn inert() -> Self {
        Self::new(|| Arc::new(InertTracer::new()))
    }

    /// The tracer, constructing it on first call.
    pub fn tracer(&self) -> &Arc<dyn DeviceTracer> {
        self.tracer.get_or_init(|| {
            tracing::debug!("constructing device tracer");
            (self.factory)()
        })
    }

    /// Whether the tracer has been constructed.
    pub fn is_initialized(&self) -> bool {
        self.tracer.get().is_some()
    }
}

impl std::fmt::Debug for TracerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracerContext")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
