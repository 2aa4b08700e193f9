//! # KernelTrace Core
//!
//! Correlates GPU kernel executions with the host-side operations that
//! launched them.
//!
//! An [`ActivitySource`](activity::ActivitySource) reports two streams of
//! events: launch notifications, delivered synchronously on the launching
//! thread, and completed kernel records, delivered later in buffers. Both
//! carry a correlation id. The tracer stores the launching thread's current
//! annotation under the id at launch time and joins the two streams when a
//! profile is generated.
//!
//! ## Core Abstractions
//!
//! - [`DeviceTracer`] - Session lifecycle and profile generation
//! - [`ActivityTracer`] - Tracer over any activity source
//! - [`InertTracer`] - Tracer that records nothing
//! - [`TracerContext`] - Lazily constructed process-wide tracer
//! - [`Profile`] - Correlated session output
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use kerneltrace_core::prelude::*;
//! use kerneltrace_core::synthetic::SyntheticSource;
//!
//! let source = Arc::new(SyntheticSource::new());
//! let tracer = ActivityTracer::with_shared_source(Arc::clone(&source), TracerConfig::default())?;
//! tracer.enable()?;
//! {
//!     let _op = annotate("relu_3");
//!     source.launch(1, Some("relu_kernel"));
//! }
//! source.complete_kernel(KernelRecord {
//!     start_ns: 10,
//!     end_ns: 40,
//!     device_id: 0,
//!     stream_id: 7,
//!     correlation_id: 1,
//! });
//! tracer.disable()?;
//!
//! let summary = tracer.gen_profile().summary();
//! assert_eq!(summary["relu_3"].total_ns, 30);
//! # Ok::<(), TraceError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod activity;
mod adapter;
pub mod annotation;
pub mod config;
pub mod context;
pub mod error;
pub mod inert;
pub mod report;
pub mod synthetic;
pub mod table;
pub mod tracer;

pub use activity::{
    ActivityBuffer, ActivityHandler, ActivityKind, ActivityRecord, ActivitySource, BufferOrigin,
    CorrelationId, KernelRecord, LaunchInfo, RecordIter, SubscribeOutcome,
};
pub use adapter::UNKNOWN_KERNEL;
pub use annotation::{
    annotate, clear_current_annotation, current_annotation, set_current_annotation,
    AnnotationGuard,
};
pub use config::{DuplicatePolicy, FaultPolicy, TracerConfig, TracerConfigBuilder};
pub use context::TracerContext;
pub use error::{Result, TraceError};
pub use inert::InertTracer;
pub use report::{Event, KernelSummary, Profile};
pub use tracer::{ActivityTracer, DeviceTracer, TracerStats};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::{ActivityKind, ActivitySource, CorrelationId, KernelRecord};
    pub use crate::annotation::{
        annotate, clear_current_annotation, current_annotation, set_current_annotation,
    };
    pub use crate::config::{DuplicatePolicy, FaultPolicy, TracerConfig, TracerConfigBuilder};
    pub use crate::context::TracerContext;
    pub use crate::error::{Result, TraceError};
    pub use crate::inert::InertTracer;
    pub use crate::report::{Event, KernelSummary, Profile};
    pub use crate::tracer::{ActivityTracer, DeviceTracer, TracerStats};
}
