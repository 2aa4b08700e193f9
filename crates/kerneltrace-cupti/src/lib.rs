//! # KernelTrace CUPTI
//!
//! CUPTI activity source for `kerneltrace-core`.
//!
//! With the `cupti` feature enabled, [`CuptiSource`] forwards CUPTI activity
//! buffers and driver-API launch callbacks to the tracer. Without it, a stub
//! source is exported whose constructor reports the backend as unavailable.
//!
//! ## Example
//!
//! ```ignore
//! use kerneltrace_core::prelude::*;
//! use kerneltrace_cupti::CuptiSource;
//!
//! let tracer = ActivityTracer::new(CuptiSource::new()?, TracerConfig::default())?;
//! tracer.enable()?;
//! // ... launch kernels ...
//! tracer.disable()?;
//! tracer.gen_profile().log_summary();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(feature = "cupti")]
mod callbacks;
#[cfg(feature = "cupti")]
mod kinds;
#[cfg(feature = "cupti")]
mod records;
#[cfg(feature = "cupti")]
mod source;

#[cfg(feature = "cupti")]
pub use source::CuptiSource;

// Placeholder implementation when CUPTI is not available
#[cfg(not(feature = "cupti"))]
mod stub {
    use std::sync::Arc;

    use kerneltrace_core::activity::{
        ActivityBuffer, ActivityHandler, ActivityKind, ActivitySource, BufferOrigin, RecordIter,
        SubscribeOutcome,
    };
    use kerneltrace_core::error::{Result, TraceError};

    fn unavailable() -> TraceError {
        TraceError::BackendUnavailable("CUPTI".to_string())
    }

    /// Stub CUPTI source when the `cupti` feature is disabled.
    #[derive(Debug)]
    pub struct CuptiSource {
        _private: (),
    }

    impl CuptiSource {
        /// Create fails when CUPTI is not available.
        pub fn new() -> Result<Self> {
            Err(TraceError::BackendUnavailable(
                "CUPTI feature not enabled".to_string(),
            ))
        }
    }

    impl ActivitySource for CuptiSource {
        fn name(&self) -> &'static str {
            "cupti"
        }

        fn enable_kind(&self, _kind: ActivityKind) -> Result<()> {
            Err(unavailable())
        }

        fn disable_kind(&self, _kind: ActivityKind) -> Result<()> {
            Err(unavailable())
        }

        fn register_buffer_callbacks(&self, _handler: Arc<dyn ActivityHandler>) -> Result<()> {
            Err(unavailable())
        }

        fn subscribe_launches(
            &self,
            _handler: Arc<dyn ActivityHandler>,
        ) -> Result<SubscribeOutcome> {
            Err(unavailable())
        }

        fn unsubscribe_launches(&self) -> Result<()> {
            Ok(())
        }

        fn timestamp_ns(&self) -> Result<u64> {
            Err(unavailable())
        }

        fn flush_all(&self, _forced: bool) -> Result<()> {
            Ok(())
        }

        fn finalize(&self) -> Result<()> {
            Ok(())
        }

        fn records<'a>(&'a self, _buffer: &'a ActivityBuffer) -> RecordIter<'a> {
            Box::new(std::iter::empty())
        }

        fn dropped_records(&self, _origin: BufferOrigin) -> Result<usize> {
            Ok(0)
        }
    }
}

#[cfg(not(feature = "cupti"))]
pub use stub::CuptiSource;

/// Check if CUPTI is usable at runtime.
///
/// Returns false if the `cupti` feature is disabled or the CUPTI library
/// cannot be loaded. Panics from cudarc's dynamic loader are caught.
pub fn is_cupti_available() -> bool {
    #[cfg(feature = "cupti")]
    {
        source::cupti_version().is_some()
    }
    #[cfg(not(feature = "cupti"))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "cupti"))]
    #[test]
    fn test_stub_reports_unavailable() {
        use kerneltrace_core::error::TraceError;

        assert!(!is_cupti_available());
        assert!(matches!(
            CuptiSource::new(),
            Err(TraceError::BackendUnavailable(_))
        ));
    }

    #[cfg(feature = "cupti")]
    #[test]
    #[ignore = "requires CUPTI"]
    fn test_cupti_available() {
        assert!(is_cupti_available());
        assert!(CuptiSource::new().is_ok());
    }
}
