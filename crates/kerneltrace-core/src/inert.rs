//! Tracer used when no activity source is available.

use crate::activity::{CorrelationId, KernelRecord};
use crate::error::Result;
use crate::report::Profile;
use crate::tracer::{DeviceTracer, TracerStats};

/// A tracer that records nothing.
///
/// Every operation succeeds, [`DeviceTracer::is_enabled`] is always `false`
/// and profiles are always empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct InertTracer;

impl InertTracer {
    /// Create an inert tracer.
    pub fn new() -> Self {
        Self
    }
}

impl DeviceTracer for InertTracer {
    fn enable(&self) -> Result<()> {
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn add_annotation(&self, _id: CorrelationId, _name: &str) {}

    fn add_kernel_record(&self, _record: KernelRecord) {}

    fn gen_profile(&self) -> Profile {
        Profile::default()
    }

    fn stats(&self) -> TracerStats {
        TracerStats::default()
    }
}
