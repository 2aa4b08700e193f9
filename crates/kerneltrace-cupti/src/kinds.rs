//! Activity kind conversions.

use cudarc::cupti::sys::CUpti_ActivityKind;
use kerneltrace_core::activity::ActivityKind;

pub(crate) fn to_cupti(kind: ActivityKind) -> CUpti_ActivityKind {
    match kind {
        ActivityKind::Memcpy => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MEMCPY,
        ActivityKind::Memset => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MEMSET,
        ActivityKind::Kernel => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_KERNEL,
        ActivityKind::Driver => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_DRIVER,
        ActivityKind::Runtime => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_RUNTIME,
        ActivityKind::Device => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_DEVICE,
        ActivityKind::Context => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_CONTEXT,
        ActivityKind::ConcurrentKernel => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_CONCURRENT_KERNEL,
        ActivityKind::Name => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_NAME,
        ActivityKind::Marker => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_MARKER,
        ActivityKind::Overhead => CUpti_ActivityKind::CUPTI_ACTIVITY_KIND_OVERHEAD,
    }
}

pub(crate) fn from_cupti(kind: CUpti_ActivityKind) -> Option<ActivityKind> {
    ActivityKind::from_raw(kind as u32)
}
