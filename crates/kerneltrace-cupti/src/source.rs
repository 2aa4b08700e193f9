//! CUPTI-backed activity source.

use std::ffi::c_void;
use std::sync::Arc;

use cudarc::cupti::{result, sys};
use kerneltrace_core::activity::{
    ActivityBuffer, ActivityHandler, ActivityKind, ActivitySource, BufferOrigin, RecordIter,
    SubscribeOutcome,
};
use kerneltrace_core::error::{Result, TraceError};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::callbacks;
use crate::kinds;
use crate::records::CuptiRecords;

fn cupti_call(call: &'static str, status: sys::CUptiResult) -> Result<()> {
    status
        .result()
        .map_err(|err| TraceError::source_call(call, format!("{err:?}")))
}

/// CUPTI version, or `None` if the library cannot be loaded.
pub(crate) fn cupti_version() -> Option<u32> {
    std::panic::catch_unwind(|| {
        let mut version = 0u32;
        // Safety: out-pointer to a local.
        unsafe { sys::cuptiGetVersion(&mut version) }
            .result()
            .ok()
            .map(|()| version)
    })
    .ok()
    .flatten()
}

struct Subscription {
    handle: sys::CUpti_SubscriberHandle,
    userdata: *mut Arc<dyn ActivityHandler>,
}

// The handle is an opaque token and the boxed handler is Send + Sync.
unsafe impl Send for Subscription {}

/// Activity source backed by NVIDIA CUPTI.
///
/// CUPTI keeps one set of buffer callbacks per process, so only one
/// `CuptiSource` should be driven at a time.
pub struct CuptiSource {
    version: u32,
    subscription: Mutex<Option<Subscription>>,
}

impl CuptiSource {
    /// Load CUPTI and create a source.
    pub fn new() -> Result<Self> {
        let version = cupti_version().ok_or_else(|| {
            TraceError::BackendUnavailable("CUPTI library could not be loaded".to_string())
        })?;
        debug!(version, "CUPTI loaded");
        Ok(Self {
            version,
            subscription: Mutex::new(None),
        })
    }

    /// CUPTI API version.
    pub fn version(&self) -> u32 {
        self.version
    }
}

impl ActivitySource for CuptiSource {
    fn name(&self) -> &'static str {
        "cupti"
    }

    fn enable_kind(&self, kind: ActivityKind) -> Result<()> {
        trace!(kind = kind.label(), "enabling activity kind");
        result::activity::enable(kinds::to_cupti(kind))
            .map_err(|err| TraceError::source_call("cuptiActivityEnable", format!("{err:?}")))
    }

    fn disable_kind(&self, kind: ActivityKind) -> Result<()> {
        trace!(kind = kind.label(), "disabling activity kind");
        result::activity::disable(kinds::to_cupti(kind))
            .map_err(|err| TraceError::source_call("cuptiActivityDisable", format!("{err:?}")))
    }

    fn register_buffer_callbacks(&self, handler: Arc<dyn ActivityHandler>) -> Result<()> {
        callbacks::set_buffer_handler(Some(handler));
        result::activity::register_callbacks(
            Some(callbacks::buffer_requested),
            Some(callbacks::buffer_completed),
        )
        .map_err(|err| {
            callbacks::set_buffer_handler(None);
            TraceError::source_call("cuptiActivityRegisterCallbacks", format!("{err:?}"))
        })
    }

    fn subscribe_launches(&self, handler: Arc<dyn ActivityHandler>) -> Result<SubscribeOutcome> {
        let mut slot = self.subscription.lock();
        if slot.is_some() {
            return Ok(SubscribeOutcome::Subscribed);
        }

        let userdata = Box::into_raw(Box::new(handler));
        let mut handle: sys::CUpti_SubscriberHandle = std::ptr::null_mut();
        // Safety: `userdata` stays alive until `unsubscribe_launches` frees it.
        let status = unsafe {
            sys::cuptiSubscribe(
                &mut handle,
                Some(callbacks::launch_callback),
                userdata as *mut c_void,
            )
        };

        let subscribed = match status {
            sys::CUptiResult::CUPTI_SUCCESS => Ok(()),
            sys::CUptiResult::CUPTI_ERROR_MAX_LIMIT_REACHED => {
                // Safety: CUPTI did not keep the pointer.
                drop(unsafe { Box::from_raw(userdata) });
                return Ok(SubscribeOutcome::LimitReached);
            }
            other => cupti_call("cuptiSubscribe", other),
        };
        if let Err(err) = subscribed {
            // Safety: CUPTI did not keep the pointer.
            drop(unsafe { Box::from_raw(userdata) });
            return Err(err);
        }

        let cbid = sys::CUpti_driver_api_trace_cbid_enum::CUPTI_DRIVER_TRACE_CBID_cuLaunchKernel
            as sys::CUpti_CallbackId;
        // Safety: `handle` was just returned by cuptiSubscribe.
        let enabled = cupti_call("cuptiEnableCallback", unsafe {
            sys::cuptiEnableCallback(
                1,
                handle,
                sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API,
                cbid,
            )
        });
        if let Err(err) = enabled {
            // Safety: unsubscribing first means no callback can observe userdata.
            unsafe {
                let _ = sys::cuptiUnsubscribe(handle);
                drop(Box::from_raw(userdata));
            }
            return Err(err);
        }

        *slot = Some(Subscription { handle, userdata });
        Ok(SubscribeOutcome::Subscribed)
    }

    fn unsubscribe_launches(&self) -> Result<()> {
        let Some(subscription) = self.subscription.lock().take() else {
            return Ok(());
        };
        // Safety: the handle came from cuptiSubscribe.
        let status = cupti_call("cuptiUnsubscribe", unsafe {
            sys::cuptiUnsubscribe(subscription.handle)
        });
        // Safety: after unsubscribe no callback can run with this pointer.
        drop(unsafe { Box::from_raw(subscription.userdata) });
        status
    }

    fn timestamp_ns(&self) -> Result<u64> {
        let mut timestamp = 0u64;
        // Safety: out-pointer to a local.
        cupti_call("cuptiGetTimestamp", unsafe {
            sys::cuptiGetTimestamp(&mut timestamp)
        })?;
        Ok(timestamp)
    }

    fn flush_all(&self, forced: bool) -> Result<()> {
        trace!(forced, "flushing activity buffers");
        result::activity::flush_all(if forced {
            sys::CUpti_ActivityFlag::CUPTI_ACTIVITY_FLAG_FLUSH_FORCED as u32
        } else {
            0
        })
        .map_err(|err| TraceError::source_call("cuptiActivityFlushAll", format!("{err:?}")))
    }

    fn finalize(&self) -> Result<()> {
        let finalized = result::finalize()
            .map_err(|err| TraceError::source_call("cuptiFinalize", format!("{err:?}")));
        callbacks::set_buffer_handler(None);
        finalized
    }

    fn records<'a>(&'a self, buffer: &'a ActivityBuffer) -> RecordIter<'a> {
        Box::new(CuptiRecords::new(buffer))
    }

    fn dropped_records(&self, origin: BufferOrigin) -> Result<usize> {
        let mut dropped = 0usize;
        // Safety: the context handle was passed to us by CUPTI for this buffer.
        cupti_call("cuptiActivityGetNumDroppedRecords", unsafe {
            sys::cuptiActivityGetNumDroppedRecords(
                origin.context as _,
                origin.stream_id,
                &mut dropped,
            )
        })?;
        Ok(dropped)
    }
}

impl Drop for CuptiSource {
    fn drop(&mut self) {
        if let Err(err) = self.unsubscribe_launches() {
            debug!(error = %err, "unsubscribe on drop failed");
        }
    }
}

impl std::fmt::Debug for CuptiSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CuptiSource")
            .field("version", &self.version)
            .field("subscribed", &self.subscription.lock().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kerneltrace_core::prelude::*;

    use super::*;

    #[test]
    #[ignore = "requires CUPTI"]
    fn test_timestamp_is_monotonic() {
        let source = CuptiSource::new().unwrap();
        let first = source.timestamp_ns().unwrap();
        let second = source.timestamp_ns().unwrap();
        assert!(second >= first);
    }

    #[test]
    #[ignore = "requires CUPTI"]
    fn test_session_without_launches() {
        let source = Arc::new(CuptiSource::new().unwrap());
        let config = TracerConfigBuilder::new()
            .with_fault_policy(FaultPolicy::Propagate)
            .build();
        let tracer = ActivityTracer::with_shared_source(source, config).unwrap();

        tracer.enable().unwrap();
        tracer.disable().unwrap();

        let profile = tracer.gen_profile();
        assert!(profile.is_empty());
        assert!(profile.end_ns >= profile.start_ns);
    }
}
