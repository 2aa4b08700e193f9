//! `extern "C"` entry points handed to CUPTI.
//!
//! The buffer callbacks carry no user data, so the handler they forward to
//! lives in a process-wide slot. The launch callback receives its handler
//! through the subscriber's user data pointer instead.

use std::ffi::{c_void, CStr};
use std::sync::Arc;

use cudarc::cupti::sys;
use kerneltrace_core::activity::{ActivityBuffer, ActivityHandler, BufferOrigin, LaunchInfo};
use parking_lot::RwLock;
use tracing::{trace, warn};

static BUFFER_HANDLER: RwLock<Option<Arc<dyn ActivityHandler>>> = parking_lot::const_rwlock(None);

pub(crate) fn set_buffer_handler(handler: Option<Arc<dyn ActivityHandler>>) {
    *BUFFER_HANDLER.write() = handler;
}

fn buffer_handler() -> Option<Arc<dyn ActivityHandler>> {
    BUFFER_HANDLER.read().clone()
}

/// CUPTI asks for an empty activity buffer.
pub(crate) extern "C" fn buffer_requested(
    buffer: *mut *mut u8,
    size: *mut usize,
    max_num_records: *mut usize,
) {
    let requested = buffer_handler().map(|handler| handler.on_buffer_requested());
    let (ptr, capacity) = match requested {
        Some(Ok(activity_buffer)) => activity_buffer.into_raw(),
        Some(Err(err)) => {
            warn!(error = %err, "failed to allocate activity buffer");
            (std::ptr::null_mut(), 0)
        }
        None => {
            warn!("activity buffer requested with no tracer registered");
            (std::ptr::null_mut(), 0)
        }
    };
    trace!(capacity, "handing activity buffer to CUPTI");

    // Safety: CUPTI passes valid out-pointers.
    unsafe {
        *buffer = ptr;
        *size = capacity;
        *max_num_records = 0;
    }
}

/// CUPTI returns a filled activity buffer.
pub(crate) extern "C" fn buffer_completed(
    context: cudarc::driver::sys::CUcontext,
    stream_id: u32,
    buffer: *mut u8,
    size: usize,
    valid_size: usize,
) {
    // Safety: `buffer` and `size` were produced by `ActivityBuffer::into_raw`
    // in `buffer_requested` and CUPTI hands each buffer back exactly once.
    let Some(activity_buffer) = (unsafe { ActivityBuffer::from_raw(buffer, size, valid_size) })
    else {
        return;
    };

    let origin = BufferOrigin {
        context: context as usize,
        stream_id,
    };
    match buffer_handler() {
        Some(handler) => handler.on_buffer_completed(origin, activity_buffer),
        None => warn!(
            valid_size,
            "activity buffer completed after the tracer was finalized"
        ),
    }
}

/// Driver API callback; only the entry of `cuLaunchKernel` is enabled.
pub(crate) unsafe extern "C" fn launch_callback(
    userdata: *mut c_void,
    domain: sys::CUpti_CallbackDomain,
    _cbid: sys::CUpti_CallbackId,
    cbdata: *const c_void,
) {
    if userdata.is_null()
        || cbdata.is_null()
        || domain != sys::CUpti_CallbackDomain::CUPTI_CB_DOMAIN_DRIVER_API
    {
        return;
    }

    // Safety: `userdata` is the boxed handler installed at subscription and
    // stays alive until after unsubscribe. Driver API callbacks carry
    // `CUpti_CallbackData`.
    let handler = unsafe { &*(userdata as *const Arc<dyn ActivityHandler>) };
    let data = unsafe { &*(cbdata as *const sys::CUpti_CallbackData) };

    if data.callbackSite != sys::CUpti_ApiCallbackSite::CUPTI_API_ENTER {
        return;
    }

    let symbol_name = if data.symbolName.is_null() {
        None
    } else {
        // Safety: CUPTI provides a NUL-terminated symbol name valid for the callback.
        unsafe { CStr::from_ptr(data.symbolName) }.to_str().ok()
    };

    handler.on_launch_entered(LaunchInfo {
        correlation_id: data.correlationId,
        symbol_name,
    });
}
