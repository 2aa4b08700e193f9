//! Iteration over CUPTI activity records in a completed buffer.

use cudarc::cupti::{result, sys};
use kerneltrace_core::activity::{ActivityBuffer, ActivityRecord, KernelRecord};
use kerneltrace_core::error::{Result, TraceError};

use crate::kinds;

/// Walks a buffer with `cuptiActivityGetNextRecord`.
///
/// The walk ends cleanly at the end of the valid data, on a record of a kind
/// the library does not know, and when the library was never initialized.
/// Any other status is a decode error.
pub(crate) struct CuptiRecords<'a> {
    buffer: &'a ActivityBuffer,
    current: *mut sys::CUpti_Activity,
    done: bool,
}

impl<'a> CuptiRecords<'a> {
    pub(crate) fn new(buffer: &'a ActivityBuffer) -> Self {
        Self {
            buffer,
            current: std::ptr::null_mut(),
            done: false,
        }
    }

    fn offset(&self) -> usize {
        (self.current as usize).saturating_sub(self.buffer.as_ptr() as usize)
    }
}

fn ends_walk(status: sys::CUptiResult) -> bool {
    matches!(
        status,
        sys::CUptiResult::CUPTI_ERROR_MAX_LIMIT_REACHED
            | sys::CUptiResult::CUPTI_ERROR_INVALID_KIND
            | sys::CUptiResult::CUPTI_ERROR_NOT_INITIALIZED
    )
}

impl Iterator for CuptiRecords<'_> {
    type Item = Result<ActivityRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        // Safety: the buffer is valid for `valid_size` bytes and CUPTI only
        // reads from it.
        let status = unsafe {
            result::activity::get_next_record(
                self.buffer.as_ptr() as *mut u8,
                self.buffer.valid_size(),
                &mut self.current,
            )
        };

        if let Err(err) = status {
            self.done = true;
            if ends_walk(err.0) {
                return None;
            }
            return Some(Err(TraceError::Decode {
                offset: self.offset(),
                reason: format!("{err:?}"),
            }));
        }
        if self.current.is_null() {
            self.done = true;
            return None;
        }

        // Safety: CUPTI returned a pointer to a record inside the buffer.
        let kind = unsafe { (*self.current).kind };
        let record = match kinds::from_cupti(kind) {
            Some(known) if known.is_kernel() => {
                // Safety: kernel and concurrent kernel records share this layout.
                let raw = unsafe { &*(self.current as *const sys::CUpti_ActivityKernel9) };
                ActivityRecord::Kernel(KernelRecord {
                    start_ns: raw.start,
                    end_ns: raw.end,
                    device_id: raw.deviceId,
                    stream_id: raw.streamId,
                    correlation_id: raw.correlationId,
                })
            }
            Some(known) => ActivityRecord::Other(known),
            None => ActivityRecord::Unknown(kind as u32),
        };
        Some(Ok(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walk_end_statuses() {
        assert!(ends_walk(sys::CUptiResult::CUPTI_ERROR_MAX_LIMIT_REACHED));
        assert!(ends_walk(sys::CUptiResult::CUPTI_ERROR_INVALID_KIND));
        assert!(ends_walk(sys::CUptiResult::CUPTI_ERROR_NOT_INITIALIZED));
        assert!(!ends_walk(sys::CUptiResult::CUPTI_ERROR_INVALID_PARAMETER));
        assert!(!ends_walk(sys::CUptiResult::CUPTI_ERROR_UNKNOWN));
    }
}
