//! Contract between the tracer and an external activity source.
//!
//! An activity source (CUPTI, or the in-process synthetic source used in tests)
//! drives two asynchronous protocols:
//!
//! - **Buffer exchange**: the source asks for scratch space through
//!   [`ActivityHandler::on_buffer_requested`], fills it with packed
//!   variable-length records, and hands it back through
//!   [`ActivityHandler::on_buffer_completed`] from a thread it controls.
//! - **Launch callbacks**: the source calls
//!   [`ActivityHandler::on_launch_entered`] synchronously on the launching
//!   thread before a kernel launch proceeds.
//!
//! Decoding the packed records is the source's job
//! ([`ActivitySource::records`]); the tracer only sees typed [`ActivityRecord`]s.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceError};

/// Opaque id assigned by the source to a single launch.
pub type CorrelationId = u32;

/// Activity record kinds, numbered as the CUPTI activity API numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ActivityKind {
    /// Memory copy.
    Memcpy = 1,
    /// Memory set.
    Memset = 2,
    /// Kernel execution (serialized).
    Kernel = 3,
    /// Driver API call.
    Driver = 4,
    /// Runtime API call.
    Runtime = 5,
    /// Device attributes.
    Device = 8,
    /// Context creation/destruction.
    Context = 9,
    /// Kernel execution (concurrent).
    ConcurrentKernel = 10,
    /// Name of a device object.
    Name = 11,
    /// User marker.
    Marker = 12,
    /// Profiler overhead.
    Overhead = 17,
}

impl ActivityKind {
    /// Every kind the tracer knows about.
    pub const ALL: [ActivityKind; 11] = [
        ActivityKind::Memcpy,
        ActivityKind::Memset,
        ActivityKind::Kernel,
        ActivityKind::Driver,
        ActivityKind::Runtime,
        ActivityKind::Device,
        ActivityKind::Context,
        ActivityKind::ConcurrentKernel,
        ActivityKind::Name,
        ActivityKind::Marker,
        ActivityKind::Overhead,
    ];

    /// Raw numeric kind.
    pub fn as_raw(self) -> u32 {
        self as u32
    }

    /// Map a raw numeric kind back to a known kind.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_raw() == raw)
    }

    /// Whether records of this kind describe a kernel execution.
    pub fn is_kernel(self) -> bool {
        matches!(self, ActivityKind::Kernel | ActivityKind::ConcurrentKernel)
    }

    /// Short label.
    pub fn label(&self) -> &'static str {
        match self {
            ActivityKind::Memcpy => "memcpy",
            ActivityKind::Memset => "memset",
            ActivityKind::Kernel => "kernel",
            ActivityKind::Driver => "driver",
            ActivityKind::Runtime => "runtime",
            ActivityKind::Device => "device",
            ActivityKind::Context => "context",
            ActivityKind::ConcurrentKernel => "concurrent_kernel",
            ActivityKind::Name => "name",
            ActivityKind::Marker => "marker",
            ActivityKind::Overhead => "overhead",
        }
    }
}

/// Timing and placement of one completed kernel execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KernelRecord {
    /// Start timestamp in nanoseconds.
    pub start_ns: u64,
    /// End timestamp in nanoseconds.
    pub end_ns: u64,
    /// Device the kernel ran on.
    pub device_id: u32,
    /// Stream the kernel ran on.
    pub stream_id: u32,
    /// Correlation id of the launch.
    pub correlation_id: CorrelationId,
}

impl KernelRecord {
    /// Kernel duration in nanoseconds.
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    /// Whether the timestamps are ordered.
    pub fn is_well_formed(&self) -> bool {
        self.end_ns >= self.start_ns
    }
}

/// A decoded activity record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActivityRecord {
    /// A kernel execution (serialized or concurrent).
    Kernel(KernelRecord),
    /// Any other record kind. Ignored by the tracer.
    Other(ActivityKind),
    /// A record kind the decoder does not know.
    Unknown(u32),
}

/// Where a completed buffer came from, used to query dropped records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferOrigin {
    /// Opaque device context handle (null for the global queue).
    pub context: usize,
    /// Stream the buffer was filled for.
    pub stream_id: u32,
}

/// Data passed to the launch-entry callback.
#[derive(Debug, Clone, Copy)]
pub struct LaunchInfo<'a> {
    /// Correlation id assigned to this launch.
    pub correlation_id: CorrelationId,
    /// Kernel symbol reported by the source, if any.
    pub symbol_name: Option<&'a str>,
}

/// Result of subscribing to launch callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    /// Launch callbacks are active.
    Subscribed,
    /// Another subscriber holds the slot; only raw timing will be collected.
    LimitReached,
}

/// An owned, aligned scratch buffer exchanged with the source.
///
/// The allocation is zeroed and freed when the buffer drops.
pub struct ActivityBuffer {
    ptr: NonNull<u8>,
    capacity: usize,
    valid_size: usize,
}

impl ActivityBuffer {
    /// Alignment of every activity buffer.
    pub const ALIGN: usize = 8;

    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Result<Self> {
        let layout = Self::layout(capacity)?;
        // Safety: layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(TraceError::Allocation { size: capacity })?;
        Ok(Self {
            ptr,
            capacity,
            valid_size: 0,
        })
    }

    fn layout(capacity: usize) -> Result<Layout> {
        if capacity == 0 {
            return Err(TraceError::Allocation { size: 0 });
        }
        Layout::from_size_align(capacity, Self::ALIGN)
            .map_err(|_| TraceError::Allocation { size: capacity })
    }

    /// Total size of the allocation in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes holding records.
    pub fn valid_size(&self) -> usize {
        self.valid_size
    }

    /// Set the number of valid bytes, clamped to the capacity.
    pub fn set_valid_size(&mut self, valid_size: usize) {
        self.valid_size = valid_size.min(self.capacity);
    }

    /// The valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid for `capacity` bytes and valid_size <= capacity.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.valid_size) }
    }

    /// The whole allocation, for sources that fill the buffer in process.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: ptr is valid for `capacity` bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Raw pointer to the start of the allocation.
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Release ownership of the allocation to foreign code.
    ///
    /// Returns the pointer and capacity. Reclaim with [`ActivityBuffer::from_raw`].
    pub fn into_raw(self) -> (*mut u8, usize) {
        let parts = (self.ptr.as_ptr(), self.capacity);
        std::mem::forget(self);
        parts
    }

    /// Reclaim a buffer previously released with [`ActivityBuffer::into_raw`].
    ///
    /// Returns `None` for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` and `capacity` must come from a single `into_raw` call and the
    /// buffer must not have been reclaimed already.
    pub unsafe fn from_raw(ptr: *mut u8, capacity: usize, valid_size: usize) -> Option<Self> {
        let ptr = NonNull::new(ptr)?;
        Some(Self {
            ptr,
            capacity,
            valid_size: valid_size.min(capacity),
        })
    }
}

impl Drop for ActivityBuffer {
    fn drop(&mut self) {
        if let Ok(layout) = Self::layout(self.capacity) {
            // Safety: allocated in `new` with this exact layout.
            unsafe { dealloc(self.ptr.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for ActivityBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityBuffer")
            .field("capacity", &self.capacity)
            .field("valid_size", &self.valid_size)
            .finish()
    }
}

// The buffer exclusively owns its allocation.
unsafe impl Send for ActivityBuffer {}
unsafe impl Sync for ActivityBuffer {}

/// Iterator over decoded records of one buffer.
pub type RecordIter<'a> = Box<dyn Iterator<Item = Result<ActivityRecord>> + 'a>;

/// Callbacks the source invokes on the tracer.
pub trait ActivityHandler: Send + Sync {
    /// The source needs an empty buffer to fill.
    fn on_buffer_requested(&self) -> Result<ActivityBuffer>;

    /// The source returns a filled buffer. The handler owns and releases it.
    fn on_buffer_completed(&self, origin: BufferOrigin, buffer: ActivityBuffer);

    /// A kernel launch is about to happen on the calling thread.
    fn on_launch_entered(&self, launch: LaunchInfo<'_>);
}

/// An external producer of activity records.
pub trait ActivitySource: Send + Sync + 'static {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Start collecting records of `kind`.
    fn enable_kind(&self, kind: ActivityKind) -> Result<()>;

    /// Stop collecting records of `kind`.
    fn disable_kind(&self, kind: ActivityKind) -> Result<()>;

    /// Install the buffer exchange callbacks.
    fn register_buffer_callbacks(&self, handler: Arc<dyn ActivityHandler>) -> Result<()>;

    /// Subscribe to launch-entry notifications.
    fn subscribe_launches(&self, handler: Arc<dyn ActivityHandler>) -> Result<SubscribeOutcome>;

    /// Drop the launch subscription, if any.
    fn unsubscribe_launches(&self) -> Result<()>;

    /// Current source clock in nanoseconds.
    fn timestamp_ns(&self) -> Result<u64>;

    /// Hand back every pending buffer through `on_buffer_completed`.
    ///
    /// With `forced`, partially filled buffers are flushed too. The flush may
    /// run the completion callback synchronously on the calling thread.
    fn flush_all(&self, forced: bool) -> Result<()>;

    /// Tear down the source session.
    fn finalize(&self) -> Result<()>;

    /// Decode the records packed in a completed buffer.
    fn records<'a>(&'a self, buffer: &'a ActivityBuffer) -> RecordIter<'a>;

    /// Number of records the source dropped for `origin` due to buffer pressure.
    fn dropped_records(&self, origin: BufferOrigin) -> Result<usize>;
}
