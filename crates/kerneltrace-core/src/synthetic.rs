//! In-process activity source.
//!
//! `SyntheticSource` implements the same buffer and launch protocols as a real
//! profiling library, entirely in Rust. Launches are reported synchronously on
//! the caller's thread, completed records are queued and packed into buffers
//! requested from the tracer when [`SyntheticSource::deliver`] or a flush runs.
//! Failures, subscriber exhaustion and dropped records can be injected.
//!
//! Records are packed as an 8-byte header (`kind`, payload `size`) followed by
//! the payload, all little-endian `#[repr(C)]` values.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use kerneltrace_core::prelude::*;
//! use kerneltrace_core::synthetic::SyntheticSource;
//!
//! let source = Arc::new(SyntheticSource::new());
//! let tracer = ActivityTracer::with_shared_source(Arc::clone(&source), TracerConfig::default())?;
//! tracer.enable()?;
//!
//! set_current_annotation("matmul_0");
//! source.launch(7, Some("sgemm"));
//! clear_current_annotation();
//!
//! source.complete_kernel(KernelRecord {
//!     start_ns: 1000,
//!     end_ns: 1500,
//!     device_id: 0,
//!     stream_id: 1,
//!     correlation_id: 7,
//! });
//! tracer.disable()?;
//!
//! let profile = tracer.gen_profile();
//! assert_eq!(profile.events.len(), 1);
//! assert_eq!(profile.events[0].name, "matmul_0");
//! # Ok::<(), kerneltrace_core::TraceError>(())
//! ```

use std::collections::VecDeque;
use std::mem::size_of;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;

use crate::activity::{
    ActivityBuffer, ActivityHandler, ActivityKind, ActivityRecord, ActivitySource, BufferOrigin,
    CorrelationId, KernelRecord, LaunchInfo, RecordIter, SubscribeOutcome,
};
use crate::error::{Result, TraceError};

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct RecordHeader {
    kind: u32,
    size: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct KernelPayload {
    start: u64,
    end: u64,
    device_id: u32,
    stream_id: u32,
    correlation_id: u32,
    _pad: u32,
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct OtherPayload {
    _reserved: u64,
}

const HEADER_SIZE: usize = size_of::<RecordHeader>();

/// Packs records into an [`ActivityBuffer`].
pub struct RecordWriter<'a> {
    buffer: &'a mut ActivityBuffer,
    offset: usize,
    records: usize,
}

impl<'a> RecordWriter<'a> {
    /// Start writing at the beginning of `buffer`.
    pub fn new(buffer: &'a mut ActivityBuffer) -> Self {
        Self {
            buffer,
            offset: 0,
            records: 0,
        }
    }

    fn push<P: Pod>(&mut self, kind: u32, payload: &P) -> bool {
        let payload = bytemuck::bytes_of(payload);
        let header = RecordHeader {
            kind,
            size: payload.len() as u32,
        };
        self.push_bytes(bytemuck::bytes_of(&header), payload)
    }

    fn push_bytes(&mut self, header: &[u8], payload: &[u8]) -> bool {
        let end = self.offset + header.len() + payload.len();
        if end > self.buffer.capacity() {
            return false;
        }
        let bytes = self.buffer.as_mut_slice();
        bytes[self.offset..self.offset + header.len()].copy_from_slice(header);
        bytes[self.offset + header.len()..end].copy_from_slice(payload);
        self.offset = end;
        self.records += 1;
        true
    }

    /// Append a kernel record of `kind`. Returns `false` when the buffer is full.
    pub fn push_kernel(&mut self, kind: ActivityKind, record: &KernelRecord) -> bool {
        let payload = KernelPayload {
            start: record.start_ns,
            end: record.end_ns,
            device_id: record.device_id,
            stream_id: record.stream_id,
            correlation_id: record.correlation_id,
            _pad: 0,
        };
        self.push(kind.as_raw(), &payload)
    }

    /// Append a record of a non-kernel kind.
    pub fn push_other(&mut self, kind: ActivityKind) -> bool {
        self.push(kind.as_raw(), &OtherPayload { _reserved: 0 })
    }

    /// Append a record with a raw kind number.
    pub fn push_raw(&mut self, raw_kind: u32) -> bool {
        self.push(raw_kind, &OtherPayload { _reserved: 0 })
    }

    /// Append a header whose payload runs past the end of the valid data.
    pub fn push_truncated(&mut self, kind: ActivityKind) -> bool {
        let header = RecordHeader {
            kind: kind.as_raw(),
            size: u32::MAX,
        };
        self.push_bytes(bytemuck::bytes_of(&header), &[])
    }

    /// Number of records written so far.
    pub fn records(&self) -> usize {
        self.records
    }

    /// Mark everything written as valid.
    pub fn finish(self) {
        self.buffer.set_valid_size(self.offset);
    }
}

/// Iterator decoding the packed synthetic format.
struct SyntheticRecords<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl SyntheticRecords<'_> {
    fn fail(&mut self, reason: &str) -> Option<Result<ActivityRecord>> {
        let offset = self.offset;
        self.offset = self.bytes.len();
        Some(Err(TraceError::Decode {
            offset,
            reason: reason.to_string(),
        }))
    }
}

impl Iterator for SyntheticRecords<'_> {
    type Item = Result<ActivityRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.bytes.len().checked_sub(self.offset)?;
        if remaining == 0 {
            return None;
        }
        if remaining < HEADER_SIZE {
            return self.fail("truncated record header");
        }

        let header: RecordHeader =
            bytemuck::pod_read_unaligned(&self.bytes[self.offset..self.offset + HEADER_SIZE]);
        let start = self.offset + HEADER_SIZE;
        let end = match start.checked_add(header.size as usize) {
            Some(end) if end <= self.bytes.len() => end,
            _ => return self.fail("record payload runs past valid data"),
        };
        let payload = &self.bytes[start..end];

        let record = match ActivityKind::from_raw(header.kind) {
            Some(kind) if kind.is_kernel() => {
                if payload.len() < size_of::<KernelPayload>() {
                    return self.fail("kernel record payload too short");
                }
                let raw: KernelPayload =
                    bytemuck::pod_read_unaligned(&payload[..size_of::<KernelPayload>()]);
                ActivityRecord::Kernel(KernelRecord {
                    start_ns: raw.start,
                    end_ns: raw.end,
                    device_id: raw.device_id,
                    stream_id: raw.stream_id,
                    correlation_id: raw.correlation_id,
                })
            }
            Some(kind) => ActivityRecord::Other(kind),
            None => ActivityRecord::Unknown(header.kind),
        };

        self.offset = end;
        Some(Ok(record))
    }
}

/// Source calls, as recorded in [`SyntheticSource::calls`] and targeted by
/// [`SyntheticSource::fail_on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceCall {
    /// `enable_kind`.
    EnableKind,
    /// `disable_kind`.
    DisableKind,
    /// `register_buffer_callbacks`.
    RegisterCallbacks,
    /// `subscribe_launches`.
    Subscribe,
    /// `unsubscribe_launches`.
    Unsubscribe,
    /// `timestamp_ns`.
    Timestamp,
    /// `flush_all`.
    Flush,
    /// `finalize`.
    Finalize,
    /// `dropped_records`.
    DroppedRecords,
}

impl SourceCall {
    fn name(self) -> &'static str {
        match self {
            SourceCall::EnableKind => "enable_kind",
            SourceCall::DisableKind => "disable_kind",
            SourceCall::RegisterCallbacks => "register_buffer_callbacks",
            SourceCall::Subscribe => "subscribe_launches",
            SourceCall::Unsubscribe => "unsubscribe_launches",
            SourceCall::Timestamp => "timestamp_ns",
            SourceCall::Flush => "flush_all",
            SourceCall::Finalize => "finalize",
            SourceCall::DroppedRecords => "dropped_records",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum PendingRecord {
    Kernel(ActivityKind, KernelRecord),
    Other(ActivityKind),
}

#[derive(Default)]
struct SyntheticState {
    enabled_kinds: Vec<ActivityKind>,
    buffer_handler: Option<Arc<dyn ActivityHandler>>,
    launch_handler: Option<Arc<dyn ActivityHandler>>,
    pending: VecDeque<PendingRecord>,
    clock_ns: u64,
    dropped_records: usize,
    subscriber_limit: bool,
    failing: Option<SourceCall>,
    calls: Vec<SourceCall>,
}

/// An activity source driven from test or demo code.
#[derive(Default)]
pub struct SyntheticSource {
    state: Mutex<SyntheticState>,
}

impl SyntheticSource {
    /// Create a source with its clock at zero.
    pub fn new() -> Self {
        Self::default()
    }

    fn call(&self, call: SourceCall) -> Result<()> {
        let mut state = self.state.lock();
        state.calls.push(call);
        if state.failing == Some(call) {
            return Err(TraceError::source_call(call.name(), "injected failure"));
        }
        Ok(())
    }

    /// Make every subsequent `call` fail.
    pub fn fail_on(&self, call: SourceCall) {
        self.state.lock().failing = Some(call);
    }

    /// Stop injecting failures.
    pub fn clear_failure(&self) {
        self.state.lock().failing = None;
    }

    /// Make subscription report that no subscriber slot is left.
    pub fn limit_subscribers(&self, limited: bool) {
        self.state.lock().subscriber_limit = limited;
    }

    /// Report `count` dropped records with the next completed buffer.
    pub fn set_dropped_records(&self, count: usize) {
        self.state.lock().dropped_records = count;
    }

    /// Set the source clock.
    pub fn set_clock(&self, ns: u64) {
        self.state.lock().clock_ns = ns;
    }

    /// Calls made so far, in order.
    pub fn calls(&self) -> Vec<SourceCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls of one type.
    pub fn call_count(&self, call: SourceCall) -> usize {
        self.state.lock().calls.iter().filter(|c| **c == call).count()
    }

    /// Kinds currently enabled.
    pub fn enabled_kinds(&self) -> Vec<ActivityKind> {
        self.state.lock().enabled_kinds.clone()
    }

    /// Whether launch callbacks are subscribed.
    pub fn is_subscribed(&self) -> bool {
        self.state.lock().launch_handler.is_some()
    }

    /// Number of records waiting for delivery.
    pub fn pending_records(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Simulate a kernel launch on the calling thread.
    ///
    /// Returns `false` when nobody is subscribed.
    pub fn launch(&self, correlation_id: CorrelationId, symbol_name: Option<&str>) -> bool {
        let handler = self.state.lock().launch_handler.clone();
        match handler {
            Some(handler) => {
                handler.on_launch_entered(LaunchInfo {
                    correlation_id,
                    symbol_name,
                });
                true
            }
            None => false,
        }
    }

    /// Queue a completed kernel record.
    ///
    /// Returns `false` when no kernel kind is enabled.
    pub fn complete_kernel(&self, record: KernelRecord) -> bool {
        let mut state = self.state.lock();
        let kind = if state.enabled_kinds.contains(&ActivityKind::ConcurrentKernel) {
            ActivityKind::ConcurrentKernel
        } else if state.enabled_kinds.contains(&ActivityKind::Kernel) {
            ActivityKind::Kernel
        } else {
            return false;
        };
        state.pending.push_back(PendingRecord::Kernel(kind, record));
        true
    }

    /// Queue a completed record of a non-kernel kind.
    pub fn complete_other(&self, kind: ActivityKind) -> bool {
        let mut state = self.state.lock();
        if !state.enabled_kinds.contains(&kind) {
            return false;
        }
        state.pending.push_back(PendingRecord::Other(kind));
        true
    }

    /// Pack all queued records into buffers and hand them to the tracer.
    ///
    /// Returns the number of buffers delivered.
    pub fn deliver(&self) -> Result<usize> {
        let (handler, mut pending) = {
            let mut state = self.state.lock();
            (state.buffer_handler.clone(), std::mem::take(&mut state.pending))
        };
        let Some(handler) = handler else {
            return Ok(0);
        };

        let mut delivered = 0;
        while !pending.is_empty() {
            let mut buffer = handler.on_buffer_requested()?;
            let mut writer = RecordWriter::new(&mut buffer);
            while let Some(record) = pending.front() {
                let written = match record {
                    PendingRecord::Kernel(kind, record) => writer.push_kernel(*kind, record),
                    PendingRecord::Other(kind) => writer.push_other(*kind),
                };
                if !written {
                    break;
                }
                pending.pop_front();
            }
            if writer.records() == 0 {
                // a record larger than a whole buffer can never be delivered
                pending.pop_front();
                self.state.lock().dropped_records += 1;
            }
            writer.finish();
            handler.on_buffer_completed(BufferOrigin::default(), buffer);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Request one buffer, let `fill` write into it, and complete it.
    ///
    /// Returns `false` when no buffer callbacks are registered.
    pub fn deliver_with(&self, fill: impl FnOnce(&mut RecordWriter<'_>)) -> Result<bool> {
        let handler = self.state.lock().buffer_handler.clone();
        let Some(handler) = handler else {
            return Ok(false);
        };
        let mut buffer = handler.on_buffer_requested()?;
        let mut writer = RecordWriter::new(&mut buffer);
        fill(&mut writer);
        writer.finish();
        handler.on_buffer_completed(BufferOrigin::default(), buffer);
        Ok(true)
    }
}

impl ActivitySource for SyntheticSource {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn enable_kind(&self, kind: ActivityKind) -> Result<()> {
        self.call(SourceCall::EnableKind)?;
        let mut state = self.state.lock();
        if !state.enabled_kinds.contains(&kind) {
            state.enabled_kinds.push(kind);
        }
        Ok(())
    }

    fn disable_kind(&self, kind: ActivityKind) -> Result<()> {
        self.call(SourceCall::DisableKind)?;
        self.state.lock().enabled_kinds.retain(|k| *k != kind);
        Ok(())
    }

    fn register_buffer_callbacks(&self, handler: Arc<dyn ActivityHandler>) -> Result<()> {
        self.call(SourceCall::RegisterCallbacks)?;
        self.state.lock().buffer_handler = Some(handler);
        Ok(())
    }

    fn subscribe_launches(&self, handler: Arc<dyn ActivityHandler>) -> Result<SubscribeOutcome> {
        self.call(SourceCall::Subscribe)?;
        let mut state = self.state.lock();
        if state.subscriber_limit {
            return Ok(SubscribeOutcome::LimitReached);
        }
        state.launch_handler = Some(handler);
        Ok(SubscribeOutcome::Subscribed)
    }

    fn unsubscribe_launches(&self) -> Result<()> {
        self.call(SourceCall::Unsubscribe)?;
        self.state.lock().launch_handler = None;
        Ok(())
    }

    fn timestamp_ns(&self) -> Result<u64> {
        self.call(SourceCall::Timestamp)?;
        Ok(self.state.lock().clock_ns)
    }

    fn flush_all(&self, _forced: bool) -> Result<()> {
        self.call(SourceCall::Flush)?;
        self.deliver().map(|_| ())
    }

    fn finalize(&self) -> Result<()> {
        self.call(SourceCall::Finalize)?;
        let mut state = self.state.lock();
        state.buffer_handler = None;
        state.launch_handler = None;
        state.pending.clear();
        Ok(())
    }

    fn records<'a>(&'a self, buffer: &'a ActivityBuffer) -> RecordIter<'a> {
        Box::new(SyntheticRecords {
            bytes: buffer.as_slice(),
            offset: 0,
        })
    }

    fn dropped_records(&self, _origin: BufferOrigin) -> Result<usize> {
        self.call(SourceCall::DroppedRecords)?;
        Ok(std::mem::take(&mut self.state.lock().dropped_records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(buffer: &ActivityBuffer) -> Vec<Result<ActivityRecord>> {
        SyntheticSource::new().records(buffer).collect()
    }

    fn kernel(correlation_id: CorrelationId) -> KernelRecord {
        KernelRecord {
            start_ns: 1000,
            end_ns: 1500,
            device_id: 0,
            stream_id: 1,
            correlation_id,
        }
    }

    #[test]
    fn test_header_and_payload_sizes() {
        assert_eq!(HEADER_SIZE, 8);
        assert_eq!(size_of::<KernelPayload>(), 32);
        assert_eq!(size_of::<OtherPayload>(), 8);
    }

    #[test]
    fn test_decode_mixed_buffer() {
        let mut buffer = ActivityBuffer::new(256).unwrap();
        let mut writer = RecordWriter::new(&mut buffer);
        writer.push_kernel(ActivityKind::ConcurrentKernel, &kernel(7));
        writer.push_other(ActivityKind::Memset);
        writer.push_raw(4242);
        writer.finish();

        let records: Vec<_> = decode(&buffer).into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(
            records,
            vec![
                ActivityRecord::Kernel(kernel(7)),
                ActivityRecord::Other(ActivityKind::Memset),
                ActivityRecord::Unknown(4242),
            ]
        );
    }

    #[test]
    fn test_writer_reports_full_buffer() {
        let mut buffer = ActivityBuffer::new(56).unwrap();
        let mut writer = RecordWriter::new(&mut buffer);
        assert!(writer.push_kernel(ActivityKind::Kernel, &kernel(1)));
        assert!(!writer.push_kernel(ActivityKind::Kernel, &kernel(2)));
        assert!(writer.push_other(ActivityKind::Overhead));
        assert_eq!(writer.records(), 2);
        writer.finish();
        assert_eq!(buffer.valid_size(), 40 + 16);
    }

    #[test]
    fn test_decode_truncated_record_errors_once() {
        let mut buffer = ActivityBuffer::new(128).unwrap();
        let mut writer = RecordWriter::new(&mut buffer);
        writer.push_kernel(ActivityKind::Kernel, &kernel(1));
        writer.push_truncated(ActivityKind::Kernel);
        writer.finish();

        let records = decode(&buffer);
        assert_eq!(records.len(), 2);
        assert!(records[0].is_ok());
        assert!(matches!(records[1], Err(TraceError::Decode { offset: 40, .. })));
    }

    #[test]
    fn test_queue_requires_enabled_kind() {
        let source = SyntheticSource::new();
        assert!(!source.complete_kernel(kernel(1)));
        assert!(!source.complete_other(ActivityKind::Memcpy));

        source.enable_kind(ActivityKind::Kernel).unwrap();
        assert!(source.complete_kernel(kernel(1)));
        assert!(!source.complete_other(ActivityKind::Memcpy));
        assert_eq!(source.pending_records(), 1);
    }

    #[test]
    fn test_injected_failure() {
        let source = SyntheticSource::new();
        source.fail_on(SourceCall::Timestamp);
        assert!(matches!(
            source.timestamp_ns(),
            Err(TraceError::Source {
                call: "timestamp_ns",
                ..
            })
        ));
        source.clear_failure();
        source.set_clock(55);
        assert_eq!(source.timestamp_ns().unwrap(), 55);
        assert_eq!(source.call_count(SourceCall::Timestamp), 2);
    }

    #[test]
    fn test_launch_without_subscriber() {
        let source = SyntheticSource::new();
        assert!(!source.launch(1, Some("k")));
        assert!(!source.is_subscribed());
    }

    #[test]
    fn test_dropped_records_reported_once() {
        let source = SyntheticSource::new();
        source.set_dropped_records(3);
        assert_eq!(source.dropped_records(BufferOrigin::default()).unwrap(), 3);
        assert_eq!(source.dropped_records(BufferOrigin::default()).unwrap(), 0);
    }
}
