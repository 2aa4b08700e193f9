//! Bridge between an [`ActivitySource`] and the tracer's shared tables.
//!
//! The adapter is what the source calls back into. Buffer completions arrive on
//! a source-managed thread; launch entries arrive on the launching thread.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::activity::{
    ActivityBuffer, ActivityHandler, ActivityRecord, ActivitySource, BufferOrigin, CorrelationId,
    KernelRecord, LaunchInfo,
};
use crate::annotation;
use crate::config::TracerConfig;
use crate::error::Result;
use crate::table::{AnnotationInsert, TraceTables};

/// Name recorded for a launch with neither an annotation nor a symbol.
pub const UNKNOWN_KERNEL: &str = "<unknown>";

/// Session state guarded by the tracer-wide lock.
#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) enabled: bool,
    pub(crate) start_ns: u64,
    pub(crate) end_ns: u64,
    pub(crate) launch_subscribed: bool,
    pub(crate) tables: TraceTables,
    pub(crate) dropped_records: u64,
    pub(crate) malformed_records: u64,
    pub(crate) decode_errors: u64,
    pub(crate) buffers_completed: u64,
}

impl SessionState {
    /// Forget everything collected by the previous session.
    pub(crate) fn reset(&mut self) {
        self.start_ns = 0;
        self.end_ns = 0;
        self.launch_subscribed = false;
        self.tables.clear();
        self.dropped_records = 0;
        self.malformed_records = 0;
        self.decode_errors = 0;
        self.buffers_completed = 0;
    }

    pub(crate) fn append_kernel_records(&mut self, records: impl IntoIterator<Item = KernelRecord>) {
        let mut malformed = 0;
        self.tables.extend_kernel_records(records.into_iter().map(|mut record| {
            if !record.is_well_formed() {
                malformed += 1;
                record.end_ns = record.start_ns;
            }
            record
        }));
        if malformed > 0 {
            warn!(
                malformed,
                "kernel records with end before start were clamped to zero duration"
            );
            self.malformed_records += malformed;
        }
    }
}

/// State shared by the tracer and its adapter.
#[derive(Debug)]
pub(crate) struct TracerShared {
    pub(crate) state: Mutex<SessionState>,
    pub(crate) config: TracerConfig,
}

impl TracerShared {
    pub(crate) fn new(config: TracerConfig) -> Self {
        Self {
            state: Mutex::new(SessionState::default()),
            config,
        }
    }

    pub(crate) fn record_annotation(&self, id: CorrelationId, name: &str) {
        let outcome = self
            .state
            .lock()
            .tables
            .add_annotation(id, name, self.config.duplicate_policy);
        if outcome != AnnotationInsert::Inserted {
            debug!(correlation_id = id, name, ?outcome, "duplicate launch annotation");
        }
    }
}

/// Receives buffers and launch notifications from the source.
pub(crate) struct ActivityAdapter<S: ActivitySource> {
    source: Arc<S>,
    shared: Arc<TracerShared>,
}

impl<S: ActivitySource> ActivityAdapter<S> {
    pub(crate) fn new(source: Arc<S>, shared: Arc<TracerShared>) -> Self {
        Self { source, shared }
    }

    /// Decode kernel records without holding the tracer lock.
    fn drain(&self, buffer: &ActivityBuffer) -> (Vec<KernelRecord>, u64) {
        let mut kernels = Vec::new();
        let mut decode_errors = 0;

        for item in self.source.records(buffer) {
            match item {
                Ok(ActivityRecord::Kernel(record)) => kernels.push(record),
                Ok(ActivityRecord::Other(kind)) => {
                    trace!(kind = kind.label(), "ignoring activity record");
                }
                Ok(ActivityRecord::Unknown(raw)) => {
                    trace!(raw_kind = raw, "ignoring unknown activity record");
                }
                Err(err) => {
                    warn!(error = %err, "stopped draining activity buffer");
                    decode_errors += 1;
                    break;
                }
            }
        }

        (kernels, decode_errors)
    }
}

impl<S: ActivitySource> ActivityHandler for ActivityAdapter<S> {
    fn on_buffer_requested(&self) -> Result<ActivityBuffer> {
        trace!(size = self.shared.config.buffer_size, "activity buffer requested");
        ActivityBuffer::new(self.shared.config.buffer_size)
    }

    fn on_buffer_completed(&self, origin: BufferOrigin, buffer: ActivityBuffer) {
        trace!(
            stream_id = origin.stream_id,
            capacity = buffer.capacity(),
            valid = buffer.valid_size(),
            "activity buffer completed"
        );
        let drained = buffer.valid_size() != 0;
        let (kernels, decode_errors) = if drained {
            self.drain(&buffer)
        } else {
            (Vec::new(), 0)
        };
        drop(buffer);

        // An empty buffer may still be the only report of records the source
        // could not fit.
        let dropped = match self.source.dropped_records(origin) {
            Ok(dropped) => dropped as u64,
            Err(err) => {
                warn!(error = %err, "failed to query dropped activity records");
                0
            }
        };
        if dropped != 0 {
            warn!("Dropped {} activity records", dropped);
        }
        if !drained && dropped == 0 {
            return;
        }

        let mut state = self.shared.state.lock();
        state.append_kernel_records(kernels);
        state.dropped_records += dropped;
        state.decode_errors += decode_errors;
        if drained {
            state.buffers_completed += 1;
        }
    }

    fn on_launch_entered(&self, launch: LaunchInfo<'_>) {
        annotation::with_current_annotation(|current| {
            let name = current.or(launch.symbol_name).unwrap_or(UNKNOWN_KERNEL);
            self.shared.record_annotation(launch.correlation_id, name);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityKind;
    use crate::synthetic::SyntheticSource;

    fn adapter() -> (Arc<SyntheticSource>, Arc<TracerShared>, ActivityAdapter<SyntheticSource>) {
        let source = Arc::new(SyntheticSource::new());
        let shared = Arc::new(TracerShared::new(TracerConfig::default()));
        let adapter = ActivityAdapter::new(Arc::clone(&source), Arc::clone(&shared));
        (source, shared, adapter)
    }

    fn kernel(correlation_id: CorrelationId) -> KernelRecord {
        KernelRecord {
            start_ns: 100,
            end_ns: 200,
            device_id: 0,
            stream_id: 3,
            correlation_id,
        }
    }

    #[test]
    fn test_requested_buffer_uses_configured_size() {
        let (_, _, adapter) = adapter();
        let buffer = adapter.on_buffer_requested().unwrap();
        assert_eq!(buffer.capacity(), 32 * 1024);
    }

    #[test]
    fn test_completed_buffer_keeps_only_kernels() {
        let (_, shared, adapter) = adapter();
        let mut buffer = adapter.on_buffer_requested().unwrap();
        let mut writer = crate::synthetic::RecordWriter::new(&mut buffer);
        assert!(writer.push_kernel(ActivityKind::Kernel, &kernel(1)));
        assert!(writer.push_other(ActivityKind::Memcpy));
        assert!(writer.push_kernel(ActivityKind::ConcurrentKernel, &kernel(2)));
        assert!(writer.push_other(ActivityKind::Overhead));
        writer.finish();

        adapter.on_buffer_completed(BufferOrigin::default(), buffer);

        let state = shared.state.lock();
        let ids: Vec<_> = state
            .tables
            .kernel_records()
            .iter()
            .map(|r| r.correlation_id)
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(state.buffers_completed, 1);
    }

    #[test]
    fn test_empty_buffer_is_released_without_draining() {
        let (_, shared, adapter) = adapter();
        let buffer = adapter.on_buffer_requested().unwrap();
        adapter.on_buffer_completed(BufferOrigin::default(), buffer);
        assert_eq!(shared.state.lock().buffers_completed, 0);
    }

    #[test]
    fn test_empty_buffer_still_reports_dropped_records() {
        let (source, shared, adapter) = adapter();
        source.set_dropped_records(2);

        let buffer = adapter.on_buffer_requested().unwrap();
        adapter.on_buffer_completed(BufferOrigin::default(), buffer);

        let state = shared.state.lock();
        assert_eq!(state.dropped_records, 2);
        assert_eq!(state.buffers_completed, 0);
        assert!(state.tables.kernel_records().is_empty());
    }

    #[test]
    fn test_dropped_records_are_counted() {
        let (source, shared, adapter) = adapter();
        source.set_dropped_records(4);

        let mut buffer = adapter.on_buffer_requested().unwrap();
        let mut writer = crate::synthetic::RecordWriter::new(&mut buffer);
        writer.push_kernel(ActivityKind::Kernel, &kernel(1));
        writer.finish();
        adapter.on_buffer_completed(BufferOrigin::default(), buffer);

        assert_eq!(shared.state.lock().dropped_records, 4);
    }

    #[test]
    fn test_malformed_record_is_clamped() {
        let (_, shared, adapter) = adapter();
        let mut buffer = adapter.on_buffer_requested().unwrap();
        let mut writer = crate::synthetic::RecordWriter::new(&mut buffer);
        writer.push_kernel(
            ActivityKind::Kernel,
            &KernelRecord {
                start_ns: 500,
                end_ns: 400,
                ..kernel(9)
            },
        );
        writer.finish();
        adapter.on_buffer_completed(BufferOrigin::default(), buffer);

        let state = shared.state.lock();
        let record = state.tables.kernel_records()[0];
        assert_eq!(record.start_ns, 500);
        assert_eq!(record.end_ns, 500);
        assert_eq!(state.malformed_records, 1);
    }

    #[test]
    fn test_launch_prefers_annotation_over_symbol() {
        let (_, shared, adapter) = adapter();

        annotation::set_current_annotation("fc_layer");
        adapter.on_launch_entered(LaunchInfo {
            correlation_id: 1,
            symbol_name: Some("sgemm_128x64"),
        });
        annotation::clear_current_annotation();

        adapter.on_launch_entered(LaunchInfo {
            correlation_id: 2,
            symbol_name: Some("sgemm_128x64"),
        });
        adapter.on_launch_entered(LaunchInfo {
            correlation_id: 3,
            symbol_name: None,
        });

        let state = shared.state.lock();
        assert_eq!(state.tables.annotation(1), Some("fc_layer"));
        assert_eq!(state.tables.annotation(2), Some("sgemm_128x64"));
        assert_eq!(state.tables.annotation(3), Some(UNKNOWN_KERNEL));
    }
}
