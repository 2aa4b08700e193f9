//! Device tracer lifecycle.
//!
//! [`ActivityTracer`] drives an [`ActivitySource`] through one session at a
//! time: `enable` turns on the configured record kinds, registers buffer
//! callbacks and subscribes to launches; `disable` flushes outstanding
//! buffers and tears everything down again. The correlation table and the
//! kernel log are filled by the adapter while the session runs and joined by
//! [`DeviceTracer::gen_profile`].

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::activity::{
    ActivityHandler, ActivityKind, ActivitySource, CorrelationId, KernelRecord, SubscribeOutcome,
};
use crate::adapter::{ActivityAdapter, SessionState, TracerShared};
use crate::config::{FaultPolicy, TracerConfig};
use crate::error::{Result, TraceError};
use crate::report::Profile;

/// Kinds disabled when a session stops, in addition to the configured ones.
const TEARDOWN_KINDS: [ActivityKind; 5] = [
    ActivityKind::Context,
    ActivityKind::Driver,
    ActivityKind::Runtime,
    ActivityKind::Name,
    ActivityKind::Marker,
];

/// Counters describing the current or last session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TracerStats {
    /// Whether a session is running.
    pub enabled: bool,
    /// Whether launch callbacks were subscribed for the session.
    pub launch_subscribed: bool,
    /// Stored annotations.
    pub annotations: usize,
    /// Stored kernel records.
    pub kernel_records: usize,
    /// Annotations that hit an already stored correlation id.
    pub duplicate_annotations: u64,
    /// Records the source reported as dropped.
    pub dropped_records: u64,
    /// Kernel records that ended before they started.
    pub malformed_records: u64,
    /// Buffers abandoned because of a decode error.
    pub decode_errors: u64,
    /// Non-empty buffers processed.
    pub buffers_completed: u64,
}

impl TracerStats {
    fn from_state(state: &SessionState) -> Self {
        Self {
            enabled: state.enabled,
            launch_subscribed: state.launch_subscribed,
            annotations: state.tables.annotation_count(),
            kernel_records: state.tables.kernel_records().len(),
            duplicate_annotations: state.tables.duplicate_annotations(),
            dropped_records: state.dropped_records,
            malformed_records: state.malformed_records,
            decode_errors: state.decode_errors,
            buffers_completed: state.buffers_completed,
        }
    }
}

/// A tracer collecting kernel executions and their launch annotations.
pub trait DeviceTracer: Send + Sync {
    /// Start a session. Enabling an enabled tracer only logs a warning.
    fn enable(&self) -> Result<()>;

    /// Flush outstanding records and stop the session. Disabling a disabled
    /// tracer only logs a warning.
    fn disable(&self) -> Result<()>;

    /// Whether a session is running.
    fn is_enabled(&self) -> bool;

    /// Store the annotation for a launch.
    fn add_annotation(&self, id: CorrelationId, name: &str);

    /// Append a completed kernel record.
    fn add_kernel_record(&self, record: KernelRecord);

    /// Join collected records against the stored annotations.
    fn gen_profile(&self) -> Profile;

    /// Session counters.
    fn stats(&self) -> TracerStats;
}

/// Tracer backed by an activity source.
///
/// Dropping an enabled tracer tears the session down like `disable`, except
/// that failures are only logged.
pub struct ActivityTracer<S: ActivitySource> {
    source: Arc<S>,
    shared: Arc<TracerShared>,
    adapter: Arc<ActivityAdapter<S>>,
}

impl<S: ActivitySource> ActivityTracer<S> {
    /// Create a disabled tracer over `source`.
    pub fn new(source: S, config: TracerConfig) -> Result<Self> {
        Self::with_shared_source(Arc::new(source), config)
    }

    /// Create a disabled tracer over a source the caller keeps a handle to.
    pub fn with_shared_source(source: Arc<S>, config: TracerConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(TracerShared::new(config));
        let adapter = Arc::new(ActivityAdapter::new(
            Arc::clone(&source),
            Arc::clone(&shared),
        ));
        Ok(Self {
            source,
            shared,
            adapter,
        })
    }

    /// The underlying source.
    pub fn source(&self) -> &Arc<S> {
        &self.source
    }

    /// The tracer configuration.
    pub fn config(&self) -> &TracerConfig {
        &self.shared.config
    }

    fn fault(&self, err: TraceError) -> TraceError {
        error!(source = self.source.name(), error = %err, "device tracer setup failed");
        match self.shared.config.fault_policy {
            FaultPolicy::Abort => std::process::abort(),
            FaultPolicy::Propagate => err,
        }
    }

    fn handler(&self) -> Arc<dyn ActivityHandler> {
        Arc::clone(&self.adapter) as Arc<dyn ActivityHandler>
    }

    fn start_session(&self, state: &mut SessionState) -> Result<()> {
        for kind in &self.shared.config.record_kinds {
            self.source.enable_kind(*kind)?;
        }

        self.source.register_buffer_callbacks(self.handler())?;

        match self.source.subscribe_launches(self.handler()) {
            Ok(SubscribeOutcome::Subscribed) => state.launch_subscribed = true,
            Ok(SubscribeOutcome::LimitReached) => {
                warn!(
                    source = self.source.name(),
                    "launch subscriber limit reached, kernel records will not be annotated"
                );
            }
            Err(err) => return Err(err),
        }

        state.start_ns = self.source.timestamp_ns()?;
        Ok(())
    }

    /// Configured kinds followed by the fixed teardown kinds, without repeats.
    fn teardown_kinds(&self) -> impl Iterator<Item = ActivityKind> + '_ {
        let configured = &self.shared.config.record_kinds;
        configured.iter().copied().chain(
            TEARDOWN_KINDS
                .into_iter()
                .filter(move |kind| !configured.contains(kind)),
        )
    }

    fn rollback(&self, state: &mut SessionState) {
        for kind in self.teardown_kinds() {
            if let Err(err) = self.source.disable_kind(kind) {
                debug!(kind = kind.label(), error = %err, "rollback: disable_kind failed");
            }
        }
        if state.launch_subscribed {
            if let Err(err) = self.source.unsubscribe_launches() {
                debug!(error = %err, "rollback: unsubscribe failed");
            }
            state.launch_subscribed = false;
        }
    }

    fn stop_session(&self, state: &mut SessionState) -> Result<()> {
        let disabled = self
            .teardown_kinds()
            .try_for_each(|kind| self.source.disable_kind(kind));
        if state.launch_subscribed {
            if let Err(err) = self.source.unsubscribe_launches() {
                warn!(error = %err, "failed to unsubscribe launch callbacks");
            }
        }
        disabled?;
        state.end_ns = self.source.timestamp_ns()?;
        Ok(())
    }

    /// Flush, stop the session and finalize the source. Returns `false` when
    /// no session was running.
    fn teardown(&self) -> Result<bool> {
        // Completed buffers call back into the adapter, which takes the lock.
        if let Err(err) = self.source.flush_all(true) {
            warn!(error = %err, "failed to flush activity buffers");
        }

        let stopped = {
            let mut state = self.shared.state.lock();
            if !state.enabled {
                return Ok(false);
            }
            let stopped = self.stop_session(&mut state);
            state.enabled = false;
            stopped
        };

        // Finalize even after a failed stop so the source lets go of the adapter.
        let finalized = self.source.finalize();
        stopped.and(finalized).map(|()| true)
    }
}

impl<S: ActivitySource> DeviceTracer for ActivityTracer<S> {
    fn enable(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.enabled {
            warn!("device tracer already enabled");
            return Ok(());
        }

        state.reset();
        if let Err(err) = self.start_session(&mut state) {
            self.rollback(&mut state);
            drop(state);
            // Releases the buffer callbacks; may deliver buffers, so unlocked.
            if let Err(finalize_err) = self.source.finalize() {
                debug!(error = %finalize_err, "rollback: finalize failed");
            }
            return Err(self.fault(err));
        }

        state.enabled = true;
        info!(
            source = self.source.name(),
            start_ns = state.start_ns,
            subscribed = state.launch_subscribed,
            "device tracer enabled"
        );
        Ok(())
    }

    fn disable(&self) -> Result<()> {
        if !self.is_enabled() {
            warn!("device tracer not enabled");
            return Ok(());
        }

        match self.teardown() {
            Ok(true) => {}
            Ok(false) => {
                warn!("device tracer not enabled");
                return Ok(());
            }
            Err(err) => return Err(self.fault(err)),
        }

        let state = self.shared.state.lock();
        info!(
            source = self.source.name(),
            end_ns = state.end_ns,
            kernel_records = state.tables.kernel_records().len(),
            dropped = state.dropped_records,
            "device tracer disabled"
        );
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        self.shared.state.lock().enabled
    }

    fn add_annotation(&self, id: CorrelationId, name: &str) {
        self.shared.record_annotation(id, name);
    }

    fn add_kernel_record(&self, record: KernelRecord) {
        self.shared
            .state
            .lock()
            .append_kernel_records(std::iter::once(record));
    }

    fn gen_profile(&self) -> Profile {
        let profile = {
            let state = self.shared.state.lock();
            Profile::build(
                state.start_ns,
                state.end_ns,
                &state.tables,
                state.dropped_records,
            )
        };
        if self.shared.config.log_summary {
            profile.log_summary();
        }
        profile
    }

    fn stats(&self) -> TracerStats {
        TracerStats::from_state(&self.shared.state.lock())
    }
}

impl<S: ActivitySource> Drop for ActivityTracer<S> {
    fn drop(&mut self) {
        if !self.is_enabled() {
            return;
        }
        warn!(source = self.source.name(), "device tracer dropped while enabled");
        if let Err(err) = self.teardown() {
            error!(error = %err, "device tracer teardown on drop failed");
        }
    }
}

impl<S: ActivitySource> std::fmt::Debug for ActivityTracer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTracer")
            .field("source", &self.source.name())
            .field("config", &self.shared.config)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
