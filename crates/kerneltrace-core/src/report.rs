//! Profile report produced at the end of a session.
//!
//! A [`Profile`] joins the kernel record log against the correlation table.
//! Records whose correlation id has no annotation are counted in
//! [`Profile::unresolved`] and left out of the event list.
//!
//! # Example
//!
//! ```ignore
//! let profile = tracer.gen_profile();
//! for (name, summary) in profile.summary() {
//!     println!("{name}: {:.3} ms over {} kernels", summary.total_ms(), summary.count);
//! }
//! std::fs::write("profile.json", profile.to_json()?)?;
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::table::TraceTables;

/// One resolved kernel execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Annotation of the launch.
    pub name: String,
    /// Start timestamp in nanoseconds.
    pub start_ns: u64,
    /// End timestamp in nanoseconds.
    pub end_ns: u64,
    /// Device the kernel ran on.
    pub device_id: u32,
    /// Stream the kernel ran on.
    pub stream_id: u32,
}

impl Event {
    /// Kernel duration in nanoseconds.
    pub fn duration_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }
}

/// Per-name totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KernelSummary {
    /// Sum of kernel durations in nanoseconds.
    pub total_ns: u64,
    /// Number of kernel executions.
    pub count: u64,
}

impl KernelSummary {
    /// Total duration in milliseconds.
    pub fn total_ms(&self) -> f64 {
        self.total_ns as f64 / 1_000_000.0
    }

    /// Mean duration in nanoseconds.
    pub fn avg_ns(&self) -> Option<u64> {
        self.total_ns.checked_div(self.count)
    }
}

/// The correlated output of one tracing session.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    /// Source clock when the session was enabled.
    pub start_ns: u64,
    /// Source clock when the session was disabled.
    pub end_ns: u64,
    /// Resolved events in record arrival order.
    pub events: Vec<Event>,
    /// Kernel records with no matching annotation.
    pub unresolved: u64,
    /// Records the source reported as dropped.
    pub dropped_records: u64,
}

impl Profile {
    /// Join `tables` into a profile.
    pub(crate) fn build(
        start_ns: u64,
        end_ns: u64,
        tables: &TraceTables,
        dropped_records: u64,
    ) -> Self {
        let mut events = Vec::with_capacity(tables.kernel_records().len());
        let mut unresolved = 0;

        for record in tables.kernel_records() {
            let Some(name) = tables.annotation(record.correlation_id) else {
                tracing::debug!(
                    correlation_id = record.correlation_id,
                    device_id = record.device_id,
                    stream_id = record.stream_id,
                    "cannot relate a kernel activity"
                );
                unresolved += 1;
                continue;
            };

            events.push(Event {
                name: name.to_owned(),
                start_ns: record.start_ns,
                end_ns: record.end_ns,
                device_id: record.device_id,
                stream_id: record.stream_id,
            });
        }

        Self {
            start_ns,
            end_ns,
            events,
            unresolved,
            dropped_records,
        }
    }

    /// Per-name duration totals and invocation counts, sorted by name.
    pub fn summary(&self) -> BTreeMap<String, KernelSummary> {
        let mut summary: BTreeMap<String, KernelSummary> = BTreeMap::new();
        for event in &self.events {
            let entry = summary.entry(event.name.clone()).or_default();
            entry.total_ns = entry.total_ns.saturating_add(event.duration_ns());
            entry.count = entry.count.saturating_add(1);
        }
        summary
    }

    /// Log the per-name summary at info level.
    pub fn log_summary(&self) {
        for (name, summary) in self.summary() {
            tracing::info!(
                "{}: total: {:.6}ms invoked cuda kernels: {}",
                name,
                summary.total_ms(),
                summary.count
            );
        }
        if self.unresolved > 0 {
            tracing::warn!(
                unresolved = self.unresolved,
                "kernel records without a matching launch annotation were discarded"
            );
        }
    }

    /// Whether the session produced no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Session length in nanoseconds.
    pub fn session_ns(&self) -> u64 {
        self.end_ns.saturating_sub(self.start_ns)
    }

    /// Serialize as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a profile previously written by [`Profile::to_json`].
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::activity::KernelRecord;
    use crate::config::DuplicatePolicy;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn record(start_ns: u64, end_ns: u64, correlation_id: u32) -> KernelRecord {
        KernelRecord {
            start_ns,
            end_ns,
            device_id: 0,
            stream_id: 1,
            correlation_id,
        }
    }

    #[test]
    fn test_build_resolves_and_drops() {
        let mut tables = TraceTables::new();
        tables.add_annotation(7, "matmul_0", DuplicatePolicy::LastWriteWins);
        tables.add_kernel_record(record(1000, 1500, 7));
        tables.add_kernel_record(record(1600, 1700, 99));

        let profile = Profile::build(10, 2000, &tables, 0);
        assert_eq!(
            profile.events,
            vec![Event {
                name: "matmul_0".into(),
                start_ns: 1000,
                end_ns: 1500,
                device_id: 0,
                stream_id: 1,
            }]
        );
        assert_eq!(profile.unresolved, 1);
        assert_eq!(profile.start_ns, 10);
        assert_eq!(profile.end_ns, 2000);
        assert_eq!(profile.session_ns(), 1990);
    }

    #[test]
    fn test_summary_aggregates_by_name() {
        let mut tables = TraceTables::new();
        tables.add_annotation(1, "gemm", DuplicatePolicy::LastWriteWins);
        tables.add_annotation(2, "gemm", DuplicatePolicy::LastWriteWins);
        tables.add_annotation(3, "relu", DuplicatePolicy::LastWriteWins);
        tables.add_kernel_record(record(0, 300, 1));
        tables.add_kernel_record(record(400, 500, 2));
        tables.add_kernel_record(record(500, 550, 3));

        let summary = Profile::build(0, 600, &tables, 0).summary();
        assert_eq!(summary.len(), 2);
        assert_eq!(
            summary["gemm"],
            KernelSummary {
                total_ns: 400,
                count: 2
            }
        );
        assert_eq!(summary["gemm"].avg_ns(), Some(200));
        assert_eq!(summary["relu"].count, 1);
        assert_eq!(summary.keys().collect::<Vec<_>>(), vec!["gemm", "relu"]);
    }

    #[test]
    fn test_summary_saturates_total() {
        let mut tables = TraceTables::new();
        tables.add_annotation(1, "long", DuplicatePolicy::LastWriteWins);
        tables.add_annotation(2, "long", DuplicatePolicy::LastWriteWins);
        tables.add_kernel_record(record(0, u64::MAX, 1));
        tables.add_kernel_record(record(0, u64::MAX, 2));

        let profile = Profile::build(0, 0, &tables, 0);
        let summary = profile.summary();
        assert_eq!(summary["long"].total_ns, u64::MAX);
        assert_eq!(summary["long"].count, 2);
        profile.log_summary();
    }

    #[test]
    fn test_log_summary_line() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        let mut tables = TraceTables::new();
        tables.add_annotation(7, "matmul_0", DuplicatePolicy::LastWriteWins);
        tables.add_kernel_record(record(1000, 1500, 7));
        tables.add_kernel_record(record(1600, 1700, 99));
        let profile = Profile::build(0, 2000, &tables, 0);

        tracing::subscriber::with_default(subscriber, || profile.log_summary());

        let logs = logs.contents();
        assert!(logs.contains("matmul_0: total: 0.000500ms invoked cuda kernels: 1"));
        assert!(logs.contains("unresolved=1"));
    }

    #[test]
    fn test_kernel_summary_total_ms() {
        let summary = KernelSummary {
            total_ns: 2_500_000,
            count: 5,
        };
        assert!((summary.total_ms() - 2.5).abs() < f64::EPSILON);
        assert_eq!(KernelSummary::default().avg_ns(), None);
    }

    #[test]
    fn test_empty_profile() {
        let profile = Profile::default();
        assert!(profile.is_empty());
        assert!(profile.summary().is_empty());
        assert_eq!(profile.unresolved, 0);
    }

    #[test]
    fn test_json_round_trip() {
        let profile = Profile {
            start_ns: 1,
            end_ns: 2,
            events: vec![Event {
                name: "conv".into(),
                start_ns: 1,
                end_ns: 2,
                device_id: 3,
                stream_id: 4,
            }],
            unresolved: 5,
            dropped_records: 6,
        };
        let json = profile.to_json().unwrap();
        assert!(json.contains("\"name\": \"conv\""));
        assert_eq!(Profile::from_json(&json).unwrap(), profile);
    }
}
