//! Correlation table and kernel record log.
//!
//! Neither container synchronizes on its own; both live inside the tracer's
//! single mutex alongside the session state.

use std::collections::HashMap;

use crate::activity::{CorrelationId, KernelRecord};
use crate::config::DuplicatePolicy;

/// Outcome of inserting an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnotationInsert {
    /// First annotation for this id.
    Inserted,
    /// The id was already present and the stored name was replaced.
    Replaced,
    /// The id was already present and the new name was discarded.
    Kept,
}

/// Correlation id to annotation map plus the append-only kernel log.
#[derive(Debug, Default)]
pub struct TraceTables {
    correlations: HashMap<CorrelationId, String>,
    kernel_records: Vec<KernelRecord>,
    duplicate_annotations: u64,
}

impl TraceTables {
    /// Create empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the annotation for `id` according to `policy`.
    pub fn add_annotation(
        &mut self,
        id: CorrelationId,
        name: &str,
        policy: DuplicatePolicy,
    ) -> AnnotationInsert {
        match self.correlations.get_mut(&id) {
            None => {
                self.correlations.insert(id, name.to_owned());
                AnnotationInsert::Inserted
            }
            Some(existing) => {
                self.duplicate_annotations += 1;
                match policy {
                    DuplicatePolicy::LastWriteWins => {
                        existing.clear();
                        existing.push_str(name);
                        AnnotationInsert::Replaced
                    }
                    DuplicatePolicy::FirstWriteWins => AnnotationInsert::Kept,
                }
            }
        }
    }

    /// Append one kernel record.
    pub fn add_kernel_record(&mut self, record: KernelRecord) {
        self.kernel_records.push(record);
    }

    /// Append a batch of kernel records, preserving their order.
    pub fn extend_kernel_records(&mut self, records: impl IntoIterator<Item = KernelRecord>) {
        self.kernel_records.extend(records);
    }

    /// Annotation stored for `id`.
    pub fn annotation(&self, id: CorrelationId) -> Option<&str> {
        self.correlations.get(&id).map(String::as_str)
    }

    /// Kernel records in insertion order.
    pub fn kernel_records(&self) -> &[KernelRecord] {
        &self.kernel_records
    }

    /// Number of stored annotations.
    pub fn annotation_count(&self) -> usize {
        self.correlations.len()
    }

    /// Number of annotations that hit an already stored id.
    pub fn duplicate_annotations(&self) -> u64 {
        self.duplicate_annotations
    }

    /// Drop everything, keeping allocations.
    pub fn clear(&mut self) {
        self.correlations.clear();
        self.kernel_records.clear();
        self.duplicate_annotations = 0;
    }
}
