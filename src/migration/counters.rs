//! Run counters
//!
//! Shared by every worker of a run; updates are lock-free except for the
//! set of failed ids.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use keymend_core::DocumentId;
use parking_lot::Mutex;
use serde::Serialize;

/// Aggregate tallies of one run
#[derive(Debug, Default)]
pub struct RunCounters {
    not_found: AtomicU64,
    already_exist: AtomicU64,
    added: AtomicU64,
    deleted: AtomicU64,
    delete_failed: AtomicU64,
    skipped: AtomicU64,
    failed: Mutex<FailedIds>,
}

/// Failed ids in first-failure order
#[derive(Debug, Default)]
struct FailedIds {
    seen: HashSet<DocumentId>,
    order: Vec<DocumentId>,
}

impl RunCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_not_found(&self) {
        self.not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_already_exists(&self) {
        self.already_exist.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_added(&self) {
        self.added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    /// CAS mismatch, key gone, or a server error on delete
    pub fn record_delete_failed(&self) {
        self.delete_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// An indexed id without the legacy prefix was left alone
    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// A document hit an unexpected per-request error
    pub fn record_failed(&self, id: &DocumentId) {
        let mut failed = self.failed.lock();
        if failed.seen.insert(id.clone()) {
            failed.order.push(id.clone());
        }
    }

    /// Snapshot the counters
    pub fn summary(&self) -> RunSummary {
        let failed_ids = self.failed.lock().order.clone();
        RunSummary {
            not_found: self.not_found.load(Ordering::Relaxed),
            already_exist: self.already_exist.load(Ordering::Relaxed),
            added: self.added.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
            delete_failed: self.delete_failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: failed_ids.len() as u64,
            failed_ids: failed_ids.iter().map(DocumentId::escaped).collect(),
        }
    }
}

/// Final (or partial, after an abort) counts of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub not_found: u64,
    pub already_exist: u64,
    pub added: u64,
    pub deleted: u64,
    pub delete_failed: u64,
    /// Indexed ids that did not carry the legacy prefix
    pub skipped: u64,
    /// Documents with at least one failed step
    pub failed: u64,
    /// JSON-escaped ids of those documents
    pub failed_ids: Vec<String>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Not found      {}", self.not_found)?;
        writeln!(f, "Already exist  {}", self.already_exist)?;
        writeln!(f, "Added          {}", self.added)?;
        writeln!(f, "Deleted        {}", self.deleted)?;
        writeln!(f, "Delete failed  {}", self.delete_failed)?;
        writeln!(f, "Skipped        {}", self.skipped)?;
        write!(f, "Failed         {}", self.failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_snapshot() {
        let counters = RunCounters::new();
        counters.record_added();
        counters.record_added();
        counters.record_deleted();
        counters.record_not_found();
        counters.record_failed(&DocumentId::from("\u{3}a"));
        counters.record_failed(&DocumentId::from("\u{3}a"));

        let summary = counters.summary();
        assert_eq!(summary.added, 2);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.not_found, 1);
        assert_eq!(summary.already_exist, 0);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.failed_ids, vec![r#""\u0003a""#.to_string()]);
    }

    #[test]
    fn test_failed_ids_keep_first_failure_order() {
        let counters = RunCounters::new();
        for id in ["c", "a", "c", "b", "a"] {
            counters.record_failed(&DocumentId::from(id));
        }

        let summary = counters.summary();
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.failed_ids, vec![r#""c""#, r#""a""#, r#""b""#]);
    }

    #[test]
    fn test_display_lists_counters() {
        let summary = RunSummary {
            added: 7,
            ..Default::default()
        };
        let rendered = summary.to_string();
        assert!(rendered.contains("Added          7"));
        assert_eq!(rendered.lines().count(), 7);
    }
}
