//! Reclamation: turning soft deletes into hard deletes once no live metadata
//! references the blob.
//!
//! One [`Reclaimer`] serves one content store. A pass walks the store's
//! ledger entries that existed when the pass started, oldest first, in
//! batches. For every entry the usage oracle is asked afresh; only a
//! confirmed [`Usage::NotReferenced`](crate::oracle::Usage) leads to a hard
//! delete. Everything else stays in the ledger for a later pass.

mod reclaimer;

pub use reclaimer::Reclaimer;

/// Outcome of one reclaim pass over one store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimResult {
    pub store_name: String,
    /// Ledger entries looked at
    pub examined: u64,
    /// Entries whose content was removed
    pub hard_deleted: u64,
    /// Entries cleared because the content was already gone
    pub content_missing: u64,
    /// Entries dropped because the blob was undeleted since
    pub restored: u64,
    pub retained_referenced: u64,
    pub retained_unknown: u64,
    /// Hard deletes that failed and will be retried next pass
    pub failed: u64,
    pub batches: u64,
    pub cancelled: bool,
    pub dry_run: bool,
}

impl ReclaimResult {
    fn new(store_name: &str, dry_run: bool) -> Self {
        Self {
            store_name: store_name.to_string(),
            dry_run,
            ..Default::default()
        }
    }

    /// Entries that left the ledger during the pass.
    pub fn cleared(&self) -> u64 {
        self.hard_deleted + self.content_missing + self.restored
    }

    pub fn retained(&self) -> u64 {
        self.retained_referenced + self.retained_unknown + self.failed
    }

    pub fn log(&self) {
        let prefix = if self.dry_run { "[DRY-RUN] " } else { "" };
        tracing::info!(
            store = %self.store_name,
            examined = self.examined,
            hard_deleted = self.hard_deleted,
            content_missing = self.content_missing,
            restored = self.restored,
            retained_referenced = self.retained_referenced,
            retained_unknown = self.retained_unknown,
            failed = self.failed,
            batches = self.batches,
            cancelled = self.cancelled,
            "{prefix}Reclaim pass finished"
        );
    }
}
