//! Blobkeeper Compactor Library
//!
//! Background machinery that turns deleted metadata into reclaimed storage:
//!
//! - [`cleanup`]: resolves cleanup policies and bulk-deletes the matched
//!   components, soft deleting blobs that are no longer referenced
//! - [`reclaim`]: drains the deletion ledger and hard deletes what the usage
//!   oracle confirms is unreferenced
//! - [`quota`]: advisory size and count limits per store
//! - [`service`]: runs all of the above on their schedules

pub mod cleanup;
pub mod metrics;
pub mod oracle;
pub mod quota;
pub mod reclaim;
pub mod service;

// Re-export commonly used types
pub use cleanup::{BulkDeletionCoordinator, CleanupService, DeletionProgress, PolicyRun};
pub use metrics::{MetricsSummary, ReclaimMetrics};
pub use oracle::{MetadataUsageOracle, Usage, UsageOracle};
pub use quota::{QuotaError, QuotaEvaluator, QuotaLimits, QuotaResult};
pub use reclaim::{ReclaimResult, Reclaimer};
pub use service::CompactorService;
