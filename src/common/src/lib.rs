pub mod blob;
pub mod cli;
pub mod config;
pub mod database;
pub mod ledger;
pub mod metadata;
pub mod retry;
pub mod storage;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use blob::{BlobId, BlobStoreRegistry, ContentStore};
pub use database::Database;
pub use ledger::DeletionLedger;
pub use metadata::MetadataStore;
