//! Test utilities for blobkeeper.
//!
//! Available with the `testing` feature or during tests:
//!
//! ```toml
//! [dev-dependencies]
//! common = { path = "../common", features = ["testing"] }
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use common::testing::TestConfigBuilder;
//!
//! let config = TestConfigBuilder::new()
//!     .in_memory()
//!     .with_store("default", Some(1_000_000), None)
//!     .build();
//! ```

mod config_builder;
mod faults;

use std::sync::Arc;

use bytes::Bytes;

use crate::blob::{BlobHeaders, BlobId, ContentStore, ObjectContentStore};
use crate::storage::create_object_store_from_dsn;

pub use config_builder::TestConfigBuilder;
pub use faults::{FaultyContentStore, FaultyDeletionLedger};

/// Open an empty content store backed by process memory.
pub async fn memory_content_store(name: &str) -> Arc<ObjectContentStore> {
    let object_store = create_object_store_from_dsn("memory://").expect("memory object store");
    Arc::new(
        ObjectContentStore::open(name, object_store)
            .await
            .expect("open memory content store"),
    )
}

/// Store `size` bytes under `repo_name`/`blob_name`.
pub async fn put_sized(
    store: &dyn ContentStore,
    repo_name: &str,
    blob_name: &str,
    size: usize,
) -> BlobId {
    store
        .put(
            Bytes::from(vec![b'x'; size]),
            BlobHeaders::new(repo_name, blob_name),
        )
        .await
        .expect("put blob")
}
