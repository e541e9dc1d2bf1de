//! Usage oracle: does live metadata still reference a blob?

use std::sync::Arc;

use async_trait::async_trait;
use common::BlobId;
use common::metadata::MetadataStore;
use common::retry::RetryPolicy;

/// Answer of a reference check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Usage {
    Referenced,
    NotReferenced,
    /// The metadata store could not be consulted
    Unknown,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UsageOracle: Send + Sync {
    /// Evaluated fresh on every call; never cached.
    async fn is_referenced(&self, store_name: &str, blob_id: &BlobId) -> Usage;
}

/// Oracle backed by the metadata store, retrying transient failures before
/// giving up with [`Usage::Unknown`].
pub struct MetadataUsageOracle {
    metadata: Arc<dyn MetadataStore>,
    retry: RetryPolicy,
}

impl MetadataUsageOracle {
    pub fn new(metadata: Arc<dyn MetadataStore>, retry: RetryPolicy) -> Self {
        Self { metadata, retry }
    }
}

#[async_trait]
impl UsageOracle for MetadataUsageOracle {
    async fn is_referenced(&self, store_name: &str, blob_id: &BlobId) -> Usage {
        let lookup = self
            .retry
            .run("blob reference lookup", || {
                self.metadata.is_blob_referenced(store_name, blob_id)
            })
            .await;

        match lookup {
            Ok(true) => Usage::Referenced,
            Ok(false) => Usage::NotReferenced,
            Err(e) => {
                tracing::warn!(
                    store = store_name,
                    blob_id = %blob_id,
                    error = %e,
                    "Reference check failed, treating blob as in use"
                );
                Usage::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::metadata::{MetadataError, MockMetadataStore};
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        }
    }

    fn blob() -> BlobId {
        "b1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_reference_answers_pass_through() {
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_is_blob_referenced()
            .times(1)
            .returning(|_, _| Ok(true));
        let oracle = MetadataUsageOracle::new(Arc::new(metadata), fast_retry());
        assert_eq!(oracle.is_referenced("s", &blob()).await, Usage::Referenced);

        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_is_blob_referenced()
            .times(1)
            .returning(|_, _| Ok(false));
        let oracle = MetadataUsageOracle::new(Arc::new(metadata), fast_retry());
        assert_eq!(oracle.is_referenced("s", &blob()).await, Usage::NotReferenced);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let mut metadata = MockMetadataStore::new();
        let mut seq = mockall::Sequence::new();
        metadata
            .expect_is_blob_referenced()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(MetadataError::Unavailable("connection reset".into())));
        metadata
            .expect_is_blob_referenced()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(false));

        let oracle = MetadataUsageOracle::new(Arc::new(metadata), fast_retry());
        assert_eq!(oracle.is_referenced("s", &blob()).await, Usage::NotReferenced);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_unknown() {
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_is_blob_referenced()
            .times(3)
            .returning(|_, _| Err(MetadataError::Unavailable("down".into())));

        let oracle = MetadataUsageOracle::new(Arc::new(metadata), fast_retry());
        let usage = oracle.is_referenced("s", &blob()).await;
        assert_eq!(usage, Usage::Unknown);
    }

    #[tokio::test]
    async fn test_query_errors_are_not_retried() {
        let mut metadata = MockMetadataStore::new();
        metadata
            .expect_is_blob_referenced()
            .times(1)
            .returning(|_, _| Err(MetadataError::Query("no such table".into())));

        let oracle = MetadataUsageOracle::new(Arc::new(metadata), fast_retry());
        assert_eq!(oracle.is_referenced("s", &blob()).await, Usage::Unknown);
    }
}
