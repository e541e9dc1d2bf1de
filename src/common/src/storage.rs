use anyhow::Result;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

use crate::config::BlobStoreConfig;

/// Create the object store backing a content store
pub fn create_object_store(store_config: &BlobStoreConfig) -> Result<Arc<dyn ObjectStore>> {
    create_object_store_from_dsn(&store_config.dsn)
}

/// Create an object store from a DSN string
///
/// Supported schemes: `file:///path`, `memory://`, `s3://[key:secret@]host[:port]/bucket`.
/// Local directories are created if they do not exist yet.
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/storage"
                ));
            }
            // file:///.data/blobs is relative to the working directory
            let path = path.strip_prefix("/.").map_or(path.to_string(), |rest| format!(".{rest}"));
            std::fs::create_dir_all(&path)?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = create_s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// S3 (or S3-compatible) builder for `s3://[key:secret@]host[:port]/bucket`.
///
/// Credentials missing from the DSN come from the usual `AWS_*` variables.
pub fn create_s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let bucket = dsn.path().trim_start_matches('/');
    if bucket.is_empty() {
        return Err(anyhow::anyhow!(
            "S3 DSN must specify a bucket: s3://host/bucket"
        ));
    }

    let mut builder = AmazonS3Builder::from_env().with_bucket_name(bucket);
    if std::env::var_os("AWS_DEFAULT_REGION").is_none() {
        builder = builder.with_region("us-east-1");
    }
    if !dsn.username().is_empty() {
        builder = builder
            .with_access_key_id(dsn.username())
            .with_secret_access_key(dsn.password().unwrap_or_default());
    }

    // MinIO and friends: path-style requests against an explicit endpoint
    if !host.ends_with("amazonaws.com") {
        let endpoint = match dsn.port() {
            Some(443) => format!("https://{host}"),
            Some(port) => format!("http://{host}:{port}"),
            None => format!("http://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}
