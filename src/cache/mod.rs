// Re-export modules
pub mod derivative;
pub mod disk;
pub mod janitor;
pub mod key;
pub mod policy;

pub use derivative::{CacheStatus, Derivative, DerivativeCache};
pub use disk::DiskCache;
pub use janitor::{sweep, sweep_at, Janitor, JanitorHandle, SweepReport};
pub use key::{build_key, is_derivative_file, is_sized_key, CacheKey, Dimension};
pub use policy::CachePolicy;

use crate::config::ImageFormat;
use crate::ImageServerError;
use bytes::Bytes;
use std::path::PathBuf;

/// Trait for derivative storage backends
#[async_trait::async_trait]
pub trait Cache: Send + Sync {
    /// Deterministic location of a derivative; the path is the cache entry.
    fn path_for(&self, image: &str, key: &CacheKey, format: ImageFormat) -> PathBuf;

    /// Get cached bytes, `None` on a miss
    async fn get(&self, image: &str, key: &CacheKey, format: ImageFormat) -> Result<Option<Bytes>, ImageServerError>;

    /// Store bytes so that readers only ever see the complete file
    async fn put(
        &self,
        image: &str,
        key: &CacheKey,
        format: ImageFormat,
        data: Bytes,
    ) -> Result<PathBuf, ImageServerError>;
}

/// Generate a strong ETag from the served bytes
pub fn etag_for_bytes(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("\"{}\"", hex::encode(hasher.finalize()))
}
