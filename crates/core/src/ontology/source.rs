use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bucket + key address of the ontology blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobLocation {
    pub bucket: String,
    pub key: String,
}

impl BlobLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self { bucket: bucket.into(), key: key.into() }
    }
}

impl fmt::Display for BlobLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob `{0}` not found")]
    NotFound(String),
    #[error("blob read failed: {0}")]
    Io(String),
    #[error("blob transport failed: {0}")]
    Transport(String),
    #[error("blob is {size} bytes, above the {max} byte limit")]
    TooLarge { size: u64, max: usize },
}

#[async_trait]
pub trait BlobSource: Send + Sync {
    /// Implementations stop reading as soon as the blob is known to exceed `max_bytes`.
    async fn fetch(&self, location: &BlobLocation, max_bytes: usize) -> Result<Vec<u8>, BlobError>;
}
