use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use tracing::debug;

use concierge_core::config::{OntologyConfig, OntologySourceKind};
use concierge_core::ontology::{BlobError, BlobLocation, BlobSource};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads `{base}/{bucket}/{key}` from the local filesystem.
#[derive(Clone, Debug)]
pub struct FileBlobSource {
    base: PathBuf,
}

impl FileBlobSource {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn path_for(&self, location: &BlobLocation) -> PathBuf {
        self.base.join(&location.bucket).join(&location.key)
    }
}

#[async_trait]
impl BlobSource for FileBlobSource {
    async fn fetch(&self, location: &BlobLocation, max_bytes: usize) -> Result<Vec<u8>, BlobError> {
        let path = self.path_for(location);
        debug!(event_name = "blob.fetch", source = "file", path = %path.display(), "reading blob");
        let io_error = |error: std::io::Error| match error.kind() {
            std::io::ErrorKind::NotFound => BlobError::NotFound(location.to_string()),
            _ => BlobError::Io(format!("{}: {error}", path.display())),
        };

        let metadata = tokio::fs::metadata(&path).await.map_err(io_error)?;
        ensure_within(metadata.len(), max_bytes)?;
        let bytes = tokio::fs::read(&path).await.map_err(io_error)?;
        // The file may have grown between the metadata call and the read.
        ensure_within(u64::try_from(bytes.len()).unwrap_or(u64::MAX), max_bytes)?;
        Ok(bytes)
    }
}

/// Fetches `GET {base}/{bucket}/{key}`.
pub struct HttpBlobSource {
    client: Client,
    base_url: String,
}

impl HttpBlobSource {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BlobError> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|error| BlobError::Transport(error.to_string()))?;
        Ok(Self { client, base_url: base_url.into().trim_end_matches('/').to_owned() })
    }

    pub fn url_for(&self, location: &BlobLocation) -> String {
        format!("{}/{}/{}", self.base_url, location.bucket, location.key)
    }
}

#[async_trait]
impl BlobSource for HttpBlobSource {
    async fn fetch(&self, location: &BlobLocation, max_bytes: usize) -> Result<Vec<u8>, BlobError> {
        let url = self.url_for(location);
        debug!(event_name = "blob.fetch", source = "http", url = %url, "downloading blob");

        let mut response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|error| BlobError::Transport(error.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(BlobError::NotFound(location.to_string())),
            status if !status.is_success() => {
                return Err(BlobError::Transport(format!("GET {url} returned {status}")));
            }
            _ => {}
        }
        if let Some(length) = response.content_length() {
            ensure_within(length, max_bytes)?;
        }

        let mut body = Vec::new();
        while let Some(chunk) =
            response.chunk().await.map_err(|error| BlobError::Transport(error.to_string()))?
        {
            let received = body.len().saturating_add(chunk.len());
            ensure_within(u64::try_from(received).unwrap_or(u64::MAX), max_bytes)?;
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }
}

fn ensure_within(size: u64, max_bytes: usize) -> Result<(), BlobError> {
    if size > u64::try_from(max_bytes).unwrap_or(u64::MAX) {
        return Err(BlobError::TooLarge { size, max: max_bytes });
    }
    Ok(())
}

pub fn blob_source_from_config(config: &OntologyConfig) -> Result<Arc<dyn BlobSource>, BlobError> {
    match config.source {
        OntologySourceKind::File => Ok(Arc::new(FileBlobSource::new(&config.base))),
        OntologySourceKind::Http => Ok(Arc::new(HttpBlobSource::new(config.base.clone())?)),
    }
}
