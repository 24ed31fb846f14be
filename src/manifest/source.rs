//! Manifest retrieval and parsing

use super::triage::RawFile;
use crate::config::RetryConfig;
use crate::error::{Error, Result};
use crate::pipeline::Segment;
use crate::retry::fetch_with_retry;
use std::path::Path;
use std::time::Duration;

/// Timeout for a single HTTP attempt when fetching a manifest
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A parsed, validated manifest document
#[derive(Clone, Debug)]
pub struct ParsedManifest {
    /// `<meta type="title">` when present
    pub title: Option<String>,
    /// File entries in document order
    pub files: Vec<RawFile>,
    /// Sum of declared segment sizes
    pub total_bytes: u64,
}

/// Read a manifest from disk
pub async fn read_path(path: &Path) -> Result<Vec<u8>> {
    tokio::fs::read(path).await.map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to read manifest '{}': {}", path.display(), e),
        ))
    })
}

/// Download a manifest, retrying transient failures
pub async fn fetch_url(url: &str, retry: &RetryConfig) -> Result<Vec<u8>> {
    let client = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

    let client = &client;
    fetch_with_retry(retry, move || async move {
        let response = client.get(url).send().await?.error_for_status()?;
        let content = response.bytes().await?;
        tracing::debug!(url = %url, bytes = content.len(), "Fetched manifest");
        Ok::<_, Error>(content.to_vec())
    })
    .await
}

/// Parse and validate manifest XML
pub fn parse(content: &[u8]) -> Result<ParsedManifest> {
    let text = std::str::from_utf8(content)
        .map_err(|e| Error::InvalidNzb(format!("NZB content is not valid UTF-8: {}", e)))?;

    let nzb = nntp_rs::parse_nzb(text).map_err(|e| Error::InvalidNzb(format!("Failed to parse NZB: {}", e)))?;
    nzb.validate()
        .map_err(|e| Error::InvalidNzb(format!("NZB validation failed: {}", e)))?;

    let files = nzb
        .files
        .iter()
        .map(|file| RawFile {
            subject: file.subject.clone(),
            groups: file.groups.clone(),
            segments: file
                .segments
                .iter()
                .map(|segment| Segment {
                    id: segment.message_id.clone(),
                    bytes: segment.bytes,
                    number: segment.number,
                })
                .collect(),
        })
        .collect::<Vec<_>>();

    if files.is_empty() {
        return Err(Error::InvalidNzb("NZB contains no files".to_string()));
    }

    Ok(ParsedManifest {
        title: nzb.meta.get("title").map(|s| s.to_string()),
        files,
        total_bytes: nzb.total_bytes(),
    })
}
