//! Source document download.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::time::Duration;

/// Fetches the raw bytes of a source document.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`Downloader`] over `reqwest`. Any non-success HTTP status is an error.
pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("docchunk/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("GET {} returned {}", url, status);
        }

        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("reading body of {}", url))?;
        if bytes.is_empty() {
            bail!("GET {} returned an empty body", url);
        }
        Ok(bytes.to_vec())
    }
}
