use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

/// Reply of the remote file store.
#[derive(Deserialize, Debug)]
struct UploadReply {
    data: Option<String>,
}

/// Best-effort HTTP client for the storage/records service. Every call
/// logs its failure and degrades instead of returning an error.
#[derive(Clone)]
pub struct TransferClient {
    client: reqwest::Client,
    upload_url: String,
}

impl TransferClient {
    /// `timeout` bounds connecting and each read, never a whole transfer,
    /// so large files that keep moving are not cut off.
    pub fn new(timeout: Duration, upload_url: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client, upload_url })
    }

    /// Stage `location` at `dest`. Remote http(s) sources are downloaded,
    /// anything else is treated as a local path and copied. Returns whether
    /// the file is in place.
    pub async fn fetch(&self, location: &str, dest: &Path) -> bool {
        let result = if is_remote(location) {
            self.download(location, dest).await
        } else {
            copy_local(location, dest).await
        };

        match result {
            Ok(bytes) => {
                tracing::info!("Staged {} -> {} ({} bytes)", location, dest.display(), bytes);
                true
            }
            Err(e) => {
                tracing::error!("Failed to stage {}: {:#}", location, e);
                if let Err(e) = tokio::fs::remove_file(dest).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("Could not remove partial file {}: {}", dest.display(), e);
                    }
                }
                false
            }
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {} from {}", status, url));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = response.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    /// Upload a finished artifact and return its remote URL, or `""` when
    /// the file is missing or the store rejects it.
    pub async fn upload(&self, path: &Path) -> String {
        match self.try_upload(path).await {
            Ok(url) => {
                tracing::info!("Uploaded {} -> {}", path.display(), url);
                url
            }
            Err(e) => {
                tracing::error!("Upload of {} failed: {:#}", path.display(), e);
                String::new()
            }
        }
    }

    async fn try_upload(&self, path: &Path) -> Result<String> {
        if !path.is_file() {
            return Err(anyhow!("file does not exist"));
        }
        let file = tokio::fs::File::open(path).await?;
        let length = file.metadata().await?.len();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload.bin".to_string());

        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = reqwest::multipart::Part::stream_with_length(body, length).file_name(file_name);
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(&self.upload_url)
            .multipart(form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("HTTP {} from {}: {}", status, self.upload_url, text));
        }

        let reply: UploadReply = response.json().await?;
        reply
            .data
            .filter(|url| !url.is_empty())
            .ok_or_else(|| anyhow!("reply from {} carries no URL", self.upload_url))
    }

    /// Post a JSON record. Failures are logged and otherwise ignored.
    pub async fn post_record<T: Serialize>(&self, record: &T, endpoint: &str) {
        match self.client.post(endpoint).json(record).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Record posted to {}", endpoint);
            }
            Ok(response) => {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                tracing::error!("Record post to {} returned {}: {}", endpoint, status, text);
            }
            Err(e) => tracing::error!("Record post to {} failed: {}", endpoint, e),
        }
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

async fn copy_local(source: &str, dest: &Path) -> Result<u64> {
    let source = Path::new(source);
    if !source.is_file() {
        return Err(anyhow!("no such file: {}", source.display()));
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(tokio::fs::copy(source, dest).await?)
}
