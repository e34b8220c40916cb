//! Dropbox storage provider
//!
//! Persists each block as an independent Dropbox file at
//! `/<folder>/<id>.block` through the v2 content API. Downloads and
//! uploads carry their arguments in the `Dropbox-API-Arg` header as
//! JSON; a download that reports `not_found` is translated into a
//! zero-filled block. The access token is verified once at
//! construction so misconfigured credentials fail at startup rather
//! than on the first I/O.

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Value, json};
use tracing::{debug, info, trace};

use crate::provider::{BlockProvider, block_object_name, zero_block};
use crate::{Error, Result};

const ACCOUNT_URL: &str = "https://api.dropboxapi.com/2/users/get_current_account";
const DOWNLOAD_URL: &str = "https://content.dropboxapi.com/2/files/download";
const UPLOAD_URL: &str = "https://content.dropboxapi.com/2/files/upload";

/// Dropbox-backed block provider
pub struct DropboxProvider {
    client: reqwest::Client,
    token: String,
    folder: String,
    block_size: usize,
}

impl DropboxProvider {
    /// Connect with an OAuth2 access token, verifying it against the
    /// account endpoint
    pub async fn connect(
        token: impl Into<String>,
        folder: impl Into<String>,
        block_size: usize,
    ) -> Result<Self> {
        let provider = Self {
            client: reqwest::Client::new(),
            token: token.into(),
            folder: folder.into(),
            block_size,
        };
        provider.verify_token().await?;
        Ok(provider)
    }

    /// Dropbox path of a block id
    fn block_path(&self, id: u64) -> String {
        format!("/{}/{}", self.folder, block_object_name(id))
    }

    async fn verify_token(&self) -> Result<()> {
        debug!("verifying Dropbox account");
        let body: Value = self
            .client
            .post(ACCOUNT_URL)
            .bearer_auth(&self.token)
            .send()
            .await?
            .json()
            .await?;

        match body.get("account_id").and_then(Value::as_str) {
            Some(account_id) => {
                info!(account_id, "Dropbox account verified");
                Ok(())
            }
            None => Err(Error::Auth(format!(
                "token rejected: {}",
                error_summary(&body).unwrap_or("no account id in response")
            ))),
        }
    }
}

/// Extract Dropbox's `error_summary` field from an API response body
fn error_summary(body: &Value) -> Option<&str> {
    body.get("error_summary").and_then(Value::as_str)
}

#[async_trait]
impl BlockProvider for DropboxProvider {
    async fn read_block(&self, id: u64) -> Result<Bytes> {
        let path = self.block_path(id);
        trace!(block = id, path = %path, "downloading block");

        let args = json!({ "path": path });
        let response = self
            .client
            .post(DOWNLOAD_URL)
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", args.to_string())
            .send()
            .await?;

        if response.status().is_success() {
            let data = response.bytes().await?;
            if data.len() != self.block_size {
                return Err(Error::BlockLength {
                    id,
                    actual: data.len(),
                    expected: self.block_size,
                });
            }
            return Ok(data);
        }

        let body: Value = response.json().await?;
        match error_summary(&body) {
            Some(summary) if summary.contains("not_found") => {
                trace!(block = id, "block absent, synthesizing zeros");
                Ok(zero_block(self.block_size))
            }
            Some(summary) => Err(Error::Api(summary.to_string())),
            None => Err(Error::Api("Dropbox API error".to_string())),
        }
    }

    async fn write_block(&self, id: u64, block: Bytes) -> Result<()> {
        if block.len() != self.block_size {
            return Err(Error::BlockLength {
                id,
                actual: block.len(),
                expected: self.block_size,
            });
        }

        let path = self.block_path(id);
        trace!(block = id, path = %path, "uploading block");

        let args = json!({ "path": path, "mode": "overwrite", "mute": true });
        let body: Value = self
            .client
            .post(UPLOAD_URL)
            .bearer_auth(&self.token)
            .header("Dropbox-API-Arg", args.to_string())
            .header("Content-Type", "application/octet-stream")
            .body(block)
            .send()
            .await?
            .json()
            .await?;

        match error_summary(&body) {
            Some(summary) => Err(Error::Api(summary.to_string())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_paths_are_rooted_in_the_folder() {
        let provider = DropboxProvider {
            client: reqwest::Client::new(),
            token: "t".to_string(),
            folder: "vdisk".to_string(),
            block_size: 16,
        };
        assert_eq!(provider.block_path(0), "/vdisk/0.block");
        assert_eq!(provider.block_path(42), "/vdisk/42.block");
    }

    #[test]
    fn error_summary_extraction() {
        let body = json!({ "error_summary": "path/not_found/..." });
        assert_eq!(error_summary(&body), Some("path/not_found/..."));
        assert_eq!(error_summary(&json!({})), None);
    }
}
