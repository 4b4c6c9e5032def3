//! Thin shim over the IPFS daemon HTTP API
//!
//! Only the endpoints the pipeline needs: block retrieval, add, pin
//! management and repo GC. Every call carries a timeout; exceeding it is a
//! transient error for the caller's retry policy.

use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::NodeError;

pub struct IpfsClient {
    api_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

impl IpfsClient {
    pub fn new(api_url: &str, timeout_secs: u64) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            client,
            timeout: Duration::from_secs(timeout_secs),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0/{}", self.api_url, path)
    }

    /// Fetch a raw block by CID.
    pub async fn block_get(&self, cid: &str) -> Result<Vec<u8>, NodeError> {
        let response = self
            .client
            .post(self.endpoint("block/get"))
            .query(&[("arg", cid)])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NodeError::Ipfs(format!(
                "block/get {cid}: {}",
                response.status()
            )));
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Add bytes, returning the CID the daemon assigned.
    pub async fn add(&self, data: Vec<u8>) -> Result<String, NodeError> {
        let part = reqwest::multipart::Part::bytes(data).file_name("blob");
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .client
            .post(self.endpoint("add"))
            .query(&[("cid-version", "0")])
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(NodeError::Ipfs(format!("add: {}", response.status())));
        }
        let parsed: AddResponse = response.json().await?;
        debug!(cid = %parsed.hash, "Added object to IPFS");
        Ok(parsed.hash)
    }

    pub async fn pin_add(&self, cid: &str) -> Result<(), NodeError> {
        self.simple_call("pin/add", cid).await
    }

    /// Unpin. A missing pin is not an error: unpin is idempotent.
    pub async fn pin_rm(&self, cid: &str) -> Result<(), NodeError> {
        match self.simple_call("pin/rm", cid).await {
            Ok(()) => Ok(()),
            Err(NodeError::Ipfs(msg)) if msg.contains("not pinned") => {
                warn!(cid = %cid, "Unpin of object that was not pinned");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn repo_gc(&self) -> Result<(), NodeError> {
        let response = self
            .client
            .post(self.endpoint("repo/gc"))
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(NodeError::Ipfs(format!("repo/gc: {}", response.status())));
        }
        Ok(())
    }

    async fn simple_call(&self, path: &str, arg: &str) -> Result<(), NodeError> {
        let response = self
            .client
            .post(self.endpoint(path))
            .query(&[("arg", arg)])
            .timeout(self.timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NodeError::Ipfs(format!("{path} {arg}: {status} {body}")));
        }
        Ok(())
    }
}
