//! External collaborators — the object store holding savegames and the
//! backend message queue. Both are trait seams; the shipped implementations
//! speak plain HTTP.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Result, SupervisorError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()>;
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    async fn enqueue(&self, body: String) -> Result<()>;
}

/// Object store addressed as `{base}/{bucket}/{key}`.
pub struct HttpStore {
    base: String,
    http: reqwest::Client,
}

impl HttpStore {
    pub fn new(base: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TRANSFER_TIMEOUT)
            .build()?;
        Ok(Self { base: base.trim_end_matches('/').to_string(), http })
    }

    fn object_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{bucket}/{key}", self.base)
    }
}

#[async_trait]
impl ObjectStore for HttpStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let resp = self
            .http
            .get(self.object_url(bucket, key))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SupervisorError::Store(format!("get {bucket}/{key}: {e}")))?;
        Ok(resp.bytes().await?.to_vec())
    }

    async fn put(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<()> {
        self.http
            .put(self.object_url(bucket, key))
            .body(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SupervisorError::Store(format!("put {bucket}/{key}: {e}")))?;
        Ok(())
    }
}

/// Queue that accepts message bodies POSTed to its endpoint.
pub struct HttpQueue {
    url: String,
    http: reqwest::Client,
}

impl HttpQueue {
    pub fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(TRANSFER_TIMEOUT)
            .build()?;
        Ok(Self { url: url.to_string(), http })
    }
}

#[async_trait]
impl MessageQueue for HttpQueue {
    async fn enqueue(&self, body: String) -> Result<()> {
        self.http
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| SupervisorError::Store(format!("enqueue: {e}")))?;
        Ok(())
    }
}
