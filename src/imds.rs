//! Preemption probe — polls the host metadata service for the spot
//! termination notice.
//!
//! The session token is cached inside the client and refreshed at most once
//! per 401: a second rejection on the retry surfaces as an error.

use std::time::Duration;

use reqwest::StatusCode;
use tracing::debug;

use crate::error::{Result, SupervisorError};

const TOKEN_PATH: &str = "/latest/api/token";
const TERMINATION_PATH: &str = "/latest/meta-data/spot/termination-time";
const TOKEN_HEADER: &str = "X-aws-ec2-metadata-token";
const TOKEN_TTL_HEADER: &str = "X-aws-ec2-metadata-token-ttl-seconds";
const TOKEN_TTL_SECS: &str = "21600";

/// Every metadata request is local to the host; anything slower than this
/// means there is no metadata service.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

pub struct ImdsClient {
    base: String,
    http: reqwest::Client,
    token: String,
}

impl ImdsClient {
    /// One-shot host detection. `Ok(Some)` means the metadata service
    /// answered and the probe is armed with a fresh token; `Ok(None)` means
    /// the service is unreachable and the probe should stay disabled.
    pub async fn detect(base: &str) -> Result<Option<Self>> {
        let base = base.trim_end_matches('/').to_string();
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;

        match fetch_token(&http, &base).await {
            Ok(token) => Ok(Some(Self { base, http, token })),
            Err(SupervisorError::Http(e)) if e.is_timeout() || e.is_connect() => {
                debug!(error = %e, "metadata service unreachable");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the host has been notified of imminent termination.
    pub async fn termination_notified(&mut self) -> Result<bool> {
        let status = self.termination_status().await?;
        if status != StatusCode::UNAUTHORIZED {
            return Ok(status == StatusCode::OK);
        }

        self.token = fetch_token(&self.http, &self.base).await?;
        let status = self.termination_status().await?;
        if status == StatusCode::UNAUTHORIZED {
            return Err(SupervisorError::Probe(
                "metadata token rejected after refresh".into(),
            ));
        }
        Ok(status == StatusCode::OK)
    }

    async fn termination_status(&self) -> Result<StatusCode> {
        let resp = self
            .http
            .get(format!("{}{TERMINATION_PATH}", self.base))
            .header(TOKEN_HEADER, &self.token)
            .send()
            .await?;
        Ok(resp.status())
    }
}

async fn fetch_token(http: &reqwest::Client, base: &str) -> Result<String> {
    let resp = http
        .put(format!("{base}{TOKEN_PATH}"))
        .header(TOKEN_TTL_HEADER, TOKEN_TTL_SECS)
        .send()
        .await?;
    if resp.status() != StatusCode::OK {
        return Err(SupervisorError::Probe(format!(
            "token request failed with status {}",
            resp.status()
        )));
    }
    Ok(resp.text().await?)
}
