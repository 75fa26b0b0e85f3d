use alloy::primitives::Address;
use clonewatch_core::config::ExplorerConfig;
use clonewatch_core::types::SourceBundle;
use clonewatch_core::utils::env_var;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bundle::normalize;

const VERIFIED_STATUS: &str = "1";

#[derive(Debug, Error)]
pub enum SourceUnavailableError {
    #[error("explorer request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("explorer responded with http {0}")]
    Http(StatusCode),
    #[error("explorer response could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("explorer status {status}: {message}")]
    NotVerified { status: String, message: String },
    #[error("verified source is empty")]
    Empty,
}

#[derive(Debug, Deserialize)]
pub struct ExplorerResponse {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: ExplorerResult,
}

/// `result` is a list of entries on success and a bare string on most errors.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ExplorerResult {
    Entries(Vec<SourceEntry>),
    Message(String),
}

impl Default for ExplorerResult {
    fn default() -> Self {
        Self::Message(String::new())
    }
}

#[derive(Debug, Deserialize)]
pub struct SourceEntry {
    #[serde(rename = "SourceCode", default)]
    pub source_code: String,
}

impl ExplorerResponse {
    /// Normalized source of the first entry, or why there is none.
    pub fn into_source(self) -> Result<String, SourceUnavailableError> {
        if self.status != VERIFIED_STATUS {
            let message = match self.result {
                ExplorerResult::Message(detail) if !detail.is_empty() => {
                    format!("{} ({detail})", self.message)
                }
                _ => self.message,
            };
            return Err(SourceUnavailableError::NotVerified {
                status: self.status,
                message,
            });
        }
        let entry = match self.result {
            ExplorerResult::Entries(entries) => entries.into_iter().next(),
            ExplorerResult::Message(_) => None,
        };
        let Some(entry) = entry else {
            return Err(SourceUnavailableError::Empty);
        };
        if entry.source_code.trim().is_empty() {
            return Err(SourceUnavailableError::Empty);
        }
        let text = normalize(&entry.source_code);
        if text.trim().is_empty() {
            return Err(SourceUnavailableError::Empty);
        }
        Ok(text)
    }
}

#[derive(Clone)]
pub struct SourceFetcher {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    chain_id: u64,
    settle_delay: Duration,
}

impl SourceFetcher {
    pub fn new(cfg: &ExplorerConfig, chain_id: u64) -> Result<Self, reqwest::Error> {
        let api_key = env_var(&cfg.api_key_env);
        if api_key.is_none() {
            warn!(env = %cfg.api_key_env, "explorer api key missing; requests will be rate limited");
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()?;
        Ok(Self {
            client,
            api_url: cfg.api_url.clone(),
            api_key,
            chain_id,
            settle_delay: Duration::from_millis(cfg.settle_delay_ms),
        })
    }

    /// Gives the explorer time to index a fresh deployment.
    pub async fn settle(&self, address: Address) {
        if !self.settle_delay.is_zero() {
            debug!(%address, delay_ms = self.settle_delay.as_millis() as u64, "waiting for explorer to index");
            sleep(self.settle_delay).await;
        }
    }

    /// A single lookup; callers wait out `settle` first for fresh deployments.
    pub async fn fetch_now(&self, address: Address) -> Result<SourceBundle, SourceUnavailableError> {
        let mut query: Vec<(&str, String)> = vec![
            ("module", "contract".to_string()),
            ("action", "getsourcecode".to_string()),
            ("address", address.to_string()),
            ("chainId", self.chain_id.to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("apikey", key.clone()));
        }

        let response = self.client.get(&self.api_url).query(&query).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceUnavailableError::Http(status));
        }
        let body = response.text().await?;
        debug!(%address, %body, "explorer getsourcecode response");
        let parsed: ExplorerResponse = serde_json::from_str(&body)?;
        let text = parsed.into_source()?;
        Ok(SourceBundle { address, text })
    }
}
