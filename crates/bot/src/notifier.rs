use clonewatch_core::types::AlertMessage;
use clonewatch_core::utils::env_var;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::fmt::Write;
use thiserror::Error;
use tokio::time::Duration;
use tracing::{info, warn};

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const TELEGRAM_MESSAGE_LIMIT: usize = 4096;
const TELEGRAM_SEND_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Error)]
pub enum AlertDeliveryError {
    #[error("telegram request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("telegram responded with http {0}")]
    Status(StatusCode),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertOutcome {
    Delivered,
    /// No messaging credentials; the alert only went to the log.
    LoggedOnly,
    Failed,
}

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    url: String,
    chat_id: String,
}

#[derive(Serialize)]
struct TelegramPayload<'a> {
    chat_id: &'a str,
    text: &'a str,
    disable_web_page_preview: bool,
}

impl TelegramNotifier {
    pub fn from_env() -> Option<Self> {
        let token = env_var("TELEGRAM_BOT_TOKEN");
        let chat_id = env_var("TELEGRAM_CHAT_ID");

        match (token, chat_id) {
            (Some(token), Some(chat_id)) => Some(Self::new(TELEGRAM_API_BASE, &token, chat_id)),
            (None, None) => None,
            _ => {
                warn!("telegram notifier disabled: TELEGRAM_BOT_TOKEN or TELEGRAM_CHAT_ID missing");
                None
            }
        }
    }

    pub fn new(api_base: &str, token: &str, chat_id: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(TELEGRAM_SEND_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|err| {
                warn!(
                    ?err,
                    "telegram notifier client build failed; using default client"
                );
                Client::new()
            });
        let url = format!("{}/bot{token}/sendMessage", api_base.trim_end_matches('/'));
        Self {
            client,
            url,
            chat_id,
        }
    }

    pub async fn send(&self, message: String) -> Result<(), AlertDeliveryError> {
        let message = truncate_message(message);
        let payload = TelegramPayload {
            chat_id: &self.chat_id,
            text: &message,
            disable_web_page_preview: true,
        };
        let response = self.client.post(&self.url).json(&payload).send().await?;
        if !response.status().is_success() {
            return Err(AlertDeliveryError::Status(response.status()));
        }
        Ok(())
    }
}

/// Formats similarity alerts and hands them to Telegram when configured.
#[derive(Clone)]
pub struct AlertDispatcher {
    telegram: Option<TelegramNotifier>,
    address_url: String,
}

impl AlertDispatcher {
    pub fn new(telegram: Option<TelegramNotifier>, address_url: impl Into<String>) -> Self {
        Self {
            telegram,
            address_url: address_url.into(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.telegram.is_some()
    }

    /// Never fails; delivery problems are logged and reported as the outcome.
    pub async fn send(&self, alert: &AlertMessage) -> AlertOutcome {
        let text = format_alert(alert, &self.address_url);
        let Some(telegram) = &self.telegram else {
            info!(address = %alert.address, percent = alert.percent, "{text}");
            return AlertOutcome::LoggedOnly;
        };
        match telegram.send(text).await {
            Ok(()) => {
                info!(address = %alert.address, percent = alert.percent, "similarity alert sent");
                AlertOutcome::Delivered
            }
            Err(err) => {
                warn!(address = %alert.address, %err, "similarity alert delivery failed");
                AlertOutcome::Failed
            }
        }
    }
}

pub fn format_alert(alert: &AlertMessage, address_url: &str) -> String {
    let mut msg = String::new();
    let _ = writeln!(msg, "HIGH SIMILARITY ALERT");
    let _ = writeln!(msg);
    let _ = writeln!(msg, "Contract:{}", alert.address);
    let _ = writeln!(msg, "Similarity:{:.2}%", alert.percent);
    let _ = write!(msg, "Check on explorer:{address_url}{}", alert.address);
    msg
}

fn truncate_message(mut message: String) -> String {
    if message.len() <= TELEGRAM_MESSAGE_LIMIT {
        return message;
    }
    let mut cut = TELEGRAM_MESSAGE_LIMIT - 3;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    message.truncate(cut);
    message.push_str("...");
    message
}
