//! Outbound email for job handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::error::MailError;

/// One email as job payloads describe it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mail {
    pub to: String,
    pub subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Sends through an HTTP email API as a JSON POST.
pub struct HttpMailer {
    client: Client,
    url: String,
    api_key: Option<String>,
    from: String,
}

impl HttpMailer {
    pub fn new(
        url: impl Into<String>,
        api_key: Option<String>,
        from: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key,
            from: from.into(),
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        let mut mail = mail.clone();
        mail.from.get_or_insert_with(|| self.from.clone());

        let mut request = self.client.post(&self.url).json(&mail);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            error!(to = %mail.to, timeout = e.is_timeout(), error = %e, "mail_send_error");
            MailError::Transport(e)
        })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(to = %mail.to, status_code = status, "mail_send_rejected");
            return Err(MailError::Status { status, body });
        }

        info!(to = %mail.to, subject = %mail.subject, status_code = status, "mail_sent");
        Ok(())
    }
}

/// Logs instead of sending, for environments without an email API.
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &Mail) -> Result<(), MailError> {
        info!(
            from = mail.from.as_deref().unwrap_or(&self.from),
            to = %mail.to,
            subject = %mail.subject,
            "mail_logged"
        );
        Ok(())
    }
}

/// The HTTP mailer when an API URL is configured, the log mailer otherwise.
pub fn from_config(config: &Config) -> Result<Arc<dyn Mailer>, MailError> {
    match &config.mailer_api_url {
        Some(url) => Ok(Arc::new(HttpMailer::new(
            url.clone(),
            config.mailer_api_key.clone(),
            config.mail_from.clone(),
            Duration::from_millis(config.request_timeout_ms),
        )?)),
        None => {
            info!("mailer_log_only");
            Ok(Arc::new(LogMailer::new(config.mail_from.clone())))
        }
    }
}
