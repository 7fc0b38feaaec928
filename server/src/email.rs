use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::EmailConfig;

/// Outbound email for applications.
///
/// `Ok(None)` means no provider is configured. Callers that need delivery
/// confirmation must treat it as a failure.
#[async_trait::async_trait]
pub trait EmailSender: Send + Sync + 'static {
    async fn send(&self, subject: &str, body: &str) -> color_eyre::Result<Option<String>>;
}

pub struct DisabledEmailSender;

#[async_trait::async_trait]
impl EmailSender for DisabledEmailSender {
    async fn send(&self, _subject: &str, _body: &str) -> color_eyre::Result<Option<String>> {
        tracing::warn!("Email sending requested but no email provider is configured");
        Ok(None)
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: [&'a str; 1],
    subject: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct SendEmailResponse {
    id: String,
}

/// Sends through a Resend-compatible HTTP API
pub struct HttpEmailSender {
    client: reqwest::Client,
    config: EmailConfig,
}

impl HttpEmailSender {
    pub fn new(client: reqwest::Client, config: EmailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait::async_trait]
impl EmailSender for HttpEmailSender {
    #[tracing::instrument(skip_all, err)]
    async fn send(&self, subject: &str, body: &str) -> color_eyre::Result<Option<String>> {
        let response = self
            .client
            .post(&self.config.api_url)
            .bearer_auth(&self.config.api_key)
            .json(&SendEmailRequest {
                from: &self.config.from,
                to: [&self.config.to],
                subject,
                text: body,
            })
            .send()
            .await?
            .error_for_status()?;

        let sent: SendEmailResponse = response.json().await?;
        info!("Email accepted by provider with id {}", sent.id);

        Ok(Some(sent.id))
    }
}

pub fn email_sender(
    client: reqwest::Client,
    config: Option<EmailConfig>,
) -> std::sync::Arc<dyn EmailSender> {
    match config {
        Some(config) => std::sync::Arc::new(HttpEmailSender::new(client, config)),
        None => std::sync::Arc::new(DisabledEmailSender),
    }
}
