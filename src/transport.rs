//! SMS transport.
//!
//! Outbound goes through the `SmsTransport` trait; the shipped
//! implementation is the Twilio Messages API. Inbound arrives as a
//! form-encoded Twilio webhook consumed by the inbound pipeline.

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::debug;

use crate::error::TransportError;

/// Receipt for an accepted outbound send.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Transport-assigned message identifier (Twilio SID).
    pub transport_id: Option<String>,
}

/// SMS sending capability.
///
/// Single-message delivery guarantees live at the transport's layer;
/// the engine only retries handing the message over.
#[async_trait]
pub trait SmsTransport: Send + Sync {
    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, TransportError>;
}

/// Inbound webhook payload, Twilio field names.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundSms {
    #[serde(rename = "From")]
    pub from: String,
    #[serde(rename = "To")]
    pub to: String,
    #[serde(rename = "Body")]
    pub body: String,
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
}

/// Twilio Messages API transport.
pub struct TwilioTransport {
    client: Client,
    account_sid: String,
    auth_token: SecretString,
    from_number: String,
    api_url: String,
}

#[derive(Deserialize)]
struct TwilioResponse {
    sid: Option<String>,
}

#[derive(Deserialize)]
struct TwilioError {
    message: Option<String>,
}

impl TwilioTransport {
    pub fn new(
        account_sid: impl Into<String>,
        auth_token: SecretString,
        from_number: impl Into<String>,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Request(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            account_sid: account_sid.into(),
            auth_token,
            from_number: from_number.into(),
            api_url: "https://api.twilio.com".to_string(),
        })
    }

    /// Override the API base URL (tests against a local stub).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }
}

#[async_trait]
impl SmsTransport for TwilioTransport {
    async fn send(&self, to: &str, body: &str) -> Result<DeliveryReceipt, TransportError> {
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            self.api_url, self.account_sid
        );

        let form = [("To", to), ("From", self.from_number.as_str()), ("Body", body)];

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(self.auth_token.expose_secret()))
            .form(&form)
            .send()
            .await
            .map_err(|e| TransportError::Request(e.to_string()))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited { retry_after: None });
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let reason = serde_json::from_str::<TwilioError>(&text)
                .ok()
                .and_then(|e| e.message)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(TransportError::SendRejected {
                to: to.to_string(),
                reason,
            });
        }

        let parsed: TwilioResponse = response
            .json()
            .await
            .map_err(|e| TransportError::Request(format!("response parse: {e}")))?;

        debug!(to = %to, sid = ?parsed.sid, "SMS accepted by transport");
        Ok(DeliveryReceipt {
            transport_id: parsed.sid,
        })
    }
}
