//! Session-description exchange with the realtime backend.

use std::time::Duration;

use async_trait::async_trait;
use parley_settings::ExchangeSettings;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, instrument};

use crate::engine::SessionDescription;
use crate::errors::{Result, TransportError};

/// Every session description starts with the protocol version line.
pub const SDP_MARKER: &str = "v=";

/// Trades the local offer for the remote answer.
#[async_trait]
pub trait DescriptionExchange: Send + Sync {
    async fn exchange(
        &self,
        offer: &SessionDescription,
        credential: &SecretString,
    ) -> Result<SessionDescription>;
}

/// `POST {base_url}?model={model}` with the offer as `application/sdp`.
pub struct HttpDescriptionExchange {
    client: reqwest::Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl HttpDescriptionExchange {
    pub fn new(settings: &ExchangeSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: settings.base_url.clone(),
            model: settings.model.clone(),
            timeout: Duration::from_millis(settings.timeout_ms),
        }
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn endpoint(&self) -> String {
        format!("{}?model={}", self.base_url, self.model)
    }
}

#[async_trait]
impl DescriptionExchange for HttpDescriptionExchange {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn exchange(
        &self,
        offer: &SessionDescription,
        credential: &SecretString,
    ) -> Result<SessionDescription> {
        let response = self
            .client
            .post(self.endpoint())
            .header(CONTENT_TYPE, "application/sdp")
            .header(
                AUTHORIZATION,
                format!("Bearer {}", credential.expose_secret()),
            )
            .timeout(self.timeout)
            .body(offer.sdp.clone())
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Exchange {
                status: status.as_u16(),
                body,
            });
        }
        if !body.starts_with(SDP_MARKER) {
            return Err(TransportError::InvalidAnswer);
        }

        debug!(bytes = body.len(), "received remote description");
        Ok(SessionDescription::answer(body))
    }
}
