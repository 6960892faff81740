//! Ephemeral credential suppliers.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, TransportError};

/// Supplies a short-lived credential just before each connection attempt.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<SecretString>;
}

/// Always returns the same credential.
pub struct StaticTokenProvider {
    token: SecretString,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: SecretString::from(token.into()),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self) -> Result<SecretString> {
        Ok(self.token.clone())
    }
}

type TokenFuture = Pin<Box<dyn Future<Output = Result<String>> + Send>>;

/// Adapter returned by [`token_fn`].
pub struct FnTokenProvider<F> {
    f: F,
}

/// Wrap an async closure as a [`TokenProvider`].
pub fn token_fn<F, Fut>(f: F) -> FnTokenProvider<impl Fn() -> TokenFuture + Send + Sync>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String>> + Send + 'static,
{
    FnTokenProvider {
        f: move || -> TokenFuture { Box::pin(f()) },
    }
}

#[async_trait]
impl<F> TokenProvider for FnTokenProvider<F>
where
    F: Fn() -> TokenFuture + Send + Sync,
{
    async fn fetch_token(&self) -> Result<SecretString> {
        let token = (self.f)().await?;
        Ok(SecretString::from(token))
    }
}

/// Fetches a credential from an HTTP endpoint with `GET`.
///
/// Accepts a JSON body carrying `client_secret.value`, `value`, or `token`,
/// or a plain-text body holding the token itself.
pub struct HttpTokenProvider {
    client: reqwest::Client,
    url: String,
    bearer: Option<SecretString>,
}

impl HttpTokenProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            bearer: None,
        }
    }

    /// Authenticate the credential request itself.
    #[must_use]
    pub fn with_bearer(mut self, key: impl Into<String>) -> Self {
        self.bearer = Some(SecretString::from(key.into()));
        self
    }

    #[must_use]
    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

#[async_trait]
impl TokenProvider for HttpTokenProvider {
    async fn fetch_token(&self) -> Result<SecretString> {
        debug!(url = %self.url, "requesting session credential");
        let mut request = self.client.get(&self.url).header(ACCEPT, "application/json");
        if let Some(bearer) = &self.bearer {
            request = request.header(AUTHORIZATION, format!("Bearer {}", bearer.expose_secret()));
        }
        let response = request.send().await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(TransportError::Credential {
                status: status.as_u16(),
                body,
            });
        }

        let token = match serde_json::from_str::<Value>(&body) {
            Ok(json) => extract_token(&json).unwrap_or_default(),
            Err(_) => body.trim().to_string(),
        };
        Ok(SecretString::from(token))
    }
}

fn extract_token(json: &Value) -> Option<String> {
    json.pointer("/client_secret/value")
        .or_else(|| json.get("value"))
        .or_else(|| json.get("token"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
