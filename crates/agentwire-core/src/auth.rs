//! Access-token exchange
//!
//! The session authenticates with a long-lived refresh token that is traded
//! for a short-lived access token right before connecting.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::defaults;
use crate::config::EndpointConfig;

/// Initial capacity of the response body buffer
pub const INITIAL_BUFFER_SIZE: usize = 2048;

/// Granularity in which the body is copied into the buffer
pub const READ_CHUNK_SIZE: usize = 1024;

/// Largest token response body accepted
pub const MAX_BODY_SIZE: usize = 64 * 1024;

/// Headroom threshold, and growth step, of the response buffer
const GROW_STEP: usize = READ_CHUNK_SIZE * 3 / 2;

/// Errors from the token exchange
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transport failure talking to the token endpoint
    #[error("Token request failed: {0}")]
    Request(String),

    #[error("Out of memory while reading token response")]
    NoMemory,

    /// Non-200 status, unparsable body or no usable `access_token`
    #[error("Invalid token response: {0}")]
    InvalidResponse(String),
}

/// Exchanges a refresh token for an access token
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn access_token(&self, refresh_token: &str) -> Result<String, AuthError>;
}

/// Returns the same token every time; for local servers and tests
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn access_token(&self, refresh_token: &str) -> Result<String, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::InvalidArgument("empty refresh token".to_string()));
        }
        Ok(self.token.clone())
    }
}

/// OAuth2 refresh-token grant over HTTPS
#[derive(Debug, Clone)]
pub struct OAuthClient {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
}

impl OAuthClient {
    pub fn new(token_url: impl Into<String>, client_id: impl Into<String>) -> Result<Self, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(defaults::DEFAULT_AUTH_TIMEOUT_MS))
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;
        Ok(Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
        })
    }

    pub fn from_endpoint(endpoint: &EndpointConfig) -> Result<Self, AuthError> {
        Self::new(endpoint.token_url.clone(), endpoint.client_id.clone())
    }
}

#[async_trait]
impl TokenProvider for OAuthClient {
    async fn access_token(&self, refresh_token: &str) -> Result<String, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::InvalidArgument("empty refresh token".to_string()));
        }

        debug!("Requesting access token from {}", self.token_url);
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.client_id.as_str()),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        let status = response.status();
        let mut body = ResponseBuffer::new()?;
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|e| AuthError::Request(e.to_string()))?;
            body.extend(&chunk)?;
        }

        if status != StatusCode::OK {
            warn!(%status, "Token endpoint rejected the refresh token");
            return Err(AuthError::InvalidResponse(format!("HTTP status {status}")));
        }

        parse_access_token(body.as_slice())
    }
}

/// Pull a non-empty `access_token` out of a token response body
pub fn parse_access_token(body: &[u8]) -> Result<String, AuthError> {
    let json: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| AuthError::InvalidResponse(format!("body is not JSON: {e}")))?;
    match json.get("access_token").and_then(|v| v.as_str()) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(AuthError::InvalidResponse(
            "missing access_token".to_string(),
        )),
    }
}

/// Growable body buffer with fallible allocation
///
/// Starts at [`INITIAL_BUFFER_SIZE`] and copies input in [`READ_CHUNK_SIZE`]
/// pieces; before each piece, if free space is below 1.5 chunks the capacity
/// grows by another 1.5 chunks.
#[derive(Debug)]
pub struct ResponseBuffer {
    data: Vec<u8>,
}

impl ResponseBuffer {
    pub fn new() -> Result<Self, AuthError> {
        let mut data = Vec::new();
        data.try_reserve_exact(INITIAL_BUFFER_SIZE)
            .map_err(|_| AuthError::NoMemory)?;
        Ok(Self { data })
    }

    /// Append `bytes`; fails once the body would exceed [`MAX_BODY_SIZE`]
    pub fn extend(&mut self, bytes: &[u8]) -> Result<(), AuthError> {
        if self.data.len() + bytes.len() > MAX_BODY_SIZE {
            return Err(AuthError::InvalidResponse(format!(
                "body exceeds {MAX_BODY_SIZE} bytes"
            )));
        }
        for piece in bytes.chunks(READ_CHUNK_SIZE) {
            self.ensure_headroom()?;
            self.data.extend_from_slice(piece);
        }
        Ok(())
    }

    fn ensure_headroom(&mut self) -> Result<(), AuthError> {
        let free = self.data.capacity() - self.data.len();
        if free < GROW_STEP {
            self.data
                .try_reserve_exact(free + GROW_STEP)
                .map_err(|_| AuthError::NoMemory)?;
        }
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }
}
