//! Google Cloud access tokens for the REST-backed warehouse.
//!
//! [`AdcTokenProvider`] resolves Application Default Credentials: the
//! `GOOGLE_APPLICATION_CREDENTIALS` key file, the gcloud user config, or the
//! metadata server when running on Google Cloud. The underlying token source
//! caches the token and mints a new one once it expires, so callers ask for
//! a token before every request instead of holding one for the whole run.

use crate::error::PipelineError;
use async_trait::async_trait;
use google_cloud_auth::project::{create_token_source, Config};
use google_cloud_auth::token_source::TokenSource;

/// OAuth scope covering BigQuery and Cloud Storage.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const SCOPES: [&str; 1] = [CLOUD_PLATFORM_SCOPE];

/// Supplies a bearer token for each outgoing request.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync + std::fmt::Debug {
    async fn access_token(&self) -> Result<String, PipelineError>;
}

/// Application Default Credentials with automatic refresh.
#[derive(Debug)]
pub struct AdcTokenProvider {
    source: Box<dyn TokenSource>,
}

impl AdcTokenProvider {
    /// Discover credentials and fetch the first token.
    ///
    /// Fails with [`PipelineError::GoogleAuth`] when no credentials are
    /// configured.
    pub async fn new() -> Result<Self, PipelineError> {
        let config = Config::default().with_scopes(&SCOPES);
        let source = create_token_source(config)
            .await
            .map_err(|e| PipelineError::GoogleAuth(e.to_string()))?;
        Ok(Self { source })
    }
}

#[async_trait]
impl AccessTokenProvider for AdcTokenProvider {
    async fn access_token(&self) -> Result<String, PipelineError> {
        let token = self
            .source
            .token()
            .await
            .map_err(|e| PipelineError::GoogleAuth(e.to_string()))?;
        Ok(token.access_token)
    }
}

/// A fixed token, for emulators and tests.
pub struct StaticTokenProvider(String);

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Debug for StaticTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("StaticTokenProvider(<redacted>)")
    }
}

#[async_trait]
impl AccessTokenProvider for StaticTokenProvider {
    async fn access_token(&self) -> Result<String, PipelineError> {
        Ok(self.0.clone())
    }
}
