use async_trait::async_trait;
use folio_core::DocumentId;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::SyncError;

/// Supplies the short-lived credential for one connection attempt.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self, document: DocumentId) -> Result<String, SyncError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct HttpTokenSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpTokenSource {
    pub fn new(token_url: &str) -> Result<Self, SyncError> {
        Self::with_client(reqwest::Client::new(), token_url)
    }

    pub fn with_client(client: reqwest::Client, token_url: &str) -> Result<Self, SyncError> {
        Ok(Self {
            client,
            url: Url::parse(token_url)?,
        })
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn fetch(&self, document: DocumentId) -> Result<String, SyncError> {
        debug!(url = %self.url, %document, "requesting channel token");
        let response = self
            .client
            .get(self.url.clone())
            .query(&[("document_id", document.to_string())])
            .send()
            .await?
            .error_for_status()?;
        let TokenResponse { access_token } = response.json().await?;
        Ok(access_token)
    }
}
