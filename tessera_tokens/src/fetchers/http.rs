//! A fetcher for token endpoints answering with `access_token` and `expires_in`

use async_trait::async_trait;
use serde::Deserialize;
use tessera_clock::DurationSecs;
use thiserror::Error;

use super::TokenFetcher;
use crate::{AccessToken, Credential};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: AccessToken,
    expires_in: DurationSecs,
}

/// Fetches tokens with a `GET` against a fixed token URL
///
/// The URL is expected to carry whatever client identification the authority
/// needs. A successful response body looks like:
///
/// ```json
/// { "access_token": "…", "expires_in": 7200 }
/// ```
#[derive(Debug, Clone)]
pub struct HttpTokenFetcher {
    client: reqwest::Client,
    token_url: reqwest::Url,
}

impl HttpTokenFetcher {
    /// Constructs a fetcher for `token_url`
    pub fn new(client: reqwest::Client, token_url: reqwest::Url) -> Self {
        Self { client, token_url }
    }
}

/// An error while attempting to request a new token from the authority
#[derive(Debug, Error)]
pub enum FetchError {
    /// An error from the authority with an error body
    #[error("error requesting token from authority: {body}")]
    ErrorWithBody {
        /// The underlying request error
        source: reqwest::Error,
        /// The body of the error
        body: String,
    },
    /// Unable to deserialize the token body
    #[error("error deserializing token body from authority")]
    TokenBodyError(#[from] serde_json::Error),
    /// Unable to read the response
    #[error("error reading response body")]
    BodyReadError(#[source] reqwest::Error),
    /// Unable to send a token request to the authority
    #[error("error sending request to authority")]
    RequestSend(#[source] reqwest::Error),
}

#[async_trait]
impl TokenFetcher for HttpTokenFetcher {
    type Error = FetchError;

    #[tracing::instrument(err, skip(self), fields(token_url = %self.token_url.path()))]
    async fn fetch(&self) -> Result<Credential, Self::Error> {
        tracing::trace!("requesting token from authority");

        let resp = self
            .client
            .get(self.token_url.clone())
            .send()
            .await
            .map_err(FetchError::RequestSend)?;

        tracing::debug!(
            response.status = resp.status().as_u16(),
            "received token response from issuing authority"
        );

        if let Err(error) = resp.error_for_status_ref() {
            let body = resp.text().await.map_err(FetchError::BodyReadError)?;
            return Err(FetchError::ErrorWithBody {
                source: error,
                body,
            });
        }

        let body = resp.bytes().await.map_err(FetchError::BodyReadError)?;
        let resp: TokenResponse = serde_json::from_slice(&body)?;

        tracing::info!(lifetime = resp.expires_in.0, "received new token");

        Ok(Credential::from((resp.access_token, resp.expires_in)))
    }
}
