//! Token fetchers
//!
//! A fetcher contacts the token authority and returns a fresh [`Credential`].
//! The server performs no retrying, rate limiting, or caching around it.

use std::{error, future::Future};

use async_trait::async_trait;

use crate::Credential;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::HttpTokenFetcher;

/// Obtains fresh tokens from the issuing authority
///
/// Any `Fn() -> impl Future<Output = Result<Credential, E>>` closure is a fetcher.
#[async_trait]
pub trait TokenFetcher: Send + Sync {
    /// The error type returned in the event that fetching a token fails
    type Error: error::Error + Send + Sync + 'static;

    /// Requests a new token from the authority
    async fn fetch(&self) -> Result<Credential, Self::Error>;
}

#[async_trait]
impl<F, Fut, E> TokenFetcher for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<Credential, E>> + Send,
    E: error::Error + Send + Sync + 'static,
{
    type Error = E;

    async fn fetch(&self) -> Result<Credential, Self::Error> {
        (self)().await
    }
}
