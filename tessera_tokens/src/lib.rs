//! A self-refreshing cache for a single expiring access token
//!
//! Issuing a token is assumed to be expensive, rate limited, or to have side
//! effects at the issuer when done twice in quick succession. This crate keeps
//! one token in a pluggable [`TokenStore`], hands it out to any number of
//! concurrent readers, and refreshes it from a [`TokenFetcher`] in two ways:
//!
//! * on demand, when a reader finds the store empty or expired, and
//! * in the background, from a refresh daemon that owns the only timer and
//!   retunes it to the lifetime of each token it sees.
//!
//! Refreshes are gated by the store's advisory lock so that several instances
//! sharing one store do not all hit the issuer at once. A reader that loses the
//! lock race does not wait for the winner's fetch; it re-reads the store a few
//! times with exponential backoff and takes whatever the winner published.
//!
//! # Example
//!
//! ```
//! use std::convert::Infallible;
//!
//! use tessera_clock::DurationSecs;
//! use tessera_tokens::{stores::InMemoryTokenStore, Credential, TokenServer};
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let store = std::sync::Arc::new(InMemoryTokenStore::new());
//! let server = TokenServer::spawn(store, || async {
//!     Ok::<_, Infallible>(Credential::new("issued-token", DurationSecs(7200)))
//! });
//!
//! let token = server.token().await.unwrap();
//! assert_eq!(token.as_str(), "issued-token");
//! server.shutdown().await;
//! # }
//! ```
//!
//! # Features
//!
//! The following features are enabled by default:
//!
//! * `file`: [`FileTokenStore`][stores::FileTokenStore], a store shared through the
//!   filesystem with a lease-based lock, for deployments of several instances.
//! * `http`: [`HttpTokenFetcher`][fetchers::HttpTokenFetcher], which obtains tokens
//!   from an endpoint answering with `access_token` and `expires_in`.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
mod daemon;
mod error;
pub mod fetchers;
pub mod jitter;
pub mod retry;
mod server;
pub mod stores;
#[cfg(test)]
mod test_util;
mod tokens;

pub use braids::*;
pub use daemon::DaemonConfig;
pub use error::{StoreError, TokenError};
pub use fetchers::TokenFetcher;
pub use server::TokenServer;
pub use stores::{LockToken, TokenStore};
pub use tokens::Credential;
