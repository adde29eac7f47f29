//! This module provides the fetch collaborator the pool relies on, together with its HTTP implementation.

use std::future::Future;

use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub use reqwest::Client;
pub use url::Url;

/// Upper bound of the body buffer reserved up front from the announced `Content-Length`.
const MAX_BODY_RESERVE: usize = 64 * 1_024;

/// Transport failures reported by a [`Fetch`] implementor.
#[derive(Debug, Error)]
pub enum Error {
    /// The identifier is not a valid URL.
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// The request could not be sent or no response was received.
    #[error("failed to make a request: {0}")]
    Request(#[source] reqwest::Error),
    /// The response body could not be read to the end.
    #[error("failed to read body: {0}")]
    Body(#[source] reqwest::Error),
    /// The fetcher panicked.
    #[error("fetch panicked")]
    Panicked,
    /// Any other failure, for custom fetchers.
    #[error("{0}")]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Fetch collaborator interface.
///
/// Implementors are shared by every worker of a pool, so `fetch` may be called concurrently.
pub trait Fetch: Send + Sync + 'static {
    /// Fetch the raw bytes of the resource named by `identifier`.
    fn fetch(&self, identifier: &str) -> impl Future<Output = Result<Bytes, Error>> + Send;
}

/// HTTP fetcher.
///
/// Identifiers are parsed as URLs and their bodies are retrieved with a GET request, whatever the response status.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a fetcher sending its requests through `client`.
    #[inline]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a new fetcher sending its requests through `client`.
    #[inline]
    pub fn with_client(self, client: Client) -> Self {
        Self { client, ..self }
    }

    #[inline]
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl Fetch for HttpFetcher {
    fn fetch(&self, identifier: &str) -> impl Future<Output = Result<Bytes, Error>> + Send {
        let url = Url::parse(identifier);

        async move {
            let mut resp = self.client.get(url?).send().await.map_err(Error::Request)?;

            // the announced length is only a hint, the buffer grows with the chunks actually received
            let reserve = resp.content_length().and_then(|len| usize::try_from(len).ok()).unwrap_or_default();
            let mut body = BytesMut::with_capacity(reserve.min(MAX_BODY_RESERVE));

            while let Some(chunk) = resp.chunk().await.map_err(Error::Body)? {
                body.extend_from_slice(&chunk);
            }

            Ok::<_, Error>(body.freeze())
        }
    }
}
