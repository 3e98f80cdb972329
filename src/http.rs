// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use reqwest::header::{ETAG, IF_RANGE, RANGE};
use std::pin::Pin;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Open-ended byte range used to continue a partial download
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte to fetch
    pub start: u64,
    /// Validator the server must still match for the range to apply
    pub if_range: Option<String>,
}

/// HTTP response with status, content length, validator, and body stream
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Content-Length header value, if present (length of this body, not the
    /// whole resource, for a 206 response)
    pub content_length: Option<u64>,
    /// ETag header value, if present
    pub etag: Option<String>,
    /// Response body as a stream of bytes
    pub body: ByteStream,
}

/// HTTP client abstraction for testability
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Fetch the entire response body as bytes
    async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error>;

    /// Get a streaming response, optionally starting part way into the body
    async fn get_stream(
        &self,
        url: &str,
        range: Option<&ByteRange>,
    ) -> Result<HttpResponse, reqwest::Error>;
}

/// Default HTTP client implementation using reqwest
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_bytes(&self, url: &str) -> Result<Bytes, reqwest::Error> {
        self.client.get(url).send().await?.bytes().await
    }

    async fn get_stream(
        &self,
        url: &str,
        range: Option<&ByteRange>,
    ) -> Result<HttpResponse, reqwest::Error> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(RANGE, format!("bytes={}-", range.start));
            if let Some(validator) = &range.if_range {
                request = request.header(IF_RANGE, validator.as_str());
            }
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();
        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|value| value.to_str().ok())
            .map(String::from);

        Ok(HttpResponse {
            status,
            content_length,
            etag,
            body: Box::pin(response.bytes_stream()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reqwest_client_can_be_created() {
        let _client = ReqwestClient::new();
        let _client_default = ReqwestClient::default();
        let _client_custom = ReqwestClient::with_client(reqwest::Client::new());
    }

    #[test]
    fn byte_range_carries_validator() {
        let range = ByteRange {
            start: 30,
            if_range: Some("\"abc\"".to_string()),
        };
        assert_eq!(range.start, 30);
        assert_eq!(range.if_range.as_deref(), Some("\"abc\""));
    }
}
