//! Minimal JSON-over-HTTP client shared by the REST backends.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};
use serde::Serialize;
use serde::de::DeserializeOwned;
use url::Url;

use crate::error::{TransportError, TransportResult};

/// Default timeout for HTTP requests: 30 seconds.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest error body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 512;

/// JSON client bound to one base URL.
#[derive(Debug, Clone)]
pub(crate) struct RestClient {
    http: Client,
    base: Url,
}

impl RestClient {
    /// Creates a client. `bearer` is sent as `Authorization: Bearer <token>`.
    pub fn new(base: &str, bearer: Option<&str>, timeout: Duration) -> TransportResult<Self> {
        let mut base = Url::parse(base)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let mut headers = HeaderMap::new();
        if let Some(token) = bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::malformed(format!("invalid token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = Client::builder()
            .timeout(timeout)
            .user_agent(format!("veclens/{}", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;

        Ok(Self { http, base })
    }

    /// Returns the base URL.
    pub fn base(&self) -> &Url {
        &self.base
    }

    fn request(&self, method: Method, path: &str) -> TransportResult<RequestBuilder> {
        let url = self.base.join(path.trim_start_matches('/'))?;
        Ok(self.http.request(method, url))
    }

    async fn send<R: DeserializeOwned>(request: RequestBuilder) -> TransportResult<R> {
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Err(TransportError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Ok(serde_json::from_slice(b"null")?);
        }
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Sends a GET and decodes the JSON response.
    pub async fn get<R: DeserializeOwned>(&self, path: &str) -> TransportResult<R> {
        Self::send(self.request(Method::GET, path)?).await
    }

    /// Sends a POST with a JSON body and decodes the JSON response.
    pub async fn post<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> TransportResult<R> {
        Self::send(self.request(Method::POST, path)?.json(body)).await
    }

    /// Sends a PUT with a JSON body and decodes the JSON response.
    pub async fn put<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> TransportResult<R> {
        Self::send(self.request(Method::PUT, path)?.json(body)).await
    }

    /// Sends a DELETE and decodes the JSON response.
    pub async fn delete<R: DeserializeOwned>(&self, path: &str) -> TransportResult<R> {
        Self::send(self.request(Method::DELETE, path)?).await
    }

    /// Sends a DELETE with a JSON body and decodes the JSON response.
    pub async fn delete_with<B: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> TransportResult<R> {
        Self::send(self.request(Method::DELETE, path)?.json(body)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_path_gets_trailing_slash() {
        let client = RestClient::new("http://localhost:8000/api", None, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(client.base().as_str(), "http://localhost:8000/api/");
        let joined = client.base().join("v1/heartbeat").unwrap();
        assert_eq!(joined.as_str(), "http://localhost:8000/api/v1/heartbeat");
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        assert!(RestClient::new("not a url", None, DEFAULT_TIMEOUT).is_err());
    }
}
