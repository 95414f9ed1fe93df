//! The transport seam.
//!
//! The gateway composes rate limiting, retry, and caching over this narrow
//! interface instead of subclassing a concrete client. Tests substitute an
//! in-memory implementation.

use async_trait::async_trait;
use concierge_core::{Error, Result};
use serde_json::Value;
use tracing::debug;
use url::Url;

/// HTTP method of a directory call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

/// One remote call, independent of how it is carried.
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method.
    pub method: Method,
    /// Path below the client-API prefix, already percent-encoded.
    pub path: String,
    /// Query parameters.
    pub query: Vec<(String, String)>,
    /// JSON body, if any.
    pub body: Option<Value>,
}

impl Request {
    /// A GET request.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// A PUT request with a JSON body.
    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Put,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// A POST request with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::Post,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// A DELETE request.
    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            method: Method::Delete,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Add a query parameter.
    #[must_use]
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }
}

/// Carrier of remote calls. The only seam through which network traffic
/// leaves the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one call and return the parsed JSON response body.
    async fn call(&self, request: Request) -> Result<Value>;
}

/// Concrete transport over HTTP.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
    access_token: String,
}

impl HttpTransport {
    /// Create a transport against the given homeserver base URL.
    pub fn new(base_url: Url, access_token: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            base_url,
            access_token: access_token.into(),
        })
    }

    fn url_for(&self, request: &Request) -> Result<Url> {
        let mut url = self
            .base_url
            .join(&format!("_matrix/client/v3/{}", request.path))
            .map_err(|e| Error::config(format!("invalid request path: {e}")))?;
        for (key, value) in &request.query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn call(&self, request: Request) -> Result<Value> {
        let url = self.url_for(&request)?;
        debug!(method = ?request.method, path = %request.path, "remote call");

        let mut builder = match request.method {
            Method::Get => self.http.get(url),
            Method::Put => self.http.put(url),
            Method::Post => self.http.post(url),
            Method::Delete => self.http.delete(url),
        }
        .bearer_auth(&self.access_token);

        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body: Value = match response.json().await {
            Ok(v) => v,
            Err(_) if status.is_success() => Value::Null,
            Err(e) => return Err(Error::transient(format!("unreadable response body: {e}"))),
        };

        if status.is_success() {
            return Ok(body);
        }

        let code = body
            .get("errcode")
            .and_then(Value::as_str)
            .map(str::to_string);
        let message = body
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();

        Err(match status.as_u16() {
            429 => Error::rate_limited(body.get("retry_after_ms").and_then(Value::as_u64)),
            404 => Error::not_found(request.path),
            s if status.is_server_error() => {
                Error::transient(format!("server error {s}: {message}"))
            }
            s => Error::api(s, code, message),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use concierge_core::ErrorClass;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    async fn transport(server: &MockServer) -> HttpTransport {
        HttpTransport::new(server.uri().parse().unwrap(), "token").unwrap()
    }

    #[tokio::test]
    async fn success_returns_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/account/whoami"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"user_id": "@c:x"})),
            )
            .mount(&server)
            .await;

        let body = transport(&server)
            .await
            .call(Request::get("account/whoami"))
            .await
            .unwrap();
        assert_eq!(body["user_id"], "@c:x");
    }

    #[tokio::test]
    async fn rate_limit_carries_server_delay() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_json(
                serde_json::json!({"errcode": "M_LIMIT_EXCEEDED", "retry_after_ms": 1200}),
            ))
            .mount(&server)
            .await;

        let err = transport(&server)
            .await
            .call(Request::get("account/whoami"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::RateLimited);
        assert_eq!(err.retry_after_ms(), Some(1200));
    }

    #[tokio::test]
    async fn not_found_classifies_as_absence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(serde_json::json!({
                    "errcode": "M_NOT_FOUND", "error": "Room alias not found"
                })),
            )
            .mount(&server)
            .await;

        let err = transport(&server)
            .await
            .call(Request::get("directory/room/%23nope%3Ax"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .mount(&server)
            .await;

        let err = transport(&server)
            .await
            .call(Request::get("sync"))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn client_rejection_is_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "errcode": "M_FORBIDDEN", "error": "Not allowed"
            })))
            .mount(&server)
            .await;

        let err = transport(&server)
            .await
            .call(Request::post("createRoom", serde_json::json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(!err.is_retryable());
    }
}
