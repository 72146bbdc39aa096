//! Network access: a single attempt per request, no retries.

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::NetworkError;
use crate::http::{Request, Response, ResponseKind};

/// User agent sent with every network request.
pub const USER_AGENT: &str = concat!("offcache/", env!("CARGO_PKG_VERSION"));

/// Something that can fetch a request from the network.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  /// Perform exactly one attempt. Non-2xx statuses are responses, not errors.
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network backend built on reqwest.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Url,
}

impl HttpNetwork {
  /// Create a client whose responses are classified relative to `origin`.
  pub fn new(origin: Url) -> Result<Self, NetworkError> {
    Self::with_timeout(origin, None)
  }

  /// Same as [`HttpNetwork::new`] with an explicit request timeout.
  pub fn with_timeout(origin: Url, timeout: Option<Duration>) -> Result<Self, NetworkError> {
    let mut builder = reqwest::Client::builder().user_agent(USER_AGENT);
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }
    let client = builder.build().map_err(|e| NetworkError::Unreachable {
      url: origin.to_string(),
      message: format!("failed to build http client: {}", e),
    })?;

    Ok(Self { client, origin })
  }

  pub fn origin(&self) -> &Url {
    &self.origin
  }

  fn kind_for(&self, url: &Url) -> ResponseKind {
    if url.origin() == self.origin.origin() {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    }
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await.map_err(|e| NetworkError::Unreachable {
      url: request.url.to_string(),
      message: e.to_string(),
    })?;

    let status = response.status();
    // Redirects are followed; classify by where we ended up
    let kind = self.kind_for(response.url());
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response.bytes().await.map_err(|e| NetworkError::Body {
      url: request.url.to_string(),
      message: e.to_string(),
    })?;

    debug!(url = %request.url, status = status.as_u16(), ?kind, "network response");

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or("").to_string(),
      kind,
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use reqwest::Method;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn url(server: &MockServer, p: &str) -> Url {
    Url::parse(&server.uri()).unwrap().join(p).unwrap()
  }

  #[tokio::test]
  async fn test_fetch_same_origin_is_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/index.html"))
      .and(header("user-agent", USER_AGENT))
      .respond_with(ResponseTemplate::new(200).set_body_raw("<h1>hello</h1>", "text/html"))
      .mount(&server)
      .await;

    let network = HttpNetwork::new(url(&server, "/")).unwrap();
    let response = network
      .fetch(&Request::get(url(&server, "/index.html")))
      .await
      .unwrap();

    assert_eq!(response.status, 200);
    assert_eq!(response.status_text, "OK");
    assert_eq!(response.kind, ResponseKind::Basic);
    assert_eq!(response.text(), "<h1>hello</h1>");
    assert_eq!(response.header("content-type"), Some("text/html"));
    assert!(response.is_cacheable());
  }

  #[tokio::test]
  async fn test_fetch_cross_origin_is_not_basic() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/lib.js"))
      .respond_with(ResponseTemplate::new(200).set_body_string("lib"))
      .mount(&server)
      .await;

    let network = HttpNetwork::new(Url::parse("http://app.invalid/").unwrap()).unwrap();
    let response = network
      .fetch(&Request::get(url(&server, "/lib.js")))
      .await
      .unwrap();

    assert_eq!(response.kind, ResponseKind::Cors);
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_error_status_is_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/missing"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;

    let network = HttpNetwork::new(url(&server, "/")).unwrap();
    let response = network
      .fetch(&Request::get(url(&server, "/missing")))
      .await
      .unwrap();

    assert_eq!(response.status, 404);
    assert!(!response.is_cacheable());
  }

  #[tokio::test]
  async fn test_forwards_method_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/items"))
      .respond_with(ResponseTemplate::new(201))
      .expect(1)
      .mount(&server)
      .await;

    let network = HttpNetwork::new(url(&server, "/")).unwrap();
    let request = Request::new(Method::POST, url(&server, "/items")).with_body("{}");
    let response = network.fetch(&request).await.unwrap();

    assert_eq!(response.status, 201);
  }

  #[tokio::test]
  async fn test_connection_refused_is_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let target = Url::parse(&format!("http://127.0.0.1:{}/app.js", port)).unwrap();
    let network = HttpNetwork::new(target.clone()).unwrap();
    let result = network.fetch(&Request::get(target)).await;

    assert!(matches!(result, Err(NetworkError::Unreachable { .. })));
  }
}
