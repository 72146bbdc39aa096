//! Request and response model shared by the engine, the store and the network.

use std::fmt;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::NetworkError;

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Destination {
  /// A navigable document (top-level page load)
  Document,
  Script,
  Style,
  Image,
  Manifest,
  /// Plain fetch with no particular destination
  #[default]
  Empty,
}

impl Destination {
  pub fn is_document(self) -> bool {
    matches!(self, Destination::Document)
  }
}

/// An intercepted outbound request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Empty,
      headers: Vec::new(),
      body: None,
    }
  }

  /// A plain GET for a sub-resource.
  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET whose destination is a navigable document.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_destination(Destination::Document)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// Stable lookup key for this request.
  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }
}

/// Method plus absolute URL, with the fragment dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &Method, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self(format!("{} {}", method.as_str(), url))
  }

  pub(crate) fn from_stored(key: String) -> Self {
    Self(key)
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// How the response relates to the requesting origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response with readable body
  Cors,
  /// Cross-origin response the caller may not inspect
  Opaque,
  /// Built locally, never fetched
  Synthetic,
}

/// Status text of the synthesized offline response.
pub const OFFLINE_STATUS_TEXT: &str = "Offline";

/// A fully materialized response.
///
/// The body is owned and immutable. `Response` is deliberately not `Clone`:
/// the one place that needs two copies (return and persist) calls
/// [`Response::duplicate`] explicitly.
#[derive(Debug, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  pub kind: ResponseKind,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, kind: ResponseKind, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: default_status_text(status).to_string(),
      kind,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// The terminal response for sub-resources requested while offline.
  pub fn offline(message: &str) -> Self {
    Self {
      status: 408,
      status_text: OFFLINE_STATUS_TEXT.to_string(),
      kind: ResponseKind::Synthetic,
      headers: vec![(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
      )],
      body: message.as_bytes().to_vec(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Independent copy for the persist path.
  pub fn duplicate(&self) -> Self {
    Self {
      status: self.status,
      status_text: self.status_text.clone(),
      kind: self.kind,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }

  /// Only direct same-origin 200s are written back.
  pub fn is_cacheable(&self) -> bool {
    self.status == 200 && self.kind == ResponseKind::Basic
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

fn default_status_text(status: u16) -> &'static str {
  reqwest::StatusCode::from_u16(status)
    .ok()
    .and_then(|s| s.canonical_reason())
    .unwrap_or("")
}

/// Resolve a manifest path or request path against the origin.
pub fn resolve(origin: &Url, path: &str) -> Result<Url, NetworkError> {
  origin.join(path).map_err(|e| NetworkError::InvalidUrl {
    url: path.to_string(),
    message: e.to_string(),
  })
}
