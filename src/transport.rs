//! The request primitive the adapter sits on top of.
//!
//! Transports only move bytes: they never retry, cache or time out on their
//! own. Non-2xx answers are returned as ordinary responses; deciding that
//! they are failures is the adapter's job.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }

  /// Whether a successful call changes server state.
  pub fn is_mutation(&self) -> bool {
    !matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Patch => reqwest::Method::PATCH,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
  pub status: u16,
  /// Decoded JSON body. Empty bodies are `Null`; non-JSON bodies are kept
  /// as a string.
  pub body: Value,
}

impl TransportResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Human-readable error text for a failed response.
  pub fn error_message(&self) -> String {
    let from_body = match &self.body {
      Value::Object(map) => ["message", "error", "error_description"]
        .iter()
        .find_map(|field| map.get(*field).and_then(Value::as_str))
        .map(String::from),
      Value::String(text) if !text.is_empty() => Some(text.clone()),
      _ => None,
    };

    from_body.unwrap_or_else(|| {
      reqwest::StatusCode::from_u16(self.status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("request failed")
        .to_string()
    })
  }
}

/// Black-box request primitive.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, request: TransportRequest) -> Result<TransportResponse>;
}

/// Transport backed by `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
}

impl HttpTransport {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Transport for HttpTransport {
  async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
    let mut builder = self
      .client
      .request(request.method.into(), request.url.clone());
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder
      .send()
      .await
      .map_err(|e| Error::Transport(e.to_string()))?;
    let status = response.status().as_u16();
    let bytes = response
      .bytes()
      .await
      .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;

    Ok(TransportResponse::new(status, decode_body(&bytes)))
  }
}

fn decode_body(bytes: &[u8]) -> Value {
  if bytes.iter().all(u8::is_ascii_whitespace) {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}

#[cfg(test)]
pub(crate) mod mock {
  //! Scripted transport for tests.

  use super::*;
  use parking_lot::Mutex;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;

  type Handler = dyn Fn(&TransportRequest) -> Result<TransportResponse> + Send + Sync;

  pub struct MockTransport {
    handler: Box<Handler>,
    delay: Duration,
    calls: AtomicUsize,
    requests: Mutex<Vec<TransportRequest>>,
  }

  impl MockTransport {
    pub fn new<H>(handler: H) -> Arc<Self>
    where
      H: Fn(&TransportRequest) -> Result<TransportResponse> + Send + Sync + 'static,
    {
      Self::with_delay(Duration::ZERO, handler)
    }

    pub fn with_delay<H>(delay: Duration, handler: H) -> Arc<Self>
    where
      H: Fn(&TransportRequest) -> Result<TransportResponse> + Send + Sync + 'static,
    {
      Arc::new(Self {
        handler: Box::new(handler),
        delay,
        calls: AtomicUsize::new(0),
        requests: Mutex::new(Vec::new()),
      })
    }

    pub fn calls(&self) -> usize {
      self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
      self.requests.lock().clone()
    }
  }

  #[async_trait]
  impl Transport for MockTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      self.requests.lock().push(request.clone());
      if !self.delay.is_zero() {
        tokio::time::sleep(self.delay).await;
      }
      (self.handler)(&request)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_method_parsing() {
    assert_eq!("get".parse::<Method>(), Ok(Method::Get));
    assert_eq!("PATCH".parse::<Method>(), Ok(Method::Patch));
    assert!("TRACE".parse::<Method>().is_err());
    assert!(!Method::Get.is_mutation());
    assert!(Method::Delete.is_mutation());
  }

  #[test]
  fn test_decode_body() {
    assert_eq!(decode_body(b""), Value::Null);
    assert_eq!(decode_body(b"  \n"), Value::Null);
    assert_eq!(decode_body(br#"{"a":1}"#), json!({"a": 1}));
    assert_eq!(decode_body(b"plain text"), json!("plain text"));
  }

  #[test]
  fn test_error_message_prefers_body() {
    let response = TransportResponse::new(422, json!({"message": "name is required"}));
    assert_eq!(response.error_message(), "name is required");

    let response = TransportResponse::new(404, Value::Null);
    assert_eq!(response.error_message(), "Not Found");
  }
}
