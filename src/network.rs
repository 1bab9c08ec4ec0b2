//! Network access behind a trait so strategies can be driven without sockets.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;

use crate::http::{Headers, Request, Response};

/// Anything that can turn a request into a response.
///
/// `Err` means the request never produced a response (offline, DNS, reset).
/// Error statuses are returned as `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Network backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("swgate/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| eyre!("Invalid header name {}: {}", name, e))?;
      let value =
        HeaderValue::from_str(value).map_err(|e| eyre!("Invalid header value: {}", e))?;
      headers.insert(name, value);
    }

    let mut builder = self
      .client
      .request(method, request.url.clone())
      .headers(headers);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status().as_u16();
    let headers: Headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
