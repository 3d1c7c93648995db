//! Default HTTP adapter: JSON request/response against a base endpoint.
//!
//! `connect` takes the base endpoint and optional default headers:
//!
//! ```json
//! { "baseUrl": "https://payments.internal/api", "headers": { "authorization": "Bearer ..." } }
//! ```
//!
//! `send` takes the request to make, relative to the base:
//!
//! ```json
//! { "endpoint": "/charges", "method": "POST", "body": { "amount": 500 } }
//! ```
//!
//! and returns the parsed JSON response (`null` for an empty body). The
//! most recent response can be pulled again with `receive`.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::adapter::Adapter;
use crate::error::EntangleError;

/// Default request timeout for the HTTP adapter.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Construction-time settings for [`HttpAdapter`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Base endpoint to start connected to, if any.
    pub base_url: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout: DEFAULT_HTTP_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectOptions {
    #[serde(alias = "base_url", alias = "url")]
    base_url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
}

/// A single outbound request, as accepted by [`HttpAdapter::send`].
#[derive(Debug, Clone, Deserialize)]
pub struct HttpRequest {
    /// Path relative to the base URL, or an absolute URL.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// JSON body; omitted when absent.
    #[serde(default)]
    pub body: Option<Value>,
}

fn default_method() -> String {
    "POST".to_string()
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    headers: HeaderMap,
}

impl Endpoint {
    fn new(base_url: String) -> Self {
        Self {
            base_url,
            headers: HeaderMap::new(),
        }
    }

    fn url_for(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        if endpoint.is_empty() {
            return self.base_url.clone();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            endpoint.trim_start_matches('/')
        )
    }
}

/// Request/response adapter over `reqwest`.
pub struct HttpAdapter {
    client: Client,
    endpoint: RwLock<Option<Endpoint>>,
    last_response: Mutex<Option<Value>>,
}

impl HttpAdapter {
    /// An unconnected adapter with a default client.
    pub fn new() -> Self {
        Self::with_client(Client::new())
    }

    /// An unconnected adapter using `client` (proxy, TLS and timeout
    /// settings come from the client).
    pub fn with_client(client: Client) -> Self {
        Self {
            client,
            endpoint: RwLock::new(None),
            last_response: Mutex::new(None),
        }
    }

    /// Build from settings; connected up front when `base_url` is set.
    pub fn from_config(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .context("Failed to build HTTP client")?;
        let adapter = Self::with_client(client);
        if let Some(base_url) = &config.base_url {
            *adapter.endpoint_mut() = Some(Endpoint::new(base_url.clone()));
        }
        Ok(adapter)
    }

    /// The configured base URL, if connected.
    pub fn base_url(&self) -> Option<String> {
        self.endpoint_ref().as_ref().map(|e| e.base_url.clone())
    }

    fn endpoint_ref(&self) -> std::sync::RwLockReadGuard<'_, Option<Endpoint>> {
        self.endpoint.read().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint_mut(&self) -> std::sync::RwLockWriteGuard<'_, Option<Endpoint>> {
        self.endpoint.write().unwrap_or_else(|e| e.into_inner())
    }

    fn parse_headers(headers: BTreeMap<String, String>) -> Result<HeaderMap, EntangleError> {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                EntangleError::invalid_request(format!("bad header name {name}: {e}"))
            })?;
            let value = HeaderValue::from_str(&value).map_err(|e| {
                EntangleError::invalid_request(format!("bad value for header {name}: {e}"))
            })?;
            map.insert(name, value);
        }
        Ok(map)
    }
}

impl Default for HttpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    async fn connect(&self, config: Value) -> Result<()> {
        let options: ConnectOptions = serde_json::from_value(config)
            .map_err(|e| EntangleError::invalid_request(format!("http connect config: {e}")))?;
        let headers = Self::parse_headers(options.headers)?;

        debug!(base_url = %options.base_url, "http adapter connected");
        *self.endpoint_mut() = Some(Endpoint {
            base_url: options.base_url,
            headers,
        });
        Ok(())
    }

    async fn send(&self, data: Value) -> Result<Value> {
        let request: HttpRequest = serde_json::from_value(data)
            .map_err(|e| EntangleError::invalid_request(format!("http request: {e}")))?;
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| EntangleError::invalid_request(format!("bad method {}", request.method)))?;

        let (url, headers) = {
            let endpoint = self.endpoint_ref();
            let endpoint = endpoint.as_ref().ok_or(EntangleError::NotConnected {
                adapter_type: "http",
            })?;
            (endpoint.url_for(&request.endpoint), endpoint.headers.clone())
        };

        debug!(%method, %url, "http adapter sending");

        let mut builder = self.client.request(method, &url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .with_context(|| format!("reading response from {url} failed"))?;

        if !status.is_success() {
            return Err(EntangleError::Http {
                status: status.as_u16(),
                body: text,
            }
            .into());
        }

        let value = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text)
                .with_context(|| format!("response from {url} was not JSON"))?
        };

        *self.last_response.lock().unwrap_or_else(|e| e.into_inner()) = Some(value.clone());
        Ok(value)
    }

    async fn receive(&self) -> Result<Value> {
        let last = self
            .last_response
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        Ok(last.unwrap_or(Value::Null))
    }
}

impl std::fmt::Debug for HttpAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpAdapter")
            .field("base_url", &self.base_url())
            .finish_non_exhaustive()
    }
}
