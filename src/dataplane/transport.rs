//! Request/response primitive against the proxy's configuration API.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::time::Duration;

use crate::dataplane::types::{DataplaneError, DataplaneResult};

/// One round trip against the configuration store.
///
/// Returns `Value::Null` when the store answers without a body.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> DataplaneResult<Value>;
}

/// HTTP transport with basic authentication.
#[derive(Clone)]
pub struct HttpTransport {
    addr: String,
    username: String,
    password: String,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(
        addr: &str,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> DataplaneResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            addr: addr.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
            client,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, method: Method, path: &str, body: Option<Value>) -> DataplaneResult<Value> {
        tracing::debug!(method = %method, path = %path, "Sending dataplane request");

        let mut request = self
            .client
            .request(method.clone(), format!("{}{}", self.addr, path))
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;

        if status.as_u16() >= 400 {
            return Err(DataplaneError::Status {
                method: method.to_string(),
                path: path.to_string(),
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|e| DataplaneError::Decode(format!("error calling {} {}: {}", method, path, e)))
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("addr", &self.addr)
            .field("username", &self.username)
            .finish()
    }
}
