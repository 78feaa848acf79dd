//! HTTP JSON sink.

use crate::cache::WindowData;
use crate::error::{AppResult, MonitorError};
use crate::output::Sink;
use crate::sample::Structure;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

/// Default request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct Payload<'a> {
    data: &'a WindowData,
    schema: &'a Structure,
}

/// POSTs `{"data": ..., "schema": ...}` to a fixed URL. Non-2xx is a failed send.
#[derive(Debug)]
pub struct HttpSink {
    name: String,
    url: String,
    timeout: Duration,
    headers: BTreeMap<String, String>,
    client: Option<reqwest::Client>,
}

impl HttpSink {
    /// Sink posting to `url`; nothing is checked until `connect`.
    pub fn new(name: impl Into<String>, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            timeout,
            headers: BTreeMap::new(),
            client: None,
        }
    }

    /// Extra headers sent with every request.
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn error(&self, message: impl std::fmt::Display) -> MonitorError {
        MonitorError::Sink {
            sink: self.name.clone(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    fn kind(&self) -> &'static str {
        "http"
    }

    async fn connect(&mut self) -> AppResult<()> {
        reqwest::Url::parse(&self.url).map_err(|e| self.error(format!("invalid url '{}': {e}", self.url)))?;
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| self.error(e))?;
        self.client = Some(client);
        tracing::info!(sink = %self.name, url = %self.url, "HTTP sink ready");
        Ok(())
    }

    async fn send(&mut self, data: &WindowData, schema: &Structure) -> AppResult<bool> {
        let Some(client) = &self.client else {
            return Err(self.error("not connected"));
        };
        let mut request = client.post(&self.url).json(&Payload { data, schema });
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|e| self.error(e))?;

        if !response.status().is_success() {
            tracing::debug!(sink = %self.name, status = %response.status(), "HTTP sink rejected window");
            return Ok(false);
        }
        Ok(true)
    }

    async fn close(&mut self) {
        self.client = None;
    }
}
