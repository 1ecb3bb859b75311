#![forbid(unsafe_code)]

use crate::transport::sender::{MessageSender, SenderResponse};
use crate::transport::TransportError;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::{Duration, Instant};

/// Posts encoded messages to partner endpoints with reqwest.
#[derive(Clone, Debug, Default)]
pub struct HttpSender {
    client: Client,
}

impl HttpSender {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

pub(crate) fn map_request_error(url: &str, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            url: url.to_string(),
        }
    } else {
        TransportError::Request {
            url: url.to_string(),
            reason: err.to_string(),
        }
    }
}

/// POSTs `content` and fails on any non-2xx answer.
pub(crate) async fn post(
    client: &Client,
    url: &str,
    content: Vec<u8>,
    content_type: &str,
    timeout: Duration,
) -> Result<SenderResponse, TransportError> {
    let started = Instant::now();
    let response = client
        .post(url)
        .header(CONTENT_TYPE, content_type)
        .timeout(timeout)
        .body(content)
        .send()
        .await
        .map_err(|err| map_request_error(url, err))?;

    let status = response.status().as_u16();
    if !response.status().is_success() {
        tracing::debug!(url = url, status = status, "partner rejected request");
        return Err(TransportError::Status {
            url: url.to_string(),
            status,
        });
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let bytes = response
        .bytes()
        .await
        .map_err(|err| map_request_error(url, err))?;

    tracing::debug!(
        url = url,
        status = status,
        bytes = bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "http exchange completed"
    );

    Ok(SenderResponse {
        status,
        content: bytes.to_vec(),
        content_type,
    })
}

#[async_trait]
impl MessageSender for HttpSender {
    async fn send(
        &self,
        url: &str,
        content: Vec<u8>,
        content_type: &str,
        timeout: Duration,
    ) -> Result<SenderResponse, TransportError> {
        post(&self.client, url, content, content_type, timeout).await
    }
}
