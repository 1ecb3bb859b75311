use crate::transport::TransportError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// The partner's synchronous answer. An empty body means no reply was sent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SenderResponse {
    pub status: u16,
    pub content: Vec<u8>,
    pub content_type: Option<String>,
}

impl SenderResponse {
    pub fn has_content(&self) -> bool {
        !self.content.is_empty()
    }
}

/// Outbound transport for encoded AS4 messages.
#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(
        &self,
        url: &str,
        content: Vec<u8>,
        content_type: &str,
        timeout: Duration,
    ) -> Result<SenderResponse, TransportError>;
}

/// Stand-in used when the crate is built without an outbound transport.
#[derive(Debug, Default)]
pub struct UnavailableSender;

#[async_trait]
impl MessageSender for UnavailableSender {
    async fn send(
        &self,
        url: &str,
        _content: Vec<u8>,
        _content_type: &str,
        _timeout: Duration,
    ) -> Result<SenderResponse, TransportError> {
        Err(TransportError::Unavailable(format!(
            "no outbound transport compiled in for `{url}`"
        )))
    }
}

#[cfg(feature = "http-out")]
pub fn default_sender() -> Arc<dyn MessageSender> {
    Arc::new(crate::transport::http_client::HttpSender::new())
}

#[cfg(not(feature = "http-out"))]
pub fn default_sender() -> Arc<dyn MessageSender> {
    Arc::new(UnavailableSender)
}
