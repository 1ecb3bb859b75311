//! In-process channel receiver. Embedders and tests push `ReceivedMessage`s
//! into a named queue; the agent bound to that queue processes them in order.

use crate::domain::ReceivedMessage;
use crate::transport::runtime::ReceiverControl;
use crate::transport::{
    MessageHandler, ProcessingReply, Receiver, ReceiverKind, TransportError,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

pub struct QueueItem {
    pub message: ReceivedMessage,
    pub reply: Option<oneshot::Sender<ProcessingReply>>,
}

struct QueueSlot {
    sender: mpsc::Sender<QueueItem>,
    receiver: Option<mpsc::Receiver<QueueItem>>,
}

/// Named bounded channels shared between producers and queue receivers.
/// Either side may create a queue first.
#[derive(Clone)]
pub struct QueueHub {
    queues: Arc<Mutex<HashMap<String, QueueSlot>>>,
    capacity: usize,
}

impl Default for QueueHub {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }
}

impl QueueHub {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queues: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, name: &str) -> mpsc::Sender<QueueItem> {
        let mut queues = self.queues.lock().expect("queue hub poisoned");
        queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let (sender, receiver) = mpsc::channel(self.capacity);
                QueueSlot {
                    sender,
                    receiver: Some(receiver),
                }
            })
            .sender
            .clone()
    }

    /// Hands out the consuming end once; a second receiver on the same name gets `None`.
    pub fn take_receiver(&self, name: &str) -> Option<mpsc::Receiver<QueueItem>> {
        self.sender(name);
        let mut queues = self.queues.lock().expect("queue hub poisoned");
        queues.get_mut(name).and_then(|slot| slot.receiver.take())
    }

    /// Fire-and-forget enqueue.
    pub async fn send(&self, name: &str, message: ReceivedMessage) -> Result<(), TransportError> {
        self.sender(name)
            .send(QueueItem {
                message,
                reply: None,
            })
            .await
            .map_err(|_| TransportError::QueueClosed(name.to_string()))
    }

    /// Enqueues and waits for the agent's reply.
    pub async fn request(
        &self,
        name: &str,
        message: ReceivedMessage,
    ) -> Result<ProcessingReply, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender(name)
            .send(QueueItem {
                message,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| TransportError::QueueClosed(name.to_string()))?;
        reply_rx
            .await
            .map_err(|_| TransportError::QueueClosed(name.to_string()))
    }

    pub fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().expect("queue hub poisoned");
        let mut names: Vec<String> = queues.keys().cloned().collect();
        names.sort();
        names
    }
}

pub struct QueueReceiver {
    name: String,
    hub: QueueHub,
    control: ReceiverControl,
}

impl QueueReceiver {
    pub fn new(name: impl Into<String>, hub: QueueHub) -> Self {
        Self {
            name: name.into(),
            hub,
            control: ReceiverControl::new(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl Receiver for QueueReceiver {
    fn kind(&self) -> ReceiverKind {
        ReceiverKind::Queue
    }

    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let token = self.control.begin(&shutdown);
        let Some(mut receiver) = self.hub.take_receiver(&self.name) else {
            return Err(TransportError::Unavailable(format!(
                "queue `{}` already has a receiver",
                self.name
            )));
        };

        crate::as4_event!(info, "receiver_started", agent = handler.name(), queue = self.name);
        loop {
            let item = tokio::select! {
                _ = token.cancelled() => break,
                item = receiver.recv() => item,
            };
            let Some(QueueItem { message, reply }) = item else {
                break;
            };
            let outcome = handler.handle(message).await;
            if let Some(reply) = reply {
                // The requester may have given up waiting.
                let _ = reply.send(outcome);
            }
        }
        crate::as4_event!(debug, "receiver_stopped", agent = handler.name(), queue = self.name);
        Ok(())
    }

    fn stop_receiving(&self) {
        self.control.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::runner::PipelineOutcome;
    use crate::transport::ExchangeSummary;

    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn handle(&self, message: ReceivedMessage) -> ProcessingReply {
            ProcessingReply {
                outcome: PipelineOutcome::Completed,
                response: Some(crate::pipeline::context::ReplyContent {
                    content: message.content,
                    content_type: message.content_type,
                }),
                summary: ExchangeSummary::default(),
            }
        }
    }

    #[tokio::test]
    async fn request_receives_the_handler_reply() {
        let hub = QueueHub::default();
        let receiver = Arc::new(QueueReceiver::new("submit", hub.clone()));
        let shutdown = CancellationToken::new();
        let task = {
            let receiver = receiver.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { receiver.start_receiving(Arc::new(Echo), shutdown).await })
        };

        let reply = hub
            .request("submit", ReceivedMessage::new(b"ping".to_vec(), "text/plain"))
            .await
            .unwrap();
        assert_eq!(reply.response.unwrap().content, b"ping".to_vec());

        receiver.stop_receiving();
        task.await.unwrap().unwrap();
        assert!(!shutdown.is_cancelled());
    }

    #[test]
    fn receiving_end_is_handed_out_once() {
        let hub = QueueHub::default();
        assert!(hub.take_receiver("q").is_some());
        assert!(hub.take_receiver("q").is_none());
        assert_eq!(hub.queue_names(), vec!["q".to_string()]);
    }
}
