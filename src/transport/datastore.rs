//! Repository polling receiver. Each poll claims work by moving records from
//! their "to be" operation to the in-progress one, so concurrent pollers never
//! hand the same record to two agents.

use crate::app_context::AppContext;
use crate::domain::{MessageOrigin, ReceivedMessage};
use crate::model::{Direction, Operation};
use crate::store::{OutMessageFilter, RepositoryError};
use crate::transport::runtime::{sleep_with_shutdown, ReceiverControl};
use crate::transport::{MessageHandler, Receiver, ReceiverKind, TransportError};
use async_trait::async_trait;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_BATCH_SIZE: usize = 20;

/// Content type of messages whose only content is the record key.
pub const RECORD_CONTENT_TYPE: &str = "application/x-as4-record";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DatastoreSource {
    /// Out messages waiting to be pushed.
    SendQueue { filter: OutMessageFilter },
    /// Received user messages waiting for the business application.
    DeliverQueue,
    /// Received receipts and errors the producer asked to hear about.
    NotifySignals,
    /// Exception records flagged for notification.
    NotifyExceptions { direction: Option<Direction> },
    /// Retry records whose due time passed.
    DueRetries,
}

impl Display for DatastoreSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DatastoreSource::SendQueue { .. } => f.write_str("send_queue"),
            DatastoreSource::DeliverQueue => f.write_str("deliver_queue"),
            DatastoreSource::NotifySignals => f.write_str("notify_signals"),
            DatastoreSource::NotifyExceptions { .. } => f.write_str("notify_exceptions"),
            DatastoreSource::DueRetries => f.write_str("due_retries"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatastoreOptions {
    pub sources: Vec<DatastoreSource>,
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl DatastoreOptions {
    pub fn new(sources: Vec<DatastoreSource>) -> Self {
        Self {
            sources,
            poll_interval: DEFAULT_POLL_INTERVAL,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

pub struct DatastoreReceiver {
    options: DatastoreOptions,
    app: Arc<AppContext>,
    control: ReceiverControl,
}

impl DatastoreReceiver {
    pub fn new(options: DatastoreOptions, app: Arc<AppContext>) -> Self {
        Self {
            options,
            app,
            control: ReceiverControl::new(),
        }
    }

    pub fn options(&self) -> &DatastoreOptions {
        &self.options
    }

    /// Claims one batch from `source`.
    pub async fn claim(&self, source: &DatastoreSource) -> Result<Vec<ReceivedMessage>, RepositoryError> {
        let repository = self.app.repository();
        let now = self.app.now();
        let limit = self.options.batch_size.max(1);

        let messages = match source {
            DatastoreSource::SendQueue { filter } => repository
                .claim_out_messages(Operation::ToBeSent, Operation::Sending, filter, limit, now)
                .await?
                .into_iter()
                .map(|row| {
                    ReceivedMessage::new(row.body, row.content_type).with_origin(
                        MessageOrigin::OutMessage {
                            ebms_message_id: row.ebms_message_id,
                        },
                    )
                })
                .collect(),
            DatastoreSource::DeliverQueue => repository
                .claim_in_messages(Operation::ToBeDelivered, Operation::Delivering, limit, now)
                .await?
                .into_iter()
                .map(|row| {
                    ReceivedMessage::new(row.body, row.content_type).with_origin(
                        MessageOrigin::InMessage {
                            ebms_message_id: row.ebms_message_id,
                        },
                    )
                })
                .collect(),
            DatastoreSource::NotifySignals => repository
                .claim_in_messages(Operation::ToBeNotified, Operation::Notifying, limit, now)
                .await?
                .into_iter()
                .map(|row| {
                    ReceivedMessage::new(row.body, row.content_type).with_origin(
                        MessageOrigin::InMessage {
                            ebms_message_id: row.ebms_message_id,
                        },
                    )
                })
                .collect(),
            DatastoreSource::NotifyExceptions { direction } => repository
                .claim_exceptions(
                    *direction,
                    Operation::ToBeNotified,
                    Operation::Notifying,
                    limit,
                    now,
                )
                .await?
                .into_iter()
                .map(|row| {
                    ReceivedMessage::new(row.id.clone().into_bytes(), RECORD_CONTENT_TYPE)
                        .with_origin(MessageOrigin::Exception { id: row.id })
                })
                .collect(),
            DatastoreSource::DueRetries => repository
                .due_retries(now, limit)
                .await?
                .into_iter()
                .map(|row| {
                    let key = row.key();
                    ReceivedMessage::new(key.clone().into_bytes(), RECORD_CONTENT_TYPE)
                        .with_origin(MessageOrigin::RetryRecord { key })
                })
                .collect(),
        };
        Ok(messages)
    }

    /// One pass over every source. Returns true when some source filled a
    /// whole batch, meaning more work may be waiting.
    pub async fn poll_once(&self, handler: &dyn MessageHandler) -> bool {
        let mut saturated = false;
        for source in &self.options.sources {
            match self.claim(source).await {
                Ok(messages) => {
                    saturated |= messages.len() >= self.options.batch_size.max(1);
                    for message in messages {
                        handler.handle(message).await;
                    }
                }
                Err(err) => {
                    crate::as4_event!(
                        warn,
                        "datastore_poll_failed",
                        agent = handler.name(),
                        source = source,
                        error = err
                    );
                }
            }
        }
        saturated
    }
}

#[async_trait]
impl Receiver for DatastoreReceiver {
    fn kind(&self) -> ReceiverKind {
        ReceiverKind::Datastore
    }

    async fn start_receiving(
        &self,
        handler: Arc<dyn MessageHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let token = self.control.begin(&shutdown);
        let sources: Vec<String> = self.options.sources.iter().map(ToString::to_string).collect();
        crate::as4_event!(
            info,
            "receiver_started",
            agent = handler.name(),
            sources = sources.join(",")
        );

        while !token.is_cancelled() {
            if self.poll_once(handler.as_ref()).await {
                tokio::task::yield_now().await;
                continue;
            }
            if sleep_with_shutdown(self.options.poll_interval, &token).await {
                break;
            }
        }
        Ok(())
    }

    fn stop_receiving(&self) {
        self.control.stop();
    }
}
