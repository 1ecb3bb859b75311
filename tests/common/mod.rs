#![allow(dead_code)]

use as4_engine::agent::defaults::{default_steps, default_transformer};
use as4_engine::agent::{AgentKind, AgentProcessor};
use as4_engine::app_context::AppContext;
use as4_engine::clock::ManualClock;
use as4_engine::domain::ReceivedMessage;
use as4_engine::model::{
    DeliverMessageEnvelope, NotifyMessageEnvelope, Party, Service, SubmitMessage, SubmitPayload,
};
use as4_engine::pipeline::{ComponentRegistry, Pipeline, StepConfiguration};
use as4_engine::pmode::{
    Method, PModeSnapshot, PModeStore, PushConfiguration, ReceivingPMode, SendingPMode,
};
use as4_engine::security::KeyringSecurityProvider;
use as4_engine::store::InMemoryRepository;
use as4_engine::transport::datastore::{DatastoreOptions, DatastoreReceiver, DatastoreSource};
use as4_engine::transport::sender::{MessageSender, SenderResponse};
use as4_engine::transport::sink::{DeliverSender, NotifySender, SinkError, SinkRegistry};
use as4_engine::transport::{MessageHandler, TransportError};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::{TimeZone, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PARTNER_URL: &str = "http://partner.test/as4";
pub const RECORD_METHOD: &str = "RECORD";
pub const SERVICE: &str = "urn:as4:test:invoicing";
pub const ACTION: &str = "StoreInvoice";
pub const INVOICE: &[u8] = b"<invoice number=\"42\"/>";

pub fn sender_party() -> Party {
    Party::new("http://as4.test/sender", "org:sender")
}

pub fn receiver_party() -> Party {
    Party::new("http://as4.test/receiver", "org:receiver")
}

pub fn sending_pmode(id: &str) -> SendingPMode {
    let mut pmode = SendingPMode::new(id);
    pmode.push_configuration = Some(PushConfiguration {
        url: PARTNER_URL.to_string(),
        timeout: None,
    });
    pmode.message_packaging.party_info.from = Some(sender_party());
    pmode.message_packaging.party_info.to = Some(receiver_party());
    pmode.message_packaging.collaboration.service = Some(Service::new(SERVICE));
    pmode.message_packaging.collaboration.action = Some(ACTION.to_string());
    pmode
}

pub fn receiving_pmode(id: &str) -> ReceivingPMode {
    let mut pmode = ReceivingPMode::new(id);
    pmode.message_packaging.collaboration.service = Some(Service::new(SERVICE));
    pmode.message_packaging.collaboration.action = Some(ACTION.to_string());
    pmode.message_handling.deliver.enabled = true;
    pmode.message_handling.deliver.method = Some(Method::new(RECORD_METHOD));
    pmode
}

pub fn submit(pmode_id: &str, message_id: &str) -> ReceivedMessage {
    let message = SubmitMessage::for_pmode(pmode_id)
        .with_message_id(message_id)
        .with_payload(SubmitPayload {
            id: "invoice".to_string(),
            mime_type: "application/xml".to_string(),
            content: Some(BASE64_STANDARD.encode(INVOICE)),
            ..SubmitPayload::default()
        });
    let content = serde_json::to_vec(&message).expect("submit message serializes");
    ReceivedMessage::new(content, "application/json")
}

/// Deliver and notify sink that keeps every envelope it is handed.
#[derive(Default)]
pub struct RecordingSink {
    delivered: Mutex<Vec<DeliverMessageEnvelope>>,
    notified: Mutex<Vec<NotifyMessageEnvelope>>,
    failing: Mutex<bool>,
}

impl RecordingSink {
    pub fn delivered(&self) -> Vec<DeliverMessageEnvelope> {
        self.delivered.lock().unwrap().clone()
    }

    pub fn notified(&self) -> Vec<NotifyMessageEnvelope> {
        self.notified.lock().unwrap().clone()
    }

    pub fn fail_from_now_on(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }

    fn check(&self) -> Result<(), SinkError> {
        if *self.failing.lock().unwrap() {
            return Err(SinkError::Transport(TransportError::Unavailable(
                "recording sink switched off".to_string(),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliverSender for RecordingSink {
    async fn deliver(
        &self,
        envelope: &DeliverMessageEnvelope,
        _method: &Method,
    ) -> Result<(), SinkError> {
        self.check()?;
        self.delivered.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

#[async_trait]
impl NotifySender for RecordingSink {
    async fn notify(
        &self,
        envelope: &NotifyMessageEnvelope,
        _method: &Method,
    ) -> Result<(), SinkError> {
        self.check()?;
        self.notified.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Hands every outbound message straight to the partner's agent and returns
/// its synchronous reply, as an HTTP exchange would.
#[derive(Default)]
pub struct LoopbackSender {
    partner: Mutex<Option<Arc<dyn MessageHandler>>>,
    sent: Mutex<Vec<String>>,
}

impl LoopbackSender {
    pub fn connect(&self, partner: Arc<dyn MessageHandler>) {
        *self.partner.lock().unwrap() = Some(partner);
    }

    pub fn disconnect(&self) {
        self.partner.lock().unwrap().take();
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSender for LoopbackSender {
    async fn send(
        &self,
        url: &str,
        content: Vec<u8>,
        content_type: &str,
        _timeout: Duration,
    ) -> Result<SenderResponse, TransportError> {
        let partner = self.partner.lock().unwrap().clone();
        let Some(partner) = partner else {
            return Err(TransportError::Request {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        };
        self.sent.lock().unwrap().push(url.to_string());
        let reply = partner
            .handle(ReceivedMessage::new(content, content_type))
            .await;
        Ok(match reply.response {
            Some(response) => SenderResponse {
                status: 200,
                content: response.content,
                content_type: Some(response.content_type),
            },
            None => SenderResponse {
                status: 202,
                content: Vec::new(),
                content_type: None,
            },
        })
    }
}

/// One MSH: its own repository, PModes, clock and sinks.
pub struct Node {
    pub app: Arc<AppContext>,
    pub repository: Arc<InMemoryRepository>,
    pub clock: Arc<ManualClock>,
    pub sink: Arc<RecordingSink>,
    pub sender: Arc<LoopbackSender>,
}

impl Node {
    pub fn new(sending: Vec<SendingPMode>, receiving: Vec<ReceivingPMode>) -> Self {
        Self::with_security(sending, receiving, KeyringSecurityProvider::new())
    }

    pub fn with_security(
        sending: Vec<SendingPMode>,
        receiving: Vec<ReceivingPMode>,
        security: KeyringSecurityProvider,
    ) -> Self {
        let repository = Arc::new(InMemoryRepository::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
        ));
        let sink = Arc::new(RecordingSink::default());
        let sender = Arc::new(LoopbackSender::default());

        let mut sinks = SinkRegistry::with_defaults();
        sinks.register_deliver(RECORD_METHOD, sink.clone());
        sinks.register_notify(RECORD_METHOD, sink.clone());

        let app = AppContext::builder()
            .repository(repository.clone())
            .pmodes(Arc::new(PModeStore::new(PModeSnapshot::new(
                sending, receiving,
            ))))
            .sender(sender.clone())
            .security(Arc::new(security))
            .sinks(sinks)
            .clock(clock.clone())
            .build();

        Self {
            app,
            repository,
            clock,
            sink,
            sender,
        }
    }

    /// Processor wired exactly like the default agent of `kind`.
    pub fn processor(&self, kind: AgentKind) -> Arc<AgentProcessor> {
        let registry = ComponentRegistry::builtin();
        let steps = default_steps(kind);
        let pipeline = Pipeline::new(
            kind.as_str(),
            StepConfiguration::new(
                registry.steps(&steps.normal).expect("default steps resolve"),
                registry.steps(&steps.error).expect("default error steps resolve"),
            ),
        );
        let transformer = registry
            .transformer(default_transformer(kind))
            .expect("default transformer resolves");
        Arc::new(AgentProcessor::new(
            kind.as_str(),
            kind,
            transformer,
            pipeline,
            Arc::clone(&self.app),
        ))
    }

    /// Claims one batch from `source` and runs it through `handler`.
    pub async fn drain(&self, source: DatastoreSource, handler: &dyn MessageHandler) -> usize {
        let receiver =
            DatastoreReceiver::new(DatastoreOptions::new(vec![source]), Arc::clone(&self.app));
        let claimed = receiver
            .claim(&receiver.options().sources[0])
            .await
            .expect("claim succeeds");
        let count = claimed.len();
        for message in claimed {
            handler.handle(message).await;
        }
        count
    }
}

pub fn send_queue() -> DatastoreSource {
    DatastoreSource::SendQueue {
        filter: as4_engine::store::OutMessageFilter::push(),
    }
}
