use as4_engine::agent::defaults::{default_steps, default_transformer};
use as4_engine::agent::{AgentKind, AgentProcessor};
use as4_engine::app_context::AppContext;
use as4_engine::domain::ReceivedMessage;
use as4_engine::model::{
    As4Message, Attachment, CollaborationInfo, MessageInfo, MessageUnit, Party, PartInfo, Service,
    UserMessage,
};
use as4_engine::pipeline::{ComponentRegistry, Pipeline, StepConfiguration};
use as4_engine::pmode::{PModeSnapshot, PModeStore, ReceivingPMode};
use as4_engine::store::InMemoryRepository;
use as4_engine::transport::MessageHandler;
use criterion::{criterion_group, criterion_main, Criterion};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const SERVICE: &str = "urn:as4:bench:invoicing";
const ACTION: &str = "StoreInvoice";

fn receive_processor() -> (Arc<AppContext>, Arc<AgentProcessor>) {
    let mut pmode = ReceivingPMode::new("bench-in");
    pmode.message_packaging.collaboration.service = Some(Service::new(SERVICE));
    pmode.message_packaging.collaboration.action = Some(ACTION.to_string());
    let app = AppContext::builder()
        .repository(Arc::new(InMemoryRepository::new()))
        .pmodes(Arc::new(PModeStore::new(PModeSnapshot::new(
            Vec::new(),
            vec![pmode],
        ))))
        .build();

    let registry = ComponentRegistry::builtin();
    let kind = AgentKind::Receive;
    let steps = default_steps(kind);
    let pipeline = Pipeline::new(
        "bench-receive",
        StepConfiguration::new(
            registry.steps(&steps.normal).expect("default steps"),
            registry.steps(&steps.error).expect("default error steps"),
        ),
    );
    let transformer = registry
        .transformer(default_transformer(kind))
        .expect("default transformer");
    let processor =
        AgentProcessor::new("bench-receive", kind, transformer, pipeline, Arc::clone(&app));
    (app, Arc::new(processor))
}

fn user_message(id: &str) -> As4Message {
    let user = UserMessage {
        info: MessageInfo::new(id, chrono::Utc::now()),
        mpc: None,
        from: Party::new("http://as4.test/sender", "org:sender"),
        to: Party::new("http://as4.test/receiver", "org:receiver"),
        collaboration: CollaborationInfo {
            service: Service::new(SERVICE),
            action: ACTION.to_string(),
            conversation_id: "1".to_string(),
            ..CollaborationInfo::default()
        },
        message_properties: BTreeMap::new(),
        payload_info: vec![PartInfo {
            href: "cid:invoice".to_string(),
            properties: BTreeMap::new(),
        }],
    };
    As4Message::single(MessageUnit::User(user)).with_attachments(vec![Attachment {
        content_id: "invoice".to_string(),
        content_type: "application/xml".to_string(),
        content: vec![b'x'; 16 * 1024],
        properties: BTreeMap::new(),
    }])
}

fn bench_receive(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let (app, processor) = receive_processor();
    let sequence = AtomicU64::new(0);

    c.bench_function("receive_user_message", |b| {
        b.to_async(&runtime).iter(|| {
            let id = format!("bench-{}", sequence.fetch_add(1, Ordering::Relaxed));
            let (content, content_type) = app
                .codecs()
                .encode(&user_message(&id))
                .expect("message encodes");
            let processor = Arc::clone(&processor);
            async move {
                let reply = processor
                    .handle(ReceivedMessage::new(content, content_type))
                    .await;
                assert!(reply.is_success(), "{}", reply.outcome);
            }
        });
    });
}

criterion_group!(benches, bench_receive);
criterion_main!(benches);
