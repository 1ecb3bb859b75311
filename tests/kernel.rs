mod common;

use as4_engine::agent::kernel::KernelError;
use as4_engine::agent::{build_agents, AgentKind, Kernel};
use as4_engine::config::AgentsConfig;
use as4_engine::model::OutStatus;
use as4_engine::pipeline::ComponentRegistry;
use as4_engine::transport::{ReceiverKind, TransportError};
use common::Node;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

const OUTBOX: &str = r#"
agents:
  - name: business-submit
    kind: submit
    receiver:
      type: queue
      options:
        queue: submit
  - name: outbox
    kind: send
    receiver:
      type: datastore
      options:
        source: send_queue
        poll_interval: 20ms
"#;

fn kernel_for(node: &Node, yaml: &str) -> Kernel {
    let registry = ComponentRegistry::builtin();
    let config = AgentsConfig::from_yaml_str(yaml, &registry).expect("agent settings parse");
    Kernel::new(build_agents(&config, &registry, &node.app).expect("agents build"))
}

#[tokio::test]
async fn configured_agents_carry_a_submission_to_the_partner() {
    let sender = Node::new(vec![common::sending_pmode("invoice-push")], Vec::new());
    let receiver = Node::new(Vec::new(), vec![common::receiving_pmode("invoice-in")]);
    sender
        .sender
        .connect(receiver.processor(AgentKind::Receive));

    let kernel = kernel_for(&sender, OUTBOX);
    let kinds: Vec<(AgentKind, ReceiverKind)> = kernel
        .agents()
        .iter()
        .map(|agent| (agent.kind(), agent.receiver().kind()))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (AgentKind::Submit, ReceiverKind::Queue),
            (AgentKind::Send, ReceiverKind::Datastore),
        ]
    );

    let handle = kernel.start(CancellationToken::new());
    assert_eq!(handle.running(), 2);

    let hub = sender.app.queues().clone();
    let reply = hub
        .request("submit", common::submit("invoice-push", "k-1"))
        .await
        .expect("submit agent answers");
    assert!(reply.is_success(), "{}", reply.outcome);

    let acknowledged = timeout(Duration::from_secs(5), async {
        loop {
            let done = sender
                .repository
                .out_messages()
                .iter()
                .any(|row| row.ebms_message_id == "k-1" && row.status == OutStatus::Ack);
            if done {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(acknowledged.is_ok(), "message was never acknowledged");
    assert_eq!(receiver.repository.in_messages().len(), 1);

    handle.join(Duration::from_secs(2)).await.unwrap();
    kernel.stop();

    let late = hub
        .send("submit", common::submit("invoice-push", "k-2"))
        .await;
    assert!(matches!(late, Err(TransportError::QueueClosed(_))));
}

#[tokio::test]
async fn failing_agent_is_reported_by_name() {
    let node = Node::new(vec![common::sending_pmode("invoice-push")], Vec::new());
    let kernel = kernel_for(
        &node,
        r#"
agents:
  - name: first
    kind: submit
    receiver:
      type: queue
      options:
        queue: shared
  - name: second
    kind: submit
    receiver:
      type: queue
      options:
        queue: shared
"#,
    );

    let shutdown = CancellationToken::new();
    let mut handle = kernel.start(shutdown.clone());
    let exit = timeout(Duration::from_secs(2), handle.next_exit())
        .await
        .expect("one agent exits");

    match exit {
        Some(Err(KernelError::Agent { agent, source })) => {
            assert!(agent == "first" || agent == "second", "{agent}");
            assert!(matches!(source, TransportError::Unavailable(_)));
        }
        other => panic!("expected an agent failure, got {other:?}"),
    }
    assert_eq!(handle.running(), 1);

    shutdown.cancel();
    handle.join(Duration::from_secs(2)).await.unwrap();
}
