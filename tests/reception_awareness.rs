mod common;

use as4_engine::agent::AgentKind;
use as4_engine::model::{Direction, Operation, OutStatus};
use as4_engine::pmode::{ReplyPattern, SendingPMode};
use as4_engine::reliability::{ReliabilityState, RetryRecord, RetryType};
use as4_engine::transport::datastore::DatastoreSource;
use as4_engine::transport::MessageHandler;
use common::Node;
use std::time::Duration;

const INTERVAL: Duration = Duration::from_secs(10);

fn reliable(retries: u32) -> SendingPMode {
    let mut pmode = common::sending_pmode("invoice-push");
    let awareness = &mut pmode.reliability.reception_awareness;
    awareness.enabled = true;
    awareness.retry_count = retries;
    awareness.retry_interval = INTERVAL;
    awareness.max_retry_interval = Some(Duration::from_secs(60));
    awareness.factor = 2.0;
    pmode
}

fn send_record(node: &Node, subject: &str) -> RetryRecord {
    node.repository
        .retries()
        .into_iter()
        .find(|record| record.retry_type == RetryType::Send && record.subject == subject)
        .expect("send retry record")
}

async fn submit_and_send(node: &Node, message_id: &str) {
    let submit = node.processor(AgentKind::Submit);
    submit
        .handle(common::submit("invoice-push", message_id))
        .await;
    let send = node.processor(AgentKind::Send);
    assert_eq!(node.drain(common::send_queue(), &*send).await, 1);
}

async fn run_due_retries(node: &Node) -> usize {
    let awareness = node.processor(AgentKind::ReceptionAwareness);
    node.drain(DatastoreSource::DueRetries, &*awareness).await
}

#[tokio::test]
async fn unreachable_partner_is_retried_once_due() {
    let sender = Node::new(vec![reliable(3)], Vec::new());
    submit_and_send(&sender, "ra-1").await;

    let row = &sender.repository.out_messages()[0];
    assert_eq!(row.status, OutStatus::Submitted);
    assert_eq!(row.operation, Operation::ToBeRetried);
    let record = send_record(&sender, "ra-1");
    assert_eq!(record.state, ReliabilityState::RetryScheduled);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.as_deref().unwrap_or_default().contains("refused"));

    assert_eq!(record.current_interval, INTERVAL * 2);
    assert_eq!(run_due_retries(&sender).await, 0);
    sender.clock.advance(INTERVAL);
    assert_eq!(run_due_retries(&sender).await, 0);
    sender.clock.advance(INTERVAL);
    assert_eq!(run_due_retries(&sender).await, 1);
    assert_eq!(
        sender.repository.out_messages()[0].operation,
        Operation::ToBeSent
    );
    assert_eq!(send_record(&sender, "ra-1").state, ReliabilityState::Pending);

    let receiver = Node::new(Vec::new(), vec![common::receiving_pmode("invoice-in")]);
    sender
        .sender
        .connect(receiver.processor(AgentKind::Receive));
    let send = sender.processor(AgentKind::Send);
    assert_eq!(sender.drain(common::send_queue(), &*send).await, 1);

    assert_eq!(sender.repository.out_messages()[0].status, OutStatus::Ack);
    assert_eq!(send_record(&sender, "ra-1").state, ReliabilityState::Ack);
    assert!(sender.repository.exceptions().is_empty());
}

#[tokio::test]
async fn retries_are_given_up_once_exhausted() {
    let sender = Node::new(vec![reliable(2)], Vec::new());
    submit_and_send(&sender, "ra-2").await;

    sender.clock.advance(INTERVAL * 2);
    assert_eq!(run_due_retries(&sender).await, 1);
    let send = sender.processor(AgentKind::Send);
    assert_eq!(sender.drain(common::send_queue(), &*send).await, 1);

    let record = send_record(&sender, "ra-2");
    assert_eq!(record.state, ReliabilityState::Exhausted);
    assert_eq!(record.retry_count, 2);
    let row = &sender.repository.out_messages()[0];
    assert_eq!(row.status, OutStatus::Exception);
    let exceptions = sender.repository.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].direction, Direction::Out);
    assert_eq!(exceptions[0].ebms_ref_to_message_id.as_deref(), Some("ra-2"));

    sender.clock.advance(Duration::from_secs(600));
    assert_eq!(run_due_retries(&sender).await, 0);
}

#[tokio::test]
async fn missing_receipt_is_counted_and_late_receipt_settles_the_message() {
    let sender = Node::new(vec![reliable(3)], Vec::new());

    let mut receiving = common::receiving_pmode("invoice-in");
    receiving.reply_handling.reply_pattern = ReplyPattern::Callback;
    receiving.reply_handling.sending_pmode = Some("receipts-back".to_string());
    let mut callback = SendingPMode::new("receipts-back");
    callback.push_configuration = common::sending_pmode("unused").push_configuration;
    let receiver = Node::new(vec![callback], vec![receiving]);

    sender
        .sender
        .connect(receiver.processor(AgentKind::Receive));
    submit_and_send(&sender, "ra-3").await;

    assert_eq!(sender.repository.out_messages()[0].status, OutStatus::Sent);
    let record = send_record(&sender, "ra-3");
    assert_eq!(record.state, ReliabilityState::Sent);
    assert_eq!(record.retry_count, 0);

    sender.clock.advance(INTERVAL);
    assert_eq!(run_due_retries(&sender).await, 1);
    let record = send_record(&sender, "ra-3");
    assert_eq!(record.state, ReliabilityState::RetryScheduled);
    assert_eq!(record.retry_count, 1);
    assert!(record.last_error.unwrap_or_default().contains("no receipt"));
    assert_eq!(
        sender.repository.out_messages()[0].operation,
        Operation::ToBeRetried
    );

    receiver
        .sender
        .connect(sender.processor(AgentKind::Receive));
    let receiver_send = receiver.processor(AgentKind::Send);
    assert_eq!(
        receiver.drain(common::send_queue(), &*receiver_send).await,
        1
    );

    assert_eq!(sender.repository.out_messages()[0].status, OutStatus::Ack);
    assert_eq!(send_record(&sender, "ra-3").state, ReliabilityState::Ack);
    sender.clock.advance(Duration::from_secs(600));
    assert_eq!(run_due_retries(&sender).await, 0);
}
