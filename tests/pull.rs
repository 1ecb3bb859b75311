mod common;

use as4_engine::agent::AgentKind;
use as4_engine::domain::{MessageOrigin, ReceivedMessage};
use as4_engine::model::{InStatus, Mep, Operation, OutStatus};
use as4_engine::pmode::{PullConfiguration, ReceivingPMode, SendingPMode};
use as4_engine::pull::{IntervalRequest, PModeRequest, PullSchedule};
use as4_engine::transport::datastore::{DatastoreSource, RECORD_CONTENT_TYPE};
use as4_engine::transport::MessageHandler;
use common::{Node, INVOICE, PARTNER_URL};
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MPC: &str = "urn:as4:mpc:invoices";

/// The party holding messages until they are pulled.
fn holder() -> Node {
    let mut pmode = common::sending_pmode("invoice-pull");
    pmode.push_configuration = None;
    pmode.mep_binding = Mep::Pull;
    pmode.message_packaging.mpc = Some(MPC.to_string());
    Node::new(vec![pmode], Vec::new())
}

/// The party polling the holder's partition.
fn puller() -> Node {
    let mut request = SendingPMode::new("puller");
    request.push_configuration = common::sending_pmode("unused").push_configuration;
    request.mep_binding = Mep::Pull;
    request.message_packaging.mpc = Some(MPC.to_string());
    request.pull_configuration = Some(PullConfiguration {
        min_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(30),
        factor: 2.0,
    });

    let mut receipts = SendingPMode::new("receipts-back");
    receipts.push_configuration = request.push_configuration.clone();

    let mut receiving: ReceivingPMode = common::receiving_pmode("invoice-in");
    receiving.reply_handling.sending_pmode = Some("receipts-back".to_string());
    Node::new(vec![request, receipts], vec![receiving])
}

fn pull_tick(pmode_id: &str) -> ReceivedMessage {
    ReceivedMessage::new(pmode_id.as_bytes().to_vec(), RECORD_CONTENT_TYPE).with_origin(
        MessageOrigin::PullSchedule {
            pmode_id: pmode_id.to_string(),
        },
    )
}

#[tokio::test]
async fn pulled_message_is_delivered_and_receipted_back() {
    let holder = holder();
    let puller = puller();
    holder
        .processor(AgentKind::Submit)
        .handle(common::submit("invoice-pull", "pull-1"))
        .await;
    let queued = holder.repository.out_messages();
    assert_eq!(queued[0].mep, Mep::Pull);
    assert_eq!(queued[0].operation, Operation::ToBeSent);

    puller
        .sender
        .connect(holder.processor(AgentKind::PullSend));
    let reply = puller
        .processor(AgentKind::PullReceive)
        .handle(pull_tick("puller"))
        .await;

    assert!(reply.is_success(), "{}", reply.outcome);
    assert!(reply.summary.is_exchange());
    assert_eq!(holder.repository.out_messages()[0].status, OutStatus::Sent);

    let stored = puller.repository.in_messages();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].ebms_message_id, "pull-1");
    assert_eq!(stored[0].operation, Operation::ToBeDelivered);

    let deliver = puller.processor(AgentKind::Deliver);
    assert_eq!(puller.drain(DatastoreSource::DeliverQueue, &*deliver).await, 1);
    assert_eq!(puller.sink.delivered()[0].attachments[0].content, INVOICE);
    assert_eq!(puller.repository.in_messages()[0].status, InStatus::Delivered);

    puller.sender.disconnect();
    puller
        .sender
        .connect(holder.processor(AgentKind::Receive));
    let send = puller.processor(AgentKind::Send);
    assert_eq!(puller.drain(common::send_queue(), &*send).await, 1);
    assert_eq!(puller.sender.sent().last().map(String::as_str), Some(PARTNER_URL));
    assert_eq!(holder.repository.out_messages()[0].status, OutStatus::Ack);
}

#[tokio::test]
async fn empty_partition_ends_the_pull_quietly() {
    let holder = holder();
    let puller = puller();
    puller
        .sender
        .connect(holder.processor(AgentKind::PullSend));

    let reply = puller
        .processor(AgentKind::PullReceive)
        .handle(pull_tick("puller"))
        .await;

    assert!(reply.is_success(), "{}", reply.outcome);
    assert!(!reply.summary.is_exchange());
    assert!(puller.repository.in_messages().is_empty());
    assert!(puller.repository.exceptions().is_empty());
    assert!(holder.repository.exceptions().is_empty());
}

#[tokio::test]
async fn unreachable_holder_is_not_a_message_exception() {
    let puller = puller();

    let reply = puller
        .processor(AgentKind::PullReceive)
        .handle(pull_tick("puller"))
        .await;

    assert!(!reply.is_success());
    assert!(puller.repository.exceptions().is_empty());
}

#[tokio::test]
async fn messages_on_another_partition_stay_queued() {
    let holder = holder();
    holder
        .processor(AgentKind::Submit)
        .handle(common::submit("invoice-pull", "pull-2"))
        .await;

    let mut other = SendingPMode::new("other-puller");
    other.push_configuration = common::sending_pmode("unused").push_configuration;
    other.message_packaging.mpc = Some("urn:as4:mpc:elsewhere".to_string());
    let puller = Node::new(vec![other], Vec::new());
    puller
        .sender
        .connect(holder.processor(AgentKind::PullSend));

    let reply = puller
        .processor(AgentKind::PullReceive)
        .handle(pull_tick("other-puller"))
        .await;

    assert!(!reply.summary.is_exchange());
    let queued = holder.repository.out_messages();
    assert_eq!(queued[0].status, OutStatus::Submitted);
    assert_eq!(queued[0].operation, Operation::ToBeSent);
}

#[test]
fn idle_polls_back_off_and_an_exchange_resets() {
    let mut pmode = SendingPMode::new("puller");
    pmode.pull_configuration = Some(PullConfiguration {
        min_interval: Duration::from_secs(1),
        max_interval: Duration::from_secs(5),
        factor: 2.0,
    });
    let request = PModeRequest::for_pmode(Arc::new(pmode)).unwrap();
    let start = Instant::now();
    let mut schedule = PullSchedule::new(vec![request], start);

    let mut waits = Vec::new();
    let mut now = start;
    for _ in 0..4 {
        let index = schedule.pop_due(now).unwrap();
        let wait = schedule.complete(index, false, now).unwrap();
        waits.push(wait.as_secs());
        now += wait;
    }
    assert_eq!(waits, vec![2, 4, 5, 5]);

    let index = schedule.pop_due(now).unwrap();
    assert_eq!(schedule.complete(index, true, now), Some(Duration::from_secs(1)));
    assert!(schedule.pop_due(now).is_none());
    assert_eq!(schedule.next_due(), Some(now + Duration::from_secs(1)));
}

#[test]
fn pmode_without_pull_cadence_is_not_scheduled() {
    assert!(PModeRequest::for_pmode(Arc::new(SendingPMode::new("push-only"))).is_none());
}

proptest! {
    #[test]
    fn interval_grows_monotonically_up_to_the_cap(
        min_ms in 1u64..2_000,
        extra_ms in 0u64..60_000,
        factor in 1.0f64..3.0,
        polls in 1usize..40,
    ) {
        let max = Duration::from_millis(min_ms + extra_ms);
        let mut request = IntervalRequest::new(Duration::from_millis(min_ms), max, factor);
        let mut previous = request.current_interval();
        for _ in 0..polls {
            request.calculate_new_interval();
            let current = request.current_interval();
            prop_assert!(current >= previous);
            prop_assert!(current <= max);
            previous = current;
        }
        request.reset_interval();
        prop_assert_eq!(request.current_interval(), Duration::from_millis(min_ms));
        prop_assert_eq!(request.runs(), 0);
    }
}
