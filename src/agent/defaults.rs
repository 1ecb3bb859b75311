//! Built-in wiring used when an agent's settings leave a part out.

use crate::agent::AgentKind;
use crate::pipeline::registry::{ReceiverOptions, StepSpec};

/// Normal and error step lists of an agent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepLists {
    pub normal: Vec<StepSpec>,
    pub error: Vec<StepSpec>,
}

fn plain(step: &str) -> StepSpec {
    StepSpec::plain(step)
}

fn when(step: &str, condition: &str) -> StepSpec {
    StepSpec::when(step, condition)
}

/// Everything a received bundle goes through once its PModes are known.
fn receive_tail() -> Vec<StepSpec> {
    vec![
        plain("determine_pmodes"),
        plain("validate_message"),
        plain("decrypt_message"),
        plain("verify_signature"),
        when("decompress_attachments", "has_user_messages"),
        plain("update_received_message"),
        plain("process_signals"),
        plain("create_receipt"),
        when("sign_message", "signing_enabled"),
        plain("send_signal_response"),
    ]
}

fn signal_error_steps() -> Vec<StepSpec> {
    vec![plain("create_error"), plain("send_signal_response")]
}

pub fn default_steps(kind: AgentKind) -> StepLists {
    match kind {
        AgentKind::Submit => StepLists {
            normal: vec![
                plain("retrieve_sending_pmode"),
                plain("create_user_message"),
                plain("store_out_message"),
            ],
            error: Vec::new(),
        },
        AgentKind::Send => StepLists {
            normal: vec![
                when("compress_attachments", "compression_enabled"),
                when("sign_message", "signing_enabled"),
                when("encrypt_message", "encryption_enabled"),
                plain("send_message"),
                plain("process_signals"),
            ],
            error: Vec::new(),
        },
        AgentKind::Receive => {
            let mut normal = vec![plain("save_received_message")];
            normal.extend(receive_tail());
            StepLists {
                normal,
                error: signal_error_steps(),
            }
        }
        AgentKind::Deliver => StepLists {
            normal: vec![plain("send_deliver_message")],
            error: Vec::new(),
        },
        AgentKind::Notify => StepLists {
            normal: vec![plain("send_notify_message")],
            error: Vec::new(),
        },
        AgentKind::PullReceive => {
            let mut normal = vec![
                when("sign_message", "signing_enabled"),
                plain("send_message"),
                plain("process_pull_response"),
            ];
            normal.extend(receive_tail());
            StepLists {
                normal,
                error: signal_error_steps(),
            }
        }
        AgentKind::PullSend => StepLists {
            normal: vec![
                plain("select_pulled_message"),
                when("compress_attachments", "compression_enabled"),
                when("sign_message", "signing_enabled"),
                when("encrypt_message", "encryption_enabled"),
                plain("send_signal_response"),
            ],
            error: signal_error_steps(),
        },
        AgentKind::ReceptionAwareness => StepLists {
            normal: vec![plain("handle_due_retry")],
            error: Vec::new(),
        },
    }
}

pub fn default_transformer(kind: AgentKind) -> &'static str {
    match kind {
        AgentKind::Submit => "submit",
        AgentKind::Send => "out_message",
        AgentKind::Receive | AgentKind::PullSend => "as4",
        AgentKind::Deliver => "deliver",
        AgentKind::Notify => "notify",
        AgentKind::PullReceive => "pull_request",
        AgentKind::ReceptionAwareness => "retry",
    }
}

/// Receiver for kinds fed from the datastore or a schedule. Kinds fed by a
/// partner or a business application have to name theirs.
pub fn default_receiver(kind: AgentKind) -> Option<(&'static str, ReceiverOptions)> {
    let datastore = |source: &str| {
        let mut options = ReceiverOptions::new();
        options.insert("source".to_string(), source.to_string());
        Some(("datastore", options))
    };
    match kind {
        AgentKind::Send => datastore("send_queue"),
        AgentKind::Deliver => datastore("deliver_queue"),
        AgentKind::Notify => datastore("notify_signals,notify_exceptions"),
        AgentKind::ReceptionAwareness => datastore("due_retries"),
        AgentKind::PullReceive => Some(("interval_pull", ReceiverOptions::new())),
        AgentKind::Submit | AgentKind::Receive | AgentKind::PullSend => None,
    }
}
