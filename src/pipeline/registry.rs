//! Explicit name → constructor tables for everything an agent settings file
//! can reference. Settings are validated against these keys before anything
//! is built.

use crate::app_context::AppContext;
use crate::model::Direction;
use crate::pipeline::step::{self, conditions, Condition, ConditionalStep, Step};
use crate::store::OutMessageFilter;
use crate::transformer::{
    As4Transformer, DeliverTransformer, NotifyTransformer, OutMessageTransformer,
    PullRequestTransformer, RetryTransformer, SubmitTransformer, Transformer,
};
use crate::transport::datastore::{DatastoreOptions, DatastoreReceiver, DatastoreSource};
use crate::transport::file_system::{FileSystemOptions, FileSystemReceiver};
use crate::transport::interval_pull::{IntervalPullOptions, IntervalPullReceiver};
use crate::transport::queue::QueueReceiver;
use crate::transport::Receiver;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Receiver options as written in the settings file.
pub type ReceiverOptions = BTreeMap<String, String>;

pub type ReceiverFactory =
    fn(&ReceiverOptions, &Arc<AppContext>) -> Result<Arc<dyn Receiver>, RegistryError>;
pub type TransformerFactory = fn() -> Arc<dyn Transformer>;
pub type StepFactory = fn() -> Arc<dyn Step>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown receiver `{0}`")]
    UnknownReceiver(String),
    #[error("unknown transformer `{0}`")]
    UnknownTransformer(String),
    #[error("unknown step `{0}`")]
    UnknownStep(String),
    #[error("unknown condition `{0}`")]
    UnknownCondition(String),
    #[error("receiver `{receiver}` requires option `{option}`")]
    MissingOption {
        receiver: &'static str,
        option: &'static str,
    },
    #[error("receiver `{receiver}` option `{option}`: {reason}")]
    InvalidOption {
        receiver: &'static str,
        option: &'static str,
        reason: String,
    },
}

/// One entry of a step list: the step, optionally guarded by a condition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StepSpec {
    pub step: String,
    pub condition: Option<String>,
    pub negate: bool,
}

impl StepSpec {
    pub fn plain(step: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            condition: None,
            negate: false,
        }
    }

    pub fn when(step: impl Into<String>, condition: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            condition: Some(condition.into()),
            negate: false,
        }
    }
}

#[derive(Clone, Default)]
pub struct ComponentRegistry {
    receivers: BTreeMap<String, ReceiverFactory>,
    transformers: BTreeMap<String, TransformerFactory>,
    steps: BTreeMap<String, StepFactory>,
    conditions: BTreeMap<String, Condition>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every receiver, transformer, step and condition the crate ships.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        registry.register_receiver("queue", queue_receiver);
        registry.register_receiver("file_system", file_system_receiver);
        registry.register_receiver("datastore", datastore_receiver);
        registry.register_receiver("interval_pull", interval_pull_receiver);
        #[cfg(feature = "http-in")]
        registry.register_receiver("http", http_receiver);

        registry.register_transformer("submit", || Arc::new(SubmitTransformer));
        registry.register_transformer("as4", || Arc::new(As4Transformer));
        registry.register_transformer("out_message", || Arc::new(OutMessageTransformer));
        registry.register_transformer("deliver", || Arc::new(DeliverTransformer));
        registry.register_transformer("notify", || Arc::new(NotifyTransformer));
        registry.register_transformer("pull_request", || Arc::new(PullRequestTransformer));
        registry.register_transformer("retry", || Arc::new(RetryTransformer));

        registry.register_step("retrieve_sending_pmode", || {
            Arc::new(step::pmode::RetrieveSendingPMode)
        });
        registry.register_step("create_user_message", || {
            Arc::new(step::submit::CreateUserMessage)
        });
        registry.register_step("store_out_message", || Arc::new(step::submit::StoreOutMessage));
        registry.register_step("compress_attachments", || {
            Arc::new(step::compression::CompressAttachments)
        });
        registry.register_step("decompress_attachments", || {
            Arc::new(step::compression::DecompressAttachments)
        });
        registry.register_step("sign_message", || Arc::new(step::security::SignMessage));
        registry.register_step("verify_signature", || Arc::new(step::security::VerifySignature));
        registry.register_step("encrypt_message", || Arc::new(step::security::EncryptMessage));
        registry.register_step("decrypt_message", || Arc::new(step::security::DecryptMessage));
        registry.register_step("determine_pmodes", || {
            Arc::new(step::pmode::DetermineReceivingPModes)
        });
        registry.register_step("validate_message", || Arc::new(step::pmode::ValidateMessage));
        registry.register_step("save_received_message", || {
            Arc::new(step::persistence::SaveReceivedMessage)
        });
        registry.register_step("update_received_message", || {
            Arc::new(step::persistence::UpdateReceivedMessage)
        });
        registry.register_step("process_signals", || Arc::new(step::signals::ProcessSignals));
        registry.register_step("create_receipt", || Arc::new(step::signals::CreateReceipt));
        registry.register_step("create_error", || Arc::new(step::signals::CreateError));
        registry.register_step("send_signal_response", || {
            Arc::new(step::signals::SendSignalResponse)
        });
        registry.register_step("send_message", || Arc::new(step::send::SendMessage));
        registry.register_step("process_pull_response", || {
            Arc::new(step::pull::ProcessPullResponse)
        });
        registry.register_step("select_pulled_message", || {
            Arc::new(step::pull::SelectPulledMessage)
        });
        registry.register_step("send_deliver_message", || {
            Arc::new(step::deliver::SendDeliverMessage)
        });
        registry.register_step("send_notify_message", || {
            Arc::new(step::notify::SendNotifyMessage)
        });
        registry.register_step("handle_due_retry", || Arc::new(step::retry::HandleDueRetry));

        registry.register_condition("signing_enabled", conditions::signing_enabled);
        registry.register_condition("encryption_enabled", conditions::encryption_enabled);
        registry.register_condition("compression_enabled", conditions::compression_enabled);
        registry.register_condition("message_signed", conditions::message_signed);
        registry.register_condition("message_encrypted", conditions::message_encrypted);
        registry.register_condition("has_user_messages", conditions::has_user_messages);
        registry.register_condition("has_signals", conditions::has_signals);

        registry
    }

    pub fn register_receiver(&mut self, key: &str, factory: ReceiverFactory) {
        self.receivers.insert(key.to_string(), factory);
    }

    pub fn register_transformer(&mut self, key: &str, factory: TransformerFactory) {
        self.transformers.insert(key.to_string(), factory);
    }

    pub fn register_step(&mut self, key: &str, factory: StepFactory) {
        self.steps.insert(key.to_string(), factory);
    }

    pub fn register_condition(&mut self, key: &str, condition: Condition) {
        self.conditions.insert(key.to_string(), condition);
    }

    pub fn has_receiver(&self, key: &str) -> bool {
        self.receivers.contains_key(key)
    }

    pub fn has_transformer(&self, key: &str) -> bool {
        self.transformers.contains_key(key)
    }

    pub fn has_step(&self, key: &str) -> bool {
        self.steps.contains_key(key)
    }

    pub fn has_condition(&self, key: &str) -> bool {
        self.conditions.contains_key(key)
    }

    pub fn receiver(
        &self,
        key: &str,
        options: &ReceiverOptions,
        app: &Arc<AppContext>,
    ) -> Result<Arc<dyn Receiver>, RegistryError> {
        let factory = self
            .receivers
            .get(key)
            .ok_or_else(|| RegistryError::UnknownReceiver(key.to_string()))?;
        factory(options, app)
    }

    pub fn transformer(&self, key: &str) -> Result<Arc<dyn Transformer>, RegistryError> {
        self.transformers
            .get(key)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::UnknownTransformer(key.to_string()))
    }

    pub fn step(&self, spec: &StepSpec) -> Result<Arc<dyn Step>, RegistryError> {
        let inner = self
            .steps
            .get(&spec.step)
            .map(|factory| factory())
            .ok_or_else(|| RegistryError::UnknownStep(spec.step.clone()))?;
        let Some(name) = &spec.condition else {
            return Ok(inner);
        };
        let condition = self
            .conditions
            .get(name)
            .copied()
            .ok_or_else(|| RegistryError::UnknownCondition(name.clone()))?;
        Ok(Arc::new(ConditionalStep::new(
            name.clone(),
            condition,
            spec.negate,
            inner,
        )))
    }

    pub fn steps(&self, specs: &[StepSpec]) -> Result<Vec<Arc<dyn Step>>, RegistryError> {
        specs.iter().map(|spec| self.step(spec)).collect()
    }

    pub fn receiver_keys(&self) -> Vec<&str> {
        self.receivers.keys().map(String::as_str).collect()
    }

    pub fn transformer_keys(&self) -> Vec<&str> {
        self.transformers.keys().map(String::as_str).collect()
    }

    pub fn step_keys(&self) -> Vec<&str> {
        self.steps.keys().map(String::as_str).collect()
    }

    pub fn condition_keys(&self) -> Vec<&str> {
        self.conditions.keys().map(String::as_str).collect()
    }
}

/// Options a built-in receiver refuses to start without.
pub fn required_options(receiver: &str) -> &'static [&'static str] {
    match receiver {
        "queue" => &["queue"],
        "file_system" => &["directory"],
        "datastore" => &["source"],
        "http" => &["address"],
        _ => &[],
    }
}

fn required<'a>(
    options: &'a ReceiverOptions,
    receiver: &'static str,
    option: &'static str,
) -> Result<&'a str, RegistryError> {
    options
        .get(option)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .ok_or(RegistryError::MissingOption { receiver, option })
}

fn duration_option(
    options: &ReceiverOptions,
    receiver: &'static str,
    option: &'static str,
) -> Result<Option<Duration>, RegistryError> {
    options
        .get(option)
        .map(|raw| {
            humantime::parse_duration(raw.trim()).map_err(|err| RegistryError::InvalidOption {
                receiver,
                option,
                reason: err.to_string(),
            })
        })
        .transpose()
}

fn list_option(options: &ReceiverOptions, option: &str) -> Vec<String> {
    options
        .get(option)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn queue_receiver(
    options: &ReceiverOptions,
    app: &Arc<AppContext>,
) -> Result<Arc<dyn Receiver>, RegistryError> {
    let name = required(options, "queue", "queue")?;
    Ok(Arc::new(QueueReceiver::new(name, app.queues().clone())))
}

fn file_system_receiver(
    options: &ReceiverOptions,
    _app: &Arc<AppContext>,
) -> Result<Arc<dyn Receiver>, RegistryError> {
    let directory = required(options, "file_system", "directory")?;
    let content_type = options
        .get("content_type")
        .map(String::as_str)
        .unwrap_or("application/json");
    let mut settings = FileSystemOptions::new(directory, content_type);
    if let Some(pattern) = options.get("pattern") {
        settings = settings.with_pattern(pattern.trim());
    }
    if let Some(interval) = duration_option(options, "file_system", "poll_interval")? {
        settings = settings.with_poll_interval(interval);
    }
    Ok(Arc::new(FileSystemReceiver::new(settings)))
}

/// Parses the `source` list of a datastore receiver.
pub fn datastore_sources(options: &ReceiverOptions) -> Result<Vec<DatastoreSource>, RegistryError> {
    let names = list_option(options, "source");
    if names.is_empty() {
        return Err(RegistryError::MissingOption {
            receiver: "datastore",
            option: "source",
        });
    }
    let direction = match options.get("direction").map(|raw| raw.trim()) {
        None | Some("") => None,
        Some(raw) => Some(raw.parse::<Direction>().map_err(|reason| {
            RegistryError::InvalidOption {
                receiver: "datastore",
                option: "direction",
                reason,
            }
        })?),
    };

    names
        .iter()
        .map(|name| match name.as_str() {
            "send_queue" => Ok(DatastoreSource::SendQueue {
                filter: OutMessageFilter::push(),
            }),
            "deliver_queue" => Ok(DatastoreSource::DeliverQueue),
            "notify_signals" => Ok(DatastoreSource::NotifySignals),
            "notify_exceptions" => Ok(DatastoreSource::NotifyExceptions { direction }),
            "due_retries" => Ok(DatastoreSource::DueRetries),
            other => Err(RegistryError::InvalidOption {
                receiver: "datastore",
                option: "source",
                reason: format!("unknown source `{other}`"),
            }),
        })
        .collect()
}

fn datastore_receiver(
    options: &ReceiverOptions,
    app: &Arc<AppContext>,
) -> Result<Arc<dyn Receiver>, RegistryError> {
    let mut settings = DatastoreOptions::new(datastore_sources(options)?);
    if let Some(interval) = duration_option(options, "datastore", "poll_interval")? {
        settings = settings.with_poll_interval(interval);
    }
    Ok(Arc::new(DatastoreReceiver::new(settings, app.clone())))
}

fn interval_pull_receiver(
    options: &ReceiverOptions,
    app: &Arc<AppContext>,
) -> Result<Arc<dyn Receiver>, RegistryError> {
    let settings = IntervalPullOptions {
        pmodes: list_option(options, "pmodes"),
    };
    Ok(Arc::new(IntervalPullReceiver::new(
        settings,
        app.pmodes().clone(),
    )))
}

#[cfg(feature = "http-in")]
fn http_receiver(
    options: &ReceiverOptions,
    _app: &Arc<AppContext>,
) -> Result<Arc<dyn Receiver>, RegistryError> {
    use crate::transport::http_server::{HttpReceiver, HttpReceiverOptions};

    let raw = required(options, "http", "address")?;
    let address = raw.parse().map_err(|err: std::net::AddrParseError| {
        RegistryError::InvalidOption {
            receiver: "http",
            option: "address",
            reason: err.to_string(),
        }
    })?;
    let mut settings = HttpReceiverOptions::new(address);
    if let Some(path) = options.get("path") {
        settings = settings.with_path(path);
    }
    Ok(Arc::new(HttpReceiver::new(settings)))
}
