use crate::model::{Mep, Party, Service};
use crate::reliability::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.75;

/// Outbound processing mode: how messages submitted against `id` are packaged,
/// secured, sent and retried.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendingPMode {
    pub id: String,
    #[serde(default)]
    pub allow_override: bool,
    #[serde(default)]
    pub mep_binding: Mep,
    /// Target of the outbound exchange. For a pull binding this is where pull
    /// requests are posted.
    #[serde(default)]
    pub push_configuration: Option<PushConfiguration>,
    #[serde(default)]
    pub pull_configuration: Option<PullConfiguration>,
    #[serde(default)]
    pub reliability: SendReliability,
    #[serde(default)]
    pub security: SendSecurity,
    #[serde(default)]
    pub message_packaging: MessagePackaging,
    #[serde(default)]
    pub receipt_handling: ReceiptHandling,
    #[serde(default)]
    pub error_handling: NotifyHandling,
    #[serde(default)]
    pub exception_handling: NotifyHandling,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PushConfiguration {
    pub url: String,
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PullConfiguration {
    #[serde(with = "duration")]
    pub min_interval: Duration,
    #[serde(with = "duration")]
    pub max_interval: Duration,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendReliability {
    #[serde(default)]
    pub reception_awareness: RetryReliability,
}

/// Retry settings shared by reception awareness, delivery and notification.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryReliability {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    #[serde(default = "default_retry_interval", with = "duration")]
    pub retry_interval: Duration,
    #[serde(default, with = "duration::option")]
    pub max_retry_interval: Option<Duration>,
    #[serde(default = "default_factor")]
    pub factor: f64,
}

impl Default for RetryReliability {
    fn default() -> Self {
        Self {
            enabled: false,
            retry_count: default_retry_count(),
            retry_interval: default_retry_interval(),
            max_retry_interval: None,
            factor: default_factor(),
        }
    }
}

impl RetryReliability {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_count,
            min_interval: self.retry_interval,
            max_interval: self.max_retry_interval.unwrap_or(self.retry_interval),
            factor: self.factor,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendSecurity {
    #[serde(default)]
    pub signing: SigningSettings,
    #[serde(default)]
    pub encryption: EncryptionSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SigningSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptionSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessagePackaging {
    #[serde(default)]
    pub mpc: Option<String>,
    #[serde(default)]
    pub party_info: PartyInfo,
    #[serde(default)]
    pub collaboration: PModeCollaboration,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub message_properties: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartyInfo {
    #[serde(default)]
    pub from: Option<Party>,
    #[serde(default)]
    pub to: Option<Party>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PModeCollaboration {
    #[serde(default)]
    pub agreement: Option<String>,
    #[serde(default)]
    pub service: Option<Service>,
    #[serde(default)]
    pub action: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiptHandling {
    #[serde(default)]
    pub verify_nrr: bool,
    #[serde(default)]
    pub notify_message_producer: bool,
    #[serde(default)]
    pub notify_method: Option<Method>,
    #[serde(default)]
    pub reliability: RetryReliability,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyHandling {
    #[serde(default)]
    pub notify_message_producer: bool,
    #[serde(default)]
    pub notify_method: Option<Method>,
    #[serde(default)]
    pub reliability: RetryReliability,
}

impl NotifyHandling {
    /// Method to notify with, when the producer asked to be notified at all.
    pub fn target(&self) -> Option<&Method> {
        self.notify_method
            .as_ref()
            .filter(|_| self.notify_message_producer)
    }
}

impl ReceiptHandling {
    pub fn target(&self) -> Option<&Method> {
        self.notify_method
            .as_ref()
            .filter(|_| self.notify_message_producer)
    }
}

/// Deliver/notify sink selection: `type` picks the sink, `parameters` configure it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Method {
    #[serde(rename = "type")]
    pub method_type: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

impl Method {
    pub fn new(method_type: impl Into<String>) -> Self {
        Self {
            method_type: method_type.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }
}

/// Inbound processing mode, selected by matching a received user message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceivingPMode {
    pub id: String,
    #[serde(default)]
    pub message_packaging: ReceivePackaging,
    #[serde(default)]
    pub reply_handling: ReplyHandling,
    #[serde(default)]
    pub security: ReceiveSecurity,
    #[serde(default)]
    pub message_handling: MessageHandling,
    #[serde(default)]
    pub exception_handling: NotifyHandling,
}

/// Matching criteria; `None` means "not part of the match".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceivePackaging {
    #[serde(default)]
    pub mpc: Option<String>,
    #[serde(default)]
    pub party_info: PartyInfo,
    #[serde(default)]
    pub collaboration: PModeCollaboration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyPattern {
    #[default]
    Response,
    Callback,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplyHandling {
    #[serde(default)]
    pub reply_pattern: ReplyPattern,
    /// Sending PMode used to push callback replies.
    #[serde(default)]
    pub sending_pmode: Option<String>,
    #[serde(default)]
    pub use_nrr_format: bool,
    #[serde(default)]
    pub response_signing: SigningSettings,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityRequirement {
    #[default]
    Allowed,
    Required,
    NotAllowed,
    Ignored,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReceiveSecurity {
    #[serde(default)]
    pub signature_verification: SecurityRequirement,
    #[serde(default)]
    pub decryption: DecryptionSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DecryptionSettings {
    #[serde(default)]
    pub encryption: SecurityRequirement,
    #[serde(default)]
    pub key_id: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageHandling {
    #[serde(default)]
    pub deliver: DeliverSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeliverSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub method: Option<Method>,
    #[serde(default)]
    pub reliability: RetryReliability,
}

impl SendingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            allow_override: false,
            mep_binding: Mep::Push,
            push_configuration: None,
            pull_configuration: None,
            reliability: SendReliability::default(),
            security: SendSecurity::default(),
            message_packaging: MessagePackaging::default(),
            receipt_handling: ReceiptHandling::default(),
            error_handling: NotifyHandling::default(),
            exception_handling: NotifyHandling::default(),
        }
    }

    pub fn push_url(&self) -> Option<&str> {
        self.push_configuration
            .as_ref()
            .map(|config| config.url.as_str())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn reception_awareness(&self) -> &RetryReliability {
        &self.reliability.reception_awareness
    }
}

impl ReceivingPMode {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            message_packaging: ReceivePackaging::default(),
            reply_handling: ReplyHandling::default(),
            security: ReceiveSecurity::default(),
            message_handling: MessageHandling::default(),
            exception_handling: NotifyHandling::default(),
        }
    }

    pub fn deliver_method(&self) -> Option<&Method> {
        let deliver = &self.message_handling.deliver;
        deliver.method.as_ref().filter(|_| deliver.enabled)
    }
}

fn default_factor() -> f64 {
    DEFAULT_BACKOFF_FACTOR
}

fn default_retry_count() -> u32 {
    5
}

fn default_retry_interval() -> Duration {
    Duration::from_secs(60)
}

/// Durations as humantime text (`"5s"`, `"1m 30s"`) or integer milliseconds.
pub mod duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Millis(u64),
        Text(String),
    }

    fn resolve<E: serde::de::Error>(raw: RawDuration) -> Result<Duration, E> {
        match raw {
            RawDuration::Millis(millis) => Ok(Duration::from_millis(millis)),
            RawDuration::Text(text) => humantime::parse_duration(text.trim()).map_err(E::custom),
        }
    }

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        resolve(RawDuration::deserialize(deserializer)?)
    }

    pub mod option {
        use super::{resolve, RawDuration};
        use serde::{Deserialize, Deserializer, Serializer};
        use std::time::Duration;

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(duration) => super::serialize(duration, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Option::<RawDuration>::deserialize(deserializer)?
                .map(resolve)
                .transpose()
        }
    }
}
