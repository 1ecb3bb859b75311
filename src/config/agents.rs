//! Agent settings file. Parsed into raw structures first, then checked field
//! by field against the component registry; every violation is reported.

use crate::agent::defaults::{default_receiver, default_steps, default_transformer, StepLists};
use crate::agent::AgentKind;
use crate::pipeline::registry::{required_options, ComponentRegistry, ReceiverOptions, StepSpec};
use serde::de::Error as _;
use serde::Deserialize;
use serde_yaml::Value as YamlValue;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use thiserror::Error;

const AGENT_FIELDS: &str = "name, kind, enabled, receiver, transformer, steps, error_steps";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverSettings {
    pub receiver_type: String,
    pub options: ReceiverOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub name: String,
    pub kind: AgentKind,
    pub receiver: ReceiverSettings,
    pub transformer: String,
    pub steps: StepLists,
}

impl AgentSettings {
    /// Settings made only of defaults. `None` for kinds without a default receiver.
    pub fn with_defaults(name: impl Into<String>, kind: AgentKind) -> Option<Self> {
        let (receiver_type, options) = default_receiver(kind)?;
        Some(Self {
            name: name.into(),
            kind,
            receiver: ReceiverSettings {
                receiver_type: receiver_type.to_string(),
                options,
            },
            transformer: default_transformer(kind).to_string(),
            steps: default_steps(kind),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentsConfig {
    pub agents: Vec<AgentSettings>,
}

impl AgentsConfig {
    /// Agents that need no settings: everything driven by the datastore or
    /// the pull schedule.
    pub fn datastore_defaults() -> Self {
        let agents = [
            AgentKind::Send,
            AgentKind::Deliver,
            AgentKind::Notify,
            AgentKind::ReceptionAwareness,
            AgentKind::PullReceive,
        ]
        .into_iter()
        .filter_map(|kind| AgentSettings::with_defaults(kind.as_str(), kind))
        .collect();
        Self { agents }
    }

    pub fn from_path(
        path: impl AsRef<Path>,
        registry: &ComponentRegistry,
    ) -> Result<Self, AgentSettingsError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents, registry)
    }

    pub fn from_yaml_str(
        contents: &str,
        registry: &ComponentRegistry,
    ) -> Result<Self, AgentSettingsError> {
        let raw: RawAgentsFile = serde_yaml::from_str(contents)?;
        Self::from_raw(raw, registry).map_err(AgentSettingsError::Invalid)
    }

    fn from_raw(
        raw: RawAgentsFile,
        registry: &ComponentRegistry,
    ) -> Result<Self, AgentValidationError> {
        let mut errors = Vec::new();
        for key in raw.extra_fields.keys() {
            errors.push(format!(
                "error[root]: unknown top-level key \"{key}\" (expected agents)"
            ));
        }

        let mut names = BTreeSet::new();
        let mut agents = Vec::new();
        for (index, agent) in raw.agents.into_iter().enumerate() {
            if let Some(settings) = parse_agent(index, agent, registry, &mut names, &mut errors) {
                agents.push(settings);
            }
        }

        if errors.is_empty() {
            Ok(Self { agents })
        } else {
            Err(AgentValidationError::new(errors))
        }
    }
}

fn parse_agent(
    index: usize,
    raw: RawAgent,
    registry: &ComponentRegistry,
    names: &mut BTreeSet<String>,
    errors: &mut Vec<String>,
) -> Option<AgentSettings> {
    let label = match raw.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => format!("agents[{index}] `{name}`"),
        _ => format!("agents[{index}]"),
    };
    let before = errors.len();

    for key in raw.extra_fields.keys() {
        errors.push(format!(
            "{label}: unknown key \"{key}\" (expected one of {AGENT_FIELDS})"
        ));
    }

    let name = match raw.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => {
            if !names.insert(name.to_string()) {
                errors.push(format!("{label}: duplicate agent name"));
            }
            name.to_string()
        }
        _ => {
            errors.push(format!("{label}: name is required"));
            String::new()
        }
    };

    let kind = match raw.kind.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push(format!("{label}: kind is required"));
            None
        }
        Some(value) => match value.parse::<AgentKind>() {
            Ok(kind) => Some(kind),
            Err(reason) => {
                errors.push(format!("{label}: {reason}"));
                None
            }
        },
    };

    let receiver = parse_receiver(&label, raw.receiver, kind, registry, errors);

    let transformer = match (raw.transformer, kind) {
        (Some(key), _) => {
            let key = key.trim().to_string();
            if !registry.has_transformer(&key) {
                errors.push(format!("{label}: unknown transformer `{key}`"));
            }
            Some(key)
        }
        (None, Some(kind)) => Some(default_transformer(kind).to_string()),
        (None, None) => None,
    };

    let defaults = kind.map(default_steps).unwrap_or_default();
    let normal = match raw.steps {
        Some(steps) => parse_steps(&label, "steps", steps, registry, errors),
        None => defaults.normal,
    };
    let error = match raw.error_steps {
        Some(steps) => parse_steps(&label, "error_steps", steps, registry, errors),
        None => defaults.error,
    };
    if normal.is_empty() && errors.len() == before {
        errors.push(format!("{label}: steps must not be empty"));
    }

    if !raw.enabled.unwrap_or(true) || errors.len() != before {
        return None;
    }
    Some(AgentSettings {
        name,
        kind: kind?,
        receiver: receiver?,
        transformer: transformer?,
        steps: StepLists { normal, error },
    })
}

fn parse_receiver(
    label: &str,
    raw: Option<RawReceiver>,
    kind: Option<AgentKind>,
    registry: &ComponentRegistry,
    errors: &mut Vec<String>,
) -> Option<ReceiverSettings> {
    let Some(raw) = raw else {
        let kind = kind?;
        return match default_receiver(kind) {
            Some((receiver_type, options)) => Some(ReceiverSettings {
                receiver_type: receiver_type.to_string(),
                options,
            }),
            None => {
                errors.push(format!(
                    "{label}: agents of kind `{kind}` require a receiver"
                ));
                None
            }
        };
    };

    let receiver_type = match raw.receiver_type.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => {
            errors.push(format!("{label}: receiver.type is required"));
            return None;
        }
    };
    if !registry.has_receiver(&receiver_type) {
        errors.push(format!("{label}: unknown receiver `{receiver_type}`"));
        return None;
    }

    let mut options = ReceiverOptions::new();
    for (key, value) in raw.options {
        match scalar_to_string(&value) {
            Some(text) => {
                options.insert(key, text);
            }
            None => errors.push(format!(
                "{label}: receiver option `{key}` must be a string, number or boolean"
            )),
        }
    }
    for option in required_options(&receiver_type) {
        if options.get(*option).map_or(true, |value| value.trim().is_empty()) {
            errors.push(format!(
                "{label}: receiver `{receiver_type}` requires option `{option}`"
            ));
        }
    }

    Some(ReceiverSettings {
        receiver_type,
        options,
    })
}

fn parse_steps(
    label: &str,
    field: &str,
    raw: Vec<RawStep>,
    registry: &ComponentRegistry,
    errors: &mut Vec<String>,
) -> Vec<StepSpec> {
    let mut steps = Vec::with_capacity(raw.len());
    for (index, step) in raw.into_iter().enumerate() {
        let spec = match step {
            RawStep::Name(name) => StepSpec::plain(name.trim()),
            RawStep::Guarded { step, when, unless } => match (when, unless) {
                (Some(_), Some(_)) => {
                    errors.push(format!(
                        "{label}: {field}[{index}] sets both `when` and `unless`"
                    ));
                    continue;
                }
                (Some(condition), None) => StepSpec::when(step.trim(), condition.trim()),
                (None, Some(condition)) => StepSpec {
                    step: step.trim().to_string(),
                    condition: Some(condition.trim().to_string()),
                    negate: true,
                },
                (None, None) => StepSpec::plain(step.trim()),
            },
        };
        if !registry.has_step(&spec.step) {
            errors.push(format!("{label}: {field}[{index}] unknown step `{}`", spec.step));
        }
        if let Some(condition) = &spec.condition {
            if !registry.has_condition(condition) {
                errors.push(format!(
                    "{label}: {field}[{index}] unknown condition `{condition}`"
                ));
            }
        }
        steps.push(spec);
    }
    steps
}

fn scalar_to_string(value: &YamlValue) -> Option<String> {
    match value {
        YamlValue::String(text) => Some(text.clone()),
        YamlValue::Number(number) => Some(number.to_string()),
        YamlValue::Bool(flag) => Some(flag.to_string()),
        YamlValue::Sequence(items) => items
            .iter()
            .map(scalar_to_string)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct RawAgentsFile {
    #[serde(default)]
    agents: Vec<RawAgent>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawAgent {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    kind: Option<String>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    receiver: Option<RawReceiver>,
    #[serde(default)]
    transformer: Option<String>,
    #[serde(default)]
    steps: Option<Vec<RawStep>>,
    #[serde(default)]
    error_steps: Option<Vec<RawStep>>,
    #[serde(default)]
    #[serde(flatten)]
    extra_fields: BTreeMap<String, YamlValue>,
}

#[derive(Debug, Deserialize)]
struct RawReceiver {
    #[serde(default, rename = "type")]
    receiver_type: Option<String>,
    #[serde(default)]
    options: BTreeMap<String, YamlValue>,
}

#[derive(Debug)]
enum RawStep {
    Name(String),
    Guarded {
        step: String,
        when: Option<String>,
        unless: Option<String>,
    },
}

impl<'de> Deserialize<'de> for RawStep {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(deny_unknown_fields)]
        struct Guarded {
            step: String,
            #[serde(default)]
            when: Option<String>,
            #[serde(default)]
            unless: Option<String>,
        }

        match YamlValue::deserialize(deserializer)? {
            YamlValue::String(name) => Ok(RawStep::Name(name)),
            value @ YamlValue::Mapping(_) => {
                let guarded: Guarded = serde_yaml::from_value(value).map_err(D::Error::custom)?;
                Ok(RawStep::Guarded {
                    step: guarded.step,
                    when: guarded.when,
                    unless: guarded.unless,
                })
            }
            _ => Err(D::Error::custom(
                "a step is either a name or a mapping with `step` and `when`/`unless`",
            )),
        }
    }
}

#[derive(Debug, Error)]
pub enum AgentSettingsError {
    #[error("failed to read agent settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse agent settings: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error(transparent)]
    Invalid(AgentValidationError),
}

#[derive(Debug, Error)]
#[error("agent settings validation failed:\n{rendered}")]
pub struct AgentValidationError {
    messages: Vec<String>,
    rendered: String,
}

impl AgentValidationError {
    pub fn new(messages: Vec<String>) -> Self {
        let rendered = messages
            .iter()
            .map(|msg| format!("- {msg}"))
            .collect::<Vec<_>>()
            .join("\n");
        Self { messages, rendered }
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<AgentsConfig, AgentSettingsError> {
        AgentsConfig::from_yaml_str(yaml, &ComponentRegistry::builtin())
    }

    #[test]
    fn omitted_parts_fall_back_to_defaults() {
        let config = parse(
            r#"
agents:
  - name: sender
    kind: send
  - name: submit
    kind: submit
    receiver:
      type: file_system
      options:
        directory: /var/as4/submit
        poll_interval: 2s
"#,
        )
        .unwrap();
        assert_eq!(config.agents.len(), 2);
        let sender = &config.agents[0];
        assert_eq!(sender.receiver.receiver_type, "datastore");
        assert_eq!(sender.transformer, "out_message");
        assert_eq!(sender.steps, default_steps(AgentKind::Send));
        assert_eq!(
            config.agents[1].receiver.options.get("poll_interval").map(String::as_str),
            Some("2s")
        );
    }

    #[test]
    fn guarded_steps_parse() {
        let config = parse(
            r#"
agents:
  - name: outbox
    kind: send
    steps:
      - step: sign_message
        when: signing_enabled
      - step: compress_attachments
        unless: message_encrypted
      - send_message
"#,
        )
        .unwrap();
        let steps = &config.agents[0].steps.normal;
        assert_eq!(steps[0], StepSpec::when("sign_message", "signing_enabled"));
        assert!(steps[1].negate);
        assert_eq!(steps[2], StepSpec::plain("send_message"));
    }

    #[test]
    fn every_violation_is_reported() {
        let err = parse(
            r#"
agents:
  - name: a
    kind: courier
  - name: a
    kind: receive
  - name: b
    kind: submit
    receiver:
      type: queue
    steps:
      - teleport
      - step: sign_message
        when: moon_is_full
"#,
        )
        .unwrap_err();
        let AgentSettingsError::Invalid(invalid) = err else {
            panic!("expected validation error, got {err}");
        };
        let messages = invalid.messages().join("\n");
        assert!(messages.contains("unknown agent kind `courier`"), "{messages}");
        assert!(messages.contains("duplicate agent name"), "{messages}");
        assert!(messages.contains("kind `receive` require a receiver"), "{messages}");
        assert!(messages.contains("requires option `queue`"), "{messages}");
        assert!(messages.contains("unknown step `teleport`"), "{messages}");
        assert!(messages.contains("unknown condition `moon_is_full`"), "{messages}");
    }

    #[test]
    fn disabled_agents_are_dropped() {
        let config = parse(
            r#"
agents:
  - name: notify
    kind: notify
    enabled: false
"#,
        )
        .unwrap();
        assert!(config.agents.is_empty());
    }

    #[test]
    fn datastore_defaults_need_no_settings() {
        let kinds: Vec<AgentKind> = AgentsConfig::datastore_defaults()
            .agents
            .iter()
            .map(|agent| agent.kind)
            .collect();
        assert!(kinds.contains(&AgentKind::ReceptionAwareness));
        assert!(!kinds.contains(&AgentKind::Submit));
    }
}
