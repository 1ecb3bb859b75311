//! Process-wide tracing setup and message-flow counters.
//!
//! Log lines are single-line `key=value` records. The innermost span's fields
//! (an agent run carries `agent` and `message_id`) are copied onto every event
//! emitted inside it, so a line can be attributed without reading the span path.

use crate::error::Result;
use chrono::{SecondsFormat, Utc};
use std::fmt::{self as stdfmt, Write as _};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{DefaultFields, Writer};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "as4-engine";
const DEFAULT_FILTER: &str = "as4_engine=info,info";

pub fn init_tracing() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let writer = std::io::stdout
        .with_max_level(tracing::Level::INFO)
        .or_else(std::io::stderr.with_min_level(tracing::Level::WARN));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .fmt_fields(DefaultFields::new())
        .event_format(LineFormat)
        .with_writer(writer)
        .try_init()
        .map_err(|err| crate::err!("failed to initialise tracing subscriber: {err}"))
}

struct LineFormat;

impl<S, N> FormatEvent<S, N> for LineFormat
where
    S: Subscriber + for<'lookup> LookupSpan<'lookup>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> stdfmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFields::default();
        event.record(&mut fields);
        fields.values.sort();

        let mut line = LogLine::default();
        line.push("ts", &Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        line.push("level", metadata.level().as_str());
        line.push("service", SERVICE_NAME);
        line.push("component", metadata.target());

        if let Some(span) = ctx.lookup_current() {
            let path: Vec<&str> = span.scope().from_root().map(|span| span.name()).collect();
            line.push("span", &path.join("."));
            let extensions = span.extensions();
            if let Some(recorded) = extensions.get::<FormattedFields<N>>() {
                // Already rendered as `key=value` pairs by the field formatter.
                if !recorded.fields.is_empty() {
                    line.push_raw(&recorded.fields);
                }
            }
        }

        let message = fields.message.unwrap_or_else(|| metadata.name().to_string());
        line.push("msg", &message);
        for (key, value) in &fields.values {
            line.push(key, value);
        }

        writeln!(writer, "{}", line.0)
    }
}

#[derive(Default)]
struct EventFields {
    message: Option<String>,
    values: Vec<(&'static str, String)>,
}

impl Visit for EventFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.store(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn stdfmt::Debug) {
        self.store(field, format!("{value:?}"));
    }
}

impl EventFields {
    fn store(&mut self, field: &Field, value: String) {
        match field.name() {
            "" => {}
            "message" => self.message = Some(value),
            name => self.values.push((name, value)),
        }
    }
}

#[derive(Default)]
struct LogLine(String);

impl LogLine {
    fn push(&mut self, key: &str, value: &str) {
        self.separate();
        self.0.push_str(key);
        self.0.push('=');
        self.0.push_str(&quote(value));
    }

    fn push_raw(&mut self, pairs: &str) {
        self.separate();
        self.0.push_str(pairs);
    }

    fn separate(&mut self) {
        if !self.0.is_empty() {
            self.0.push(' ');
        }
    }
}

/// Leaves bare tokens alone; anything with spaces, separators or quotes is
/// wrapped in double quotes with backslash escapes.
fn quote(value: &str) -> String {
    let separator =
        |c: char| c.is_whitespace() || matches!(c, '"' | '\\' | '=' | '{' | '}' | '[' | ']' | ',');
    let bare = !value.is_empty() && !value.chars().any(separator);
    if bare {
        return value.to_string();
    }
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push('"');
    quoted
}

macro_rules! runtime_counters {
    ($($name:ident => $inc:ident),+ $(,)?) => {
        /// Process-wide counters for the message flow, readable as a snapshot.
        #[derive(Default)]
        pub struct RuntimeCounters {
            $($name: AtomicU64,)+
        }

        #[derive(Clone, Debug, Default, PartialEq, Eq)]
        pub struct RuntimeCountersSnapshot {
            $(pub $name: u64,)+
        }

        impl RuntimeCounters {
            $(
                pub fn $inc(&self) {
                    self.$name.fetch_add(1, Ordering::Relaxed);
                }
            )+

            pub fn snapshot(&self) -> RuntimeCountersSnapshot {
                RuntimeCountersSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)+
                }
            }
        }

        impl stdfmt::Display for RuntimeCountersSnapshot {
            fn fmt(&self, f: &mut stdfmt::Formatter<'_>) -> stdfmt::Result {
                let mut line = LogLine::default();
                $(line.push(stringify!($name), &self.$name.to_string());)+
                f.write_str(&line.0)
            }
        }
    };
}

runtime_counters! {
    messages_received => inc_messages_received,
    messages_submitted => inc_messages_submitted,
    messages_sent => inc_messages_sent,
    messages_delivered => inc_messages_delivered,
    notifications_sent => inc_notifications_sent,
    duplicates_detected => inc_duplicates_detected,
    retries_scheduled => inc_retries_scheduled,
    retries_exhausted => inc_retries_exhausted,
    pipeline_failures => inc_pipeline_failures,
    pipeline_faults => inc_pipeline_faults,
}

static RUNTIME_COUNTERS: OnceLock<RuntimeCounters> = OnceLock::new();

pub fn runtime_counters() -> &'static RuntimeCounters {
    RUNTIME_COUNTERS.get_or_init(RuntimeCounters::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_with_separators_are_quoted() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("two words"), "\"two words\"");
        assert_eq!(quote("a=\"b\""), "\"a=\\\"b\\\"\"");
        assert_eq!(quote(""), "\"\"");
    }

    #[test]
    fn line_keeps_insertion_order() {
        let mut line = LogLine::default();
        line.push("level", "INFO");
        line.push_raw("agent=send message_id=m-1");
        line.push("msg", "message sent");
        assert_eq!(line.0, "level=INFO agent=send message_id=m-1 msg=\"message sent\"");
    }

    #[test]
    fn counters_accumulate() {
        let counters = RuntimeCounters::default();
        counters.inc_messages_sent();
        counters.inc_messages_sent();
        counters.inc_retries_exhausted();
        let snapshot = counters.snapshot();
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.retries_exhausted, 1);
        assert_eq!(snapshot.messages_received, 0);
        let summary = snapshot.to_string();
        assert!(summary.starts_with("messages_received=0 messages_submitted=0 messages_sent=2"));
        assert!(summary.ends_with("retries_exhausted=1 pipeline_failures=0 pipeline_faults=0"));
    }
}
