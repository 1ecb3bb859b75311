//! Helper macros enforcing consistent agent log fields.
//!
//! These macros keep `agent` (and optionally `message_id`) fields present on every log
//! emitted from agent/receiver layers so downstream parsing can rely on them.

/// Log an event for an agent (and message) plus any extra fields.
#[macro_export]
macro_rules! as4_event {
    ($level:ident, $event:expr, agent = $agent:expr, message_id = $message_id:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            event = $event,
            agent = %$agent,
            message_id = %$message_id,
            $($field = %$value,)*
        )
    };
    ($level:ident, $event:expr, agent = $agent:expr $(, $field:ident = $value:expr )* $(,)?) => {
        tracing::$level!(
            event = $event,
            agent = %$agent,
            $($field = %$value,)*
        )
    };
}
