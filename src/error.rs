#![forbid(unsafe_code)]

//! Startup-level error type. Per-message failures never surface here; they are
//! classified inside the pipeline and end up as exception records.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent settings error: {0}")]
    AgentSettings(#[from] crate::config::agents::AgentSettingsError),
    #[error(transparent)]
    AgentBuild(#[from] crate::agent::AgentBuildError),
    #[error("kernel error: {0}")]
    Kernel(#[from] crate::agent::kernel::KernelError),
    #[error("repository error: {0}")]
    Repository(#[from] crate::store::RepositoryError),
    #[error("security error: {0}")]
    Security(#[from] crate::security::SecurityError),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    fn wrap(self, context: String) -> Self {
        Self::Context {
            context,
            source: Box::new(self),
        }
    }
}

/// Attaches a description of what was being attempted to any error the crate
/// error converts from.
pub trait Context<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|err| Error::from(err).wrap(context.into()))
    }

    fn with_context<C: Into<String>>(self, describe: impl FnOnce() -> C) -> Result<T> {
        self.map_err(|err| Error::from(err).wrap(describe().into()))
    }
}

#[macro_export]
macro_rules! err {
    ($($arg:tt)+) => {
        $crate::error::Error::msg(format!($($arg)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_wraps_the_underlying_error() {
        let failed: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "keyring.yaml",
        ));
        let err = failed.context("failed to load keyring").unwrap_err();
        assert_eq!(err.to_string(), "failed to load keyring");
        let Error::Context { source, .. } = &err else {
            panic!("expected context wrapper, got {err:?}");
        };
        assert!(matches!(**source, Error::Io(_)));
    }

    #[test]
    fn err_macro_formats_messages() {
        let err = crate::err!("agent `{}` missing", "outbox");
        assert_eq!(err.to_string(), "agent `outbox` missing");
    }
}
