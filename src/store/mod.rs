//! Persistence contract for In/Out messages, exception records and retry records.
//!
//! Every agent runs its loop independently, so all cross-agent coordination goes
//! through per-record atomic operations here: insert-if-absent for duplicate
//! detection, compare-and-set claims on the operation column, and monotonic
//! status updates.

pub mod memory;
#[cfg(feature = "db-postgres")]
pub mod postgres;

use crate::model::{
    Direction, ExceptionRecord, InMessage, InStatus, Mep, Operation, OutMessage, OutStatus,
    StatusTransitionError,
};
use crate::reliability::RetryRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::InMemoryRepository;
#[cfg(feature = "db-postgres")]
pub use postgres::PostgresRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error("repository backend error: {0}")]
    Backend(String),
    #[cfg(feature = "db-postgres")]
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl RepositoryError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        RepositoryError::NotFound {
            entity,
            id: id.into(),
        }
    }
}

/// Result of an insert-if-absent: the caller either created the row or gets
/// the row that was already there.
#[derive(Clone, Debug, PartialEq)]
pub enum InsertOutcome<T> {
    Inserted,
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted)
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct InMessageUpdate {
    pub status: Option<InStatus>,
    pub operation: Option<Operation>,
    pub pmode_id: Option<String>,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl InMessageUpdate {
    pub fn status(status: InStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn operation(operation: Operation) -> Self {
        Self {
            operation: Some(operation),
            ..Self::default()
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }

    pub fn with_body(mut self, content_type: impl Into<String>, body: Vec<u8>) -> Self {
        self.content_type = Some(content_type.into());
        self.body = Some(body);
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutMessageUpdate {
    pub status: Option<OutStatus>,
    pub operation: Option<Operation>,
}

impl OutMessageUpdate {
    pub fn status(status: OutStatus) -> Self {
        Self {
            status: Some(status),
            operation: None,
        }
    }

    pub fn operation(operation: Operation) -> Self {
        Self {
            status: None,
            operation: Some(operation),
        }
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operation = Some(operation);
        self
    }
}

/// Narrows the out-messages an agent may claim.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutMessageFilter {
    pub mep: Option<Mep>,
    pub mpc: Option<String>,
}

impl OutMessageFilter {
    pub fn push() -> Self {
        Self {
            mep: Some(Mep::Push),
            mpc: None,
        }
    }

    pub fn pull(mpc: impl Into<String>) -> Self {
        Self {
            mep: Some(Mep::Pull),
            mpc: Some(mpc.into()),
        }
    }

    pub fn matches(&self, message: &OutMessage) -> bool {
        self.mep.map_or(true, |mep| message.mep == mep)
            && self
                .mpc
                .as_deref()
                .map_or(true, |mpc| message.mpc.as_deref() == Some(mpc))
    }
}

pub(crate) fn check_in_transition(
    current: &InMessage,
    next: InStatus,
) -> Result<(), StatusTransitionError> {
    if current.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StatusTransitionError {
            message_id: current.ebms_message_id.clone(),
            from: current.status.to_string(),
            to: next.to_string(),
        })
    }
}

pub(crate) fn check_out_transition(
    current: &OutMessage,
    next: OutStatus,
) -> Result<(), StatusTransitionError> {
    if current.status.can_transition_to(next) {
        Ok(())
    } else {
        Err(StatusTransitionError {
            message_id: current.ebms_message_id.clone(),
            from: current.status.to_string(),
            to: next.to_string(),
        })
    }
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn insert_in_message(
        &self,
        message: InMessage,
    ) -> Result<InsertOutcome<InMessage>, RepositoryError>;

    async fn get_in_message(&self, ebms_message_id: &str)
        -> Result<Option<InMessage>, RepositoryError>;

    /// Applies `update`; a status change must be a forward transition.
    async fn update_in_message(
        &self,
        ebms_message_id: &str,
        update: InMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<InMessage, RepositoryError>;

    /// Atomically moves up to `limit` records from operation `from` to `to`.
    async fn claim_in_messages(
        &self,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InMessage>, RepositoryError>;

    async fn find_in_messages_by_status(
        &self,
        status: InStatus,
    ) -> Result<Vec<InMessage>, RepositoryError>;

    async fn insert_out_message(
        &self,
        message: OutMessage,
    ) -> Result<InsertOutcome<OutMessage>, RepositoryError>;

    async fn get_out_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Option<OutMessage>, RepositoryError>;

    async fn update_out_message(
        &self,
        ebms_message_id: &str,
        update: OutMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<OutMessage, RepositoryError>;

    /// Oldest-first claim of out-messages matching `filter`.
    async fn claim_out_messages(
        &self,
        from: Operation,
        to: Operation,
        filter: &OutMessageFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutMessage>, RepositoryError>;

    async fn find_out_messages_by_status(
        &self,
        status: OutStatus,
    ) -> Result<Vec<OutMessage>, RepositoryError>;

    async fn insert_exception(&self, record: ExceptionRecord) -> Result<(), RepositoryError>;

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, RepositoryError>;

    async fn update_exception_operation(
        &self,
        id: &str,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError>;

    async fn claim_exceptions(
        &self,
        direction: Option<Direction>,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError>;

    async fn exceptions_for_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError>;

    async fn upsert_retry(&self, record: RetryRecord) -> Result<(), RepositoryError>;

    async fn get_retry(&self, key: &str) -> Result<Option<RetryRecord>, RepositoryError>;

    /// Non-terminal records whose due time has passed, earliest first.
    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, RepositoryError>;
}
