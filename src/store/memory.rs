use crate::model::{
    Direction, ExceptionRecord, InMessage, InStatus, Operation, OutMessage, OutStatus,
};
use crate::reliability::RetryRecord;
use crate::store::{
    check_in_transition, check_out_transition, InMessageUpdate, InsertOutcome, MessageRepository,
    OutMessageFilter, OutMessageUpdate, RepositoryError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    in_messages: HashMap<String, InMessage>,
    out_messages: HashMap<String, OutMessage>,
    exceptions: Vec<ExceptionRecord>,
    retries: HashMap<String, RetryRecord>,
}

/// Process-local repository. One lock guards all tables, which gives every
/// operation the per-record atomicity the agents rely on.
#[derive(Default)]
pub struct InMemoryRepository {
    tables: Mutex<Tables>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().expect("in-memory repository poisoned")
    }

    pub fn in_messages(&self) -> Vec<InMessage> {
        let mut rows: Vec<_> = self.tables().in_messages.values().cloned().collect();
        rows.sort_by_key(|row| row.insertion_time);
        rows
    }

    pub fn out_messages(&self) -> Vec<OutMessage> {
        let mut rows: Vec<_> = self.tables().out_messages.values().cloned().collect();
        rows.sort_by_key(|row| row.insertion_time);
        rows
    }

    pub fn exceptions(&self) -> Vec<ExceptionRecord> {
        self.tables().exceptions.clone()
    }

    pub fn retries(&self) -> Vec<RetryRecord> {
        self.tables().retries.values().cloned().collect()
    }
}

#[async_trait]
impl MessageRepository for InMemoryRepository {
    async fn insert_in_message(
        &self,
        message: InMessage,
    ) -> Result<InsertOutcome<InMessage>, RepositoryError> {
        let mut tables = self.tables();
        if let Some(existing) = tables.in_messages.get(&message.ebms_message_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        tables
            .in_messages
            .insert(message.ebms_message_id.clone(), message);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_in_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Option<InMessage>, RepositoryError> {
        Ok(self.tables().in_messages.get(ebms_message_id).cloned())
    }

    async fn update_in_message(
        &self,
        ebms_message_id: &str,
        update: InMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<InMessage, RepositoryError> {
        let mut tables = self.tables();
        let row = tables
            .in_messages
            .get_mut(ebms_message_id)
            .ok_or_else(|| RepositoryError::not_found("in_message", ebms_message_id))?;

        if let Some(status) = update.status {
            check_in_transition(row, status)?;
            row.status = status;
        }
        if let Some(operation) = update.operation {
            row.operation = operation;
        }
        if let Some(pmode_id) = update.pmode_id {
            row.pmode_id = Some(pmode_id);
        }
        if let Some(content_type) = update.content_type {
            row.content_type = content_type;
        }
        if let Some(body) = update.body {
            row.body = body;
        }
        row.modification_time = now;
        Ok(row.clone())
    }

    async fn claim_in_messages(
        &self,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InMessage>, RepositoryError> {
        let mut tables = self.tables();
        let mut candidates: Vec<&mut InMessage> = tables
            .in_messages
            .values_mut()
            .filter(|row| row.operation == from)
            .collect();
        candidates.sort_by_key(|row| row.insertion_time);

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|row| {
                row.operation = to;
                row.modification_time = now;
                row.clone()
            })
            .collect())
    }

    async fn find_in_messages_by_status(
        &self,
        status: InStatus,
    ) -> Result<Vec<InMessage>, RepositoryError> {
        Ok(self
            .in_messages()
            .into_iter()
            .filter(|row| row.status == status)
            .collect())
    }

    async fn insert_out_message(
        &self,
        message: OutMessage,
    ) -> Result<InsertOutcome<OutMessage>, RepositoryError> {
        let mut tables = self.tables();
        if let Some(existing) = tables.out_messages.get(&message.ebms_message_id) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        tables
            .out_messages
            .insert(message.ebms_message_id.clone(), message);
        Ok(InsertOutcome::Inserted)
    }

    async fn get_out_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Option<OutMessage>, RepositoryError> {
        Ok(self.tables().out_messages.get(ebms_message_id).cloned())
    }

    async fn update_out_message(
        &self,
        ebms_message_id: &str,
        update: OutMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<OutMessage, RepositoryError> {
        let mut tables = self.tables();
        let row = tables
            .out_messages
            .get_mut(ebms_message_id)
            .ok_or_else(|| RepositoryError::not_found("out_message", ebms_message_id))?;

        if let Some(status) = update.status {
            check_out_transition(row, status)?;
            row.status = status;
        }
        if let Some(operation) = update.operation {
            row.operation = operation;
        }
        row.modification_time = now;
        Ok(row.clone())
    }

    async fn claim_out_messages(
        &self,
        from: Operation,
        to: Operation,
        filter: &OutMessageFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutMessage>, RepositoryError> {
        let mut tables = self.tables();
        let mut candidates: Vec<&mut OutMessage> = tables
            .out_messages
            .values_mut()
            .filter(|row| row.operation == from && filter.matches(row))
            .collect();
        candidates.sort_by_key(|row| row.insertion_time);

        Ok(candidates
            .into_iter()
            .take(limit)
            .map(|row| {
                row.operation = to;
                row.modification_time = now;
                row.clone()
            })
            .collect())
    }

    async fn find_out_messages_by_status(
        &self,
        status: OutStatus,
    ) -> Result<Vec<OutMessage>, RepositoryError> {
        Ok(self
            .out_messages()
            .into_iter()
            .filter(|row| row.status == status)
            .collect())
    }

    async fn insert_exception(&self, record: ExceptionRecord) -> Result<(), RepositoryError> {
        self.tables().exceptions.push(record);
        Ok(())
    }

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, RepositoryError> {
        Ok(self
            .tables()
            .exceptions
            .iter()
            .find(|record| record.id == id)
            .cloned())
    }

    async fn update_exception_operation(
        &self,
        id: &str,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let mut tables = self.tables();
        let record = tables
            .exceptions
            .iter_mut()
            .find(|record| record.id == id)
            .ok_or_else(|| RepositoryError::not_found("exception", id))?;
        record.operation = operation;
        record.modification_time = now;
        Ok(())
    }

    async fn claim_exceptions(
        &self,
        direction: Option<Direction>,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        let mut tables = self.tables();
        Ok(tables
            .exceptions
            .iter_mut()
            .filter(|record| {
                record.operation == from && direction.map_or(true, |dir| record.direction == dir)
            })
            .take(limit)
            .map(|record| {
                record.operation = to;
                record.modification_time = now;
                record.clone()
            })
            .collect())
    }

    async fn exceptions_for_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        Ok(self
            .tables()
            .exceptions
            .iter()
            .filter(|record| record.ebms_ref_to_message_id.as_deref() == Some(ebms_message_id))
            .cloned()
            .collect())
    }

    async fn upsert_retry(&self, record: RetryRecord) -> Result<(), RepositoryError> {
        self.tables().retries.insert(record.key(), record);
        Ok(())
    }

    async fn get_retry(&self, key: &str) -> Result<Option<RetryRecord>, RepositoryError> {
        Ok(self.tables().retries.get(key).cloned())
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, RepositoryError> {
        let mut due: Vec<RetryRecord> = self
            .tables()
            .retries
            .values()
            .filter(|record| record.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|record| record.next_due);
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MessageType;

    fn in_message(id: &str) -> InMessage {
        InMessage::new(id, MessageType::UserMessage, "application/as4+json", Vec::new(), Utc::now())
    }

    #[tokio::test]
    async fn second_insert_returns_the_existing_row() {
        let repo = InMemoryRepository::new();
        assert!(repo.insert_in_message(in_message("m-1")).await.unwrap().is_inserted());
        match repo.insert_in_message(in_message("m-1")).await.unwrap() {
            InsertOutcome::Existing(row) => assert_eq!(row.ebms_message_id, "m-1"),
            InsertOutcome::Inserted => panic!("duplicate insert must not succeed"),
        }
        assert_eq!(repo.in_messages().len(), 1);
    }

    #[tokio::test]
    async fn status_updates_are_monotonic() {
        let repo = InMemoryRepository::new();
        repo.insert_in_message(in_message("m-1")).await.unwrap();
        repo.update_in_message("m-1", InMessageUpdate::status(InStatus::Delivered), Utc::now())
            .await
            .unwrap();
        let err = repo
            .update_in_message("m-1", InMessageUpdate::status(InStatus::Received), Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn claims_hand_each_row_out_once() {
        let repo = InMemoryRepository::new();
        let mut row = in_message("m-1");
        row.operation = Operation::ToBeDelivered;
        repo.insert_in_message(row).await.unwrap();

        let first = repo
            .claim_in_messages(Operation::ToBeDelivered, Operation::Delivering, 10, Utc::now())
            .await
            .unwrap();
        let second = repo
            .claim_in_messages(Operation::ToBeDelivered, Operation::Delivering, 10, Utc::now())
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
    }
}
