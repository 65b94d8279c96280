//! In-memory stand-in for a service ledger.
//!
//! Used by tests in place of Postgres. A transaction runs against a copy of
//! the whole state and replaces it only when the closure returns `Ok`, so a
//! failed closure rolls back exactly like a database transaction would.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::outbox::{DeliveryRecord, NewOutboxEvent, OutboxEvent, OutboxStore};

#[derive(Debug, Clone, Default)]
pub struct OutboxTable {
    events: Vec<OutboxEvent>,
    next_id: i64,
}

impl OutboxTable {
    pub fn insert(&mut self, new: NewOutboxEvent) -> OutboxEvent {
        self.next_id += 1;
        let event = OutboxEvent {
            id: self.next_id,
            event_type: new.event_type,
            aggregate_id: new.aggregate_id,
            payload: new.payload,
            occurred_at: new.occurred_at,
            published_at: None,
            attempts: 0,
        };
        self.events.push(event.clone());
        event
    }

    pub fn pending(&self, limit: i64, max_attempts: i32) -> Vec<OutboxEvent> {
        let mut pending: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.is_pending() && e.attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by_key(|e| (e.occurred_at, e.id));
        pending.truncate(limit.max(0) as usize);
        pending
    }

    pub fn record(&mut self, deliveries: &[DeliveryRecord]) {
        for delivery in deliveries {
            if let Some(event) = self.events.iter_mut().find(|e| e.id == delivery.event_id) {
                event.attempts += 1;
                if delivery.published_at.is_some() {
                    event.published_at = delivery.published_at;
                }
            }
        }
    }

    pub fn stuck(&self, max_attempts: i32) -> Vec<OutboxEvent> {
        self.events
            .iter()
            .filter(|e| e.is_stuck(max_attempts))
            .cloned()
            .collect()
    }

    pub fn events(&self) -> &[OutboxEvent] {
        &self.events
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessedMessages {
    rows: HashMap<String, DateTime<Utc>>,
}

impl ProcessedMessages {
    /// Inserts the marker; `false` means the message was already processed.
    pub fn claim(&mut self, message_id: &str) -> bool {
        if self.rows.contains_key(message_id) {
            return false;
        }
        self.rows.insert(message_id.to_string(), Utc::now());
        true
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.rows.contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Everything one service ledger holds: its own tables plus the outbox and
/// the processed-message markers.
#[derive(Debug, Clone, Default)]
pub struct LedgerState<T> {
    pub tables: T,
    pub outbox: OutboxTable,
    pub processed: ProcessedMessages,
}

#[derive(Debug, Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_next_commit: AtomicBool,
}

pub struct MemoryLedger<T> {
    state: Arc<Mutex<LedgerState<T>>>,
    faults: Arc<Faults>,
}

impl<T> Clone for MemoryLedger<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            faults: Arc::clone(&self.faults),
        }
    }
}

impl<T: Default> Default for MemoryLedger<T> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(LedgerState::default())),
            faults: Arc::new(Faults::default()),
        }
    }
}

impl<T: Clone + Default + Send> MemoryLedger<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the database being down: every operation fails.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.faults.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next transaction runs but its commit fails, as if the process
    /// died right before committing.
    pub fn fail_next_commit(&self) {
        self.faults.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub async fn transaction<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&mut LedgerState<T>) -> Result<R, E>,
        E: From<LedgerError>,
    {
        self.check_available()?;

        let mut guard = self.state.lock().await;
        let mut working = guard.clone();
        let result = f(&mut working)?;

        if self.faults.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("commit failed".to_string()).into());
        }

        *guard = working;
        Ok(result)
    }

    pub async fn read<R, F>(&self, f: F) -> Result<R, LedgerError>
    where
        F: FnOnce(&LedgerState<T>) -> R,
    {
        self.check_available()?;
        let guard = self.state.lock().await;
        Ok(f(&guard))
    }

    /// Copy of the current state for assertions.
    pub async fn snapshot(&self) -> LedgerState<T> {
        self.state.lock().await.clone()
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.faults.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("in-memory ledger offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Default + Send + Sync> OutboxStore for MemoryLedger<T> {
    async fn pending_events(
        &self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, LedgerError> {
        self.read(|state| state.outbox.pending(limit, max_attempts)).await
    }

    async fn record_deliveries(&self, deliveries: &[DeliveryRecord]) -> Result<(), LedgerError> {
        self.transaction(|state| {
            state.outbox.record(deliveries);
            Ok::<_, LedgerError>(())
        })
        .await
    }

    async fn stuck_events(&self, max_attempts: i32) -> Result<Vec<OutboxEvent>, LedgerError> {
        self.read(|state| state.outbox.stuck(max_attempts)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use uuid::Uuid;

    fn new_event(event_type: &str, occurred_at: DateTime<Utc>) -> NewOutboxEvent {
        NewOutboxEvent {
            event_type: event_type.to_string(),
            aggregate_id: Uuid::new_v4(),
            payload: serde_json::json!({ "notaId": Uuid::new_v4() }),
            occurred_at,
        }
    }

    #[test]
    fn pending_is_oldest_first_and_skips_exhausted_events() {
        let now = Utc::now();
        let mut table = OutboxTable::default();
        let late = table.insert(new_event("ReservaFalhou", now));
        let early = table.insert(new_event("ReservaConfirmada", now - Duration::seconds(5)));
        let exhausted = table.insert(new_event("ReservaConfirmada", now - Duration::seconds(9)));

        for _ in 0..5 {
            table.record(&[DeliveryRecord { event_id: exhausted.id, published_at: None }]);
        }

        let pending: Vec<i64> = table.pending(10, 5).iter().map(|e| e.id).collect();
        assert_eq!(pending, vec![early.id, late.id]);
        assert_eq!(table.pending(1, 5).len(), 1);

        let stuck = table.stuck(5);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, exhausted.id);
        assert_eq!(stuck[0].attempts, 5);
    }

    #[test]
    fn recording_a_success_marks_published_and_counts_the_attempt() {
        let mut table = OutboxTable::default();
        let event = table.insert(new_event("NotaFiscalCriada", Utc::now()));

        table.record(&[DeliveryRecord { event_id: event.id, published_at: Some(Utc::now()) }]);

        let stored = &table.events()[0];
        assert!(stored.published_at.is_some());
        assert_eq!(stored.attempts, 1);
        assert!(table.pending(10, 5).is_empty());
    }

    #[test]
    fn processed_messages_claim_only_once() {
        let mut processed = ProcessedMessages::default();
        assert!(processed.claim("42"));
        assert!(!processed.claim("42"));
        assert!(processed.contains("42"));
        assert_eq!(processed.len(), 1);
    }

    #[tokio::test]
    async fn failed_transactions_leave_no_trace() {
        let ledger: MemoryLedger<Vec<u32>> = MemoryLedger::new();

        let result: Result<(), LedgerError> = ledger
            .transaction(|state| {
                state.tables.push(1);
                state.outbox.insert(new_event("ReservaConfirmada", Utc::now()));
                Err(LedgerError::Corrupt("boom".to_string()))
            })
            .await;
        assert!(result.is_err());

        let snapshot = ledger.snapshot().await;
        assert!(snapshot.tables.is_empty());
        assert!(snapshot.outbox.events().is_empty());
    }

    #[tokio::test]
    async fn a_failed_commit_discards_the_work() {
        let ledger: MemoryLedger<Vec<u32>> = MemoryLedger::new();
        ledger.fail_next_commit();

        let first = ledger
            .transaction(|state| {
                state.tables.push(1);
                Ok::<_, LedgerError>(())
            })
            .await;
        assert!(matches!(first, Err(LedgerError::Unavailable(_))));

        ledger
            .transaction(|state| {
                state.tables.push(2);
                Ok::<_, LedgerError>(())
            })
            .await
            .unwrap();
        assert_eq!(ledger.snapshot().await.tables, vec![2]);
    }

    #[tokio::test]
    async fn an_offline_ledger_refuses_work() {
        let ledger: MemoryLedger<Vec<u32>> = MemoryLedger::new();
        ledger.set_unavailable(true);
        assert!(ledger.pending_events(10, 5).await.is_err());

        ledger.set_unavailable(false);
        assert!(ledger.pending_events(10, 5).await.unwrap().is_empty());
    }
}
