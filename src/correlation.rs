//! Maps a request id to a pending completion, and ages out entries whose
//! response never arrived. Grounded on the teacher's
//! `handlers/twins.rs::TwinsMiddleware.requests` map, generalised with a
//! sweep the teacher never needed.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::SdkError;
use crate::twin::TwinResponseOutcome;

/// What kind of response a pending operation is waiting for.
pub enum PendingOperation {
    GetTwin(oneshot::Sender<Result<TwinResponseOutcome, SdkError>>),
    PatchReportedProperties(oneshot::Sender<Result<TwinResponseOutcome, SdkError>>),
}

/// Which twin operation a registry entry was registered for, handed to
/// the caller of [`CorrelationRegistry::complete_with`] so an inbound
/// twin response is classified from the request that's actually
/// pending, never guessed at from the response's wire shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingKind {
    GetTwin,
    PatchReportedProperties,
}

impl PendingOperation {
    fn kind(&self) -> PendingKind {
        match self {
            PendingOperation::GetTwin(_) => PendingKind::GetTwin,
            PendingOperation::PatchReportedProperties(_) => PendingKind::PatchReportedProperties,
        }
    }
}

struct Entry {
    operation: PendingOperation,
    created_at: Instant,
}

/// In-memory registry of outstanding twin requests, keyed by a random
/// request id. Safe for concurrent insert/complete/sweep: all mutation
/// goes through a single mutex and completer resolution happens after the
/// lock is released, so producers never run waiter continuations inline.
#[derive(Default)]
pub struct CorrelationRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates a fresh request id and registers `operation` under it.
    /// Retries generation in the astronomically unlikely case of a
    /// collision against a still-pending id.
    pub fn register(&self, operation: PendingOperation) -> String {
        let mut guard = self.entries.lock().expect("correlation registry poisoned");
        loop {
            let rid = Uuid::new_v4().to_string();
            if !guard.contains_key(&rid) {
                guard.insert(
                    rid.clone(),
                    Entry {
                        operation,
                        created_at: Instant::now(),
                    },
                );
                return rid;
            }
        }
    }

    /// Removes and resolves the entry for `rid`, if present. No-op if
    /// absent (unknown or already-completed request ids are silently
    /// discarded, per the inbound-dispatch contract).
    pub fn complete(&self, rid: &str, outcome: Result<TwinResponseOutcome, SdkError>) {
        let entry = {
            let mut guard = self.entries.lock().expect("correlation registry poisoned");
            guard.remove(rid)
        };
        if let Some(entry) = entry {
            let sender = match entry.operation {
                PendingOperation::GetTwin(tx) => tx,
                PendingOperation::PatchReportedProperties(tx) => tx,
            };
            let _ = sender.send(outcome);
        }
    }

    /// Like [`Self::complete`], but the outcome is built from a closure
    /// given the matched entry's [`PendingKind`] rather than supplied
    /// up front. Lets the caller classify a twin response (get vs.
    /// patch) from the request that's actually pending instead of
    /// guessing from the response body's shape. No-op if `rid` is
    /// absent; `build` is never called in that case.
    pub fn complete_with(
        &self,
        rid: &str,
        build: impl FnOnce(PendingKind) -> Result<TwinResponseOutcome, SdkError>,
    ) {
        let entry = {
            let mut guard = self.entries.lock().expect("correlation registry poisoned");
            guard.remove(rid)
        };
        if let Some(entry) = entry {
            let kind = entry.operation.kind();
            let outcome = build(kind);
            let sender = match entry.operation {
                PendingOperation::GetTwin(tx) => tx,
                PendingOperation::PatchReportedProperties(tx) => tx,
            };
            let _ = sender.send(outcome);
        }
    }

    /// Removes and cancels the entry for `rid` by dropping its sender,
    /// which resolves the caller's awaiter with a `RecvError`. No-op if
    /// absent.
    pub fn cancel(&self, rid: &str) {
        let mut guard = self.entries.lock().expect("correlation registry poisoned");
        guard.remove(rid);
    }

    /// Removes and fails every entry older than `max_age`, returning how
    /// many were swept. `max_age` of zero fails everything currently
    /// pending (used on perceived disconnect).
    pub fn sweep(&self, max_age: Duration, make_error: impl Fn() -> SdkError) -> usize {
        let expired: Vec<Entry> = {
            let mut guard = self.entries.lock().expect("correlation registry poisoned");
            let now = Instant::now();
            let expired_keys: Vec<String> = guard
                .iter()
                .filter(|(_, entry)| now.duration_since(entry.created_at) >= max_age)
                .map(|(rid, _)| rid.clone())
                .collect();
            expired_keys
                .into_iter()
                .filter_map(|rid| guard.remove(&rid))
                .collect()
        };
        let count = expired.len();
        for entry in expired {
            let sender = match entry.operation {
                PendingOperation::GetTwin(tx) => tx,
                PendingOperation::PatchReportedProperties(tx) => tx,
            };
            let _ = sender.send(Err(make_error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("correlation registry poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn timeout_error() -> SdkError {
        SdkError::new(ErrorKind::NetworkErrors, "Did not receive twin response from service.")
    }

    #[tokio::test]
    async fn complete_resolves_the_matching_awaiter() {
        let registry = CorrelationRegistry::new();
        let (tx, rx) = oneshot::channel();
        let rid = registry.register(PendingOperation::GetTwin(tx));
        assert_eq!(registry.len(), 1);

        registry.complete(&rid, Ok(TwinResponseOutcome::PatchOk { version: 1 }));
        let outcome = rx.await.unwrap().unwrap();
        assert!(matches!(outcome, TwinResponseOutcome::PatchOk { version: 1 }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn complete_on_unknown_rid_is_a_no_op() {
        let registry = CorrelationRegistry::new();
        registry.complete("nonexistent", Ok(TwinResponseOutcome::PatchOk { version: 1 }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn cancel_drops_the_sender_and_removes_the_entry() {
        let registry = CorrelationRegistry::new();
        let (tx, rx) = oneshot::channel();
        let rid = registry.register(PendingOperation::GetTwin(tx));
        registry.cancel(&rid);
        assert!(registry.is_empty());
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn sweep_with_zero_age_fails_everything_pending() {
        let registry = CorrelationRegistry::new();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        registry.register(PendingOperation::GetTwin(tx1));
        registry.register(PendingOperation::PatchReportedProperties(tx2));

        let swept = registry.sweep(Duration::ZERO, timeout_error);
        assert_eq!(swept, 2);
        assert!(registry.is_empty());
        assert!(rx1.await.unwrap().is_err());
        assert!(rx2.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn sweep_leaves_fresh_entries_alone() {
        let registry = CorrelationRegistry::new();
        let (tx, _rx) = oneshot::channel();
        registry.register(PendingOperation::GetTwin(tx));

        let swept = registry.sweep(Duration::from_secs(60), timeout_error);
        assert_eq!(swept, 0);
        assert_eq!(registry.len(), 1);
    }
}
