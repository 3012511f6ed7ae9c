//! Builders shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_channel::Receiver;

use crate::firestore::error::{data_loss, FirestoreResult};
use crate::firestore::local::{PersistedState, Persistence};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};
use crate::firestore::remote::{ChannelConnection, StreamRequest};
use crate::firestore::value::{FirestoreValue, ObjectValue};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn fields(entries: &[(&str, i64)]) -> BTreeMap<String, FirestoreValue> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), FirestoreValue::from_integer(*value)))
        .collect()
}

/// A found document at `version` (in microseconds) with integer fields.
pub fn doc(path: &str, version: i64, entries: &[(&str, i64)]) -> Document {
    Document::new_found(
        key(path),
        SnapshotVersion::from_micros(version),
        ObjectValue::from_map(fields(entries)),
    )
}

/// Outbound stream requests captured from a [`ChannelConnection`].
pub struct RequestLog {
    receiver: Receiver<StreamRequest>,
}

impl RequestLog {
    /// Everything sent since the last call.
    pub fn drain(&self) -> Vec<StreamRequest> {
        std::iter::from_fn(|| self.receiver.try_recv().ok()).collect()
    }
}

pub fn recording_connection() -> (ChannelConnection, RequestLog) {
    let (connection, receiver) = ChannelConnection::new();
    (connection, RequestLog { receiver })
}

/// Volatile backend whose next commits can be made to fail.
#[derive(Clone, Default)]
pub struct FlakyPersistence {
    failures: Arc<AtomicU32>,
}

impl FlakyPersistence {
    /// Fails the next `count` commits.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl Persistence for FlakyPersistence {
    fn load(&mut self) -> FirestoreResult<Option<PersistedState>> {
        Ok(None)
    }

    fn commit(&mut self, action: &str, _state: &PersistedState) -> FirestoreResult<()> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(data_loss(format!("injected failure committing '{action}'")));
        }
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
