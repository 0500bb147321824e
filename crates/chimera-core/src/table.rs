//! Per-endpoint connection table.
//!
//! Maps connIDs to the live stream's inbound queue and shutdown signal.
//! Lookups clone what they need out of the map and release the shard lock
//! before any I/O happens.
//!
//! The most recent closed connIDs are remembered so a delayed or replayed
//! `NEW` cannot resurrect a stream the relay has already finished.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{Notify, mpsc};

/// Closed connIDs remembered per endpoint
pub const RETIRED_CAPACITY: usize = 4096;

/// Handles for one live stream
#[derive(Debug)]
pub struct StreamEntry {
    /// Inbound payloads, drained by the stream's TCP writer task
    pub data_tx: mpsc::Sender<Vec<u8>>,
    /// Wakes the stream's TCP pump so it stops reading
    pub shutdown: Arc<Notify>,
}

impl StreamEntry {
    /// Create an entry from its queue and shutdown signal.
    #[must_use]
    pub fn new(data_tx: mpsc::Sender<Vec<u8>>, shutdown: Arc<Notify>) -> Self {
        Self { data_tx, shutdown }
    }

    /// Stop the pump and drop the queue sender.
    ///
    /// The writer task flushes whatever is already queued, then shuts down
    /// the TCP write half.
    pub fn close(self) {
        self.shutdown.notify_one();
    }
}

/// connID to stream mapping, shared by every task of one endpoint
#[derive(Debug, Default)]
pub struct ConnectionTable {
    streams: DashMap<u32, StreamEntry>,
    retired: Mutex<Retired>,
}

/// Bounded FIFO of closed connIDs
#[derive(Debug, Default)]
struct Retired {
    order: VecDeque<u32>,
    ids: HashSet<u32>,
}

impl Retired {
    fn push(&mut self, conn_id: u32) {
        if !self.ids.insert(conn_id) {
            return;
        }
        self.order.push_back(conn_id);
        if self.order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
    }
}

impl ConnectionTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a stream. Returns `false` and leaves the table unchanged if
    /// `conn_id` is already present.
    pub fn insert(&self, conn_id: u32, entry: StreamEntry) -> bool {
        match self.streams.entry(conn_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        }
    }

    /// Remove a stream, returning its handles if it was present. A removed
    /// connID is retired.
    pub fn remove(&self, conn_id: u32) -> Option<StreamEntry> {
        let entry = self.streams.remove(&conn_id).map(|(_, entry)| entry);
        if entry.is_some() {
            self.retire(conn_id);
        }
        entry
    }

    /// Remember `conn_id` as finished.
    pub fn retire(&self, conn_id: u32) {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(conn_id);
    }

    /// Whether `conn_id` was recently closed.
    #[must_use]
    pub fn is_retired(&self, conn_id: u32) -> bool {
        self.retired
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(&conn_id)
    }

    /// Clone the inbound queue sender for `conn_id`.
    #[must_use]
    pub fn sender(&self, conn_id: u32) -> Option<mpsc::Sender<Vec<u8>>> {
        self.streams.get(&conn_id).map(|entry| entry.data_tx.clone())
    }

    /// Whether `conn_id` is live.
    #[must_use]
    pub fn contains(&self, conn_id: u32) -> bool {
        self.streams.contains_key(&conn_id)
    }

    /// Snapshot of live connIDs.
    #[must_use]
    pub fn conn_ids(&self) -> Vec<u32> {
        self.streams.iter().map(|entry| *entry.key()).collect()
    }

    /// Number of live streams.
    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Whether no stream is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> (StreamEntry, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(4);
        (StreamEntry::new(tx, Arc::new(Notify::new())), rx)
    }

    #[test]
    fn test_insert_remove() {
        let table = ConnectionTable::new();
        assert!(table.is_empty());

        let (e, _rx) = entry();
        assert!(table.insert(1, e));
        assert!(table.contains(1));
        assert_eq!(table.len(), 1);

        assert!(table.remove(1).is_some());
        assert!(table.remove(1).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let table = ConnectionTable::new();
        let (first, _rx1) = entry();
        let (second, _rx2) = entry();

        assert!(table.insert(9, first));
        assert!(!table.insert(9, second));
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_sender_reaches_queue() {
        let table = ConnectionTable::new();
        let (e, mut rx) = entry();
        table.insert(3, e);

        let tx = table.sender(3).unwrap();
        tx.send(b"hi".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), b"hi");
        assert!(table.sender(4).is_none());
    }

    #[tokio::test]
    async fn test_close_ends_queue_and_notifies() {
        let table = ConnectionTable::new();
        let (e, mut rx) = entry();
        let shutdown = Arc::clone(&e.shutdown);
        table.insert(5, e);

        table.remove(5).unwrap().close();
        // Permit is stored, so a later wait completes immediately
        shutdown.notified().await;
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_removed_ids_are_retired() {
        let table = ConnectionTable::new();
        let (e, _rx) = entry();
        table.insert(6, e);
        assert!(!table.is_retired(6));

        table.remove(6);
        assert!(table.is_retired(6));
        // Removing an absent id retires nothing
        table.remove(7);
        assert!(!table.is_retired(7));
    }

    #[test]
    fn test_retired_ids_are_bounded() {
        let table = ConnectionTable::new();
        for id in 0..=RETIRED_CAPACITY as u32 {
            table.retire(id);
        }
        assert!(!table.is_retired(0));
        assert!(table.is_retired(1));
        assert!(table.is_retired(RETIRED_CAPACITY as u32));

        let retired = table.retired.lock().unwrap();
        assert_eq!(retired.order.len(), RETIRED_CAPACITY);
        assert_eq!(retired.ids.len(), RETIRED_CAPACITY);
    }

    #[test]
    fn test_conn_ids_snapshot() {
        let table = ConnectionTable::new();
        let mut receivers = Vec::new();
        for id in [4, 2, 8] {
            let (e, rx) = entry();
            receivers.push(rx);
            table.insert(id, e);
        }
        let mut ids = table.conn_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![2, 4, 8]);
    }
}
