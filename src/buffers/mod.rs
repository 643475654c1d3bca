use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::{BufMut, Bytes, BytesMut};

use crate::transform::WireRecord;

/// One drained generation of the buffer: whole action/document pairs in
/// arrival order.
#[derive(Debug, Default)]
pub struct Batch {
    records: Vec<WireRecord>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of wire records (two per document).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn documents(&self) -> usize {
        self.records.len() / 2
    }

    pub fn records(&self) -> &[WireRecord] {
        &self.records
    }

    /// Render the `_bulk` request body: every record on its own line, the
    /// last one newline-terminated as well.
    pub fn to_ndjson(&self) -> Bytes {
        let size: usize = self.records.iter().map(|r| r.len() + 1).sum();
        let mut body = BytesMut::with_capacity(size);
        for record in &self.records {
            body.put_slice(record.as_bytes());
            body.put_u8(b'\n');
        }
        body.freeze()
    }
}

/// Shared, append-only record buffer drained by swapping in an empty
/// generation.
///
/// Uses `std::sync::Mutex` (not tokio) because the lock is never held across
/// `.await`; pushes and the drain swap are the only critical sections.
#[derive(Clone, Default)]
pub struct RecordBuffer {
    records: Arc<Mutex<Vec<WireRecord>>>,
}

impl RecordBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an action line and its document under one lock acquisition, so
    /// a concurrent `take` sees both or neither.
    pub fn push_pair(&self, header: WireRecord, body: WireRecord) {
        let mut records = self.lock();
        records.reserve(2);
        records.push(header);
        records.push(body);
    }

    /// Take every buffered record, leaving an empty buffer behind.
    pub fn take(&self) -> Batch {
        Batch {
            records: std::mem::take(&mut *self.lock()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    // Pushes cannot panic after `reserve`, so a poisoned lock still guards
    // whole pairs.
    fn lock(&self) -> MutexGuard<'_, Vec<WireRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
