//! Partition-scoped index tree: a digest-ordered map from record key to
//! record entry.
//!
//! Entries are `Arc`-shared with a per-record mutex, so readers pin an
//! entry, drop the tree lock, then lock just that record. `reduce`
//! snapshots the entry list under the tree lock and visits records without
//! holding it, which lets inserts and deletes proceed while a migration
//! streams the tree.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use bytes::Bytes;

use crate::record::{Bin, Digest, RecordMeta};

/// Mutable state of one record, guarded by the entry lock.
#[derive(Clone, Debug, Default)]
pub struct RecordCore {
    pub meta: RecordMeta,
    pub bins: Vec<Bin>,
    /// Stored key bytes, when the client asked for the key to be kept.
    pub key: Option<Bytes>,
}

/// One index entry. The digest is immutable; everything else sits behind
/// the entry lock.
pub struct Record {
    digest: Digest,
    core: Mutex<RecordCore>,
}

impl Record {
    fn new(digest: Digest) -> Arc<Record> {
        Arc::new(Record {
            digest,
            core: Mutex::new(RecordCore::default()),
        })
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    /// Acquire the entry lock. Poisoning is recovered; a record is never
    /// left permanently unreachable by a panicking writer.
    pub fn lock(&self) -> MutexGuard<'_, RecordCore> {
        match self.core.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Digest-ordered record map for one partition.
#[derive(Default)]
pub struct IndexTree {
    records: RwLock<BTreeMap<Digest, Arc<Record>>>,
}

impl IndexTree {
    pub fn new() -> IndexTree {
        IndexTree::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, digest: &Digest) -> Option<Arc<Record>> {
        self.records.read().ok()?.get(digest).cloned()
    }

    /// Fetch or create the entry for `digest`. The second return value is
    /// true when the entry was created by this call; creators must either
    /// fill the record or remove it again - a zero-bin entry must not
    /// survive past the operation that created it.
    pub fn get_or_create(&self, digest: Digest) -> (Arc<Record>, bool) {
        if let Some(record) = self.get(&digest) {
            return (record, false);
        }
        let mut records = match self.records.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match records.get(&digest) {
            Some(record) => (record.clone(), false),
            None => {
                let record = Record::new(digest);
                records.insert(digest, record.clone());
                (record, true)
            }
        }
    }

    pub fn delete(&self, digest: &Digest) -> bool {
        match self.records.write() {
            Ok(mut records) => records.remove(digest).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(digest).is_some(),
        }
    }

    /// Visit every entry present at the start of the call, in digest
    /// order. The callback returns `false` to stop early. Entries deleted
    /// after the snapshot are still visited (pinned by the snapshot);
    /// entries inserted after it are not.
    pub fn reduce(&self, mut f: impl FnMut(&Arc<Record>) -> bool) {
        let snapshot: Vec<Arc<Record>> = match self.records.read() {
            Ok(records) => records.values().cloned().collect(),
            Err(_) => return,
        };
        for record in &snapshot {
            if !f(record) {
                break;
            }
        }
    }
}
