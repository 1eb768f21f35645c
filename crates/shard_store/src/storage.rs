//! Storage engine seam.
//!
//! The index tree is the source of truth for record contents; the storage
//! engine persists record images and answers the capacity question replicas
//! ask before accepting a write. `MemoryStorage` backs tests and the
//! simulator; `FjallStorage` persists images to a fjall keyspace.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use fjall::{Keyspace, PartitionCreateOptions};

use crate::pickle;
use crate::record::Digest;

/// Persistence surface used by replica writes and migration installs.
pub trait StorageEngine: Send + Sync + 'static {
    /// Whether a further record write would fit. Checked before any
    /// replica or migration apply.
    fn has_space(&self) -> bool;

    /// Persist the record image for `digest`, replacing any prior image.
    fn write_record(&self, digest: &Digest, image: &[u8]) -> anyhow::Result<()>;

    /// Remove the record image for `digest`. Absent images are fine.
    fn delete_record(&self, digest: &Digest) -> anyhow::Result<()>;

    fn used_bytes(&self) -> u64;
}

/// In-memory engine with an optional capacity cap.
pub struct MemoryStorage {
    capacity: Option<u64>,
    used: AtomicU64,
    images: RwLock<HashMap<Digest, Bytes>>,
}

impl MemoryStorage {
    pub fn unbounded() -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage {
            capacity: None,
            used: AtomicU64::new(0),
            images: RwLock::new(HashMap::new()),
        })
    }

    pub fn with_capacity(capacity: u64) -> Arc<MemoryStorage> {
        Arc::new(MemoryStorage {
            capacity: Some(capacity),
            used: AtomicU64::new(0),
            images: RwLock::new(HashMap::new()),
        })
    }

    pub fn image(&self, digest: &Digest) -> Option<Bytes> {
        self.images.read().ok()?.get(digest).cloned()
    }
}

impl StorageEngine for MemoryStorage {
    fn has_space(&self) -> bool {
        match self.capacity {
            None => true,
            Some(capacity) => self.used.load(Ordering::Relaxed) < capacity,
        }
    }

    fn write_record(&self, digest: &Digest, image: &[u8]) -> anyhow::Result<()> {
        let footprint = pickle::storage_footprint(image)?;
        let mut images = match self.images.write() {
            Ok(images) => images,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = images.insert(*digest, Bytes::copy_from_slice(image)) {
            let old_footprint = pickle::storage_footprint(&old).unwrap_or(old.len() as u64);
            self.used.fetch_sub(old_footprint, Ordering::Relaxed);
        }
        self.used.fetch_add(footprint, Ordering::Relaxed);
        Ok(())
    }

    fn delete_record(&self, digest: &Digest) -> anyhow::Result<()> {
        let mut images = match self.images.write() {
            Ok(images) => images,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = images.remove(digest) {
            let old_footprint = pickle::storage_footprint(&old).unwrap_or(old.len() as u64);
            self.used.fetch_sub(old_footprint, Ordering::Relaxed);
        }
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}

/// Fjall-backed engine persisting record images to one keyspace partition.
pub struct FjallStorage {
    _keyspace: Arc<Keyspace>,
    records: fjall::PartitionHandle,
    capacity: Option<u64>,
    used: AtomicU64,
}

impl FjallStorage {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Arc<FjallStorage>> {
        Self::open_with_capacity(path, None)
    }

    pub fn open_with_capacity(
        path: impl AsRef<Path>,
        capacity: Option<u64>,
    ) -> anyhow::Result<Arc<FjallStorage>> {
        let keyspace = Arc::new(fjall::Config::new(path).open()?);
        let records = keyspace.open_partition("records", PartitionCreateOptions::default())?;

        // Rebuild the usage gauge from what is already on disk.
        let mut used = 0u64;
        for item in records.iter() {
            let (_, image) = item?;
            used += pickle::storage_footprint(&image).unwrap_or(image.len() as u64);
        }

        Ok(Arc::new(FjallStorage {
            _keyspace: keyspace,
            records,
            capacity,
            used: AtomicU64::new(used),
        }))
    }
}

impl StorageEngine for FjallStorage {
    fn has_space(&self) -> bool {
        match self.capacity {
            None => true,
            Some(capacity) => self.used.load(Ordering::Relaxed) < capacity,
        }
    }

    fn write_record(&self, digest: &Digest, image: &[u8]) -> anyhow::Result<()> {
        let footprint = pickle::storage_footprint(image)?;
        if let Some(old) = self.records.get(digest.as_bytes())? {
            let old_footprint = pickle::storage_footprint(&old).unwrap_or(old.len() as u64);
            self.used.fetch_sub(old_footprint, Ordering::Relaxed);
        }
        self.records.insert(digest.as_bytes(), image)?;
        self.used.fetch_add(footprint, Ordering::Relaxed);
        Ok(())
    }

    fn delete_record(&self, digest: &Digest) -> anyhow::Result<()> {
        if let Some(old) = self.records.get(digest.as_bytes())? {
            let old_footprint = pickle::storage_footprint(&old).unwrap_or(old.len() as u64);
            self.used.fetch_sub(old_footprint, Ordering::Relaxed);
            self.records.remove(digest.as_bytes())?;
        }
        Ok(())
    }

    fn used_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }
}
