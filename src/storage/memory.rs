//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use super::{Storage, StorageError, TaskRecord};
use crate::core::types::TaskId;

#[derive(Default)]
struct Inner {
    next_seq: u64,
    /// Record plus its insertion sequence number.
    tasks: HashMap<TaskId, (u64, TaskRecord)>,
}

/// In-memory storage backend.
///
/// Thread-safe storage using RwLock for concurrent access.
/// Data is not persisted across restarts.
pub struct InMemoryStorage {
    inner: RwLock<Inner>,
    unavailable_writes: AtomicU32,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            unavailable_writes: AtomicU32::new(0),
        }
    }

    /// Make the next `count` updates fail with [`StorageError::Unavailable`].
    ///
    /// Used by tests to exercise the transient-failure path.
    pub fn fail_next_updates(&self, count: u32) {
        self.unavailable_writes.store(count, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.unavailable_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn sorted(inner: &Inner, filter: impl Fn(&TaskRecord) -> bool) -> Vec<TaskRecord> {
        let mut entries: Vec<_> = inner
            .tasks
            .values()
            .filter(|(_, r)| filter(r))
            .collect();
        entries.sort_by(|(sa, a), (sb, b)| {
            a.task()
                .created_at()
                .cmp(&b.task().created_at())
                .then(sa.cmp(sb))
        });
        entries.into_iter().map(|(_, r)| r.clone()).collect()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn insert_task(&self, record: TaskRecord) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        if inner.tasks.contains_key(record.id()) {
            return Err(StorageError::DuplicateKey(format!("task: {}", record.id())));
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.tasks.insert(record.id().clone(), (seq, record));
        Ok(())
    }

    async fn get_task(&self, id: &TaskId) -> Result<TaskRecord, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        inner
            .tasks
            .get(id)
            .map(|(_, r)| r.clone())
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", id)))
    }

    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Self::sorted(&inner, |_| true))
    }

    async fn update_task(&self, record: &mut TaskRecord) -> Result<(), StorageError> {
        if self.take_injected_failure() {
            return Err(StorageError::Unavailable("injected failure".into()));
        }

        let mut inner = self.inner.write().map_err(|_| StorageError::LockPoisoned)?;
        let (_, stored) = inner
            .tasks
            .get_mut(record.id())
            .ok_or_else(|| StorageError::NotFound(format!("task: {}", record.id())))?;

        if stored.version != record.version {
            return Err(StorageError::Conflict {
                id: record.id().to_string(),
                expected: record.version,
                actual: stored.version,
            });
        }

        record.version += 1;
        *stored = record.clone();
        Ok(())
    }

    async fn get_incomplete_tasks(&self) -> Result<Vec<TaskRecord>, StorageError> {
        let inner = self.inner.read().map_err(|_| StorageError::LockPoisoned)?;
        Ok(Self::sorted(&inner, |r| !r.state().is_terminal()))
    }
}
