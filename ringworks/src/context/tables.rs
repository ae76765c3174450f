use crate::file::File;
use crate::sqe::errors::EngineError;
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One immutable generation of a registered resource table.
#[derive(Debug)]
pub(crate) struct FixedTable<T> {
    generation: u64,
    slots: Box<[Option<T>]>,
}

impl<T> FixedTable<T> {
    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index).and_then(Option::as_ref)
    }
}

/// Index addressed table of registered resources.
///
/// Readers take a snapshot (`Arc`) of the current generation and keep it for
/// as long as their request lives. Writers never mutate a published
/// generation, they install a modified copy. Old generations drain through
/// their own reference count.
pub(crate) struct ResourceTable<T> {
    kind: &'static str,
    current: RwLock<Option<Arc<FixedTable<T>>>>,
    // Serializes writers so that copy-on-write updates do not lose each other.
    writer: Mutex<()>,
    next_generation: AtomicU64,
}

impl<T: Clone> ResourceTable<T> {
    pub(crate) fn new(kind: &'static str) -> Self {
        Self {
            kind,
            current: RwLock::new(None),
            writer: Mutex::new(()),
            next_generation: AtomicU64::new(1),
        }
    }

    fn publish(&self, slots: Box<[Option<T>]>) {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        *self.current.write() = Some(Arc::new(FixedTable { generation, slots }));
        tracing::debug!(kind = self.kind, generation, "published resource table");
    }

    pub(crate) fn register(&self, entries: Vec<Option<T>>) -> Result<(), EngineError> {
        let _writer = self.writer.lock();

        if self.current.read().is_some() {
            return Err(EngineError::AlreadyRegistered(self.kind));
        }
        if entries.is_empty() {
            return Err(EngineError::InvalidConfig(format!(
                "cannot register an empty {} table",
                self.kind
            )));
        }

        self.publish(entries.into_boxed_slice());
        Ok(())
    }

    pub(crate) fn unregister(&self) -> Result<(), EngineError> {
        let _writer = self.writer.lock();

        match self.current.write().take() {
            Some(old) => {
                tracing::debug!(
                    kind = self.kind,
                    generation = old.generation,
                    "unregistered resource table"
                );
                Ok(())
            }
            None => Err(EngineError::NotRegistered(self.kind)),
        }
    }

    /// Replaces `entries.len()` slots starting at `offset`. Returns the number
    /// of updated slots.
    pub(crate) fn update(
        &self,
        offset: u32,
        entries: Vec<Option<T>>,
    ) -> Result<usize, EngineError> {
        let _writer = self.writer.lock();

        let current = self
            .snapshot()
            .ok_or(EngineError::NotRegistered(self.kind))?;

        let start = offset as usize;
        let end = start
            .checked_add(entries.len())
            .filter(|end| *end <= current.len())
            .ok_or(EngineError::UpdateOutOfRange {
                offset,
                len: entries.len(),
                capacity: current.len(),
            })?;

        let mut slots = current.slots.to_vec();
        let updated = entries.len();
        slots[start..end]
            .iter_mut()
            .zip(entries)
            .for_each(|(slot, entry)| *slot = entry);

        self.publish(slots.into_boxed_slice());
        Ok(updated)
    }

    pub(crate) fn snapshot(&self) -> Option<Arc<FixedTable<T>>> {
        self.current.read().clone()
    }

    /// Resolves `index` in the current generation, returning the generation
    /// alongside the entry so the caller can pin it.
    pub(crate) fn lookup(&self, index: usize) -> Option<(Arc<FixedTable<T>>, T)> {
        let table = self.snapshot()?;
        let entry = table.get(index)?.clone();
        Some((table, entry))
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> Option<u64> {
        self.current.read().as_ref().map(|t| t.generation)
    }
}

impl<T> fmt::Debug for ResourceTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("kind", &self.kind)
            .field(
                "generation",
                &self.current.read().as_ref().map(|t| t.generation),
            )
            .finish()
    }
}

/// A registered buffer owned by the engine.
#[derive(Debug)]
pub(crate) struct RegisteredBuffer {
    data: Mutex<Box<[u8]>>,
}

impl RegisteredBuffer {
    pub(crate) fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data.into_boxed_slice()),
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.data.lock().len()
    }
}

pub(crate) type FileTableGen = FixedTable<Arc<dyn File>>;

/// A resolved file, pinned for the lifetime of one request. Fixed files also
/// pin the table generation they were resolved from.
#[derive(Clone)]
pub(crate) struct FileRef {
    pub(crate) file: Arc<dyn File>,
    pub(crate) table: Option<Arc<FileTableGen>>,
}

impl fmt::Debug for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRef")
            .field("generation", &self.table.as_ref().map(|t| t.generation))
            .finish()
    }
}

/// Descriptor table for ordinary, non-registered files.
#[derive(Default)]
pub(crate) struct FileTable {
    files: RwLock<Slab<Arc<dyn File>>>,
}

impl FileTable {
    pub(crate) fn install(&self, file: Arc<dyn File>) -> Result<i32, EngineError> {
        let mut files = self.files.write();
        let entry = files.vacant_entry();
        let fd = i32::try_from(entry.key())
            .map_err(|_| EngineError::InvalidConfig("descriptor space exhausted".into()))?;
        entry.insert(file);
        Ok(fd)
    }

    pub(crate) fn close(&self, fd: i32) -> Result<(), EngineError> {
        let mut files = self.files.write();
        usize::try_from(fd)
            .ok()
            .and_then(|key| files.try_remove(key))
            .map(drop)
            .ok_or(EngineError::BadFd(fd))
    }

    pub(crate) fn get(&self, fd: i32) -> Option<Arc<dyn File>> {
        let key = usize::try_from(fd).ok()?;
        self.files.read().get(key).cloned()
    }
}

impl fmt::Debug for FileTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileTable")
            .field("open", &self.files.read().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(ResourceTable<Arc<dyn File>>: Send, Sync);
    assert_impl_all!(FileRef: Send, Sync);

    #[test]
    fn test_register_and_lookup() -> Result<()> {
        let table = ResourceTable::new("test");
        assert!(table.lookup(0).is_none());

        table.register(vec![Some(10), None, Some(30)])?;
        assert!(matches!(
            table.register(vec![Some(1)]),
            Err(EngineError::AlreadyRegistered(_))
        ));

        let (_, v) = table.lookup(2).context("slot 2")?;
        assert_eq!(v, 30);
        assert!(table.lookup(1).is_none());
        assert!(table.lookup(3).is_none());
        Ok(())
    }

    #[test]
    fn test_update_is_copy_on_write() -> Result<()> {
        let table = ResourceTable::new("test");
        table.register(vec![Some(1), Some(2), Some(3)])?;

        let (pinned, v) = table.lookup(1).context("slot 1")?;
        let old_generation = pinned.generation();
        assert_eq!(v, 2);

        assert_eq!(table.update(1, vec![Some(20), None])?, 2);

        // The pinned generation is untouched.
        assert_eq!(pinned.get(1), Some(&2));
        assert_eq!(pinned.get(2), Some(&3));

        let (current, v) = table.lookup(1).context("updated slot 1")?;
        assert_eq!(v, 20);
        assert!(current.generation() > old_generation);
        assert!(table.lookup(2).is_none());
        Ok(())
    }

    #[rstest]
    #[case::past_end(2, 2)]
    #[case::offset_out(5, 1)]
    fn test_update_out_of_range(#[case] offset: u32, #[case] len: usize) -> Result<()> {
        let table = ResourceTable::new("test");
        table.register(vec![Some(0u8); 3])?;

        let err = table.update(offset, vec![Some(1); len]).unwrap_err();
        assert!(matches!(err, EngineError::UpdateOutOfRange { .. }));
        Ok(())
    }

    #[test]
    fn test_unregister_keeps_snapshots_alive() -> Result<()> {
        let table = ResourceTable::new("test");
        table.register(vec![Some(Arc::new(7))])?;

        let (pinned, value) = table.lookup(0).context("slot 0")?;
        table.unregister()?;

        assert!(table.snapshot().is_none());
        assert!(matches!(table.unregister(), Err(EngineError::NotRegistered(_))));
        assert_eq!(*value, 7);
        assert_eq!(pinned.len(), 1);
        Ok(())
    }
}
