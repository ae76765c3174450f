use bitflags::bitflags;
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;
use std::fmt;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

bitflags! {
    /// Readiness bits. Values match `poll(2)`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollMask: u32 {
        const IN = 0x1;
        const PRI = 0x2;
        const OUT = 0x4;
        const ERR = 0x8;
        const HUP = 0x10;
    }
}

impl PollMask {
    /// Conditions reported regardless of the requested interest.
    pub const ALWAYS: PollMask = PollMask::ERR.union(PollMask::HUP);
}

/// A resource the engine can run operations against.
///
/// Every method may be called from the submitting thread, the polling
/// submitter or an offload worker. The `nonblock` argument is set on the
/// inline attempt: an implementation that cannot make progress without
/// sleeping must then return [`io::ErrorKind::WouldBlock`] instead.
pub trait File: Send + Sync + 'static {
    fn read(&self, buf: &mut [u8], offset: Option<u64>, nonblock: bool) -> io::Result<usize>;

    fn write(&self, buf: &[u8], offset: Option<u64>, nonblock: bool) -> io::Result<usize>;

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }

    /// Current readiness, `None` for files without a readiness notion.
    fn poll(&self) -> Option<PollMask> {
        None
    }

    /// Queue notified when readiness in `interest` may have changed.
    ///
    /// Files with split read and write readiness return distinct queues for
    /// `IN` and `OUT`.
    fn wait_queue(&self, _interest: PollMask) -> Option<Arc<WaitQueue>> {
        None
    }
}

// Regular files always "may block", the inline attempt hands them to the
// offload workers.
impl File for std::fs::File {
    fn read(&self, buf: &mut [u8], offset: Option<u64>, nonblock: bool) -> io::Result<usize> {
        if nonblock {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        match offset {
            Some(off) => self.read_at(buf, off),
            None => io::Read::read(&mut &*self, buf),
        }
    }

    fn write(&self, buf: &[u8], offset: Option<u64>, nonblock: bool) -> io::Result<usize> {
        if nonblock {
            return Err(io::ErrorKind::WouldBlock.into());
        }

        match offset {
            Some(off) => self.write_at(buf, off),
            None => io::Write::write(&mut &*self, buf),
        }
    }

    fn sync(&self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Receives readiness notifications from a [`WaitQueue`].
pub(crate) trait Waiter: Send + Sync {
    /// `deferred` asks the waiter not to run operations on the calling thread.
    fn wake(&self, mask: PollMask, deferred: bool);
}

struct WaitEntry {
    interest: PollMask,
    waiter: Arc<dyn Waiter>,
}

/// Readiness source shared between a [`File`] and the engine.
///
/// The file calls [`WaitQueue::wake`] whenever its readiness may have
/// changed. The engine registers one entry per armed poll and removes it once
/// the poll fires or is cancelled.
#[derive(Default)]
pub struct WaitQueue {
    entries: Mutex<Slab<WaitEntry>>,
}

impl WaitQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Notifies every waiter interested in `mask`. Ready operations are
    /// re-run on the calling thread.
    pub fn wake(&self, mask: PollMask) {
        self.notify(mask, false);
    }

    /// Same as [`WaitQueue::wake`] but ready operations are handed to the
    /// offload workers. Use this from contexts that must not run operations,
    /// e.g. while holding a lock the operation itself takes.
    pub fn wake_deferred(&self, mask: PollMask) {
        self.notify(mask, true);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn register(&self, interest: PollMask, waiter: Arc<dyn Waiter>) -> usize {
        self.entries.lock().insert(WaitEntry { interest, waiter })
    }

    pub(crate) fn unregister(&self, key: usize) -> bool {
        self.entries.lock().try_remove(key).is_some()
    }

    fn notify(&self, mask: PollMask, deferred: bool) {
        // Waiters unregister themselves when woken, never call them with the
        // lock held.
        let waiters = self
            .entries
            .lock()
            .iter()
            .filter(|(_, e)| e.interest.union(PollMask::ALWAYS).intersects(mask))
            .map(|(_, e)| Arc::clone(&e.waiter))
            .collect::<SmallVec<[_; 4]>>();

        for waiter in waiters {
            waiter.wake(mask, deferred);
        }
    }
}

impl fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitQueue")
            .field("waiters", &self.entries.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use std::io::Write;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct Counter {
        woken: AtomicU32,
        deferred: AtomicU32,
    }

    impl Waiter for Counter {
        fn wake(&self, _mask: PollMask, deferred: bool) {
            self.woken.fetch_add(1, Ordering::SeqCst);
            if deferred {
                self.deferred.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_wake_filters_by_interest() {
        let wq = WaitQueue::new();
        let reader = Arc::new(Counter::default());
        let writer = Arc::new(Counter::default());

        let r = wq.register(PollMask::IN, reader.clone());
        wq.register(PollMask::OUT, writer.clone());

        wq.wake(PollMask::IN);
        assert_eq!(reader.woken.load(Ordering::SeqCst), 1);
        assert_eq!(writer.woken.load(Ordering::SeqCst), 0);

        // Hangup reaches everyone.
        wq.wake_deferred(PollMask::HUP);
        assert_eq!(reader.deferred.load(Ordering::SeqCst), 1);
        assert_eq!(writer.deferred.load(Ordering::SeqCst), 1);

        assert!(wq.unregister(r));
        assert!(!wq.unregister(r));
        assert_eq!(wq.len(), 1);
    }

    #[test]
    fn test_regular_file_blocks_inline() -> Result<()> {
        let mut tmp = tempfile::tempfile()?;
        tmp.write_all(b"ringworks")?;

        let mut buf = [0u8; 4];
        let err = File::read(&tmp, &mut buf, Some(0), true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

        assert_eq!(File::read(&tmp, &mut buf, Some(4), false)?, 4);
        assert_eq!(&buf, b"work");
        Ok(())
    }
}
