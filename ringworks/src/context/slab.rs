use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering, fence};

/// Ordered teardown run when the last reference to a slab value goes away.
pub(crate) trait Reclaim: Send + 'static {
    fn reclaim(self);
}

#[derive(Debug)]
struct Slot<T> {
    refs: AtomicU32,
    generation: AtomicU32,
    value: Mutex<Option<T>>,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            refs: AtomicU32::new(0),
            generation: AtomicU32::new(0),
            value: Mutex::new(None),
        }
    }
}

/// Fixed capacity arena of reference counted values, addressed by
/// generation-checked indices.
///
/// Allocation never blocks: when the free list is empty a single pre-reserved
/// emergency slot is handed out, after that reservation fails. Values are only
/// reachable through [`SlabRef`] handles, so releasing twice or touching a
/// released value cannot be expressed.
pub(crate) struct RefSlab<T> {
    // `capacity` regular slots followed by the emergency slot.
    slots: Box<[Slot<T>]>,
    free: ArrayQueue<u32>,
    emergency_in_use: AtomicBool,
    live: AtomicUsize,
}

impl<T: Reclaim> RefSlab<T> {
    #[track_caller]
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        assert!(capacity > 0, "slab capacity must be greater than 0");
        assert!(capacity < u32::MAX as usize, "slab capacity must fit in u32");

        let free = ArrayQueue::new(capacity);
        for idx in 0..capacity as u32 {
            let _ = free.push(idx);
        }

        Arc::new(Self {
            slots: (0..=capacity).map(|_| Slot::default()).collect(),
            free,
            emergency_in_use: AtomicBool::new(false),
            live: AtomicUsize::new(0),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Values currently allocated, emergency slot included.
    pub(crate) fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn emergency_index(&self) -> u32 {
        self.capacity() as u32
    }

    /// Reserve a slot for insertion. Insertion is a 2-step process where we
    /// first reserve the slot, but need to commit a value to keep it.
    pub(crate) fn reserve(self: &Arc<Self>) -> Option<Reservation<T>> {
        let index = self.free.pop().or_else(|| {
            self.emergency_in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .ok()
                .map(|_| {
                    tracing::debug!("request pool exhausted, using emergency slot");
                    self.emergency_index()
                })
        })?;

        Some(Reservation {
            slab: Arc::clone(self),
            index,
            committed: false,
        })
    }

    /// Resolves a non-owning lookup link. Fails once the value was released,
    /// even if its slot has been reused since.
    pub(crate) fn upgrade(self: &Arc<Self>, weak: WeakRef) -> Option<SlabRef<T>> {
        let slot = self.slots.get(weak.index as usize)?;

        // Reclaim bumps the generation while holding the value lock.
        let _guard = slot.value.lock();
        if slot.generation.load(Ordering::Acquire) != weak.generation {
            return None;
        }

        slot.refs
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |n| {
                (n > 0).then_some(n + 1)
            })
            .ok()?;

        Some(SlabRef {
            slab: Arc::clone(self),
            index: weak.index,
            generation: weak.generation,
        })
    }

    fn release_index(&self, index: u32) {
        if index == self.emergency_index() {
            self.emergency_in_use.store(false, Ordering::Release);
        } else {
            // Cannot fail, at most `capacity` regular indices exist.
            let _ = self.free.push(index);
        }
    }

    fn reclaim(&self, index: u32) {
        let slot = &self.slots[index as usize];

        let value = {
            let mut guard = slot.value.lock();
            slot.generation.fetch_add(1, Ordering::Release);
            guard.take()
        };

        if let Some(value) = value {
            value.reclaim();
        }

        self.live.fetch_sub(1, Ordering::AcqRel);
        self.release_index(index);
    }
}

impl<T> fmt::Debug for RefSlab<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefSlab")
            .field("capacity", &self.free.capacity())
            .field("free", &self.free.len())
            .field("live", &self.live.load(Ordering::Relaxed))
            .finish()
    }
}

/// A reserved, still empty slot. Dropping it without committing gives the
/// slot back.
pub(crate) struct Reservation<T: Reclaim> {
    slab: Arc<RefSlab<T>>,
    index: u32,
    committed: bool,
}

impl<T: Reclaim> Reservation<T> {
    #[cfg(test)]
    pub(crate) fn key(&self) -> u32 {
        self.index
    }

    /// Stores `value` and returns its two initial references: one for the
    /// submission in flight, one for the completion pending.
    pub(crate) fn commit(mut self, value: T) -> (SlabRef<T>, SlabRef<T>) {
        let slot = &self.slab.slots[self.index as usize];

        let generation = {
            let mut guard = slot.value.lock();
            debug_assert!(guard.is_none(), "reserved slot is occupied");
            *guard = Some(value);
            slot.refs.store(2, Ordering::Release);
            slot.generation.load(Ordering::Acquire)
        };

        self.committed = true;
        self.slab.live.fetch_add(1, Ordering::AcqRel);

        let make = || SlabRef {
            slab: Arc::clone(&self.slab),
            index: self.index,
            generation,
        };
        (make(), make())
    }
}

impl<T: Reclaim> Drop for Reservation<T> {
    fn drop(&mut self) {
        // If we did not commit, release the reserved slot.
        if !self.committed {
            self.slab.release_index(self.index);
        }
    }
}

/// Non-owning, generation-checked lookup link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct WeakRef {
    index: u32,
    generation: u32,
}

/// An owned reference to a slab value. `Clone` retains, `Drop` releases.
pub(crate) struct SlabRef<T: Reclaim> {
    slab: Arc<RefSlab<T>>,
    index: u32,
    generation: u32,
}

impl<T: Reclaim> SlabRef<T> {
    #[inline(always)]
    fn slot(&self) -> &Slot<T> {
        &self.slab.slots[self.index as usize]
    }

    /// Runs `f` with exclusive access to the value.
    ///
    /// Must not be nested for the same value.
    #[track_caller]
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.slot().value.lock();
        let value = guard
            .as_mut()
            .expect("live reference points to an empty slot");
        f(value)
    }

    pub(crate) fn downgrade(&self) -> WeakRef {
        WeakRef {
            index: self.index,
            generation: self.generation,
        }
    }

    #[cfg(test)]
    pub(crate) fn ref_count(&self) -> u32 {
        self.slot().refs.load(Ordering::Acquire)
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slab, &other.slab)
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl<T: Reclaim> Clone for SlabRef<T> {
    fn clone(&self) -> Self {
        self.slot().refs.fetch_add(1, Ordering::Relaxed);
        Self {
            slab: Arc::clone(&self.slab),
            index: self.index,
            generation: self.generation,
        }
    }
}

impl<T: Reclaim> Drop for SlabRef<T> {
    fn drop(&mut self) {
        if self.slot().refs.fetch_sub(1, Ordering::Release) != 1 {
            return;
        }

        fence(Ordering::Acquire);
        self.slab.reclaim(self.index);
    }
}

impl<T: Reclaim> fmt::Debug for SlabRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlabRef")
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use static_assertions::assert_impl_all;
    use std::sync::Barrier;
    use std::thread;

    #[derive(Debug)]
    struct Tracked {
        id: usize,
        reclaimed: Arc<Vec<AtomicU32>>,
    }

    impl Reclaim for Tracked {
        fn reclaim(self) {
            self.reclaimed[self.id].fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracker(n: usize) -> Arc<Vec<AtomicU32>> {
        Arc::new((0..n).map(|_| AtomicU32::new(0)).collect())
    }

    assert_impl_all!(SlabRef<Tracked>: Send, Sync);
    assert_impl_all!(RefSlab<Tracked>: Send, Sync);

    #[test]
    fn test_two_refs_at_creation() -> Result<()> {
        let reclaimed = tracker(1);
        let slab = RefSlab::new(4);

        let (submit, complete) = slab.reserve().context("reserve")?.commit(Tracked {
            id: 0,
            reclaimed: reclaimed.clone(),
        });

        assert_eq!(submit.ref_count(), 2);
        assert_eq!(slab.live(), 1);

        drop(submit);
        assert_eq!(reclaimed[0].load(Ordering::SeqCst), 0);
        assert_eq!(complete.with(|t| t.id), 0);

        drop(complete);
        assert_eq!(reclaimed[0].load(Ordering::SeqCst), 1);
        assert_eq!(slab.live(), 0);
        Ok(())
    }

    #[test]
    fn test_uncommitted_reservation_is_returned() -> Result<()> {
        let slab = RefSlab::<Tracked>::new(1);

        let reserved = slab.reserve().context("reserve")?;
        let key = reserved.key();
        drop(reserved);

        assert_eq!(slab.reserve().context("reserve again")?.key(), key);
        assert_eq!(slab.live(), 0);
        Ok(())
    }

    #[test]
    fn test_emergency_slot_fallback() -> Result<()> {
        let reclaimed = tracker(2);
        let slab = RefSlab::new(1);

        let first = slab.reserve().context("regular")?.commit(Tracked {
            id: 0,
            reclaimed: reclaimed.clone(),
        });
        let emergency = slab.reserve().context("emergency")?;
        assert_eq!(emergency.key(), 1);
        assert!(slab.reserve().is_none());

        let second = emergency.commit(Tracked {
            id: 1,
            reclaimed: reclaimed.clone(),
        });
        assert_eq!(slab.live(), 2);

        drop(second);
        // The emergency slot is available again once released.
        assert_eq!(slab.reserve().context("emergency again")?.key(), 1);
        drop(first);
        assert_eq!(slab.live(), 0);
        Ok(())
    }

    #[test]
    fn test_weak_upgrade_checks_generation() -> Result<()> {
        let reclaimed = tracker(2);
        let slab = RefSlab::new(1);

        let (a, b) = slab.reserve().context("reserve")?.commit(Tracked {
            id: 0,
            reclaimed: reclaimed.clone(),
        });
        let weak = a.downgrade();

        let upgraded = slab.upgrade(weak).context("upgrade while alive")?;
        assert_eq!(upgraded.ref_count(), 3);
        drop((a, b, upgraded));
        assert!(slab.upgrade(weak).is_none());

        // Reuse the same slot, the stale link must not resolve to the new value.
        let (c, _d) = slab.reserve().context("reuse")?.commit(Tracked {
            id: 1,
            reclaimed,
        });
        assert_ne!(c.downgrade(), weak);
        assert!(slab.upgrade(weak).is_none());
        Ok(())
    }

    #[test]
    fn test_concurrent_retain_release_never_double_reclaims() -> Result<()> {
        const THREADS: usize = 4;
        const ROUNDS: usize = 200;

        let reclaimed = tracker(THREADS * ROUNDS);
        let slab = RefSlab::new(8);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|t| {
                let slab = slab.clone();
                let reclaimed = reclaimed.clone();
                let barrier = barrier.clone();

                thread::spawn(move || {
                    barrier.wait();
                    let mut weaks = Vec::new();

                    for round in 0..ROUNDS {
                        let id = t * ROUNDS + round;
                        let Some(reserved) = slab.reserve() else {
                            // Pool pressure, count it as done.
                            reclaimed[id].fetch_add(1, Ordering::SeqCst);
                            continue;
                        };

                        let (a, b) = reserved.commit(Tracked {
                            id,
                            reclaimed: reclaimed.clone(),
                        });
                        weaks.push(a.downgrade());

                        let mut refs = vec![a, b];
                        for _ in 0..fastrand::usize(0..4) {
                            refs.push(refs[0].clone());
                        }

                        // Poke at stale links from previous rounds.
                        if let Some(w) = weaks.get(fastrand::usize(0..weaks.len())) {
                            if let Some(r) = slab.upgrade(*w) {
                                r.with(|v| assert!(v.id < THREADS * ROUNDS));
                            }
                        }

                        fastrand::shuffle(&mut refs);
                        refs.into_iter().for_each(drop);
                    }
                })
            })
            .collect::<Vec<_>>();

        for h in handles {
            h.join().map_err(|_| anyhow::anyhow!("worker panicked"))?;
        }

        assert_eq!(slab.live(), 0);
        assert!(reclaimed.iter().all(|n| n.load(Ordering::SeqCst) == 1));
        Ok(())
    }
}
