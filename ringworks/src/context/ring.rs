use crate::sqe::errors::EngineError;
use crate::sqe::{Cqe, CqeFlags, Sqe};
use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::io;
use std::mem::{self, offset_of};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering, fence};

/// Cache line alignment used for both ring regions.
const RING_ALIGN: usize = 64;

bitflags! {
    /// Flags published by the engine in the submission ring header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SqRingFlags: u32 {
        /// The polling submitter is asleep and needs an `enter` with
        /// `EnterFlags::SQ_WAKEUP`.
        const NEED_WAKEUP = 1;

        /// Completions are waiting in the overflow backlog.
        const CQ_OVERFLOW = 1 << 1;
    }
}

/// Shared control block at the start of the ring region.
///
/// Cursors are free running `u32` values, an index into an array is always
/// `cursor & mask`. The engine owns `sq_head` and `cq_tail`, the caller owns
/// `sq_tail` and `cq_head`.
#[repr(C, align(64))]
#[derive(Debug)]
pub(crate) struct RingHeader {
    pub(crate) sq_head: AtomicU32,
    pub(crate) sq_tail: AtomicU32,
    pub(crate) sq_ring_mask: u32,
    pub(crate) sq_ring_entries: u32,
    pub(crate) sq_flags: AtomicU32,
    pub(crate) sq_dropped: AtomicU32,

    pub(crate) cq_head: AtomicU32,
    pub(crate) cq_tail: AtomicU32,
    pub(crate) cq_ring_mask: u32,
    pub(crate) cq_ring_entries: u32,
    pub(crate) cq_flags: AtomicU32,
    /// Completions discarded at teardown. Never incremented while the engine runs.
    pub(crate) cq_overflow: AtomicU32,
}

const_assert_eq!(mem::size_of::<RingHeader>(), RING_ALIGN);

/// Byte offsets of the submission ring fields inside the ring region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub flags: u32,
    pub dropped: u32,
    pub array: u32,
}

/// Byte offsets of the completion ring fields inside the ring region.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CqOffsets {
    pub head: u32,
    pub tail: u32,
    pub ring_mask: u32,
    pub ring_entries: u32,
    pub overflow: u32,
    pub cqes: u32,
    pub flags: u32,
}

/// Layout of the two shared regions: the ring region (header, completion
/// entries, submission index array) and the submission entry array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RingLayout {
    pub(crate) sq_entries: u32,
    pub(crate) cq_entries: u32,
    pub(crate) cqes_offset: usize,
    pub(crate) array_offset: usize,
    pub(crate) ring_size: usize,
    pub(crate) sqes_size: usize,
}

impl RingLayout {
    pub(crate) fn new(sq_entries: u32, cq_entries: u32) -> Self {
        debug_assert!(sq_entries.is_power_of_two() && cq_entries.is_power_of_two());

        let cqes_offset = mem::size_of::<RingHeader>();
        let array_offset = cqes_offset + cq_entries as usize * mem::size_of::<Cqe>();
        let ring_size = array_offset + sq_entries as usize * mem::size_of::<u32>();

        Self {
            sq_entries,
            cq_entries,
            cqes_offset,
            array_offset,
            ring_size,
            sqes_size: sq_entries as usize * mem::size_of::<Sqe>(),
        }
    }

    pub(crate) fn sq_offsets(&self) -> SqOffsets {
        SqOffsets {
            head: offset_of!(RingHeader, sq_head) as u32,
            tail: offset_of!(RingHeader, sq_tail) as u32,
            ring_mask: offset_of!(RingHeader, sq_ring_mask) as u32,
            ring_entries: offset_of!(RingHeader, sq_ring_entries) as u32,
            flags: offset_of!(RingHeader, sq_flags) as u32,
            dropped: offset_of!(RingHeader, sq_dropped) as u32,
            array: self.array_offset as u32,
        }
    }

    pub(crate) fn cq_offsets(&self) -> CqOffsets {
        CqOffsets {
            head: offset_of!(RingHeader, cq_head) as u32,
            tail: offset_of!(RingHeader, cq_tail) as u32,
            ring_mask: offset_of!(RingHeader, cq_ring_mask) as u32,
            ring_entries: offset_of!(RingHeader, cq_ring_entries) as u32,
            overflow: offset_of!(RingHeader, cq_overflow) as u32,
            cqes: self.cqes_offset as u32,
            flags: offset_of!(RingHeader, cq_flags) as u32,
        }
    }
}

/// A zeroed, cache line aligned heap region.
#[derive(Debug)]
struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl Region {
    fn zeroed(size: usize) -> Result<Self, EngineError> {
        let layout = Layout::from_size_align(size, RING_ALIGN)
            .map_err(|e| EngineError::InvalidConfig(e.to_string()))?;

        // SAFETY: layout size is never zero, the header alone is one cache line.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from_raw_os_error(libc::ENOMEM))?;

        Ok(Self { ptr, layout })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `Region::zeroed` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// The memory shared between the caller and the engine.
///
/// All cross-party synchronization goes through the header cursors: entries
/// are written before the owning cursor is published with `Release`, and read
/// after the cursor is observed with `Acquire`.
#[derive(Debug)]
pub(crate) struct RingMemory {
    ring: Region,
    sqes: Region,
    layout: RingLayout,
}

// Safety: every mutable field is either atomic or guarded by the cursor
// protocol described above.
unsafe impl Send for RingMemory {}
unsafe impl Sync for RingMemory {}

impl RingMemory {
    pub(crate) fn new(layout: RingLayout) -> Result<Self, EngineError> {
        let ring = Region::zeroed(layout.ring_size)?;
        let sqes = Region::zeroed(layout.sqes_size)?;

        // SAFETY: the region is large enough and aligned for the header.
        unsafe {
            ring.ptr.cast::<RingHeader>().write(RingHeader {
                sq_head: AtomicU32::new(0),
                sq_tail: AtomicU32::new(0),
                sq_ring_mask: layout.sq_entries - 1,
                sq_ring_entries: layout.sq_entries,
                sq_flags: AtomicU32::new(0),
                sq_dropped: AtomicU32::new(0),
                cq_head: AtomicU32::new(0),
                cq_tail: AtomicU32::new(0),
                cq_ring_mask: layout.cq_entries - 1,
                cq_ring_entries: layout.cq_entries,
                cq_flags: AtomicU32::new(0),
                cq_overflow: AtomicU32::new(0),
            });
        }

        Ok(Self { ring, sqes, layout })
    }

    #[inline(always)]
    pub(crate) fn header(&self) -> &RingHeader {
        // SAFETY: initialized in `new` and never moved.
        unsafe { self.ring.ptr.cast::<RingHeader>().as_ref() }
    }

    pub(crate) fn layout(&self) -> &RingLayout {
        &self.layout
    }

    pub(crate) fn ring_ptr(&self) -> NonNull<u8> {
        self.ring.ptr
    }

    pub(crate) fn sqes_ptr(&self) -> NonNull<u8> {
        self.sqes.ptr
    }

    #[inline(always)]
    fn sqe_slot(&self, idx: u32) -> *mut Sqe {
        debug_assert!(idx < self.layout.sq_entries);
        // SAFETY: in bounds of the sqes region.
        unsafe { self.sqes.ptr.as_ptr().cast::<Sqe>().add(idx as usize) }
    }

    #[inline(always)]
    fn cqe_slot(&self, idx: u32) -> *mut Cqe {
        debug_assert!(idx < self.layout.cq_entries);
        // SAFETY: in bounds of the cqes array inside the ring region.
        unsafe {
            self.ring
                .ptr
                .as_ptr()
                .add(self.layout.cqes_offset)
                .cast::<Cqe>()
                .add(idx as usize)
        }
    }

    #[inline(always)]
    fn array_slot(&self, idx: u32) -> *mut u32 {
        debug_assert!(idx < self.layout.sq_entries);
        // SAFETY: in bounds of the index array inside the ring region.
        unsafe {
            self.ring
                .ptr
                .as_ptr()
                .add(self.layout.array_offset)
                .cast::<u32>()
                .add(idx as usize)
        }
    }

    pub(crate) fn sq_flags(&self) -> SqRingFlags {
        SqRingFlags::from_bits_retain(self.header().sq_flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_sq_flag(&self, flag: SqRingFlags) {
        self.header()
            .sq_flags
            .fetch_or(flag.bits(), Ordering::SeqCst);
    }

    pub(crate) fn clear_sq_flag(&self, flag: SqRingFlags) {
        self.header()
            .sq_flags
            .fetch_and(!flag.bits(), Ordering::SeqCst);
    }
}

/// Engine side of the submission ring. There is exactly one consumer.
#[derive(Debug)]
pub(crate) struct SubmissionRing {
    mem: Arc<RingMemory>,
    head: u32,
    cached_tail: u32,
}

impl SubmissionRing {
    pub(crate) fn new(mem: Arc<RingMemory>) -> Self {
        Self {
            mem,
            head: 0,
            cached_tail: 0,
        }
    }

    /// Number of entries published by the caller and not yet consumed.
    pub(crate) fn submit_available(&mut self) -> Result<u32, EngineError> {
        let tail = self.mem.header().sq_tail.load(Ordering::Acquire);
        let pending = tail.wrapping_sub(self.head);

        if pending > self.mem.layout.sq_entries {
            return Err(EngineError::RingCorrupted(format!(
                "sq tail {} is {} entries ahead of head {} (ring holds {})",
                tail, pending, self.head, self.mem.layout.sq_entries
            )));
        }

        self.cached_tail = tail;
        Ok(pending)
    }

    /// Copies out the next published entry and only then advances the head.
    ///
    /// Entries whose index array slot points outside the ring are consumed,
    /// counted in `sq_dropped` and skipped.
    pub(crate) fn next_submission(&mut self) -> Option<Sqe> {
        let mem = Arc::clone(&self.mem);
        let hdr = mem.header();

        loop {
            if self.head == self.cached_tail && !self.refresh_tail() {
                return None;
            }

            let slot = self.head & hdr.sq_ring_mask;
            // SAFETY: `head` is strictly behind the published tail, so the
            // caller finished writing this slot before its `Release` store.
            let idx = unsafe { mem.array_slot(slot).read() };

            let sqe = if idx < hdr.sq_ring_entries {
                // SAFETY: same as above, `idx` is in bounds.
                Some(unsafe { mem.sqe_slot(idx).read() })
            } else {
                hdr.sq_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(slot, idx, "dropping submission with out of range index");
                None
            };

            self.head = self.head.wrapping_add(1);
            hdr.sq_head.store(self.head, Ordering::Release);

            if sqe.is_some() {
                return sqe;
            }
        }
    }

    fn refresh_tail(&mut self) -> bool {
        let tail = self.mem.header().sq_tail.load(Ordering::Acquire);
        let pending = tail.wrapping_sub(self.head);

        // A corrupted tail is reported by `submit_available`, never consumed here.
        if pending == 0 || pending > self.mem.layout.sq_entries {
            return false;
        }

        self.cached_tail = tail;
        true
    }
}

/// Engine side of the completion ring. Producers must serialize calls, the
/// completion engine does so with its backlog lock.
#[derive(Debug)]
pub(crate) struct CompletionRing {
    mem: Arc<RingMemory>,
}

impl CompletionRing {
    pub(crate) fn new(mem: Arc<RingMemory>) -> Self {
        Self { mem }
    }

    /// Writes one completion. Returns false, leaving the ring untouched, if the
    /// caller has not yet consumed enough entries to make room.
    pub(crate) fn post_completion(&self, user_data: u64, res: i32, flags: CqeFlags) -> bool {
        let hdr = self.mem.header();
        let tail = hdr.cq_tail.load(Ordering::Relaxed);
        let head = hdr.cq_head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= hdr.cq_ring_entries {
            return false;
        }

        // SAFETY: the slot is not visible to the caller until the tail moves.
        unsafe {
            self.mem
                .cqe_slot(tail & hdr.cq_ring_mask)
                .write(Cqe::new(user_data, res, flags));
        }

        hdr.cq_tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Completions visible to the caller and not yet consumed.
    pub(crate) fn ready(&self) -> u32 {
        let hdr = self.mem.header();
        let tail = hdr.cq_tail.load(Ordering::Acquire);
        let head = hdr.cq_head.load(Ordering::Acquire);
        tail.wrapping_sub(head)
    }

    pub(crate) fn mem(&self) -> &RingMemory {
        &self.mem
    }
}

/// Caller side of the submission ring.
#[derive(Debug)]
pub(crate) struct SqProducer {
    mem: Arc<RingMemory>,
    tail: u32,
}

impl SqProducer {
    pub(crate) fn new(mem: Arc<RingMemory>) -> Self {
        Self { mem, tail: 0 }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.mem.layout.sq_entries
    }

    /// Entries written (published or not) and not yet consumed by the engine.
    pub(crate) fn len(&self) -> u32 {
        let head = self.mem.header().sq_head.load(Ordering::Acquire);
        self.tail.wrapping_sub(head)
    }

    /// Entries published and not yet consumed by the engine.
    pub(crate) fn published(&self) -> u32 {
        let hdr = self.mem.header();
        let head = hdr.sq_head.load(Ordering::Acquire);
        hdr.sq_tail.load(Ordering::Relaxed).wrapping_sub(head)
    }

    pub(crate) fn push(&mut self, sqe: &Sqe) -> Result<(), EngineError> {
        if self.len() >= self.capacity() {
            return Err(EngineError::SqRingFull);
        }

        let slot = self.tail & self.mem.header().sq_ring_mask;

        // SAFETY: the engine does not read `slot` before the tail is published.
        unsafe {
            self.mem.sqe_slot(slot).write(*sqe);
            self.mem.array_slot(slot).write(slot);
        }

        self.tail = self.tail.wrapping_add(1);
        Ok(())
    }

    /// Publishes every pushed entry to the engine.
    pub(crate) fn sync(&mut self) {
        self.mem
            .header()
            .sq_tail
            .store(self.tail, Ordering::Release);
    }

    pub(crate) fn needs_wakeup(&self) -> bool {
        // Pairs with the polling thread publishing NEED_WAKEUP before it
        // re-reads the tail.
        fence(Ordering::SeqCst);
        self.mem.sq_flags().contains(SqRingFlags::NEED_WAKEUP)
    }

    pub(crate) fn dropped(&self) -> u32 {
        self.mem.header().sq_dropped.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn push_raw_index(&mut self, idx: u32) {
        let slot = self.tail & self.mem.header().sq_ring_mask;
        // SAFETY: same as `push`, the slot is not published yet.
        unsafe { self.mem.array_slot(slot).write(idx) };
        self.tail = self.tail.wrapping_add(1);
    }
}

/// Caller side of the completion ring.
#[derive(Debug)]
pub(crate) struct CqConsumer {
    mem: Arc<RingMemory>,
}

impl CqConsumer {
    pub(crate) fn new(mem: Arc<RingMemory>) -> Self {
        Self { mem }
    }

    pub(crate) fn capacity(&self) -> u32 {
        self.mem.layout.cq_entries
    }

    pub(crate) fn len(&self) -> u32 {
        let hdr = self.mem.header();
        let tail = hdr.cq_tail.load(Ordering::Acquire);
        tail.wrapping_sub(hdr.cq_head.load(Ordering::Relaxed))
    }

    pub(crate) fn pop(&mut self) -> Option<Cqe> {
        let hdr = self.mem.header();
        let head = hdr.cq_head.load(Ordering::Relaxed);
        let tail = hdr.cq_tail.load(Ordering::Acquire);

        if head == tail {
            return None;
        }

        // SAFETY: `head` is strictly behind the published tail.
        let cqe = unsafe { self.mem.cqe_slot(head & hdr.cq_ring_mask).read() };
        hdr.cq_head.store(head.wrapping_add(1), Ordering::Release);
        Some(cqe)
    }

    pub(crate) fn overflow_pending(&self) -> bool {
        self.mem.sq_flags().contains(SqRingFlags::CQ_OVERFLOW)
    }

    pub(crate) fn discarded(&self) -> u32 {
        self.mem.header().cq_overflow.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqe::Opcode;
    use anyhow::Result;

    fn rings(sq: u32, cq: u32) -> Result<(SqProducer, SubmissionRing, CompletionRing, CqConsumer)> {
        let mem = Arc::new(RingMemory::new(RingLayout::new(sq, cq))?);
        Ok((
            SqProducer::new(mem.clone()),
            SubmissionRing::new(mem.clone()),
            CompletionRing::new(mem.clone()),
            CqConsumer::new(mem),
        ))
    }

    #[test]
    fn test_layout_offsets() {
        let layout = RingLayout::new(8, 16);
        assert_eq!(layout.cqes_offset, 64);
        assert_eq!(layout.array_offset, 64 + 16 * 16);
        assert_eq!(layout.ring_size, 64 + 16 * 16 + 8 * 4);
        assert_eq!(layout.sqes_size, 8 * 64);

        let sq_off = layout.sq_offsets();
        let cq_off = layout.cq_offsets();
        assert_eq!(sq_off.head, 0);
        assert_eq!(sq_off.tail, 4);
        assert_eq!(cq_off.cqes, 64);
        assert!(cq_off.overflow < 64);
    }

    #[test]
    fn test_header_readable_through_offsets() -> Result<()> {
        let layout = RingLayout::new(4, 8);
        let mem = RingMemory::new(layout)?;
        let base = mem.ring_ptr().as_ptr();

        let read_u32 = |off: u32| unsafe { base.add(off as usize).cast::<u32>().read() };
        assert_eq!(read_u32(layout.sq_offsets().ring_entries), 4);
        assert_eq!(read_u32(layout.sq_offsets().ring_mask), 3);
        assert_eq!(read_u32(layout.cq_offsets().ring_entries), 8);
        assert_eq!(read_u32(layout.cq_offsets().ring_mask), 7);
        Ok(())
    }

    #[test]
    fn test_submission_roundtrip() -> Result<()> {
        let (mut producer, mut consumer, _, _) = rings(4, 8)?;

        for i in 0..3 {
            producer.push(&Sqe::nop().user_data(i))?;
        }

        // Nothing is visible before the tail is published.
        assert_eq!(consumer.submit_available()?, 0);
        assert!(consumer.next_submission().is_none());

        producer.sync();
        assert_eq!(consumer.submit_available()?, 3);

        let tags = std::iter::from_fn(|| consumer.next_submission())
            .map(|sqe| sqe.user_data)
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![0, 1, 2]);
        assert_eq!(producer.len(), 0);
        Ok(())
    }

    #[test]
    fn test_sq_full_and_wraparound() -> Result<()> {
        let (mut producer, mut consumer, _, _) = rings(2, 4)?;

        for round in 0..5u64 {
            producer.push(&Sqe::nop().user_data(round * 2))?;
            producer.push(&Sqe::nop().user_data(round * 2 + 1))?;
            assert!(matches!(
                producer.push(&Sqe::nop()),
                Err(EngineError::SqRingFull)
            ));

            producer.sync();
            assert_eq!(consumer.submit_available()?, 2);
            assert_eq!(consumer.next_submission().map(|s| s.user_data), Some(round * 2));
            assert_eq!(
                consumer.next_submission().map(|s| s.user_data),
                Some(round * 2 + 1)
            );
        }
        Ok(())
    }

    #[test]
    fn test_out_of_range_index_is_dropped() -> Result<()> {
        let (mut producer, mut consumer, _, _) = rings(4, 8)?;

        producer.push_raw_index(17);
        producer.push(&Sqe::new(Opcode::NOP).user_data(5))?;
        producer.sync();

        assert_eq!(consumer.next_submission().map(|s| s.user_data), Some(5));
        assert_eq!(producer.dropped(), 1);
        Ok(())
    }

    #[test]
    fn test_corrupted_tail_is_detected() -> Result<()> {
        let (producer, mut consumer, _, _) = rings(4, 8)?;
        producer.mem.header().sq_tail.store(9, Ordering::Release);

        let err = consumer.submit_available().unwrap_err();
        assert!(err.is_fatal());
        assert!(consumer.next_submission().is_none());
        Ok(())
    }

    #[test]
    fn test_completion_ring_full() -> Result<()> {
        let (_, _, cq, mut consumer) = rings(2, 4)?;

        for i in 0..4 {
            assert!(cq.post_completion(i, 0, CqeFlags::empty()));
        }
        assert!(!cq.post_completion(99, 0, CqeFlags::empty()));
        assert_eq!(cq.ready(), 4);

        assert_eq!(consumer.pop().map(|c| c.user_data), Some(0));
        assert!(cq.post_completion(4, -libc::EINVAL, CqeFlags::empty()));

        let tags = std::iter::from_fn(|| consumer.pop())
            .map(|c| c.user_data)
            .collect::<Vec<_>>();
        assert_eq!(tags, vec![1, 2, 3, 4]);
        Ok(())
    }
}
