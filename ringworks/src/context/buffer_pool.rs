use crate::context::tables::{FixedTable, RegisteredBuffer};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Largest buffer a group may hold.
pub(crate) const MAX_PROVIDED_BUFFER_SIZE: u32 = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Bgid(u16);

impl Bgid {
    pub(crate) const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub(crate) const fn val(self) -> u16 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Bid(u16);

impl Bid {
    pub(crate) const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline(always)]
    pub(crate) const fn val(self) -> u16 {
        self.0
    }
}

/// One engine-owned buffer handed out by a group.
pub(crate) struct ProvidedBuffer {
    bid: Bid,
    data: Box<[u8]>,
    filled: usize,
}

impl ProvidedBuffer {
    fn new(bid: Bid, size: usize) -> Self {
        Self {
            bid,
            data: vec![0; size].into_boxed_slice(),
            filled: 0,
        }
    }

    pub(crate) fn bid(&self) -> Bid {
        self.bid
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for ProvidedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvidedBuffer")
            .field("bid", &self.bid)
            .field("size", &self.data.len())
            .field("filled", &self.filled)
            .finish()
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    groups: HashMap<Bgid, VecDeque<ProvidedBuffer>>,
    // Buffers filled by a completed request, waiting for the caller.
    consumed: HashMap<(Bgid, Bid), ProvidedBuffer>,
}

/// Provided buffer groups, selected at issue time by `BUFFER_SELECT` requests.
#[derive(Debug, Default)]
pub(crate) struct BufferPool {
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Adds `count` buffers of `size` bytes to `bgid`, ids starting at
    /// `first_bid`. Returns the number of buffers added or a negative errno.
    pub(crate) fn provide(&self, bgid: Bgid, first_bid: u16, count: i32, size: u32) -> i32 {
        if count <= 0 || size == 0 || size > MAX_PROVIDED_BUFFER_SIZE {
            return -libc::EINVAL;
        }
        if first_bid as u32 + count as u32 > u16::MAX as u32 + 1 {
            return -libc::EINVAL;
        }

        let mut inner = self.inner.lock();
        let group = inner.groups.entry(bgid).or_default();
        group.extend(
            (0..count as u16)
                .map(|i| ProvidedBuffer::new(Bid::new(first_bid + i), size as usize)),
        );

        tracing::trace!(
            bgid = bgid.val(),
            count,
            size,
            available = group.len(),
            "provided buffers"
        );
        count
    }

    /// Removes up to `count` unused buffers from `bgid`.
    pub(crate) fn remove(&self, bgid: Bgid, count: i32) -> i32 {
        if count <= 0 {
            return -libc::EINVAL;
        }

        let mut inner = self.inner.lock();
        let Some(group) = inner.groups.get_mut(&bgid) else {
            return -libc::ENOENT;
        };

        let removed = group.len().min(count as usize);
        group.drain(..removed);
        if group.is_empty() {
            inner.groups.remove(&bgid);
        }

        removed as i32
    }

    pub(crate) fn select(&self, bgid: Bgid) -> Option<ProvidedBuffer> {
        self.inner.lock().groups.get_mut(&bgid)?.pop_front()
    }

    /// Gives back a selected but unused buffer. It is the next one selected.
    pub(crate) fn recycle(&self, bgid: Bgid, mut buf: ProvidedBuffer) {
        buf.filled = 0;
        self.inner
            .lock()
            .groups
            .entry(bgid)
            .or_default()
            .push_front(buf);
    }

    /// Parks a buffer filled with `filled` bytes until the caller takes it.
    pub(crate) fn consume(&self, bgid: Bgid, mut buf: ProvidedBuffer, filled: usize) {
        buf.filled = filled.min(buf.data.len());
        self.inner.lock().consumed.insert((bgid, buf.bid), buf);
    }

    /// Hands the data of a consumed buffer to the caller. The buffer leaves
    /// the pool, provide it again to reuse the id.
    pub(crate) fn take(&self, bgid: Bgid, bid: Bid) -> Option<Vec<u8>> {
        let buf = self.inner.lock().consumed.remove(&(bgid, bid))?;
        let mut data = buf.data.into_vec();
        data.truncate(buf.filled);
        Some(data)
    }

    pub(crate) fn available(&self, bgid: Bgid) -> usize {
        self.inner.lock().groups.get(&bgid).map_or(0, VecDeque::len)
    }
}

/// Buffer held by one request for its lifetime.
pub(crate) enum BufferRef {
    Fixed {
        // Pins the table generation the buffer was resolved from.
        _table: Arc<FixedTable<Arc<RegisteredBuffer>>>,
        buf: Arc<RegisteredBuffer>,
    },
    Selected {
        pool: Arc<BufferPool>,
        bgid: Bgid,
        buf: ProvidedBuffer,
    },
}

impl BufferRef {
    /// Drops the reference. Selected buffers that were never consumed go back
    /// to their group.
    pub(crate) fn release(self) {
        if let BufferRef::Selected { pool, bgid, buf } = self {
            pool.recycle(bgid, buf);
        }
    }
}

impl fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferRef::Fixed { buf, .. } => f.debug_tuple("Fixed").field(&buf.len()).finish(),
            BufferRef::Selected { bgid, buf, .. } => {
                f.debug_tuple("Selected").field(bgid).field(buf).finish()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};
    use rstest::rstest;

    #[rstest]
    #[case::zero_count(0, 16)]
    #[case::zero_size(4, 0)]
    #[case::too_large(1, MAX_PROVIDED_BUFFER_SIZE + 1)]
    fn test_provide_rejects_invalid(#[case] count: i32, #[case] size: u32) {
        let pool = BufferPool::default();
        assert_eq!(pool.provide(Bgid::new(1), 0, count, size), -libc::EINVAL);
        assert_eq!(pool.available(Bgid::new(1)), 0);
    }

    #[test]
    fn test_provide_bid_overflow() {
        let pool = BufferPool::default();
        assert_eq!(pool.provide(Bgid::new(1), u16::MAX, 2, 8), -libc::EINVAL);
        assert_eq!(pool.provide(Bgid::new(1), u16::MAX, 1, 8), 1);
    }

    #[test]
    fn test_select_fifo_and_recycle() -> Result<()> {
        let pool = BufferPool::default();
        let bgid = Bgid::new(3);
        assert_eq!(pool.provide(bgid, 10, 3, 8), 3);

        let first = pool.select(bgid).context("first")?;
        assert_eq!(first.bid(), Bid::new(10));

        pool.recycle(bgid, first);
        assert_eq!(pool.select(bgid).map(|b| b.bid()), Some(Bid::new(10)));
        assert_eq!(pool.select(bgid).map(|b| b.bid()), Some(Bid::new(11)));
        assert_eq!(pool.available(bgid), 1);
        Ok(())
    }

    #[test]
    fn test_consume_then_take() -> Result<()> {
        let pool = BufferPool::default();
        let bgid = Bgid::new(0);
        pool.provide(bgid, 0, 1, 8);

        let mut buf = pool.select(bgid).context("select")?;
        buf.as_mut_slice()[..3].copy_from_slice(b"abc");
        pool.consume(bgid, buf, 3);

        assert!(pool.select(bgid).is_none());
        assert_eq!(pool.take(bgid, Bid::new(0)), Some(b"abc".to_vec()));
        assert_eq!(pool.take(bgid, Bid::new(0)), None);
        Ok(())
    }

    #[test]
    fn test_remove() {
        let pool = BufferPool::default();
        let bgid = Bgid::new(9);
        assert_eq!(pool.remove(bgid, 1), -libc::ENOENT);

        pool.provide(bgid, 0, 4, 8);
        assert_eq!(pool.remove(bgid, 3), 3);
        assert_eq!(pool.remove(bgid, 3), 1);
        assert_eq!(pool.remove(bgid, 1), -libc::ENOENT);
    }
}
