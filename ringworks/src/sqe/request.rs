use crate::context::buffer_pool::BufferRef;
use crate::context::slab::{RefSlab, Reclaim, SlabRef, WeakRef};
use crate::context::tables::FileRef;
use crate::opcode::OpHandler;
use crate::runtime::poll::PollWaiter;
use crate::runtime::timer::TimerSlot;
use crate::sqe::{Opcode, Sqe, SqeFlags};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) type ReqRef = SlabRef<Request>;
pub(crate) type RequestPool = RefSlab<Request>;

bitflags! {
    /// Request state flags. The low byte mirrors `SqeFlags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub(crate) struct ReqFlags: u32 {
        const FIXED_FILE = SqeFlags::FIXED_FILE.bits() as u32;
        const IO_DRAIN = SqeFlags::IO_DRAIN.bits() as u32;
        const IO_LINK = SqeFlags::IO_LINK.bits() as u32;
        const IO_HARDLINK = SqeFlags::IO_HARDLINK.bits() as u32;
        const FORCE_ASYNC = SqeFlags::ASYNC.bits() as u32;
        const BUFFER_SELECT = SqeFlags::BUFFER_SELECT.bits() as u32;
        const CQE_SKIP_SUCCESS = SqeFlags::CQE_SKIP_SUCCESS.bits() as u32;

        /// First member of a chain.
        const LINK_HEAD = 1 << 8;

        /// Fail the rest of the chain whatever the result.
        const FAIL = 1 << 9;

        /// A provided buffer was picked for this request.
        const BUFFER_SELECTED = 1 << 10;

        /// Went through the readiness bridge at least once, the next
        /// would-block re-arms it.
        const POLLED = 1 << 11;

        /// Counted by the drain scheduler as in flight.
        const DRAIN_COUNTED = 1 << 12;

        /// Attached to the previous chain member as its linked timeout.
        const LINKED_TIMEOUT = 1 << 13;
    }
}

impl From<SqeFlags> for ReqFlags {
    fn from(flags: SqeFlags) -> Self {
        ReqFlags::from_bits_retain(flags.bits() as u32)
    }
}

/// Where a request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReqState {
    /// Built, not dispatched yet (chain members waiting on their parent).
    Prepared,
    /// Held back by the drain scheduler.
    Deferred,
    /// Inline attempt in progress.
    Issuing,
    /// Waiting for readiness.
    PollArmed,
    /// In an offload worker queue.
    Queued,
    /// Running on an offload worker.
    Running,
    /// Waiting on the timer thread.
    TimerArmed,
    Completed,
}

/// The engine's representation of one accepted submission entry.
pub(crate) struct Request {
    pub(crate) opcode: Opcode,
    pub(crate) user_data: u64,
    /// Tag of the chain head, `user_data` for unchained requests.
    pub(crate) head_tag: u64,
    /// Submission sequence number.
    pub(crate) seq: u64,
    pub(crate) flags: ReqFlags,
    pub(crate) state: ReqState,
    pub(crate) sqe: Sqe,
    pub(crate) handler: Arc<dyn OpHandler>,

    pub(crate) file: Option<FileRef>,
    pub(crate) buffer: Option<BufferRef>,
    pub(crate) async_data: Option<Box<dyn Any + Send>>,
    pub(crate) cancelled: Arc<AtomicBool>,
    pub(crate) retries: u32,

    /// Next chain member, owned.
    pub(crate) link: Option<ReqRef>,
    /// Linked timeout racing this request, owned through the slot.
    pub(crate) linked_timeout: Option<Arc<TimerSlot>>,
    /// Timer this request itself is armed on.
    pub(crate) timer: Option<Arc<TimerSlot>>,
    /// For a linked timeout, the request it races. Lookup only.
    pub(crate) parent: Option<WeakRef>,
    pub(crate) poll: Option<Arc<PollWaiter>>,
}

impl Request {
    pub(crate) fn new(sqe: Sqe, seq: u64, handler: Arc<dyn OpHandler>) -> Self {
        Self {
            opcode: Opcode(sqe.opcode),
            user_data: sqe.user_data,
            head_tag: sqe.user_data,
            seq,
            flags: sqe.sqe_flags().into(),
            state: ReqState::Prepared,
            sqe,
            handler,
            file: None,
            buffer: None,
            async_data: None,
            cancelled: Arc::new(AtomicBool::new(false)),
            retries: 0,
            link: None,
            linked_timeout: None,
            timer: None,
            parent: None,
            poll: None,
        }
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// A failed result stops the chain unless it is hard linked. An explicit
    /// cancellation always does.
    ///
    /// A hard link only ties ordering: `IO_HARDLINK` on the failing member
    /// keeps its successor running. A chain severs at the first failing
    /// member linked with plain `IO_LINK`.
    pub(crate) fn fails_chain(&self, res: i32) -> bool {
        self.flags.contains(ReqFlags::FAIL)
            || (res < 0
                && (!self.flags.contains(ReqFlags::IO_HARDLINK) || self.is_cancelled()))
    }
}

impl Reclaim for Request {
    fn reclaim(mut self) {
        // 1. Operation specific state, then the resources it may point into.
        self.handler.cleanup(self.async_data.take());
        if let Some(buf) = self.buffer.take() {
            buf.release();
        }
        self.file.take();

        // 2. Detach from the chain.
        if let Some(next) = self.link.take() {
            tracing::trace!(
                user_data = self.user_data,
                "releasing request with an unresolved chain member"
            );
            drop(next);
        }
        self.linked_timeout.take();
        self.timer.take();
        self.poll.take();
        self.parent.take();
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("opcode", &self.handler.name())
            .field("user_data", &self.user_data)
            .field("seq", &self.seq)
            .field("flags", &self.flags)
            .field("state", &self.state)
            .field("linked", &self.link.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcode::builtin::Nop;
    use anyhow::{Context, Result};
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Request: Send);
    assert_impl_all!(ReqRef: Send, Sync);

    fn request(flags: SqeFlags) -> Request {
        Request::new(Sqe::nop().user_data(7).flags(flags), 0, Arc::new(Nop))
    }

    #[rstest]
    #[case::link_ok(SqeFlags::IO_LINK, 0, false)]
    #[case::link_err(SqeFlags::IO_LINK, -libc::EIO, true)]
    #[case::hardlink_err(SqeFlags::IO_HARDLINK, -libc::EIO, false)]
    fn test_fails_chain(#[case] flags: SqeFlags, #[case] res: i32, #[case] expected: bool) {
        assert_eq!(request(flags).fails_chain(res), expected);
    }

    #[test]
    fn test_cancelled_hardlink_fails_chain() {
        let req = request(SqeFlags::IO_HARDLINK);
        req.cancelled.store(true, Ordering::Release);
        assert!(req.fails_chain(-libc::ECANCELED));
    }

    #[test]
    fn test_reclaim_releases_chain() -> Result<()> {
        let pool = RequestPool::new(4);

        let (head, head_done) = pool
            .reserve()
            .context("head")?
            .commit(request(SqeFlags::IO_LINK));
        let (member, member_done) = pool
            .reserve()
            .context("member")?
            .commit(request(SqeFlags::empty()));

        let weak = member.downgrade();
        drop(member);
        head.with(|r| r.link = Some(member_done));
        assert_eq!(pool.live(), 2);

        drop((head, head_done));
        assert_eq!(pool.live(), 0);
        assert!(pool.upgrade(weak).is_none());
        Ok(())
    }
}
