use crate::context::Engine;
use crate::runtime::poll::PollWaiter;
use crate::runtime::timer::TimerSlot;
use crate::sqe::CqeFlags;
use crate::sqe::request::{ReqFlags, ReqRef, ReqState};
use std::sync::Arc;

/// A chain being assembled by the submitter: every entry flagged with
/// `IO_LINK`/`IO_HARDLINK` extends it, the first unflagged entry closes it.
#[derive(Debug)]
pub(crate) struct OpenChain {
    /// Completion reference of the head, the one handed to dispatch.
    pub(crate) head: ReqRef,
    /// Submission reference of the last member, new members hang off it.
    pub(crate) tail: ReqRef,
    pub(crate) head_tag: u64,
    pub(crate) drain: bool,
    pub(crate) len: usize,
}

impl OpenChain {
    pub(crate) fn new(head: ReqRef, tail: ReqRef, head_tag: u64, drain: bool) -> Self {
        Self {
            head,
            tail,
            head_tag,
            drain,
            len: 1,
        }
    }

    /// Appends a member. `member` is its completion reference, now owned by
    /// the previous member, `tail` its submission reference.
    pub(crate) fn push(&mut self, member: ReqRef, tail: ReqRef, drain: bool) {
        self.tail.with(|r| r.link = Some(member));
        self.tail = tail;
        self.drain |= drain;
        self.len += 1;
    }

    /// Whether the last member may still receive a linked timeout.
    pub(crate) fn accepts_timeout(&self) -> bool {
        self.tail
            .with(|r| r.linked_timeout.is_none() && !r.flags.contains(ReqFlags::LINKED_TIMEOUT))
    }
}

/// What a request left behind when it completed.
struct Finished {
    user_data: u64,
    fails_chain: bool,
    next: Option<ReqRef>,
}

impl Engine {
    /// Marks `req` completed and posts its result. Returns `None` if it had
    /// completed already, so every request posts exactly once.
    fn finish(&self, req: &ReqRef, res: i32, cflags: CqeFlags) -> Option<Finished> {
        let (finished, skip, counted, linked_timeout, poll) = req.with(|r| {
            if r.state == ReqState::Completed {
                return None;
            }
            r.state = ReqState::Completed;

            let finished = Finished {
                user_data: r.user_data,
                fails_chain: r.fails_chain(res),
                next: r.link.take(),
            };
            let skip = res >= 0 && r.flags.contains(ReqFlags::CQE_SKIP_SUCCESS);
            let counted = r.flags.contains(ReqFlags::DRAIN_COUNTED);
            r.timer.take();

            Some((finished, skip, counted, r.linked_timeout.take(), r.poll.take()))
        })?;

        if let Some(poll) = poll {
            // Drops the waiter's own reference if nobody claimed it yet.
            drop(PollWaiter::claim(&poll));
        }

        self.inflight.remove(finished.user_data, req.downgrade());

        if !skip {
            self.post(finished.user_data, res, cflags);
        }

        if let Some(slot) = linked_timeout {
            self.resolve_linked_timeout(&slot);
        }

        if counted {
            self.drain.retire(self);
        }

        Some(finished)
    }

    /// The request finished before its linked timeout fired: the timeout is
    /// cancelled and its expiry suppressed.
    fn resolve_linked_timeout(&self, slot: &Arc<TimerSlot>) {
        if let Some(timeout) = slot.take() {
            self.timers.forget(slot);
            drop(self.finish(&timeout, -libc::ECANCELED, CqeFlags::empty()));
        }
    }

    /// Completes `req` and resolves its chain. Returns the next member if the
    /// chain goes on, failing the rest of it otherwise.
    pub(crate) fn complete(&self, req: ReqRef, res: i32, cflags: CqeFlags) -> Option<ReqRef> {
        let finished = self.finish(&req, res, cflags)?;
        drop(req);

        match finished.next {
            Some(next) if finished.fails_chain => {
                self.fail_chain(next);
                None
            }
            next => next,
        }
    }

    /// [`Engine::complete`], then hands the next member to the offload workers
    /// if `deferred`, or issues it on the current thread.
    pub(crate) fn complete_from(&self, req: ReqRef, res: i32, cflags: CqeFlags, deferred: bool) {
        if let Some(next) = self.complete(req, res, cflags) {
            if deferred {
                self.offload(next);
            } else {
                self.dispatch(next);
            }
        }
    }

    /// Completes `head` and every member after it with `-ECANCELED`, in chain
    /// order, without issuing any of them.
    pub(crate) fn fail_chain(&self, head: ReqRef) {
        let mut cur = Some(head);

        while let Some(req) = cur.take() {
            req.with(|r| r.flags.insert(ReqFlags::FAIL));
            cur = self
                .finish(&req, -libc::ECANCELED, CqeFlags::empty())
                .and_then(|f| f.next);
        }
    }
}
