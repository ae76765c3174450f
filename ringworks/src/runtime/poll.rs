use crate::context::Engine;
use crate::file::{File, PollMask, WaitQueue, Waiter};
use crate::sqe::CqeFlags;
use crate::sqe::request::{ReqFlags, ReqRef, ReqState};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, Weak};

/// What a readiness notification does with the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PollKind {
    /// Re-issue the operation that would have blocked.
    Rearm,
    /// Complete with the ready mask, for `POLL_ADD`.
    Complete,
}

/// A request parked on one or two wait queues.
///
/// The first notification to [`PollWaiter::claim`] the request owns it, every
/// other path (a second queue, a cancellation, teardown) finds it gone.
pub(crate) struct PollWaiter {
    engine: Weak<Engine>,
    req: Mutex<Option<ReqRef>>,
    entries: Mutex<SmallVec<[(Arc<WaitQueue>, usize); 2]>>,
    interest: PollMask,
    kind: PollKind,
}

impl PollWaiter {
    /// Takes the request out and leaves every wait queue.
    pub(crate) fn claim(&self) -> Option<ReqRef> {
        let req = self.req.lock().take()?;
        self.disarm();
        Some(req)
    }

    fn disarm(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        for (wq, key) in entries {
            wq.unregister(key);
        }
    }
}

impl Waiter for PollWaiter {
    fn wake(&self, mask: PollMask, deferred: bool) {
        if !mask.intersects(self.interest | PollMask::ALWAYS) {
            return;
        }
        let Some(engine) = self.engine.upgrade() else {
            return;
        };

        if let Some(req) = self.claim() {
            tracing::trace!(?mask, kind = ?self.kind, deferred, "poll woken");
            engine.on_ready(req, self.kind, self.interest, mask, deferred);
        }
    }
}

impl fmt::Debug for PollWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollWaiter")
            .field("interest", &self.interest)
            .field("kind", &self.kind)
            .field("queues", &self.entries.lock().len())
            .finish()
    }
}

impl Engine {
    /// Parks `req` until `file` reports readiness in `interest`.
    ///
    /// Gives the request back if the file has no readiness source, or if it
    /// was cancelled before it could be parked.
    pub(crate) fn arm_poll(
        &self,
        req: ReqRef,
        file: &Arc<dyn File>,
        interest: PollMask,
        kind: PollKind,
    ) -> Result<(), ReqRef> {
        let Some(primary) = file.wait_queue(interest) else {
            return Err(req);
        };

        let waiter = Arc::new(PollWaiter {
            engine: self.me.clone(),
            req: Mutex::new(None),
            entries: Mutex::new(SmallVec::new()),
            interest,
            kind,
        });

        // Claimable before a canceller can see it parked.
        let parked = req.with(|r| {
            if r.is_cancelled() {
                return false;
            }
            *waiter.req.lock() = Some(req.clone());
            r.state = ReqState::PollArmed;
            r.flags.insert(ReqFlags::POLLED);
            r.poll = Some(waiter.clone());
            true
        });
        if !parked {
            return Err(req);
        }
        drop(req);

        {
            // A concurrent claim waits here until every queue is registered,
            // so its disarm sees all of them.
            let mut entries = waiter.entries.lock();
            let key = primary.register(interest, waiter.clone());
            entries.push((primary.clone(), key));

            if interest.contains(PollMask::IN | PollMask::OUT)
                && let Some(secondary) = file.wait_queue(PollMask::OUT)
                && !Arc::ptr_eq(&secondary, &primary)
            {
                let key = secondary.register(interest, waiter.clone());
                entries.push((secondary, key));
            }
        }

        // Claimed before the queues were registered.
        if waiter.req.lock().is_none() {
            waiter.disarm();
            return Ok(());
        }

        // Readiness may have changed before the registration.
        if let Some(mask) = file.poll()
            && mask.intersects(interest | PollMask::ALWAYS)
            && let Some(req) = waiter.claim()
        {
            self.on_ready(req, kind, interest, mask, true);
        }

        Ok(())
    }

    fn on_ready(
        &self,
        req: ReqRef,
        kind: PollKind,
        interest: PollMask,
        mask: PollMask,
        deferred: bool,
    ) {
        match kind {
            PollKind::Rearm if deferred => self.offload(req),
            PollKind::Rearm => self.dispatch(req),
            PollKind::Complete => {
                let res = (mask & (interest | PollMask::ALWAYS)).bits() as i32;
                self.complete_from(req, res, CqeFlags::empty(), deferred);
            }
        }
    }
}
