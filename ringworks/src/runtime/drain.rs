use crate::context::Engine;
use crate::sqe::request::{ReqFlags, ReqRef, ReqState};
use parking_lot::Mutex;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Holds back drain requests until everything submitted before them has
/// completed, and everything submitted after them until they complete.
///
/// Every dispatched chain is counted, member by member, in `active`. A
/// drain chain only leaves the queue once `active` reaches zero, and while
/// it is in flight (`blocked`) nothing else leaves the queue. Plain chains
/// bypass the queue entirely as long as nothing is deferred.
///
/// Lock order: drain queue, then request.
#[derive(Debug, Default)]
pub(crate) struct DrainQueue {
    inner: Mutex<Inner>,

    /// Fast path hint: the queue is non-empty or a drain chain is in flight.
    engaged: AtomicBool,

    /// Counted requests not completed yet.
    active: AtomicUsize,
}

#[derive(Debug, Default)]
struct Inner {
    deferred: VecDeque<Deferred>,

    /// A drain chain was released and has not completed yet.
    blocked: bool,
}

#[derive(Debug)]
struct Deferred {
    head: ReqRef,
    drain: bool,
}

impl DrainQueue {
    /// Returns `head` if it may be dispatched now, queues it otherwise.
    pub(crate) fn defer_or_pass(&self, head: ReqRef, drain: bool) -> Option<ReqRef> {
        if !drain && !self.engaged.load(Ordering::Acquire) {
            self.count(&head);
            return Some(head);
        }

        let mut inner = self.inner.lock();
        // Pairs with `retire`: either it sees us engaged, or we see its
        // decrement below.
        self.engaged.store(true, Ordering::SeqCst);
        let busy = self.active.load(Ordering::SeqCst) > 0;

        let pass = inner.deferred.is_empty() && !(inner.blocked && busy) && !(drain && busy);
        if pass {
            self.count(&head);
            inner.blocked = drain;
            self.engaged.store(inner.blocked, Ordering::Release);
            return Some(head);
        }

        tracing::trace!(drain, queued = inner.deferred.len() + 1, "deferring chain");
        head.with(|r| r.state = ReqState::Deferred);
        inner.deferred.push_back(Deferred { head, drain });
        None
    }

    /// Counts every member of the chain starting at `head`, linked timeouts
    /// included.
    fn count(&self, head: &ReqRef) {
        let mut n = 0;
        let mut cur = Some(head.clone());

        while let Some(req) = cur.take() {
            let timeout = req.with(|r| {
                r.flags.insert(ReqFlags::DRAIN_COUNTED);
                cur = r.link.clone();
                r.linked_timeout.as_ref().and_then(|slot| slot.peek())
            });
            n += 1;

            if let Some(timeout) = timeout {
                timeout.with(|t| t.flags.insert(ReqFlags::DRAIN_COUNTED));
                n += 1;
            }
        }

        self.active.fetch_add(n, Ordering::SeqCst);
    }

    /// A counted request completed.
    pub(crate) fn retire(&self, engine: &Engine) {
        let prev = self.active.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "drain counter underflow");

        if prev == 1 && self.engaged.load(Ordering::SeqCst) {
            self.release(engine);
        }
    }

    /// Dispatches whatever the queue head allows.
    pub(crate) fn release(&self, engine: &Engine) {
        let batch = {
            let mut inner = self.inner.lock();
            let busy = self.active.load(Ordering::SeqCst) > 0;

            if inner.blocked && busy {
                return;
            }
            inner.blocked = false;

            let mut batch = SmallVec::<[ReqRef; 4]>::new();
            while let Some(front) = inner.deferred.front() {
                if front.drain {
                    if busy || !batch.is_empty() {
                        break;
                    }
                    inner.blocked = true;
                }

                let Some(entry) = inner.deferred.pop_front() else {
                    break;
                };
                self.count(&entry.head);
                batch.push(entry.head);

                if inner.blocked {
                    break;
                }
            }

            self.engaged
                .store(inner.blocked || !inner.deferred.is_empty(), Ordering::Release);
            batch
        };

        if !batch.is_empty() {
            tracing::trace!(released = batch.len(), "releasing deferred chains");
        }

        // Dispatch outside the lock, completions re-enter `retire`.
        for head in batch {
            engine.dispatch(head);
        }
    }

    /// Takes a deferred chain out of the queue. Returns `false` if it was
    /// released meanwhile.
    pub(crate) fn remove(&self, head: &ReqRef) -> bool {
        let mut inner = self.inner.lock();

        let Some(pos) = inner.deferred.iter().position(|d| d.head.ptr_eq(head)) else {
            return false;
        };
        inner.deferred.remove(pos);
        self.engaged
            .store(inner.blocked || !inner.deferred.is_empty(), Ordering::Release);
        true
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().deferred.len()
    }
}
