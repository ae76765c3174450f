use crate::context::Engine;
use crate::context::slab::WeakRef;
use crate::runtime::poll::PollWaiter;
use crate::runtime::timer::TimerSlot;
use crate::sqe::request::{ReqRef, ReqState};
use crate::sqe::{CancelFlags, CqeFlags, Opcode};
use dashmap::DashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy)]
struct Entry {
    weak: WeakRef,
    seq: u64,
    head_tag: u64,
}

/// Index of live requests by tag, for cancellation lookups.
///
/// Tags are caller chosen and need not be unique, every request carrying the
/// tag is kept.
#[derive(Debug, Default)]
pub(crate) struct CancelIndex {
    map: DashMap<u64, SmallVec<[Entry; 1]>>,
}

impl CancelIndex {
    pub(crate) fn insert(&self, user_data: u64, weak: WeakRef, seq: u64, head_tag: u64) {
        self.map
            .entry(user_data)
            .or_default()
            .push(Entry { weak, seq, head_tag });
    }

    pub(crate) fn remove(&self, user_data: u64, weak: WeakRef) {
        self.map.remove_if_mut(&user_data, |_, entries| {
            entries.retain(|e| e.weak != weak);
            entries.is_empty()
        });
    }

    /// Requests tagged `target`, or for `chain`, every member of chains whose
    /// head is tagged `target`. Oldest first.
    fn matching(&self, target: u64, chain: bool) -> SmallVec<[Entry; 4]> {
        let mut found: SmallVec<[Entry; 4]> = if chain {
            // Shard guards are dropped before any cancellation runs.
            self.map
                .iter()
                .flat_map(|kv| {
                    kv.value()
                        .iter()
                        .filter(|e| e.head_tag == target)
                        .copied()
                        .collect::<SmallVec<[Entry; 4]>>()
                })
                .collect()
        } else {
            self.map
                .get(&target)
                .map(|entries| entries.iter().copied().collect())
                .unwrap_or_default()
        };

        found.sort_unstable_by_key(|e| e.seq);
        found
    }

    fn all(&self) -> Vec<Entry> {
        let mut all = self
            .map
            .iter()
            .flat_map(|kv| kv.value().clone())
            .collect::<Vec<_>>();
        all.sort_unstable_by_key(|e| e.seq);
        all
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.map.iter().map(|kv| kv.value().len()).sum()
    }
}

enum Action {
    NotFound,
    Running,
    Flagged,
    Deferred,
    Poll(Arc<PollWaiter>),
    Timer(Arc<TimerSlot>),
}

impl Engine {
    /// Cancels one request: `0` if it will complete with `-ECANCELED`,
    /// `-EALREADY` if it is executing and may still complete normally,
    /// `-ENOENT` if there was nothing to cancel.
    pub(crate) fn try_cancel(&self, req: &ReqRef) -> i32 {
        let action = req.with(|r| {
            if r.is_cancelled() {
                return Action::NotFound;
            }

            let action = match r.state {
                ReqState::Prepared | ReqState::Completed => return Action::NotFound,
                ReqState::Issuing | ReqState::Running => Action::Running,
                ReqState::Queued => Action::Flagged,
                ReqState::Deferred => Action::Deferred,
                ReqState::PollArmed => match &r.poll {
                    Some(poll) => Action::Poll(poll.clone()),
                    None => Action::Running,
                },
                ReqState::TimerArmed => match &r.timer {
                    Some(slot) => Action::Timer(slot.clone()),
                    None => Action::Running,
                },
            };

            r.cancelled.store(true, Ordering::Release);
            action
        });

        match action {
            Action::NotFound => -libc::ENOENT,
            Action::Running => -libc::EALREADY,
            Action::Flagged => 0,
            Action::Deferred => {
                if !self.drain.remove(req) {
                    // Released meanwhile, the issue path sees the flag.
                    return 0;
                }
                self.complete_from(req.clone(), -libc::ECANCELED, CqeFlags::empty(), false);
                self.drain.release(self);
                0
            }
            Action::Poll(poll) => match poll.claim() {
                Some(req) => {
                    self.complete_from(req, -libc::ECANCELED, CqeFlags::empty(), false);
                    0
                }
                None => -libc::EALREADY,
            },
            Action::Timer(slot) => match self.timers.disarm(&slot) {
                Some(req) => {
                    self.complete_from(req, -libc::ECANCELED, CqeFlags::empty(), false);
                    0
                }
                None => -libc::EALREADY,
            },
        }
    }

    /// Cancels requests matching `target`, restricted to `kind` if given.
    ///
    /// Without `CancelFlags::ALL` only the oldest cancellable match is
    /// affected. With it, the result is the number of requests affected.
    pub(crate) fn cancel_matching(
        &self,
        target: u64,
        flags: CancelFlags,
        kind: Option<Opcode>,
        exclude: &ReqRef,
    ) -> i32 {
        let all = flags.contains(CancelFlags::ALL);
        let mut affected = 0;

        for entry in self.inflight.matching(target, flags.contains(CancelFlags::CHAIN)) {
            let Some(req) = self.requests.upgrade(entry.weak) else {
                continue;
            };
            if req.ptr_eq(exclude) || kind.is_some_and(|k| req.with(|r| r.opcode != k)) {
                continue;
            }

            let res = self.try_cancel(&req);
            if res == -libc::ENOENT {
                continue;
            }
            if !all {
                return res;
            }
            affected += 1;
        }

        tracing::trace!(target, ?flags, affected, "cancel");
        if affected > 0 { affected } else { -libc::ENOENT }
    }

    /// Cancels everything in flight, oldest first. Returns the number of
    /// requests that will complete with `-ECANCELED`.
    pub(crate) fn cancel_everything(&self) -> usize {
        self.inflight
            .all()
            .into_iter()
            .filter_map(|entry| self.requests.upgrade(entry.weak))
            .filter(|req| self.try_cancel(req) == 0)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::slab::{RefSlab, Reclaim};
    use anyhow::{Context, Result};

    struct Dummy;

    impl Reclaim for Dummy {
        fn reclaim(self) {}
    }

    #[test]
    fn test_index_duplicate_tags() -> Result<()> {
        let slab = RefSlab::<Dummy>::new(4);
        let index = CancelIndex::default();

        let (a, _a) = slab.reserve().context("a")?.commit(Dummy);
        let (b, _b) = slab.reserve().context("b")?.commit(Dummy);
        index.insert(7, b.downgrade(), 2, 7);
        index.insert(7, a.downgrade(), 1, 7);
        assert_eq!(index.len(), 2);

        let found = index.matching(7, false);
        assert_eq!(found.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2]);

        index.remove(7, a.downgrade());
        index.remove(7, b.downgrade());
        assert_eq!(index.len(), 0);
        assert!(index.matching(7, false).is_empty());
        Ok(())
    }

    #[test]
    fn test_index_chain_lookup() -> Result<()> {
        let slab = RefSlab::<Dummy>::new(4);
        let index = CancelIndex::default();

        let (head, _head) = slab.reserve().context("head")?.commit(Dummy);
        let (member, _member) = slab.reserve().context("member")?.commit(Dummy);
        index.insert(1, head.downgrade(), 0, 1);
        index.insert(2, member.downgrade(), 1, 1);

        assert_eq!(index.matching(1, false).len(), 1);
        assert_eq!(index.matching(1, true).len(), 2);
        assert!(index.matching(2, true).is_empty());
        Ok(())
    }
}
