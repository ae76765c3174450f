use crate::context::Engine;
use crate::opcode::Issue;
use crate::sqe::errors::EngineError;
use crate::sqe::request::{ReqRef, ReqState};
use crate::sqe::{CqeFlags, Sqe, TimeoutFlags};
use crate::utils::thread::{join_all, spawn_engine_thread};
use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Stand-in for deadlines too far out for `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Dead heap entries tolerated before a compaction is considered.
const COMPACT_MIN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// A `TIMEOUT` request.
    Timeout,
    /// A `LINK_TIMEOUT` racing the previous chain member.
    Linked,
}

/// Ownership handoff point between a timer and whoever else may complete the
/// request first. Whoever takes the request completes it.
#[derive(Debug)]
pub(crate) struct TimerSlot {
    req: Mutex<Option<ReqRef>>,
    kind: TimerKind,
    nanos: u64,
    abs: bool,
    /// Has an entry in the deadline heap.
    armed: AtomicBool,
    count_key: OnceLock<(u64, u64)>,
}

impl TimerSlot {
    pub(crate) fn new(req: ReqRef, kind: TimerKind, sqe: &Sqe) -> Arc<Self> {
        Arc::new(Self {
            req: Mutex::new(Some(req)),
            kind,
            nanos: sqe.addr,
            abs: TimeoutFlags::from_bits_truncate(sqe.op_flags).contains(TimeoutFlags::ABS),
            armed: AtomicBool::new(false),
            count_key: OnceLock::new(),
        })
    }

    pub(crate) fn take(&self) -> Option<ReqRef> {
        self.req.lock().take()
    }

    pub(crate) fn peek(&self) -> Option<ReqRef> {
        self.req.lock().clone()
    }

    fn is_pending(&self) -> bool {
        self.req.lock().is_some()
    }

    fn deadline(&self, epoch: Instant) -> Instant {
        let base = if self.abs { epoch } else { Instant::now() };
        base.checked_add(Duration::from_nanos(self.nanos))
            .or_else(|| base.checked_add(FAR_FUTURE))
            .unwrap_or(base)
    }
}

#[derive(Debug)]
struct Deadline {
    at: Instant,
    id: u64,
    slot: Arc<TimerSlot>,
}

impl PartialEq for Deadline {
    fn eq(&self, other: &Self) -> bool {
        (self.at, self.id) == (other.at, other.id)
    }
}

impl Eq for Deadline {}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.at, self.id).cmp(&(other.at, other.id))
    }
}

#[derive(Debug, Default)]
struct State {
    /// Earliest deadline first. Entries whose slot was emptied stay until
    /// they expire.
    heap: BinaryHeap<Reverse<Deadline>>,
    /// Completion count timeouts by `(target posted count, id)`.
    counts: BTreeMap<(u64, u64), Arc<TimerSlot>>,
    /// Heap entries whose slot was taken before the deadline, approximately.
    dead: usize,
    next_id: u64,
    stopped: bool,
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// The timer thread and the timeout bookkeeping it serves.
#[derive(Debug)]
pub(crate) struct Timers {
    state: Mutex<State>,
    cond: Condvar,
    has_counts: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Timers {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            has_counts: AtomicBool::new(false),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn spawn(&self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        let engine_ref = Arc::clone(engine);
        let handle = spawn_engine_thread(&engine.cfg, "timer", move || run(engine_ref))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    /// Arms a `TIMEOUT` request. It completes with `-ETIME` when the
    /// deadline passes, or with `0` once `off` more completions were posted.
    pub(crate) fn arm_timeout(&self, engine: &Engine, req: &ReqRef, sqe: &Sqe) -> Issue {
        let count = sqe.off;
        let slot = TimerSlot::new(req.clone(), TimerKind::Timeout, sqe);

        let armed = req.with(|r| {
            if r.is_cancelled() {
                return false;
            }
            r.state = ReqState::TimerArmed;
            r.timer = Some(slot.clone());
            true
        });
        if !armed {
            drop(slot.take());
            return Issue::Complete(-libc::ECANCELED);
        }

        {
            let mut state = self.state.lock();
            let id = state.next_id();

            // An unreachable count saturates and only the deadline remains.
            if count > 0 {
                let key = (engine.completions.posted().saturating_add(count), id);
                let fresh = slot.count_key.set(key).is_ok();
                debug_assert!(fresh, "count timeout armed twice");
                state.counts.insert(key, slot.clone());
                self.has_counts.store(true, Ordering::Release);
            }

            // A pure count timeout has no deadline.
            if slot.nanos > 0 || slot.abs || count == 0 {
                slot.armed.store(true, Ordering::Release);
                let at = slot.deadline(engine.epoch);
                state.heap.push(Reverse(Deadline { at, id, slot }));
                self.cond.notify_one();
            }
        }

        // The count may have been reached before the entry was visible.
        if count > 0 {
            self.completions_posted(engine, engine.completions.posted());
        }

        Issue::Parked
    }

    /// Starts the clock of a linked timeout, once.
    pub(crate) fn arm_linked(&self, engine: &Engine, slot: &Arc<TimerSlot>) {
        if slot.armed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock();
        let id = state.next_id();
        let at = slot.deadline(engine.epoch);

        tracing::trace!(id, nanos = slot.nanos, "arming linked timeout");
        state.heap.push(Reverse(Deadline {
            at,
            id,
            slot: slot.clone(),
        }));
        self.cond.notify_one();
    }

    /// Takes the request back from its timer before it fires.
    pub(crate) fn disarm(&self, slot: &TimerSlot) -> Option<ReqRef> {
        let req = slot.take()?;
        let mut state = self.state.lock();
        if let Some(key) = slot.count_key.get() {
            state.counts.remove(key);
            self.has_counts.store(!state.counts.is_empty(), Ordering::Release);
        }
        self.note_dead(&mut state, slot);
        Some(req)
    }

    /// `slot` was emptied by someone other than the timer thread.
    pub(crate) fn forget(&self, slot: &TimerSlot) {
        if slot.armed.load(Ordering::Acquire) {
            self.note_dead(&mut self.state.lock(), slot);
        }
    }

    /// Drops the dead heap entries once they outnumber the live ones.
    fn note_dead(&self, state: &mut State, slot: &TimerSlot) {
        if !slot.armed.load(Ordering::Acquire) {
            return;
        }

        state.dead += 1;
        if state.dead < COMPACT_MIN || state.dead * 2 < state.heap.len() {
            return;
        }

        let before = state.heap.len();
        state.heap.retain(|Reverse(d)| d.slot.is_pending());
        state.dead = 0;
        tracing::trace!(before, after = state.heap.len(), "compacted timer heap");
    }

    #[cfg(test)]
    pub(crate) fn heap_len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Completes the count timeouts satisfied by `posted` completions.
    pub(crate) fn completions_posted(&self, engine: &Engine, posted: u64) {
        if !self.has_counts.load(Ordering::Acquire) {
            return;
        }

        let due = {
            let mut state = self.state.lock();
            let pending = state.counts.split_off(&(posted + 1, 0));
            let due = std::mem::replace(&mut state.counts, pending);
            self.has_counts
                .store(!state.counts.is_empty(), Ordering::Release);
            due
        };

        for slot in due.into_values() {
            if let Some(req) = slot.take() {
                self.forget(&slot);
                engine.complete_from(req, 0, CqeFlags::empty(), false);
            }
        }
    }

    fn fire(&self, engine: &Engine, slot: Arc<TimerSlot>) {
        let Some(req) = slot.take() else {
            return;
        };

        match slot.kind {
            TimerKind::Timeout => {
                engine.complete_from(req, -libc::ETIME, CqeFlags::empty(), true);
            }
            TimerKind::Linked => {
                let parent = req
                    .with(|r| r.parent)
                    .and_then(|weak| engine.requests.upgrade(weak));

                let res = match parent {
                    Some(parent) => engine.try_cancel(&parent),
                    None => -libc::ENOENT,
                };

                tracing::trace!(res, "linked timeout expired");
                let res = if res == 0 { -libc::ETIME } else { res };
                engine.complete_from(req, res, CqeFlags::empty(), true);
            }
        }
    }

    /// Stops the timer thread. Whatever is still armed completes with
    /// `-ECANCELED`.
    pub(crate) fn shutdown(&self, engine: &Engine) {
        self.state.lock().stopped = true;
        self.cond.notify_all();

        if let Some(handle) = self.thread.lock().take()
            && let Err(e) = join_all([handle])
        {
            tracing::error!(error = %e, "timer thread");
        }

        let leftovers = {
            let mut state = self.state.lock();
            let mut slots = std::mem::take(&mut state.heap)
                .into_iter()
                .map(|Reverse(d)| d.slot)
                .collect::<Vec<_>>();
            slots.extend(std::mem::take(&mut state.counts).into_values());
            self.has_counts.store(false, Ordering::Release);
            slots
        };

        for slot in leftovers {
            if let Some(req) = slot.take() {
                engine.complete_from(req, -libc::ECANCELED, CqeFlags::empty(), true);
            }
        }
    }
}

fn run(engine: Arc<Engine>) {
    let timers = &engine.timers;
    let mut state = timers.state.lock();

    tracing::debug!("timer thread started");

    while !state.stopped {
        let expired = pop_expired(&mut state, Instant::now());

        if !expired.is_empty() {
            MutexGuard::unlocked(&mut state, || {
                for slot in expired {
                    timers.fire(&engine, slot);
                }
            });
            continue;
        }

        match state.heap.peek().map(|Reverse(d)| d.at) {
            Some(at) => {
                timers.cond.wait_until(&mut state, at);
            }
            None => timers.cond.wait(&mut state),
        }
    }

    tracing::debug!("timer thread stopped");
}

fn pop_expired(state: &mut State, now: Instant) -> SmallVec<[Arc<TimerSlot>; 8]> {
    let mut expired = SmallVec::new();

    while state.heap.peek().is_some_and(|Reverse(d)| d.at <= now) {
        let Some(Reverse(deadline)) = state.heap.pop() else {
            break;
        };
        if let Some(key) = deadline.slot.count_key.get() {
            state.counts.remove(key);
        }
        expired.push(deadline.slot);
    }

    expired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deadline(at: Instant, id: u64) -> Reverse<Deadline> {
        let slot = Arc::new(TimerSlot {
            req: Mutex::new(None),
            kind: TimerKind::Timeout,
            nanos: 0,
            abs: false,
            armed: AtomicBool::new(false),
            count_key: OnceLock::new(),
        });
        Reverse(Deadline { at, id, slot })
    }

    #[test]
    fn test_pop_expired_in_deadline_order() {
        let earlier = Instant::now();
        let now = earlier + Duration::from_millis(5);
        let mut state = State::default();

        state.heap.push(deadline(now + Duration::from_secs(60), 1));
        state.heap.push(deadline(now, 2));
        state.heap.push(deadline(earlier, 3));

        let expired = pop_expired(&mut state, now);
        assert_eq!(expired.len(), 2);
        assert_eq!(state.heap.len(), 1);
        assert!(pop_expired(&mut state, now).is_empty());
    }

    #[test]
    fn test_unrepresentable_deadline_is_far_out() {
        let slot = TimerSlot {
            req: Mutex::new(None),
            kind: TimerKind::Linked,
            nanos: u64::MAX,
            abs: false,
            armed: AtomicBool::new(false),
            count_key: OnceLock::new(),
        };

        let now = Instant::now();
        assert!(slot.deadline(now) > now + Duration::from_secs(365 * 24 * 60 * 60));
    }

    #[test]
    fn test_same_instant_ordered_by_id() {
        let now = Instant::now();
        let mut heap = BinaryHeap::new();
        heap.push(deadline(now, 9));
        heap.push(deadline(now, 4));

        assert_eq!(heap.pop().map(|Reverse(d)| d.id), Some(4));
    }
}
