use crate::context::Engine;
use crate::context::ring::{CompletionRing, RingMemory, SqRingFlags};
use crate::sqe::errors::EngineError;
use crate::sqe::{Cqe, CqeFlags};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering, fence};
use std::time::{Duration, Instant};

/// Posts completions into the completion ring and parks the ones that do not
/// fit in an ordered backlog.
///
/// The backlog lock is the single serialization point between completion
/// producers. As long as the backlog is non-empty every new completion goes
/// behind it, so the caller always observes completions in posting order.
#[derive(Debug)]
pub(crate) struct Completions {
    ring: CompletionRing,
    backlog: Mutex<VecDeque<Cqe>>,
    has_backlog: AtomicBool,

    posted: AtomicU64,
    overflowed: AtomicU64,

    // Waiters for `min_complete` completions.
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
    waiting: AtomicUsize,
    interrupts: AtomicU64,
}

impl Completions {
    pub(crate) fn new(mem: Arc<RingMemory>) -> Self {
        Self {
            ring: CompletionRing::new(mem),
            backlog: Mutex::new(VecDeque::new()),
            has_backlog: AtomicBool::new(false),
            posted: AtomicU64::new(0),
            overflowed: AtomicU64::new(0),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
            waiting: AtomicUsize::new(0),
            interrupts: AtomicU64::new(0),
        }
    }

    pub(crate) fn post(&self, user_data: u64, res: i32, flags: CqeFlags) {
        {
            let mut backlog = self.backlog.lock();
            self.flush_locked(&mut backlog);

            if !backlog.is_empty() || !self.ring.post_completion(user_data, res, flags) {
                if backlog.is_empty() {
                    tracing::debug!(user_data, "completion ring full, entering overflow");
                    self.has_backlog.store(true, Ordering::Release);
                    self.ring.mem().set_sq_flag(SqRingFlags::CQ_OVERFLOW);
                }

                backlog.push_back(Cqe::new(user_data, res, flags));
                self.overflowed.fetch_add(1, Ordering::Relaxed);
            }

            self.posted.fetch_add(1, Ordering::Release);
        }

        self.notify();
    }

    /// Moves as much of the backlog as fits into the ring. Returns the number
    /// of completions moved.
    pub(crate) fn flush_overflow(&self) -> usize {
        if !self.has_backlog.load(Ordering::Acquire) {
            return 0;
        }

        let flushed = self.flush_locked(&mut self.backlog.lock());
        if flushed > 0 {
            self.notify();
        }
        flushed
    }

    fn flush_locked(&self, backlog: &mut VecDeque<Cqe>) -> usize {
        let mut flushed = 0;

        while let Some(cqe) = backlog.front() {
            if !self
                .ring
                .post_completion(cqe.user_data, cqe.res, cqe.cqe_flags())
            {
                break;
            }
            backlog.pop_front();
            flushed += 1;
        }

        if flushed > 0 && backlog.is_empty() {
            tracing::debug!(flushed, "overflow backlog flushed");
            self.has_backlog.store(false, Ordering::Release);
            self.ring.mem().clear_sq_flag(SqRingFlags::CQ_OVERFLOW);
        }

        flushed
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog.lock().len()
    }

    /// Empties the backlog at teardown and accounts for the lost completions
    /// in the shared overflow counter.
    pub(crate) fn discard_backlog(&self) -> usize {
        let mut backlog = self.backlog.lock();
        self.flush_locked(&mut backlog);

        let discarded = backlog.len();
        if discarded > 0 {
            tracing::warn!(discarded, "discarding unconsumed completions at teardown");
            backlog.clear();
            self.has_backlog.store(false, Ordering::Release);
            self.ring
                .mem()
                .header()
                .cq_overflow
                .fetch_add(discarded as u32, Ordering::Release);
        }
        discarded
    }

    /// Completions posted so far, ring and backlog alike.
    pub(crate) fn posted(&self) -> u64 {
        self.posted.load(Ordering::Acquire)
    }

    pub(crate) fn overflowed(&self) -> u64 {
        self.overflowed.load(Ordering::Relaxed)
    }

    fn notify(&self) {
        // Pairs with the fence in `wait`: either the waiter sees the new tail,
        // or we see it registered.
        fence(Ordering::SeqCst);
        if self.waiting.load(Ordering::SeqCst) > 0 {
            let _guard = self.wait_lock.lock();
            self.wait_cond.notify_all();
        }
    }

    /// Wakes every blocked waiter with `EngineError::Interrupted`.
    pub(crate) fn interrupt(&self) {
        self.interrupts.fetch_add(1, Ordering::AcqRel);
        let _guard = self.wait_lock.lock();
        self.wait_cond.notify_all();
    }

    /// Blocks until at least `min_complete` completions are visible in the
    /// ring, the optional timeout expires or the wait is interrupted.
    ///
    /// A timeout is only an error when nothing at all is ready.
    pub(crate) fn wait(
        &self,
        min_complete: u32,
        timeout: Option<Duration>,
    ) -> Result<(), EngineError> {
        let min_complete = min_complete.min(self.ring.mem().layout().cq_entries);
        let deadline = timeout.map(|t| Instant::now() + t);
        let epoch = self.interrupts.load(Ordering::Acquire);

        loop {
            self.flush_overflow();
            if self.ring.ready() >= min_complete {
                return Ok(());
            }

            let mut guard = self.wait_lock.lock();
            self.waiting.fetch_add(1, Ordering::SeqCst);
            fence(Ordering::SeqCst);

            let ready = self.ring.ready() >= min_complete
                || (self.has_backlog.load(Ordering::Acquire)
                    && self.ring.ready() < self.ring.mem().layout().cq_entries);
            let interrupted = self.interrupts.load(Ordering::Acquire) != epoch;

            let timed_out = if ready || interrupted {
                false
            } else {
                match deadline {
                    Some(deadline) => self.wait_cond.wait_until(&mut guard, deadline).timed_out(),
                    None => {
                        self.wait_cond.wait(&mut guard);
                        false
                    }
                }
            };

            self.waiting.fetch_sub(1, Ordering::SeqCst);
            drop(guard);

            if self.interrupts.load(Ordering::Acquire) != epoch {
                return Err(EngineError::Interrupted);
            }

            if timed_out {
                self.flush_overflow();
                return match self.ring.ready() {
                    0 => Err(EngineError::TimedOut),
                    _ => Ok(()),
                };
            }
        }
    }
}

impl Engine {
    /// Single completion posting path, used by inline, worker, timer and
    /// readiness completions alike.
    pub(crate) fn post(&self, user_data: u64, res: i32, flags: CqeFlags) {
        tracing::trace!(user_data, res, "posting completion");
        self.completions.post(user_data, res, flags);
        self.timers.completions_posted(self, self.completions.posted());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ring::{CqConsumer, RingLayout};
    use anyhow::Result;
    use std::thread;

    fn completions(cq: u32) -> Result<(Completions, CqConsumer)> {
        let mem = Arc::new(RingMemory::new(RingLayout::new(2, cq))?);
        Ok((Completions::new(mem.clone()), CqConsumer::new(mem)))
    }

    fn drain(consumer: &mut CqConsumer) -> Vec<u64> {
        std::iter::from_fn(|| consumer.pop())
            .map(|c| c.user_data)
            .collect()
    }

    #[test]
    fn test_overflow_preserves_post_order() -> Result<()> {
        let (cq, mut consumer) = completions(2)?;

        for tag in 0..5 {
            cq.post(tag, 0, CqeFlags::empty());
        }
        assert_eq!(cq.backlog_len(), 3);
        assert!(consumer.overflow_pending());
        assert_eq!(cq.posted(), 5);

        assert_eq!(drain(&mut consumer), vec![0, 1]);
        assert_eq!(cq.flush_overflow(), 2);
        assert!(consumer.overflow_pending());

        // A fresh completion never overtakes the backlog.
        cq.post(5, 0, CqeFlags::empty());
        assert_eq!(drain(&mut consumer), vec![2, 3]);
        cq.flush_overflow();
        assert_eq!(drain(&mut consumer), vec![4, 5]);
        assert!(!consumer.overflow_pending());
        assert_eq!(cq.overflowed(), 4);
        Ok(())
    }

    #[test]
    fn test_discard_backlog_counts_lost_completions() -> Result<()> {
        let (cq, consumer) = completions(2)?;
        for tag in 0..4 {
            cq.post(tag, 0, CqeFlags::empty());
        }

        assert_eq!(cq.discard_backlog(), 2);
        assert_eq!(consumer.discarded(), 2);
        assert_eq!(consumer.len(), 2);
        Ok(())
    }

    #[test]
    fn test_wait_timeout_with_nothing_ready() -> Result<()> {
        let (cq, _consumer) = completions(4)?;
        let err = cq.wait(1, Some(Duration::from_millis(10))).unwrap_err();
        assert_eq!(err, EngineError::TimedOut);
        Ok(())
    }

    #[test]
    fn test_wait_timeout_with_partial_completions() -> Result<()> {
        let (cq, _consumer) = completions(4)?;
        cq.post(1, 0, CqeFlags::empty());
        cq.wait(2, Some(Duration::from_millis(10)))?;
        Ok(())
    }

    #[test]
    fn test_wait_woken_by_post() -> Result<()> {
        let (cq, mut consumer) = completions(4)?;
        let cq = Arc::new(cq);

        let poster = {
            let cq = cq.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cq.post(1, 0, CqeFlags::empty());
                cq.post(2, 0, CqeFlags::empty());
            })
        };

        cq.wait(2, None)?;
        poster
            .join()
            .map_err(|_| anyhow::anyhow!("poster panicked"))?;
        assert_eq!(drain(&mut consumer), vec![1, 2]);
        Ok(())
    }

    #[test]
    fn test_interrupt_wakes_waiter() -> Result<()> {
        let (cq, _consumer) = completions(4)?;
        let cq = Arc::new(cq);

        let waiter = {
            let cq = cq.clone();
            thread::spawn(move || cq.wait(1, None))
        };

        // Keep interrupting until the waiter is gone, it may not be parked yet.
        while !waiter.is_finished() {
            cq.interrupt();
            thread::sleep(Duration::from_millis(5));
        }

        let res = waiter
            .join()
            .map_err(|_| anyhow::anyhow!("waiter panicked"))?;
        assert_eq!(res, Err(EngineError::Interrupted));
        Ok(())
    }
}
