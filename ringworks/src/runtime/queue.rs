use crate::context::completion::Completions;
use crate::context::ring::{CqConsumer, SqProducer};
use crate::sqe::errors::EngineError;
use crate::sqe::{Cqe, Sqe};

/// Caller side of the submission ring, borrowed from a [`Uring`](crate::Uring).
///
/// Pushed entries are published when the queue is dropped or on
/// [`SubmissionQueue::sync`], and consumed on the next `enter` (or by the
/// polling submitter).
#[derive(Debug)]
pub struct SubmissionQueue<'a> {
    sq: &'a mut SqProducer,
}

impl<'a> SubmissionQueue<'a> {
    pub(crate) fn new(sq: &'a mut SqProducer) -> Self {
        Self { sq }
    }

    /// Writes one entry into the ring.
    ///
    /// # Safety
    ///
    /// Every pointer the entry carries (e.g. the `addr` of a `READ`) must stay
    /// valid until the entry's completion is observed.
    pub unsafe fn push(&mut self, sqe: &Sqe) -> Result<(), EngineError> {
        self.sq.push(sqe)
    }

    /// Pushes every entry or none of them.
    ///
    /// # Safety
    ///
    /// See [`SubmissionQueue::push`].
    pub unsafe fn push_multiple(&mut self, sqes: &[Sqe]) -> Result<(), EngineError> {
        if self.capacity() - self.len() < sqes.len() as u32 {
            return Err(EngineError::SqRingFull);
        }

        for sqe in sqes {
            self.sq.push(sqe)?;
        }
        Ok(())
    }

    /// Publishes the pushed entries.
    pub fn sync(&mut self) {
        self.sq.sync();
    }

    pub fn capacity(&self) -> u32 {
        self.sq.capacity()
    }

    /// Entries pushed and not consumed yet, published or not.
    pub fn len(&self) -> u32 {
        self.sq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// The polling submitter is asleep, submit with `EnterFlags::SQ_WAKEUP`.
    pub fn need_wakeup(&self) -> bool {
        self.sq.needs_wakeup()
    }

    /// Entries skipped for an out of range index.
    pub fn dropped(&self) -> u32 {
        self.sq.dropped()
    }
}

impl Drop for SubmissionQueue<'_> {
    fn drop(&mut self) {
        self.sq.sync();
    }
}

/// Caller side of the completion ring, borrowed from a [`Uring`](crate::Uring).
///
/// Iterating consumes completions. Whenever a slot frees up the overflow
/// backlog is moved into the ring, so iterating until `None` also drains the
/// backlog.
#[derive(Debug)]
pub struct CompletionQueue<'a> {
    cq: &'a mut CqConsumer,
    completions: &'a Completions,
}

impl<'a> CompletionQueue<'a> {
    pub(crate) fn new(cq: &'a mut CqConsumer, completions: &'a Completions) -> Self {
        Self { cq, completions }
    }

    pub fn capacity(&self) -> u32 {
        self.cq.capacity()
    }

    /// Completions visible in the ring, the backlog excluded.
    pub fn len(&self) -> u32 {
        self.cq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Completions are waiting in the overflow backlog.
    pub fn overflow(&self) -> bool {
        self.cq.overflow_pending()
    }

    /// Completions discarded at teardown.
    pub fn discarded(&self) -> u32 {
        self.cq.discarded()
    }
}

impl Iterator for CompletionQueue<'_> {
    type Item = Cqe;

    fn next(&mut self) -> Option<Cqe> {
        let cqe = match self.cq.pop() {
            Some(cqe) => cqe,
            None if self.cq.overflow_pending() => {
                self.completions.flush_overflow();
                self.cq.pop()?
            }
            None => return None,
        };

        if self.cq.overflow_pending() {
            self.completions.flush_overflow();
        }
        Some(cqe)
    }
}
