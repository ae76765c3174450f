use crate::context::Engine;
use crate::context::buffer_pool::BufferRef;
use crate::context::ring::SubmissionRing;
use crate::context::tables::FileRef;
use crate::opcode::{OpCaps, OpHandler};
use crate::runtime::SetupFlags;
use crate::runtime::timer::{TimerKind, TimerSlot};
use crate::sqe::errors::EngineError;
use crate::sqe::list::OpenChain;
use crate::sqe::request::{ReqFlags, ReqRef, Request};
use crate::sqe::{CqeFlags, Opcode, Sqe, SqeFlags};
use std::sync::Arc;

/// Everything an entry needs resolved before it becomes a request.
struct Prepared {
    handler: Arc<dyn OpHandler>,
    file: Option<FileRef>,
    buffer: Option<BufferRef>,
}

/// Consumer of the submission ring: validates entries, builds requests and
/// assembles chains. Exactly one exists per engine, owned either by the
/// engine (caller driven submission) or by the polling submitter thread.
#[derive(Debug)]
pub(crate) struct Submitter {
    ring: SubmissionRing,
    chain: Option<OpenChain>,

    /// A chain member was rejected, the remaining members complete with
    /// `-ECANCELED` up to the end of the chain.
    poisoned: bool,
}

impl Submitter {
    pub(crate) fn new(ring: SubmissionRing) -> Self {
        Self {
            ring,
            chain: None,
            poisoned: false,
        }
    }

    /// Entries published and not consumed yet.
    pub(crate) fn pending(&mut self) -> Result<u32, EngineError> {
        self.ring.submit_available()
    }

    /// Consumes up to `to_submit` entries. Returns how many were consumed,
    /// rejected ones included.
    ///
    /// Stops after the first rejected entry unless `SetupFlags::SUBMIT_ALL`.
    /// A chain still open when the batch ends is dispatched as is.
    pub(crate) fn submit_batch(
        &mut self,
        engine: &Engine,
        to_submit: u32,
    ) -> Result<u32, EngineError> {
        let available = self.ring.submit_available().inspect_err(|e| engine.poison(e))?;
        let limit = to_submit.min(available);
        let submit_all = engine.cfg.flags.contains(SetupFlags::SUBMIT_ALL);

        let mut submitted = 0;
        while submitted < limit {
            let Some(sqe) = self.ring.next_submission() else {
                break;
            };
            submitted += 1;
            // Counted before anything it completes becomes visible.
            engine.count_submitted(1);

            if !self.submit_one(engine, sqe) && !submit_all {
                break;
            }
        }

        if let Some(chain) = self.chain.take() {
            tracing::debug!(
                head = chain.head_tag,
                members = chain.len,
                "chain still open at the end of the batch"
            );
            Self::queue(engine, chain.head, chain.drain);
        }
        self.poisoned = false;

        if submitted > 0 {
            tracing::trace!(submitted, available, "submitted batch");
        }
        Ok(submitted)
    }

    /// Returns `false` if the entry was rejected by validation.
    fn submit_one(&mut self, engine: &Engine, sqe: Sqe) -> bool {
        let flags = sqe.sqe_flags();
        let linked = flags.is_linked();

        if self.poisoned {
            engine.post(sqe.user_data, -libc::ECANCELED, CqeFlags::empty());
            self.poisoned = linked;
            return true;
        }

        let prepared = match engine.prepare(&sqe) {
            Ok(prepared) => prepared,
            Err(errno) => {
                tracing::debug!(
                    user_data = sqe.user_data,
                    opcode = sqe.opcode,
                    errno,
                    "rejecting entry"
                );
                self.reject(engine, &sqe, -errno);
                return false;
            }
        };

        let is_timeout = Opcode(sqe.opcode) == Opcode::LINK_TIMEOUT;
        if is_timeout && !self.chain.as_ref().is_some_and(OpenChain::accepts_timeout) {
            tracing::debug!(user_data = sqe.user_data, "linked timeout without a request to race");
            self.reject(engine, &sqe, -libc::EINVAL);
            return false;
        }

        let Some(reservation) = engine.requests.reserve() else {
            tracing::warn!(user_data = sqe.user_data, "request pool exhausted");
            self.reject(engine, &sqe, -libc::ENOMEM);
            return true;
        };

        let seq = engine.next_seq();
        let mut req = Request::new(sqe, seq, prepared.handler);
        req.file = prepared.file;
        req.buffer = prepared.buffer;
        match &self.chain {
            Some(chain) => req.head_tag = chain.head_tag,
            None if linked => req.flags.insert(ReqFlags::LINK_HEAD),
            None => {}
        }

        let head_tag = req.head_tag;
        let (sub, done) = reservation.commit(req);
        engine.inflight.insert(sqe.user_data, sub.downgrade(), seq, head_tag);

        if is_timeout {
            self.attach_timeout(engine, sub, done, &sqe);
        } else {
            self.link(engine, sub, done, flags);
        }
        true
    }

    /// Completes a rejected entry without allocating anything. Whatever the
    /// chain it belonged to, that chain fails.
    fn reject(&mut self, engine: &Engine, sqe: &Sqe, res: i32) {
        if let Some(chain) = self.chain.take() {
            engine.fail_chain(chain.head);
        }
        engine.post(sqe.user_data, res, CqeFlags::empty());
        self.poisoned = sqe.sqe_flags().is_linked();
    }

    fn link(&mut self, engine: &Engine, sub: ReqRef, done: ReqRef, flags: SqeFlags) {
        let linked = flags.is_linked();
        let drain = flags.contains(SqeFlags::IO_DRAIN);

        match self.chain.as_mut() {
            Some(chain) => chain.push(done, sub, drain),
            None if linked => {
                let head_tag = done.with(|r| r.user_data);
                self.chain = Some(OpenChain::new(done, sub, head_tag, drain));
            }
            None => return Self::queue(engine, done, drain),
        }

        if !linked && let Some(chain) = self.chain.take() {
            Self::queue(engine, chain.head, chain.drain);
        }
    }

    /// Attaches a linked timeout to the last chain member. The timeout does
    /// not become the chain tail, it only ends the chain if unflagged.
    fn attach_timeout(&mut self, engine: &Engine, sub: ReqRef, done: ReqRef, sqe: &Sqe) {
        let Some(chain) = self.chain.as_mut() else {
            return;
        };

        let slot = TimerSlot::new(done, TimerKind::Linked, sqe);
        let parent = chain.tail.downgrade();
        sub.with(|r| {
            r.flags.insert(ReqFlags::LINKED_TIMEOUT);
            r.parent = Some(parent);
            r.timer = Some(slot.clone());
        });
        chain.tail.with(|r| r.linked_timeout = Some(slot));

        if !sqe.sqe_flags().is_linked()
            && let Some(chain) = self.chain.take()
        {
            Self::queue(engine, chain.head, chain.drain);
        }
    }

    fn queue(engine: &Engine, head: ReqRef, drain: bool) {
        if let Some(head) = engine.drain.defer_or_pass(head, drain) {
            engine.dispatch(head);
        }
    }
}

impl Engine {
    /// Submission time validation. Errors are positive errno values.
    fn prepare(&self, sqe: &Sqe) -> Result<Prepared, i32> {
        let handler = self.ops.get(Opcode(sqe.opcode)).ok_or(libc::EINVAL)?.clone();
        let flags = SqeFlags::from_bits(sqe.flags).ok_or(libc::EINVAL)?;
        let caps = handler.caps();

        if flags.contains(SqeFlags::BUFFER_SELECT) && !caps.contains(OpCaps::BUFFER_SELECT) {
            return Err(libc::EINVAL);
        }

        let file = if caps.contains(OpCaps::NEEDS_FILE) {
            Some(self.resolve_file(sqe.fd, flags.contains(SqeFlags::FIXED_FILE))?)
        } else {
            None
        };

        let buffer = if caps.contains(OpCaps::FIXED_BUFFER) {
            let (table, buf) = self
                .fixed_buffers
                .lookup(sqe.buf_index as usize)
                .ok_or(libc::EFAULT)?;
            Some(BufferRef::Fixed { _table: table, buf })
        } else {
            None
        };

        handler.prep(sqe)?;

        Ok(Prepared {
            handler,
            file,
            buffer,
        })
    }

    fn resolve_file(&self, fd: i32, fixed: bool) -> Result<FileRef, i32> {
        if fixed {
            let index = usize::try_from(fd).map_err(|_| libc::EBADF)?;
            let (table, file) = self.fixed_files.lookup(index).ok_or(libc::EBADF)?;
            Ok(FileRef {
                file,
                table: Some(table),
            })
        } else {
            let file = self.files.get(fd).ok_or(libc::EBADF)?;
            Ok(FileRef { file, table: None })
        }
    }

    /// Caller driven submission. A no-op while the polling submitter owns
    /// the ring.
    pub(crate) fn submit(&self, to_submit: u32) -> Result<u32, EngineError> {
        match self.submitter.lock().as_mut() {
            Some(submitter) => submitter.submit_batch(self, to_submit),
            None => Ok(0),
        }
    }
}
