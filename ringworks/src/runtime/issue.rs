use crate::context::Engine;
use crate::context::buffer_pool::{Bgid, BufferRef};
use crate::file::PollMask;
use crate::opcode::{Issue, IssueCx, OpCaps};
use crate::runtime::poll::PollKind;
use crate::sqe::request::{ReqFlags, ReqRef, ReqState};
use crate::sqe::{CQE_BUFFER_SHIFT, CqeFlags};
use crate::utils::scope_guard::ScopeGuard;
use std::cell::Cell;

/// Nested inline issues allowed on one thread before the next one is handed
/// to the offload workers. Readiness notifications fired from inside a
/// handler would otherwise recurse without bound.
const MAX_INLINE_DEPTH: usize = 8;

thread_local! {
    static INLINE_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Where an issue attempt runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    /// Submitting or notifying thread, must not block.
    Inline,
    /// Offload worker, may block.
    Worker,
}

enum Start {
    Skip,
    Cancelled,
    Offload,
    Run,
}

enum Outcome {
    Done(i32, CqeFlags),
    WouldBlock,
    Parked,
}

impl Engine {
    /// Issues `req` inline on the current thread, or offloads it once the
    /// inline nesting limit is reached.
    pub(crate) fn dispatch(&self, req: ReqRef) {
        let depth = INLINE_DEPTH.with(Cell::get);
        if depth >= MAX_INLINE_DEPTH {
            tracing::trace!(depth, "inline depth exhausted, offloading");
            return self.offload(req);
        }

        INLINE_DEPTH.with(|d| d.set(depth + 1));
        let _restore = ScopeGuard::new(|| INLINE_DEPTH.with(|d| d.set(depth)));

        self.issue(req, Mode::Inline);
    }

    /// Issues `req`, then every chain successor it releases, on the current
    /// thread.
    pub(crate) fn issue(&self, req: ReqRef, mode: Mode) {
        let mut next = Some(req);
        while let Some(req) = next.take() {
            next = self.issue_one(req, mode);
        }
    }

    fn issue_one(&self, req: ReqRef, mode: Mode) -> Option<ReqRef> {
        let (start, linked_timeout) = req.with(|r| {
            if r.state == ReqState::Completed {
                return (Start::Skip, None);
            }
            if r.is_cancelled() {
                return (Start::Cancelled, None);
            }
            if mode == Mode::Inline
                && r.flags.contains(ReqFlags::FORCE_ASYNC)
                && !r.handler.caps().contains(OpCaps::INLINE_ONLY)
            {
                return (Start::Offload, None);
            }

            r.state = match mode {
                Mode::Inline => ReqState::Issuing,
                Mode::Worker => ReqState::Running,
            };
            (Start::Run, r.linked_timeout.clone())
        });

        match start {
            Start::Skip => None,
            Start::Cancelled => self.complete(req, -libc::ECANCELED, CqeFlags::empty()),
            Start::Offload => {
                self.offload(req);
                None
            }
            Start::Run => {
                // The timeout starts with the first issue attempt.
                if let Some(slot) = linked_timeout {
                    self.timers.arm_linked(self, &slot);
                }

                match self.execute(&req, mode) {
                    Outcome::Done(res, cflags) => self.complete(req, res, cflags),
                    Outcome::Parked => None,
                    Outcome::WouldBlock => self.would_block(req, mode),
                }
            }
        }
    }

    /// One handler invocation, with the request's buffer and state lent to it.
    fn execute(&self, req: &ReqRef, mode: Mode) -> Outcome {
        let (sqe, handler, file, mut buffer, mut state, cancelled, select) = req.with(|r| {
            (
                r.sqe,
                r.handler.clone(),
                r.file.as_ref().map(|f| f.file.clone()),
                r.buffer.take(),
                r.async_data.take(),
                r.cancelled.clone(),
                r.flags.contains(ReqFlags::BUFFER_SELECT),
            )
        });

        // Provided buffers are picked at issue time, not at submission.
        if select && buffer.is_none() {
            let bgid = Bgid::new(sqe.buf_group());
            match self.buffers.select(bgid) {
                Some(buf) => {
                    buffer = Some(BufferRef::Selected {
                        pool: self.buffers.clone(),
                        bgid,
                        buf,
                    })
                }
                None => {
                    req.with(|r| r.async_data = state);
                    return Outcome::Done(-libc::ENOBUFS, CqeFlags::empty());
                }
            }
        }

        let issue = {
            let mut cx = IssueCx {
                engine: self,
                req,
                sqe: &sqe,
                file: file.as_ref(),
                buffer: buffer.as_mut(),
                state: &mut state,
                nonblock: mode == Mode::Inline,
                cancelled: &cancelled,
            };
            handler.issue(&mut cx)
        };

        let mut cflags = CqeFlags::empty();
        let buffer = match (issue, buffer) {
            (Issue::Complete(res), Some(BufferRef::Selected { pool, bgid, buf })) if res >= 0 => {
                cflags = CqeFlags::BUFFER
                    | CqeFlags::from_bits_retain((buf.bid().val() as u32) << CQE_BUFFER_SHIFT);
                pool.consume(bgid, buf, res as usize);
                None
            }
            // Nothing was read into it, another request may use it meanwhile.
            (Issue::WouldBlock, Some(selected @ BufferRef::Selected { .. })) => {
                selected.release();
                None
            }
            (_, buffer) => buffer,
        };

        req.with(|r| {
            if !cflags.is_empty() {
                r.flags.insert(ReqFlags::BUFFER_SELECTED);
            }
            r.buffer = buffer;
            r.async_data = state;
        });

        match issue {
            Issue::Complete(res) => Outcome::Done(res, cflags),
            Issue::WouldBlock => Outcome::WouldBlock,
            Issue::Parked if req.with(|r| r.opcode.is_builtin()) => Outcome::Parked,
            Issue::Parked => {
                tracing::warn!(handler = handler.name(), "custom handler returned Parked");
                Outcome::Done(-libc::EINVAL, CqeFlags::empty())
            }
        }
    }

    fn would_block(&self, req: ReqRef, mode: Mode) -> Option<ReqRef> {
        let (cancelled, caps, file, retries) = req.with(|r| {
            (
                r.is_cancelled(),
                r.handler.caps(),
                r.file.as_ref().map(|f| f.file.clone()),
                r.retries,
            )
        });

        if cancelled {
            return self.complete(req, -libc::ECANCELED, CqeFlags::empty());
        }
        if caps.contains(OpCaps::INLINE_ONLY) {
            return self.complete(req, -libc::EAGAIN, CqeFlags::empty());
        }

        let mut interest = PollMask::empty();
        if caps.contains(OpCaps::POLL_IN) {
            interest |= PollMask::IN;
        }
        if caps.contains(OpCaps::POLL_OUT) {
            interest |= PollMask::OUT;
        }

        let req = match file {
            Some(file) if !interest.is_empty() => {
                match self.arm_poll(req, &file, interest, PollKind::Rearm) {
                    Ok(()) => return None,
                    Err(req) => req,
                }
            }
            _ => req,
        };

        match mode {
            Mode::Inline => self.offload(req),
            Mode::Worker if retries < self.cfg.max_worker_retries => {
                req.with(|r| r.retries += 1);
                self.offload(req);
            }
            Mode::Worker => {
                tracing::debug!(retries, "request keeps blocking on a worker, giving up");
                return self.complete(req, -libc::EAGAIN, CqeFlags::empty());
            }
        }
        None
    }

    /// Hands `req` to the offload workers. Completes it with `-EBUSY` when the
    /// worker queues are saturated, `-ECANCELED` once they are stopped.
    pub(crate) fn offload(&self, req: ReqRef) {
        req.with(|r| {
            if r.state != ReqState::Completed {
                r.state = ReqState::Queued;
            }
        });

        if let Err(req) = self.workers.push(req) {
            let res = if self.workers.is_stopped() || req.with(|r| r.is_cancelled()) {
                -libc::ECANCELED
            } else {
                tracing::debug!(queued = self.workers.queued(), "worker queues saturated");
                -libc::EBUSY
            };

            if let Some(next) = self.complete(req, res, CqeFlags::empty()) {
                self.dispatch(next);
            }
        }
    }
}

