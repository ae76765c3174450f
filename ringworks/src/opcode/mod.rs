//! Pluggable operation kinds.
//!
//! Every opcode is served by an [`OpHandler`]. The engine only relies on the
//! handler's capability profile ([`OpCaps`]) and on [`OpHandler::issue`]
//! behaving as a small resumable state machine: it either completes, or
//! reports that it would block and is invoked again later, from a readiness
//! notification or an offload worker.

use crate::context::Engine;
use crate::context::buffer_pool::BufferRef;
use crate::file::File;
use crate::sqe::request::ReqRef;
use crate::sqe::{Opcode, Sqe};
use bitflags::bitflags;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub(crate) mod builtin;
pub(crate) mod rw;

bitflags! {
    /// Capability profile of an operation kind.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OpCaps: u32 {
        /// `fd` names a file, resolved at submission time.
        const NEEDS_FILE = 1;

        /// On would-block, wait for `PollMask::IN` on the file instead of
        /// offloading.
        const POLL_IN = 1 << 1;

        /// On would-block, wait for `PollMask::OUT` on the file instead of
        /// offloading.
        const POLL_OUT = 1 << 2;

        /// Accepts `SqeFlags::BUFFER_SELECT`.
        const BUFFER_SELECT = 1 << 3;

        /// `buf_index` names a registered buffer.
        const FIXED_BUFFER = 1 << 4;

        /// Never handed to the offload workers, would-block is an error.
        const INLINE_ONLY = 1 << 5;
    }
}

/// Outcome of one [`OpHandler::issue`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Issue {
    /// Done, with a completion result (negative errno on failure).
    Complete(i32),

    /// No progress possible without blocking. The handler is invoked again
    /// once the file is ready or on an offload worker.
    WouldBlock,

    /// Handed over to an engine facility (timer, readiness wait) that
    /// completes the request later. Only valid for built-in kinds.
    #[doc(hidden)]
    Parked,
}

/// Handler of one operation kind.
pub trait OpHandler: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn caps(&self) -> OpCaps {
        OpCaps::empty()
    }

    /// Submission time validation. Errors are positive errno values, the
    /// entry completes with the negated value without being issued.
    fn prep(&self, _sqe: &Sqe) -> Result<(), i32> {
        Ok(())
    }

    /// Attempts the operation. `cx.nonblock()` is set on the inline attempt.
    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue;

    /// Releases per-request state stored through [`IssueCx::set_state`]. Runs
    /// first when the request is torn down.
    fn cleanup(&self, state: Option<Box<dyn Any + Send>>) {
        drop(state);
    }
}

/// Everything an [`OpHandler`] may touch while issuing one request.
pub struct IssueCx<'a> {
    pub(crate) engine: &'a Engine,
    pub(crate) req: &'a ReqRef,
    pub(crate) sqe: &'a Sqe,
    pub(crate) file: Option<&'a Arc<dyn File>>,
    pub(crate) buffer: Option<&'a mut BufferRef>,
    pub(crate) state: &'a mut Option<Box<dyn Any + Send>>,
    pub(crate) nonblock: bool,
    pub(crate) cancelled: &'a AtomicBool,
}

impl IssueCx<'_> {
    pub fn sqe(&self) -> &Sqe {
        self.sqe
    }

    pub fn file(&self) -> Option<&dyn File> {
        self.file.map(|f| &**f)
    }

    pub fn nonblock(&self) -> bool {
        self.nonblock
    }

    /// A cancellation reached the request while it was running. Long running
    /// handlers should check this and return `-ECANCELED`.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// State kept across `issue` calls of the same request.
    pub fn state<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.state.as_mut()?.downcast_mut()
    }

    pub fn set_state<T: Any + Send>(&mut self, state: T) {
        *self.state = Some(Box::new(state));
    }
}

impl fmt::Debug for IssueCx<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssueCx")
            .field("opcode", &self.sqe.opcode)
            .field("user_data", &self.sqe.user_data)
            .field("nonblock", &self.nonblock)
            .finish()
    }
}

/// Opcode to handler dispatch table.
#[derive(Clone)]
pub(crate) struct OpTable {
    handlers: Box<[Option<Arc<dyn OpHandler>>]>,
}

impl OpTable {
    pub(crate) fn with_builtins() -> Self {
        let mut table = Self {
            handlers: (0..=u8::MAX).map(|_| None).collect(),
        };

        table.register(Opcode::NOP, Arc::new(builtin::Nop));
        table.register(Opcode::READ, Arc::new(rw::Read));
        table.register(Opcode::WRITE, Arc::new(rw::Write));
        table.register(Opcode::READ_FIXED, Arc::new(rw::ReadFixed));
        table.register(Opcode::WRITE_FIXED, Arc::new(rw::WriteFixed));
        table.register(Opcode::FSYNC, Arc::new(rw::Fsync));
        table.register(Opcode::POLL_ADD, Arc::new(builtin::PollAdd));
        table.register(Opcode::POLL_REMOVE, Arc::new(builtin::PollRemove));
        table.register(Opcode::TIMEOUT, Arc::new(builtin::Timeout));
        table.register(Opcode::TIMEOUT_REMOVE, Arc::new(builtin::TimeoutRemove));
        table.register(Opcode::LINK_TIMEOUT, Arc::new(builtin::LinkTimeout));
        table.register(Opcode::ASYNC_CANCEL, Arc::new(builtin::AsyncCancel));
        table.register(Opcode::PROVIDE_BUFFERS, Arc::new(builtin::ProvideBuffers));
        table.register(Opcode::REMOVE_BUFFERS, Arc::new(builtin::RemoveBuffers));

        table
    }

    pub(crate) fn register(&mut self, opcode: Opcode, handler: Arc<dyn OpHandler>) {
        self.handlers[opcode.0 as usize] = Some(handler);
    }

    pub(crate) fn get(&self, opcode: Opcode) -> Option<&Arc<dyn OpHandler>> {
        self.handlers[opcode.0 as usize].as_ref()
    }
}

impl fmt::Debug for OpTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.handlers
                    .iter()
                    .enumerate()
                    .filter_map(|(code, h)| h.as_ref().map(|h| (code, h.name()))),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nop(Opcode::NOP, "nop")]
    #[case::read(Opcode::READ, "read")]
    #[case::cancel(Opcode::ASYNC_CANCEL, "async_cancel")]
    #[case::remove_buffers(Opcode::REMOVE_BUFFERS, "remove_buffers")]
    fn test_builtins_registered(#[case] opcode: Opcode, #[case] name: &str) {
        let table = OpTable::with_builtins();
        assert_eq!(table.get(opcode).map(|h| h.name()), Some(name));
    }

    #[test]
    fn test_unknown_opcode() {
        let table = OpTable::with_builtins();
        assert!(table.get(Opcode(Opcode::LAST_BUILTIN.0 + 1)).is_none());
        assert!(table.get(Opcode(u8::MAX)).is_none());
    }
}
