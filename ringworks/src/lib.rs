//! Shared-ring asynchronous I/O engine.
//!
//! Callers push [`Sqe`]s into a submission ring and consume [`Cqe`]s from a
//! completion ring. The engine issues each request inline when it can, parks
//! it on a readiness [`WaitQueue`] when it would block, and otherwise hands it
//! to a pool of offload workers. Requests can be chained, raced against
//! linked timeouts, held behind drain barriers and cancelled by tag.
//!
//! ```no_run
//! use ringworks::{Sqe, Uring};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut ring = Uring::new(8)?;
//! unsafe { ring.submission().push(&Sqe::nop().user_data(42))? };
//! ring.submit_and_wait(1)?;
//!
//! let cqe = ring.completion().next();
//! assert_eq!(cqe.map(|c| (c.user_data, c.res)), Some((42, 0)));
//! # Ok(())
//! # }
//! ```

mod context;
pub use context::Stats;
pub use context::ring::{CqOffsets, SqOffsets};

mod file;
pub use file::{File, PollMask, WaitQueue};

mod opcode;
pub use opcode::{Issue, IssueCx, OpCaps, OpHandler};

pub mod runtime;
pub use runtime::{
    Builder, CompletionQueue, EnterFlags, Features, MAX_CQ_ENTRIES, MAX_SQ_ENTRIES, Params,
    SetupFlags, SubmissionQueue, Uring,
};

mod sqe;
pub use sqe::errors::EngineError;
pub use sqe::{
    CQE_BUFFER_SHIFT, CancelFlags, Cqe, CqeFlags, NopFlags, Opcode, Sqe, SqeFlags, TimeoutFlags,
};

mod utils;

#[cfg(test)]
mod test_utils;
