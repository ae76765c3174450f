// Public API
pub mod runtime;
pub use runtime::{
    Builder, EnterFlags, Features, MAX_CQ_ENTRIES, MAX_SQ_ENTRIES, Params, SetupFlags, Uring,
};

pub(crate) use runtime::EngineConfig;

mod queue;
pub use queue::{CompletionQueue, SubmissionQueue};

// Request lifecycle
pub(crate) mod cancel;
pub(crate) mod drain;
pub(crate) mod issue;
pub(crate) mod poll;
pub(crate) mod submit;
pub(crate) mod timer;

// Background threads
pub(crate) mod sqpoll;
pub(crate) mod stealing;
