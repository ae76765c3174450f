//! Offload worker pool: blocking attempts run here, with work stealing
//! between workers.

mod pool;
pub(crate) use pool::ThreadPool;

mod worker;
