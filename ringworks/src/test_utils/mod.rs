use crate::runtime::{Builder, EnterFlags, Uring};
use crate::sqe::errors::EngineError;
use crate::sqe::{Cqe, Sqe};
use anyhow::{Result, anyhow};
use std::time::{Duration, Instant};

pub(crate) mod mocks;
pub(crate) use mocks::{Event, Pipe, SLOW_OP, SlowOp};

/// Default upper bound on how long a test waits for its completions.
pub(crate) const WAIT: Duration = Duration::from_secs(10);

/// Installs a `tracing` subscriber honouring `RUST_LOG`. Idempotent.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engine with two offload workers and [`SlowOp`] bound to [`SLOW_OP`].
pub(crate) fn builder(entries: u32, slow: &SlowOp) -> Builder {
    init_tracing();
    Builder::new()
        .entries(entries)
        .worker_threads(2)
        .opcode(SLOW_OP, slow.clone())
}

pub(crate) fn uring(entries: u32) -> Result<(Uring, SlowOp)> {
    let slow = SlowOp::default();
    let ring = builder(entries, &slow).try_build()?;
    Ok((ring, slow))
}

pub(crate) fn push_all(ring: &mut Uring, sqes: &[Sqe]) -> Result<()> {
    // SAFETY: test entries carry no pointers, or pointers the test keeps
    // alive until it collected every completion.
    unsafe { ring.submission().push_multiple(sqes)? };
    Ok(())
}

/// Pushes and submits `sqes`, returning the number of consumed entries.
pub(crate) fn submit_all(ring: &mut Uring, sqes: &[Sqe]) -> Result<u32> {
    push_all(ring, sqes)?;
    Ok(ring.submit()?)
}

/// Collects completions until `n` were seen or `timeout` expired.
pub(crate) fn wait_for(ring: &mut Uring, n: usize, timeout: Duration) -> Result<Vec<Cqe>> {
    let deadline = Instant::now() + timeout;
    let mut cqes = Vec::with_capacity(n);

    loop {
        cqes.extend(ring.completion());
        if cqes.len() >= n {
            return Ok(cqes);
        }

        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(anyhow!(
                "timed out with {} of {} completions: {:?}",
                cqes.len(),
                n,
                cqes
            ));
        }

        match ring.enter(0, 1, EnterFlags::GETEVENTS, Some(left)) {
            Ok(_) | Err(EngineError::TimedOut) => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Submits `sqes` and waits for `n` completions.
pub(crate) fn run(ring: &mut Uring, sqes: &[Sqe], n: usize) -> Result<Vec<Cqe>> {
    submit_all(ring, sqes)?;
    wait_for(ring, n, WAIT)
}

/// `(user_data, res)` pairs, in ring order.
pub(crate) fn results(cqes: &[Cqe]) -> Vec<(u64, i32)> {
    cqes.iter().map(|c| (c.user_data, c.res)).collect()
}

/// Result of the completion tagged `user_data`.
pub(crate) fn result_of(cqes: &[Cqe], user_data: u64) -> Option<i32> {
    cqes.iter().find(|c| c.user_data == user_data).map(|c| c.res)
}

/// Polls `cond` until it holds or `timeout` expires.
pub(crate) fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}
