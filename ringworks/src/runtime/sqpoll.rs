use crate::context::Engine;
use crate::context::ring::SqRingFlags;
use crate::runtime::submit::Submitter;
use crate::sqe::errors::EngineError;
use crate::utils::thread::{join_all, spawn_engine_thread};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{Ordering, fence};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct State {
    stop: bool,
    woken: bool,
}

/// Polling submitter: a thread that consumes the submission ring on its own,
/// so that the caller never has to enter the engine to submit.
///
/// After `idle` without work it raises `SqRingFlags::NEED_WAKEUP` and sleeps
/// until [`SqPoll::wake`].
#[derive(Debug)]
pub(crate) struct SqPoll {
    idle: Duration,
    state: Mutex<State>,
    cond: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl SqPoll {
    pub(crate) fn new(idle: Duration) -> Self {
        Self {
            idle,
            state: Mutex::new(State::default()),
            cond: Condvar::new(),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn spawn(
        &self,
        engine: &Arc<Engine>,
        submitter: Submitter,
    ) -> Result<(), EngineError> {
        let engine_ref = Arc::clone(engine);
        let handle =
            spawn_engine_thread(&engine.cfg, "sqpoll", move || run(engine_ref, submitter))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub(crate) fn wake(&self) {
        let mut state = self.state.lock();
        state.woken = true;
        self.cond.notify_one();
    }

    pub(crate) fn stop(&self) {
        {
            let mut state = self.state.lock();
            state.stop = true;
            self.cond.notify_one();
        }

        if let Some(handle) = self.thread.lock().take()
            && let Err(e) = join_all([handle])
        {
            tracing::error!(error = %e, "sqpoll thread");
        }
    }

    fn should_stop(&self) -> bool {
        self.state.lock().stop
    }

    /// Sleeps until woken or stopped. Returns `false` on stop.
    fn sleep(&self) -> bool {
        let mut state = self.state.lock();
        while !state.stop && !state.woken {
            self.cond.wait(&mut state);
        }
        state.woken = false;
        !state.stop
    }
}

fn run(engine: Arc<Engine>, mut submitter: Submitter) {
    let Some(sqpoll) = engine.sqpoll.as_ref() else {
        return;
    };
    let mut last_work = Instant::now();

    tracing::debug!(idle = ?sqpoll.idle, "sqpoll thread started");

    while !sqpoll.should_stop() {
        let submitted = match submitter.submit_batch(&engine, u32::MAX) {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "sqpoll thread stopping");
                break;
            }
        };
        let flushed = engine.completions.flush_overflow();

        if submitted > 0 || flushed > 0 {
            last_work = Instant::now();
            continue;
        }

        if last_work.elapsed() < sqpoll.idle {
            thread::yield_now();
            continue;
        }

        engine.mem.set_sq_flag(SqRingFlags::NEED_WAKEUP);
        // Pairs with the fence in `SqProducer::needs_wakeup`: either the
        // caller sees the flag, or we see its new tail.
        fence(Ordering::SeqCst);

        if !matches!(submitter.pending(), Ok(0)) {
            engine.mem.clear_sq_flag(SqRingFlags::NEED_WAKEUP);
            continue;
        }

        tracing::trace!("sqpoll idle, sleeping");
        let running = sqpoll.sleep();
        engine.mem.clear_sq_flag(SqRingFlags::NEED_WAKEUP);

        if !running {
            break;
        }
        tracing::trace!("sqpoll woken");
        last_work = Instant::now();
    }

    tracing::debug!("sqpoll thread stopped");
}
