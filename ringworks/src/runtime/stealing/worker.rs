use crate::context::Engine;
use crate::runtime::issue::Mode;
use crate::runtime::stealing::pool::Shared;
use crate::sqe::request::ReqRef;
use crossbeam_deque::{Stealer, Worker as CbWorker};
use std::cell::RefCell;
use std::iter;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

struct LocalQueue {
    pool: usize,
    queue: CbWorker<ReqRef>,
}

thread_local! {
    // Only ever borrowed shared, `CbWorker` pushes through `&self`.
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
}

/// Pushes onto the current thread's local queue if it is a worker of pool
/// `pool`. Gives `req` back otherwise.
pub(super) fn push_local(pool: usize, req: ReqRef) -> Result<(), ReqRef> {
    LOCAL.with(|local| match &*local.borrow() {
        Some(local) if local.pool == pool => {
            local.queue.push(req);
            Ok(())
        }
        _ => Err(req),
    })
}

pub(super) struct Worker {
    shared: Arc<Shared>,

    /// Handles to every other worker's local queue.
    stealers: Vec<Stealer<ReqRef>>,

    should_unpark: Arc<AtomicBool>,
}

impl Worker {
    pub(super) fn new(shared: Arc<Shared>, mut stealers: Vec<Stealer<ReqRef>>) -> Self {
        // A different search order per worker reduces contention.
        fastrand::shuffle(&mut stealers);

        Self {
            shared,
            stealers,
            should_unpark: Arc::new(AtomicBool::new(false)),
        }
    }

    pub(super) fn run(self, engine: Arc<Engine>, local: CbWorker<ReqRef>) {
        LOCAL.with(|l| {
            *l.borrow_mut() = Some(LocalQueue {
                pool: self.shared.id,
                queue: local,
            })
        });

        loop {
            if let Some(req) = self.find_task() {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                engine.issue(req, Mode::Worker);
            } else if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            } else {
                self.park();
            }
        }

        LOCAL.with(|l| l.borrow_mut().take());
        tracing::trace!("offload worker exiting");
    }

    fn find_task(&self) -> Option<ReqRef> {
        LOCAL.with(|l| {
            let l = l.borrow();
            let local = &l.as_ref()?.queue;

            // 1. Latest pushed first, its data is hot.
            local.pop().or_else(|| {
                // 2. Repeatedly try the injector, then the other workers.
                iter::repeat_with(|| {
                    self.shared.injector.steal_batch_and_pop(local).or_else(||
                        // Collecting stops at the first `Success`.
                        self.stealers.iter().map(|s| s.steal()).collect())
                })
                .take(self.shared.max_steal_retries)
                .find(|s| !s.is_retry())
                .and_then(|s| s.success())
            })
        })
    }

    /// Parks until new work is pushed or the pool shuts down.
    fn park(&self) {
        {
            let mut parked_threads = self.shared.parked_threads.lock();

            // Checked under the lock, pushers unpark right after pushing.
            if !self.shared.injector.is_empty() || self.shared.shutdown.load(Ordering::Acquire) {
                return;
            }

            self.should_unpark.store(false, Ordering::Release);
            parked_threads.push_back((thread::current(), Arc::clone(&self.should_unpark)));
        }

        // Spurious wakeups are possible.
        while !self.should_unpark.load(Ordering::Acquire) {
            thread::park();
        }
    }
}
