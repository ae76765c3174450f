use crate::context::Engine;
use crate::runtime::EngineConfig;
use crate::runtime::stealing::worker::{self, Worker};
use crate::sqe::errors::EngineError;
use crate::sqe::request::ReqRef;
use crate::utils::thread::{join_all, spawn_engine_thread};
use crossbeam_deque::{Injector, Worker as CbWorker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{JoinHandle, Thread};

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(0);

/// State shared by the pool handle and every worker.
#[derive(Debug)]
pub(super) struct Shared {
    /// Tells a worker thread which pool its local queue belongs to.
    pub(super) id: usize,

    /// Requests offloaded from outside the workers.
    pub(super) injector: Injector<ReqRef>,

    /// LIFO collection of parked workers. The latest parked one has the
    /// hottest cache.
    pub(super) parked_threads: Mutex<VecDeque<(Thread, Arc<AtomicBool>)>>,

    /// Workers drain their queues and exit.
    pub(super) shutdown: AtomicBool,

    /// Workers exited, nothing is accepted anymore.
    pub(super) stopped: AtomicBool,

    /// Requests pushed and not picked up yet.
    pub(super) queued: AtomicUsize,
    pub(super) queue_limit: usize,
    pub(super) max_steal_retries: usize,
}

impl Shared {
    pub(super) fn unpark_one_thread(&self) -> bool {
        if let Some((thread, should_unpark)) = self.parked_threads.lock().pop_back() {
            should_unpark.store(true, Ordering::Release);
            thread.unpark();
            true
        } else {
            false
        }
    }

    pub(super) fn unpark_all_threads(&self) -> usize {
        let mut parked_threads = self.parked_threads.lock();
        let mut num_unparked = 0;

        while let Some((thread, should_unpark)) = parked_threads.pop_back() {
            should_unpark.store(true, Ordering::Release);
            thread.unpark();
            num_unparked += 1;
        }

        num_unparked
    }
}

/// Handle to the offload workers.
#[derive(Debug)]
pub(crate) struct ThreadPool {
    shared: Arc<Shared>,
    worker_threads: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    pub(crate) fn new(cfg: &EngineConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
                injector: Injector::new(),
                parked_threads: Mutex::new(VecDeque::with_capacity(cfg.worker_threads)),
                shutdown: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
                queued: AtomicUsize::new(0),
                queue_limit: cfg.worker_queue_limit,
                max_steal_retries: cfg.max_steal_retries,
            }),
            worker_threads: cfg.worker_threads,
            handles: Mutex::new(Vec::with_capacity(cfg.worker_threads)),
        }
    }

    pub(crate) fn spawn(&self, engine: &Arc<Engine>) -> Result<(), EngineError> {
        let mut local_queues = Vec::with_capacity(self.worker_threads);
        let mut stealers = Vec::with_capacity(self.worker_threads);

        for _ in 0..self.worker_threads {
            let w = CbWorker::new_lifo();
            stealers.push(w.stealer());
            local_queues.push(w);
        }

        let mut handles = self.handles.lock();
        for (i, local_queue) in local_queues.into_iter().enumerate() {
            // Each worker steals from every *other* worker.
            let other_stealers = stealers
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, s)| s.clone())
                .collect::<Vec<_>>();

            let worker = Worker::new(self.shared.clone(), other_stealers);
            let engine_ref = Arc::clone(engine);

            handles.push(spawn_engine_thread(&engine.cfg, "worker", move || {
                worker.run(engine_ref, local_queue)
            })?);
        }

        tracing::debug!(workers = handles.len(), "offload workers started");
        Ok(())
    }

    /// Queues `req` for a worker. Gives it back if the queues are saturated
    /// or the workers are gone.
    pub(crate) fn push(&self, req: ReqRef) -> Result<(), ReqRef> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(req);
        }
        if self.shared.queued.fetch_add(1, Ordering::AcqRel) >= self.shared.queue_limit {
            self.shared.queued.fetch_sub(1, Ordering::AcqRel);
            return Err(req);
        }

        if let Err(req) = worker::push_local(self.shared.id, req) {
            self.shared.injector.push(req);
        }
        self.shared.unpark_one_thread();
        Ok(())
    }

    pub(crate) fn queued(&self) -> usize {
        self.shared.queued.load(Ordering::Relaxed)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn parked(&self) -> usize {
        self.shared.parked_threads.lock().len()
    }

    /// Lets the workers drain their queues, then joins them.
    pub(crate) fn shutdown(&self) -> anyhow::Result<()> {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.unpark_all_threads();

        let handles = std::mem::take(&mut *self.handles.lock());
        let joined = join_all(handles);
        self.shared.stopped.store(true, Ordering::Release);
        joined
    }

    /// Requests pushed after the workers made their last pass.
    pub(crate) fn take_stranded(&self) -> Vec<ReqRef> {
        let stranded = std::iter::repeat_with(|| self.shared.injector.steal())
            .take_while(|s| !s.is_empty())
            .filter_map(|s| s.success())
            .collect::<Vec<_>>();
        self.shared.queued.store(0, Ordering::Release);
        stranded
    }
}
