use crate::context::buffer_pool::BufferPool;
use crate::context::completion::Completions;
use crate::context::ring::{RingLayout, RingMemory, SubmissionRing};
use crate::context::tables::{FileTable, RegisteredBuffer, ResourceTable};
use crate::file::File;
use crate::opcode::OpTable;
use crate::runtime::cancel::CancelIndex;
use crate::runtime::drain::DrainQueue;
use crate::runtime::sqpoll::SqPoll;
use crate::runtime::stealing::ThreadPool;
use crate::runtime::submit::Submitter;
use crate::runtime::timer::Timers;
use crate::runtime::{EngineConfig, SetupFlags};
use crate::sqe::CqeFlags;
use crate::sqe::errors::EngineError;
use crate::sqe::request::RequestPool;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

pub(crate) mod buffer_pool;
pub(crate) mod completion;
pub(crate) mod ring;
pub(crate) mod slab;
pub(crate) mod tables;

/// Snapshot of engine counters, see [`Uring::stats`](crate::Uring::stats).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Submission entries consumed, rejected ones included.
    pub submitted: u64,
    /// Completions posted, through the ring or the overflow backlog.
    pub completed: u64,
    /// Completions that went through the overflow backlog.
    pub overflowed: u64,
    /// Completions currently waiting in the overflow backlog.
    pub backlog: usize,
    /// Submission entries skipped for an out of range index.
    pub dropped: u32,
    /// Completions discarded at teardown.
    pub discarded: u32,
    /// Live request objects.
    pub inflight: usize,
    /// Requests waiting in the offload worker queues.
    pub queued_work: usize,
    /// Chains held back behind a drain barrier.
    pub deferred: usize,
}

/// The engine context: owner of the ring memory, the request pool, the
/// resource tables and every background thread.
///
/// Exactly one per [`Uring`](crate::Uring). Background threads hold an `Arc`
/// to it and are joined by [`Engine::shutdown`], after which the last
/// reference is the caller's.
pub(crate) struct Engine {
    pub(crate) cfg: EngineConfig,
    pub(crate) me: Weak<Engine>,
    pub(crate) epoch: Instant,

    pub(crate) mem: Arc<RingMemory>,
    pub(crate) completions: Completions,
    pub(crate) requests: Arc<RequestPool>,
    pub(crate) ops: OpTable,

    pub(crate) files: FileTable,
    pub(crate) fixed_files: ResourceTable<Arc<dyn File>>,
    pub(crate) fixed_buffers: ResourceTable<Arc<RegisteredBuffer>>,
    pub(crate) buffers: Arc<BufferPool>,

    pub(crate) inflight: CancelIndex,
    pub(crate) drain: DrainQueue,
    pub(crate) timers: Timers,
    pub(crate) workers: ThreadPool,

    /// Consumer side of the submission ring. `None` while a polling
    /// submitter thread owns it.
    pub(crate) submitter: Mutex<Option<Submitter>>,
    pub(crate) sqpoll: Option<SqPoll>,

    next_seq: AtomicU64,
    submitted: AtomicU64,
    fatal: AtomicBool,
    shutdown: AtomicBool,
}

impl Engine {
    pub(crate) fn try_new(cfg: EngineConfig) -> Result<Arc<Self>, EngineError> {
        let layout = RingLayout::new(cfg.sq_entries, cfg.cq_entries);
        let mem = Arc::new(RingMemory::new(layout)?);

        tracing::debug!(
            sq_entries = cfg.sq_entries,
            cq_entries = cfg.cq_entries,
            flags = ?cfg.flags,
            workers = cfg.worker_threads,
            "setting up engine"
        );

        let sqpoll = cfg.flags.contains(SetupFlags::SQPOLL);

        let engine = Arc::new_cyclic(|me| Engine {
            me: me.clone(),
            epoch: Instant::now(),
            completions: Completions::new(mem.clone()),
            requests: RequestPool::new(cfg.request_pool_size),
            ops: cfg.ops.clone(),
            files: FileTable::default(),
            fixed_files: ResourceTable::new("file"),
            fixed_buffers: ResourceTable::new("buffer"),
            buffers: Arc::new(BufferPool::default()),
            inflight: CancelIndex::default(),
            drain: DrainQueue::default(),
            timers: Timers::new(),
            workers: ThreadPool::new(&cfg),
            submitter: Mutex::new(
                (!sqpoll).then(|| Submitter::new(SubmissionRing::new(mem.clone()))),
            ),
            sqpoll: sqpoll.then(|| SqPoll::new(cfg.sq_thread_idle)),
            mem,
            next_seq: AtomicU64::new(0),
            submitted: AtomicU64::new(0),
            fatal: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            cfg,
        });

        if let Err(e) = engine.start() {
            tracing::error!(error = %e, "failed to start engine threads");
            engine.shutdown();
            return Err(e);
        }

        Ok(engine)
    }

    fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        self.workers.spawn(self)?;
        self.timers.spawn(self)?;

        if let Some(sqpoll) = &self.sqpoll {
            sqpoll.spawn(self, Submitter::new(SubmissionRing::new(self.mem.clone())))?;
        }

        Ok(())
    }

    pub(crate) fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn count_submitted(&self, n: u64) {
        self.submitted.fetch_add(n, Ordering::Release);
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Marks the engine as unusable after a ring invariant violation.
    pub(crate) fn poison(&self, err: &EngineError) {
        if !self.fatal.swap(true, Ordering::AcqRel) {
            tracing::error!(error = %err, "engine poisoned");
        }
    }

    pub(crate) fn check_alive(&self) -> Result<(), EngineError> {
        if self.fatal.load(Ordering::Acquire) {
            return Err(EngineError::RingCorrupted(
                "engine stopped after an earlier ring corruption".into(),
            ));
        }
        if self.is_shutdown() {
            return Err(EngineError::ShuttingDown);
        }
        Ok(())
    }

    pub(crate) fn stats(&self) -> Stats {
        let hdr = self.mem.header();
        // Every completion read here has its submission counted already.
        let completed = self.completions.posted();
        Stats {
            submitted: self.submitted.load(Ordering::Acquire),
            completed,
            overflowed: self.completions.overflowed(),
            backlog: self.completions.backlog_len(),
            dropped: hdr.sq_dropped.load(Ordering::Relaxed),
            discarded: hdr.cq_overflow.load(Ordering::Relaxed),
            inflight: self.requests.live(),
            queued_work: self.workers.queued(),
            deferred: self.drain.len(),
        }
    }

    /// Stops every background thread and resolves every request still in
    /// flight. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(live = self.requests.live(), "shutting down engine");

        if let Some(sqpoll) = &self.sqpoll {
            sqpoll.stop();
        }

        // Cancellation first, so that workers only find cancelled work left.
        let cancelled = self.cancel_everything();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled requests in flight at shutdown");
        }

        if let Err(e) = self.workers.shutdown() {
            tracing::error!(error = %e, "worker pool shutdown");
        }
        for req in self.workers.take_stranded() {
            self.complete_from(req, -libc::ECANCELED, CqeFlags::empty(), true);
        }
        self.timers.shutdown(self);

        self.completions.discard_backlog();

        let live = self.requests.live();
        if live > 0 {
            tracing::warn!(live, "requests still alive after shutdown");
        }
    }
}
