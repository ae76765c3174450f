use crate::context::buffer_pool::{Bgid, Bid};
use crate::context::ring::{CqConsumer, CqOffsets, SqOffsets, SqProducer};
use crate::context::tables::RegisteredBuffer;
use crate::context::{Engine, Stats};
use crate::file::File;
use crate::opcode::{OpHandler, OpTable};
use crate::runtime::queue::{CompletionQueue, SubmissionQueue};
use crate::sqe::Opcode;
use crate::sqe::errors::EngineError;
use bitflags::bitflags;
use std::convert::TryFrom;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

/// Largest submission ring.
pub const MAX_SQ_ENTRIES: u32 = 32768;

/// Largest completion ring.
pub const MAX_CQ_ENTRIES: u32 = 2 * MAX_SQ_ENTRIES;

/// Default size of the submission ring.
const SQ_ENTRIES: u32 = 128;

/// Completion ring size is `sq_entries * CQ_ENTRIES_MULTIPLIER` unless
/// `SetupFlags::CQSIZE` is given.
const CQ_ENTRIES_MULTIPLIER: u32 = 2;

/// How long the polling submitter spins without work before it sleeps.
const SQ_THREAD_IDLE: Duration = Duration::from_millis(10);

/// How many times a request that keeps blocking is requeued by a worker.
const MAX_WORKER_RETRIES: u32 = 3;

/// Maximum number of stealing attempts.
const MAX_STEAL_RETRIES: usize = 3;

bitflags! {
    /// Setup flags, [`Params::flags`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SetupFlags: u32 {
        /// Consume the submission ring from a dedicated polling thread.
        const SQPOLL = 1;

        /// `Params::cq_entries` sizes the completion ring.
        const CQSIZE = 1 << 1;

        /// Clamp oversized ring sizes instead of failing.
        const CLAMP = 1 << 2;

        /// Keep submitting after an entry fails validation.
        const SUBMIT_ALL = 1 << 3;
    }
}

bitflags! {
    /// Features reported by [`Uring::setup`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u32 {
        /// Completions are never dropped while the engine runs, the overflow
        /// backlog holds what does not fit.
        const NODROP = 1;

        /// Submission entries are copied out when consumed, the caller may
        /// reuse a slot right after `enter` returns.
        const SUBMIT_STABLE = 1 << 1;

        /// `SqeFlags::CQE_SKIP_SUCCESS` is supported.
        const CQE_SKIP = 1 << 2;

        /// `enter` accepts a wait timeout.
        const EXT_ARG = 1 << 3;
    }
}

bitflags! {
    /// Flags for [`Uring::enter`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EnterFlags: u32 {
        /// Wait for `min_complete` completions.
        const GETEVENTS = 1;

        /// Wake the polling submitter if it went to sleep.
        const SQ_WAKEUP = 1 << 1;
    }
}

/// Setup parameters in, ring geometry out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Params {
    pub sq_entries: u32,
    pub cq_entries: u32,
    pub flags: SetupFlags,
    /// Idle window of the polling submitter, in milliseconds. Zero picks the
    /// default.
    pub sq_thread_idle: u32,
    pub features: Features,
    pub sq_off: SqOffsets,
    pub cq_off: CqOffsets,
    /// Size of the ring region: header, completion entries and index array.
    pub ring_size: usize,
    /// Size of the submission entry array region.
    pub sqes_size: usize,
}

#[derive(Clone)]
pub(crate) struct ThreadNameFn(pub(crate) Arc<dyn Fn() -> String + Send + Sync + 'static>);

fn default_thread_name_fn() -> ThreadNameFn {
    let thread_count = Arc::new(AtomicUsize::new(0));

    ThreadNameFn(Arc::new(move || {
        let id = thread_count.fetch_add(1, Ordering::Relaxed);
        format!("ringworks-{}", id)
    }))
}

impl fmt::Debug for ThreadNameFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadNameFn").field(&"<function>").finish()
    }
}

#[derive(Debug)]
pub struct Builder {
    /// Requested submission ring size, rounded up to a power of two.
    sq_entries: u32,

    /// Requested completion ring size. Defaults to twice the submission ring.
    cq_entries: Option<u32>,

    /// Clamp ring sizes to their maximum instead of failing.
    clamp: bool,

    /// Consume the submission ring from a polling thread with this idle window.
    sqpoll: Option<Duration>,

    /// Keep submitting after a validation failure.
    submit_all: bool,

    /// The number of offload worker threads. Defaults to 1 per core.
    worker_threads: Option<usize>,

    /// How many times a worker requeues a request that keeps blocking before
    /// completing it with `-EAGAIN`.
    max_worker_retries: u32,

    /// Maximum number of requests waiting for a worker. Past it, offloaded
    /// requests complete with `-EBUSY`. Defaults to the request pool size.
    worker_queue_limit: Option<usize>,

    /// How many times a worker will loop over the global injector queue and
    /// other stealable queues to try and find work before parking.
    max_steal_retries: usize,

    /// Number of request objects. Defaults to the completion ring size, one
    /// more emergency object is always reserved.
    request_pool_size: Option<usize>,

    /// Name fn used for threads spawned by the engine.
    thread_name: ThreadNameFn,

    /// Stack size used for threads spawned by the engine.
    thread_stack_size: Option<usize>,

    ops: OpTable,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            sq_entries: SQ_ENTRIES,
            cq_entries: None,
            clamp: false,
            sqpoll: None,
            submit_all: false,
            worker_threads: None,
            max_worker_retries: MAX_WORKER_RETRIES,
            worker_queue_limit: None,
            max_steal_retries: MAX_STEAL_RETRIES,
            request_pool_size: None,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            ops: OpTable::with_builtins(),
        }
    }

    #[track_caller]
    pub fn entries(mut self, val: u32) -> Self {
        assert!(val > 0, "entries must be greater than 0");
        self.sq_entries = val;
        self
    }

    /// Sizes the completion ring, `SetupFlags::CQSIZE`.
    #[track_caller]
    pub fn cq_entries(mut self, val: u32) -> Self {
        assert!(val > 0, "cq_entries must be greater than 0");
        self.cq_entries = Some(val);
        self
    }

    pub fn clamp(mut self, val: bool) -> Self {
        self.clamp = val;
        self
    }

    /// Consumes the submission ring from a polling thread, which sleeps after
    /// `idle` without work. See [`SubmissionQueue::need_wakeup`].
    pub fn sqpoll(mut self, idle: Duration) -> Self {
        self.sqpoll = Some(idle);
        self
    }

    pub fn submit_all(mut self, val: bool) -> Self {
        self.submit_all = val;
        self
    }

    #[track_caller]
    pub fn worker_threads(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_threads must be greater than 0");
        self.worker_threads = Some(val);
        self
    }

    pub fn max_worker_retries(mut self, val: u32) -> Self {
        self.max_worker_retries = val;
        self
    }

    #[track_caller]
    pub fn worker_queue_limit(mut self, val: usize) -> Self {
        assert!(val > 0, "worker_queue_limit must be greater than 0");
        self.worker_queue_limit = Some(val);
        self
    }

    #[track_caller]
    pub fn max_steal_retries(mut self, val: usize) -> Self {
        assert!(val > 0, "max_steal_retries must be greater than 0");
        self.max_steal_retries = val;
        self
    }

    #[track_caller]
    pub fn request_pool_size(mut self, val: usize) -> Self {
        assert!(val > 0, "request_pool_size must be greater than 0");
        self.request_pool_size = Some(val);
        self
    }

    /// Sets name of threads spawned by the engine.
    ///
    /// The default name is "ringworks-{id}", where id is monotonically
    /// increasing.
    pub fn thread_name(mut self, val: impl Into<String>) -> Self {
        let val = val.into();
        self.thread_name = ThreadNameFn(Arc::new(move || val.clone()));
        self
    }

    pub fn thread_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.thread_name = ThreadNameFn(Arc::new(f));
        self
    }

    #[track_caller]
    pub fn thread_stack_size(mut self, val: usize) -> Self {
        assert!(
            val.is_power_of_two(),
            "thread_stack_size must be a power of two"
        );
        self.thread_stack_size = Some(val);
        self
    }

    /// Binds `opcode` to a custom operation kind.
    #[track_caller]
    pub fn opcode(mut self, opcode: Opcode, handler: impl OpHandler) -> Self {
        assert!(
            !opcode.is_builtin(),
            "opcode {} is reserved for a built-in operation",
            opcode.0
        );
        self.ops.register(opcode, Arc::new(handler));
        self
    }

    /// Creates the configured engine, its background threads started.
    pub fn try_build(self) -> anyhow::Result<Uring> {
        Ok(Uring::from_config(self.try_into()?)?)
    }

    fn flags(&self) -> SetupFlags {
        let mut flags = SetupFlags::empty();
        flags.set(SetupFlags::SQPOLL, self.sqpoll.is_some());
        flags.set(SetupFlags::CQSIZE, self.cq_entries.is_some());
        flags.set(SetupFlags::CLAMP, self.clamp);
        flags.set(SetupFlags::SUBMIT_ALL, self.submit_all);
        flags
    }
}

/// Ring sizes for a setup request: the submission ring rounded up to a power
/// of two, the completion ring twice that unless sized explicitly.
pub(crate) fn ring_geometry(
    entries: u32,
    cq_entries: Option<u32>,
    clamp: bool,
) -> Result<(u32, u32), EngineError> {
    if entries == 0 {
        return Err(EngineError::InvalidEntries(entries, MAX_SQ_ENTRIES));
    }
    let entries = match entries {
        n if n <= MAX_SQ_ENTRIES => n,
        _ if clamp => MAX_SQ_ENTRIES,
        n => return Err(EngineError::InvalidEntries(n, MAX_SQ_ENTRIES)),
    };
    let sq = entries.next_power_of_two();

    let cq = match cq_entries {
        None => sq * CQ_ENTRIES_MULTIPLIER,
        Some(cq) => {
            let invalid = EngineError::InvalidCqEntries {
                sq,
                cq,
                max: MAX_CQ_ENTRIES,
            };
            let cq = match cq {
                0 => return Err(invalid),
                n if n <= MAX_CQ_ENTRIES => n,
                _ if clamp => MAX_CQ_ENTRIES,
                _ => return Err(invalid),
            };

            let cq = cq.next_power_of_two();
            if cq < sq {
                return Err(invalid);
            }
            cq
        }
    };

    Ok((sq, cq))
}

// Export the builder as an EngineConfig object consumed by the engine
// context and every background thread.
#[derive(Debug, Clone)]
pub(crate) struct EngineConfig {
    pub(crate) sq_entries: u32,
    pub(crate) cq_entries: u32,
    pub(crate) flags: SetupFlags,
    pub(crate) sq_thread_idle: Duration,
    pub(crate) worker_threads: usize,
    pub(crate) max_worker_retries: u32,
    pub(crate) worker_queue_limit: usize,
    pub(crate) max_steal_retries: usize,
    pub(crate) request_pool_size: usize,
    pub(crate) thread_name: ThreadNameFn,
    pub(crate) thread_stack_size: Option<usize>,
    pub(crate) ops: OpTable,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            sq_entries: SQ_ENTRIES,
            cq_entries: SQ_ENTRIES * CQ_ENTRIES_MULTIPLIER,
            flags: SetupFlags::empty(),
            sq_thread_idle: SQ_THREAD_IDLE,
            worker_threads: 1,
            max_worker_retries: MAX_WORKER_RETRIES,
            worker_queue_limit: (SQ_ENTRIES * CQ_ENTRIES_MULTIPLIER) as usize,
            max_steal_retries: MAX_STEAL_RETRIES,
            request_pool_size: (SQ_ENTRIES * CQ_ENTRIES_MULTIPLIER) as usize,
            thread_name: default_thread_name_fn(),
            thread_stack_size: None,
            ops: OpTable::with_builtins(),
        }
    }
}

impl EngineConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if self.flags.contains(SetupFlags::SQPOLL) && self.sq_thread_idle.is_zero() {
            return Err(EngineError::InvalidConfig(
                "sqpoll idle window must be non-zero".into(),
            ));
        }
        // Slab keys are u32, the emergency object takes one more.
        if self.request_pool_size >= u32::MAX as usize {
            return Err(EngineError::InvalidConfig(format!(
                "request pool size {} is too large",
                self.request_pool_size
            )));
        }
        Ok(())
    }
}

impl TryFrom<Builder> for EngineConfig {
    type Error = EngineError;

    fn try_from(builder: Builder) -> Result<Self, Self::Error> {
        let flags = builder.flags();
        let (sq_entries, cq_entries) =
            ring_geometry(builder.sq_entries, builder.cq_entries, builder.clamp)?;

        let worker_threads = builder
            .worker_threads
            .unwrap_or_else(|| thread::available_parallelism().map_or(1, NonZeroUsize::get));
        let request_pool_size = builder.request_pool_size.unwrap_or(cq_entries as usize);

        let cfg = EngineConfig {
            sq_entries,
            cq_entries,
            flags,
            sq_thread_idle: builder.sqpoll.unwrap_or(SQ_THREAD_IDLE),
            worker_threads,
            max_worker_retries: builder.max_worker_retries,
            worker_queue_limit: builder.worker_queue_limit.unwrap_or(request_pool_size),
            max_steal_retries: builder.max_steal_retries,
            request_pool_size,
            thread_name: builder.thread_name,
            thread_stack_size: builder.thread_stack_size,
            ops: builder.ops,
        };

        cfg.validate()?;
        Ok(cfg)
    }
}

/// Handle to one engine instance: the caller side of both rings plus the
/// registration interface.
///
/// Dropping the handle shuts the engine down. Requests still in flight are
/// cancelled, their completions are discarded.
pub struct Uring {
    engine: Arc<Engine>,
    sq: SqProducer,
    cq: CqConsumer,
    params: Params,
}

impl Uring {
    /// An engine with default settings and `entries` submission entries.
    pub fn new(entries: u32) -> anyhow::Result<Self> {
        Builder::new().entries(entries).try_build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Raw setup: creates an engine from `params` and fills in the resulting
    /// ring geometry and features.
    pub fn setup(entries: u32, params: &mut Params) -> Result<Self, EngineError> {
        let mut builder = Builder::new()
            .clamp(params.flags.contains(SetupFlags::CLAMP))
            .submit_all(params.flags.contains(SetupFlags::SUBMIT_ALL));

        // Bypasses the setter assertion, a zero size is reported as an error.
        builder.sq_entries = entries;

        if params.flags.contains(SetupFlags::CQSIZE) {
            builder.cq_entries = Some(params.cq_entries);
        }
        if params.flags.contains(SetupFlags::SQPOLL) {
            builder.sqpoll = Some(match params.sq_thread_idle {
                0 => SQ_THREAD_IDLE,
                ms => Duration::from_millis(ms as u64),
            });
        }

        let uring = Self::from_config(builder.try_into()?)?;
        *params = uring.params;
        Ok(uring)
    }

    fn from_config(cfg: EngineConfig) -> Result<Self, EngineError> {
        let sq_thread_idle = cfg.sq_thread_idle.as_millis().min(u32::MAX as u128) as u32;
        let engine = Engine::try_new(cfg)?;

        let layout = *engine.mem.layout();
        let params = Params {
            sq_entries: layout.sq_entries,
            cq_entries: layout.cq_entries,
            flags: engine.cfg.flags,
            sq_thread_idle,
            features: Features::all(),
            sq_off: layout.sq_offsets(),
            cq_off: layout.cq_offsets(),
            ring_size: layout.ring_size,
            sqes_size: layout.sqes_size,
        };

        Ok(Self {
            sq: SqProducer::new(engine.mem.clone()),
            cq: CqConsumer::new(engine.mem.clone()),
            engine,
            params,
        })
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Base addresses of the ring region and of the submission entry array,
    /// to be combined with the offsets in [`Params`].
    pub fn ring_ptrs(&self) -> (*mut u8, *mut u8) {
        (
            self.engine.mem.ring_ptr().as_ptr(),
            self.engine.mem.sqes_ptr().as_ptr(),
        )
    }

    pub fn submission(&mut self) -> SubmissionQueue<'_> {
        SubmissionQueue::new(&mut self.sq)
    }

    pub fn completion(&mut self) -> CompletionQueue<'_> {
        CompletionQueue::new(&mut self.cq, &self.engine.completions)
    }

    /// Both queues at once, to submit while consuming completions.
    pub fn split(&mut self) -> (SubmissionQueue<'_>, CompletionQueue<'_>) {
        (
            SubmissionQueue::new(&mut self.sq),
            CompletionQueue::new(&mut self.cq, &self.engine.completions),
        )
    }

    /// Consumes up to `to_submit` published entries, then with
    /// `EnterFlags::GETEVENTS` waits until `min_complete` completions are
    /// visible, `timeout` expires or [`Uring::interrupt`] is called.
    ///
    /// Returns the number of entries consumed. A wait that ends early is not
    /// an error once some entries were consumed.
    pub fn enter(
        &self,
        to_submit: u32,
        min_complete: u32,
        flags: EnterFlags,
        timeout: Option<Duration>,
    ) -> Result<u32, EngineError> {
        self.engine.check_alive()?;

        let submitted = match &self.engine.sqpoll {
            Some(sqpoll) => {
                if flags.contains(EnterFlags::SQ_WAKEUP) {
                    sqpoll.wake();
                }
                to_submit
            }
            None if to_submit > 0 => self.engine.submit(to_submit)?,
            None => 0,
        };

        if !flags.contains(EnterFlags::GETEVENTS) || min_complete == 0 {
            self.engine.completions.flush_overflow();
            return Ok(submitted);
        }

        match self.engine.completions.wait(min_complete, timeout) {
            Ok(()) => Ok(submitted),
            Err(e) if submitted > 0 && e.is_retryable() => {
                tracing::trace!(error = %e, submitted, "wait ended early");
                Ok(submitted)
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes the pushed entries and submits them.
    pub fn submit(&mut self) -> Result<u32, EngineError> {
        self.submit_with(0, None)
    }

    /// [`Uring::submit`], then waits for `want` completions.
    pub fn submit_and_wait(&mut self, want: u32) -> Result<u32, EngineError> {
        self.submit_with(want, None)
    }

    pub fn submit_and_wait_timeout(
        &mut self,
        want: u32,
        timeout: Duration,
    ) -> Result<u32, EngineError> {
        self.submit_with(want, Some(timeout))
    }

    fn submit_with(&mut self, want: u32, timeout: Option<Duration>) -> Result<u32, EngineError> {
        self.sq.sync();

        let mut flags = EnterFlags::empty();
        if want > 0 {
            flags |= EnterFlags::GETEVENTS;
        }
        if self.engine.sqpoll.is_some() && self.sq.needs_wakeup() {
            flags |= EnterFlags::SQ_WAKEUP;
        }

        self.enter(self.sq.published(), want, flags, timeout)
    }

    /// Wakes every thread blocked in [`Uring::enter`] with
    /// [`EngineError::Interrupted`].
    pub fn interrupt(&self) {
        self.engine.completions.interrupt();
    }

    pub fn stats(&self) -> Stats {
        self.engine.stats()
    }

    /// Adds `file` to the engine's descriptor table. The returned descriptor
    /// is what plain (non fixed) entries put in `fd`.
    pub fn install_file(&self, file: Arc<dyn File>) -> Result<i32, EngineError> {
        self.engine.files.install(file)
    }

    /// Requests already holding the file keep it until they complete.
    pub fn close_file(&self, fd: i32) -> Result<(), EngineError> {
        self.engine.files.close(fd)
    }

    /// Attaches the fixed file table. `None` entries are sparse slots.
    pub fn register_files(&self, files: Vec<Option<Arc<dyn File>>>) -> Result<(), EngineError> {
        self.engine.fixed_files.register(files)
    }

    pub fn unregister_files(&self) -> Result<(), EngineError> {
        self.engine.fixed_files.unregister()
    }

    /// Replaces `files.len()` slots starting at `offset` with a new table
    /// generation. In-flight requests keep the generation they resolved.
    pub fn update_files(
        &self,
        offset: u32,
        files: Vec<Option<Arc<dyn File>>>,
    ) -> Result<usize, EngineError> {
        self.engine.fixed_files.update(offset, files)
    }

    /// Attaches the fixed buffer table. The engine owns the buffers.
    pub fn register_buffers(&self, buffers: Vec<Vec<u8>>) -> Result<(), EngineError> {
        self.engine.fixed_buffers.register(
            buffers
                .into_iter()
                .map(|b| Some(Arc::new(RegisteredBuffer::new(b))))
                .collect(),
        )
    }

    pub fn unregister_buffers(&self) -> Result<(), EngineError> {
        self.engine.fixed_buffers.unregister()
    }

    /// Runs `f` on registered buffer `index`.
    pub fn with_fixed_buffer<R>(
        &self,
        index: u16,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, EngineError> {
        let (_table, buf) = self
            .engine
            .fixed_buffers
            .lookup(index as usize)
            .ok_or(EngineError::NotRegistered("buffer"))?;
        Ok(buf.with(f))
    }

    /// Takes the data a completed `BUFFER_SELECT` request left in buffer
    /// `bid` of group `bgid`, see [`Cqe::buffer_id`](crate::Cqe::buffer_id).
    pub fn take_provided_buffer(&self, bgid: u16, bid: u16) -> Option<Vec<u8>> {
        self.engine.buffers.take(Bgid::new(bgid), Bid::new(bid))
    }

    /// Unused buffers left in group `bgid`.
    pub fn provided_buffers(&self, bgid: u16) -> usize {
        self.engine.buffers.available(Bgid::new(bgid))
    }

    /// Shuts the engine down. Same as dropping the handle.
    pub fn shutdown(self) {}

    #[cfg(test)]
    pub(crate) fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }
}

impl fmt::Debug for Uring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Uring")
            .field("params", &self.params)
            .field("stats", &self.engine.stats())
            .finish()
    }
}

impl Drop for Uring {
    fn drop(&mut self) {
        self.engine.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use either::Either;
    use rstest::rstest;
    use static_assertions::assert_impl_all;

    assert_impl_all!(Uring: Send);
    assert_impl_all!(Builder: Send);

    #[rstest]
    #[case::rounded(3, None, false, Either::Left((4, 8)))]
    #[case::exact(128, None, false, Either::Left((128, 256)))]
    #[case::cq_size(8, Some(100), false, Either::Left((8, 128)))]
    #[case::cq_equal(16, Some(16), false, Either::Left((16, 16)))]
    #[case::zero(0, None, false, Either::Right(libc::EINVAL))]
    #[case::too_many(MAX_SQ_ENTRIES + 1, None, false, Either::Right(libc::EINVAL))]
    #[case::clamped(
        MAX_SQ_ENTRIES + 1,
        None,
        true,
        Either::Left((MAX_SQ_ENTRIES, 2 * MAX_SQ_ENTRIES))
    )]
    #[case::cq_smaller(16, Some(8), false, Either::Right(libc::EINVAL))]
    #[case::cq_too_many(16, Some(MAX_CQ_ENTRIES + 1), false, Either::Right(libc::EINVAL))]
    #[case::cq_clamped(16, Some(MAX_CQ_ENTRIES + 1), true, Either::Left((16, MAX_CQ_ENTRIES)))]
    fn test_ring_geometry(
        #[case] entries: u32,
        #[case] cq: Option<u32>,
        #[case] clamp: bool,
        #[case] expected: Either<(u32, u32), i32>,
    ) {
        let res = ring_geometry(entries, cq, clamp);
        match expected {
            Either::Left(sizes) => assert_eq!(res.ok(), Some(sizes)),
            Either::Right(errno) => assert_eq!(res.map_err(|e| e.errno()).err(), Some(errno)),
        }
    }

    #[test]
    fn test_builder_defaults() -> anyhow::Result<()> {
        let cfg = EngineConfig::try_from(Builder::new().entries(16).worker_threads(2))?;
        assert_eq!(cfg.sq_entries, 16);
        assert_eq!(cfg.cq_entries, 32);
        assert_eq!(cfg.request_pool_size, 32);
        assert_eq!(cfg.worker_queue_limit, 32);
        assert_eq!(cfg.flags, SetupFlags::empty());
        Ok(())
    }

    #[test]
    fn test_builder_flags() -> anyhow::Result<()> {
        let cfg = EngineConfig::try_from(
            Builder::new()
                .entries(32)
                .cq_entries(64)
                .clamp(true)
                .submit_all(true)
                .sqpoll(Duration::from_millis(5)),
        )?;
        assert_eq!((cfg.sq_entries, cfg.cq_entries), (32, 64));
        assert_eq!(cfg.flags, SetupFlags::all());
        assert_eq!(cfg.sq_thread_idle, Duration::from_millis(5));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "reserved for a built-in operation")]
    fn test_builtin_opcode_is_reserved() {
        let _ = Builder::new().opcode(Opcode::READ, crate::opcode::builtin::Nop);
    }

    #[test]
    fn test_thread_name_fn_counts() {
        let name = default_thread_name_fn();
        assert_eq!((name.0)(), "ringworks-0");
        assert_eq!((name.0)(), "ringworks-1");
    }
}
