use crate::file::{File, PollMask, WaitQueue};
use crate::opcode::{Issue, IssueCx, OpHandler};
use crate::sqe::{Opcode, Sqe};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// In-memory pipe with split read and write readiness. Never sleeps: an
/// empty read or a full write reports `WouldBlock`, even on a worker.
pub(crate) struct Pipe {
    buf: Mutex<VecDeque<u8>>,
    capacity: usize,
    closed: AtomicBool,
    readers: Arc<WaitQueue>,
    writers: Arc<WaitQueue>,
}

impl Pipe {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            closed: AtomicBool::new(false),
            readers: WaitQueue::new(),
            writers: WaitQueue::new(),
        })
    }

    /// Writes from outside the engine, waking readers on this thread.
    pub(crate) fn feed(&self, data: &[u8]) -> usize {
        let n = {
            let mut buf = self.buf.lock();
            let n = data.len().min(self.capacity - buf.len());
            buf.extend(&data[..n]);
            n
        };
        if n > 0 {
            self.readers.wake(PollMask::IN);
        }
        n
    }

    /// Same as [`Pipe::feed`], ready readers go to the offload workers.
    pub(crate) fn feed_deferred(&self, data: &[u8]) {
        self.buf.lock().extend(data);
        self.readers.wake_deferred(PollMask::IN);
    }

    pub(crate) fn drain(&self) -> Vec<u8> {
        let data = self.buf.lock().drain(..).collect();
        self.writers.wake(PollMask::OUT);
        data
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readers.wake(PollMask::HUP);
        self.writers.wake(PollMask::HUP);
    }

    pub(crate) fn waiters(&self) -> usize {
        self.readers.len() + self.writers.len()
    }
}

impl File for Pipe {
    fn read(&self, out: &mut [u8], _offset: Option<u64>, _nonblock: bool) -> io::Result<usize> {
        let n = {
            let mut buf = self.buf.lock();
            if buf.is_empty() {
                if self.closed.load(Ordering::Acquire) {
                    return Ok(0);
                }
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let n = out.len().min(buf.len());
            out.iter_mut()
                .zip(buf.drain(..n))
                .for_each(|(dst, src)| *dst = src);
            n
        };
        self.writers.wake_deferred(PollMask::OUT);
        Ok(n)
    }

    fn write(&self, data: &[u8], _offset: Option<u64>, _nonblock: bool) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        let n = {
            let mut buf = self.buf.lock();
            let n = data.len().min(self.capacity - buf.len());
            if n == 0 && !data.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            buf.extend(&data[..n]);
            n
        };
        self.readers.wake_deferred(PollMask::IN);
        Ok(n)
    }

    fn poll(&self) -> Option<PollMask> {
        let buf = self.buf.lock();
        let mut mask = PollMask::empty();
        mask.set(PollMask::IN, !buf.is_empty());
        mask.set(PollMask::OUT, buf.len() < self.capacity);
        mask.set(PollMask::HUP, self.closed.load(Ordering::Acquire));
        Some(mask)
    }

    fn wait_queue(&self, interest: PollMask) -> Option<Arc<WaitQueue>> {
        if interest.contains(PollMask::IN) {
            Some(self.readers.clone())
        } else {
            Some(self.writers.clone())
        }
    }
}

/// What [`SlowOp`] saw, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Start(u64),
    End(u64),
}

pub(crate) type EventLog = Arc<Mutex<Vec<Event>>>;

/// Opcode of [`SlowOp`].
pub(crate) const SLOW_OP: Opcode = Opcode(200);

/// Custom operation kind that sleeps `addr` milliseconds on an offload
/// worker, then completes with `len` as a signed result. Stops early with
/// `-ECANCELED` once cancelled.
#[derive(Debug, Default, Clone)]
pub(crate) struct SlowOp {
    pub(crate) log: EventLog,
}

impl SlowOp {
    pub(crate) fn sqe(millis: u64, res: i32) -> Sqe {
        Sqe {
            addr: millis,
            len: res as u32,
            ..Sqe::new(SLOW_OP)
        }
    }

    pub(crate) fn events(&self) -> Vec<Event> {
        self.log.lock().clone()
    }
}

impl OpHandler for SlowOp {
    fn name(&self) -> &'static str {
        "slow_op"
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        if cx.nonblock() {
            return Issue::WouldBlock;
        }

        let sqe = *cx.sqe();
        self.log.lock().push(Event::Start(sqe.user_data));

        let deadline = Instant::now() + Duration::from_millis(sqe.addr);
        let mut res = sqe.len as i32;
        while Instant::now() < deadline {
            if cx.is_cancelled() {
                res = -libc::ECANCELED;
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }

        self.log.lock().push(Event::End(sqe.user_data));
        Issue::Complete(res)
    }
}
