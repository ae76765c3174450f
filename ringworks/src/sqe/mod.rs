use bitflags::bitflags;
use static_assertions::const_assert_eq;
use std::mem;

pub(crate) mod errors;
pub(crate) mod list;
pub(crate) mod request;

/// Operation kind carried in [`Sqe::opcode`].
///
/// Values up to [`Opcode::LAST_BUILTIN`] are handled by the engine itself. Any
/// other value can be bound to a custom [`OpHandler`](crate::OpHandler) through
/// [`Builder::opcode`](crate::Builder::opcode).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Opcode(pub u8);

impl Opcode {
    pub const NOP: Opcode = Opcode(0);
    pub const READ: Opcode = Opcode(1);
    pub const WRITE: Opcode = Opcode(2);
    pub const READ_FIXED: Opcode = Opcode(3);
    pub const WRITE_FIXED: Opcode = Opcode(4);
    pub const FSYNC: Opcode = Opcode(5);
    pub const POLL_ADD: Opcode = Opcode(6);
    pub const POLL_REMOVE: Opcode = Opcode(7);
    pub const TIMEOUT: Opcode = Opcode(8);
    pub const TIMEOUT_REMOVE: Opcode = Opcode(9);
    pub const LINK_TIMEOUT: Opcode = Opcode(10);
    pub const ASYNC_CANCEL: Opcode = Opcode(11);
    pub const PROVIDE_BUFFERS: Opcode = Opcode(12);
    pub const REMOVE_BUFFERS: Opcode = Opcode(13);

    pub const LAST_BUILTIN: Opcode = Opcode::REMOVE_BUFFERS;

    pub const fn is_builtin(self) -> bool {
        self.0 <= Self::LAST_BUILTIN.0
    }
}

bitflags! {
    /// Per-entry flags, `Sqe::flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SqeFlags: u8 {
        /// `fd` is an index into the registered file table.
        const FIXED_FILE = 1;

        /// Do not start before every previously submitted entry has completed.
        const IO_DRAIN = 1 << 1;

        /// The next entry is chained to this one and only starts once this one
        /// completes successfully.
        const IO_LINK = 1 << 2;

        /// Like `IO_LINK`, but the chain survives a failed result.
        const IO_HARDLINK = 1 << 3;

        /// Skip the inline attempt and go straight to the offload workers.
        const ASYNC = 1 << 4;

        /// Pick a buffer from the group named by `buf_index` at issue time.
        const BUFFER_SELECT = 1 << 5;

        /// Do not post a completion if the request succeeds.
        const CQE_SKIP_SUCCESS = 1 << 6;
    }
}

impl SqeFlags {
    pub const fn is_linked(self) -> bool {
        self.intersects(SqeFlags::IO_LINK.union(SqeFlags::IO_HARDLINK))
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CqeFlags: u32 {
        /// The upper 16 bits of `flags` hold the id of the selected buffer.
        const BUFFER = 1;
    }
}

/// Shift applied to a provided buffer id inside `Cqe::flags`.
pub const CQE_BUFFER_SHIFT: u32 = 16;

bitflags! {
    /// `op_flags` for `TIMEOUT` and `LINK_TIMEOUT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TimeoutFlags: u32 {
        /// `addr` is an absolute deadline in nanoseconds since the engine started.
        const ABS = 1;
    }
}

bitflags! {
    /// `op_flags` for `ASYNC_CANCEL`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CancelFlags: u32 {
        /// Cancel every match instead of the first one; the result is the count.
        const ALL = 1;

        /// Match the in-flight member of the chain whose head carries the tag.
        const CHAIN = 1 << 1;
    }
}

bitflags! {
    /// `op_flags` for `NOP`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct NopFlags: u32 {
        /// Complete with `len` reinterpreted as a signed result.
        const INJECT_RESULT = 1;
    }
}

/// A submission queue entry.
///
/// Field usage per opcode:
///
/// | opcode            | fd           | off               | addr              | len         | op_flags       | buf_index  |
/// |-------------------|--------------|-------------------|-------------------|-------------|----------------|------------|
/// | `READ`/`WRITE`    | file         | offset, `u64::MAX` for current position | user pointer | length | -        | group with `BUFFER_SELECT` |
/// | `READ_FIXED`...   | file         | offset            | offset in buffer  | length      | -              | buffer index |
/// | `POLL_ADD`        | file         | -                 | -                 | -           | `PollMask`     | -          |
/// | `TIMEOUT`         | -            | completion count  | nanoseconds       | -           | `TimeoutFlags` | -          |
/// | `LINK_TIMEOUT`    | -            | -                 | nanoseconds       | -           | `TimeoutFlags` | -          |
/// | `*_REMOVE`/`ASYNC_CANCEL` | -    | -                 | target tag        | -           | `CancelFlags`  | -          |
/// | `PROVIDE_BUFFERS` | count        | first buffer id   | -                 | buffer size | -              | group      |
/// | `REMOVE_BUFFERS`  | count        | -                 | -                 | -           | -              | group      |
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sqe {
    pub opcode: u8,
    pub flags: u8,
    pub ioprio: u16,
    pub fd: i32,
    pub off: u64,
    pub addr: u64,
    pub len: u32,
    pub op_flags: u32,
    pub user_data: u64,
    pub buf_index: u16,
    pub _resv1: u16,
    pub _resv2: u32,
    pub addr3: u64,
    pub _pad: u64,
}

const_assert_eq!(mem::size_of::<Sqe>(), 64);

impl Sqe {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode.0,
            ..Default::default()
        }
    }

    pub fn nop() -> Self {
        Self::new(Opcode::NOP)
    }

    /// A `NOP` that completes with `res`.
    pub fn nop_with_result(res: i32) -> Self {
        Self {
            len: res as u32,
            op_flags: NopFlags::INJECT_RESULT.bits(),
            ..Self::nop()
        }
    }

    pub fn read(fd: i32, buf: *mut u8, len: u32, offset: u64) -> Self {
        Self {
            fd,
            addr: buf as u64,
            len,
            off: offset,
            ..Self::new(Opcode::READ)
        }
    }

    pub fn write(fd: i32, buf: *const u8, len: u32, offset: u64) -> Self {
        Self {
            fd,
            addr: buf as u64,
            len,
            off: offset,
            ..Self::new(Opcode::WRITE)
        }
    }

    /// Reads `len` bytes into registered buffer `buf_index`, starting at
    /// `buf_offset` inside that buffer.
    pub fn read_fixed(fd: i32, buf_index: u16, buf_offset: u64, len: u32, offset: u64) -> Self {
        Self {
            fd,
            addr: buf_offset,
            len,
            off: offset,
            buf_index,
            ..Self::new(Opcode::READ_FIXED)
        }
    }

    pub fn write_fixed(fd: i32, buf_index: u16, buf_offset: u64, len: u32, offset: u64) -> Self {
        Self {
            fd,
            addr: buf_offset,
            len,
            off: offset,
            buf_index,
            ..Self::new(Opcode::WRITE_FIXED)
        }
    }

    /// A read that picks its destination from buffer group `bgid`.
    pub fn read_select(fd: i32, bgid: u16, len: u32, offset: u64) -> Self {
        Self {
            fd,
            len,
            off: offset,
            buf_index: bgid,
            flags: SqeFlags::BUFFER_SELECT.bits(),
            ..Self::new(Opcode::READ)
        }
    }

    pub fn fsync(fd: i32) -> Self {
        Self {
            fd,
            ..Self::new(Opcode::FSYNC)
        }
    }

    pub fn poll_add(fd: i32, mask: u32) -> Self {
        Self {
            fd,
            op_flags: mask,
            ..Self::new(Opcode::POLL_ADD)
        }
    }

    pub fn poll_remove(target: u64) -> Self {
        Self {
            addr: target,
            ..Self::new(Opcode::POLL_REMOVE)
        }
    }

    pub fn timeout(nanos: u64, count: u64, flags: TimeoutFlags) -> Self {
        Self {
            addr: nanos,
            off: count,
            op_flags: flags.bits(),
            ..Self::new(Opcode::TIMEOUT)
        }
    }

    pub fn timeout_remove(target: u64) -> Self {
        Self {
            addr: target,
            ..Self::new(Opcode::TIMEOUT_REMOVE)
        }
    }

    pub fn link_timeout(nanos: u64, flags: TimeoutFlags) -> Self {
        Self {
            addr: nanos,
            op_flags: flags.bits(),
            ..Self::new(Opcode::LINK_TIMEOUT)
        }
    }

    pub fn cancel(target: u64, flags: CancelFlags) -> Self {
        Self {
            addr: target,
            op_flags: flags.bits(),
            ..Self::new(Opcode::ASYNC_CANCEL)
        }
    }

    pub fn provide_buffers(bgid: u16, first_bid: u16, count: i32, size: u32) -> Self {
        Self {
            fd: count,
            off: first_bid as u64,
            len: size,
            buf_index: bgid,
            ..Self::new(Opcode::PROVIDE_BUFFERS)
        }
    }

    pub fn remove_buffers(bgid: u16, count: i32) -> Self {
        Self {
            fd: count,
            buf_index: bgid,
            ..Self::new(Opcode::REMOVE_BUFFERS)
        }
    }

    #[must_use]
    pub fn user_data(mut self, user_data: u64) -> Self {
        self.user_data = user_data;
        self
    }

    #[must_use]
    pub fn flags(mut self, flags: SqeFlags) -> Self {
        self.flags |= flags.bits();
        self
    }

    pub fn sqe_flags(&self) -> SqeFlags {
        SqeFlags::from_bits_retain(self.flags)
    }

    /// Buffer group for `BUFFER_SELECT` entries, shares storage with `buf_index`.
    pub fn buf_group(&self) -> u16 {
        self.buf_index
    }
}

/// A completion queue entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cqe {
    pub user_data: u64,
    pub res: i32,
    pub flags: u32,
}

const_assert_eq!(mem::size_of::<Cqe>(), 16);

impl Cqe {
    pub fn new(user_data: u64, res: i32, flags: CqeFlags) -> Self {
        Self {
            user_data,
            res,
            flags: flags.bits(),
        }
    }

    pub fn cqe_flags(&self) -> CqeFlags {
        CqeFlags::from_bits_retain(self.flags)
    }

    /// Id of the provided buffer consumed by this completion, if any.
    pub fn buffer_id(&self) -> Option<u16> {
        self.cqe_flags()
            .contains(CqeFlags::BUFFER)
            .then_some((self.flags >> CQE_BUFFER_SHIFT) as u16)
    }

    pub fn is_err(&self) -> bool {
        self.res < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nothing(SqeFlags::empty(), false)]
    #[case::link(SqeFlags::IO_LINK, true)]
    #[case::hardlink(SqeFlags::IO_HARDLINK, true)]
    #[case::drain(SqeFlags::IO_DRAIN, false)]
    fn test_is_linked(#[case] flags: SqeFlags, #[case] expected: bool) {
        assert_eq!(flags.is_linked(), expected);
    }

    #[test]
    fn test_builders_set_fields() {
        let sqe = Sqe::read_select(3, 7, 128, u64::MAX).user_data(42);
        assert_eq!(sqe.opcode, Opcode::READ.0);
        assert_eq!(sqe.buf_group(), 7);
        assert_eq!(sqe.user_data, 42);
        assert!(sqe.sqe_flags().contains(SqeFlags::BUFFER_SELECT));

        let sqe = Sqe::nop_with_result(-libc::EINVAL);
        assert_eq!(sqe.len as i32, -libc::EINVAL);
    }

    #[test]
    fn test_cqe_buffer_id() {
        let flags = CqeFlags::BUFFER | CqeFlags::from_bits_retain(9 << CQE_BUFFER_SHIFT);
        let cqe = Cqe::new(1, 10, flags);
        assert_eq!(cqe.buffer_id(), Some(9));
        assert_eq!(Cqe::new(1, 10, CqeFlags::empty()).buffer_id(), None);
    }
}
