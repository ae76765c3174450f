use crate::context::buffer_pool::BufferRef;
use crate::opcode::{Issue, IssueCx, OpCaps, OpHandler};
use crate::sqe::errors::io_result;
use crate::sqe::{Sqe, SqeFlags};
use std::io;
use std::slice;

/// `u64::MAX` reads or writes at the current file position.
fn offset(off: u64) -> Option<u64> {
    (off != u64::MAX).then_some(off)
}

fn to_issue(res: io::Result<usize>) -> Issue {
    match res {
        Ok(n) => Issue::Complete(i32::try_from(n).unwrap_or(i32::MAX)),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Issue::WouldBlock,
        Err(e) => Issue::Complete(io_result(&e)),
    }
}

fn prep_user_buffer(sqe: &Sqe) -> Result<(), i32> {
    if sqe.addr == 0 && sqe.len > 0 {
        return Err(libc::EFAULT);
    }
    Ok(())
}

/// Range `[addr, addr + len)` inside a registered buffer of `size` bytes.
fn fixed_range(sqe: &Sqe, size: usize) -> Option<(usize, usize)> {
    let start = usize::try_from(sqe.addr).ok()?;
    let end = start.checked_add(sqe.len as usize)?;
    (end <= size).then_some((start, end))
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Read;

impl OpHandler for Read {
    fn name(&self) -> &'static str {
        "read"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE | OpCaps::POLL_IN | OpCaps::BUFFER_SELECT
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        if sqe.sqe_flags().contains(SqeFlags::BUFFER_SELECT) {
            return Ok(());
        }
        prep_user_buffer(sqe)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let Some(file) = cx.file else {
            return Issue::Complete(-libc::EBADF);
        };
        let (sqe, nonblock) = (*cx.sqe, cx.nonblock);

        let res = match cx.buffer.as_deref_mut() {
            Some(BufferRef::Selected { buf, .. }) => {
                let data = buf.as_mut_slice();
                let len = match sqe.len as usize {
                    0 => data.len(),
                    len => len.min(data.len()),
                };
                file.read(&mut data[..len], offset(sqe.off), nonblock)
            }
            _ if sqe.len == 0 => file.read(&mut [], offset(sqe.off), nonblock),
            _ => {
                // SAFETY: the caller vouched for `addr`/`len` when pushing the
                // entry, until its completion is observed.
                let buf =
                    unsafe { slice::from_raw_parts_mut(sqe.addr as *mut u8, sqe.len as usize) };
                file.read(buf, offset(sqe.off), nonblock)
            }
        };

        to_issue(res)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Write;

impl OpHandler for Write {
    fn name(&self) -> &'static str {
        "write"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE | OpCaps::POLL_OUT
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        prep_user_buffer(sqe)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let Some(file) = cx.file else {
            return Issue::Complete(-libc::EBADF);
        };
        let sqe = cx.sqe;
        if sqe.len == 0 {
            return to_issue(file.write(&[], offset(sqe.off), cx.nonblock));
        }

        // SAFETY: see `Read::issue`.
        let buf = unsafe { slice::from_raw_parts(sqe.addr as *const u8, sqe.len as usize) };
        to_issue(file.write(buf, offset(sqe.off), cx.nonblock))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReadFixed;

impl OpHandler for ReadFixed {
    fn name(&self) -> &'static str {
        "read_fixed"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE | OpCaps::POLL_IN | OpCaps::FIXED_BUFFER
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let (Some(file), Some(BufferRef::Fixed { buf, .. })) = (cx.file, cx.buffer.as_deref())
        else {
            return Issue::Complete(-libc::EFAULT);
        };
        let (sqe, nonblock) = (cx.sqe, cx.nonblock);

        buf.with(|data| match fixed_range(sqe, data.len()) {
            Some((start, end)) => {
                to_issue(file.read(&mut data[start..end], offset(sqe.off), nonblock))
            }
            None => Issue::Complete(-libc::EFAULT),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WriteFixed;

impl OpHandler for WriteFixed {
    fn name(&self) -> &'static str {
        "write_fixed"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE | OpCaps::POLL_OUT | OpCaps::FIXED_BUFFER
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let (Some(file), Some(BufferRef::Fixed { buf, .. })) = (cx.file, cx.buffer.as_deref())
        else {
            return Issue::Complete(-libc::EFAULT);
        };
        let (sqe, nonblock) = (cx.sqe, cx.nonblock);

        buf.with(|data| match fixed_range(sqe, data.len()) {
            Some((start, end)) => {
                to_issue(file.write(&data[start..end], offset(sqe.off), nonblock))
            }
            None => Issue::Complete(-libc::EFAULT),
        })
    }
}

/// Always runs on an offload worker.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Fsync;

impl OpHandler for Fsync {
    fn name(&self) -> &'static str {
        "fsync"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let Some(file) = cx.file else {
            return Issue::Complete(-libc::EBADF);
        };
        if cx.nonblock {
            return Issue::WouldBlock;
        }

        match file.sync() {
            Ok(()) => Issue::Complete(0),
            Err(e) => Issue::Complete(io_result(&e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::start(0, 4, 8, Some((0, 4)))]
    #[case::end(4, 4, 8, Some((4, 8)))]
    #[case::past_end(6, 4, 8, None)]
    #[case::huge_offset(u64::MAX, 1, 8, None)]
    fn test_fixed_range(
        #[case] addr: u64,
        #[case] len: u32,
        #[case] size: usize,
        #[case] expected: Option<(usize, usize)>,
    ) {
        let sqe = Sqe::read_fixed(0, 0, addr, len, 0);
        assert_eq!(fixed_range(&sqe, size), expected);
    }

    #[rstest]
    #[case::ok(io::Result::Ok(5), Issue::Complete(5))]
    #[case::would_block(Err(io::ErrorKind::WouldBlock.into()), Issue::WouldBlock)]
    #[case::eagain(Err(io::Error::from_raw_os_error(libc::EAGAIN)), Issue::WouldBlock)]
    #[case::failed(Err(io::Error::from_raw_os_error(libc::EIO)), Issue::Complete(-libc::EIO))]
    fn test_to_issue(#[case] res: io::Result<usize>, #[case] expected: Issue) {
        assert_eq!(to_issue(res), expected);
    }

    #[test]
    fn test_null_user_buffer_rejected() {
        let sqe = Sqe::read(0, std::ptr::null_mut(), 16, 0);
        assert_eq!(Read.prep(&sqe), Err(libc::EFAULT));
        assert!(Read.prep(&Sqe::read_select(0, 1, 16, 0)).is_ok());
    }
}
