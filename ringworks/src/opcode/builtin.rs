//! Operation kinds served by the engine itself rather than by a file.

use crate::context::buffer_pool::Bgid;
use crate::file::PollMask;
use crate::opcode::{Issue, IssueCx, OpCaps, OpHandler};
use crate::runtime::poll::PollKind;
use crate::sqe::{CancelFlags, NopFlags, Opcode, Sqe, TimeoutFlags};

/// Completes right away, with `0` or an injected result.
#[derive(Debug, Clone, Copy, Default)]
pub struct Nop;

impl OpHandler for Nop {
    fn name(&self) -> &'static str {
        "nop"
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        NopFlags::from_bits(sqe.op_flags)
            .map(drop)
            .ok_or(libc::EINVAL)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let flags = NopFlags::from_bits_truncate(cx.sqe.op_flags);
        if flags.contains(NopFlags::INJECT_RESULT) {
            Issue::Complete(cx.sqe.len as i32)
        } else {
            Issue::Complete(0)
        }
    }
}

/// One-shot readiness wait. Completes with the ready mask.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PollAdd;

impl OpHandler for PollAdd {
    fn name(&self) -> &'static str {
        "poll_add"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::NEEDS_FILE
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        match PollMask::from_bits(sqe.op_flags) {
            Some(mask) if !mask.is_empty() => Ok(()),
            _ => Err(libc::EINVAL),
        }
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let Some(file) = cx.file else {
            return Issue::Complete(-libc::EBADF);
        };
        let interest = PollMask::from_bits_truncate(cx.sqe.op_flags);
        let reported = interest | PollMask::ALWAYS;

        match file.poll() {
            // No readiness notion, always ready.
            None => {
                return Issue::Complete((interest & (PollMask::IN | PollMask::OUT)).bits() as i32);
            }
            Some(mask) if mask.intersects(reported) => {
                return Issue::Complete((mask & reported).bits() as i32);
            }
            Some(_) => {}
        }

        match cx.engine.arm_poll(cx.req.clone(), file, interest, PollKind::Complete) {
            Ok(()) => Issue::Parked,
            Err(_) if cx.is_cancelled() => Issue::Complete(-libc::ECANCELED),
            Err(_) => Issue::Complete(-libc::EOPNOTSUPP),
        }
    }
}

/// Cancels a `POLL_ADD` by tag.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PollRemove;

impl OpHandler for PollRemove {
    fn name(&self) -> &'static str {
        "poll_remove"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::INLINE_ONLY
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        Issue::Complete(cx.engine.cancel_matching(
            cx.sqe.addr,
            CancelFlags::empty(),
            Some(Opcode::POLL_ADD),
            cx.req,
        ))
    }
}

fn prep_timeout(sqe: &Sqe) -> Result<(), i32> {
    TimeoutFlags::from_bits(sqe.op_flags)
        .map(drop)
        .ok_or(libc::EINVAL)
}

/// Completes with `-ETIME` on expiry, or with `0` once `off` other
/// completions were posted.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct Timeout;

impl OpHandler for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        prep_timeout(sqe)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        cx.engine.timers.arm_timeout(cx.engine, cx.req, cx.sqe)
    }
}

/// Cancels a `TIMEOUT` by tag.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct TimeoutRemove;

impl OpHandler for TimeoutRemove {
    fn name(&self) -> &'static str {
        "timeout_remove"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::INLINE_ONLY
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        Issue::Complete(cx.engine.cancel_matching(
            cx.sqe.addr,
            CancelFlags::empty(),
            Some(Opcode::TIMEOUT),
            cx.req,
        ))
    }
}

/// Races the previous chain member. Armed by the member's own issue, never
/// issued itself.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct LinkTimeout;

impl OpHandler for LinkTimeout {
    fn name(&self) -> &'static str {
        "link_timeout"
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        prep_timeout(sqe)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        tracing::warn!(user_data = cx.sqe.user_data, "linked timeout issued on its own");
        Issue::Complete(-libc::EINVAL)
    }
}

/// Cancels requests by tag, see [`CancelFlags`].
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct AsyncCancel;

impl OpHandler for AsyncCancel {
    fn name(&self) -> &'static str {
        "async_cancel"
    }

    fn caps(&self) -> OpCaps {
        OpCaps::INLINE_ONLY
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        CancelFlags::from_bits(sqe.op_flags)
            .map(drop)
            .ok_or(libc::EINVAL)
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let flags = CancelFlags::from_bits_truncate(cx.sqe.op_flags);
        Issue::Complete(cx.engine.cancel_matching(cx.sqe.addr, flags, None, cx.req))
    }
}

/// Adds `fd` buffers of `len` bytes to group `buf_index`, ids from `off`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ProvideBuffers;

impl OpHandler for ProvideBuffers {
    fn name(&self) -> &'static str {
        "provide_buffers"
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        if sqe.off > u16::MAX as u64 || sqe.fd <= 0 {
            return Err(libc::EINVAL);
        }
        Ok(())
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        let sqe = cx.sqe;
        Issue::Complete(cx.engine.buffers.provide(
            Bgid::new(sqe.buf_index),
            sqe.off as u16,
            sqe.fd,
            sqe.len,
        ))
    }
}

/// Removes up to `fd` unused buffers from group `buf_index`.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RemoveBuffers;

impl OpHandler for RemoveBuffers {
    fn name(&self) -> &'static str {
        "remove_buffers"
    }

    fn prep(&self, sqe: &Sqe) -> Result<(), i32> {
        if sqe.fd <= 0 {
            return Err(libc::EINVAL);
        }
        Ok(())
    }

    fn issue(&self, cx: &mut IssueCx<'_>) -> Issue {
        Issue::Complete(
            cx.engine
                .buffers
                .remove(Bgid::new(cx.sqe.buf_index), cx.sqe.fd),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::nop_flags(Sqe::nop_with_result(3), true)]
    #[case::nop_bad_flags(Sqe { op_flags: 0x80, ..Sqe::nop() }, false)]
    fn test_nop_prep(#[case] sqe: Sqe, #[case] ok: bool) {
        assert_eq!(Nop.prep(&sqe).is_ok(), ok);
    }

    #[rstest]
    #[case::readable(PollMask::IN.bits(), true)]
    #[case::empty(0, false)]
    #[case::unknown_bit(1 << 20, false)]
    fn test_poll_add_prep(#[case] mask: u32, #[case] ok: bool) {
        assert_eq!(PollAdd.prep(&Sqe::poll_add(0, mask)).is_ok(), ok);
    }

    #[test]
    fn test_buffer_ops_prep() {
        assert!(ProvideBuffers.prep(&Sqe::provide_buffers(1, 0, 4, 64)).is_ok());
        assert_eq!(
            ProvideBuffers.prep(&Sqe::provide_buffers(1, 0, 0, 64)),
            Err(libc::EINVAL)
        );
        assert_eq!(RemoveBuffers.prep(&Sqe::remove_buffers(1, -1)), Err(libc::EINVAL));
    }

    #[test]
    fn test_cancel_ops_are_inline_only() {
        for caps in [AsyncCancel.caps(), PollRemove.caps(), TimeoutRemove.caps()] {
            assert!(caps.contains(OpCaps::INLINE_ONLY));
        }
    }
}
