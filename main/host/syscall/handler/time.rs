use std::time::Duration;

use nix::errno::Errno;
use nix::time::{clock_getres, clock_gettime, ClockId};

use crate::host::context::ThreadContext;
use crate::host::syscall::handler::SyscallHandler;
use crate::host::syscall::types::{SyscallArgs, SyscallError, SyscallResult, UserPtr};

/// timespec of the cage ABI.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub(crate) struct AbiTimespec {
    pub sec: i64,
    pub nsec: i64,
}

impl TryFrom<AbiTimespec> for Duration {
    type Error = SyscallError;

    fn try_from(ts: AbiTimespec) -> Result<Duration, SyscallError> {
        if ts.sec < 0 || ts.nsec < 0 || ts.nsec >= 1_000_000_000 {
            return Err(Errno::EINVAL.into());
        }
        Ok(Duration::new(ts.sec as u64, ts.nsec as u32))
    }
}

impl From<Duration> for AbiTimespec {
    fn from(d: Duration) -> Self {
        Self {
            sec: d.as_secs() as i64,
            nsec: d.subsec_nanos() as i64,
        }
    }
}

/// timeval of the cage ABI.
#[derive(Copy, Clone, Debug, Default)]
#[repr(C)]
pub(crate) struct AbiTimeval {
    pub sec: i64,
    pub usec: i64,
}

/// Resolution reported, and applied, when the high-resolution timer is
/// disabled.
const COARSE_TIMER_NANOS: i64 = 10_000;

fn known_clock(clk_id: i32) -> Result<ClockId, Errno> {
    match clk_id {
        0 => Ok(ClockId::CLOCK_REALTIME),
        1 => Ok(ClockId::CLOCK_MONOTONIC),
        2 => Ok(ClockId::CLOCK_PROCESS_CPUTIME_ID),
        3 => Ok(ClockId::CLOCK_THREAD_CPUTIME_ID),
        _ => Err(Errno::EINVAL),
    }
}

impl SyscallHandler {
    pub fn gettimeofday(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let tv_ptr = UserPtr::from(args.get(0));
        // the timezone argument is vestigial and ignored

        let now = clock_gettime(ClockId::CLOCK_REALTIME).map_err(SyscallError::from)?;
        let mut usec = now.tv_nsec() / 1000;
        if !ctx.runtime.options().high_resolution_timer_enabled() {
            usec -= usec % (COARSE_TIMER_NANOS / 1000);
        }
        let tv = AbiTimeval {
            sec: now.tv_sec(),
            usec,
        };
        ctx.cage.mem().write_val(tv_ptr, &tv)?;
        Ok(0u32.into())
    }

    pub fn clock_getres(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let clk_id = i32::from(args.get(0));
        let res_ptr = UserPtr::from(args.get(1));

        let clock = known_clock(clk_id)?;
        let res = clock_getres(clock).map_err(SyscallError::from)?;
        let reported = if ctx.runtime.options().high_resolution_timer_enabled() {
            AbiTimespec {
                sec: res.tv_sec(),
                nsec: res.tv_nsec(),
            }
        } else {
            AbiTimespec {
                sec: 0,
                nsec: COARSE_TIMER_NANOS,
            }
        };
        if !res_ptr.is_null() {
            ctx.cage.mem().write_val(res_ptr, &reported)?;
        }
        Ok(0u32.into())
    }

    pub fn clock_gettime(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let clk_id = i32::from(args.get(0));
        let ts_ptr = UserPtr::from(args.get(1));

        let clock = known_clock(clk_id)?;
        let now = clock_gettime(clock).map_err(SyscallError::from)?;
        let mut nsec = now.tv_nsec();
        if !ctx.runtime.options().high_resolution_timer_enabled() {
            nsec -= nsec % COARSE_TIMER_NANOS;
        }
        let ts = AbiTimespec {
            sec: now.tv_sec(),
            nsec,
        };
        ctx.cage.mem().write_val(ts_ptr, &ts)?;
        Ok(0u32.into())
    }

    pub fn nanosleep(&self, ctx: &mut ThreadContext, args: &SyscallArgs) -> SyscallResult {
        let req_ptr = UserPtr::from(args.get(0));
        let rem_ptr = UserPtr::from(args.get(1));

        let req: AbiTimespec = ctx.cage.mem().read_val(req_ptr)?;
        let req = Duration::try_from(req)?;

        std::thread::sleep(req);

        if !rem_ptr.is_null() {
            // no interruption model: the full request always elapses
            ctx.cage
                .mem()
                .write_val(rem_ptr, &AbiTimespec::default())?;
        }
        Ok(0u32.into())
    }

    pub fn sched_yield(&self, _ctx: &mut ThreadContext, _args: &SyscallArgs) -> SyscallResult {
        std::thread::yield_now();
        Ok(0u32.into())
    }
}
