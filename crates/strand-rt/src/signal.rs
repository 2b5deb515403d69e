// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Preemption tick: per-thread POSIX timer, process-wide handler, and a
//! scoped signal mask.
//!
//! The timer targets the owning thread (`SIGEV_THREAD_ID`), so several
//! threads can each run their own scheduler. The handler stays installed
//! once set; on a thread with no running scheduler it does nothing.

use std::io;
use std::mem;
use std::ptr;
use std::time::Duration;

use libc::c_int;

/// Signal the preemption timer delivers.
pub(crate) fn tick_signal() -> c_int {
    libc::SIGRTMIN()
}

/// Install `handler` for the tick signal.
///
/// No `SA_NODEFER`: the kernel blocks the tick while the handler runs, and
/// whichever routine is resumed from inside it restores its own mask.
pub(crate) fn install_handler(handler: extern "C" fn(c_int)) -> io::Result<()> {
    // SAFETY: zeroed `sigaction` is a valid starting point; all pointers
    // passed to libc are to initialized locals.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(tick_signal(), &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn tick_set() -> libc::sigset_t {
    // SAFETY: sigemptyset initializes the set before sigaddset reads it.
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, tick_signal());
        set
    }
}

/// Blocks the tick until dropped, then restores the mask that was in
/// effect before.
///
/// Held across stack switches: the guard lives on the suspended routine's
/// stack and restores that routine's mask when it resumes.
pub(crate) struct MaskGuard {
    previous: libc::sigset_t,
}

impl MaskGuard {
    pub(crate) fn block() -> Self {
        let set = tick_set();
        // SAFETY: both sets are valid for the duration of the call.
        let previous = unsafe {
            let mut previous: libc::sigset_t = mem::zeroed();
            libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut previous);
            previous
        };
        Self { previous }
    }
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        // SAFETY: `previous` was filled in by pthread_sigmask.
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.previous, ptr::null_mut());
        }
    }
}

/// Let ticks through again. Used where no guard exists to restore from:
/// the first instructions of a fresh routine.
pub(crate) fn unblock() {
    let set = tick_set();
    // SAFETY: `set` is initialized.
    unsafe {
        libc::pthread_sigmask(libc::SIG_UNBLOCK, &set, ptr::null_mut());
    }
}

/// Is the tick currently blocked on this thread?
#[cfg(test)]
pub(crate) fn is_blocked() -> bool {
    // SAFETY: querying the mask with a null new-set changes nothing.
    unsafe {
        let mut current: libc::sigset_t = mem::zeroed();
        libc::pthread_sigmask(libc::SIG_BLOCK, ptr::null(), &mut current);
        libc::sigismember(&current, tick_signal()) == 1
    }
}

/// One-shot interval timer aimed at the thread that created it.
///
/// Deleted on drop, so no tick can be generated afterwards.
pub(crate) struct PreemptionTimer {
    id: libc::timer_t,
    quantum: Duration,
}

impl PreemptionTimer {
    pub(crate) fn new(quantum: Duration) -> io::Result<Self> {
        // SAFETY: zeroed sigevent is valid; the fields set below are the
        // ones SIGEV_THREAD_ID reads.
        let mut event: libc::sigevent = unsafe { mem::zeroed() };
        event.sigev_notify = libc::SIGEV_THREAD_ID;
        event.sigev_signo = tick_signal();
        event.sigev_notify_thread_id = current_tid();

        let mut id: libc::timer_t = ptr::null_mut();
        // SAFETY: `event` and `id` are valid for writes/reads.
        if unsafe { libc::timer_create(libc::CLOCK_MONOTONIC, &mut event, &mut id) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, quantum })
    }

    /// Schedule the next tick one quantum from now.
    ///
    /// Async-signal-safe; called from the handler itself.
    pub(crate) fn arm(&self) -> io::Result<()> {
        let spec = libc::itimerspec {
            it_interval: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
            it_value: to_timespec(self.quantum),
        };
        // SAFETY: `self.id` is a live timer until drop.
        if unsafe { libc::timer_settime(self.id, 0, &spec, ptr::null_mut()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub(crate) fn quantum(&self) -> Duration {
        self.quantum
    }
}

impl Drop for PreemptionTimer {
    fn drop(&mut self) {
        // SAFETY: the timer was created in `new` and is deleted only here.
        unsafe {
            libc::timer_delete(self.id);
        }
    }
}

fn current_tid() -> c_int {
    // SAFETY: gettid has no preconditions.
    unsafe { libc::syscall(libc::SYS_gettid) as c_int }
}

/// A zero `it_value` would disarm the timer, so round up to 1µs.
fn to_timespec(d: Duration) -> libc::timespec {
    let d = d.max(Duration::from_micros(1));
    libc::timespec {
        tv_sec: d.as_secs() as libc::time_t,
        tv_nsec: d.subsec_nanos() as libc::c_long,
    }
}
