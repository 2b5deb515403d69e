// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Routine: a closure plus the private stack it runs on.
//!
//! Lifecycle: Sleeping → Running ⇄ Sleeping → Stopped. Stopped is final.

use std::any::Any;
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

use crate::scheduler;
use crate::signal;
use crate::stack::{self, ResumePoint};

/// Identifier handed out by [`Scheduler::spawn`](crate::Scheduler::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoutineId(pub(crate) u64);

impl fmt::Display for RoutineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Routine lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Spawned or switched out; waiting for its next turn.
    Sleeping,
    /// Owns the CPU. At most one routine per scheduler.
    Running,
    /// Closure returned. Terminal.
    Stopped,
}

pub(crate) type Body = Box<dyn FnOnce()>;

pub(crate) struct Routine {
    id: RoutineId,
    status: Status,
    /// `None` for the sentinels standing in for the caller's stack and
    /// for "nowhere".
    stack: Option<Box<[u8]>>,
    resume_point: ResumePoint,
    body: Option<Body>,
    /// Parked inside the tick handler, i.e. at an arbitrary instruction.
    pub(crate) preempted: bool,
}

impl fmt::Debug for Routine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Routine")
            .field("id", &self.id)
            .field("status", &self.status)
            .field("stack", &self.stack.as_ref().map(|s| s.as_ptr()))
            .field("resume_point", &self.resume_point)
            .finish()
    }
}

impl Routine {
    /// Allocate a zeroed stack and lay out its first frame so the initial
    /// switch lands in `exec`. Allocation failure aborts.
    pub(crate) fn new(id: RoutineId, body: Body, stack_size: usize) -> Box<Self> {
        let mut stack = vec![0u8; stack_size].into_boxed_slice();
        let resume_point = stack::init_stack(&mut stack, routine_entry);
        log::trace!(
            "routine {}: stack {:p}, {} bytes, sp {:#x}",
            id,
            stack.as_ptr(),
            stack_size,
            resume_point.addr()
        );
        Box::new(Self {
            id,
            status: Status::Sleeping,
            stack: Some(stack),
            resume_point,
            body: Some(body),
            preempted: false,
        })
    }

    /// Placeholder with no stack of its own. Its resume point is filled in
    /// by the first switch away from it.
    pub(crate) fn sentinel() -> Self {
        Self {
            id: RoutineId(0),
            status: Status::Sleeping,
            stack: None,
            resume_point: ResumePoint::null(),
            body: None,
            preempted: false,
        }
    }

    pub(crate) fn id(&self) -> RoutineId {
        self.id
    }

    pub(crate) fn status(&self) -> Status {
        self.status
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.status == Status::Stopped
    }

    pub(crate) fn is_running(&self) -> bool {
        self.status == Status::Running
    }

    pub(crate) fn is_sleeping(&self) -> bool {
        self.status == Status::Sleeping
    }

    #[cfg(test)]
    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    /// Status bookkeeping for a switch. A stopped `from` stays stopped.
    fn hand_over(from: &mut Routine, to: &mut Routine) {
        if !from.is_stopped() {
            from.status = Status::Sleeping;
        }
        to.status = Status::Running;
    }

    /// Suspend `from` and resume `to`. Returns when something switches
    /// back into `from`.
    ///
    /// # Safety
    ///
    /// `from` must be the context currently executing (or a sentinel that
    /// is never resumed) and `to` a suspended context whose stack is alive.
    /// Both pointers must stay valid until `from` is resumed.
    pub(crate) unsafe fn switch(from: *mut Routine, to: *mut Routine) {
        Routine::hand_over(&mut *from, &mut *to);
        let target = (*to).resume_point;
        stack::switch_to(ptr::addr_of_mut!((*from).resume_point), target, to.cast());
    }

    /// Run the body, mark stopped, and leave through the scheduler.
    ///
    /// # Safety
    ///
    /// Called once, from `routine_entry`, on the routine's own stack.
    unsafe fn exec(routine: *mut Routine) -> ! {
        if let Some(body) = (*routine).body.take() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                let id = (*routine).id;
                scheduler::without_preemption(|| {
                    scheduler::record_panic(id, panic_message(payload.as_ref()));
                    drop(payload);
                });
            }
        }
        (*routine).status = Status::Stopped;
        scheduler::yield_now();

        // The scheduler never resumes a stopped routine, and there is no
        // caller frame to return into.
        std::process::abort()
    }
}

impl Drop for Routine {
    fn drop(&mut self) {
        if let Some(stack) = &self.stack {
            log::trace!("routine {}: releasing stack {:p}", self.id, stack.as_ptr());
        }
    }
}

/// First code on every fresh stack. The switch that got here ran with the
/// tick blocked.
extern "C" fn routine_entry(payload: *mut c_void) -> ! {
    signal::unblock();
    // SAFETY: the payload of the first switch into a routine is the
    // routine itself (see `Routine::switch`).
    unsafe { Routine::exec(payload.cast()) }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_routine_sleeps() {
        let r = Routine::new(RoutineId(7), Box::new(|| {}), 8 * 1024);
        assert!(r.is_sleeping());
        assert!(!r.is_running());
        assert!(!r.is_stopped());
        assert_eq!(r.id(), RoutineId(7));
        assert!(!r.resume_point.is_null());
        assert!(r.body.is_some());
    }

    #[test]
    fn stack_is_zeroed_outside_initial_frame() {
        let r = Routine::new(RoutineId(1), Box::new(|| {}), 8 * 1024);
        let stack = r.stack.as_ref().unwrap();
        let frame_start = r.resume_point.addr() - stack.as_ptr() as usize;
        assert!(stack[..frame_start].iter().all(|&b| b == 0));
    }

    #[test]
    fn sentinel_has_no_stack() {
        let s = Routine::sentinel();
        assert!(s.stack.is_none());
        assert!(s.body.is_none());
        assert!(s.resume_point.is_null());
        assert!(s.is_sleeping());
    }

    #[test]
    fn hand_over_flips_statuses() {
        let mut a = Routine::sentinel();
        let mut b = Routine::sentinel();
        a.set_status(Status::Running);
        Routine::hand_over(&mut a, &mut b);
        assert_eq!(a.status(), Status::Sleeping);
        assert_eq!(b.status(), Status::Running);
    }

    #[test]
    fn stopped_stays_stopped() {
        let mut dead = Routine::sentinel();
        let mut next = Routine::sentinel();
        dead.set_status(Status::Stopped);
        Routine::hand_over(&mut dead, &mut next);
        assert_eq!(dead.status(), Status::Stopped);
        assert!(next.is_running());
    }

    #[test]
    fn panic_messages() {
        let s: Box<dyn Any + Send> = Box::new("static str");
        assert_eq!(panic_message(s.as_ref()), "static str");
        let s: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(s.as_ref()), "owned");
        let s: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(s.as_ref()), "unknown panic");
    }

    #[test]
    fn display_id() {
        assert_eq!(RoutineId(3).to_string(), "#3");
    }
}
