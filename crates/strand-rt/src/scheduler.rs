// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Round-robin scheduler for routines sharing one OS thread.
//!
//! Routines switch on `yield_now()` or when the preemption tick lands.
//! Both go through the same path, which runs with the tick blocked and
//! never allocates, so it is safe to enter from the signal handler.

use std::cell::Cell;
use std::collections::VecDeque;
use std::ptr::{self, NonNull};

use libc::c_int;

use crate::config::Config;
use crate::error::{Result, RuntimeError};
use crate::routine::{Routine, RoutineId, Status};
use crate::signal::{self, MaskGuard, PreemptionTimer};

thread_local! {
    /// Core of the scheduler currently inside `start()` on this thread.
    /// Const-initialized with no destructor, so the tick handler can read it.
    static ACTIVE: Cell<*mut Core> = const { Cell::new(ptr::null_mut()) };
}

fn active() -> *mut Core {
    ACTIVE.with(Cell::get)
}

fn set_active(core: *mut Core) {
    ACTIVE.with(|cell| cell.set(core));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    /// `yield_now()`, including the final one after a body returns.
    Voluntary,
    /// Tick handler.
    Preempted,
}

/// Scheduler state. Heap-pinned: routines and the tick handler reach it
/// through raw pointers while the owning `Scheduler` is blocked in `start()`.
pub(crate) struct Core {
    /// Stands in for the stack `start()` was called on.
    main: Routine,
    /// Save slot for switches whose source will never be resumed.
    empty: Routine,
    /// Front runs next. The running routine, while alive, is the tail.
    ready: VecDeque<Box<Routine>>,
    /// Stopped routines whose stacks are not yet released.
    finished: Vec<Box<Routine>>,
    timer: Option<PreemptionTimer>,
    config: Config,
    next_id: u64,
    /// First panic raised by a routine body during the current run.
    panic: Option<(RoutineId, String)>,
}

impl Core {
    fn new(config: Config) -> Self {
        Self {
            main: Routine::sentinel(),
            empty: Routine::sentinel(),
            ready: VecDeque::new(),
            finished: Vec::new(),
            timer: None,
            config,
            next_id: 0,
            panic: None,
        }
    }

    /// Move stopped routines to the finished list, keeping the order of
    /// the rest. Never allocates: `finished` has room for every routine.
    fn reap(&mut self) {
        for _ in 0..self.ready.len() {
            let Some(routine) = self.ready.pop_front() else {
                break;
            };
            if routine.is_stopped() {
                self.finished.push(routine);
            } else {
                self.ready.push_back(routine);
            }
        }
    }

    /// Is any routine suspended at an arbitrary instruction (possibly in
    /// the middle of the allocator)?
    fn parked_in_handler(&self) -> bool {
        self.ready.iter().any(|r| r.preempted)
    }

    /// Release stacks of finished routines. Only call when none of them is
    /// the stack currently executing and the allocator is not held by any
    /// suspended routine.
    fn reclaim(&mut self) {
        self.finished.clear();
    }

    /// Pick the next switch. `None` means keep running the current routine.
    fn plan(&mut self, origin: Origin) -> Option<(*mut Routine, *mut Routine)> {
        // The current routine is still in `ready` here even if it just
        // stopped, so everything in `finished` is off-stack.
        if origin == Origin::Voluntary && !self.parked_in_handler() {
            self.reclaim();
        }
        self.reap();

        let empty: *mut Routine = &mut self.empty;
        let main: *mut Routine = &mut self.main;
        let Some(next) = self.ready.front() else {
            return Some((empty, main));
        };
        if next.is_running() {
            // Sole routine, interrupted by its own tick.
            return None;
        }
        debug_assert!(next.is_sleeping());

        // A live current routine is the tail. If the tail is not running,
        // the current routine stopped and was just reaped: its state is
        // never needed again.
        let from = match self.ready.back_mut() {
            Some(current) if current.is_running() => {
                current.preempted = origin == Origin::Preempted;
                &mut **current as *mut Routine
            }
            _ => empty,
        };
        if self.ready.len() > 1 {
            if let Some(next) = self.ready.pop_front() {
                self.ready.push_back(next);
            }
        }
        let next = self.ready.back_mut()?;
        Some((from, &mut **next as *mut Routine))
    }
}

/// Switch to whichever routine is due. Returns when the caller's routine
/// is resumed, or immediately if there is nothing else to run.
///
/// # Safety
///
/// `core` must be the published core of this thread and the tick must be
/// blocked.
unsafe fn reschedule(core: *mut Core, origin: Origin) {
    let Some((from, to)) = (*core).plan(origin) else {
        return;
    };
    Routine::switch(from, to);
    (*from).preempted = false;
}

/// Tick handler. Runs on the interrupted routine's stack.
extern "C" fn on_tick(_signal: c_int) {
    let core = active();
    if core.is_null() {
        return;
    }
    // SAFETY: a published core outlives the run; the kernel blocked the
    // tick for the duration of this handler.
    unsafe {
        if let Some(timer) = &(*core).timer {
            let _ = timer.arm();
        }
        reschedule(core, Origin::Preempted);
    }
}

/// Give up the CPU to the next ready routine.
///
/// Returns once this routine's turn comes around again; returns at once if
/// it is the only one left.
///
/// # Panics
///
/// When called outside a routine run by [`Scheduler::start`].
pub fn yield_now() {
    let core = active();
    assert!(!core.is_null(), "yield_now() called outside a running routine");
    let _mask = MaskGuard::block();
    // SAFETY: `core` is published only while `start()` is running, and the
    // tick is blocked.
    unsafe { reschedule(core, Origin::Voluntary) };
}

/// Id of the routine executing right now, if any.
pub fn current() -> Option<RoutineId> {
    let core = active();
    if core.is_null() {
        return None;
    }
    let _mask = MaskGuard::block();
    // SAFETY: see `yield_now`.
    unsafe {
        (*core)
            .ready
            .back()
            .filter(|r| r.is_running())
            .map(|r| r.id())
    }
}

/// Run `f` with the preemption tick held back.
///
/// A tick arriving meanwhile is delivered when `f` returns. Use this
/// around anything that must not be interrupted halfway, such as touching
/// a `RefCell` another routine also uses, or allocating while preemption
/// is on.
pub fn without_preemption<R>(f: impl FnOnce() -> R) -> R {
    let _mask = MaskGuard::block();
    f()
}

/// Remember a routine's panic so `start()` can report it.
pub(crate) fn record_panic(id: RoutineId, message: String) {
    let core = active();
    if core.is_null() {
        return;
    }
    log::error!("routine {} panicked: {}", id, message);
    // SAFETY: called from a routine with the tick blocked.
    let core = unsafe { &mut *core };
    if core.panic.is_none() {
        core.panic = Some((id, message));
    }
}

/// Multiplexes routines onto the calling thread.
///
/// Owns every routine's stack. Dropping it releases stacks of routines
/// that finished or never ran.
pub struct Scheduler {
    core: NonNull<Core>,
}

impl Scheduler {
    /// Scheduler with the default 64 KiB stacks and 100 ms quantum.
    pub fn new() -> Self {
        Self::from_core(Core::new(Config::default()))
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self::from_core(Core::new(config)))
    }

    fn from_core(core: Core) -> Self {
        Self {
            core: NonNull::from(Box::leak(Box::new(core))),
        }
    }

    fn core(&self) -> &Core {
        // SAFETY: owned by `self`; only aliased while `start()` runs, and
        // `start()` holds `&mut self`.
        unsafe { self.core.as_ref() }
    }

    fn core_mut(&mut self) -> &mut Core {
        // SAFETY: as in `core`.
        unsafe { self.core.as_mut() }
    }

    pub fn config(&self) -> &Config {
        &self.core().config
    }

    /// Routines spawned but not yet finished.
    pub fn pending(&self) -> usize {
        self.core().ready.len()
    }

    /// Status of a routine this scheduler still holds. `None` once its
    /// stack has been released.
    pub fn status(&self, id: RoutineId) -> Option<Status> {
        let core = self.core();
        core.ready
            .iter()
            .chain(core.finished.iter())
            .find(|r| r.id() == id)
            .map(|r| r.status())
    }

    /// Register `f` as a new routine at the back of the queue. It does not
    /// run until [`start`](Self::start).
    pub fn spawn<F>(&mut self, f: F) -> RoutineId
    where
        F: FnOnce() + 'static,
    {
        let core = self.core_mut();
        core.next_id += 1;
        let id = RoutineId(core.next_id);
        let routine = Routine::new(id, Box::new(f), core.config.stack_size);
        core.ready.push_back(routine);
        // Reaping must not allocate: leave room for every routine to finish.
        core.finished.reserve(core.ready.len());
        id
    }

    /// Run every spawned routine to completion, then return.
    ///
    /// Arms the preemption timer if a quantum is configured. Returns
    /// `Ok(())` immediately when nothing was spawned. If a body panicked,
    /// the remaining routines still run and the first panic is returned.
    ///
    /// # Panics
    ///
    /// When another scheduler is already running on this thread, e.g. when
    /// called from inside a routine.
    pub fn start(&mut self) -> Result<()> {
        let core = self.core.as_ptr();
        // SAFETY: nothing else references the core until it is published.
        if unsafe { (*core).ready.is_empty() } {
            return Ok(());
        }
        assert!(
            active().is_null(),
            "a scheduler is already running on this thread"
        );

        let mask = MaskGuard::block();
        let quantum = unsafe { (*core).config.quantum };
        if let Some(quantum) = quantum {
            signal::install_handler(on_tick).map_err(RuntimeError::Signal)?;
            let timer = PreemptionTimer::new(quantum).map_err(RuntimeError::Timer)?;
            timer.arm().map_err(RuntimeError::Timer)?;
            log::debug!("preemption armed, quantum {:?}", timer.quantum());
            // SAFETY: not yet published.
            unsafe { (*core).timer = Some(timer) };
        }

        // SAFETY: from here until the switch back, `core` is only touched
        // through raw pointers with the tick blocked.
        unsafe {
            let this = &mut *core;
            log::debug!("starting {} routines", this.ready.len());
            // Rotate so the first routine sits at the tail while it runs.
            if let Some(first) = this.ready.pop_front() {
                this.ready.push_back(first);
            }
            let first: *mut Routine = match this.ready.back_mut() {
                Some(first) => &mut **first as *mut Routine,
                None => return Ok(()),
            };
            set_active(core);
            Routine::switch(ptr::addr_of_mut!((*core).main), first);

            // Every routine has stopped; we are back on the caller's stack.
            set_active(ptr::null_mut());
            let this = &mut *core;
            this.timer = None;
            debug_assert!(this.ready.is_empty());
            debug_assert_eq!(this.main.status(), Status::Running);
            this.reclaim();
        }
        drop(mask);
        log::debug!("all routines finished");

        match self.core_mut().panic.take() {
            Some((id, message)) => Err(RuntimeError::RoutinePanicked { id, message }),
            None => Ok(()),
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let core = self.core();
        if !core.ready.is_empty() || !core.finished.is_empty() {
            log::trace!(
                "dropping scheduler with {} unrun and {} finished routines",
                core.ready.len(),
                core.finished.len()
            );
        }
        // SAFETY: allocated by `Box::leak` in `from_core`, freed only here.
        unsafe { drop(Box::from_raw(self.core.as_ptr())) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    fn ids(routines: &VecDeque<Box<Routine>>) -> Vec<u64> {
        routines.iter().map(|r| r.id().0).collect()
    }

    fn core_with(n: u64) -> Core {
        let mut core = Core::new(Config::cooperative());
        for i in 1..=n {
            core.ready
                .push_back(Routine::new(RoutineId(i), Box::new(|| {}), 8 * 1024));
        }
        core.finished.reserve(n as usize);
        core
    }

    /// Routines in any state, across queues and sentinels, that are Running.
    fn running_count() -> usize {
        let core = unsafe { &*active() };
        core.ready
            .iter()
            .chain(core.finished.iter())
            .map(|r| &**r)
            .chain([&core.main, &core.empty])
            .filter(|r| r.is_running())
            .count()
    }

    #[test]
    fn reap_without_stopped_is_noop() {
        let mut core = core_with(3);
        core.reap();
        assert_eq!(ids(&core.ready), vec![1, 2, 3]);
        assert!(core.finished.is_empty());
        core.reap();
        assert_eq!(ids(&core.ready), vec![1, 2, 3]);
        assert!(core.finished.is_empty());
    }

    #[test]
    fn reap_moves_stopped_and_keeps_order() {
        let mut core = core_with(4);
        core.ready[1].set_status(Status::Stopped);
        core.ready[3].set_status(Status::Stopped);
        let capacity = core.finished.capacity();
        core.reap();
        assert_eq!(ids(&core.ready), vec![1, 3]);
        let finished: Vec<u64> = core.finished.iter().map(|r| r.id().0).collect();
        assert_eq!(finished, vec![2, 4]);
        assert_eq!(core.finished.capacity(), capacity);
    }

    #[test]
    fn plan_with_empty_queue_returns_to_main() {
        let mut core = core_with(0);
        let main: *mut Routine = &mut core.main;
        let empty: *mut Routine = &mut core.empty;
        assert_eq!(core.plan(Origin::Voluntary), Some((empty, main)));
    }

    #[test]
    fn plan_skips_self_switch() {
        let mut core = core_with(1);
        core.ready[0].set_status(Status::Running);
        assert_eq!(core.plan(Origin::Preempted), None);
        assert_eq!(ids(&core.ready), vec![1]);
        assert!(!core.ready[0].preempted);
    }

    #[test]
    fn plan_rotates_and_marks_preempted() {
        let mut core = core_with(3);
        // Running routine sits at the tail.
        core.ready[2].set_status(Status::Running);
        let (from, to) = core.plan(Origin::Preempted).unwrap();
        assert_eq!(ids(&core.ready), vec![2, 3, 1]);
        unsafe {
            assert_eq!((*from).id().0, 3);
            assert_eq!((*to).id().0, 1);
        }
        assert!(core.ready[1].preempted);
    }

    #[test]
    fn plan_from_stopped_routine_uses_empty() {
        let mut core = core_with(3);
        core.ready[2].set_status(Status::Stopped);
        let empty: *mut Routine = &mut core.empty;
        let (from, to) = core.plan(Origin::Voluntary).unwrap();
        assert_eq!(from, empty);
        assert_eq!(ids(&core.ready), vec![2, 1]);
        unsafe { assert_eq!((*to).id().0, 1) };
        assert_eq!(core.finished.len(), 1);
        assert!(core.finished[0].is_stopped());
    }

    #[test]
    fn voluntary_plan_reclaims_only_when_nothing_parked() {
        let mut core = core_with(3);
        core.ready[0].set_status(Status::Stopped);
        core.reap();
        assert_eq!(core.finished.len(), 1);

        core.ready[0].preempted = true;
        core.ready[1].set_status(Status::Running);
        core.plan(Origin::Voluntary);
        assert_eq!(core.finished.len(), 1, "a parked routine may hold the allocator");

        for r in core.ready.iter_mut() {
            r.preempted = false;
        }
        core.plan(Origin::Voluntary);
        assert!(core.finished.is_empty());
    }

    #[test]
    fn empty_start_returns_immediately() {
        let mut sched = Scheduler::new();
        assert!(sched.start().is_ok());
        assert_eq!(sched.pending(), 0);
    }

    #[test]
    fn at_most_one_running() {
        let mut sched = Scheduler::with_config(Config::cooperative()).unwrap();
        let samples = Rc::new(Cell::new(0usize));
        for _ in 0..4 {
            let samples = samples.clone();
            sched.spawn(move || {
                for _ in 0..5 {
                    assert_eq!(running_count(), 1);
                    samples.set(samples.get() + 1);
                    yield_now();
                }
            });
        }
        sched.start().unwrap();
        assert_eq!(samples.get(), 20);
    }

    #[test]
    fn tick_blocked_during_switch_and_restored_after() {
        let mut sched = Scheduler::with_config(Config::cooperative()).unwrap();
        let checks = Rc::new(Cell::new(0));
        for _ in 0..2 {
            let checks = checks.clone();
            sched.spawn(move || {
                assert!(!signal::is_blocked());
                yield_now();
                assert!(!signal::is_blocked());
                without_preemption(|| {
                    assert!(signal::is_blocked());
                    yield_now();
                    assert!(signal::is_blocked());
                });
                assert!(!signal::is_blocked());
                checks.set(checks.get() + 1);
            });
        }
        sched.start().unwrap();
        assert_eq!(checks.get(), 2);
        assert!(!signal::is_blocked());
    }

    #[test]
    fn stopped_routines_never_resume() {
        let mut sched = Scheduler::with_config(Config::cooperative()).unwrap();
        let runs = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let runs = runs.clone();
            sched.spawn(move || runs.set(runs.get() + 1));
        }
        let looper = runs.clone();
        sched.spawn(move || {
            for _ in 0..10 {
                yield_now();
            }
            looper.set(looper.get() + 100);
        });
        sched.start().unwrap();
        assert_eq!(runs.get(), 103);
    }
}
