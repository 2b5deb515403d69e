// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Strand runtime: preemptive routines on a single OS thread.
//!
//! Each routine owns a fixed-size stack and a closure. The scheduler runs
//! them round robin on the thread that calls [`Scheduler::start`];
//! routines hand over with [`yield_now`] or get switched out by a POSIX
//! timer signal when their quantum runs out.
//!
//! ```no_run
//! use strand_rt::{yield_now, Scheduler};
//!
//! let mut sched = Scheduler::new();
//! for name in ["foo", "bar"] {
//!     sched.spawn(move || {
//!         for i in 0..3 {
//!             println!("{name}: {i}");
//!             yield_now();
//!         }
//!     });
//! }
//! sched.start().unwrap();
//! ```
//!
//! Components:
//! - `stack`: initial stack image + raw stack switch (x86_64 asm)
//! - `signal`: preemption timer, tick handler, signal mask guard
//! - `routine`: routine state machine and entry trampoline
//! - `scheduler`: ready queue, reaping, deferred stack release
//!
//! A tick can land on any instruction. Code that holds a lock a sibling
//! might also take (the allocator, stdout, a `RefCell` borrow) should run
//! inside [`without_preemption`], or the scheduler should be built with
//! [`Config::cooperative`].

pub mod config;
pub mod error;
mod routine;
mod scheduler;
mod signal;
mod stack;

pub use config::Config;
pub use error::{Result, RuntimeError};
pub use routine::{RoutineId, Status};
pub use scheduler::{current, without_preemption, yield_now, Scheduler};
