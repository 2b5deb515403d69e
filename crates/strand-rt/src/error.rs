// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.

use std::io;

use thiserror::Error;

use crate::routine::RoutineId;

/// Errors surfaced by [`Scheduler`](crate::Scheduler).
///
/// Misuse (yielding outside a routine, nesting `start()`) is not an error
/// value: it panics at the call site.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The tick handler could not be installed. Preemption would be lost.
    #[error("failed to install preemption signal handler: {0}")]
    Signal(#[source] io::Error),

    /// The per-thread interval timer could not be created or armed.
    #[error("failed to set up preemption timer: {0}")]
    Timer(#[source] io::Error),

    #[error("stack size {requested} is below the minimum of {minimum} bytes")]
    StackTooSmall { requested: usize, minimum: usize },

    /// A routine's closure panicked. The run still completed; every other
    /// routine ran to the end.
    #[error("routine {id} panicked: {message}")]
    RoutinePanicked { id: RoutineId, message: String },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
