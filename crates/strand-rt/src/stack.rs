// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Raw stack switching for x86_64 System V.
//!
//! Two operations and nothing else: build the initial image of a fresh
//! stack, and swap the stack pointer between two saved locations. This is
//! the only place in the crate that touches machine state directly.

use std::arch::global_asm;
use std::ffi::c_void;

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("strand-rt only supports x86_64 Linux");

/// Bytes below the stack pointer that leaf code may use without moving it.
/// Never hand them out as part of a fresh frame.
pub(crate) const RED_ZONE: usize = 128;

/// Default MXCSR: all exceptions masked, round to nearest.
const MXCSR_DEFAULT: u64 = 0x1F80;
/// Default x87 control word: extended precision, all exceptions masked.
const FCW_DEFAULT: u64 = 0x037F;

/// Words pushed by `strand_switch_stack`, plus the return slot and the
/// fake caller return address above it.
const INITIAL_FRAME_WORDS: usize = 9;

/// Code run the first time a fresh stack is resumed. Receives the
/// `payload` given to that first `switch_to`. Must never return.
pub(crate) type Entry = extern "C" fn(*mut c_void) -> !;

/// Saved stack pointer of a suspended stack.
///
/// Only ever copied around and passed back into [`switch_to`]; the memory
/// it points at may be gone by the time the value is discarded.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResumePoint(*mut u8);

impl ResumePoint {
    pub(crate) const fn null() -> Self {
        Self(std::ptr::null_mut())
    }

    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub(crate) fn addr(self) -> usize {
        self.0 as usize
    }
}

extern "C" {
    fn strand_switch_stack(save: *mut ResumePoint, target: ResumePoint, payload: *mut c_void);
}

// Frame layout at a saved stack pointer, lowest address first:
//   +0  MXCSR (4 bytes), x87 control word (2 bytes), padding
//   +8  r15, r14, r13, r12, rbx, rbp
//   +56 return address
global_asm!(
    ".text",
    ".global strand_switch_stack",
    ".type strand_switch_stack,@function",
    ".p2align 4",
    "strand_switch_stack:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "sub rsp, 8",
    "stmxcsr dword ptr [rsp]",
    "fnstcw word ptr [rsp + 4]",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "mov rdi, rdx",
    "ldmxcsr dword ptr [rsp]",
    "fldcw word ptr [rsp + 4]",
    "add rsp, 8",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    ".size strand_switch_stack, .-strand_switch_stack",
);

/// Lay out `stack` so that the first switch into the returned point calls
/// `entry` on a 16-byte aligned frame just below the red zone.
pub(crate) fn init_stack(stack: &mut [u8], entry: Entry) -> ResumePoint {
    let base = stack.as_mut_ptr() as usize;
    let top = (base + stack.len() - RED_ZONE) & !0xF;
    let frame_bytes = INITIAL_FRAME_WORDS * std::mem::size_of::<u64>();
    assert!(
        stack.len() >= RED_ZONE + frame_bytes + 16,
        "stack of {} bytes cannot hold an initial frame",
        stack.len()
    );

    let frame = (top - frame_bytes) as *mut u64;
    // SAFETY: `frame .. top` lies inside `stack` (checked above) and is
    // 8-byte aligned because `top` is 16-byte aligned.
    unsafe {
        frame.write(MXCSR_DEFAULT | (FCW_DEFAULT << 32));
        for reg in 1..=6 {
            frame.add(reg).write(0);
        }
        // `ret` lands here with rsp == top - 8, the alignment a callee
        // expects right after a `call`.
        frame.add(7).write(entry as usize as u64);
        // Null return address terminates backtraces.
        frame.add(8).write(0);
    }
    ResumePoint(frame.cast())
}

/// Save the current stack into `save` and resume `target`.
///
/// Returns when some later `switch_to` names the value stored in `save`.
/// If `target` came fresh out of [`init_stack`], its entry receives
/// `payload`; otherwise `payload` is ignored.
///
/// # Safety
///
/// `save` must be writable. `target` must come from `init_stack` or from a
/// previous `switch_to` on a stack that is still allocated and has not
/// been resumed since. Never call this from the stack `target` refers to.
#[inline]
pub(crate) unsafe fn switch_to(save: *mut ResumePoint, target: ResumePoint, payload: *mut c_void) {
    debug_assert!(!target.is_null(), "switch into a routine that was never initialized");
    strand_switch_stack(save, target, payload);
}
