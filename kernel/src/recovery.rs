/*
 * Copyright 2024 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! The per-CPU recovery hook turns a synchronous CPU exception into a `setjmp`/`longjmp`
//! style abortable region, without abandoning the kernel stack.
//!
//! Used by both the kernel self-test (one instance of each exception class, see
//! [`crate::selftest`]) and by [`crate::syscall::usercopy`] to recover from faults that
//! occur while touching user memory from kernel code.
//!
//! Since this core targets a single boot CPU (§1, `arch::core_id` always `0`), the "per-CPU"
//! slot is a single global, guarded the same way any other trap-touched state is (see
//! `sync::mod`).

use crate::{arch::x86::idt::IntFrame, sync::spin::IntSpin};

/// Shared between the installer and the recovery handler across the trap boundary.
///
/// `resume` is the address execution returns to; `trap` is filled in by the handler
/// before transferring control there.
pub struct RecoveryContext {
	/// Address to resume execution at once a trap is recovered.
	pub resume: usize,
	/// Set by the handler to the `(vector, error code)` of the trap that was recovered.
	pub trap: Option<(u8, u32)>,
}

impl RecoveryContext {
	/// Creates a context with no resume point yet installed.
	pub const fn new() -> Self {
		Self {
			resume: 0,
			trap: None,
		}
	}
}

/// A recovery handler, invoked by the dispatcher with the faulting frame and the
/// `data` pointer supplied at [`install`] time.
type Handler = fn(&mut IntFrame, usize);

struct Slot {
	handler: Handler,
	data: usize,
}

static SLOT: IntSpin<Option<Slot>> = IntSpin::new(None);

/// The handler installed by [`install`]: records the trap, rewrites the saved
/// instruction pointer to the resume address, and returns from the trap there.
fn default_handler(frame: &mut IntFrame, data: usize) {
	// Safe: `data` was produced from a `&mut RecoveryContext` in `install`, which outlives
	// the installed hook by construction (the body calling `install` also calls `clear`
	// before its `RecoveryContext` goes out of scope).
	let ctx = unsafe { &mut *(data as *mut RecoveryContext) };
	ctx.trap = Some((frame.int as u8, frame.code));
	frame.set_program_counter(ctx.resume);
	crate::arch::x86::idt::trap_return(frame);
}

/// Installs the recovery hook. Panics if one is already installed: the slot is one-shot
/// and per-CPU, never nested.
pub fn install(ctx: &mut RecoveryContext) {
	let mut slot = SLOT.lock();
	assert!(slot.is_none(), "recovery hook already installed");
	*slot = Some(Slot {
		handler: default_handler,
		data: ctx as *mut RecoveryContext as usize,
	});
}

/// Clears the recovery hook. Must be called once the protected region completes without
/// faulting, and is safe to call even if no hook is installed.
pub fn clear() {
	*SLOT.lock() = None;
}

/// Consulted by the dispatcher (§4.2 routing rank 2). If a hook is installed, it is taken
/// and invoked; the call does not return (the handler transfers control via
/// [`crate::arch::x86::idt::trap_return`]). Returns `false` if no hook was installed, in
/// which case the dispatcher proceeds to the next routing rank.
pub fn try_dispatch(frame: &mut IntFrame) -> bool {
	let slot = SLOT.lock().take();
	match slot {
		Some(Slot { handler, data }) => {
			// `default_handler` diverges via `trap_return` in practice; `true` here only
			// satisfies the type checker, which does not know that.
			handler(frame, data);
			true
		}
		None => false,
	}
}

/// Runs `body` with the recovery hook armed, returning `Ok` with its result if it
/// completes without faulting, or `Err((vector, error code))` if a trap aborted it.
///
/// Models the anticipated-fault region described in §9: in the absence of a `longjmp`,
/// the resume address is the label immediately following the landing pad below, and the
/// handler transfers control there through the normal trap-return path instead of
/// unwinding the stack. This relies on `body` running in the same stack frame with no
/// intervening call that could leave state the compiler assumes live only in registers
/// across the landing pad; keep protected regions short and side-effect visible through
/// memory, matching every caller in this crate.
#[macro_export]
macro_rules! recover {
	($body:expr) => {{
		let mut ctx = $crate::recovery::RecoveryContext::new();
		let resume: usize;
		unsafe {
			core::arch::asm!("lea {resume}, [1f]", "1:", resume = out(reg) resume, options(nostack, preserves_flags));
		}
		if let Some(trap) = ctx.trap {
			Err(trap)
		} else {
			ctx.resume = resume;
			$crate::recovery::install(&mut ctx);
			let value = $body;
			$crate::recovery::clear();
			Ok(value)
		}
	}};
}
