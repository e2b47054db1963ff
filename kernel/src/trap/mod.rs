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

//! The trap dispatcher: the single entry point every vector stub in
//! [`crate::arch::x86::idt`] funnels into.
//!
//! Entered with interrupts disabled (gate semantics). Routing order, first match wins:
//! 1. Page fault on the current address space → the COW resolver.
//! 2. An installed recovery hook → [`crate::recovery`].
//! 3. Hardware interrupts → acknowledge the local APIC/PIC, dispatch by vector.
//! 4. The syscall vector → [`crate::syscall`].
//! 5. A fault from user mode that nothing above claimed → reflected to the parent
//!    process (a collaborator concern; this crate only provides the seam, see
//!    [`set_reflect_hook`]).
//! 6. An unexpected kernel-mode fault → release the console lock, print the frame, panic.

use crate::{
	arch::{
		self,
		x86::idt::{self, IntFrame, IRQ0, T_LTIMER, T_PGFLT, T_SYSCALL},
	},
	memory::vmem::{fault, PageDirectory},
	panic, recovery,
};
use core::{arch::asm, ptr::NonNull};

/// The number of IRQ lines this dispatcher routes to device-specific handlers.
const IRQ_COUNT: usize = 16;

/// The page directory currently bound to this CPU, set by the process collaborator (or a
/// test harness) before user code or a syscall can run.
static mut CURRENT_PD: Option<NonNull<PageDirectory>> = None;

/// Handlers for individual hardware IRQ lines, indexed by IRQ number.
static mut IRQ_HANDLERS: [Option<fn()>; IRQ_COUNT] = [None; IRQ_COUNT];

/// Invoked on every local APIC timer tick, with whether the interrupted context was user
/// mode. Left unset, the timer is acknowledged and otherwise ignored.
static mut TIMER_TICK: Option<fn(bool)> = None;

/// Invoked for a user-mode fault nothing else claimed, with the saved frame as the cause.
/// Left unset, the dispatcher panics instead (acceptable for a core with no process
/// collaborator wired in, e.g. this crate's own test harness).
static mut REFLECT_HOOK: Option<fn(&mut IntFrame)> = None;

/// Sets the page directory the page-fault resolver (§4.6) and syscall shim operate on.
///
/// # Safety
///
/// Must not be called while a trap that reads [`CURRENT_PD`] could be concurrently in
/// flight (true on this single-CPU core as long as interrupts are disabled, which they
/// are whenever this function would plausibly be called from).
pub unsafe fn set_current_pd(pd: Option<NonNull<PageDirectory>>) {
	CURRENT_PD = pd;
}

/// Returns the page directory currently bound by [`set_current_pd`], if any.
///
/// # Safety
///
/// Same caveat as [`set_current_pd`]: the caller must not race a trap that reads
/// [`CURRENT_PD`], which holds on this single-CPU core as long as interrupts are
/// disabled.
pub unsafe fn current_pd() -> Option<NonNull<PageDirectory>> {
	CURRENT_PD
}

/// Registers the handler for hardware IRQ `irq`. Panics if `irq` is out of range.
pub fn set_irq_handler(irq: u8, handler: Option<fn()>) {
	let irq = irq as usize;
	assert!(irq < IRQ_COUNT, "IRQ out of range");
	unsafe {
		IRQ_HANDLERS[irq] = handler;
	}
}

/// Registers the local APIC timer tick handler.
pub fn set_timer_tick(handler: Option<fn(bool)>) {
	unsafe {
		TIMER_TICK = handler;
	}
}

/// Registers the user-mode fault reflection hook (§4.2 rank 5).
pub fn set_reflect_hook(handler: Option<fn(&mut IntFrame)>) {
	unsafe {
		REFLECT_HOOK = handler;
	}
}

/// Reflects `frame` to the registered [`set_reflect_hook`] handler and resumes, or panics
/// if none is registered (acceptable for a core with no process collaborator wired in).
///
/// Shared by rank 5 below and by [`crate::syscall::usercopy`], which calls this with the
/// syscall's own frame after overwriting `int`/`code` to record a fault that occurred
/// while touching user memory on the syscall's behalf, per §4.9 step 2.
pub fn reflect(frame: &mut IntFrame) -> ! {
	if let Some(hook) = unsafe { REFLECT_HOOK } {
		hook(frame);
		idt::trap_return(frame);
	}
	crate::console::force_unlock();
	panic::with_frame(frame);
}

/// Entered from [`crate::arch::x86::idt`]'s common trap stub with a pointer to the saved
/// frame. Never returns: every path ends either in [`idt::trap_return`] or a diverging
/// reflection/panic.
#[no_mangle]
pub extern "C" fn rust_trap_handler(frame: *mut IntFrame) -> ! {
	// Safe: the stub just built this frame on the kernel stack; it is valid for the
	// duration of this call.
	let frame = unsafe { &mut *frame };
	// User code may have set the direction flag in violation of the calling convention;
	// compiler-generated code (e.g. `rep movs` in the merge engine) assumes it clear.
	unsafe {
		asm!("cld");
	}
	dispatch(frame)
}

fn dispatch(frame: &mut IntFrame) -> ! {
	let vector = frame.int as u8;
	// Rank 1: page fault.
	if vector == T_PGFLT {
		// Safe: `CURRENT_PD` is only ever written with interrupts disabled, and we are
		// executing with interrupts disabled (gate semantics).
		if let Some(mut pd) = unsafe { CURRENT_PD } {
			let addr = idt::get_fault_addr();
			if fault::handle(unsafe { pd.as_mut() }, addr) {
				idt::trap_return(frame);
			}
		}
	}
	// Rank 2: an anticipated fault, recovered without reflecting or panicking.
	if recovery::try_dispatch(frame) {
		unreachable!("recovery::try_dispatch diverges when it returns true");
	}
	// Rank 3: hardware interrupts.
	if vector == T_LTIMER {
		arch::end_of_interrupt(vector);
		if let Some(tick) = unsafe { TIMER_TICK } {
			tick(frame.is_user());
		}
		idt::trap_return(frame);
	}
	if (IRQ0..IRQ0 + IRQ_COUNT as u8).contains(&vector) {
		let irq = vector - IRQ0;
		arch::end_of_interrupt(irq);
		if let Some(handler) = unsafe { IRQ_HANDLERS[irq as usize] } {
			handler();
		}
		idt::trap_return(frame);
	}
	// Rank 4: syscall.
	if vector == T_SYSCALL {
		crate::syscall::handle(frame);
		idt::trap_return(frame);
	}
	// Rank 5: user-mode fault, reflected to the parent.
	if frame.is_user() {
		reflect(frame);
	}
	// Rank 6: unexpected kernel-mode fault.
	crate::console::force_unlock();
	panic::with_frame(frame);
}
