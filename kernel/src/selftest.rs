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

//! Selftesting are unit tests or integration tests that run on the kernel itself.
//!
//! # Issues
//!
//! Since the kernel cannot reset itself between each test, this method of testing might not be
//! entirely trustable because a test might corrupt the environment for the next tests, which might
//! make them pass even though they should not. Even if this scenario is unlikely, this remains a
//! concern since the kernel has to be as reliable as possible.

use crate::{debug, power};
use core::{
	any::type_name,
	sync::{atomic, atomic::AtomicBool},
};

/// Boolean value telling whether selftesting is running.
static RUNNING: AtomicBool = AtomicBool::new(false);

/// Trait for any testable feature.
pub trait Testable {
	/// Function called to run the corresponding test.
	fn run(&self);
}

impl<T> Testable for T
where
	T: Fn(),
{
	fn run(&self) {
		let name = type_name::<T>();
		crate::print!("test {name} ... ");
		self();
		crate::println!("ok");
	}
}

/// The test runner for the kernel.
///
/// This function runs every tests for the kernel and halts the kernel or exits the emulator if
/// possible.
pub fn runner(tests: &[&dyn Testable]) {
	crate::println!("Running {} tests", tests.len());
	RUNNING.store(true, atomic::Ordering::Relaxed);
	for test in tests {
		test.run();
	}
	RUNNING.store(false, atomic::Ordering::Relaxed);
	crate::println!("No more tests to run");
	#[cfg(config_debug_qemu)]
	debug::qemu::exit(debug::qemu::SUCCESS);
	power::halt();
}

/// Tells whether selftesting is running.
pub fn is_running() -> bool {
	RUNNING.load(atomic::Ordering::Relaxed)
}

/// The trap dispatcher's kernel-mode self-test (§4.3/§8 scenario 7): one instance of each
/// of `{divide, breakpoint, overflow, bound, illegal-op, general-protection}`, run through
/// the recovery hook, and a general-protection instance triggered from user mode through
/// [`crate::trap::set_reflect_hook`] instead.
///
/// Between every step the stack-local [`COOKIE`] is re-verified: if the recovery path ever
/// computed the wrong resume stack pointer, a corrupted cookie catches it immediately
/// instead of silently passing or crashing somewhere unrelated later on.
#[cfg(test)]
mod trap {
	use crate::{
		arch::x86::{
			gdt,
			idt::{self, IntFrame, T_BOUND, T_BRKPT, T_DIVIDE, T_GPFLT, T_ILLOP, T_OFLOW},
		},
		memory::{
			frame,
			vmem::{self, VM_USERLO},
			VirtAddr,
		},
		sync::spin::IntSpin,
		trap,
	};
	use core::{arch::asm, ptr::NonNull};
	use utils::limits::PAGE_SIZE;

	/// Re-verified between every step of the kernel-mode leg.
	const COOKIE: usize = 0xc0ffee5e;

	/// Runs `$body` under [`crate::recover`] and asserts it trapped with vector `$vector`,
	/// with [`COOKIE`] intact across the recovery.
	macro_rules! expect_trap {
		($vector:expr, $body:expr) => {{
			let cookie = COOKIE;
			let result = crate::recover!($body);
			assert_eq!(cookie, COOKIE, "stack cookie clobbered by trap recovery");
			match result {
				Err((vector, _code)) => assert_eq!(vector, $vector, "unexpected trap vector"),
				Ok(()) => panic!("expected trap {}, instruction completed normally", $vector),
			}
		}};
	}

	#[test_case]
	fn divide_by_zero() {
		expect_trap!(T_DIVIDE, unsafe {
			asm!(
				"xor edx, edx", "mov eax, 0", "div eax",
				out("eax") _, out("edx") _,
				options(nostack),
			);
		});
	}

	#[test_case]
	fn breakpoint() {
		expect_trap!(T_BRKPT, unsafe {
			asm!("int3", options(nostack));
		});
	}

	#[test_case]
	fn overflow() {
		expect_trap!(T_OFLOW, unsafe {
			asm!(
				"mov eax, 0x7fffffff", "add eax, eax", "into",
				out("eax") _,
				options(nostack),
			);
		});
	}

	#[test_case]
	fn bound_range() {
		let bounds: [i32; 2] = [0, 10];
		expect_trap!(T_BOUND, unsafe {
			asm!(
				"bound {idx:e}, [{bounds}]",
				idx = in(reg) 100i32,
				bounds = in(reg) bounds.as_ptr(),
				options(nostack, readonly),
			);
		});
	}

	#[test_case]
	fn illegal_opcode() {
		expect_trap!(T_ILLOP, unsafe {
			asm!("ud2", options(nostack));
		});
	}

	#[test_case]
	fn general_protection_bad_segment() {
		expect_trap!(T_GPFLT, unsafe {
			asm!(
				"mov ax, -1", "mov fs, ax",
				out("ax") _,
				options(nostack),
			);
		});
	}

	/// The resume address and trap info exchanged with [`reflect_user_fault`], which has
	/// no `data` parameter to carry them directly (unlike [`crate::recovery`]'s hook,
	/// [`trap::set_reflect_hook`]'s is a bare `fn(&mut IntFrame)`).
	static USER_RESUME: IntSpin<usize> = IntSpin::new(0);
	static USER_TRAP: IntSpin<Option<(u8, u32)>> = IntSpin::new(None);

	/// Rewrites `frame` to resume execution in ring 0 at [`USER_RESUME`] instead of back
	/// into the faulting user code, recording the trap first.
	///
	/// Mirrors [`crate::recovery`]'s default handler, generalized to also cross back from
	/// ring 3: `do_trap_return`'s `iretd` decides how many words to pop based on the
	/// popped `cs`'s RPL, so overwriting `cs` to a ring 0 selector here is enough to make
	/// it perform a same-ring return using whatever is already on the kernel stack, with
	/// no separate stack-switch bookkeeping required.
	fn reflect_user_fault(frame: &mut IntFrame) {
		*USER_TRAP.lock() = Some((frame.int as u8, frame.code));
		frame.cs = gdt::KERNEL_CS as u32;
		frame.set_program_counter(*USER_RESUME.lock());
	}

	/// Hand-assembled `lidt [0]; jmp $`: `lidt` is privilege-checked and faults with `#GP`
	/// before it would dereference its operand, so the address given it is never read.
	const LIDT_PROGRAM: [u8; 9] = [0x0f, 0x01, 0x1d, 0x00, 0x00, 0x00, 0x00, 0xeb, 0xfe];

	/// Scenario 7's user-mode leg: `lidt` is a privileged instruction; executed from a
	/// throwaway ring 3 context it must fault `#GP` rather than succeed, per §8 scenario 7.
	///
	/// Builds its own minimal address space rather than going through a process object,
	/// per §4.3a: process creation is a collaborator concern this crate does not own.
	#[test_case]
	fn general_protection_user_privileged_instruction() {
		const USER_CODE: VirtAddr = VirtAddr(VM_USERLO.0 + PAGE_SIZE);
		const USER_STACK: VirtAddr = VirtAddr(VM_USERLO.0 + 2 * PAGE_SIZE);

		let code_frame = frame::alloc().expect("self-test: out of frames");
		let stack_frame = frame::alloc().expect("self-test: out of frames");
		let code_ptr: *mut [u8; LIDT_PROGRAM.len()] = code_frame
			.kernel_to_virtual()
			.expect("frame outside kernel identity map")
			.as_ptr();
		unsafe {
			(*code_ptr) = LIDT_PROGRAM;
		}

		let pd_phys = vmem::new_pdir().expect("self-test: out of frames");
		let pd = unsafe { vmem::pd_at(pd_phys) };
		vmem::map::insert(pd, code_frame, USER_CODE, vmem::SYS_READ)
			.expect("self-test: out of frames")
			.expect("self-test: mapping failed");
		vmem::map::insert(pd, stack_frame, USER_STACK, vmem::SYS_READ | vmem::SYS_WRITE)
			.expect("self-test: out of frames")
			.expect("self-test: mapping failed");

		let mut user_frame = IntFrame::default();
		IntFrame::exec(&mut user_frame, USER_CODE.0, USER_STACK.0 + PAGE_SIZE);

		let saved_pd = unsafe { trap::current_pd() };
		trap::set_reflect_hook(Some(reflect_user_fault));
		unsafe {
			trap::set_current_pd(Some(NonNull::from(&mut *pd)));
		}
		let old_cr3 = crate::arch::x86::get_cr3();
		unsafe {
			crate::arch::x86::set_cr3(pd_phys.0);
		}

		let resume: usize;
		unsafe {
			asm!("lea {resume}, [1f]", "1:", resume = out(reg) resume, options(nostack, preserves_flags));
		}
		let trapped = *USER_TRAP.lock();
		if trapped.is_none() {
			*USER_RESUME.lock() = resume;
			idt::trap_return(&user_frame);
		}

		unsafe {
			crate::arch::x86::set_cr3(old_cr3);
			trap::set_current_pd(saved_pd);
		}
		trap::set_reflect_hook(None);
		vmem::free_pdir(pd_phys);

		let (vector, _code) = trapped.expect("expected a trap, user code ran to completion");
		assert_eq!(vector, T_GPFLT, "unexpected trap vector");
	}
}
