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

//! The IDT (Interrupt Descriptor Table) is a table under the x86 architecture storing
//! the list of interrupt handlers, allowing to catch and handle interruptions.
//!
//! Every gate but the breakpoint, overflow and syscall vectors is ring-0 only; those
//! three are user-callable (`int3`, `into`, `int 0x80`).

use crate::arch::{
	x86,
	x86::{cli, gdt, sti},
};
use core::{arch::asm, arch::global_asm, ffi::c_void, mem::size_of, ptr::addr_of};
use utils::errno::EResult;

/// Flag telling that the interrupt is present, ring 0, 32-bit interrupt gate.
const FLAGS_RING0: u8 = 0x8e;
/// Flag telling that the interrupt is present, ring 3, 32-bit interrupt gate.
const FLAGS_RING3: u8 = 0xee;

/// The IDT vector index for system calls.
pub const SYSCALL_ENTRY: usize = 0x80;
/// The number of entries into the IDT.
pub const ENTRIES_COUNT: usize = SYSCALL_ENTRY + 1;

// Trap-vector assignment (stable numbers: user upcalls depend on them, see `kernel::trap`).
/// Divide error.
pub const T_DIVIDE: u8 = 0;
/// Debug exception.
pub const T_DEBUG: u8 = 1;
/// Non-maskable interrupt.
pub const T_NMI: u8 = 2;
/// Breakpoint (`int3`), user-callable.
pub const T_BRKPT: u8 = 3;
/// Overflow (`into`), user-callable.
pub const T_OFLOW: u8 = 4;
/// Bound-range exceeded.
pub const T_BOUND: u8 = 5;
/// Invalid opcode.
pub const T_ILLOP: u8 = 6;
/// Device not available.
pub const T_DEVICE: u8 = 7;
/// Double fault.
pub const T_DBLFLT: u8 = 8;
/// Invalid TSS.
pub const T_TSS: u8 = 10;
/// Segment not present.
pub const T_SEGNP: u8 = 11;
/// Stack-segment fault.
pub const T_STACK: u8 = 12;
/// General protection fault.
pub const T_GPFLT: u8 = 13;
/// Page fault.
pub const T_PGFLT: u8 = 14;
/// x87 FPU error.
pub const T_FPERR: u8 = 16;
/// Alignment check.
pub const T_ALIGN: u8 = 17;
/// Machine check.
pub const T_MCHK: u8 = 18;
/// SIMD floating-point exception.
pub const T_SIMDERR: u8 = 19;
/// Security exception.
pub const T_SECEV: u8 = 20;
/// First hardware IRQ vector; IRQ `i` is delivered on vector `IRQ0 + i`.
pub const IRQ0: u8 = 0x20;
/// Local APIC timer vector.
pub const T_LTIMER: u8 = 0x30;
/// The syscall vector, user-callable.
pub const T_SYSCALL: u8 = SYSCALL_ENTRY as u8;

/// Interruption stack frame, with saved registers state.
///
/// Field order matches the order in which [`trap_common`] pushes/pops them: `rax` is
/// nearest the top of the stack (pushed last, popped first), `ss` farthest (pushed by
/// hardware, only meaningful on a ring-crossing trap).
#[repr(C)]
#[allow(missing_docs)]
#[derive(Clone, Debug, Default)]
pub struct IntFrame {
	pub rax: u32,
	pub rbx: u32,
	pub rcx: u32,
	pub rdx: u32,
	pub rsi: u32,
	pub rdi: u32,
	pub rbp: u32,

	pub gs: u32,
	pub fs: u32,

	/// Interruption number.
	pub int: u32,
	/// Error code, if any, else `0`.
	pub code: u32,

	pub rip: u32,
	pub cs: u32,
	pub rflags: u32,
	/// Saved user stack pointer. Only meaningful if [`IntFrame::is_user`] is `true`: a
	/// same-ring kernel trap leaves this aliasing whatever was already on the kernel
	/// stack past the real frame, since the CPU does not push it in that case.
	pub rsp: u32,
	/// Saved user stack segment. Same caveat as `rsp`.
	pub ss: u32,
}

impl IntFrame {
	/// Tells whether the trapped context was running in user mode.
	#[inline]
	pub const fn is_user(&self) -> bool {
		self.cs as u16 & 0b11 != 0
	}

	/// Returns the ID of the system call being executed.
	#[inline]
	pub const fn get_syscall_id(&self) -> usize {
		self.rax as usize
	}

	/// Returns the value of the `n`th argument of the syscall being executed.
	///
	/// If `n` exceeds the number of arguments of this ABI, the function returns `0`.
	#[inline]
	pub const fn get_syscall_arg(&self, n: u8) -> usize {
		(match n {
			0 => self.rbx,
			1 => self.rcx,
			2 => self.rdx,
			3 => self.rsi,
			4 => self.rdi,
			_ => 0,
		}) as usize
	}

	/// Sets the return value of a system call.
	pub fn set_syscall_return(&mut self, value: EResult<usize>) {
		self.rax = value.map(|v| v as _).unwrap_or_else(|e| (-e.as_int()) as _);
	}

	/// Returns the address of the instruction to be executed when the interrupt handler
	/// returns.
	pub fn get_program_counter(&self) -> usize {
		self.rip as usize
	}

	/// Sets the address of the instruction to be executed when the interrupt handler
	/// returns.
	///
	/// Used by the recovery hook (§4.3) to redirect an anticipated fault to its "resume"
	/// address instead of re-executing the faulting instruction.
	pub fn set_program_counter(&mut self, val: usize) {
		self.rip = val as _;
	}

	/// Sets the values of `frame` so that it can be used to begin the execution of a
	/// user-mode program.
	///
	/// Arguments:
	/// - `pc` is the program counter.
	/// - `sp` is the stack pointer.
	pub fn exec(frame: &mut Self, pc: usize, sp: usize) {
		*frame = IntFrame {
			rip: pc as _,
			cs: (gdt::USER_CS | 3) as _,
			rflags: x86::DEFAULT_FLAGS as _,
			rsp: sp as _,
			ss: (gdt::USER_DS | 3) as _,
			..Default::default()
		};
	}
}

// All fields are `u32`, so every bit pattern is a valid `IntFrame`: safe to move as raw
// bytes across the syscall boundary (`crate::syscall`'s `REGS` register-block transfer).
unsafe impl utils::bytes::AnyRepr for IntFrame {}

/// Returns the faulting linear address of the last page fault (`CR2`).
#[inline]
pub fn get_fault_addr() -> usize {
	let val: usize;
	unsafe {
		asm!("mov {}, cr2", out(reg) val);
	}
	val
}

/// An IDT header, loaded with the `lidt` instruction.
#[repr(C, packed)]
struct InterruptDescriptorTable {
	/// The size of the IDT in bytes, minus 1.
	size: u16,
	/// The address to the beginning of the IDT.
	offset: u32,
}

/// An IDT entry.
#[repr(C)]
#[derive(Clone, Copy)]
struct InterruptDescriptor {
	/// Bits 0..16 of the address to the handler for the interrupt.
	offset0: u16,
	/// The code segment selector to execute the interrupt.
	selector: u16,
	/// Must be set to zero.
	zero0: u8,
	/// Interrupt handler flags.
	flags: u8,
	/// Bits 16..32 of the address to the handler for the interrupt.
	offset1: u16,
}

impl InterruptDescriptor {
	/// Returns a placeholder entry.
	///
	/// This function is necessary because the `const_trait_impl` feature is currently
	/// unstable, preventing the use of `Default`.
	const fn placeholder() -> Self {
		Self {
			offset0: 0,
			selector: 0,
			zero0: 0,
			flags: 0,
			offset1: 0,
		}
	}

	/// Creates an IDT entry.
	///
	/// Arguments:
	/// - `address` is the address of the handler.
	/// - `selector` is the segment selector to be used to handle the interrupt.
	/// - `flags` is the set of flags for the entry (see Intel documentation).
	fn new(address: *const c_void, selector: u16, flags: u8) -> Self {
		Self {
			offset0: (address as usize & 0xffff) as u16,
			selector,
			zero0: 0,
			flags,
			offset1: ((address as usize >> 16) & 0xffff) as u16,
		}
	}
}

extern "C" {
	fn error0();
	fn error1();
	fn error2();
	fn error3();
	fn error4();
	fn error5();
	fn error6();
	fn error7();
	fn error8();
	fn error9();
	fn error10();
	fn error11();
	fn error12();
	fn error13();
	fn error14();
	fn error15();
	fn error16();
	fn error17();
	fn error18();
	fn error19();
	fn error20();
	fn error21();
	fn error22();
	fn error23();
	fn error24();
	fn error25();
	fn error26();
	fn error27();
	fn error28();
	fn error29();
	fn error30();
	fn error31();

	fn irq0();
	fn irq1();
	fn irq2();
	fn irq3();
	fn irq4();
	fn irq5();
	fn irq6();
	fn irq7();
	fn irq8();
	fn irq9();
	fn irq10();
	fn irq11();
	fn irq12();
	fn irq13();
	fn irq14();
	fn irq15();

	fn ltimer_entry();
	fn syscall_entry();

	/// Restores a saved [`IntFrame`] and executes `iret`. Never returns.
	fn do_trap_return(frame: *const IntFrame) -> !;
}

/// The list of IDT entries.
static mut IDT_ENTRIES: [InterruptDescriptor; ENTRIES_COUNT] =
	[InterruptDescriptor::placeholder(); ENTRIES_COUNT];

/// Executes the given function `f` with maskable interruptions disabled.
///
/// This function saves the state of the interrupt flag and restores it before
/// returning.
pub fn wrap_disable_interrupts<T, F: FnOnce() -> T>(f: F) -> T {
	let int = x86::is_interrupt_enabled();
	// Here is assumed that no interruption will change flags register. Which could cause a
	// race condition
	cli();
	let res = f();
	if int {
		sti();
	} else {
		cli();
	}
	res
}

/// Restores `frame` and returns from the trap that produced it. Never returns.
///
/// Used by the dispatcher after handling a fault in place (e.g. the COW resolver), and by
/// the recovery hook to abort back into the handler's "resume" path.
pub fn trap_return(frame: &IntFrame) -> ! {
	unsafe { do_trap_return(frame) }
}

/// Initializes the IDT.
///
/// This function must be called only once at kernel initialization, after the PIC/APIC
/// has been brought up by [`crate::arch::init`]. When returning, maskable interrupts are
/// disabled by default.
pub fn init() {
	cli();
	// Safe: this function is called only once at boot, before interrupts are enabled.
	unsafe {
		let errors: [unsafe extern "C" fn(); 32] = [
			error0, error1, error2, error3, error4, error5, error6, error7, error8, error9,
			error10, error11, error12, error13, error14, error15, error16, error17, error18,
			error19, error20, error21, error22, error23, error24, error25, error26, error27,
			error28, error29, error30, error31,
		];
		for (i, f) in errors.into_iter().enumerate() {
			let flags = if i as u8 == T_BRKPT || i as u8 == T_OFLOW {
				FLAGS_RING3
			} else {
				FLAGS_RING0
			};
			IDT_ENTRIES[i] = InterruptDescriptor::new(f as _, gdt::KERNEL_CS as u16, flags);
		}
		let irqs: [unsafe extern "C" fn(); 16] = [
			irq0, irq1, irq2, irq3, irq4, irq5, irq6, irq7, irq8, irq9, irq10, irq11, irq12,
			irq13, irq14, irq15,
		];
		for (i, f) in irqs.into_iter().enumerate() {
			IDT_ENTRIES[IRQ0 as usize + i] =
				InterruptDescriptor::new(f as _, gdt::KERNEL_CS as u16, FLAGS_RING0);
		}
		IDT_ENTRIES[T_LTIMER as usize] =
			InterruptDescriptor::new(ltimer_entry as _, gdt::KERNEL_CS as u16, FLAGS_RING0);
		IDT_ENTRIES[SYSCALL_ENTRY] =
			InterruptDescriptor::new(syscall_entry as _, gdt::KERNEL_CS as u16, FLAGS_RING3);
		// Load
		let idt = InterruptDescriptorTable {
			size: (size_of::<InterruptDescriptor>() * ENTRIES_COUNT - 1) as u16,
			offset: addr_of!(IDT_ENTRIES) as _,
		};
		asm!("lidt [{}]", in(reg) &idt);
	}
}

// The trap entry stubs are generated from two GAS macros instead of hand-duplicated: one
// per vector for the 32 exceptions, 16 IRQs, the timer and the syscall vector would be
// ~600 lines of repetitive assembly for no benefit. `trap_common` normalizes the saved
// frame by always pushing the general-purpose registers in `IntFrame`'s field order; it
// relies on the CPU's own `iret` behavior to conditionally restore `esp`/`ss` based on the
// popped `cs`'s RPL, so there is no manual ring detection here.
global_asm!(r#"
.macro TRAP_NOEC num
.global error\num
error\num:
    push 0
    push \num
    jmp trap_common
.endm

.macro TRAP_EC num
.global error\num
error\num:
    push \num
    jmp trap_common
.endm

.macro IRQ num
.global irq\num
irq\num:
    push 0
    push (0x20 + \num)
    jmp trap_common
.endm

TRAP_NOEC 0
TRAP_NOEC 1
TRAP_NOEC 2
TRAP_NOEC 3
TRAP_NOEC 4
TRAP_NOEC 5
TRAP_NOEC 6
TRAP_NOEC 7
TRAP_EC 8
TRAP_NOEC 9
TRAP_EC 10
TRAP_EC 11
TRAP_EC 12
TRAP_EC 13
TRAP_EC 14
TRAP_NOEC 15
TRAP_NOEC 16
TRAP_EC 17
TRAP_NOEC 18
TRAP_NOEC 19
TRAP_NOEC 20
TRAP_NOEC 21
TRAP_NOEC 22
TRAP_NOEC 23
TRAP_NOEC 24
TRAP_NOEC 25
TRAP_NOEC 26
TRAP_NOEC 27
TRAP_NOEC 28
TRAP_NOEC 29
TRAP_NOEC 30
TRAP_NOEC 31

IRQ 0
IRQ 1
IRQ 2
IRQ 3
IRQ 4
IRQ 5
IRQ 6
IRQ 7
IRQ 8
IRQ 9
IRQ 10
IRQ 11
IRQ 12
IRQ 13
IRQ 14
IRQ 15

.global ltimer_entry
ltimer_entry:
    push 0
    push 0x30
    jmp trap_common

.global syscall_entry
syscall_entry:
    push 0
    push 0x80
    jmp trap_common

trap_common:
    push fs
    push gs
    push ebp
    push edi
    push esi
    push edx
    push ecx
    push ebx
    push eax
    push esp
    call rust_trap_handler
    add esp, 4
    jmp trap_return_common

.global do_trap_return
do_trap_return:
    mov eax, [esp + 4]
    mov esp, eax
    jmp trap_return_common

trap_return_common:
    pop eax
    pop ebx
    pop ecx
    pop edx
    pop esi
    pop edi
    pop ebp
    pop gs
    pop fs
    add esp, 8
    iretd
"#);
