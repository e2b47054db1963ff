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

//! The Multiboot2 entry point.
//!
//! Unlike the teacher's `boot.rs`, this core is linked and loaded at its final
//! address directly: the kernel range `[VM_USERHI, 4 GiB)` is a permanent identity map
//! (`memory::vmem::init_boot_pd`), so there is no low-to-high-half relocation to
//! bridge and no transitional `REMAP` table to build. Placing the image's physical
//! load address in that range is a linker-script/loader concern this crate does not
//! own (see `DESIGN.md`); `_start` only sets up a stack and hands off to
//! [`crate::kernel_main`].

use core::arch::global_asm;

/// Boot stack size.
#[cfg(debug_assertions)]
pub const BOOT_STACK_SIZE: usize = 262144; // rustc in debug mode is greedy
/// Boot stack size.
#[cfg(not(debug_assertions))]
pub const BOOT_STACK_SIZE: usize = 32768;

global_asm!(
	r#"
.code32
.section .boot.text, "ax"

# Multiboot2 kernel header
.align 8
header:
	.long 0xe85250d6 # magic
	.long 0 # architecture (x86, protected mode)
	.long (header_end - header)
	.long -(0xe85250d6 + (header_end - header))
.align 8
	.short 0
	.short 0
	.long 8
header_end:

.section .boot.stack, "aw"
.align 16
boot_stack:
.size boot_stack, {BOOT_STACK_SIZE}
.skip {BOOT_STACK_SIZE}
boot_stack_begin:

.section .boot.text

.global _start
.type _start, @function

_start:
	mov esp, offset boot_stack_begin
	xor ebp, ebp
	push 0
	popfd

	# Multiboot leaves the magic/info pointer in eax/ebx; this core has no use for
	# them (no module/cmdline collaborator), so they are discarded.
	call kernel_main
	ud2
"#,
	BOOT_STACK_SIZE = const(BOOT_STACK_SIZE)
);
