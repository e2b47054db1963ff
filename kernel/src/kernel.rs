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

//! A trap dispatcher and virtual memory core for a small JOS/PIOS-lineage research
//! kernel: the trap/interrupt plumbing, a page-table manager with demand allocation,
//! refcounted frames and copy-on-write, the copy/three-way-merge engine behind it, and
//! the syscall shim that ties them to a calling process. This reference documents
//! interfaces for modules and the kernel's internals.
//!
//! Process creation, scheduling, the VFS and device drivers are collaborators this
//! crate does not own; see `DESIGN.md` for the boundary this core stops at.

#![no_std]
#![no_main]
#![feature(custom_test_frameworks)]
#![feature(lang_items)]
#![feature(strict_provenance_lints)]
#![deny(fuzzy_provenance_casts)]
#![deny(missing_docs)]
#![allow(clippy::tabs_in_doc_comments)]
#![allow(dead_code)]
#![allow(internal_features)]
#![allow(unsafe_op_in_unsafe_fn)]
#![test_runner(crate::selftest::runner)]
#![reexport_test_harness_main = "kernel_selftest"]

pub mod arch;
mod boot;
pub mod console;
pub mod debug;
pub mod logger;
pub mod memory;
#[macro_use]
pub mod panic;
pub mod power;
#[macro_use]
pub mod print;
pub mod recovery;
pub mod selftest;
pub mod sync;
pub mod syscall;
pub mod trap;

pub use utils;

/// The kernel's name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
/// Current kernel version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// An inner function is required to ensure everything in scope is dropped before halt.
///
/// Brings up the boot contract (§3, `DESIGN.md`): the GDT/TSS/IDT and interrupt
/// routing, the frame allocator's arena, and the boot page directory, then turns on
/// paging. From there on, every fault the CPU raises goes through [`trap`]'s dispatcher.
fn kernel_main_inner() {
	arch::init();
	println!("Boot {NAME} version {VERSION}");

	println!("Setup memory management");
	memory::frame::init();
	memory::vmem::init_boot_pd();
	memory::vmem::enable_paging();

	// Perform kernel self-tests
	#[cfg(test)]
	kernel_selftest();
}

/// This is the main function of the Rust source code, responsible for the
/// initialization of the kernel.
///
/// When calling this function, the CPU must be in Protected Mode with the GDT loaded
/// with space for the Task State Segment (the Multiboot2 bootloader contract this
/// crate's [`boot`] entry point relies on).
#[unsafe(no_mangle)]
pub extern "C" fn kernel_main() -> ! {
	kernel_main_inner();
	power::halt();
}
