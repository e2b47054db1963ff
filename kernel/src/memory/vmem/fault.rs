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

//! Page-fault resolution: the copy-on-write path consulted first by the trap dispatcher
//! (§4.2 routing rank 1).

use super::{entry_frame, make_entry, PageDirectory, VM_USERHI, VM_USERLO, P, U, W};
use crate::memory::{frame, VirtAddr};
use utils::limits::PAGE_SIZE;

/// Resolves a page fault at `addr` against `pd`, if it is a copy-on-write fault this crate
/// owns. Returns `true` if handled (the dispatcher returns to the faulting instruction,
/// which now succeeds); `false` if the fault is outside the user window, hits an
/// unmapped slot, or is a genuine protection violation the dispatcher must reflect.
pub fn handle(pd: &mut PageDirectory, addr: usize) -> bool {
	if addr < VM_USERLO.0 || addr >= VM_USERHI.0 {
		return false;
	}
	let v = VirtAddr(addr).down_align_to(PAGE_SIZE);
	let Ok(Some(entry_ptr)) = super::walk(pd, v, true) else {
		return false;
	};
	let ptr = entry_ptr.as_ptr();
	let entry = unsafe { *ptr };
	let nominal_write = entry & super::SYS_WRITE != 0;
	if entry & W != 0 || !nominal_write {
		// Either already writable (not a COW fault) or genuinely not permitted: let the
		// dispatcher reflect it.
		return false;
	}
	let frame_addr = entry_frame(entry);
	let shared = frame::is_zero(frame_addr) || frame::refcount(frame_addr) > 1;
	let new_frame = if shared {
		let Ok(dst) = frame::alloc() else {
			// Out of memory: the dispatcher reflects this as an unhandled fault, which the
			// process collaborator is expected to turn into an OOM kill.
			return false;
		};
		if !frame::is_zero(frame_addr) {
			let src_ptr: *const u8 = frame_addr.kernel_to_virtual().expect("frame outside kernel identity map").as_ptr();
			let dst_ptr: *mut u8 = dst.kernel_to_virtual().expect("frame outside kernel identity map").as_ptr();
			unsafe {
				core::ptr::copy_nonoverlapping(src_ptr, dst_ptr, PAGE_SIZE);
			}
			frame::decref(frame_addr);
		}
		dst
	} else {
		frame_addr
	};
	// Nominal SYS_RW is cleared: the COW bookkeeping is no longer needed once the slot is
	// physically writable.
	unsafe {
		*ptr = make_entry(new_frame, W | P | U);
	}
	super::map::invalidate(pd, v, PAGE_SIZE);
	true
}
