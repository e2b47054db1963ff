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

//! Mapping operations on a page directory: install, tear down and reclassify user
//! mappings, and keep the TLB consistent with whichever of those the directory currently
//! loaded in CR3 is affected by (§4.8).
//!
//! Every operation here works in terms of the refcounted frame contract in
//! [`crate::memory::frame`]: a frame is incremented before it is stored into a slot and
//! decremented when a slot stops referencing it, in that order, so replacing a slot with
//! a frame it already holds elsewhere in the same directory never observes a spurious
//! zero in between.

use super::{
	entry_frame, is_zero_entry, make_entry, pdx, pte_zero, ptx, walk, PageDirectory, Table, A,
	P, PTSIZE, SYS_RW, SYS_WRITE, U, W,
};
use crate::{
	arch::x86,
	memory::{frame, PhysAddr, VirtAddr},
};
use core::ptr::NonNull;
use utils::{errno::AllocResult, limits::PAGE_SIZE};

/// Returns the physical address backing `pd` itself, used to tell whether it is the
/// directory currently loaded in CR3.
fn pd_phys(pd: &PageDirectory) -> PhysAddr {
	VirtAddr(pd as *const Table as usize)
		.kernel_to_physical()
		.expect("page directory outside the kernel identity map")
}

/// Invalidates the TLB entries covering `[start, start + size)` in `pd`, per §4.8: a
/// no-op if `pd` is not the directory currently loaded in CR3 (nothing in the TLB can
/// reference it), a single `invlpg` for one page, a full CR3 reload for a larger span.
pub(super) fn invalidate(pd: &PageDirectory, start: VirtAddr, size: usize) {
	let phys = pd_phys(pd);
	if phys.0 != x86::get_cr3() {
		return;
	}
	if size <= PAGE_SIZE {
		unsafe {
			x86::invlpg(start.0);
		}
	} else {
		unsafe {
			x86::set_cr3(phys.0);
		}
	}
}

/// Maps `v` to `frame_addr` in `pd` with nominal permissions `nom_perm` (a mask of
/// [`super::SYS_READ`]/[`super::SYS_WRITE`]), demand-allocating the backing page table if
/// needed.
///
/// The hardware `W` bit is set only if `nom_perm` grants write: a fresh mapping is never
/// itself a copy-on-write target (that only arises from [`super::copy::copy`]).
///
/// If a page table has to be allocated and the allocator is out of frames, returns
/// `Ok(None)` rather than failing the whole address space: the caller (typically a
/// demand-paging fault handler) decides whether that is fatal.
pub fn insert(
	pd: &mut PageDirectory,
	frame_addr: PhysAddr,
	v: VirtAddr,
	nom_perm: u32,
) -> AllocResult<Option<NonNull<u32>>> {
	let entry_ptr = match walk(pd, v, true) {
		Ok(Some(ptr)) => ptr,
		Ok(None) | Err(_) => return Ok(None),
	};
	frame::incref(frame_addr);
	let ptr = entry_ptr.as_ptr();
	let old = unsafe { *ptr };
	if !is_zero_entry(old) {
		frame::decref(entry_frame(old));
	}
	let mut flags = P | U | A | (nom_perm & SYS_RW);
	if nom_perm & SYS_WRITE != 0 {
		flags |= W;
	}
	unsafe {
		*ptr = make_entry(frame_addr, flags);
	}
	invalidate(pd, v, PAGE_SIZE);
	Ok(Some(entry_ptr))
}

/// Unmaps `[start, start + size)` from `pd`, decrementing each mapped frame's refcount
/// and resetting the slot to [`pte_zero`]. A page table whose entire 4 MiB region falls
/// inside the removed range is freed outright instead of zeroed entry-by-entry.
pub fn remove(pd: &mut PageDirectory, start: VirtAddr, size: usize) {
	let end = start.0 + size;
	let mut addr = start.0;
	while addr < end {
		let pd_idx = pdx(VirtAddr(addr));
		let region_start = pd_idx * PTSIZE;
		let region_end = region_start + PTSIZE;
		if is_zero_entry(pd.0[pd_idx]) {
			addr = region_end.min(end);
			continue;
		}
		if addr <= region_start && end >= region_end {
			super::free_ptab(entry_frame(pd.0[pd_idx]));
			pd.0[pd_idx] = pte_zero();
			addr = region_end;
		} else {
			let span_end = region_end.min(end);
			let table = unsafe { super::table_at(entry_frame(pd.0[pd_idx])) };
			let mut a = addr;
			while a < span_end {
				let idx = ptx(VirtAddr(a));
				if !is_zero_entry(table.0[idx]) {
					frame::decref(entry_frame(table.0[idx]));
					table.0[idx] = pte_zero();
				}
				a += PAGE_SIZE;
			}
			addr = span_end;
		}
	}
	invalidate(pd, start, size);
}

/// Updates the nominal permissions of every page in `[start, start + size)`, force-
/// allocating the backing page table (and, for a slot still at [`pte_zero`], a read-only
/// mapping of the shared zero frame) rather than skipping unmapped ground.
///
/// The hardware `W` bit is only ever set alongside a granted [`super::SYS_WRITE`] when
/// the underlying frame is both real and exclusively owned (refcount `1`); a shared frame,
/// or the zero frame itself, stays hardware read-only so the next write takes the
/// copy-on-write fault in §4.6 instead of mutating a frame another mapping still observes.
pub fn setperm(pd: &mut PageDirectory, start: VirtAddr, size: usize, nom_perm: u32) {
	let end = start.0 + size;
	let mut addr = start.0;
	while addr < end {
		let v = VirtAddr(addr);
		if let Ok(Some(entry_ptr)) = walk(pd, v, true) {
			let ptr = entry_ptr.as_ptr();
			let old = unsafe { *ptr };
			let zero = is_zero_entry(old);
			let frame_addr = if zero { frame::zero() } else { entry_frame(old) };
			let mut flags = P | U | A | (nom_perm & SYS_RW);
			if !zero && nom_perm & SYS_WRITE != 0 && frame::refcount(frame_addr) == 1 {
				flags |= W;
			}
			unsafe {
				*ptr = make_entry(frame_addr, flags);
			}
		}
		addr += PAGE_SIZE;
	}
	invalidate(pd, start, size);
}
