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

//! Address-space duplication and the three-way merge used to fold a speculatively
//! diverged address space back into its parent (§4.7).

use super::{entry_frame, is_zero_entry, make_entry, pdx, pte_zero, table_at, PageDirectory, P, PTSIZE, SYS_WRITE, U, W};
use crate::memory::{frame, PhysAddr, VirtAddr};
use core::ptr::NonNull;
use utils::{errno::AllocResult, limits::PAGE_SIZE};

/// Number of 32-bit words in one page, the granularity [`merge`]'s conflict detection
/// operates at.
const WORDS_PER_PAGE: usize = PAGE_SIZE / 4;

/// Borrows the contents of the frame at `addr` as an array of words.
fn page_words<'a>(addr: PhysAddr) -> &'a [u32; WORDS_PER_PAGE] {
	let ptr: *const [u32; WORDS_PER_PAGE] = addr
		.kernel_to_virtual()
		.expect("frame outside kernel identity map")
		.as_ptr();
	unsafe { &*ptr }
}

/// Mutably borrows the contents of the frame at `addr` as an array of words.
fn page_words_mut<'a>(addr: PhysAddr) -> &'a mut [u32; WORDS_PER_PAGE] {
	let ptr: *mut [u32; WORDS_PER_PAGE] = addr
		.kernel_to_virtual()
		.expect("frame outside kernel identity map")
		.as_ptr();
	unsafe { &mut *ptr }
}

/// Duplicates the mappings in `[sv, sv + size)` of `spd` into `[dv, dv + size)` of `dpd`.
/// `sv`, `dv` and `size` must be 4 MiB aligned (one unit per page-directory entry).
///
/// Every page table touched by the range is shared between source and destination: the
/// source's own entries are rewritten to be copy-on-write at the same time (clearing
/// hardware `W`, recording nominal `SYS_WRITE`) so that a write on either side, from this
/// point on, takes the fault in [`super::fault::handle`] rather than mutating a page the
/// other side still observes.
///
/// Returns `Err` if a page-table frame cannot be allocated; the destination range is left
/// partially populated and the caller is expected to tear it down via
/// [`super::map::remove`].
pub fn copy(spd: &mut PageDirectory, sv: VirtAddr, dpd: &mut PageDirectory, dv: VirtAddr, size: usize) -> AllocResult<()> {
	debug_assert_eq!(sv.0 % PTSIZE, 0);
	debug_assert_eq!(dv.0 % PTSIZE, 0);
	debug_assert_eq!(size % PTSIZE, 0);
	let mut off = 0;
	while off < size {
		let spdx = pdx(VirtAddr(sv.0 + off));
		let dpdx = pdx(VirtAddr(dv.0 + off));
		let spde = spd.0[spdx];
		if is_zero_entry(spde) {
			dpd.0[dpdx] = spde;
			off += PTSIZE;
			continue;
		}
		let new_pt = frame::alloc()?;
		let src_table = unsafe { table_at(entry_frame(spde)) };
		for entry in src_table.0.iter_mut() {
			if is_zero_entry(*entry) {
				continue;
			}
			let writable = *entry & W != 0 || *entry & SYS_WRITE != 0;
			if writable {
				*entry = (*entry & !W) | SYS_WRITE;
			}
			frame::incref(entry_frame(*entry));
		}
		let dst_table = unsafe { table_at(new_pt) };
		dst_table.0.copy_from_slice(&src_table.0);
		dpd.0[dpdx] = make_entry(new_pt, spde);
		off += PTSIZE;
	}
	Ok(())
}

/// Reads the PTE for `v` in `pd`, treating an unpopulated page table (the PDE itself is
/// [`pte_zero`]) the same as an individually empty slot.
fn read_entry(pd: &mut PageDirectory, v: VirtAddr) -> u32 {
	match super::walk(pd, v, false) {
		Ok(Some(ptr)) => unsafe { *ptr.as_ptr() },
		_ => pte_zero(),
	}
}

/// Like [`read_entry`], but demand-allocates the page table if necessary, since the
/// destination may need a slot written into a region it never touched before.
fn dest_entry_ptr(pd: &mut PageDirectory, v: VirtAddr) -> AllocResult<NonNull<u32>> {
	super::walk(pd, v, true)?.ok_or(core::alloc::AllocError)
}

/// Breaks copy-on-write sharing on `*dptr` if it is currently read-shared (`P` set, `W`
/// clear, `SYS_WRITE` set) or unmapped, producing a private writable copy. Returns the
/// frame backing the (possibly new) private mapping.
///
/// An unpopulated slot (`is_zero_entry`) must never take the "already private" shortcut:
/// its address is [`super::pte_zero`], the shared global zero frame, and handing that
/// back as a writable target would let the caller write straight into it.
fn cow_break(dptr: NonNull<u32>, dpte: u32) -> AllocResult<PhysAddr> {
	if !is_zero_entry(dpte) && (dpte & W != 0 || dpte & SYS_WRITE == 0) {
		return Ok(entry_frame(dpte));
	}
	let frame_addr = entry_frame(dpte);
	let shared = frame::is_zero(frame_addr) || frame::refcount(frame_addr) > 1;
	let private = if shared {
		let new_frame = frame::alloc()?;
		if !frame::is_zero(frame_addr) {
			let src = page_words(frame_addr);
			let dst = page_words_mut(new_frame);
			dst.copy_from_slice(src);
			frame::decref(frame_addr);
		}
		new_frame
	} else {
		frame_addr
	};
	unsafe {
		*dptr.as_ptr() = make_entry(private, W | P | U);
	}
	Ok(private)
}

/// Three-way merges the changes `spd` made (relative to the unmodified reference snapshot
/// `rpd`) into `dpd`, over `[sv, sv + size)` in `r`/`s` and `[dv, dv + size)` in `d`.
///
/// `rpd` and `spd` are read at the same virtual addresses (the reference is a snapshot of
/// the source's own address space before it diverged); `dpd` is the separate destination
/// being folded into. `sv`, `dv` and `size` must be 4 MiB aligned.
pub fn merge(rpd: &mut PageDirectory, spd: &mut PageDirectory, sv: VirtAddr, dpd: &mut PageDirectory, dv: VirtAddr, size: usize) -> AllocResult<()> {
	debug_assert_eq!(sv.0 % PTSIZE, 0);
	debug_assert_eq!(dv.0 % PTSIZE, 0);
	debug_assert_eq!(size % PTSIZE, 0);
	let mut off = 0;
	while off < size {
		let region = VirtAddr(sv.0 + off);
		if rpd.0[pdx(region)] == spd.0[pdx(region)] {
			off += PTSIZE;
			continue;
		}
		let mut page_off = 0;
		while page_off < PTSIZE {
			let sva = VirtAddr(sv.0 + off + page_off);
			let dva = VirtAddr(dv.0 + off + page_off);
			merge_page(rpd, spd, sva, dpd, dva)?;
			page_off += PAGE_SIZE;
		}
		off += PTSIZE;
	}
	Ok(())
}

/// Resolves one 4 KiB slot of a [`merge`].
fn merge_page(rpd: &mut PageDirectory, spd: &mut PageDirectory, sv: VirtAddr, dpd: &mut PageDirectory, dv: VirtAddr) -> AllocResult<()> {
	let rpte = read_entry(rpd, sv);
	let spte = read_entry(spd, sv);
	let dptr = dest_entry_ptr(dpd, dv)?;
	let dpte = unsafe { *dptr.as_ptr() };

	if spte == rpte && dpte == rpte {
		return Ok(());
	}
	if dpte == rpte && spte != rpte {
		// Changed only at the source: adopt it via copy-on-write. Both sides end up
		// sharing the frame read-only.
		if !is_zero_entry(dpte) {
			frame::decref(entry_frame(dpte));
		}
		let sframe = entry_frame(spte);
		frame::incref(sframe);
		let writable = spte & W != 0 || spte & SYS_WRITE != 0;
		let shared_entry = if writable { (spte & !W) | SYS_WRITE } else { spte };
		if let Ok(Some(sptr)) = super::walk(spd, sv, false) {
			unsafe {
				*sptr.as_ptr() = shared_entry;
			}
		}
		unsafe {
			*dptr.as_ptr() = shared_entry;
		}
		return Ok(());
	}

	// Both sides changed: word-level merge.
	let dframe = cow_break(dptr, dpte)?;
	let r_words = page_words(entry_frame(rpte));
	let s_words = page_words(entry_frame(spte));
	let d_words = page_words_mut(dframe);
	for i in 0..WORDS_PER_PAGE {
		let (r, s, d) = (r_words[i], s_words[i], d_words[i]);
		if r == s {
			continue; // destination is canonical
		}
		if d == s {
			continue; // already the accepted value
		}
		if d == r {
			d_words[i] = s; // unchanged on the destination side: accept the source
			continue;
		}
		// Three distinct values: conflict. Discard both sides' changes to this page.
		crate::println!(
			"vmem: merge conflict at {:?}+{:#x}: ref={:#x} src={:#x} dst={:#x}, dropping page",
			dv,
			i * 4,
			r,
			s,
			d
		);
		frame::decref(dframe);
		unsafe {
			*dptr.as_ptr() = pte_zero();
		}
		return Ok(());
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::memory::frame::test_support;
	use crate::memory::vmem::{fault, init_boot_pd, map, new_pdir, VM_USERLO};

	/// Resets the allocator and returns a fresh page directory built from the boot
	/// template, so each scenario starts from a known-empty user range.
	fn fresh_pd() -> PhysAddr {
		test_support::reset();
		init_boot_pd();
		new_pdir().unwrap()
	}

	/// Scenario 5: a page shared by [`copy`] is copy-on-write on both sides; writing
	/// through one side's fault resolver splits it into a private frame without disturbing
	/// the other side.
	#[test_case]
	fn cow_round_trip() {
		let spd_frame = fresh_pd();
		let spd = unsafe { table_at(spd_frame) };
		let f = frame::alloc().unwrap();
		map::insert(spd, f, VM_USERLO, SYS_WRITE).unwrap();
		page_words_mut(f).fill(0xaaaaaaaa);

		let dpd_frame = new_pdir().unwrap();
		let dpd = unsafe { table_at(dpd_frame) };
		copy(spd, VM_USERLO, dpd, VM_USERLO, PTSIZE).unwrap();

		assert_eq!(page_words(entry_frame(read_entry(spd, VM_USERLO)))[0], 0xaaaaaaaa);
		assert_eq!(page_words(entry_frame(read_entry(dpd, VM_USERLO)))[0], 0xaaaaaaaa);
		assert_eq!(frame::refcount(f), 2);

		assert!(fault::handle(spd, VM_USERLO.0));
		let new_frame = entry_frame(read_entry(spd, VM_USERLO));
		assert_ne!(new_frame, f);
		assert_eq!(frame::refcount(new_frame), 1);
		assert_eq!(frame::refcount(f), 1);
		page_words_mut(new_frame).fill(0xbbbbbbbb);

		assert_eq!(page_words(entry_frame(read_entry(spd, VM_USERLO)))[0], 0xbbbbbbbb);
		assert_eq!(page_words(entry_frame(read_entry(dpd, VM_USERLO)))[0], 0xaaaaaaaa);
	}

	/// Scenario 6: a three-way merge folds disjoint word-level changes without a conflict,
	/// but a change both sides made to the same word drops the destination page to
	/// [`pte_zero`] instead of picking a winner.
	#[test_case]
	fn three_way_merge() {
		let rpd_frame = fresh_pd();
		let rpd = unsafe { table_at(rpd_frame) };
		let rf = frame::alloc().unwrap();
		map::insert(rpd, rf, VM_USERLO, SYS_WRITE).unwrap();
		page_words_mut(rf).fill(0);

		let spd_frame = new_pdir().unwrap();
		let spd = unsafe { table_at(spd_frame) };
		copy(rpd, VM_USERLO, spd, VM_USERLO, PTSIZE).unwrap();
		assert!(fault::handle(spd, VM_USERLO.0));
		let sframe = entry_frame(read_entry(spd, VM_USERLO));
		let s_words = page_words_mut(sframe);
		s_words[0] = 0xa;
		s_words[1] = 0xa;

		let dpd_frame = new_pdir().unwrap();
		let dpd = unsafe { table_at(dpd_frame) };
		copy(rpd, VM_USERLO, dpd, VM_USERLO, PTSIZE).unwrap();
		assert!(fault::handle(dpd, VM_USERLO.0));
		let dframe = entry_frame(read_entry(dpd, VM_USERLO));
		page_words_mut(dframe)[2] = 0xb;

		merge(rpd, spd, VM_USERLO, dpd, VM_USERLO, PTSIZE).unwrap();
		let merged = page_words(entry_frame(read_entry(dpd, VM_USERLO)));
		assert_eq!(merged[0], 0xa);
		assert_eq!(merged[1], 0xa);
		assert_eq!(merged[2], 0xb);
		assert_eq!(merged[3], 0);

		// Source also changes the word the destination changed: conflict.
		page_words_mut(sframe)[2] = 0xc;
		let dpd2_frame = new_pdir().unwrap();
		let dpd2 = unsafe { table_at(dpd2_frame) };
		copy(rpd, VM_USERLO, dpd2, VM_USERLO, PTSIZE).unwrap();
		assert!(fault::handle(dpd2, VM_USERLO.0));
		page_words_mut(entry_frame(read_entry(dpd2, VM_USERLO)))[2] = 0xb;

		merge(rpd, spd, VM_USERLO, dpd2, VM_USERLO, PTSIZE).unwrap();
		assert!(is_zero_entry(read_entry(dpd2, VM_USERLO)));
	}
}
