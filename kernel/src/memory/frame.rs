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

//! Physical frame allocator.
//!
//! The trap/VM core treats frame allocation as an external collaborator's contract
//! (refcounting, a shared `ZERO` frame, `mem_alloc`/`mem_free` semantics): this module is
//! a minimal concrete implementation of that contract, standing in for a production
//! buddy/bitmap allocator with multiple zones. It exists so this crate is a buildable,
//! testable binary rather than depending on an unimplemented trait; see `DESIGN.md`.
//!
//! Frame 0 is reserved as the shared [`zero`] frame: zero-filled (statics start zeroed),
//! refcount pinned at 1, never linked into the free list.

use crate::memory::{PhysAddr, VirtAddr};
use crate::sync::spin::IntSpin;
use core::ptr::addr_of;
use utils::{errno::AllocResult, limits::PAGE_SIZE};

/// The number of frames carved out of the static arena.
///
/// Sized to comfortably hold the boot page directory, the self-test's throwaway address
/// spaces, and the `#[cfg(test)]` scenarios, without making the binary unreasonably large.
pub const FRAMES_COUNT: usize = 1024;

/// Sentinel marking the end of the free list / an unset field.
const NONE: u32 = u32::MAX;

/// The identifier of the permanent zero frame.
const ZERO_ID: u32 = 0;

/// Backing storage for every frame handed out by this allocator, page-aligned so that
/// frame `i` starts at `ARENA + i * PAGE_SIZE`.
#[repr(align(4096))]
struct Arena([u8; FRAMES_COUNT * PAGE_SIZE]);

static mut ARENA: Arena = Arena([0; FRAMES_COUNT * PAGE_SIZE]);

/// Per-frame bookkeeping.
#[derive(Clone, Copy)]
struct Meta {
	/// Number of distinct PTE/PDE slots referencing this frame. `0` for a free frame.
	refcount: u32,
	/// Index of the next free frame, or [`NONE`].
	next_free: u32,
}

impl Meta {
	const EMPTY: Self = Self {
		refcount: 0,
		next_free: NONE,
	};
}

struct State {
	meta: [Meta; FRAMES_COUNT],
	free_head: u32,
	initialized: bool,
}

impl State {
	const fn new() -> Self {
		Self {
			meta: [Meta::EMPTY; FRAMES_COUNT],
			free_head: NONE,
			initialized: false,
		}
	}

	/// Rebuilds the initial state: frame 0 pinned as the zero frame, frames `1..COUNT`
	/// chained into the free list.
	fn reset(&mut self) {
		self.meta = [Meta::EMPTY; FRAMES_COUNT];
		self.meta[ZERO_ID as usize].refcount = 1;
		for i in 1..FRAMES_COUNT {
			self.meta[i].next_free = if i + 1 < FRAMES_COUNT {
				(i + 1) as u32
			} else {
				NONE
			};
		}
		self.free_head = if FRAMES_COUNT > 1 { 1 } else { NONE };
		self.initialized = true;
	}
}

static STATE: IntSpin<State> = IntSpin::new(State::new());

/// Returns the base virtual address of the arena.
fn base() -> VirtAddr {
	VirtAddr(addr_of!(ARENA) as usize)
}

/// Converts a frame identifier into its physical address.
fn id_to_addr(id: u32) -> PhysAddr {
	base()
		.kernel_to_physical()
		.expect("frame arena is outside the kernel identity map")
		+ id as usize * PAGE_SIZE
}

/// Converts a physical address into a frame identifier, if it belongs to this arena and
/// is page-aligned.
fn addr_to_id(addr: PhysAddr) -> Option<u32> {
	let arena_phys = base().kernel_to_physical()?;
	let off = addr.0.checked_sub(arena_phys.0)?;
	if off % PAGE_SIZE != 0 {
		return None;
	}
	let id = off / PAGE_SIZE;
	(id < FRAMES_COUNT).then_some(id as u32)
}

/// Initializes the allocator. Must be called once, early at boot, before any other
/// function in this module.
pub fn init() {
	STATE.lock().reset();
}

/// Returns the physical address of the shared zero frame.
///
/// The zero frame is never handed out by [`alloc`] and never freed; it backs every
/// `PTE_ZERO` entry.
pub fn zero() -> PhysAddr {
	id_to_addr(ZERO_ID)
}

/// Tells whether `addr` is the zero frame.
pub fn is_zero(addr: PhysAddr) -> bool {
	addr_to_id(addr) == Some(ZERO_ID)
}

/// Allocates a free frame with an initial refcount of `1`.
///
/// Returns [`core::alloc::AllocError`] if the free list is exhausted.
pub fn alloc() -> AllocResult<PhysAddr> {
	let mut state = STATE.lock();
	let id = state.free_head;
	if id == NONE {
		return Err(core::alloc::AllocError);
	}
	let next = state.meta[id as usize].next_free;
	state.free_head = next;
	state.meta[id as usize] = Meta {
		refcount: 1,
		next_free: NONE,
	};
	Ok(id_to_addr(id))
}

/// Increments the refcount of the frame at `addr`.
///
/// No-op on the zero frame, whose refcount is pinned.
pub fn incref(addr: PhysAddr) {
	let Some(id) = addr_to_id(addr) else {
		return;
	};
	if id == ZERO_ID {
		return;
	}
	STATE.lock().meta[id as usize].refcount += 1;
}

/// Decrements the refcount of the frame at `addr`, freeing it back to the free list if it
/// reaches zero.
///
/// No-op on the zero frame. Returns `true` if the frame was freed.
pub fn decref(addr: PhysAddr) -> bool {
	let Some(id) = addr_to_id(addr) else {
		return false;
	};
	if id == ZERO_ID {
		return false;
	}
	let mut state = STATE.lock();
	let meta = &mut state.meta[id as usize];
	debug_assert!(meta.refcount > 0, "decref of an already-free frame");
	meta.refcount = meta.refcount.saturating_sub(1);
	if meta.refcount == 0 {
		let head = state.free_head;
		state.meta[id as usize].next_free = head;
		state.free_head = id;
		true
	} else {
		false
	}
}

/// Returns the current refcount of the frame at `addr`, or `0` if `addr` is not a frame
/// of this arena.
pub fn refcount(addr: PhysAddr) -> u32 {
	let Some(id) = addr_to_id(addr) else {
		return 0;
	};
	STATE.lock().meta[id as usize].refcount
}

#[cfg(test)]
pub(crate) mod test_support {
	use super::*;

	/// Discards all allocations and rebuilds a fresh free list, so each scenario in
	/// [`crate::memory::vmem`]'s tests starts from a known-empty allocator.
	pub fn reset() {
		STATE.lock().reset();
	}

	/// Drains the free list down to nothing, simulating exhaustion (scenario 1's "steal
	/// the free list"): every remaining free frame is allocated and immediately leaked,
	/// so the next [`alloc`] call observes [`core::alloc::AllocError`].
	pub fn exhaust_free_list() {
		while alloc().is_ok() {}
	}
}
