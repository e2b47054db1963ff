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

//! The memory is one of the main component of the system.
//!
//! This module handles the two collaborators the trap/VM core is built around:
//! - [`frame`]: the physical frame allocator (a refcounted arena standing in for the
//!   production buddy/bitmap allocator, see `DESIGN.md`)
//! - [`vmem`]: the page-directory walker, mapping operations, page-fault/COW resolution
//!   and the copy/merge engine
//!
//! The system's memory is divided in two chunks:
//! - Userspace: Virtual memory below `PROCESS_END`, used by the currently running process
//! - Kernelspace: Virtual memory above `KERNEL_BEGIN`, used by the kernel itself and shared across
//!   processes

use core::{
	fmt,
	mem::size_of,
	ops::{Add, Deref, DerefMut, Sub},
	ptr,
	ptr::NonNull,
};

pub mod frame;
pub mod vmem;

/// Address of the end of the virtual memory reserved to the process.
pub const PROCESS_END: VirtAddr = VirtAddr(0xc0000000);

/// Address of the beginning of the kernelspace.
pub const KERNEL_BEGIN: VirtAddr = PROCESS_END;

/// An address on physical memory.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PhysAddr(pub usize);

impl PhysAddr {
	/// Converts a physical address backing kernel state (frame arena, page
	/// directories/tables) to the virtual address it is mapped at.
	///
	/// The kernel range is identity-mapped (§3: the PDEs covering
	/// `[0, VM_USERLO) ∪ [VM_USERHI, 4 GiB)` are 4 MiB pages with `phys == virt`), so this
	/// is the identity function, guarded by the same range check `vmem::init_boot_pd`
	/// uses to decide which PDEs get built as identity maps in the first place. Returns
	/// `None` if `self` is not itself inside that range.
	pub fn kernel_to_virtual(self) -> Option<VirtAddr> {
		(self.0 >= KERNEL_BEGIN.0).then_some(VirtAddr(self.0))
	}
}

/// An address on virtual memory.
///
/// This would usually be represented by a pointer. However, in some cases we need to be able to
/// represent virtual addresses without having to dereference them.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct VirtAddr(pub usize);

impl<T> From<*const T> for VirtAddr {
	fn from(ptr: *const T) -> Self {
		Self(ptr as usize)
	}
}

impl<T> From<*mut T> for VirtAddr {
	fn from(ptr: *mut T) -> Self {
		Self(ptr as usize)
	}
}

impl<T> From<NonNull<T>> for VirtAddr {
	fn from(ptr: NonNull<T>) -> Self {
		Self(ptr.as_ptr() as usize)
	}
}

impl VirtAddr {
	/// Converts a kernel virtual address back to the physical address the identity map
	/// gives it. See [`PhysAddr::kernel_to_virtual`]. Returns `None` if `self` is outside
	/// the kernel range.
	pub fn kernel_to_physical(self) -> Option<PhysAddr> {
		(self.0 >= KERNEL_BEGIN.0).then_some(PhysAddr(self.0))
	}

	/// Returns a mutable pointer to the virtual address.
	///
	/// Underneath, this function uses [`ptr::with_exposed_provenance_mut`].
	pub fn as_ptr<T>(self) -> *mut T {
		ptr::with_exposed_provenance_mut(self.0)
	}
}

macro_rules! addr_impl {
	($name:ident) => {
		impl $name {
			/// Tells whether the pointer is null.
			pub fn is_null(self) -> bool {
				self.0 == 0
			}

			/// Tells whether the pointer is aligned to `align`.
			pub fn is_aligned_to(self, align: usize) -> bool {
				self.0 % align == 0
			}

			/// Computes and returns the next address to be aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn align_to(self, align: usize) -> Self {
				Self(self.0.next_multiple_of(align))
			}

			/// Computes and returns the previous address to be aligned to `align`.
			///
			/// If `self` is already aligned, the function returns `self`.
			pub fn down_align_to(self, align: usize) -> Self {
				Self(self.0 & !(align - 1))
			}
		}

		impl Deref for $name {
			type Target = usize;

			fn deref(&self) -> &Self::Target {
				&self.0
			}
		}

		impl DerefMut for $name {
			fn deref_mut(&mut self) -> &mut Self::Target {
				&mut self.0
			}
		}

		impl Add<usize> for $name {
			type Output = Self;

			/// Adds the given offset in bytes, wrapping on overflow.
			fn add(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_add(off))
			}
		}

		impl Sub<usize> for $name {
			type Output = Self;

			/// Subtracts the given offset in bytes, wrapping on overflow.
			fn sub(self, off: usize) -> Self::Output {
				Self(self.0.wrapping_sub(off))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
				const LEN: usize = size_of::<usize>() * 2;
				write!(fmt, "{:0LEN$x}", self.0)
			}
		}
	};
}

addr_impl!(PhysAddr);
addr_impl!(VirtAddr);
