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

//! Helpers to view arbitrary `Sized` values as raw byte slices.

/// Marker trait for types whose every bit pattern is a valid value, safe to reinterpret as raw
/// bytes.
///
/// # Safety
///
/// Implementors must not contain padding, pointers, or niches that would make an arbitrary byte
/// pattern unsound to read back as `Self`.
pub unsafe trait AnyRepr: Sized {}

unsafe impl AnyRepr for u8 {}
unsafe impl AnyRepr for u16 {}
unsafe impl AnyRepr for u32 {}
unsafe impl AnyRepr for u64 {}
unsafe impl AnyRepr for usize {}

/// Returns the given value's memory representation as a byte slice.
pub fn as_bytes<T: AnyRepr>(val: &T) -> &[u8] {
	unsafe { core::slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) }
}

/// Returns the given value's memory representation as a mutable byte slice.
pub fn as_bytes_mut<T: AnyRepr>(val: &mut T) -> &mut [u8] {
	unsafe { core::slice::from_raw_parts_mut(val as *mut T as *mut u8, size_of::<T>()) }
}
