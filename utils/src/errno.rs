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

//! Error codes returned by kernel operations.

use core::fmt;

/// A kernel error code, modeled after POSIX `errno` values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[allow(missing_docs)]
#[repr(i32)]
pub enum Errno {
	/// Bad address: the given user pointer does not resolve to a valid mapping.
	EFAULT = 14,
	/// Invalid argument.
	EINVAL = 22,
	/// Out of memory: the frame allocator could not satisfy the request.
	ENOMEM = 12,
	/// No such process.
	ESRCH = 3,
	/// I/O error.
	EIO = 5,
}

impl Errno {
	/// Returns the numeric value of the error, as used in syscall return values.
	pub const fn as_int(self) -> i32 {
		self as i32
	}
}

impl fmt::Display for Errno {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Self::EFAULT => "Bad address",
			Self::EINVAL => "Invalid argument",
			Self::ENOMEM => "Out of memory",
			Self::ESRCH => "No such process",
			Self::EIO => "I/O error",
		};
		write!(f, "{s}")
	}
}

/// Shorthand for constructing an `Err` wrapping an [`Errno`] variant.
#[macro_export]
macro_rules! errno {
	($variant:ident) => {
		Err($crate::errno::Errno::$variant)
	};
}

/// Result alias for operations that may fail with a kernel [`Errno`].
pub type EResult<T> = Result<T, Errno>;

/// Result alias for operations that may fail to allocate a physical frame.
///
/// Frame exhaustion is not a POSIX errno: the walker and mapping operations report it as a bare
/// allocation failure and let the caller translate it into whatever errno fits the call site.
pub type AllocResult<T> = Result<T, core::alloc::AllocError>;
