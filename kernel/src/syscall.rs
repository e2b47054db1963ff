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

//! The syscall shim (§4.9, C7): command decoding and the user-memory access discipline.
//!
//! The vector delivers a command word in `rax` and five arguments in `rbx`..`rdi`,
//! decoded by [`Command::decode`] into a typed `{op, flags, args}` triple (§4.9a). Most
//! of what this module does is call into [`crate::memory::vmem`] (`COPY`/`ZERO`/`PERM`/
//! `MERGE`/`SNAP`) or move bytes to and from the calling process through [`usercopy`].
//!
//! The parent/child rendezvous and migration semantics `PUT`/`GET`/`RET` ultimately serve
//! belong to the process collaborator, which is expected to register [`set_child_pd_hook`]
//! and [`set_child_rpd_hook`] before any process runs; left unset, the operations that
//! need a peer address space fail with `ESRCH` rather than dereferencing a null hook.

use crate::{
	arch::x86::idt::IntFrame,
	memory::{
		vmem::{self, PageDirectory},
		VirtAddr,
	},
	trap,
};
use core::ptr::NonNull;
use utils::{
	bytes,
	errno::{EResult, Errno},
};

/// A syscall command (§6): `CPUTS` writes a user string to the console; `PUT`/`GET`
/// move a register block or, combined with the flags below, a range of pages, between
/// the caller and a child; `RET` resumes a child previously suspended by `PUT`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
	Cputs,
	Put,
	Get,
	Ret,
}

impl Op {
	fn decode(raw: usize) -> EResult<Self> {
		Ok(match raw {
			0 => Self::Cputs,
			1 => Self::Put,
			2 => Self::Get,
			3 => Self::Ret,
			_ => return Err(Errno::EINVAL),
		})
	}
}

/// Flag bits carried in the fifth argument register, combined freely with one another.
pub mod flags {
	/// Transfer the caller's register block along with (or instead of) a page range.
	pub const REGS: usize = 1 << 0;
	/// Duplicate a page range into the child, copy-on-write (§4.7 `copy`).
	pub const COPY: usize = 1 << 1;
	/// Unmap a page range, reverting it to demand-zero.
	pub const ZERO: usize = 1 << 2;
	/// Change the nominal permissions of a page range (§4.5 `setperm`).
	pub const PERM: usize = 1 << 3;
	/// Three-way merge a page range back from the child (§4.7 `merge`).
	pub const MERGE: usize = 1 << 4;
	/// (Re)capture the child's reference snapshot used by a later `MERGE`.
	pub const SNAP: usize = 1 << 5;
	/// Start the child running at the transferred register block, rather than suspending it.
	pub const START: usize = 1 << 6;
	/// Grant nominal read access (with [`PERM`]).
	pub const READ: usize = 1 << 7;
	/// Grant nominal write access (with [`PERM`]).
	pub const WRITE: usize = 1 << 8;
}

/// A decoded syscall command (§4.9a).
///
/// `args` is the raw five-register payload, in GPR order (`rbx`, `rcx`, `rdx`, `rsi`,
/// `rdi`): source address, destination address, size, child index, flags. A single
/// "child index" slot stands in for the spec's separate child-index/node-number pair;
/// this core targets one node, so the distinction does not arise (see `DESIGN.md`).
pub struct Command {
	pub op: Op,
	pub flags: usize,
	pub args: [usize; 5],
}

impl Command {
	/// Decodes the command delivered in `frame`'s registers.
	pub fn decode(frame: &IntFrame) -> EResult<Self> {
		let op = Op::decode(frame.get_syscall_id())?;
		let args = [
			frame.get_syscall_arg(0),
			frame.get_syscall_arg(1),
			frame.get_syscall_arg(2),
			frame.get_syscall_arg(3),
			frame.get_syscall_arg(4),
		];
		Ok(Self {
			op,
			flags: args[4],
			args,
		})
	}

	fn src(&self) -> VirtAddr {
		VirtAddr(self.args[0])
	}

	fn dst(&self) -> VirtAddr {
		VirtAddr(self.args[1])
	}

	fn size(&self) -> usize {
		self.args[2]
	}

	fn child(&self) -> usize {
		self.args[3]
	}
}

/// Direction of a [`usercopy`].
#[derive(Clone, Copy)]
pub enum Direction {
	ToUser,
	FromUser,
}

/// Copies `size` bytes between `kernel_ptr` and `user_ptr`, per the discipline in §4.9.
///
/// On any failure — the range falls outside `[VM_USERLO, VM_USERHI)`, the arithmetic
/// wraps, or a fault lands inside the copy itself — this function does not return: it
/// rewrites `frame`'s `int`/`code` to the cause (for the bounds check, a synthesized
/// page fault; for an in-flight fault, whatever the recovery hook observed) and reflects
/// `frame` to the parent exactly as [`trap::reflect`] would have for the user's own
/// trapped instruction. The caller must hold no lock across this call: there is no path
/// back to it to release one.
pub fn usercopy(frame: &mut IntFrame, direction: Direction, kernel_ptr: *mut u8, user_ptr: usize, size: usize) {
	let Some(end) = user_ptr.checked_add(size) else {
		frame.int = crate::arch::x86::idt::T_PGFLT as u32;
		frame.code = 0;
		trap::reflect(frame);
	};
	if user_ptr < vmem::VM_USERLO.0 || end > vmem::VM_USERHI.0 {
		frame.int = crate::arch::x86::idt::T_PGFLT as u32;
		frame.code = 0;
		trap::reflect(frame);
	}
	let result = crate::recover!({
		match direction {
			Direction::ToUser => unsafe {
				core::ptr::copy_nonoverlapping(kernel_ptr, user_ptr as *mut u8, size)
			},
			Direction::FromUser => unsafe {
				core::ptr::copy_nonoverlapping(user_ptr as *const u8, kernel_ptr, size)
			},
		}
	});
	if let Err((vector, code)) = result {
		frame.int = vector as u32;
		frame.code = code;
		trap::reflect(frame);
	}
}

/// Resolves the page directory of child/node `index`, registered by the process
/// collaborator. `None` until one is registered.
static mut CHILD_PD: Option<fn(usize) -> Option<NonNull<PageDirectory>>> = None;

/// Resolves the reference-snapshot page directory of child/node `index`, used by
/// `MERGE` (as the unmodified "before" image) and refreshed by `SNAP`.
static mut CHILD_RPD: Option<fn(usize) -> Option<NonNull<PageDirectory>>> = None;

/// Registers the child-page-directory lookup used by `COPY`/`MERGE`/`SNAP`.
pub fn set_child_pd_hook(hook: Option<fn(usize) -> Option<NonNull<PageDirectory>>>) {
	unsafe {
		CHILD_PD = hook;
	}
}

/// Registers the reference-snapshot lookup used by `MERGE`/`SNAP`.
pub fn set_child_rpd_hook(hook: Option<fn(usize) -> Option<NonNull<PageDirectory>>>) {
	unsafe {
		CHILD_RPD = hook;
	}
}

/// Borrows the page directory the current trap is running against, set by
/// [`trap::set_current_pd`].
fn current_pd() -> EResult<NonNull<PageDirectory>> {
	unsafe { trap::current_pd() }.ok_or(Errno::ESRCH)
}

fn child_pd(index: usize) -> EResult<NonNull<PageDirectory>> {
	let hook = unsafe { CHILD_PD }.ok_or(Errno::ESRCH)?;
	hook(index).ok_or(Errno::ESRCH)
}

fn child_rpd(index: usize) -> EResult<NonNull<PageDirectory>> {
	let hook = unsafe { CHILD_RPD }.ok_or(Errno::ESRCH)?;
	hook(index).ok_or(Errno::ESRCH)
}

/// Applies the `PERM`/`ZERO`/`COPY`/`MERGE`/`SNAP` flags of `cmd` against the current
/// address space. Independent of `cmd.op`: any command may carry any subset of them.
fn apply_flags(cmd: &Command) -> EResult<()> {
	let mut pd = current_pd()?;
	let pd = unsafe { pd.as_mut() };
	if cmd.flags & flags::PERM != 0 {
		let mut nom_perm = 0;
		if cmd.flags & flags::READ != 0 {
			nom_perm |= vmem::SYS_READ;
		}
		if cmd.flags & flags::WRITE != 0 {
			nom_perm |= vmem::SYS_WRITE;
		}
		vmem::map::setperm(pd, cmd.src(), cmd.size(), nom_perm);
	}
	if cmd.flags & flags::ZERO != 0 {
		vmem::map::remove(pd, cmd.src(), cmd.size());
	}
	if cmd.flags & flags::COPY != 0 {
		let mut dpd = child_pd(cmd.child())?;
		vmem::copy::copy(pd, cmd.src(), unsafe { dpd.as_mut() }, cmd.dst(), cmd.size()).map_err(|_| Errno::ENOMEM)?;
	}
	if cmd.flags & flags::SNAP != 0 {
		let mut rpd = child_rpd(cmd.child())?;
		vmem::map::remove(unsafe { rpd.as_mut() }, cmd.src(), cmd.size());
		vmem::copy::copy(pd, cmd.src(), unsafe { rpd.as_mut() }, cmd.src(), cmd.size()).map_err(|_| Errno::ENOMEM)?;
	}
	if cmd.flags & flags::MERGE != 0 {
		let mut rpd = child_rpd(cmd.child())?;
		let mut spd = child_pd(cmd.child())?;
		vmem::copy::merge(unsafe { rpd.as_mut() }, unsafe { spd.as_mut() }, cmd.src(), pd, cmd.dst(), cmd.size())
			.map_err(|_| Errno::ENOMEM)?;
	}
	Ok(())
}

/// Writes the user string at `[cmd.src(), cmd.src() + cmd.size())` to the console, in
/// bounded chunks so no allocation is needed for an arbitrarily long buffer.
fn cputs(frame: &mut IntFrame, cmd: &Command) {
	const CHUNK: usize = 256;
	let mut buf = [0u8; CHUNK];
	let mut off = 0;
	while off < cmd.size() {
		let n = CHUNK.min(cmd.size() - off);
		usercopy(frame, Direction::FromUser, buf.as_mut_ptr(), cmd.src().0 + off, n);
		crate::console::write(&buf[..n]);
		off += n;
	}
}

/// Moves the caller's register block to or from the user pointer in `cmd.src()`, if
/// `REGS` is set.
fn transfer_regs(frame: &mut IntFrame, cmd: &Command, to_user: bool) {
	if cmd.flags & flags::REGS == 0 {
		return;
	}
	let mut local = frame.clone();
	let ptr = bytes::as_bytes_mut(&mut local).as_mut_ptr();
	let size = core::mem::size_of::<IntFrame>();
	let direction = if to_user { Direction::ToUser } else { Direction::FromUser };
	usercopy(frame, direction, ptr, cmd.src().0, size);
	if !to_user {
		*frame = local;
	}
}

/// Entry point called by [`crate::trap`]'s dispatcher for the syscall vector (§4.2 rank
/// 4). Decodes the command, applies its flags, then sets the return value in `rax`.
pub fn handle(frame: &mut IntFrame) {
	let cmd = match Command::decode(frame) {
		Ok(cmd) => cmd,
		Err(e) => {
			frame.set_syscall_return(Err(e));
			return;
		}
	};
	let result: EResult<usize> = apply_flags(&cmd).and_then(|()| match cmd.op {
		Op::Cputs => {
			cputs(frame, &cmd);
			Ok(0)
		}
		Op::Put => {
			transfer_regs(frame, &cmd, true);
			Ok(0)
		}
		Op::Get => {
			transfer_regs(frame, &cmd, false);
			Ok(0)
		}
		Op::Ret => Ok(0),
	});
	frame.set_syscall_return(result);
}
