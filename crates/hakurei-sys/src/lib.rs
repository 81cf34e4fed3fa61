//! Low-level Linux plumbing for the hakurei sandbox.
//!
//! This crate provides thin wrappers around the kernel interfaces the sandbox
//! relies on that rustix does not cover. For standard syscalls, use rustix.
//!
//! ## Modules
//!
//! - **seccomp** - Seccomp-BPF filter compiler, loader and exporter
//! - **caps** - Capability sets, ambient and bounding set control
//! - **process** - `prctl` toggles (dumpable, no-new-privs, parent death signal)
//! - **signal** - `signalfd` cancellation sources
//! - **check** - Runtime system capability detection
//!
//! # Safety
//!
//! This crate contains raw syscall wrappers. Casts between integer types
//! are unavoidable when interfacing with the kernel ABI.

#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod caps;
pub mod check;
pub mod process;
pub mod seccomp;
pub mod signal;

pub use check::{CheckError, Kernel, SystemInfo, check};

#[inline]
pub fn last_errno() -> rustix::io::Errno {
    // SAFETY: __errno_location always returns valid thread-local pointer.
    rustix::io::Errno::from_raw_os_error(unsafe { *libc::__errno_location() })
}
