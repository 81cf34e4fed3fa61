//! `prctl(2)` helpers for the process attributes the sandbox toggles.

use rustix::io::Errno;

use crate::last_errno;

/// Values for `PR_SET_DUMPABLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Dumpable {
    /// `SUID_DUMP_DISABLE`: no core dumps, not ptrace-attachable by other uids.
    Disable = 0,
    /// `SUID_DUMP_USER`: required to write our own uid/gid maps.
    User = 1,
}

fn prctl(option: libc::c_int, arg: libc::c_ulong) -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(option, arg, 0, 0, 0) };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

pub fn set_dumpable(d: Dumpable) -> Result<(), Errno> {
    prctl(libc::PR_SET_DUMPABLE, d as libc::c_ulong)
}

pub fn set_no_new_privs() -> Result<(), Errno> {
    prctl(libc::PR_SET_NO_NEW_PRIVS, 1)
}

/// Deliver `signo` to the calling thread when its parent dies.
pub fn set_pdeathsig(signo: libc::c_int) -> Result<(), Errno> {
    prctl(libc::PR_SET_PDEATHSIG, signo as libc::c_ulong)
}
