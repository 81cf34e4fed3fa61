//! Signal plumbing: `signalfd` cancellation sources and mask resets.

use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use rustix::io::Errno;

use crate::last_errno;

fn sigset(signals: &[libc::c_int]) -> libc::sigset_t {
    let mut set = MaybeUninit::<libc::sigset_t>::uninit();
    unsafe {
        libc::sigemptyset(set.as_mut_ptr());
        for &s in signals {
            libc::sigaddset(set.as_mut_ptr(), s);
        }
        set.assume_init()
    }
}

/// A nonblocking `signalfd` for a fixed set of signals.
///
/// The signals are blocked for the calling thread on creation, so threads
/// spawned afterwards inherit the mask.
#[derive(Debug)]
pub struct SignalFd {
    fd: OwnedFd,
}

impl SignalFd {
    pub fn new(signals: &[libc::c_int]) -> Result<Self, Errno> {
        let set = sigset(signals);
        let ret = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(Errno::from_raw_os_error(ret));
        }
        let fd = unsafe { libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        if fd < 0 {
            return Err(last_errno());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// `SIGINT` and `SIGTERM`, the signals treated as cancellation.
    pub fn interrupt() -> Result<Self, Errno> {
        Self::new(&[libc::SIGINT, libc::SIGTERM])
    }

    /// Read one pending signal, if any.
    pub fn read(&self) -> Result<Option<libc::c_int>, Errno> {
        let mut info = MaybeUninit::<libc::signalfd_siginfo>::uninit();
        let size = size_of::<libc::signalfd_siginfo>();
        let n = unsafe { libc::read(self.fd.as_raw_fd(), info.as_mut_ptr().cast(), size) };
        if n < 0 {
            let errno = last_errno();
            return if errno == Errno::AGAIN { Ok(None) } else { Err(errno) };
        }
        if n as usize != size {
            return Err(Errno::IO);
        }
        let info = unsafe { info.assume_init() };
        Ok(Some(info.ssi_signo as libc::c_int))
    }
}

impl AsFd for SignalFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl From<SignalFd> for OwnedFd {
    fn from(s: SignalFd) -> Self {
        s.fd
    }
}

/// Clear the signal mask of the calling thread.
///
/// Async-signal-safe; meant for `pre_exec` hooks and freshly forked children.
pub fn unblock_all() -> Result<(), Errno> {
    let set = sigset(&[]);
    let ret = unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) };
    if ret != 0 { Err(Errno::from_raw_os_error(ret)) } else { Ok(()) }
}

/// Messages written by the `SIGCONT` handler installed by [`setup_cont`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ContMessage {
    /// Sent by the expected parent.
    ExitRequested = 0,
    /// Sent by someone else after the expected parent went away.
    Orphaned = 1,
    /// No siginfo.
    Invalid = 2,
    /// Sent by someone else, parent still alive.
    BadPid = 3,
}

impl TryFrom<u8> for ContMessage {
    type Error = u8;

    fn try_from(b: u8) -> Result<Self, u8> {
        Ok(match b {
            0 => Self::ExitRequested,
            1 => Self::Orphaned,
            2 => Self::Invalid,
            3 => Self::BadPid,
            other => return Err(other),
        })
    }
}

static CONT_PPID: AtomicI32 = AtomicI32::new(-1);
static CONT_FD: AtomicI32 = AtomicI32::new(-1);

fn cont_write(msg: ContMessage) {
    let fd = CONT_FD.load(Ordering::Relaxed);
    let saved = unsafe { *libc::__errno_location() };
    let ret = unsafe { libc::write(fd, (&raw const msg).cast(), 1) };
    if ret == -1 && last_errno() != Errno::AGAIN {
        unsafe { libc::_exit(libc::EXIT_FAILURE) };
    }
    unsafe { *libc::__errno_location() = saved };
}

extern "C" fn cont_action(sig: libc::c_int, info: *mut libc::siginfo_t, _: *mut libc::c_void) {
    if sig != libc::SIGCONT || info.is_null() {
        cont_write(ContMessage::Invalid);
        return;
    }
    let ppid = CONT_PPID.load(Ordering::Relaxed);
    // SAFETY: SA_SIGINFO guarantees a valid siginfo_t for the duration of the handler.
    if unsafe { (*info).si_pid() } == ppid {
        cont_write(ContMessage::ExitRequested);
        return;
    }
    cont_write(ContMessage::BadPid);
    if unsafe { libc::getppid() } != ppid {
        cont_write(ContMessage::Orphaned);
    }
}

/// Install a `SIGCONT` handler that reports to `fd` whether the signal came
/// from `ppid`.
///
/// The handler only performs async-signal-safe calls. It may be installed
/// once per process; `fd` must stay open for as long as signals can arrive.
pub fn setup_cont(ppid: libc::pid_t, fd: RawFd) -> Result<(), Errno> {
    if CONT_PPID.load(Ordering::Relaxed) != -1 {
        return Err(Errno::BUSY);
    }

    let mut old = MaybeUninit::<libc::sigaction>::zeroed();
    if unsafe { libc::sigaction(libc::SIGCONT, std::ptr::null(), old.as_mut_ptr()) } != 0 {
        return Err(last_errno());
    }
    if unsafe { old.assume_init() }.sa_sigaction != libc::SIG_DFL {
        return Err(Errno::NOTRECOVERABLE);
    }

    CONT_PPID.store(ppid, Ordering::Relaxed);
    CONT_FD.store(fd, Ordering::Relaxed);

    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = cont_action as usize;
    action.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;
    unsafe { libc::sigemptyset(&mut action.sa_mask) };
    if unsafe { libc::sigaction(libc::SIGCONT, &action, std::ptr::null_mut()) } != 0 {
        let errno = last_errno();
        CONT_PPID.store(-1, Ordering::Relaxed);
        CONT_FD.store(-1, Ordering::Relaxed);
        return Err(errno);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cont_messages() {
        for m in [
            ContMessage::ExitRequested,
            ContMessage::Orphaned,
            ContMessage::Invalid,
            ContMessage::BadPid,
        ] {
            assert_eq!(ContMessage::try_from(m as u8), Ok(m));
        }
        assert_eq!(ContMessage::try_from(4), Err(4));
    }

    #[test]
    fn cont_from_parent() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) }, 0);
        let (r, w) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        // this process plays the parent
        setup_cont(std::process::id() as libc::pid_t, w.as_raw_fd()).unwrap();
        assert_eq!(setup_cont(1, w.as_raw_fd()), Err(Errno::BUSY));
        assert_eq!(unsafe { libc::kill(libc::getpid(), libc::SIGCONT) }, 0);

        let mut buf = [0xffu8; 1];
        let n = unsafe { libc::read(r.as_raw_fd(), buf.as_mut_ptr().cast(), 1) };
        assert_eq!(n, 1);
        assert_eq!(ContMessage::try_from(buf[0]), Ok(ContMessage::ExitRequested));
        // the handler stays installed for the rest of the process
        std::mem::forget(w);
    }
}
