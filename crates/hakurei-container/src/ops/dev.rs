use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{OpError, State, check_abs};
use crate::mount::{self, SOURCE_DEVPTS, SOURCE_MQUEUE, SOURCE_TMPFS_DEVTMPFS, bind_mount, mount_tmpfs, remount};
use crate::path::{ensure_file, mkdir_all, to_host, to_sysroot};

const DEVICES: [&str; 6] = ["null", "zero", "full", "random", "urandom", "tty"];

const LINKS: [(&str, &str); 6] = [
    ("/proc/self/fd/0", "stdin"),
    ("/proc/self/fd/1", "stdout"),
    ("/proc/self/fd/2", "stderr"),
    ("/proc/self/fd", "fd"),
    ("/proc/kcore", "core"),
    ("pts/ptmx", "ptmx"),
];

/// A fresh tmpfs holding a fixed subset of host devices, left read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DevOp {
    pub target: PathBuf,
    pub mqueue: bool,
}

impl DevOp {
    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.target)?;
        let pperm = state.params.parent_perm;
        let target = to_sysroot(&self.target);

        mount_tmpfs(
            SOURCE_TMPFS_DEVTMPFS,
            &target,
            libc::MS_NOSUID | libc::MS_NODEV,
            0,
            pperm,
        )
        .map_err(OpError::mount("mount devtmpfs on", &self.target))?;

        for name in DEVICES {
            let path = target.join(name);
            ensure_file(&path, 0o444, pperm).map_err(OpError::io("create", &path))?;
            bind_mount(&to_host(format!("/dev/{name}")), &path, 0)
                .map_err(OpError::mount("bind", &path))?;
        }
        for (dest, name) in LINKS {
            let path = target.join(name);
            symlink(dest, &path).map_err(OpError::io("create symlink", &path))?;
        }

        let pts = target.join("pts");
        for dir in [target.join("shm"), pts.clone()] {
            mkdir_all(&dir, pperm).map_err(OpError::io("create", &dir))?;
        }
        mount::mount(
            Some(SOURCE_DEVPTS),
            &pts,
            Some(c"devpts"),
            libc::MS_NOSUID | libc::MS_NOEXEC,
            Some(c"newinstance,ptmxmode=0666,mode=620"),
        )
        .map_err(OpError::mount("mount devpts on", &pts))?;

        if state
            .params
            .flags
            .contains(crate::params::HardeningFlags::ALLOW_TTY)
            && is_terminal(libc::STDOUT_FILENO)
        {
            let console = target.join("console");
            ensure_file(&console, 0o444, pperm).map_err(OpError::io("create", &console))?;
            let self_stdout = to_host("/proc/self/fd/1");
            let name = fs::read_link(&self_stdout).map_err(OpError::io("read", &self_stdout))?;
            bind_mount(&to_host(&name), &console, 0).map_err(OpError::mount("bind", &console))?;
        }

        if self.mqueue {
            let mq = target.join("mqueue");
            mkdir_all(&mq, pperm).map_err(OpError::io("create", &mq))?;
            mount::mount(
                Some(SOURCE_MQUEUE),
                &mq,
                Some(c"mqueue"),
                libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
                None,
            )
            .map_err(OpError::mount("mount mqueue on", &mq))?;
        }

        remount(&target, libc::MS_RDONLY).map_err(OpError::mount("remount", &self.target))
    }
}

/// `isatty` as the kernel sees it: a terminal answers `TIOCGWINSZ`.
fn is_terminal(fd: libc::c_int) -> bool {
    let mut ws = std::mem::MaybeUninit::<libc::winsize>::uninit();
    unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, ws.as_mut_ptr()) == 0 }
}

impl fmt::Display for DevOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mqueue {
            write!(f, "dev on {:?} with mqueue", self.target)
        } else {
            write!(f, "dev on {:?}", self.target)
        }
    }
}
