use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{OpError, State, check_abs};
use crate::mount::{
    self, SOURCE_MQUEUE, SOURCE_PROC, SOURCE_TMPFS_EPHEMERAL, SOURCE_TMPFS_READONLY, mount_tmpfs,
};
use crate::path::{mkdir_all, to_sysroot};

/// Largest tmpfs size accepted.
pub const MAX_TMPFS_SIZE: usize = usize::MAX >> 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcOp {
    pub target: PathBuf,
}

impl ProcOp {
    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.target)?;
        let target = to_sysroot(&self.target);
        mkdir_all(&target, state.params.parent_perm).map_err(OpError::io("create", &target))?;
        mount::mount(
            Some(SOURCE_PROC),
            &target,
            Some(c"proc"),
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
            None,
        )
        .map_err(OpError::mount("mount proc on", &self.target))
    }
}

impl fmt::Display for ProcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "proc on {:?}", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqueueOp {
    pub target: PathBuf,
}

impl MqueueOp {
    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.target)?;
        let target = to_sysroot(&self.target);
        mkdir_all(&target, state.params.parent_perm).map_err(OpError::io("create", &target))?;
        mount::mount(
            Some(SOURCE_MQUEUE),
            &target,
            Some(c"mqueue"),
            libc::MS_NOSUID | libc::MS_NOEXEC | libc::MS_NODEV,
            None,
        )
        .map_err(OpError::mount("mount mqueue on", &self.target))
    }
}

impl fmt::Display for MqueueOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mqueue on {:?}", self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpfsOp {
    pub target: PathBuf,
    /// Size limit in bytes; zero leaves the kernel default.
    pub size: usize,
    pub perm: u32,
    /// Mounted read-only, leaving an empty directory tree.
    #[serde(default)]
    pub readonly: bool,
}

impl TmpfsOp {
    pub(super) fn check(&self) -> Result<(), OpError> {
        check_abs(&self.target)?;
        if self.size > MAX_TMPFS_SIZE {
            return Err(OpError::TmpfsSize(self.size));
        }
        Ok(())
    }

    pub(super) fn apply(&self, _state: &mut State<'_>) -> Result<(), OpError> {
        self.check()?;
        let (fsname, flags) = self.source();
        mount_tmpfs(
            fsname,
            &to_sysroot(&self.target),
            flags,
            self.size,
            self.perm,
        )
        .map_err(OpError::mount("mount tmpfs on", &self.target))
    }

    fn source(&self) -> (&'static str, libc::c_ulong) {
        let flags = libc::MS_NOSUID | libc::MS_NODEV;
        if self.readonly {
            (SOURCE_TMPFS_READONLY, flags | libc::MS_RDONLY)
        } else {
            (SOURCE_TMPFS_EPHEMERAL, flags)
        }
    }
}

impl fmt::Display for TmpfsOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.readonly {
            write!(f, "readonly tmpfs on {:?}", self.target)
        } else {
            write!(f, "tmpfs on {:?} size {}", self.target, self.size)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MkdirOp {
    pub path: PathBuf,
    pub perm: u32,
}

impl MkdirOp {
    pub(super) fn apply(&self, _state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.path)?;
        let target = to_sysroot(&self.path);
        mkdir_all(&target, self.perm).map_err(OpError::io("create", &target))
    }
}

impl fmt::Display for MkdirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "directory {:?} perm {:04o}", self.path, self.perm)
    }
}
