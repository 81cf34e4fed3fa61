//! Filesystem setup operations.
//!
//! An [`Ops`] list is built by the caller, resolved once on the host side
//! ([`Op::early`]) and replayed by init inside the new mount namespace
//! ([`Op::apply`]). Sources are read through [`HOST`](crate::path::HOST),
//! targets written through [`SYSROOT`](crate::path::SYSROOT).

mod autoetc;
mod bind;
mod dev;
mod fs;
mod link;
mod place;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use rustix::io::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::params::Params;

pub use autoetc::AutoEtcOp;
pub use bind::{BindFlags, BindOp, RemountOp};
pub use dev::DevOp;
pub use fs::{MkdirOp, MqueueOp, ProcOp, TmpfsOp};
pub use link::SymlinkOp;
pub use place::TmpfileOp;

#[derive(Debug, Error)]
pub enum OpError {
    #[error("path {0:?} is not absolute")]
    NotAbsolute(PathBuf),

    #[error("tmpfs size {0} out of bounds")]
    TmpfsSize(usize),

    #[error("autoetc is not repeatable")]
    NotRepeatable,

    #[error("cannot {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot {action} {path:?}: {errno}")]
    Mount {
        action: &'static str,
        path: PathBuf,
        errno: Errno,
    },
}

impl OpError {
    pub(crate) fn io(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { action, path, source }
    }

    pub(crate) fn mount(action: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(Errno) -> Self {
        let path = path.into();
        move |errno| Self::Mount { action, path, errno }
    }

    /// Errno closest to this error, used for init's exit diagnostics.
    pub fn errno(&self) -> Errno {
        match self {
            Self::NotAbsolute(_) | Self::TmpfsSize(_) => Errno::BADE,
            Self::NotRepeatable => Errno::INVAL,
            Self::Io { source, .. } => crate::mount::io_errno(source),
            Self::Mount { errno, .. } => *errno,
        }
    }
}

pub(crate) fn check_abs(path: &Path) -> Result<(), OpError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(OpError::NotAbsolute(path.to_path_buf()))
    }
}

bitflags! {
    /// Ops that may only appear once.
    #[derive(Debug, Clone, Copy, Default)]
    pub(crate) struct Nonrepeatable: u32 {
        const AUTO_ETC = 1 << 0;
    }
}

/// Mutable state threaded through [`Op::apply`].
pub struct State<'a> {
    pub(crate) params: &'a Params,
    pub(crate) nonrepeatable: Nonrepeatable,
}

impl<'a> State<'a> {
    pub fn new(params: &'a Params) -> Self {
        Self {
            params,
            nonrepeatable: Nonrepeatable::empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Op {
    Bind(BindOp),
    Remount(RemountOp),
    Proc(ProcOp),
    Dev(DevOp),
    Mqueue(MqueueOp),
    Tmpfs(TmpfsOp),
    Symlink(SymlinkOp),
    Mkdir(MkdirOp),
    Tmpfile(TmpfileOp),
    AutoEtc(AutoEtcOp),
}

impl Op {
    /// Host-side resolution, run before any namespace exists.
    pub fn early(&mut self) -> Result<(), OpError> {
        match self {
            Self::Bind(op) => op.early(),
            Self::Symlink(op) => op.early(),
            Self::Tmpfs(op) => op.check(),
            Self::Remount(op) => check_abs(&op.target),
            Self::Proc(op) => check_abs(&op.target),
            Self::Dev(op) => check_abs(&op.target),
            Self::Mqueue(op) => check_abs(&op.target),
            Self::Mkdir(op) => check_abs(&op.path),
            Self::Tmpfile(op) => check_abs(&op.path),
            Self::AutoEtc(_) => Ok(()),
        }
    }

    /// Apply inside init, between the two pivots.
    pub fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        match self {
            Self::Bind(op) => op.apply(state),
            Self::Remount(op) => op.apply(state),
            Self::Proc(op) => op.apply(state),
            Self::Dev(op) => op.apply(state),
            Self::Mqueue(op) => op.apply(state),
            Self::Tmpfs(op) => op.apply(state),
            Self::Symlink(op) => op.apply(state),
            Self::Mkdir(op) => op.apply(state),
            Self::Tmpfile(op) => op.apply(state),
            Self::AutoEtc(op) => op.apply(state),
        }
    }

    /// Verb used when narrating this op.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Bind(_) | Self::Proc(_) | Self::Dev(_) | Self::Mqueue(_) | Self::Tmpfs(_) => {
                "mounting"
            }
            Self::Remount(_) => "remounting",
            Self::Symlink(_) | Self::Mkdir(_) => "creating",
            Self::Tmpfile(_) => "placing",
            Self::AutoEtc(_) => "setting up",
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind(op) => op.fmt(f),
            Self::Remount(op) => op.fmt(f),
            Self::Proc(op) => op.fmt(f),
            Self::Dev(op) => op.fmt(f),
            Self::Mqueue(op) => op.fmt(f),
            Self::Tmpfs(op) => op.fmt(f),
            Self::Symlink(op) => op.fmt(f),
            Self::Mkdir(op) => op.fmt(f),
            Self::Tmpfile(op) => op.fmt(f),
            Self::AutoEtc(op) => op.fmt(f),
        }
    }
}

/// Ordered list of [`Op`], with builder helpers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ops(Vec<Op>);

impl Ops {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Op> {
        self.0.iter_mut()
    }

    pub fn push(&mut self, op: Op) -> &mut Self {
        self.0.push(op);
        self
    }

    /// Bind host `source` on container `target`.
    pub fn bind(
        &mut self,
        source: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
        flags: BindFlags,
    ) -> &mut Self {
        self.push(Op::Bind(BindOp::new(source, target, flags)))
    }

    /// Apply mount flags to `target` and everything below it.
    pub fn remount(&mut self, target: impl Into<PathBuf>, flags: libc::c_ulong) -> &mut Self {
        self.push(Op::Remount(RemountOp {
            target: target.into(),
            flags: u64::from(flags),
        }))
    }

    pub fn proc(&mut self, target: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Proc(ProcOp {
            target: target.into(),
        }))
    }

    /// Mount a minimal `/dev`; with `mqueue` a private mqueue is mounted
    /// under it before it turns read-only.
    pub fn dev(&mut self, target: impl Into<PathBuf>, mqueue: bool) -> &mut Self {
        self.push(Op::Dev(DevOp {
            target: target.into(),
            mqueue,
        }))
    }

    pub fn mqueue(&mut self, target: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Mqueue(MqueueOp {
            target: target.into(),
        }))
    }

    pub fn tmpfs(&mut self, target: impl Into<PathBuf>, size: usize, perm: u32) -> &mut Self {
        self.push(Op::Tmpfs(TmpfsOp {
            target: target.into(),
            size,
            perm,
            readonly: false,
        }))
    }

    /// Empty read-only tmpfs, typically a mount point for later binds.
    pub fn readonly(&mut self, target: impl Into<PathBuf>, perm: u32) -> &mut Self {
        self.push(Op::Tmpfs(TmpfsOp {
            target: target.into(),
            size: 0,
            perm,
            readonly: true,
        }))
    }

    /// Create a symlink at `link_name` pointing to `target`. A `target`
    /// starting with `*` names an absolute host symlink whose contents are
    /// read on the host side.
    pub fn link(&mut self, target: impl Into<String>, link_name: impl Into<PathBuf>) -> &mut Self {
        self.push(Op::Symlink(SymlinkOp {
            target: target.into(),
            link_name: link_name.into(),
        }))
    }

    pub fn mkdir(&mut self, path: impl Into<PathBuf>, perm: u32) -> &mut Self {
        self.push(Op::Mkdir(MkdirOp {
            path: path.into(),
            perm,
        }))
    }

    /// Place a read-only file containing `data` at `path`.
    pub fn place(&mut self, path: impl Into<PathBuf>, data: impl Into<Vec<u8>>) -> &mut Self {
        self.push(Op::Tmpfile(TmpfileOp {
            path: path.into(),
            data: data.into(),
        }))
    }

    /// Mirror host `/etc` as a tree of symlinks into a bind of `host`.
    pub fn etc(&mut self, host: impl Into<PathBuf>, prefix: impl Into<String>) -> &mut Self {
        let op = AutoEtcOp {
            prefix: prefix.into(),
        };
        self.mkdir("/etc", 0o755)
            .bind(host, op.host_path(), BindFlags::empty())
            .push(Op::AutoEtc(op))
    }
}

impl<'a> IntoIterator for &'a Ops {
    type Item = &'a Op;
    type IntoIter = std::slice::Iter<'a, Op>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl From<Vec<Op>> for Ops {
    fn from(ops: Vec<Op>) -> Self {
        Self(ops)
    }
}
