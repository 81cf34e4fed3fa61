use std::fmt;
use std::fs;
use std::io;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{OpError, State, check_abs};
use crate::mount::{bind_mount, remount};
use crate::path::{ensure_file, mkdir_all, to_host, to_sysroot};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BindFlags: u32 {
        /// Skip the mount if the source does not exist.
        const OPTIONAL = 1 << 0;
        /// Leave the mount writable.
        const WRITABLE = 1 << 1;
        /// Allow device nodes.
        const DEVICE = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindOp {
    pub source: PathBuf,
    pub target: PathBuf,
    pub flags: BindFlags,
    /// Canonical source, filled in by `early`; `None` marks an absent
    /// optional source.
    #[serde(default)]
    pub(crate) resolved: Option<PathBuf>,
}

impl BindOp {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>, flags: BindFlags) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            flags,
            resolved: None,
        }
    }

    pub(super) fn early(&mut self) -> Result<(), OpError> {
        check_abs(&self.source)?;
        check_abs(&self.target)?;
        match fs::canonicalize(&self.source) {
            Ok(p) => self.resolved = Some(p),
            Err(e) if e.kind() == io::ErrorKind::NotFound && self.flags.contains(BindFlags::OPTIONAL) => {
                debug!("optional source {:?} is absent", self.source);
                self.resolved = None;
            }
            Err(e) => return Err(OpError::io("resolve", &self.source)(e)),
        }
        Ok(())
    }

    pub(super) fn apply(&self, _state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.target)?;
        let Some(resolved) = &self.resolved else {
            if self.flags.contains(BindFlags::OPTIONAL) {
                return Ok(());
            }
            // early was skipped
            return Err(OpError::NotAbsolute(self.source.clone()));
        };
        check_abs(resolved)?;

        let source = to_host(resolved);
        let target = to_sysroot(&self.target);

        let meta = fs::metadata(&source).map_err(OpError::io("stat", &source))?;
        if meta.is_dir() {
            mkdir_all(&target, 0o700).map_err(OpError::io("create", &target))?;
        } else {
            ensure_file(&target, 0o444, 0o700).map_err(OpError::io("create", &target))?;
        }

        let mut flags = libc::MS_REC;
        if !self.flags.contains(BindFlags::WRITABLE) {
            flags |= libc::MS_RDONLY;
        }
        if !self.flags.contains(BindFlags::DEVICE) {
            flags |= libc::MS_NODEV;
        }
        bind_mount(&source, &target, flags).map_err(OpError::mount("bind", &self.target))
    }
}

impl fmt::Display for BindOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source == self.target {
            write!(f, "{:?} flags {:#x}", self.source, self.flags.bits())
        } else {
            write!(
                f,
                "{:?} on {:?} flags {:#x}",
                self.source,
                self.target,
                self.flags.bits()
            )
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemountOp {
    pub target: PathBuf,
    /// `MS_*` flags.
    pub flags: u64,
}

impl RemountOp {
    pub(super) fn apply(&self, _state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.target)?;
        remount(&to_sysroot(&self.target), self.flags as libc::c_ulong)
            .map_err(OpError::mount("remount", &self.target))
    }
}

impl fmt::Display for RemountOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} flags {:#x}", self.target, self.flags)
    }
}
