use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{OpError, State, check_abs};
use crate::path::{mkdir_all, to_sysroot};

/// Symlink at `link_name` with contents `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymlinkOp {
    /// Uninterpreted link contents; a leading `*` names an absolute host
    /// symlink to dereference on the host side.
    pub target: String,
    pub link_name: PathBuf,
}

impl SymlinkOp {
    pub(super) fn early(&mut self) -> Result<(), OpError> {
        check_abs(&self.link_name)?;
        if let Some(host) = self.target.strip_prefix('*') {
            let host = Path::new(host);
            check_abs(host)?;
            let name = fs::read_link(host).map_err(OpError::io("read", host))?;
            self.target = name.to_string_lossy().into_owned();
        }
        Ok(())
    }

    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.link_name)?;
        let link = to_sysroot(&self.link_name);
        if let Some(parent) = link.parent() {
            mkdir_all(parent, state.params.parent_perm).map_err(OpError::io("create", parent))?;
        }
        symlink(&self.target, &link).map_err(OpError::io("create symlink", &link))
    }
}

impl fmt::Display for SymlinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "symlink on {:?} target {:?}", self.link_name, self.target)
    }
}
