use std::fmt;
use std::fs::{self, DirBuilder};
use std::io;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Criteria, Op, Scope, SystemError};

/// Creates a directory, or fixes the mode of an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MkdirOp {
    scope: Scope,
    path: PathBuf,
    perm: u32,
    ephemeral: bool,
}

impl MkdirOp {
    pub fn new(scope: Scope, path: impl Into<PathBuf>, perm: u32, ephemeral: bool) -> Self {
        Self {
            scope,
            path: path.into(),
            perm,
            ephemeral,
        }
    }
}

impl Op for MkdirOp {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn apply(&mut self, _uid: u32) -> Result<(), SystemError> {
        debug!("ensuring directory {self}");
        match DirBuilder::new().mode(self.perm).create(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(SystemError::io("create directory", &self.path)(e)),
        }
        // the umask applies on creation, and existing directories keep their mode
        fs::set_permissions(&self.path, fs::Permissions::from_mode(self.perm))
            .map_err(SystemError::io("chmod", &self.path))
    }

    fn revert(&mut self, _uid: u32, criteria: Criteria) -> Result<(), SystemError> {
        if !self.ephemeral {
            return Ok(());
        }
        if !criteria.matches(self.scope) {
            debug!("skipping ephemeral directory {self}");
            return Ok(());
        }
        debug!("destroying ephemeral directory {self}");
        match fs::remove_dir(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(SystemError::io("remove directory", &self.path)(e))
            }
            _ => Ok(()),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for MkdirOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode: {:04o} type: ", self.perm)?;
        if self.ephemeral {
            write!(f, "{}", self.scope)?;
        } else {
            f.write_str("ensure")?;
        }
        write!(f, " path: {:?}", self.path)
    }
}
