use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Criteria, Op, Scope, SystemError};

/// Hard link removed when the instance exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkOp {
    pub(super) original: PathBuf,
    pub(super) link: PathBuf,
}

impl Op for LinkOp {
    fn scope(&self) -> Scope {
        Scope::PROCESS
    }

    fn apply(&mut self, _uid: u32) -> Result<(), SystemError> {
        debug!("linking {self}");
        fs::hard_link(&self.original, &self.link).map_err(SystemError::io("link", &self.link))
    }

    fn revert(&mut self, _uid: u32, criteria: Criteria) -> Result<(), SystemError> {
        if !criteria.matches(Scope::PROCESS) {
            debug!("skipping hard link {self}");
            return Ok(());
        }
        debug!("removing hard link {self}");
        match fs::remove_file(&self.link) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                Err(SystemError::io("remove", &self.link)(e))
            }
            _ => Ok(()),
        }
    }

    fn path(&self) -> &Path {
        &self.link
    }
}

impl fmt::Display for LinkOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from {:?}", self.link, self.original)
    }
}
