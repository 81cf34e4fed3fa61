use std::fmt;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{Nonrepeatable, OpError, State};
use crate::path::{mkdir_all, to_sysroot};

/// Populate `/etc` with symlinks into a host `/etc` bound at
/// `/etc/.host/<prefix>`.
///
/// `passwd` and `group` are left out, they are placed per instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoEtcOp {
    pub prefix: String,
}

impl AutoEtcOp {
    fn host_rel(&self) -> String {
        format!(".host/{}", self.prefix)
    }

    /// Container path the host `/etc` is expected at.
    pub fn host_path(&self) -> PathBuf {
        PathBuf::from("/etc").join(self.host_rel())
    }

    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        if state.nonrepeatable.contains(Nonrepeatable::AUTO_ETC) {
            return Err(OpError::NotRepeatable);
        }
        state.nonrepeatable |= Nonrepeatable::AUTO_ETC;

        let etc = to_sysroot("/etc");
        mkdir_all(&etc, 0o755).map_err(OpError::io("create", &etc))?;

        let host = to_sysroot(self.host_path());
        let rel = PathBuf::from(self.host_rel());
        for entry in fs::read_dir(&host).map_err(OpError::io("read", &host))? {
            let entry = entry.map_err(OpError::io("read", &host))?;
            let name = entry.file_name();
            let dest = match name.to_str() {
                Some(".host" | "passwd" | "group") => continue,
                Some("mtab") => PathBuf::from("/proc/mounts"),
                _ => rel.join(&name),
            };
            let link = etc.join(&name);
            symlink(&dest, &link).map_err(OpError::io("create symlink", &link))?;
        }
        Ok(())
    }
}

impl fmt::Display for AutoEtcOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "auto etc {}", self.prefix)
    }
}
