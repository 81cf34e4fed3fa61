use std::fmt;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::{OpError, State, check_abs};
use crate::mount::bind_mount;
use crate::path::{ensure_file, to_sysroot};

/// Read-only file placed in the container from bytes held by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TmpfileOp {
    pub path: PathBuf,
    pub data: Vec<u8>,
}

impl TmpfileOp {
    pub(super) fn apply(&self, state: &mut State<'_>) -> Result<(), OpError> {
        check_abs(&self.path)?;

        // the intermediate root is a private tmpfs
        let mut tmp = tempfile::Builder::new()
            .prefix("tmp.")
            .tempfile_in("/")
            .map_err(OpError::io("create", "/"))?;
        tmp.write_all(&self.data)
            .map_err(OpError::io("write to", tmp.path().to_path_buf()))?;
        let (_, tmp_path) = tmp
            .keep()
            .map_err(|e| OpError::io("keep", e.file.path().to_path_buf())(e.error))?;

        let target = to_sysroot(&self.path);
        ensure_file(&target, 0o444, state.params.parent_perm).map_err(OpError::io("create", &target))?;
        bind_mount(&tmp_path, &target, libc::MS_RDONLY | libc::MS_NODEV)
            .map_err(OpError::mount("bind", &self.path))?;
        fs::remove_file(&tmp_path).map_err(OpError::io("remove", &tmp_path))
    }
}

impl fmt::Display for TmpfileOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tmpfile {:?} ({} bytes)", self.path, self.data.len())
    }
}
