//! Path conventions used while init assembles the container root.
//!
//! During setup the old root is visible at [`HOST`] and the future root at
//! [`SYSROOT`]; ops read sources through the former and write targets
//! through the latter.

use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};

use rustix::io::Errno;

/// Old root during setup.
pub const HOST: &str = "/host";
/// Future root during setup.
pub const SYSROOT: &str = "/sysroot";
/// Directory name of [`HOST`] inside the intermediate root.
pub(crate) const HOST_DIR: &str = "host";
/// Directory name of [`SYSROOT`] inside the intermediate root.
pub(crate) const SYSROOT_DIR: &str = "sysroot";

/// Conventional in-container location for injected data.
pub const TMP: &str = "/.hakurei";
/// A path guaranteed not to exist.
pub const NONEXISTENT: &str = "/proc/nonexistent";

fn join_under(prefix: &str, name: &Path) -> PathBuf {
    let mut p = PathBuf::from(prefix);
    for c in name.components() {
        if let Component::Normal(s) = c {
            p.push(s);
        }
    }
    p
}

/// `/x` → `/host/x`
pub fn to_host(name: impl AsRef<Path>) -> PathBuf {
    join_under(HOST, name.as_ref())
}

/// `/x` → `/sysroot/x`
pub fn to_sysroot(name: impl AsRef<Path>) -> PathBuf {
    join_under(SYSROOT, name.as_ref())
}

/// Mode for directories created on the way to a file or mount of mode `perm`.
///
/// Group and other search bits are only kept where `perm` grants that class
/// any access.
pub const fn parent_perm(perm: u32) -> u32 {
    let mut pperm = 0o755;
    if perm & 0o070 == 0 {
        pperm &= !0o050;
    }
    if perm & 0o007 == 0 {
        pperm &= !0o005;
    }
    pperm
}

pub fn mkdir_all(path: impl AsRef<Path>, perm: u32) -> io::Result<()> {
    DirBuilder::new().recursive(true).mode(perm).create(path)
}

/// Create `name` as an empty file of mode `perm` unless something is already
/// there. Missing parents get `pperm`.
///
/// An existing directory or symlink fails with `EISDIR`.
pub fn ensure_file(name: impl AsRef<Path>, perm: u32, pperm: u32) -> io::Result<()> {
    let name = name.as_ref();
    match fs::symlink_metadata(name) {
        Ok(meta) => {
            let ft = meta.file_type();
            if ft.is_dir() || ft.is_symlink() {
                Err(Errno::ISDIR.into())
            } else {
                Ok(())
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            if let Some(parent) = name.parent() {
                mkdir_all(parent, pperm)?;
            }
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(perm)
                .open(name)
                .map(drop)
        }
        Err(e) => Err(e),
    }
}
