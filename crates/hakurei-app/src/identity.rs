//! Target uid arithmetic and the setuid helper contract.
//!
//! Every invoking user listed in [`HSURC_PATH`] owns a block of 10000 uids
//! selected by its `fid`; the application identity (`aid`) picks one uid out
//! of that block:
//!
//! ```text
//! uid = 1_000_000 + fid * 10_000 + aid
//! ```

use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;

use thiserror::Error;
use tracing::debug;

/// Location of the setuid helper.
pub const HSU_PATH: &str = match option_env!("HAKUREI_HSU_PATH") {
    Some(p) => p,
    None => "/usr/bin/hsu",
};

/// Location of the hakurei binary, the only program hsu accepts as parent.
pub const HAKUREI_PATH: &str = match option_env!("HAKUREI_PATH") {
    Some(p) => p,
    None => "/usr/bin/hakurei",
};

/// Allowlist read by hsu: `<uid> <fid>` per line.
pub const HSURC_PATH: &str = "/etc/hsurc";

pub const IDENTITY_MIN: u32 = 0;
pub const IDENTITY_MAX: u32 = 9999;
pub const FID_MAX: u32 = 99;

/// First uid handed out to sandboxed applications.
pub const UID_START: u32 = 1_000_000;
const UID_RANGE: u32 = 10_000;

/// Environment variable naming the application identity for hsu.
pub const ENV_IDENTITY: &str = "HAKUREI_IDENTITY";
/// Environment variable listing supplementary group ids for hsu.
pub const ENV_GROUPS: &str = "HAKUREI_GROUPS";

/// Target uid of application `aid` for invoking user `fid`.
pub const fn to_uid(fid: u32, aid: u32) -> u32 {
    UID_START + fid * UID_RANGE + aid
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("identity {0} out of range")]
    OutOfRange(u32),

    #[error("invalid identity {0:?}")]
    Invalid(String),
}

pub fn check_identity(aid: u32) -> Result<u32, IdentityError> {
    if (IDENTITY_MIN..=IDENTITY_MAX).contains(&aid) {
        Ok(aid)
    } else {
        Err(IdentityError::OutOfRange(aid))
    }
}

/// Parse a decimal identity, as hsu reads it from the environment.
pub fn parse_identity(s: &str) -> Result<u32, IdentityError> {
    let aid = parse_u32(s).ok_or_else(|| IdentityError::Invalid(s.to_owned()))?;
    check_identity(aid)
}

/// Strict decimal: digits only, no sign, at most 10 characters.
fn parse_u32(s: &str) -> Option<u32> {
    if s.is_empty() || s.len() > 10 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[derive(Debug, Error)]
pub enum HsurcError {
    #[error("invalid entry on line {0}")]
    Entry(usize),

    #[error("invalid parent uid on line {0}")]
    ParentUid(usize),

    #[error("invalid fid on line {0}")]
    Fid(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Look up the `fid` of `puid` in an hsurc stream.
///
/// Entries before the match must be well formed; entries after it are not
/// read.
pub fn parse_hsurc(r: impl BufRead, puid: u32) -> Result<Option<u32>, HsurcError> {
    for (i, line) in r.lines().enumerate() {
        let line = line?;
        let n = i + 1;
        let (uid, fid) = line.split_once(' ').ok_or(HsurcError::Entry(n))?;
        let uid = parse_u32(uid)
            .filter(|&u| u >= 1)
            .ok_or(HsurcError::ParentUid(n))?;
        if uid != puid {
            continue;
        }
        let fid = parse_u32(fid)
            .filter(|&f| f <= FID_MAX)
            .ok_or(HsurcError::Fid(n))?;
        return Ok(Some(fid));
    }
    Ok(None)
}

#[derive(Debug, Clone, Error)]
pub enum HsuError {
    #[error("the setuid helper is missing: {0:?}")]
    Missing(PathBuf),

    #[error("current user is not in the hsurc file")]
    Access,

    #[error("invalid fid string from hsu: {0:?}")]
    Invalid(String),

    #[error("cannot obtain fid from hsu: {0}")]
    Exec(String),
}

/// Caches the identity query answered by hsu.
#[derive(Debug)]
pub struct Hsu {
    path: PathBuf,
    fid: OnceLock<Result<u32, HsuError>>,
}

impl Default for Hsu {
    fn default() -> Self {
        Self::new(HSU_PATH)
    }
}

impl Hsu {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            fid: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `fid` of the invoking user, queried once.
    ///
    /// hsu prints the `fid` and exits when started without a shim
    /// descriptor.
    pub fn fid(&self) -> Result<u32, HsuError> {
        self.fid.get_or_init(|| query(&self.path)).clone()
    }
}

fn query(path: &Path) -> Result<u32, HsuError> {
    debug!(path = %path.display(), "querying fid");
    let output = Command::new(path)
        .env_clear()
        .current_dir("/")
        .stdin(Stdio::null())
        .stderr(Stdio::inherit())
        .output()
        .map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                HsuError::Missing(path.to_path_buf())
            } else {
                HsuError::Exec(e.to_string())
            }
        })?;
    if !output.status.success() {
        // hsu explains itself on stderr
        return Err(if output.status.code() == Some(1) {
            HsuError::Access
        } else {
            HsuError::Exec(output.status.to_string())
        });
    }
    let s = String::from_utf8_lossy(&output.stdout);
    parse_u32(s.trim())
        .filter(|&f| f <= FID_MAX)
        .ok_or_else(|| HsuError::Invalid(s.into_owned()))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn uid_arithmetic() {
        assert_eq!(to_uid(0, 0), 1_000_000);
        assert_eq!(to_uid(0, 9), 1_000_009);
        assert_eq!(to_uid(3, 42), 1_030_042);
        assert_eq!(to_uid(FID_MAX, IDENTITY_MAX), 1_999_999);
    }

    #[test]
    fn identity_bounds() {
        assert_eq!(parse_identity("0").unwrap(), 0);
        assert_eq!(parse_identity("9999").unwrap(), 9999);
        assert!(matches!(
            parse_identity("10000"),
            Err(IdentityError::OutOfRange(10000))
        ));
        assert!(matches!(parse_identity("-1"), Err(IdentityError::Invalid(_))));
        assert!(matches!(parse_identity("+1"), Err(IdentityError::Invalid(_))));
        assert!(matches!(parse_identity(""), Err(IdentityError::Invalid(_))));
    }

    #[test]
    fn hsurc_lookup() {
        let rc = "1000 0\n1001 1\n1002 2\n";
        assert_eq!(parse_hsurc(Cursor::new(rc), 1001).unwrap(), Some(1));
        assert_eq!(parse_hsurc(Cursor::new(rc), 1003).unwrap(), None);
    }

    #[test]
    fn hsurc_malformed() {
        assert!(matches!(
            parse_hsurc(Cursor::new("1000\n"), 1000),
            Err(HsurcError::Entry(1))
        ));
        assert!(matches!(
            parse_hsurc(Cursor::new("1000 0\n0 1\n"), 5),
            Err(HsurcError::ParentUid(2))
        ));
        assert!(matches!(
            parse_hsurc(Cursor::new("1000 100\n"), 1000),
            Err(HsurcError::Fid(1))
        ));
        // malformed entries past the match are never read
        assert_eq!(
            parse_hsurc(Cursor::new("1000 7\ngarbage\n"), 1000).unwrap(),
            Some(7)
        );
    }

    fn script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hsu");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn hsu_query() {
        let dir = tempfile::tempdir().unwrap();
        let hsu = Hsu::new(script(dir.path(), "printf 5"));
        assert_eq!(hsu.fid().unwrap(), 5);
        // cached
        std::fs::remove_file(hsu.path()).unwrap();
        assert_eq!(hsu.fid().unwrap(), 5);
    }

    #[test]
    fn hsu_denied() {
        let dir = tempfile::tempdir().unwrap();
        let hsu = Hsu::new(script(dir.path(), "exit 1"));
        assert!(matches!(hsu.fid(), Err(HsuError::Access)));
    }

    #[test]
    fn hsu_missing() {
        let hsu = Hsu::new("/proc/nonexistent/hsu");
        assert!(matches!(hsu.fid(), Err(HsuError::Missing(_))));
    }
}
