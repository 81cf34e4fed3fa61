//! hsu - setuid helper that starts the shim as the target user.
//!
//! Only the program installed at `HAKUREI_PATH` may run hsu, and only for
//! users listed in `/etc/hsurc`:
//!
//! ```text
//! # <uid> <fid>
//! 1000 0
//! 1001 1
//! ```
//!
//! Without `HAKUREI_SHIM` hsu prints the caller's fid and exits. Otherwise
//! it switches to uid `1000000 + fid * 10000 + HAKUREI_IDENTITY`, attaches
//! the groups in `HAKUREI_GROUPS` and execs `hakurei shim`, passing the
//! shim descriptor through.

use std::fs::{self, File};
use std::io::{self, BufReader};
use std::os::unix::fs::MetadataExt;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;

use hakurei_app::identity::{
    ENV_GROUPS, ENV_IDENTITY, HAKUREI_PATH, HSURC_PATH, HsurcError, parse_hsurc, parse_identity,
    to_uid,
};
use hakurei_app::shim::ENV_SHIM;
use hakurei_sys::last_errno;
use hakurei_sys::process::set_no_new_privs;
use rustix::io::Errno;
use thiserror::Error;
use tracing::error;

/// Caller is not allowed to use hsu.
const EXIT_DENIED: i32 = 1;
/// Malformed input or a failed syscall.
const EXIT_FAILURE: i32 = 2;

#[derive(Debug, Error)]
enum HsuError {
    #[error("{0}")]
    Denied(String),

    #[error("invalid {0}: {1:?}")]
    Input(&'static str, String),

    #[error("cannot {0}: {1}")]
    Sys(&'static str, Errno),

    #[error("{0}: {1}")]
    Hsurc(&'static str, HsurcError),

    #[error("cannot start shim: {0}")]
    Exec(io::Error),
}

impl HsuError {
    fn exit_code(&self) -> i32 {
        match self {
            Self::Denied(_) => EXIT_DENIED,
            _ => EXIT_FAILURE,
        }
    }
}

fn denied(msg: impl Into<String>) -> HsuError {
    HsuError::Denied(msg.into())
}

fn errno(e: &io::Error) -> Errno {
    Errno::from_io_error(e).unwrap_or(Errno::IO)
}

/// Shim descriptor: a single digit from 3 to 9.
fn parse_shim_fd(s: &str) -> Result<i32, HsuError> {
    match s.as_bytes() {
        [b @ b'3'..=b'9'] => Ok(i32::from(b - b'0')),
        _ => Err(HsuError::Input(ENV_SHIM, s.to_owned())),
    }
}

/// Space separated group ids, each of which the caller must hold.
fn parse_groups(s: &str, held: &[u32]) -> Result<Vec<u32>, HsuError> {
    s.split(' ')
        .filter(|g| !g.is_empty())
        .map(|g| {
            let gid: u32 = g
                .parse()
                .map_err(|_| HsuError::Input(ENV_GROUPS, s.to_owned()))?;
            if held.contains(&gid) {
                Ok(gid)
            } else {
                Err(denied(format!("caller is not a member of group {gid}")))
            }
        })
        .collect()
}

fn caller_groups() -> Result<Vec<u32>, HsuError> {
    // SAFETY: a zero-length query only returns the count.
    let n = unsafe { libc::getgroups(0, std::ptr::null_mut()) };
    if n < 0 {
        return Err(HsuError::Sys("get groups", last_errno()));
    }
    let mut groups = vec![0 as libc::gid_t; n as usize];
    // SAFETY: the buffer holds n entries.
    let n = unsafe { libc::getgroups(n, groups.as_mut_ptr()) };
    if n < 0 {
        return Err(HsuError::Sys("get groups", last_errno()));
    }
    groups.truncate(n as usize);
    groups.push(rustix::process::getgid().as_raw());
    Ok(groups)
}

fn check_caller(puid: u32) -> Result<(), HsuError> {
    if !rustix::process::geteuid().is_root() {
        return Err(denied("hsu must be setuid root"));
    }
    if rustix::process::getegid() != rustix::process::getgid() {
        return Err(denied("hsu must not be setgid"));
    }
    if puid == 0 {
        return Err(denied("root cannot use hsu"));
    }

    let ppid = rustix::process::getppid().ok_or_else(|| denied("hsu has no parent"))?;
    let parent = fs::read_link(format!("/proc/{}/exe", ppid.as_raw_nonzero()))
        .map_err(|e| HsuError::Sys("read parent executable", errno(&e)))?;
    if parent != Path::new(HAKUREI_PATH) {
        return Err(denied(format!("{parent:?} is not {HAKUREI_PATH:?}")));
    }
    Ok(())
}

/// fid of `puid` from a root-owned, mode 0400 hsurc.
fn lookup_fid(path: &Path, puid: u32) -> Result<u32, HsuError> {
    let f = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => denied(format!("{} does not exist", path.display())),
        _ => HsuError::Sys("open hsurc", errno(&e)),
    })?;
    let meta = f
        .metadata()
        .map_err(|e| HsuError::Sys("stat hsurc", errno(&e)))?;
    if meta.uid() != 0 || meta.mode() & 0o7777 != 0o400 {
        return Err(denied(format!(
            "{} must be owned by root with mode 0400",
            path.display()
        )));
    }
    parse_hsurc(BufReader::new(f), puid)
        .map_err(|e| HsuError::Hsurc(HSURC_PATH, e))?
        .ok_or_else(|| denied(format!("uid {puid} is not in {}", path.display())))
}

fn switch_user(uid: u32, groups: &[u32]) -> Result<(), HsuError> {
    // SAFETY: plain syscalls on owned arguments.
    if unsafe { libc::setresgid(uid, uid, uid) } != 0 {
        return Err(HsuError::Sys("set gid", last_errno()));
    }
    if unsafe { libc::setgroups(groups.len(), groups.as_ptr()) } != 0 {
        return Err(HsuError::Sys("set groups", last_errno()));
    }
    if unsafe { libc::setresuid(uid, uid, uid) } != 0 {
        return Err(HsuError::Sys("set uid", last_errno()));
    }
    set_no_new_privs().map_err(|errno| HsuError::Sys("set no_new_privs", errno))
}

fn run() -> Result<(), HsuError> {
    let puid = rustix::process::getuid().as_raw();
    check_caller(puid)?;
    let fid = lookup_fid(Path::new(HSURC_PATH), puid)?;

    let Some(shim) = std::env::var_os(ENV_SHIM) else {
        println!("{fid}");
        return Ok(());
    };
    let shim = shim.to_string_lossy().into_owned();
    let shim_fd = parse_shim_fd(&shim)?;

    let identity = std::env::var(ENV_IDENTITY).unwrap_or_default();
    let aid = parse_identity(&identity).map_err(|_| HsuError::Input(ENV_IDENTITY, identity))?;
    let groups = match std::env::var(ENV_GROUPS) {
        Ok(s) => parse_groups(&s, &caller_groups()?)?,
        Err(_) => Vec::new(),
    };

    let uid = to_uid(fid, aid);
    switch_user(uid, &groups)?;

    let err = Command::new(HAKUREI_PATH)
        .arg0("hakurei")
        .arg("shim")
        .env_clear()
        .env(ENV_SHIM, shim_fd.to_string())
        .current_dir("/")
        .exec();
    Err(HsuError::Exec(err))
}

fn main() {
    tracing_subscriber::fmt()
        .without_time()
        .with_target(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(io::stderr)
        .init();

    if let Err(e) = run() {
        error!("hsu: {e}");
        std::process::exit(e.exit_code());
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    #[test]
    fn shim_fd() {
        for (s, fd) in [("3", 3), ("9", 9)] {
            assert_eq!(parse_shim_fd(s).unwrap(), fd);
        }
        for bad in ["", "0", "2", "10", "33", "-3", "a"] {
            assert!(parse_shim_fd(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn groups() {
        let held = [100, 27, 44];
        assert_eq!(parse_groups("27 44", &held).unwrap(), [27, 44]);
        assert!(parse_groups("", &held).unwrap().is_empty());
        assert!(matches!(parse_groups("27 5", &held), Err(HsuError::Denied(_))));
        assert!(matches!(parse_groups("video", &held), Err(HsuError::Input(..))));
    }

    #[test]
    fn hsurc_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsurc");
        let mut f = File::create(&path).unwrap();
        writeln!(f, "1000 0").unwrap();
        drop(f);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        // a file created by the test runner is either not root-owned or 0644
        assert!(matches!(lookup_fid(&path, 1000), Err(HsuError::Denied(_))));
        assert!(matches!(
            lookup_fid(&dir.path().join("missing"), 1000),
            Err(HsuError::Denied(_))
        ));
    }
}
