//! Preflight: can this kernel run a container at all.
//!
//! The result is computed on first use and kept for the process lifetime.
//! The oldest usable kernel is set by the newest interface the runtime
//! relies on:
//!
//! | Since | Interface |
//! |-------|-----------|
//! | 5.1   | `pidfd_send_signal`, used to cancel the shim and the container |
//! | 5.3   | `pidfd_open` |
//! | 5.4   | `waitid(P_PIDFD)` |

use std::fmt;
use std::fs;
use std::str::FromStr;
use std::sync::OnceLock;

use thiserror::Error;

use crate::seccomp;

/// `major.minor` of a kernel release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Kernel(pub u32, pub u32);

impl FromStr for Kernel {
    type Err = CheckError;

    /// Accepts distribution suffixes: `6.8.0-45-generic`, `5.15.153.1-microsoft`.
    fn from_str(release: &str) -> Result<Self, Self::Err> {
        let bad = || CheckError::Release(release.to_owned());
        let mut parts = release.splitn(3, '.');
        let major = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
        let minor = parts
            .next()
            .map(|s| s.split(|c: char| !c.is_ascii_digit()).next().unwrap_or(""))
            .and_then(|s| s.parse().ok())
            .ok_or_else(bad)?;
        Ok(Self(major, minor))
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0, self.1)
    }
}

const REQUIRED: &[(Kernel, &str)] = &[
    (Kernel(5, 1), "pidfd_send_signal"),
    (Kernel(5, 3), "pidfd_open"),
    (Kernel(5, 4), "waitid(P_PIDFD)"),
];

#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub kernel: Kernel,
    /// `user.max_user_namespaces`.
    pub max_user_namespaces: u64,
}

#[derive(Debug, Clone, Error)]
pub enum CheckError {
    #[error("kernel {found} lacks {feature}, which needs {required}")]
    Kernel {
        found: Kernel,
        required: Kernel,
        feature: &'static str,
    },

    #[error("cannot parse kernel release {0:?}")]
    Release(String),

    #[error("user namespaces are disabled by {0}")]
    UserNamespaces(&'static str),

    #[error("seccomp is not supported")]
    Seccomp,
}

const MAX_USER_NAMESPACES: &str = "/proc/sys/user/max_user_namespaces";
/// Debian and older Ubuntu; absent on mainline.
const UNPRIVILEGED_USERNS_CLONE: &str = "/proc/sys/kernel/unprivileged_userns_clone";

static RESULT: OnceLock<Result<SystemInfo, CheckError>> = OnceLock::new();

/// Run the preflight once and return the cached result.
pub fn check() -> Result<&'static SystemInfo, &'static CheckError> {
    RESULT.get_or_init(probe).as_ref()
}

fn sysctl(path: &str) -> Option<u64> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn require(kernel: Kernel) -> Result<(), CheckError> {
    match REQUIRED.iter().find(|(min, _)| kernel < *min) {
        Some(&(required, feature)) => Err(CheckError::Kernel {
            found: kernel,
            required,
            feature,
        }),
        None => Ok(()),
    }
}

fn probe() -> Result<SystemInfo, CheckError> {
    let uts = rustix::system::uname();
    let release = uts.release().to_string_lossy();
    let kernel: Kernel = release.parse()?;
    require(kernel)?;

    let max_user_namespaces = sysctl(MAX_USER_NAMESPACES).unwrap_or(0);
    if max_user_namespaces == 0 {
        return Err(CheckError::UserNamespaces("user.max_user_namespaces"));
    }
    if sysctl(UNPRIVILEGED_USERNS_CLONE) == Some(0) {
        return Err(CheckError::UserNamespaces("kernel.unprivileged_userns_clone"));
    }
    if !seccomp::seccomp_available() {
        return Err(CheckError::Seccomp);
    }

    Ok(SystemInfo {
        kernel,
        max_user_namespaces,
    })
}
