//! PulseAudio socket and cookie discovery.

use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rustix::io::Errno;
use thiserror::Error;
use tracing::debug;

/// Size of a PulseAudio authentication cookie.
pub const COOKIE_SIZE: usize = 256;

pub const ENV_COOKIE: &str = "PULSE_COOKIE";
pub const ENV_SERVER: &str = "PULSE_SERVER";

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("PulseAudio directory {0:?} not found")]
    NoDirectory(PathBuf),

    #[error("PulseAudio directory {0:?} found but socket does not exist")]
    NoSocket(PathBuf),

    #[error("unexpected permissions on {path:?}: {mode:o}")]
    Permissions { path: PathBuf, mode: u32 },

    #[error("{name} is not absolute: {value:?}")]
    NotAbsolute { name: &'static str, value: String },

    #[error("PulseAudio cookie at {0:?} exceeds maximum expected size")]
    CookieTooLarge(PathBuf),

    #[error("cannot {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl PulseError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::CookieTooLarge(_) => Some(Errno::NOMEM),
            Self::Io { source, .. } => source.raw_os_error().map(Errno::from_raw_os_error),
            _ => None,
        }
    }
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> PulseError {
    let path = path.to_path_buf();
    move |source| PulseError::Io {
        action,
        path,
        source,
    }
}

/// `<runtime>/pulse` and `<runtime>/pulse/native`.
pub fn paths(runtime_path: &Path) -> (PathBuf, PathBuf) {
    let dir = runtime_path.join("pulse");
    let socket = dir.join("native");
    (dir, socket)
}

/// Check that the server socket under `runtime_path` exists and is
/// accessible to everyone, returning its path.
pub fn check_socket(runtime_path: &Path) -> Result<PathBuf, PulseError> {
    let (dir, socket) = paths(runtime_path);
    match fs::metadata(&dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PulseError::NoDirectory(dir)),
        Err(e) => return Err(io_err("access PulseAudio directory", &dir)(e)),
        Ok(_) => {}
    }
    let meta = match fs::metadata(&socket) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(PulseError::NoSocket(dir)),
        Err(e) => return Err(io_err("access PulseAudio socket", &socket)(e)),
        Ok(meta) => meta,
    };
    let mode = meta.permissions().mode();
    if mode & 0o006 != 0o006 {
        return Err(PulseError::Permissions { path: socket, mode });
    }
    Ok(socket)
}

fn absolute(name: &'static str, value: String) -> Result<PathBuf, PulseError> {
    let p = PathBuf::from(&value);
    if p.is_absolute() {
        Ok(p)
    } else {
        Err(PulseError::NotAbsolute { name, value })
    }
}

/// Existing non-directory at `path`, or `None`.
fn probe(path: PathBuf) -> Result<Option<PathBuf>, PulseError> {
    match fs::metadata(&path) {
        Ok(meta) if meta.is_dir() => Ok(None),
        Ok(_) => Ok(Some(path)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_err("access PulseAudio cookie", &path)(e)),
    }
}

/// Locate the cookie of the current user.
///
/// `PULSE_COOKIE` is taken as-is. Otherwise `$HOME/.pulse-cookie` and
/// `$XDG_CONFIG_HOME/pulse/cookie` are tried in order. `None` means no
/// cookie exists and authentication is likely disabled.
pub fn discover_cookie(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<PathBuf>, PulseError> {
    if let Some(p) = lookup(ENV_COOKIE) {
        return absolute(ENV_COOKIE, p).map(Some);
    }
    if let Some(home) = lookup("HOME") {
        let home = absolute("HOME", home)?;
        if let Some(p) = probe(home.join(".pulse-cookie"))? {
            return Ok(Some(p));
        }
    }
    if let Some(config) = lookup("XDG_CONFIG_HOME") {
        let config = absolute("XDG_CONFIG_HOME", config)?;
        if let Some(p) = probe(config.join("pulse").join("cookie"))? {
            return Ok(Some(p));
        }
    }
    Ok(None)
}

/// Read the cookie at `path`, zero-padded to [`COOKIE_SIZE`].
pub fn load_cookie(path: &Path) -> Result<[u8; COOKIE_SIZE], PulseError> {
    let meta = fs::metadata(path).map_err(io_err("access PulseAudio cookie", path))?;
    if meta.is_dir() {
        return Err(io_err("read PulseAudio cookie", path)(Errno::ISDIR.into()));
    }
    if meta.len() > COOKIE_SIZE as u64 {
        return Err(PulseError::CookieTooLarge(path.to_path_buf()));
    }

    let mut cookie = [0u8; COOKIE_SIZE];
    let mut f = fs::File::open(path).map_err(io_err("open PulseAudio cookie", path))?;
    let mut n = 0;
    while n < COOKIE_SIZE {
        match f.read(&mut cookie[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(io_err("read PulseAudio cookie", path)(e)),
        }
    }
    debug!(path = %path.display(), n, "loaded PulseAudio cookie");
    Ok(cookie)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::os::unix::net::UnixListener;

    use super::*;

    fn env(pairs: &[(&str, PathBuf)]) -> impl Fn(&str) -> Option<String> + use<> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.to_string_lossy().into_owned()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn cookie_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let config = dir.path().join("config");
        fs::create_dir_all(config.join("pulse")).unwrap();
        fs::create_dir_all(&home).unwrap();
        fs::write(config.join("pulse/cookie"), [1u8; 16]).unwrap();

        // an explicit cookie is never checked
        let explicit = dir.path().join("missing");
        assert_eq!(
            discover_cookie(env(&[(ENV_COOKIE, explicit.clone()), ("HOME", home.clone())])).unwrap(),
            Some(explicit)
        );

        let lookup = env(&[("HOME", home.clone()), ("XDG_CONFIG_HOME", config.clone())]);
        assert_eq!(discover_cookie(&lookup).unwrap(), Some(config.join("pulse/cookie")));

        // directories are skipped
        fs::create_dir(home.join(".pulse-cookie")).unwrap();
        assert_eq!(discover_cookie(&lookup).unwrap(), Some(config.join("pulse/cookie")));
        fs::remove_dir(home.join(".pulse-cookie")).unwrap();

        fs::write(home.join(".pulse-cookie"), [2u8; 16]).unwrap();
        assert_eq!(discover_cookie(&lookup).unwrap(), Some(home.join(".pulse-cookie")));

        assert_eq!(discover_cookie(env(&[])).unwrap(), None);
        assert!(matches!(
            discover_cookie(env(&[("HOME", PathBuf::from("relative"))])),
            Err(PulseError::NotAbsolute { name: "HOME", .. })
        ));
    }

    #[test]
    fn cookie_loading() {
        let dir = tempfile::tempdir().unwrap();
        let short = dir.path().join("short");
        fs::write(&short, [7u8; 16]).unwrap();
        let cookie = load_cookie(&short).unwrap();
        assert_eq!(&cookie[..16], &[7u8; 16]);
        assert!(cookie[16..].iter().all(|&b| b == 0));

        let large = dir.path().join("large");
        fs::write(&large, [0u8; COOKIE_SIZE + 1]).unwrap();
        let err = load_cookie(&large).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::NOMEM));

        let err = load_cookie(dir.path()).unwrap_err();
        assert_eq!(err.errno(), Some(Errno::ISDIR));
    }

    #[test]
    fn socket_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(check_socket(dir.path()), Err(PulseError::NoDirectory(_))));

        let (pulse, socket) = paths(dir.path());
        fs::create_dir(&pulse).unwrap();
        assert!(matches!(check_socket(dir.path()), Err(PulseError::NoSocket(_))));

        let _listener = UnixListener::bind(&socket).unwrap();
        fs::set_permissions(&socket, fs::Permissions::from_mode(0o700)).unwrap();
        assert!(matches!(
            check_socket(dir.path()),
            Err(PulseError::Permissions { .. })
        ));

        fs::set_permissions(&socket, fs::Permissions::from_mode(0o777)).unwrap();
        assert_eq!(check_socket(dir.path()).unwrap(), socket);
    }
}
