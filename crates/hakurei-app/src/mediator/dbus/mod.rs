//! D-Bus mediation through a sandboxed xdg-dbus-proxy.
//!
//! The proxy listens on per-instance sockets and forwards filtered traffic
//! to the real session bus, and optionally the system bus. Its arguments
//! travel over a pipe as NUL-terminated strings, session bus first.

mod address;
mod config;
mod proxy;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use address::{
    AddrEntry, BadAddress, ENV_SESSION_BUS, ENV_SYSTEM_BUS, FALLBACK_SYSTEM_BUS, ParseErrorKind,
    fallback_session_bus, parse,
};
pub use config::{BadInterface, Config};
pub use proxy::{PROXY_HOSTNAME, PROXY_NAME, Proxy};

#[derive(Debug, Error)]
pub enum DBusError {
    #[error("session bus config not supplied")]
    NoSession,

    #[error("upstream {bus}: {source}")]
    Address {
        bus: String,
        #[source]
        source: BadAddress,
    },

    #[error(transparent)]
    Interface(#[from] BadInterface),

    #[error("proxy argument contains NUL byte")]
    Nul,

    #[error("socket path {0:?} is not absolute")]
    SocketPath(PathBuf),

    #[error("cannot find {PROXY_NAME}: {0}")]
    Lookup(#[from] which::Error),

    #[error("proxy exited before becoming ready")]
    Exited,

    #[error(transparent)]
    Container(#[from] hakurei_container::ContainerError),

    #[error("proxy: {0}")]
    Io(#[from] std::io::Error),
}

/// Upstream addresses of the session and system bus for `uid`, taken from
/// the environment or the well-known defaults.
pub fn upstream(uid: u32) -> (String, String) {
    let session =
        std::env::var(ENV_SESSION_BUS).unwrap_or_else(|_| fallback_session_bus(uid));
    let system = std::env::var(ENV_SYSTEM_BUS).unwrap_or_else(|_| FALLBACK_SYSTEM_BUS.to_owned());
    (session, system)
}

/// One proxied bus: the upstream address and the socket the proxy listens
/// on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyPair {
    pub upstream: String,
    pub socket: PathBuf,
}

/// Checked proxy configuration, ready to be streamed to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Final {
    pub session: ProxyPair,
    pub system: Option<ProxyPair>,
    pub session_upstream: Vec<AddrEntry>,
    pub system_upstream: Vec<AddrEntry>,
    /// Argument stream, every argument NUL-terminated.
    pub args: Vec<u8>,
}

impl Final {
    /// Directories holding upstream unix sockets, sorted and deduplicated.
    pub fn upstream_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .session_upstream
            .iter()
            .chain(&self.system_upstream)
            .filter_map(AddrEntry::unix_path)
            .map(Path::new)
            .filter(|p| p.is_absolute())
            .filter_map(Path::parent)
            .map(Path::to_path_buf)
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// Directories the proxy creates its sockets in.
    pub fn socket_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = std::iter::once(&self.session)
            .chain(&self.system)
            .filter_map(|p| p.socket.parent())
            .map(Path::to_path_buf)
            .collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    pub fn sockets(&self) -> impl Iterator<Item = &Path> {
        std::iter::once(&self.session)
            .chain(&self.system)
            .map(|p| p.socket.as_path())
    }
}

/// Check both configurations and build the argument stream.
pub fn finalise(
    session: (&ProxyPair, Option<&Config>),
    system: (&ProxyPair, Option<&Config>),
) -> Result<Final, DBusError> {
    let (session_pair, Some(session_config)) = session else {
        return Err(DBusError::NoSession);
    };
    let mut out = Final {
        session: session_pair.clone(),
        system: None,
        session_upstream: Vec::new(),
        system_upstream: Vec::new(),
        args: Vec::new(),
    };

    let mut args = Vec::new();
    for (pair, config, upstream) in [
        (session_pair, Some(session_config), &mut out.session_upstream),
        (system.0, system.1, &mut out.system_upstream),
    ] {
        let Some(config) = config else { continue };
        if !pair.socket.is_absolute() {
            return Err(DBusError::SocketPath(pair.socket.clone()));
        }
        config.check_interfaces()?;
        *upstream = parse(&pair.upstream).map_err(|source| DBusError::Address {
            bus: pair.upstream.clone(),
            source,
        })?;
        args.extend(config.args(&pair.upstream, &pair.socket.to_string_lossy()));
    }
    if system.1.is_some() {
        out.system = Some(system.0.clone());
    }

    for arg in &args {
        if arg.contains('\0') {
            return Err(DBusError::Nul);
        }
        out.args.extend_from_slice(arg.as_bytes());
        out.args.push(0);
    }
    Ok(out)
}
