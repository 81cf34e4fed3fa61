//! Application configuration.
//!
//! ## Example
//!
//! ```ignore
//! use hakurei_app::config::{AppConfig, Enablements};
//!
//! let config = AppConfig::new(9, "/var/lib/hakurei/u0/a9")
//!     .id("org.chromium.Chromium")
//!     .enable(Enablements::WAYLAND | Enablements::DBUS | Enablements::PULSE)
//!     .bind("/dev/dri".parse()?)
//!     .command(["chromium", "--ignore-gpu-blocklist"]);
//! config.validate()?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use bitflags::bitflags;
use hakurei_container::{BindFlags, HardeningFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{IDENTITY_MAX, check_identity};
use crate::mediator::dbus::{BadInterface, Config as BusConfig};

/// Default delay between the cancel signal and `SIGKILL`.
pub const DEFAULT_WAIT_DELAY: Duration = Duration::from_secs(5);
/// Upper bound on the configured wait delay.
pub const MAX_WAIT_DELAY: Duration = Duration::from_secs(30);
/// User name inside the container when none is configured.
pub const DEFAULT_USERNAME: &str = "chronos";

bitflags! {
    /// Host services exposed to the application.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Enablements: u32 {
        const WAYLAND = 1 << 0;
        const DBUS = 1 << 1;
        const PULSE = 1 << 2;
    }
}

impl fmt::Display for Enablements {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(no enablements)");
        }
        let names: Vec<&str> = self
            .iter_names()
            .map(|(name, _)| match name {
                "WAYLAND" => "wayland",
                "DBUS" => "dbus",
                "PULSE" => "pulseaudio",
                other => other,
            })
            .collect();
        f.write_str(&names.join(", "))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("identity {0} out of range 0..={IDENTITY_MAX}")]
    Identity(u32),

    #[error("{field} path {path:?} is not absolute")]
    NotAbsolute { field: &'static str, path: PathBuf },

    #[error("invalid environment variable name {0:?}")]
    EnvKey(String),

    #[error("invalid bind {0:?}")]
    Bind(String),

    #[error("wait delay {0:?} exceeds {MAX_WAIT_DELAY:?}")]
    WaitDelay(Duration),

    #[error("invalid username {0:?}")]
    Username(String),

    #[error(transparent)]
    Interface(#[from] BadInterface),
}

/// A host path made available inside the container.
///
/// Parsed from `SOURCE[:TARGET][:OPTIONS]`, where `OPTIONS` is a comma
/// separated list of `rw`, `dev` and `opt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindSpec {
    pub source: PathBuf,
    /// Defaults to `source`.
    pub target: Option<PathBuf>,
    pub flags: BindFlags,
}

impl BindSpec {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: None,
            flags: BindFlags::empty(),
        }
    }

    pub fn target(&self) -> &Path {
        self.target.as_deref().unwrap_or(&self.source)
    }
}

fn parse_bind_flags(s: &str) -> Option<BindFlags> {
    s.split(',').try_fold(BindFlags::empty(), |acc, f| {
        Some(
            acc | match f {
                "rw" => BindFlags::WRITABLE,
                "dev" => BindFlags::DEVICE,
                "opt" => BindFlags::OPTIONAL,
                _ => return None,
            },
        )
    })
}

impl FromStr for BindSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || ConfigError::Bind(s.to_owned());
        let mut parts = s.splitn(3, ':');
        let source = parts.next().filter(|p| p.starts_with('/')).ok_or_else(bad)?;
        let mut spec = Self::new(source);
        match (parts.next(), parts.next()) {
            (None, _) => {}
            (Some(target), None) if target.starts_with('/') => spec.target = Some(target.into()),
            (Some(flags), None) => spec.flags = parse_bind_flags(flags).ok_or_else(bad)?,
            (Some(target), Some(flags)) if target.starts_with('/') => {
                spec.target = Some(target.into());
                spec.flags = parse_bind_flags(flags).ok_or_else(bad)?;
            }
            _ => return Err(bad()),
        }
        Ok(spec)
    }
}

impl fmt::Display for BindSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source.display())?;
        if let Some(target) = &self.target {
            write!(f, ":{}", target.display())?;
        }
        let flags: Vec<&str> = [
            (BindFlags::WRITABLE, "rw"),
            (BindFlags::DEVICE, "dev"),
            (BindFlags::OPTIONAL, "opt"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.flags.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if !flags.is_empty() {
            write!(f, ":{}", flags.join(","))?;
        }
        Ok(())
    }
}

/// Everything needed to run one application instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Reverse-DNS application id, used for D-Bus ownership and the Wayland
    /// security context.
    pub id: String,
    /// Application identity, selecting the target uid.
    pub identity: u32,
    /// Supplementary groups, by name or number.
    pub groups: Vec<String>,
    pub enablements: Enablements,
    /// Expose the compositor socket directly instead of a security context.
    pub direct_wayland: bool,
    /// Session bus rules; defaults are derived from `id` when
    /// [`Enablements::DBUS`] is set.
    pub session_bus: Option<BusConfig>,
    pub system_bus: Option<BusConfig>,

    /// Home directory on the host.
    pub data: PathBuf,
    /// Home directory inside the container; defaults to `data`.
    pub home: Option<PathBuf>,
    pub username: String,
    /// Defaults to `/bin/sh`.
    pub shell: Option<PathBuf>,
    /// Payload executable; looked up from `args[0]` when unset.
    pub path: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub hostname: String,

    pub binds: Vec<BindSpec>,
    pub flags: HardeningFlags,
    /// Allow 32-bit syscalls.
    pub multiarch: bool,
    /// Keep `CAP_SYS_ADMIN` inside the container.
    pub privileged: bool,
    /// Map the target uid to the invoking user's uid inside the container.
    pub map_real_uid: bool,
    pub wait_delay: Option<Duration>,
}

impl AppConfig {
    pub fn new(identity: u32, data: impl Into<PathBuf>) -> Self {
        Self {
            id: String::new(),
            identity,
            groups: Vec::new(),
            enablements: Enablements::empty(),
            direct_wayland: false,
            session_bus: None,
            system_bus: None,
            data: data.into(),
            home: None,
            username: DEFAULT_USERNAME.to_owned(),
            shell: None,
            path: None,
            args: Vec::new(),
            env: BTreeMap::new(),
            hostname: String::new(),
            binds: Vec::new(),
            flags: HardeningFlags::empty(),
            multiarch: false,
            privileged: false,
            map_real_uid: false,
            wait_delay: None,
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn enable(mut self, e: Enablements) -> Self {
        self.enablements |= e;
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }

    pub fn bind(mut self, spec: BindSpec) -> Self {
        self.binds.push(spec);
        self
    }

    pub fn home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    pub fn username(mut self, name: impl Into<String>) -> Self {
        self.username = name.into();
        self
    }

    pub fn shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = Some(shell.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn command<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn flags(mut self, flags: HardeningFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn session_bus(mut self, config: BusConfig) -> Self {
        self.session_bus = Some(config);
        self
    }

    pub fn system_bus(mut self, config: BusConfig) -> Self {
        self.system_bus = Some(config);
        self
    }

    pub fn wait_delay(mut self, delay: Duration) -> Self {
        self.wait_delay = Some(delay);
        self
    }

    pub fn inner_home(&self) -> &Path {
        self.home.as_deref().unwrap_or(&self.data)
    }

    pub fn effective_wait_delay(&self) -> Duration {
        self.wait_delay.unwrap_or(DEFAULT_WAIT_DELAY)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_identity(self.identity).map_err(|_| ConfigError::Identity(self.identity))?;

        let abs = |field, path: &Path| {
            if path.is_absolute() {
                Ok(())
            } else {
                Err(ConfigError::NotAbsolute {
                    field,
                    path: path.to_path_buf(),
                })
            }
        };
        abs("data", &self.data)?;
        if let Some(home) = &self.home {
            abs("home", home)?;
        }
        if let Some(shell) = &self.shell {
            abs("shell", shell)?;
        }
        if let Some(path) = &self.path {
            abs("path", path)?;
        }
        for bind in &self.binds {
            abs("bind source", &bind.source)?;
            abs("bind target", bind.target())?;
        }

        if self.username.is_empty()
            || !self
                .username
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        {
            return Err(ConfigError::Username(self.username.clone()));
        }

        for key in self.env.keys() {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(ConfigError::EnvKey(key.clone()));
            }
        }

        if let Some(delay) = self.wait_delay {
            if delay > MAX_WAIT_DELAY {
                return Err(ConfigError::WaitDelay(delay));
            }
        }

        for bus in self.session_bus.iter().chain(&self.system_bus) {
            bus.check_interfaces()?;
        }
        Ok(())
    }
}
