//! Turn an [`AppConfig`] into container parameters and host operations.
//!
//! Host side layout for invoking uid `U`, instance `I` and identity `A`:
//!
//! ```text
//! $TMPDIR/hakurei.U/                  share, 0711, kept
//! ├── runtime/A/                      inner XDG_RUNTIME_DIR, kept
//! ├── tmpdir/A/                       inner /tmp, 01700, kept
//! └── I/                              per instance, 0711
//!     ├── wayland                     security context socket
//!     ├── bus                         session bus proxy
//!     └── system_bus_socket           system bus proxy
//! $XDG_RUNTIME_DIR/hakurei/
//! ├── state/                          instance records
//! └── I/                              per instance, 0700
//!     └── pulse                       hard link to the PulseAudio socket
//! ```

use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hakurei_container::path::TMP;
use hakurei_container::{BindFlags, Ops, Params};
use hakurei_sys::seccomp::ExportFlag;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{AppConfig, ConfigError, Enablements};
use crate::identity::to_uid;
use crate::mediator::dbus::{self as bus, Config as BusConfig, DBusError};
use crate::mediator::pulse::{self, PulseError};
use crate::mediator::wayland::{self, FALLBACK_NAME, WAYLAND_DISPLAY};
use crate::shim::ShimParams;
use crate::state::InstanceId;
use crate::system::{Perms, Scope, System};

/// Host directories made available read-only when present.
pub const SYSTEM_DIRS: &[&str] = &[
    "/usr", "/bin", "/sbin", "/lib", "/lib64", "/lib32", "/nix", "/opt",
];

const DEFAULT_SHELL: &str = "/bin/sh";
const OVERFLOW_ID: u32 = 65534;

#[derive(Debug, Error)]
pub enum SealError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("unknown group {0:?}")]
    UnknownGroup(String),

    #[error("cannot look up group {name:?}: {source}")]
    GroupLookup {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("cannot find {name:?}: {source}")]
    Lookup {
        name: String,
        #[source]
        source: which::Error,
    },

    #[error("invalid environment variable {0:?}")]
    Env(String),

    #[error(transparent)]
    Pulse(#[from] PulseError),

    #[error(transparent)]
    DBus(#[from] DBusError),
}

/// The parts of the monitor's environment that sealing depends on.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub vars: BTreeMap<String, String>,
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
    pub overflow_uid: u32,
    pub overflow_gid: u32,
}

fn read_overflow(path: &str) -> u32 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(OVERFLOW_ID)
}

impl Environment {
    pub fn capture() -> Self {
        Self {
            vars: std::env::vars().collect(),
            uid: rustix::process::getuid().as_raw(),
            gid: rustix::process::getgid().as_raw(),
            pid: rustix::process::getpid().as_raw_nonzero().get(),
            overflow_uid: read_overflow("/proc/sys/kernel/overflowuid"),
            overflow_gid: read_overflow("/proc/sys/kernel/overflowgid"),
        }
    }

    pub fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// `key` if set to an absolute path.
    fn abs(&self, key: &str) -> Option<PathBuf> {
        self.var(key)
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
    }
}

/// Host directories shared between instances of one invoking user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// `$TMPDIR/hakurei.<uid>`.
    pub share: PathBuf,
    /// `$XDG_RUNTIME_DIR`, or a stand-in under `share` when unset.
    pub runtime: PathBuf,
    /// Hakurei's directory inside `runtime`.
    pub run_dir: PathBuf,
}

impl Paths {
    pub fn new(env: &Environment) -> Self {
        let tmp = env.abs("TMPDIR").unwrap_or_else(|| PathBuf::from("/tmp"));
        let share = tmp.join(format!("hakurei.{}", env.uid));
        match env.abs("XDG_RUNTIME_DIR") {
            Some(runtime) => Self {
                run_dir: runtime.join("hakurei"),
                runtime,
                share,
            },
            None => Self {
                runtime: share.join("run/compat"),
                run_dir: share.join("run"),
                share,
            },
        }
    }
}

/// A configuration ready to run.
#[derive(Debug)]
pub struct Sealed {
    pub id: InstanceId,
    pub config: AppConfig,
    /// Target uid.
    pub uid: u32,
    /// Supplementary group ids passed to hsu.
    pub groups: Vec<u32>,
    pub sys: System,
    pub shim: ShimParams,
    pub paths: Paths,
}

impl Sealed {
    pub fn identity(&self) -> u32 {
        self.config.identity
    }

    pub fn wait_delay(&self) -> Duration {
        self.shim.wait_delay
    }
}

fn lookup_group(name: &str) -> Result<u32, SealError> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    let cname = CString::new(name).map_err(|_| SealError::UnknownGroup(name.to_owned()))?;
    // SAFETY: zeroed group is a valid out parameter.
    let mut grp: libc::group = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::group = std::ptr::null_mut();
    let mut buf = vec![0 as libc::c_char; 1024];
    loop {
        // SAFETY: every pointer is valid for the duration of the call.
        let ret = unsafe {
            libc::getgrnam_r(
                cname.as_ptr(),
                &mut grp,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };
        match ret {
            0 if result.is_null() => return Err(SealError::UnknownGroup(name.to_owned())),
            0 => return Ok(grp.gr_gid),
            libc::ERANGE if buf.len() < 1 << 20 => buf.resize(buf.len() * 2, 0),
            libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => {
                return Err(SealError::UnknownGroup(name.to_owned()));
            }
            errno => {
                return Err(SealError::GroupLookup {
                    name: name.to_owned(),
                    source: io::Error::from_raw_os_error(errno),
                });
            }
        }
    }
}

/// Builder state shared by the enablement steps.
struct Builder<'a> {
    id: InstanceId,
    aid: u32,
    paths: &'a Paths,
    sys: System,
    ops: Ops,
    env: BTreeMap<String, String>,
    /// `/run/user/<mapuid>`.
    inner_runtime: PathBuf,
    use_runtime_dir: bool,
    instance: Option<PathBuf>,
    runtime_instance: Option<PathBuf>,
}

impl Builder<'_> {
    /// Make the runtime directories traversable by the target user.
    fn ensure_runtime_dir(&mut self) {
        if std::mem::replace(&mut self.use_runtime_dir, true) {
            return;
        }
        self.sys
            .ensure(&self.paths.run_dir, 0o700)
            .update_perm_type(Scope::USER, &self.paths.run_dir, Perms::EXECUTE)
            .ensure(&self.paths.runtime, 0o700)
            .update_perm_type(Scope::USER, &self.paths.runtime, Perms::EXECUTE);
    }

    /// Per-instance directory under `share`.
    fn instance(&mut self) -> PathBuf {
        if let Some(p) = &self.instance {
            return p.clone();
        }
        let p = self.paths.share.join(self.id.to_string());
        self.sys.ephemeral(Scope::PROCESS, &p, 0o711);
        self.instance = Some(p.clone());
        p
    }

    /// Per-instance directory under the runtime directory.
    fn runtime(&mut self) -> PathBuf {
        if let Some(p) = &self.runtime_instance {
            return p.clone();
        }
        self.ensure_runtime_dir();
        let p = self.paths.run_dir.join(self.id.to_string());
        self.sys
            .ephemeral(Scope::PROCESS, &p, 0o700)
            .update_perm(&p, Perms::EXECUTE);
        self.runtime_instance = Some(p.clone());
        p
    }

    fn runtime_share(&mut self) {
        let dir = self.paths.share.join("runtime");
        let inst = dir.join(self.aid.to_string());
        self.sys
            .ensure(&dir, 0o700)
            .update_perm_type(Scope::USER, &dir, Perms::EXECUTE)
            .ensure(&inst, 0o700)
            .update_perm_type(Scope::USER, &inst, Perms::all());
        self.ops
            .tmpfs("/run/user", 1 << 12, 0o755)
            .bind(inst, &self.inner_runtime, BindFlags::WRITABLE);
        self.env.insert(
            "XDG_RUNTIME_DIR".into(),
            self.inner_runtime.to_string_lossy().into_owned(),
        );
        self.env.insert("XDG_SESSION_CLASS".into(), "user".into());
    }

    fn tmpdir(&mut self) {
        let dir = self.paths.share.join("tmpdir");
        let inst = dir.join(self.aid.to_string());
        self.sys
            .ensure(&dir, 0o700)
            .update_perm_type(Scope::USER, &dir, Perms::EXECUTE)
            .ensure(&inst, 0o1700)
            .update_perm_type(Scope::USER, &inst, Perms::all());
        self.ops.bind(inst, "/tmp", BindFlags::WRITABLE);
    }

    fn wayland(&mut self, env: &Environment, config: &AppConfig) {
        let socket = wayland::display_path(&self.paths.runtime, env.var(WAYLAND_DISPLAY));
        if env.var(WAYLAND_DISPLAY).is_none() {
            debug!("{WAYLAND_DISPLAY} is not set, assuming {FALLBACK_NAME}");
        }
        let inner = self.inner_runtime.join(FALLBACK_NAME);
        self.env.insert(WAYLAND_DISPLAY.into(), FALLBACK_NAME.into());

        if config.direct_wayland {
            warn!("direct wayland access, PROCEED WITH CAUTION");
            self.ensure_runtime_dir();
            self.sys
                .update_perm_type(Scope::WAYLAND, &socket, Perms::all());
            self.ops.bind(socket, inner, BindFlags::empty());
        } else {
            let app_id = if config.id.is_empty() {
                format!("app.hakurei.{}", self.id)
            } else {
                config.id.clone()
            };
            let dst = self.instance().join("wayland");
            self.sys
                .wayland(&dst, socket, app_id, self.id.to_string());
            self.ops.bind(dst, inner, BindFlags::empty());
        }
    }

    fn pulse(&mut self, env: &Environment) -> Result<(), SealError> {
        let socket = pulse::check_socket(&self.paths.runtime)?;
        let link = self.runtime().join("pulse");
        self.sys.link(socket, &link);

        let inner = self.inner_runtime.join("pulse/native");
        self.ops.bind(link, &inner, BindFlags::empty());
        self.env.insert(
            pulse::ENV_SERVER.into(),
            format!("unix:{}", inner.display()),
        );

        match pulse::discover_cookie(|k| env.var(k).map(str::to_owned))? {
            Some(path) => {
                let cookie = pulse::load_cookie(&path)?;
                let dst = Path::new(TMP).join("pulse-cookie");
                self.env.insert(
                    pulse::ENV_COOKIE.into(),
                    dst.to_string_lossy().into_owned(),
                );
                self.ops.place(dst, cookie.to_vec());
            }
            None => debug!(
                "cannot locate PulseAudio cookie (tried $PULSE_COOKIE, $HOME/.pulse-cookie, $XDG_CONFIG_HOME/pulse/cookie)"
            ),
        }
        Ok(())
    }

    fn dbus(&mut self, config: &AppConfig) -> Result<(), SealError> {
        let app_id = if config.id.is_empty() {
            format!("app.hakurei.{}", self.id)
        } else {
            config.id.clone()
        };
        let session = config
            .session_bus
            .clone()
            .unwrap_or_else(|| BusConfig::new(&app_id, true, true));

        let inst = self.instance();
        let session_path = inst.join("bus");
        let system_path = inst.join("system_bus_socket");
        self.sys.proxy_dbus(
            Some(&session),
            config.system_bus.as_ref(),
            &session_path,
            &system_path,
        )?;
        self.sys
            .update_perm(&session_path, Perms::READ | Perms::WRITE);

        let session_inner = self.inner_runtime.join("bus");
        self.env.insert(
            bus::ENV_SESSION_BUS.into(),
            format!("unix:path={}", session_inner.display()),
        );
        self.ops.bind(session_path, session_inner, BindFlags::empty());

        if config.system_bus.is_some() {
            self.sys
                .update_perm(&system_path, Perms::READ | Perms::WRITE);
            let system_inner = PathBuf::from("/run/dbus/system_bus_socket");
            self.env.insert(
                bus::ENV_SYSTEM_BUS.into(),
                format!("unix:path={}", system_inner.display()),
            );
            self.ops.bind(system_path, system_inner, BindFlags::empty());
        }
        Ok(())
    }
}

/// Resolve the payload before hsu clears the environment.
fn resolve_command(
    config: &AppConfig,
    env: &Environment,
    shell: &Path,
) -> Result<(PathBuf, Vec<String>), SealError> {
    let path = match (&config.path, config.args.first()) {
        (Some(path), _) => path.clone(),
        (None, Some(arg0)) if Path::new(arg0).is_absolute() => PathBuf::from(arg0),
        (None, Some(arg0)) => {
            which::which_in(arg0, env.var("PATH"), "/").map_err(|source| SealError::Lookup {
                name: arg0.clone(),
                source,
            })?
        }
        (None, None) => shell.to_path_buf(),
    };
    let args = if config.args.is_empty() {
        vec![path.to_string_lossy().into_owned()]
    } else {
        config.args.clone()
    };
    Ok((path, args))
}

/// Seal `config` for invoking user `fid`.
pub fn seal(
    config: AppConfig,
    env: &Environment,
    fid: u32,
    id: InstanceId,
    verbose: bool,
) -> Result<Sealed, SealError> {
    config.validate()?;

    let uid = to_uid(fid, config.identity);
    let groups = config
        .groups
        .iter()
        .map(|g| lookup_group(g))
        .collect::<Result<Vec<_>, _>>()?;
    if !groups.is_empty() {
        debug!(?groups, "attaching supplementary group ids");
    }

    let paths = Paths::new(env);
    let (mapuid, mapgid) = if config.map_real_uid {
        (env.uid, env.gid)
    } else {
        (env.overflow_uid, env.overflow_gid)
    };

    let shell = config
        .shell
        .clone()
        .or_else(|| env.abs("SHELL"))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
    let (path, args) = resolve_command(&config, env, &shell)?;

    let mut b = Builder {
        id,
        aid: config.identity,
        paths: &paths,
        sys: System::new(uid),
        ops: Ops::new(),
        env: config.env.clone(),
        inner_runtime: PathBuf::from(format!("/run/user/{mapuid}")),
        use_runtime_dir: false,
        instance: None,
        runtime_instance: None,
    };
    b.sys.ensure(&paths.share, 0o711);

    b.ops
        .proc("/proc")
        .tmpfs(TMP, 1 << 12, 0o755)
        .dev("/dev", true);
    for dir in SYSTEM_DIRS {
        b.ops.bind(*dir, *dir, BindFlags::OPTIONAL);
    }
    if config.enablements.contains(Enablements::WAYLAND) {
        b.ops.bind(
            "/dev/dri",
            "/dev/dri",
            BindFlags::DEVICE | BindFlags::WRITABLE | BindFlags::OPTIONAL,
        );
    }
    b.ops.bind(
        "/dev/kvm",
        "/dev/kvm",
        BindFlags::DEVICE | BindFlags::WRITABLE | BindFlags::OPTIONAL,
    );
    b.ops.etc("/etc", id.to_string());

    b.runtime_share();
    b.tmpdir();

    let home = config.inner_home().to_path_buf();
    b.ops.bind(&config.data, &home, BindFlags::WRITABLE);
    b.ops.place(
        "/etc/passwd",
        format!(
            "{}:x:{mapuid}:{mapgid}:Hakurei:{}:{}\n",
            config.username,
            home.display(),
            shell.display()
        ),
    );
    b.ops.place("/etc/group", format!("hakurei:x:{mapgid}:\n"));
    b.env.insert("HOME".into(), home.to_string_lossy().into_owned());
    b.env.insert("USER".into(), config.username.clone());
    b.env.insert("SHELL".into(), shell.to_string_lossy().into_owned());
    if let Some(term) = env.var("TERM") {
        b.env.insert("TERM".into(), term.to_owned());
    }

    let session_type = if config.enablements.contains(Enablements::WAYLAND) {
        b.wayland(env, &config);
        "wayland"
    } else {
        "tty"
    };
    b.env.insert("XDG_SESSION_TYPE".into(), session_type.into());
    if config.enablements.contains(Enablements::PULSE) {
        b.pulse(env)?;
    }
    if config.enablements.contains(Enablements::DBUS) {
        b.dbus(&config)?;
    }

    for spec in &config.binds {
        b.ops.bind(&spec.source, spec.target(), spec.flags);
    }
    b.ops.remount("/", libc::MS_RDONLY);

    let mut flat = Vec::with_capacity(b.env.len());
    for (k, v) in &b.env {
        if k.contains('=') {
            return Err(SealError::Env(k.clone()));
        }
        flat.push(format!("{k}={v}"));
    }

    let params = Params {
        dir: home,
        env: flat,
        path,
        args,
        uid: mapuid as i32,
        gid: mapgid as i32,
        hostname: config.hostname.clone(),
        ops: b.ops,
        seccomp_flags: if config.multiarch {
            ExportFlag::ALLOW_MULTIARCH
        } else {
            ExportFlag::empty()
        },
        privileged: config.privileged,
        flags: config.flags,
        ..Params::default()
    };

    info!(%id, uid, aid = config.identity, enablements = %config.enablements, "sealed instance");
    let shim = ShimParams {
        monitor_pid: env.pid,
        wait_delay: config.effective_wait_delay(),
        params,
        home: config.data.clone(),
        verbose,
    };
    Ok(Sealed {
        id,
        uid,
        groups,
        sys: b.sys,
        shim,
        paths,
        config,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixListener;

    use hakurei_container::Op;

    use super::*;
    use crate::config::BindSpec;
    use crate::system::Op as _;

    fn env(root: &Path) -> Environment {
        let vars = [
            ("TMPDIR", root.join("tmp")),
            ("XDG_RUNTIME_DIR", root.join("run")),
            ("HOME", root.join("home")),
            ("SHELL", PathBuf::from("/bin/zsh")),
            ("PATH", PathBuf::from("/usr/bin:/bin")),
            ("TERM", PathBuf::from("xterm")),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_string_lossy().into_owned()))
        .collect();
        Environment {
            vars,
            uid: 1000,
            gid: 100,
            pid: 4242,
            overflow_uid: 65534,
            overflow_gid: 65534,
        }
    }

    fn config() -> AppConfig {
        let mut c = AppConfig::new(9, "/var/lib/hakurei/u0/a9").id("org.example.App");
        c.path = Some("/bin/true".into());
        c
    }

    fn env_of(sealed: &Sealed) -> BTreeMap<&str, &str> {
        sealed
            .shim
            .params
            .env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .collect()
    }

    fn places(sealed: &Sealed) -> Vec<(&Path, &[u8])> {
        sealed
            .shim
            .params
            .ops
            .iter()
            .filter_map(|op| match op {
                Op::Tmpfile(t) => Some((t.path.as_path(), t.data.as_slice())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn paths_fallback() {
        let mut e = env(Path::new("/x"));
        let p = Paths::new(&e);
        assert_eq!(p.share, Path::new("/x/tmp/hakurei.1000"));
        assert_eq!(p.runtime, Path::new("/x/run"));
        assert_eq!(p.run_dir, Path::new("/x/run/hakurei"));

        e.vars.remove("XDG_RUNTIME_DIR");
        e.vars.remove("TMPDIR");
        let p = Paths::new(&e);
        assert_eq!(p.share, Path::new("/tmp/hakurei.1000"));
        assert_eq!(p.runtime, Path::new("/tmp/hakurei.1000/run/compat"));
        assert_eq!(p.run_dir, Path::new("/tmp/hakurei.1000/run"));
    }

    #[test]
    fn minimal() {
        let dir = tempfile::tempdir().unwrap();
        let id = InstanceId::random();
        let sealed = seal(config(), &env(dir.path()), 0, id, false).unwrap();

        assert_eq!(sealed.uid, 1_000_009);
        assert_eq!(sealed.shim.monitor_pid, 4242);
        assert_eq!(sealed.wait_delay(), Duration::from_secs(5));
        let params = &sealed.shim.params;
        assert_eq!(params.path, Path::new("/bin/true"));
        assert_eq!(params.args, ["/bin/true"]);
        assert_eq!(params.uid, 65534);
        assert_eq!(params.dir, Path::new("/var/lib/hakurei/u0/a9"));
        assert!(params.env.windows(2).all(|w| w[0] <= w[1]));

        let ops: Vec<&Op> = params.ops.iter().collect();
        assert!(matches!(ops[0], Op::Proc(_)));
        assert!(matches!(ops[1], Op::Tmpfs(t) if t.target == Path::new(TMP)));
        assert!(matches!(ops[2], Op::Dev(_)));
        assert!(matches!(ops.last(), Some(Op::Remount(r)) if r.target == Path::new("/")));
        assert!(ops.iter().any(|op| matches!(op, Op::AutoEtc(_))));

        let e = env_of(&sealed);
        assert_eq!(e["HOME"], "/var/lib/hakurei/u0/a9");
        assert_eq!(e["SHELL"], "/bin/zsh");
        assert_eq!(e["USER"], "chronos");
        assert_eq!(e["TERM"], "xterm");
        assert_eq!(e["XDG_RUNTIME_DIR"], "/run/user/65534");
        assert_eq!(e["XDG_SESSION_TYPE"], "tty");
        assert!(!e.contains_key(WAYLAND_DISPLAY));

        let placed = places(&sealed);
        assert_eq!(
            placed[0],
            (
                Path::new("/etc/passwd"),
                b"chronos:x:65534:65534:Hakurei:/var/lib/hakurei/u0/a9:/bin/zsh\n".as_slice()
            )
        );
        assert_eq!(placed[1], (Path::new("/etc/group"), b"hakurei:x:65534:\n".as_slice()));

        let share = dir.path().join("tmp/hakurei.1000");
        let sys_paths: Vec<&Path> = sealed.sys.ops().iter().map(|op| op.path()).collect();
        assert_eq!(sys_paths[0], share);
        assert!(sys_paths.contains(&share.join("tmpdir/9").as_path()));
        assert!(sys_paths.contains(&share.join("runtime/9").as_path()));
        // nothing per instance without enablements
        assert!(!sys_paths.iter().any(|p| p.ends_with(id.to_string())));
    }

    #[test]
    fn real_uid_and_command_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = AppConfig::new(1, "/home/app").command(["/bin/sh", "-c", "true"]);
        c.map_real_uid = true;
        c.multiarch = true;
        let sealed = seal(c, &env(dir.path()), 2, InstanceId::random(), true).unwrap();
        assert_eq!(sealed.uid, 1_020_001);
        assert!(sealed.shim.verbose);
        let params = &sealed.shim.params;
        assert_eq!((params.uid, params.gid), (1000, 100));
        assert_eq!(params.path, Path::new("/bin/sh"));
        assert_eq!(params.args, ["/bin/sh", "-c", "true"]);
        assert_eq!(params.seccomp_flags, ExportFlag::ALLOW_MULTIARCH);
        assert_eq!(env_of(&sealed)["XDG_RUNTIME_DIR"], "/run/user/1000");

        let c = AppConfig::new(1, "/home/app");
        let sealed = seal(c, &env(dir.path()), 0, InstanceId::random(), false).unwrap();
        assert_eq!(sealed.shim.params.path, Path::new("/bin/zsh"));

        let c = AppConfig::new(1, "/home/app").command(["definitely-not-a-command-anywhere"]);
        assert!(matches!(
            seal(c, &env(dir.path()), 0, InstanceId::random(), false),
            Err(SealError::Lookup { .. })
        ));
    }

    #[test]
    fn extra_binds_before_remount() {
        let dir = tempfile::tempdir().unwrap();
        let c = config().bind("/srv/data:/data:rw".parse::<BindSpec>().unwrap());
        let sealed = seal(c, &env(dir.path()), 0, InstanceId::random(), false).unwrap();
        let ops: Vec<&Op> = sealed.shim.params.ops.iter().collect();
        let n = ops.len();
        assert!(matches!(
            ops[n - 2],
            Op::Bind(b) if b.target == Path::new("/data") && b.flags == BindFlags::WRITABLE
        ));
    }

    #[test]
    fn wayland_security_context() {
        let dir = tempfile::tempdir().unwrap();
        let id = InstanceId::random();
        let c = config().enable(Enablements::WAYLAND);
        let sealed = seal(c, &env(dir.path()), 0, id, false).unwrap();

        let e = env_of(&sealed);
        assert_eq!(e[WAYLAND_DISPLAY], "wayland-0");
        assert_eq!(e["XDG_SESSION_TYPE"], "wayland");
        let dst = dir
            .path()
            .join("tmp/hakurei.1000")
            .join(id.to_string())
            .join("wayland");
        assert!(sealed.shim.params.ops.iter().any(|op| matches!(
            op,
            Op::Bind(b) if b.source == dst && b.target == Path::new("/run/user/65534/wayland-0")
        )));
        assert!(sealed.sys.ops().iter().any(|op| op.path() == dst));
    }

    #[test]
    fn wayland_direct() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = config().enable(Enablements::WAYLAND);
        c.direct_wayland = true;
        let mut e = env(dir.path());
        e.vars.insert(WAYLAND_DISPLAY.into(), "wayland-1".into());
        let sealed = seal(c, &e, 0, InstanceId::random(), false).unwrap();

        let socket = dir.path().join("run/wayland-1");
        assert!(sealed.shim.params.ops.iter().any(|op| matches!(
            op,
            Op::Bind(b) if b.source == socket
        )));
        let acl = sealed
            .sys
            .ops()
            .iter()
            .find(|op| op.path() == socket)
            .unwrap();
        assert_eq!(acl.scope(), Scope::WAYLAND);
    }

    #[test]
    fn pulse_cookie_and_socket() {
        let dir = tempfile::tempdir().unwrap();
        let e = env(dir.path());
        let (pulse_dir, socket) = pulse::paths(&dir.path().join("run"));
        fs::create_dir_all(&pulse_dir).unwrap();
        let _listener = UnixListener::bind(&socket).unwrap();
        fs::set_permissions(&socket, fs::Permissions::from_mode(0o777)).unwrap();
        fs::create_dir_all(dir.path().join("home")).unwrap();
        fs::write(dir.path().join("home/.pulse-cookie"), [0xa5u8; 16]).unwrap();

        let id = InstanceId::random();
        let c = config().enable(Enablements::PULSE);
        let sealed = seal(c, &e, 0, id, false).unwrap();

        let env = env_of(&sealed);
        assert_eq!(env[pulse::ENV_SERVER], "unix:/run/user/65534/pulse/native");
        assert_eq!(env[pulse::ENV_COOKIE], "/.hakurei/pulse-cookie");
        let placed = places(&sealed);
        let (_, cookie) = placed
            .iter()
            .find(|(p, _)| *p == Path::new("/.hakurei/pulse-cookie"))
            .unwrap();
        assert_eq!(cookie.len(), pulse::COOKIE_SIZE);
        assert_eq!(&cookie[..16], &[0xa5u8; 16]);

        let link = dir.path().join("run/hakurei").join(id.to_string()).join("pulse");
        assert!(sealed.sys.ops().iter().any(|op| op.path() == link));
    }

    #[test]
    fn pulse_missing() {
        let dir = tempfile::tempdir().unwrap();
        let c = config().enable(Enablements::PULSE);
        assert!(matches!(
            seal(c, &env(dir.path()), 0, InstanceId::random(), false),
            Err(SealError::Pulse(PulseError::NoDirectory(_)))
        ));
    }

    #[test]
    fn invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let c = AppConfig::new(10000, "/home/app");
        assert!(matches!(
            seal(c, &env(dir.path()), 0, InstanceId::random(), false),
            Err(SealError::Config(ConfigError::Identity(10000)))
        ));
    }

    #[test]
    fn numeric_groups() {
        assert_eq!(lookup_group("27").unwrap(), 27);
        assert!(matches!(
            lookup_group("no-such-group-hopefully"),
            Err(SealError::UnknownGroup(_))
        ));
    }
}
