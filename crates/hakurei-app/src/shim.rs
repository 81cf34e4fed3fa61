//! The shim: runs as the target user between hsu and the container.
//!
//! The monitor cannot signal the shim once hsu has switched uids, except for
//! `SIGCONT`, which is allowed within a session. The shim therefore treats a
//! `SIGCONT` sent by the monitor as an exit request, and sets `SIGCONT` as
//! its parent death signal so that losing the monitor is reported the same
//! way.

use std::fs::{self, DirBuilder, File};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use hakurei_container::setup::{self, SetupError};
use hakurei_container::{Container, ContainerError, Params};
use hakurei_sys::process::{Dumpable, set_dumpable, set_pdeathsig};
use hakurei_sys::seccomp::{self, ExportFlag, FilterPreset, SeccompError};
use hakurei_sys::signal::{ContMessage, SignalFd, setup_cont};
use rustix::io::Errno;
use rustix::pipe::{PipeFlags, pipe_with};
use rustix::process::Signal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info};

const TARGET: &str = "hakurei::shim";

/// Environment variable carrying the shim setup descriptor.
pub const ENV_SHIM: &str = "HAKUREI_SHIM";
/// Older name of [`ENV_SHIM`], still accepted.
pub const ENV_SHIM_COMPAT: &str = "FORTIFY_SHIM";

/// The monitor asked the shim to exit.
pub const EXIT_REQUEST: i32 = 254;
/// The monitor died before asking.
pub const EXIT_ORPHAN: i32 = 3;
/// The container was canceled by `SIGINT` or `SIGTERM`.
pub const EXIT_CANCEL: i32 = 2;
/// The container could not be waited for.
pub const EXIT_WAIT: i32 = 127;
/// Setup failed before the container ran.
pub const EXIT_FAILURE: i32 = 1;

/// Everything the shim needs, sent by the monitor over the setup pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimParams {
    /// Pid of the monitor, the only process allowed to request exit.
    pub monitor_pid: i32,
    /// Delay between `SIGINT` to the container and `SIGKILL`.
    pub wait_delay: Duration,
    pub params: Params,
    /// Home directory on the host, created if missing.
    pub home: PathBuf,
    pub verbose: bool,
}

impl ShimParams {
    pub fn valid(&self) -> bool {
        self.monitor_pid > 0 && !self.params.ops.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ShimError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error("invalid shim parameters")]
    Invalid,

    #[error("cannot {0}: {1}")]
    Sys(&'static str, Errno),

    #[error("path {0:?} is not a directory")]
    HomeNotDir(PathBuf),

    #[error("cannot create home directory {path:?}: {source}")]
    Home {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot start container: {0}")]
    Start(#[source] ContainerError),

    #[error("cannot configure container: {0}")]
    Serve(#[source] ContainerError),

    #[error("cannot load syscall filter: {0}")]
    Seccomp(#[from] SeccompError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn sys(action: &'static str) -> impl FnOnce(Errno) -> ShimError {
    move |errno| ShimError::Sys(action, errno)
}

/// Entry point of `hakurei shim`. `init_log` is called once with the
/// verbosity sent by the monitor.
pub fn main(init_log: impl FnOnce(bool)) -> ! {
    let mut init_log = Some(init_log);
    let code = match run(&mut init_log) {
        Ok(code) => code,
        Err(e) => {
            if let Some(f) = init_log.take() {
                f(false);
            }
            error!(target: TARGET, "{e}");
            EXIT_FAILURE
        }
    };
    std::process::exit(code)
}

fn receive() -> Result<ShimParams, SetupError> {
    let mut pipe: File = match setup::take_fd(ENV_SHIM) {
        Err(SetupError::NotSet(_)) => setup::take_fd(ENV_SHIM_COMPAT)
            .map_err(|e| match e {
                SetupError::NotSet(_) => SetupError::NotSet(ENV_SHIM),
                e => e,
            })?,
        r => r?,
    };
    setup::receive(&mut pipe)
}

/// Create `home` with mode `0700` if missing.
fn ensure_home(home: &Path) -> Result<(), ShimError> {
    match fs::metadata(home) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(ShimError::HomeNotDir(home.to_path_buf())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(target: TARGET, "creating home directory {home:?}");
            DirBuilder::new()
                .mode(0o700)
                .create(home)
                .map_err(|source| ShimError::Home {
                    path: home.to_path_buf(),
                    source,
                })
        }
        Err(source) => Err(ShimError::Home {
            path: home.to_path_buf(),
            source,
        }),
    }
}

/// Act on messages from the `SIGCONT` handler until told to exit.
fn handle_cont(mut pipe: File) {
    let mut b = [0u8; 1];
    loop {
        match pipe.read(&mut b) {
            Ok(1) => {}
            Ok(_) => {
                error!(target: TARGET, "signal pipe closed");
                std::process::exit(EXIT_FAILURE);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(target: TARGET, "cannot read from signal pipe: {e}");
                std::process::exit(EXIT_FAILURE);
            }
        }
        match ContMessage::try_from(b[0]) {
            Ok(ContMessage::ExitRequested) => {
                info!(target: TARGET, "exit requested by monitor");
                std::process::exit(EXIT_REQUEST);
            }
            Ok(ContMessage::Orphaned) => std::process::exit(EXIT_ORPHAN),
            Ok(ContMessage::Invalid) => debug!(target: TARGET, "SIGCONT handler got invalid siginfo"),
            Ok(ContMessage::BadPid) => debug!(target: TARGET, "got SIGCONT from unexpected process"),
            Err(b) => {
                error!(target: TARGET, "got invalid message {b} from signal handler");
                std::process::exit(EXIT_FAILURE);
            }
        }
    }
}

/// Exit code of the shim for a container wait result.
pub fn exit_code(result: Result<i32, ContainerError>) -> i32 {
    match result {
        Ok(code) => code,
        Err(ContainerError::Canceled) => EXIT_CANCEL,
        Err(e) => {
            debug!(target: TARGET, "cannot wait: {e}");
            EXIT_WAIT
        }
    }
}

fn run<F: FnOnce(bool)>(init_log: &mut Option<F>) -> Result<i32, ShimError> {
    set_dumpable(Dumpable::Disable).map_err(sys("set dumpable"))?;

    let shim = receive()?;
    if let Some(f) = init_log.take() {
        f(shim.verbose);
    }
    if !shim.valid() {
        return Err(ShimError::Invalid);
    }
    debug!(target: TARGET, monitor = shim.monitor_pid, ops = shim.params.ops.len(), "received params");

    // blocked before any thread exists so every thread inherits the mask
    let interrupt = SignalFd::interrupt().map_err(sys("create signalfd"))?;

    let (cont_r, cont_w): (OwnedFd, OwnedFd) =
        pipe_with(PipeFlags::CLOEXEC).map_err(sys("create signal pipe"))?;
    setup_cont(shim.monitor_pid, cont_w.as_raw_fd()).map_err(sys("install SIGCONT handler"))?;
    // the handler writes here for the rest of the process lifetime
    let _ = cont_w.into_raw_fd();
    set_pdeathsig(libc::SIGCONT).map_err(sys("set parent-death signal"))?;
    thread::Builder::new()
        .name("shim-signal".into())
        .spawn(move || handle_cont(File::from(cont_r)))?;

    ensure_home(&shim.home)?;

    let mut container = Container::new(shim.params);
    container
        .set_cancel(OwnedFd::from(interrupt))
        .set_cancel_signal(Signal::INT)
        .set_wait_delay(shim.wait_delay)
        .set_verbose(shim.verbose);
    container.start().map_err(ShimError::Start)?;
    container.serve().map_err(ShimError::Serve)?;

    let program = seccomp::program(FilterPreset::STRICT, ExportFlag::ALLOW_MULTIARCH)?;
    seccomp::load(&program)?;
    debug!(target: TARGET, "{} filter instructions loaded", program.len());

    Ok(exit_code(container.wait()))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use hakurei_container::Ops;

    use super::*;

    fn params() -> ShimParams {
        let mut ops = Ops::new();
        ops.proc("/proc");
        ShimParams {
            monitor_pid: 1,
            wait_delay: Duration::from_secs(5),
            params: Params {
                ops,
                ..Params::default()
            },
            home: "/home/app".into(),
            verbose: false,
        }
    }

    #[test]
    fn validity() {
        assert!(params().valid());
        let mut p = params();
        p.monitor_pid = 0;
        assert!(!p.valid());
        let mut p = params();
        p.params.ops = Ops::new();
        assert!(!p.valid());
    }

    #[test]
    fn wait_results() {
        assert_eq!(exit_code(Ok(0)), 0);
        assert_eq!(exit_code(Ok(130)), 130);
        assert_eq!(exit_code(Err(ContainerError::Canceled)), EXIT_CANCEL);
        assert_eq!(exit_code(Err(ContainerError::NotStarted)), EXIT_WAIT);
    }

    #[test]
    fn params_over_pipe() {
        let (r, mut w) = setup::pipe().unwrap();
        let p = params();
        setup::send(&mut w, &p).unwrap();
        drop(w);
        let got: ShimParams = setup::receive(&mut File::from(r)).unwrap();
        assert_eq!(got, p);
    }

    #[test]
    fn home_creation() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        ensure_home(&home).unwrap();
        ensure_home(&home).unwrap();
        assert_eq!(fs::metadata(&home).unwrap().permissions().mode() & 0o777, 0o700);

        let file = dir.path().join("file");
        fs::write(&file, "").unwrap();
        assert!(matches!(ensure_home(&file), Err(ShimError::HomeNotDir(_))));
    }
}
