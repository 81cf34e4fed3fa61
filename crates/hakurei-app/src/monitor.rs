//! The monitor: runs as the invoking user for the lifetime of one instance.
//!
//! ```text
//!   monitor                     hsu (setuid)            shim (target uid)
//!   ───────                     ────────────            ─────────────────
//!   commit host ops
//!   spawn ────────────────────► check, setuid ────────► exec
//!   ShimParams ─────────── fd 3 ──────────────────────► receive, start
//!   save state
//!   cancel: SIGCONT ──────────────────────────────────► exit 254
//!   wait ◄──────────────────────────────────────────── exit status
//!   destroy state, revert host ops
//! ```

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use hakurei_container::setup::{self, SetupError};
use hakurei_sys::signal::unblock_all;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, Signal, pidfd_open, pidfd_send_signal};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, Enablements};
use crate::identity::{ENV_GROUPS, ENV_IDENTITY};
use crate::log::SuspendableWriter;
use crate::seal::Sealed;
use crate::shim::{ENV_SHIM, ShimParams};
use crate::state::{InstanceId, State, StateError, Store};
use crate::system::{Criteria, Scope, System, SystemError};

/// Extra time given to the shim beyond its own wait delay.
pub const SHIM_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
/// Descriptor the shim reads its parameters from.
const SHIM_FD: i32 = 3;

const PROCESS: Token = Token(0);
const CANCEL: Token = Token(1);
const ENCODED: Token = Token(2);

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("cannot start {path:?}: {source}")]
    Spawn {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("canceled before the shim was set up")]
    Canceled,

    #[error("shim did not exit within {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    System(#[from] SystemError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("cannot send shim parameters: {0}")]
    Setup(#[from] SetupError),

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl MonitorError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            Self::Canceled => Some(Errno::CANCELED),
            Self::Timeout(_) => Some(Errno::TIMEDOUT),
            Self::Spawn { source, .. } | Self::Io(source) => {
                source.raw_os_error().map(Errno::from_raw_os_error)
            }
            _ => None,
        }
    }
}

/// Result of one instance.
#[derive(Debug)]
pub struct Outcome {
    /// Exit code of the shim, if it was waited for.
    pub code: Option<i32>,
    pub error: Option<MonitorError>,
    /// Failure to undo host changes; reported separately so it never
    /// masks the exit code.
    pub revert: Option<SystemError>,
}

impl Outcome {
    pub fn exit_code(&self) -> i32 {
        match (self.code, &self.error) {
            (Some(code), None) => code,
            (Some(code), Some(_)) if code != 0 => code,
            _ => 1,
        }
    }
}

/// Exit code of a waited process: exit status, or `128+signo`.
fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(255)
}

fn spawn(hsu: &Path, aid: u32, groups: &[u32], pipe: &OwnedFd) -> io::Result<Child> {
    let mut cmd = Command::new(hsu);
    cmd.env_clear()
        .env(ENV_SHIM, SHIM_FD.to_string())
        .env(ENV_IDENTITY, aid.to_string())
        .current_dir("/");
    if !groups.is_empty() {
        let groups: Vec<String> = groups.iter().map(ToString::to_string).collect();
        cmd.env(ENV_GROUPS, groups.join(" "));
    }

    let fd = pipe.as_raw_fd();
    // SAFETY: only dup2, fcntl and sigprocmask run between fork and exec.
    unsafe {
        cmd.pre_exec(move || {
            if fd == SHIM_FD {
                let flags = libc::fcntl(fd, libc::F_GETFD);
                if flags < 0 || libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
                    return Err(io::Error::last_os_error());
                }
            } else if libc::dup2(fd, SHIM_FD) < 0 {
                return Err(io::Error::last_os_error());
            }
            unblock_all().map_err(io::Error::from)
        });
    }
    cmd.spawn()
}

/// Run `sealed` through `hsu` until the shim exits, then undo host changes.
///
/// `cancel` is polled for readability; once readable the shim is asked to
/// exit and given its wait delay plus [`SHIM_WAIT_TIMEOUT`] to comply.
/// Log output is held back on `log` while the shim owns the terminal.
pub fn run(
    sealed: Sealed,
    hsu: &Path,
    store: &Store,
    cancel: Option<OwnedFd>,
    log: &SuspendableWriter,
) -> Outcome {
    let Sealed {
        id,
        config,
        groups,
        mut sys,
        shim,
        ..
    } = sealed;
    let aid = config.identity;

    match store.do_with(aid, |_| sys.commit()) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => return failed(e.into(), None),
        Err(e) => return failed(e.into(), None),
    }
    debug!(ops = sys.len(), "host changes applied");

    let mut sv = Supervise {
        id,
        aid,
        hsu,
        groups: &groups,
        shim,
        cancel,
        store,
        log,
        saved: false,
    };
    let result = sv.run(&config);
    let saved = sv.saved;

    if log.resume().unwrap_or(false) {
        debug!("resumed log output");
    }

    let (code, error) = match result {
        Ok(code) => (Some(code), None),
        Err((code, e)) => (code, Some(e)),
    };
    if let Some(code) = code {
        info!(%id, code, "shim exited");
    }
    let revert = cleanup(store, aid, &id, saved, &mut sys);
    Outcome {
        code,
        error,
        revert,
    }
}

fn failed(error: MonitorError, revert: Option<SystemError>) -> Outcome {
    Outcome {
        code: None,
        error: Some(error),
        revert,
    }
}

/// One shim from spawn to exit.
struct Supervise<'a> {
    id: InstanceId,
    aid: u32,
    hsu: &'a Path,
    groups: &'a [u32],
    shim: ShimParams,
    cancel: Option<OwnedFd>,
    store: &'a Store,
    log: &'a SuspendableWriter,
    /// Whether a state record was written.
    saved: bool,
}

impl Supervise<'_> {
    fn run(&mut self, config: &AppConfig) -> Result<i32, (Option<i32>, MonitorError)> {
        let (pipe_r, mut pipe_w) = setup::pipe().map_err(|e| (None, e.into()))?;
        let mut child = spawn(self.hsu, self.aid, self.groups, &pipe_r).map_err(|source| {
            (
                None,
                MonitorError::Spawn {
                    path: self.hsu.display().to_string(),
                    source,
                },
            )
        })?;
        drop(pipe_r);
        let pid = child.id() as i32;
        let start = Utc::now();
        debug!(pid, "spawned {:?}", self.hsu);
        self.log.suspend();

        let mut poll = Poll::new().map_err(|e| (None, e.into()))?;
        let waker = Arc::new(Waker::new(poll.registry(), ENCODED).map_err(|e| (None, e.into()))?);
        let pidfd = Pid::from_raw(pid)
            .ok_or(Errno::SRCH)
            .and_then(|p| pidfd_open(p, PidfdFlags::empty()))
            .map_err(|e| (None, io::Error::from(e).into()))?;
        poll.registry()
            .register(&mut SourceFd(&pidfd.as_raw_fd()), PROCESS, Interest::READABLE)
            .map_err(|e| (None, e.into()))?;
        if let Some(cancel) = &self.cancel {
            poll.registry()
                .register(&mut SourceFd(&cancel.as_raw_fd()), CANCEL, Interest::READABLE)
                .map_err(|e| (None, e.into()))?;
        }

        let (tx, rx) = mpsc::channel();
        let shim = self.shim.clone();
        let encoder = {
            let waker = Arc::clone(&waker);
            thread::Builder::new()
                .name("shim-setup".into())
                .spawn(move || {
                    let r = setup::send(&mut pipe_w, &shim);
                    drop(pipe_w);
                    // a closed receiver means the monitor stopped waiting
                    let _ = tx.send(r);
                    if let Err(e) = waker.wake() {
                        warn!("cannot wake monitor: {e}");
                    }
                })
                .map_err(|e| (None, e.into()))?
        };

        let mut events = Events::with_capacity(4);
        let mut deadline: Option<Instant> = None;
        let mut encoded = false;
        let mut error: Option<MonitorError> = None;
        let code = loop {
            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match poll.poll(&mut events, timeout) {
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error = Some(e.into());
                    break None;
                }
                Ok(()) => {}
            }
            if events.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
                let limit = self.shim.wait_delay + SHIM_WAIT_TIMEOUT;
                error!("shim did not exit within {limit:?}, giving up");
                error = Some(MonitorError::Timeout(limit));
                break None;
            }

            let mut exited = false;
            for event in &events {
                match event.token() {
                    ENCODED => {
                        if let Ok(r) = rx.try_recv() {
                            encoded = true;
                            match r {
                                Ok(()) => {
                                    let state = State {
                                        id: self.id,
                                        pid,
                                        time: start,
                                        config: config.clone(),
                                    };
                                    match self.store.do_with(self.aid, |c| c.save(&state)) {
                                        Ok(Ok(())) => self.saved = true,
                                        Ok(Err(e)) | Err(e) => {
                                            warn!("cannot save state: {e}");
                                            error.get_or_insert(e.into());
                                        }
                                    }
                                }
                                Err(e) => {
                                    warn!("cannot send shim parameters: {e}");
                                    error.get_or_insert(e.into());
                                }
                            }
                        }
                    }
                    CANCEL if deadline.is_none() => {
                        if let Some(cancel) = &self.cancel {
                            poll.registry()
                                .deregister(&mut SourceFd(&cancel.as_raw_fd()))
                                .ok();
                        }
                        info!("requesting shim exit");
                        // the only signal allowed across the uid change
                        if let Err(errno) = pidfd_send_signal(&pidfd, Signal::CONT) {
                            debug!("cannot signal shim: {errno}");
                        }
                        if !encoded {
                            error.get_or_insert(MonitorError::Canceled);
                        }
                        deadline = Some(Instant::now() + self.shim.wait_delay + SHIM_WAIT_TIMEOUT);
                    }
                    PROCESS => exited = true,
                    _ => {}
                }
            }
            if exited {
                match child.wait() {
                    Ok(status) => break Some(status_code(status)),
                    Err(e) => {
                        error = Some(e.into());
                        break None;
                    }
                }
            }
        };

        if code.is_some() {
            // the write end is closed once the child is gone
            if encoder.join().is_err() {
                warn!("shim setup thread panicked");
            }
        }
        match (code, error) {
            (Some(code), None) => Ok(code),
            (code, Some(e)) => Err((code, e)),
            (None, None) => Err((None, MonitorError::Io(io::ErrorKind::Other.into()))),
        }
    }
}

/// Revert criteria after this instance exits, given the instances left.
pub fn criteria(remaining: &[State]) -> Scope {
    let mut scope = Scope::PROCESS;
    if remaining.is_empty() {
        scope |= Scope::USER;
    }
    let in_use = remaining
        .iter()
        .fold(Enablements::empty(), |acc, s| acc | s.config.enablements);
    scope | Scope::from(Enablements::all() & !in_use)
}

fn cleanup(
    store: &Store,
    aid: u32,
    id: &InstanceId,
    saved: bool,
    sys: &mut System,
) -> Option<SystemError> {
    let r = store.do_with(aid, |c| {
        if saved {
            if let Err(e) = c.destroy(id) {
                warn!("cannot remove state: {e}");
            }
        }
        let scope = match c.load() {
            Ok(states) => {
                debug!(remaining = states.len(), "instances of identity {aid} still running");
                criteria(&states)
            }
            Err(e) => {
                warn!("cannot load state, reverting process scope only: {e}");
                Scope::PROCESS
            }
        };
        debug!(%scope, "reverting host changes");
        sys.revert(Criteria::from(scope)).err()
    });
    match r {
        Ok(revert) => revert,
        Err(e) => {
            warn!("cannot lock state, reverting process scope only: {e}");
            sys.revert(Criteria::from(Scope::PROCESS)).err()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;

    use hakurei_container::{Ops, Params};

    use super::*;
    use crate::seal::Paths;

    fn fake_hsu(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("hsu");
        let mut f = fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh\nPATH=/usr/bin:/bin\n{body}").unwrap();
        drop(f);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn sealed(dir: &Path, aid: u32) -> Sealed {
        let mut ops = Ops::new();
        ops.proc("/proc");
        let mut sys = System::new(1_000_000 + aid);
        sys.ephemeral(Scope::PROCESS, dir.join("instance"), 0o711)
            .ensure(dir.join("kept"), 0o700);
        Sealed {
            id: InstanceId::random(),
            config: AppConfig::new(aid, "/home/app").enable(Enablements::WAYLAND),
            uid: 1_000_000 + aid,
            groups: vec![27, 44],
            sys,
            shim: ShimParams {
                monitor_pid: std::process::id() as i32,
                wait_delay: Duration::ZERO,
                params: Params {
                    ops,
                    ..Params::default()
                },
                home: "/home/app".into(),
                verbose: false,
            },
            paths: Paths {
                share: dir.to_path_buf(),
                runtime: dir.to_path_buf(),
                run_dir: dir.to_path_buf(),
            },
        }
    }

    fn state(enablements: Enablements) -> State {
        State {
            id: InstanceId::random(),
            pid: 1,
            time: Utc::now(),
            config: AppConfig::new(0, "/home/app").enable(enablements),
        }
    }

    #[test]
    fn revert_criteria() {
        assert_eq!(
            criteria(&[]),
            Scope::PROCESS | Scope::USER | Scope::WAYLAND | Scope::DBUS | Scope::PULSE
        );
        let remaining = [state(Enablements::WAYLAND), state(Enablements::PULSE)];
        assert_eq!(criteria(&remaining), Scope::PROCESS | Scope::DBUS);
    }

    #[test]
    fn exit_codes() {
        let o = Outcome {
            code: Some(7),
            error: None,
            revert: None,
        };
        assert_eq!(o.exit_code(), 7);
        let o = Outcome {
            code: Some(0),
            error: Some(MonitorError::Canceled),
            revert: None,
        };
        assert_eq!(o.exit_code(), 1);
        let o = failed(MonitorError::Timeout(Duration::from_secs(5)), None);
        assert_eq!(o.exit_code(), 1);
        assert_eq!(o.error.unwrap().errno(), Some(Errno::TIMEDOUT));
    }

    #[test]
    fn runs_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("env");
        let hsu = fake_hsu(
            dir.path(),
            &format!(
                "test -d {inst} || exit 9\n\
                 echo \"$HAKUREI_SHIM $HAKUREI_IDENTITY $HAKUREI_GROUPS\" > {out}\n\
                 cat <&3 > /dev/null\nexit 7",
                inst = dir.path().join("instance").display(),
                out = out.display(),
            ),
        );
        let store = Store::new(dir.path());
        let s = sealed(dir.path(), 4);
        let id = s.id;

        let o = run(s, &hsu, &store, None, &SuspendableWriter::new());
        assert!(o.error.is_none(), "{:?}", o.error);
        assert!(o.revert.is_none(), "{:?}", o.revert);
        assert_eq!(o.code, Some(7));
        assert_eq!(fs::read_to_string(&out).unwrap(), "3 4 27 44\n");

        assert!(!dir.path().join("instance").exists());
        assert!(dir.path().join("kept").is_dir());
        let left = store.do_with(4, |c| c.load()).unwrap().unwrap();
        assert!(left.iter().all(|st| st.id != id));
    }

    #[test]
    fn cancel_requests_exit() {
        let dir = tempfile::tempdir().unwrap();
        let hsu = fake_hsu(
            dir.path(),
            "trap 'exit 254' CONT\ncat <&3 > /dev/null\nwhile :; do sleep 0.1; done",
        );
        let store = Store::new(dir.path());
        let (cancel_r, cancel_w) =
            rustix::pipe::pipe_with(rustix::pipe::PipeFlags::CLOEXEC).unwrap();
        let trigger = thread::spawn(move || {
            thread::sleep(Duration::from_millis(500));
            rustix::io::write(&cancel_w, b"x").unwrap();
            cancel_w
        });

        let o = run(
            sealed(dir.path(), 5),
            &hsu,
            &store,
            Some(cancel_r),
            &SuspendableWriter::new(),
        );
        drop(trigger.join().unwrap());
        assert!(o.error.is_none(), "{:?}", o.error);
        assert_eq!(o.code, Some(254));
        assert!(!dir.path().join("instance").exists());
    }

    #[test]
    fn missing_helper() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path());
        let o = run(
            sealed(dir.path(), 6),
            &dir.path().join("nonexistent"),
            &store,
            None,
            &SuspendableWriter::new(),
        );
        assert!(matches!(o.error, Some(MonitorError::Spawn { .. })));
        assert_eq!(o.code, None);
        assert!(!dir.path().join("instance").exists());
    }
}
