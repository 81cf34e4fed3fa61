//! Container init: pid 1 of the new PID namespace.
//!
//! Receives [`InitParams`] over the setup pipe, assembles the root
//! filesystem between two pivots, drops privileges, installs the seccomp
//! filter and runs the payload. Afterwards it reaps every process in the
//! namespace and forwards `SIGINT`/`SIGTERM` to the payload.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use hakurei_sys::caps::{self, CAP_SYS_ADMIN, CapSets};
use hakurei_sys::process::{Dumpable, set_dumpable};
use hakurei_sys::seccomp::{self, SeccompError};
use hakurei_sys::signal::SignalFd;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use rustix::io::Errno;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::container::ENV_SETUP;
use crate::mount::{
    self, SOURCE_TMPFS_ROOTFS, mount_tmpfs, path_to_cstring, pivot_root, set_hostname,
    set_propagation, umount_detach,
};
use crate::ops::{OpError, State};
use crate::params::{HardeningFlags, InitParams, Params};
use crate::path::{HOST, HOST_DIR, SYSROOT_DIR};
use crate::setup::{self, SetupError};

const TARGET: &str = "hakurei::init";

/// Intermediate root, a fresh tmpfs holding `host` and `sysroot`.
const INTERMEDIATE: &str = "/tmp";

/// How long lingering processes may outlive the payload.
pub const RESIDUAL_PROCESS_TIMEOUT: Duration = Duration::from_secs(5);

const SIGNALS: Token = Token(0);

#[derive(Debug, Error)]
pub enum InitError {
    #[error("this process must run as pid 1")]
    NotInit,

    #[error("cannot receive init params: {0}")]
    Setup(#[from] SetupError),

    #[error("cannot {0}: {1}")]
    Sys(&'static str, Errno),

    #[error(transparent)]
    Op(#[from] OpError),

    #[error(transparent)]
    Seccomp(#[from] SeccompError),

    #[error("cannot start {path:?}: {source}")]
    Spawn {
        path: std::path::PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("io: {0}")]
    Io(#[from] io::Error),
}

fn sys(action: &'static str) -> impl FnOnce(Errno) -> InitError {
    move |errno| InitError::Sys(action, errno)
}

/// Entry point of the multi-call binary when invoked as init.
///
/// `init_log` is called once with the verbosity received from the caller,
/// before anything is logged.
pub fn main(init_log: impl FnOnce(bool)) -> ! {
    let mut init_log = Some(init_log);
    let code = match run(&mut init_log) {
        Ok(code) => code,
        Err(e) => {
            if let Some(f) = init_log.take() {
                f(false);
            }
            error!(target: TARGET, "{e}");
            1
        }
    };
    std::process::exit(code)
}

fn run<F: FnOnce(bool)>(init_log: &mut Option<F>) -> Result<i32, InitError> {
    set_dumpable(Dumpable::Disable).map_err(sys("set dumpable"))?;
    if unsafe { libc::getpid() } != 1 {
        return Err(InitError::NotInit);
    }

    let init: InitParams = {
        let mut pipe: File = setup::take_fd(ENV_SETUP)?;
        setup::receive(&mut pipe)?
    };
    if let Some(f) = init_log.take() {
        f(init.verbose);
    }
    let params = &init.params;
    debug!(target: TARGET, host_uid = init.host_uid, host_gid = init.host_gid, extra = init.count, "received params");

    // SAFETY: umask cannot fail.
    unsafe { libc::umask(0) };

    if !params.hostname.is_empty() {
        set_hostname(&params.hostname).map_err(sys("set hostname"))?;
    }

    // no proc is guaranteed past the first pivot
    let last_cap = caps::last_cap().map_err(sys("read last capability"))?;
    enter_intermediate_root()?;

    let mut state = State::new(params);
    for op in &params.ops {
        debug!(target: TARGET, "{} {}", op.prefix(), op);
        op.apply(&mut state)?;
    }

    leave_intermediate_root()?;
    drop_capabilities(params.privileged, last_cap)?;

    let program = seccomp::program(params.effective_presets(), params.seccomp_flags)?;
    seccomp::load(&program)?;
    debug!(target: TARGET, presets = ?params.effective_presets(), flags = ?params.seccomp_flags, "{} filter instructions loaded", program.len());

    // SAFETY: umask cannot fail.
    unsafe { libc::umask(init.umask as libc::mode_t) };

    // block before spawning so no SIGCHLD is lost
    let signals = SignalFd::new(&[libc::SIGINT, libc::SIGTERM, libc::SIGCHLD])
        .map_err(sys("create signalfd"))?;
    let payload = spawn_payload(params)?;
    info!(target: TARGET, pid = payload, "payload started");

    reap(&signals, payload, !params.flags.contains(HardeningFlags::ALLOW_TTY))
}

/// Mount the intermediate root and pivot into it, leaving the old root at
/// [`HOST`].
fn enter_intermediate_root() -> Result<(), InitError> {
    set_propagation(Path::new("/"), libc::MS_SLAVE | libc::MS_REC)
        .map_err(sys("make root slave"))?;

    let intermediate = Path::new(INTERMEDIATE);
    mount_tmpfs(
        SOURCE_TMPFS_ROOTFS,
        intermediate,
        libc::MS_NODEV | libc::MS_NOSUID,
        0,
        0o755,
    )
    .map_err(sys("mount intermediate root"))?;

    let sysroot = intermediate.join(SYSROOT_DIR);
    let host = intermediate.join(HOST_DIR);
    for dir in [&sysroot, &host] {
        std::fs::create_dir(dir)?;
    }
    let sysroot_c = path_to_cstring(&sysroot).map_err(sys("prepare sysroot"))?;
    mount::mount(
        Some(&sysroot_c),
        &sysroot,
        None,
        libc::MS_SILENT | libc::MS_BIND | libc::MS_REC,
        None,
    )
    .map_err(sys("bind sysroot"))?;

    pivot_root(intermediate, &host).map_err(sys("pivot into intermediate root"))?;
    std::env::set_current_dir("/")?;
    Ok(())
}

/// Detach the old root and make the sysroot the root.
fn leave_intermediate_root() -> Result<(), InitError> {
    let host = Path::new(HOST);
    set_propagation(host, libc::MS_PRIVATE | libc::MS_REC).map_err(sys("make host private"))?;
    umount_detach(host).map_err(sys("unmount host"))?;

    let intermediate = File::open("/")?;
    std::env::set_current_dir(crate::path::SYSROOT)?;
    pivot_root(Path::new("."), Path::new(".")).map_err(sys("pivot into sysroot"))?;
    if unsafe { libc::fchdir(intermediate.as_raw_fd()) } != 0 {
        return Err(InitError::Sys("enter intermediate root", hakurei_sys::last_errno()));
    }
    set_propagation(Path::new("."), libc::MS_SLAVE | libc::MS_REC)
        .map_err(sys("make intermediate root slave"))?;
    umount_detach(Path::new(".")).map_err(sys("unmount intermediate root"))?;
    drop(intermediate);
    std::env::set_current_dir("/")?;
    Ok(())
}

/// Clear the ambient and bounding sets up to `last_cap`, keeping
/// `CAP_SYS_ADMIN` only when `privileged`.
fn drop_capabilities(privileged: bool, last_cap: u32) -> Result<(), InitError> {
    caps::ambient_clear_all().map_err(sys("clear ambient capabilities"))?;
    for cap in bounding_drops(privileged, last_cap) {
        caps::bounding_drop(cap).map_err(sys("drop bounding capability"))?;
    }

    let keep = if privileged { caps::bit(CAP_SYS_ADMIN) } else { 0 };
    caps::capset(CapSets {
        effective: keep,
        permitted: keep,
        inheritable: keep,
    })
    .map_err(sys("set capabilities"))?;
    if privileged {
        caps::ambient_raise(CAP_SYS_ADMIN).map_err(sys("raise ambient capability"))?;
    }
    Ok(())
}

fn bounding_drops(privileged: bool, last_cap: u32) -> impl Iterator<Item = u32> {
    (0..=last_cap).filter(move |&cap| !(privileged && cap == CAP_SYS_ADMIN))
}

fn spawn_payload(params: &Params) -> Result<libc::pid_t, InitError> {
    let mut cmd = Command::new(&params.path);
    if let Some((arg0, rest)) = params.args.split_first() {
        cmd.arg0(arg0).args(rest);
    }
    cmd.env_clear()
        .envs(params.env.iter().filter_map(|kv| kv.split_once('=')))
        .current_dir(&params.dir);
    // own process group so forwarded signals reach the whole payload
    if !params.flags.contains(HardeningFlags::ALLOW_TTY) {
        cmd.process_group(0);
    }
    let child = cmd.spawn().map_err(|source| InitError::Spawn {
        path: params.path.clone(),
        source,
    })?;
    Ok(child.id() as libc::pid_t)
}

/// Exit code reported for the payload's wait status.
fn exit_code(status: libc::c_int) -> i32 {
    if libc::WIFEXITED(status) {
        libc::WEXITSTATUS(status)
    } else if libc::WIFSIGNALED(status) {
        if libc::WCOREDUMP(status) {
            255
        } else {
            128 + libc::WTERMSIG(status)
        }
    } else {
        255
    }
}

/// Reap children until none remain, or until [`RESIDUAL_PROCESS_TIMEOUT`]
/// after the payload exits.
fn reap(signals: &SignalFd, payload: libc::pid_t, group: bool) -> Result<i32, InitError> {
    let mut poll = Poll::new()?;
    poll.registry().register(
        &mut SourceFd(&signals.as_fd().as_raw_fd()),
        SIGNALS,
        Interest::READABLE,
    )?;
    let mut events = Events::with_capacity(4);

    let mut code: Option<i32> = None;
    let mut deadline: Option<Instant> = None;
    loop {
        loop {
            let mut status = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid > 0 {
                if pid == payload {
                    let c = exit_code(status);
                    debug!(target: TARGET, code = c, "payload exited");
                    code = Some(c);
                    deadline = Some(Instant::now() + RESIDUAL_PROCESS_TIMEOUT);
                }
                continue;
            }
            if pid == 0 {
                break;
            }
            match hakurei_sys::last_errno() {
                Errno::INTR => continue,
                Errno::CHILD => return Ok(code.unwrap_or(255)),
                errno => return Err(InitError::Sys("wait for children", errno)),
            }
        }

        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match poll.poll(&mut events, timeout) {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            r => r?,
        }
        if events.is_empty() && deadline.is_some_and(|d| Instant::now() >= d) {
            warn!(target: TARGET, "timeout waiting for lingering processes");
            return Ok(code.unwrap_or(255));
        }

        while let Some(sig) = signals.read().map_err(sys("read signalfd"))? {
            if sig == libc::SIGCHLD {
                continue;
            }
            // the payload is gone, nothing left to forward to
            if code.is_some() {
                continue;
            }
            debug!(target: TARGET, sig, "forwarding signal");
            let target = if group { -payload } else { payload };
            if unsafe { libc::kill(target, sig) } != 0 {
                debug!(target: TARGET, "cannot forward signal: {}", hakurei_sys::last_errno());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_set_respects_last_cap() {
        let all: Vec<_> = bounding_drops(false, 40).collect();
        assert_eq!(all.len(), 41);
        assert_eq!(all.last(), Some(&40));

        let kept: Vec<_> = bounding_drops(true, 40).collect();
        assert_eq!(kept.len(), 40);
        assert!(!kept.contains(&CAP_SYS_ADMIN));

        assert_eq!(bounding_drops(true, 8).count(), 9);
    }

    #[test]
    fn exit_codes() {
        // exited with status 3
        assert_eq!(exit_code(3 << 8), 3);
        assert_eq!(exit_code(0), 0);
        // killed by SIGKILL
        assert_eq!(exit_code(libc::SIGKILL), 128 + libc::SIGKILL);
        // killed by SIGSEGV with a core dump
        assert_eq!(exit_code(libc::SIGSEGV | 0x80), 255);
    }

    #[test]
    fn error_messages() {
        assert_eq!(
            InitError::Sys("unmount host", Errno::BUSY).to_string(),
            format!("cannot unmount host: {}", Errno::BUSY)
        );
        assert_eq!(InitError::NotInit.to_string(), "this process must run as pid 1");
    }
}
