//! Shared helpers for the command line tests.

use std::io;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, Output, Stdio};

use hakurei_container::{BindFlags, Ops, Params};

/// The `hakurei` binary built for this test run.
pub fn hakurei() -> Command {
    Command::new(env!("CARGO_BIN_EXE_hakurei"))
}

/// Run `hakurei` with `args` and an environment rooted at `dir`.
pub fn run_in(dir: &Path, args: &[&str]) -> Output {
    hakurei()
        .args(args)
        .env_clear()
        .env("PATH", "/usr/bin:/bin")
        .env("TMPDIR", dir)
        .env("XDG_RUNTIME_DIR", dir.join("run"))
        .output()
        .unwrap_or_else(|e| panic!("cannot run hakurei: {e}"))
}

/// Bind the host system directories that exist, recursively.
pub fn bind_system(ops: &mut Ops) -> &mut Ops {
    for dir in ["/usr", "/bin", "/sbin", "/lib", "/lib64", "/nix"] {
        ops.bind(dir, dir, BindFlags::OPTIONAL);
    }
    ops
}

/// Params running `args` as 1000:100 over `ops`.
pub fn params_with(ops: Ops, args: &[&str]) -> Params {
    Params {
        args: args.iter().map(ToString::to_string).collect(),
        uid: 1000,
        gid: 100,
        hostname: "hakurei-test".into(),
        ops,
        ..Params::default()
    }
}

/// Params for a read-only root holding the host system directories.
pub fn minimal_params(args: &[&str]) -> Params {
    let mut ops = Ops::new();
    ops.proc("/proc").dev("/dev", false).tmpfs("/tmp", 1 << 20, 0o755);
    bind_system(&mut ops).remount("/", libc::MS_RDONLY);
    params_with(ops, args)
}

/// A child of this process can enter a new user and mount namespace and
/// change mount propagation there.
pub fn userns_usable() -> bool {
    let mut cmd = hakurei();
    cmd.arg("--help").stdout(Stdio::null()).stderr(Stdio::null());
    // SAFETY: only raw syscalls run between fork and exec.
    unsafe {
        cmd.pre_exec(|| {
            if libc::unshare(libc::CLONE_NEWUSER | libc::CLONE_NEWNS) != 0 {
                return Err(io::Error::last_os_error());
            }
            let none = std::ptr::null();
            let flags = libc::MS_REC | libc::MS_PRIVATE;
            if libc::mount(none, c"/".as_ptr(), none, flags, std::ptr::null()) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    cmd.status().is_ok_and(|status| status.success())
}
