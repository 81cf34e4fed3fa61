use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};

use hakurei_container::{BindFlags, Container, HardeningFlags, Ops, Params};
use hakurei_sys::seccomp::{ExportFlag, FilterPreset};
use rustix::pipe::{PipeFlags, pipe_with};
use tracing::{debug, info, warn};

use super::{DBusError, Final};

/// Executable name of the proxy.
pub const PROXY_NAME: &str = "xdg-dbus-proxy";
pub const PROXY_HOSTNAME: &str = "hakurei-dbus";

/// Host directories that may hold the proxy's libraries.
const LIBRARY_DIRS: &[&str] = &["/usr", "/bin", "/lib", "/lib64", "/nix/store"];

/// A running proxy.
#[derive(Debug)]
pub struct Proxy {
    container: Container,
    /// Read end of the status pipe; the proxy exits once it closes.
    status: Option<File>,
    writer: Option<JoinHandle<io::Result<()>>>,
    sockets: Vec<PathBuf>,
}

impl Proxy {
    /// Start the proxy for `config` inside its own container.
    ///
    /// `tool` overrides the proxy executable, otherwise it is looked up in
    /// `PATH`.
    pub fn start(config: &Final, tool: Option<&Path>) -> Result<Self, DBusError> {
        let tool = match tool {
            Some(t) if t.is_absolute() => t.to_path_buf(),
            Some(t) => which::which(t)?,
            None => which::which(PROXY_NAME)?,
        };
        let mut container = Container::new(params(config, &tool));

        let (args_r, args_w) = pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from)?;
        let (status_r, status_w) = pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from)?;
        let args_fd = container.extra_file(args_r);
        let status_fd = container.extra_file(status_w);
        container.params_mut().args = vec![
            PROXY_NAME.to_owned(),
            format!("--args={args_fd}"),
            format!("--fd={status_fd}"),
        ];

        container.start()?;
        let mut args_w = File::from(args_w);
        let stream = config.args.clone();
        let writer = thread::Builder::new()
            .name("dbus-args".into())
            .spawn(move || args_w.write_all(&stream))?;
        container.serve()?;
        info!(pid = container.pid(), "started message bus proxy");

        Ok(Self {
            container,
            status: Some(File::from(status_r)),
            writer: Some(writer),
            sockets: config.sockets().map(Path::to_path_buf).collect(),
        })
    }

    /// Block until the proxy reports its sockets are listening.
    pub fn ready(&mut self) -> Result<(), DBusError> {
        let status = self.status.as_mut().ok_or(DBusError::Exited)?;
        let mut b = [0u8; 1];
        loop {
            match status.read(&mut b) {
                Ok(1) => return Ok(()),
                Ok(_) => return Err(DBusError::Exited),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Ask the proxy to exit.
    pub fn close(&mut self) {
        self.status = None;
    }

    /// Wait for the proxy to exit and remove its sockets.
    pub fn wait(&mut self) -> Result<i32, DBusError> {
        self.close();
        if let Some(writer) = self.writer.take() {
            match writer.join() {
                Ok(Err(e)) => debug!("cannot write proxy arguments: {e}"),
                Err(_) => warn!("proxy argument writer panicked"),
                Ok(Ok(())) => {}
            }
        }
        let code = self.container.wait();
        for socket in &self.sockets {
            match fs::remove_file(socket) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!("cannot remove {}: {e}", socket.display());
                }
                _ => {}
            }
        }
        let code = code?;
        debug!(code, "message bus proxy exited");
        Ok(code)
    }
}

fn params(config: &Final, tool: &Path) -> Params {
    let mut ops = Ops::new();
    for dir in LIBRARY_DIRS {
        ops.bind(*dir, *dir, BindFlags::OPTIONAL);
    }
    for dir in config.upstream_dirs() {
        ops.bind(dir.clone(), dir, BindFlags::empty());
    }
    for dir in config.socket_dirs() {
        ops.bind(dir.clone(), dir, BindFlags::WRITABLE);
    }
    if let Some(bin) = tool.parent() {
        ops.bind(bin, bin, BindFlags::empty());
    }

    Params {
        path: tool.to_path_buf(),
        hostname: PROXY_HOSTNAME.to_owned(),
        uid: rustix::process::getuid().as_raw() as i32,
        gid: rustix::process::getgid().as_raw() as i32,
        ops,
        seccomp_flags: ExportFlag::ALLOW_MULTIARCH,
        seccomp_presets: FilterPreset::STRICT,
        flags: HardeningFlags::empty(),
        ..Params::default()
    }
}
