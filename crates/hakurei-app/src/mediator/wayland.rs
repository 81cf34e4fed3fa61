//! Wayland security context client.
//!
//! Speaks just enough of the wire protocol to reach
//! `wp_security_context_manager_v1` and attach a new listening socket to a
//! security context. The compositor keeps accepting clients on that socket
//! until the pipe end we hold is closed.
//!
//! Wire format: every message starts with the object id and a word holding
//! the message size in the upper and the opcode in the lower 16 bits.
//! Strings carry their length including the terminating NUL and are padded
//! to 4 bytes. Descriptors travel out of band as `SCM_RIGHTS`.

use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use rustix::pipe::{PipeFlags, pipe_with};
use thiserror::Error;
use tracing::debug;

/// Name of the compositor socket, joined to `XDG_RUNTIME_DIR` unless
/// absolute.
pub const WAYLAND_DISPLAY: &str = "WAYLAND_DISPLAY";
/// Socket name used when [`WAYLAND_DISPLAY`] is unset.
pub const FALLBACK_NAME: &str = "wayland-0";

const SANDBOX_ENGINE: &str = "app.hakurei";
const MANAGER_INTERFACE: &str = "wp_security_context_manager_v1";

const DISPLAY: u32 = 1;
const HEADER_LEN: usize = 8;

// wl_display
const DISPLAY_SYNC: u16 = 0;
const DISPLAY_GET_REGISTRY: u16 = 1;
const DISPLAY_ERROR: u16 = 0;
// wl_registry
const REGISTRY_BIND: u16 = 0;
const REGISTRY_GLOBAL: u16 = 0;
// wl_callback
const CALLBACK_DONE: u16 = 0;
// wp_security_context_manager_v1
const MANAGER_DESTROY: u16 = 0;
const MANAGER_CREATE_LISTENER: u16 = 1;
// wp_security_context_v1
const CONTEXT_DESTROY: u16 = 0;
const CONTEXT_SET_SANDBOX_ENGINE: u16 = 1;
const CONTEXT_SET_APP_ID: u16 = 2;
const CONTEXT_SET_INSTANCE_ID: u16 = 3;
const CONTEXT_COMMIT: u16 = 4;

#[derive(Debug, Error)]
pub enum WaylandError {
    #[error("cannot ensure socket path {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot connect to {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cannot bind {path:?}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("compositor does not implement security_context_v1")]
    NotAvailable,

    #[error("compositor error on object {object}, code {code}: {message}")]
    Protocol {
        object: u32,
        code: u32,
        message: String,
    },

    #[error("string {0:?} contains NUL byte")]
    Nul(String),

    #[error("malformed message from compositor")]
    Malformed,

    #[error("wayland: {0}")]
    Io(#[from] io::Error),
}

/// Compositor socket named by `display`, the value of `WAYLAND_DISPLAY`.
/// Relative names are resolved against `runtime_dir`.
pub fn display_path(runtime_dir: &Path, display: Option<&str>) -> PathBuf {
    match display {
        Some(name) if Path::new(name).is_absolute() => PathBuf::from(name),
        Some(name) if !name.is_empty() => runtime_dir.join(name),
        _ => runtime_dir.join(FALLBACK_NAME),
    }
}

/// A security context bound to a socket on the host.
#[derive(Debug)]
pub struct SecurityContext {
    /// Read end of the pipe whose write end the compositor holds.
    close: OwnedFd,
    path: PathBuf,
}

impl SecurityContext {
    /// Create a security context on the compositor at `display` and bind
    /// its listening socket at `bind_path`.
    pub fn new(
        display: &Path,
        bind_path: &Path,
        app_id: &str,
        instance_id: &str,
    ) -> Result<Self, WaylandError> {
        ensure_available(bind_path)?;
        let stream = UnixStream::connect(display).map_err(|source| WaylandError::Connect {
            path: display.to_path_buf(),
            source,
        })?;
        let result = bind(Connection::new(stream), bind_path, app_id, instance_id);
        if result.is_err() {
            fs::remove_file(bind_path).ok();
        }
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop the compositor from accepting new clients and remove the
    /// socket.
    pub fn close(self) -> io::Result<()> {
        drop(self.close);
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Make sure nothing but a stale regular file sits at `path`.
fn ensure_available(path: &Path) -> Result<(), WaylandError> {
    let err = |source| WaylandError::Create {
        path: path.to_path_buf(),
        source,
    };
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(err)?;
    fs::remove_file(path).map_err(err)
}

fn check_nul(s: &str) -> Result<&str, WaylandError> {
    if s.contains('\0') {
        Err(WaylandError::Nul(s.to_owned()))
    } else {
        Ok(s)
    }
}

fn bind(
    mut conn: Connection,
    bind_path: &Path,
    app_id: &str,
    instance_id: &str,
) -> Result<SecurityContext, WaylandError> {
    let app_id = check_nul(app_id)?;
    let instance_id = check_nul(instance_id)?;

    let registry = conn.new_id();
    conn.send(DISPLAY, DISPLAY_GET_REGISTRY, &[Arg::Uint(registry)], &[])?;
    let mut manager_name = None;
    conn.roundtrip(|msg| {
        if msg.object == registry && msg.opcode == REGISTRY_GLOBAL {
            let mut r = msg.reader();
            let name = r.uint()?;
            if r.string()? == MANAGER_INTERFACE {
                manager_name = Some(name);
            }
        }
        Ok(())
    })?;
    let name = manager_name.ok_or(WaylandError::NotAvailable)?;

    let manager = conn.new_id();
    conn.send(
        registry,
        REGISTRY_BIND,
        &[
            Arg::Uint(name),
            Arg::Str(MANAGER_INTERFACE),
            Arg::Uint(1),
            Arg::Uint(manager),
        ],
        &[],
    )?;

    let listener = UnixListener::bind(bind_path).map_err(|source| WaylandError::Bind {
        path: bind_path.to_path_buf(),
        source,
    })?;
    let (close_r, close_w) = pipe_with(PipeFlags::CLOEXEC).map_err(io::Error::from)?;

    let context = conn.new_id();
    conn.send(
        manager,
        MANAGER_CREATE_LISTENER,
        &[Arg::Uint(context)],
        &[listener.as_fd(), close_w.as_fd()],
    )?;
    conn.send(context, CONTEXT_SET_SANDBOX_ENGINE, &[Arg::Str(SANDBOX_ENGINE)], &[])?;
    conn.send(context, CONTEXT_SET_APP_ID, &[Arg::Str(app_id)], &[])?;
    conn.send(context, CONTEXT_SET_INSTANCE_ID, &[Arg::Str(instance_id)], &[])?;
    conn.send(context, CONTEXT_COMMIT, &[], &[])?;
    conn.send(context, CONTEXT_DESTROY, &[], &[])?;
    conn.send(manager, MANAGER_DESTROY, &[], &[])?;
    conn.roundtrip(|_| Ok(()))?;
    debug!(path = %bind_path.display(), app_id, instance_id, "security context committed");

    Ok(SecurityContext {
        close: close_r,
        path: bind_path.to_path_buf(),
    })
}

enum Arg<'a> {
    Uint(u32),
    Str(&'a str),
}

struct Message {
    object: u32,
    opcode: u16,
    body: Vec<u8>,
}

impl Message {
    fn reader(&self) -> ArgReader<'_> {
        ArgReader { buf: &self.body }
    }
}

struct ArgReader<'a> {
    buf: &'a [u8],
}

impl ArgReader<'_> {
    fn uint(&mut self) -> Result<u32, WaylandError> {
        let (word, rest) = self.buf.split_first_chunk::<4>().ok_or(WaylandError::Malformed)?;
        self.buf = rest;
        Ok(u32::from_ne_bytes(*word))
    }

    fn string(&mut self) -> Result<String, WaylandError> {
        let len = self.uint()? as usize;
        let padded = len.next_multiple_of(4);
        if len == 0 || padded > self.buf.len() {
            return Err(WaylandError::Malformed);
        }
        let s = &self.buf[..len - 1];
        self.buf = &self.buf[padded..];
        Ok(String::from_utf8_lossy(s).into_owned())
    }
}

fn encode(object: u32, opcode: u16, args: &[Arg<'_>]) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    for arg in args {
        match arg {
            Arg::Uint(v) => buf.extend_from_slice(&v.to_ne_bytes()),
            Arg::Str(s) => {
                let len = s.len() + 1;
                buf.extend_from_slice(&(len as u32).to_ne_bytes());
                buf.extend_from_slice(s.as_bytes());
                buf.resize(buf.len() + len.next_multiple_of(4) - s.len(), 0);
            }
        }
    }
    let size = buf.len() as u32;
    buf[..4].copy_from_slice(&object.to_ne_bytes());
    buf[4..8].copy_from_slice(&((size << 16) | u32::from(opcode)).to_ne_bytes());
    buf
}

struct Connection {
    stream: UnixStream,
    next_id: u32,
}

impl Connection {
    fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            next_id: DISPLAY + 1,
        }
    }

    fn new_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn send(
        &mut self,
        object: u32,
        opcode: u16,
        args: &[Arg<'_>],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), WaylandError> {
        let buf = encode(object, opcode, args);
        if fds.is_empty() {
            self.stream.write_all(&buf)?;
        } else {
            let fds: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
            send_with_fds(self.stream.as_raw_fd(), &buf, &fds)?;
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Message, WaylandError> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let object = u32::from_ne_bytes([header[0], header[1], header[2], header[3]]);
        let word = u32::from_ne_bytes([header[4], header[5], header[6], header[7]]);
        let size = (word >> 16) as usize;
        if size < HEADER_LEN {
            return Err(WaylandError::Malformed);
        }
        let mut body = vec![0u8; size - HEADER_LEN];
        self.stream.read_exact(&mut body)?;
        Ok(Message {
            object,
            opcode: (word & 0xffff) as u16,
            body,
        })
    }

    /// Issue `wl_display.sync` and dispatch events to `on_event` until the
    /// callback fires.
    fn roundtrip(
        &mut self,
        mut on_event: impl FnMut(&Message) -> Result<(), WaylandError>,
    ) -> Result<(), WaylandError> {
        let callback = self.new_id();
        self.send(DISPLAY, DISPLAY_SYNC, &[Arg::Uint(callback)], &[])?;
        loop {
            let msg = self.recv()?;
            if msg.object == DISPLAY {
                if msg.opcode == DISPLAY_ERROR {
                    let mut r = msg.reader();
                    return Err(WaylandError::Protocol {
                        object: r.uint()?,
                        code: r.uint()?,
                        message: r.string()?,
                    });
                }
                continue;
            }
            if msg.object == callback && msg.opcode == CALLBACK_DONE {
                return Ok(());
            }
            on_event(&msg)?;
        }
    }
}

/// Write `buf` with `fds` attached as `SCM_RIGHTS`.
fn send_with_fds(socket: RawFd, buf: &[u8], fds: &[RawFd]) -> io::Result<()> {
    let iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let payload = std::mem::size_of_val(fds) as u32;
    let cmsg_space = unsafe { libc::CMSG_SPACE(payload) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &iov as *const _ as *mut _;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast();
    msg.msg_controllen = cmsg_space;

    let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    if cmsg.is_null() {
        return Err(io::Error::other("CMSG_FIRSTHDR null"));
    }
    unsafe {
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(payload) as usize;
        std::ptr::copy_nonoverlapping(
            fds.as_ptr().cast::<u8>(),
            libc::CMSG_DATA(cmsg),
            payload as usize,
        );
    }

    loop {
        let ret = unsafe { libc::sendmsg(socket, &msg, libc::MSG_NOSIGNAL) };
        if ret >= 0 {
            if ret as usize != buf.len() {
                return Err(io::ErrorKind::WriteZero.into());
            }
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    struct Request {
        object: u32,
        opcode: u16,
        body: Vec<u8>,
    }

    /// Minimal compositor answering syncs. Stops after `syncs` roundtrips or
    /// when the client hangs up.
    fn compositor(
        stream: UnixStream,
        globals: Vec<(u32, &'static str)>,
        error: bool,
        syncs: usize,
    ) -> thread::JoinHandle<Vec<Request>> {
        thread::spawn(move || {
            let mut conn = Connection::new(stream);
            let mut seen = Vec::new();
            let mut served = 0;
            while served < syncs {
                let Ok(msg) = conn.recv() else { break };
                if msg.object == DISPLAY && msg.opcode == DISPLAY_SYNC {
                    let callback = msg.reader().uint().unwrap();
                    if error {
                        let buf = encode(
                            DISPLAY,
                            DISPLAY_ERROR,
                            &[Arg::Uint(DISPLAY), Arg::Uint(1), Arg::Str("invalid method")],
                        );
                        conn.stream.write_all(&buf).unwrap();
                    } else {
                        if served == 0 {
                            for (name, iface) in &globals {
                                let buf = encode(
                                    2,
                                    REGISTRY_GLOBAL,
                                    &[Arg::Uint(*name), Arg::Str(*iface), Arg::Uint(1)],
                                );
                                conn.stream.write_all(&buf).unwrap();
                            }
                        }
                        let buf = encode(callback, CALLBACK_DONE, &[Arg::Uint(0)]);
                        conn.stream.write_all(&buf).unwrap();
                    }
                    served += 1;
                }
                seen.push(Request {
                    object: msg.object,
                    opcode: msg.opcode,
                    body: msg.body,
                });
            }
            seen
        })
    }

    #[test]
    fn string_encoding() {
        let buf = encode(5, 2, &[Arg::Str("abc"), Arg::Str("abcd")]);
        // 8 header + (4 + 4) + (4 + 8)
        assert_eq!(buf.len(), 28);
        assert_eq!(u32::from_ne_bytes(buf[4..8].try_into().unwrap()), (28 << 16) | 2);
        let msg = Message {
            object: 5,
            opcode: 2,
            body: buf[8..].to_vec(),
        };
        let mut r = msg.reader();
        assert_eq!(r.string().unwrap(), "abc");
        assert_eq!(r.string().unwrap(), "abcd");
        assert!(matches!(r.uint(), Err(WaylandError::Malformed)));
    }

    #[test]
    fn security_context() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wayland");
        let (client, server) = UnixStream::pair().unwrap();
        let server = compositor(
            server,
            vec![(7, "wl_compositor"), (9, MANAGER_INTERFACE)],
            false,
            2,
        );

        let ctx = bind(Connection::new(client), &path, "org.example.App", "0123abcd").unwrap();
        let requests = server.join().unwrap();
        assert!(path.exists());

        let find = |object, opcode| {
            requests
                .iter()
                .find(|r| r.object == object && r.opcode == opcode)
                .unwrap()
        };
        let bind_req = find(2, REGISTRY_BIND);
        let mut r = ArgReader { buf: &bind_req.body };
        assert_eq!(r.uint().unwrap(), 9);
        assert_eq!(r.string().unwrap(), MANAGER_INTERFACE);
        assert_eq!(r.uint().unwrap(), 1);
        let manager = r.uint().unwrap();

        let create = find(manager, MANAGER_CREATE_LISTENER);
        let context = ArgReader { buf: &create.body }.uint().unwrap();
        let string = |opcode| ArgReader { buf: &find(context, opcode).body }.string().unwrap();
        assert_eq!(string(CONTEXT_SET_SANDBOX_ENGINE), SANDBOX_ENGINE);
        assert_eq!(string(CONTEXT_SET_APP_ID), "org.example.App");
        assert_eq!(string(CONTEXT_SET_INSTANCE_ID), "0123abcd");
        find(context, CONTEXT_COMMIT);

        ctx.close().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn manager_missing() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = UnixStream::pair().unwrap();
        let server = compositor(server, vec![(7, "wl_compositor")], false, 2);
        let err = bind(Connection::new(client), &dir.path().join("wayland"), "a", "b").unwrap_err();
        assert!(matches!(err, WaylandError::NotAvailable));
        server.join().unwrap();
    }

    #[test]
    fn compositor_error() {
        let dir = tempfile::tempdir().unwrap();
        let (client, server) = UnixStream::pair().unwrap();
        let server = compositor(server, Vec::new(), true, 1);
        let err = bind(Connection::new(client), &dir.path().join("wayland"), "a", "b").unwrap_err();
        assert_eq!(
            err.to_string(),
            "compositor error on object 1, code 1: invalid method"
        );
        server.join().unwrap();
    }

    #[test]
    fn nul_rejected() {
        let (client, _server) = UnixStream::pair().unwrap();
        let err = bind(Connection::new(client), Path::new("/nonexistent"), "a\0b", "c").unwrap_err();
        assert!(matches!(err, WaylandError::Nul(_)));
    }

    #[test]
    fn stale_path_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wayland");
        fs::write(&path, "stale").unwrap();
        ensure_available(&path).unwrap();
        assert!(!path.exists());

        fs::create_dir(&path).unwrap();
        assert!(matches!(ensure_available(&path), Err(WaylandError::Create { .. })));
    }

    #[test]
    fn display_paths() {
        let rt = Path::new("/run/user/1000");
        assert_eq!(display_path(rt, None), rt.join("wayland-0"));
        assert_eq!(display_path(rt, Some("")), rt.join("wayland-0"));
        assert_eq!(display_path(rt, Some("wayland-1")), rt.join("wayland-1"));
        assert_eq!(display_path(rt, Some("/tmp/wl")), Path::new("/tmp/wl"));
    }
}
