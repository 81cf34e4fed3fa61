//! Reversible changes to the host made on behalf of one instance.
//!
//! A [`System`] collects [`Op`]s while the configuration is sealed, applies
//! them all before the shim starts and reverts them in reverse order when
//! the instance exits. Each op carries a [`Scope`]: process-scoped ops are
//! always reverted, user-scoped ops only when the last instance of the
//! identity exits, and enablement-scoped ops when no remaining instance uses
//! that enablement.

mod acl;
mod dbus;
mod link;
mod mkdir;
mod wayland;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Enablements;
use crate::mediator::dbus::{self as bus, Config as BusConfig, DBusError, ProxyPair};
use crate::mediator::wayland::WaylandError;

pub use acl::{AclOp, Perms, update as update_acl};
pub use dbus::DBusProxyOp;
pub use link::LinkOp;
pub use mkdir::MkdirOp;
pub use wayland::WaylandOp;

bitflags! {
    /// When an op is reverted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Scope: u32 {
        const WAYLAND = Enablements::WAYLAND.bits();
        const DBUS = Enablements::DBUS.bits();
        const PULSE = Enablements::PULSE.bits();
        /// Reverted when the last instance of the identity exits.
        const USER = 1 << 4;
        /// Reverted when the instance exits.
        const PROCESS = 1 << 5;
    }
}

impl From<Enablements> for Scope {
    fn from(e: Enablements) -> Self {
        Self::from_bits_truncate(e.bits())
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::WAYLAND, "wayland"),
            (Self::DBUS, "dbus"),
            (Self::PULSE, "pulseaudio"),
            (Self::USER, "user"),
            (Self::PROCESS, "process"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(", ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Which scopes a revert covers. The default covers everything except
/// [`Scope::USER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Criteria(pub Option<Scope>);

impl Criteria {
    pub fn matches(self, scope: Scope) -> bool {
        match self.0 {
            None => scope != Scope::USER,
            Some(c) => c.intersects(scope),
        }
    }
}

impl From<Scope> for Criteria {
    fn from(s: Scope) -> Self {
        Self(Some(s))
    }
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("cannot {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Wayland(#[from] WaylandError),

    #[error(transparent)]
    DBus(#[from] DBusError),

    #[error("already committed")]
    Committed,

    #[error("{}", join(.0))]
    Revert(Vec<SystemError>),
}

fn join(errs: &[SystemError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl SystemError {
    pub(crate) fn io(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io {
            action,
            path,
            source,
        }
    }
}

/// A reversible change to the host.
pub trait Op: fmt::Display + fmt::Debug + Send {
    fn scope(&self) -> Scope;
    fn apply(&mut self, uid: u32) -> Result<(), SystemError>;
    fn revert(&mut self, uid: u32, criteria: Criteria) -> Result<(), SystemError>;
    /// Host path the op works on.
    fn path(&self) -> &Path;
}

/// Ops targeting one uid.
#[derive(Debug)]
pub struct System {
    uid: u32,
    ops: Vec<Box<dyn Op>>,
    committed: bool,
    applied: usize,
    reverted: bool,
}

impl System {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            ops: Vec::new(),
            committed: false,
            applied: 0,
            reverted: false,
        }
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn ops(&self) -> &[Box<dyn Op>] {
        &self.ops
    }

    pub fn push(&mut self, op: impl Op + 'static) -> &mut Self {
        self.ops.push(Box::new(op));
        self
    }

    /// Create `path` with mode `perm` if missing; never removed.
    pub fn ensure(&mut self, path: impl Into<PathBuf>, perm: u32) -> &mut Self {
        self.push(MkdirOp::new(Scope::USER, path, perm, false))
    }

    /// Create `path` with mode `perm`, removed when `scope` is reverted.
    pub fn ephemeral(&mut self, scope: Scope, path: impl Into<PathBuf>, perm: u32) -> &mut Self {
        self.push(MkdirOp::new(scope, path, perm, true))
    }

    /// Hard link `original` to `link`; the link is removed on exit.
    pub fn link(&mut self, original: impl Into<PathBuf>, link: impl Into<PathBuf>) -> &mut Self {
        self.push(LinkOp {
            original: original.into(),
            link: link.into(),
        })
    }

    /// Grant the target uid `perms` on `path` until the instance exits.
    pub fn update_perm(&mut self, path: impl Into<PathBuf>, perms: Perms) -> &mut Self {
        self.update_perm_type(Scope::PROCESS, path, perms)
    }

    pub fn update_perm_type(
        &mut self,
        scope: Scope,
        path: impl Into<PathBuf>,
        perms: Perms,
    ) -> &mut Self {
        self.push(AclOp {
            scope,
            path: path.into(),
            perms,
        })
    }

    /// Attach a security context for `app_id` to the compositor at `src`,
    /// listening on `dst`.
    pub fn wayland(
        &mut self,
        dst: impl Into<PathBuf>,
        src: impl Into<PathBuf>,
        app_id: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> &mut Self {
        self.push(WaylandOp::new(dst.into(), src.into(), app_id.into(), instance_id.into()))
    }

    /// Run a message bus proxy for the session bus, and the system bus when
    /// `system` is set, listening at the given paths.
    pub fn proxy_dbus(
        &mut self,
        session: Option<&BusConfig>,
        system: Option<&BusConfig>,
        session_path: impl Into<PathBuf>,
        system_path: impl Into<PathBuf>,
    ) -> Result<&mut Self, DBusError> {
        let (session_bus, system_bus) = bus::upstream(rustix::process::getuid().as_raw());
        let session_pair = ProxyPair {
            upstream: session_bus,
            socket: session_path.into(),
        };
        let system_pair = ProxyPair {
            upstream: system_bus,
            socket: system_path.into(),
        };
        let config = bus::finalise((&session_pair, session), (&system_pair, system))?;
        debug!(
            session = ?session.map(|c| c.args(&session_pair.upstream, &session_pair.socket.to_string_lossy())),
            system = ?system.map(|c| c.args(&system_pair.upstream, &system_pair.socket.to_string_lossy())),
            "message bus proxy configured"
        );
        Ok(self.push(DBusProxyOp::new(config)))
    }

    /// Apply every op in order. On failure the ops applied so far are
    /// reverted with the default criteria and the error is returned.
    pub fn commit(&mut self) -> Result<(), SystemError> {
        if self.committed {
            return Err(SystemError::Committed);
        }
        self.committed = true;

        for i in 0..self.ops.len() {
            if let Err(e) = self.ops[i].apply(self.uid) {
                debug!("commit faulted after {i} ops, rolling back partial commit");
                self.applied = i;
                if let Err(revert) = self.revert(Criteria::default()) {
                    warn!("cannot revert partial commit: {revert}");
                }
                return Err(e);
            }
        }
        self.applied = self.ops.len();
        Ok(())
    }

    /// Revert applied ops matching `criteria`, last first. Every op is
    /// attempted; failures are collected. Later calls do nothing.
    pub fn revert(&mut self, criteria: Criteria) -> Result<(), SystemError> {
        if self.reverted {
            return Ok(());
        }
        self.reverted = true;

        let uid = self.uid;
        let errs: Vec<SystemError> = self.ops[..self.applied]
            .iter_mut()
            .rev()
            .filter_map(|op| op.revert(uid, criteria).err())
            .collect();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(SystemError::Revert(errs))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug)]
    struct Record {
        name: &'static str,
        scope: Scope,
        fail: bool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl fmt::Display for Record {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name)
        }
    }

    impl Op for Record {
        fn scope(&self) -> Scope {
            self.scope
        }

        fn apply(&mut self, _: u32) -> Result<(), SystemError> {
            if self.fail {
                return Err(SystemError::io("apply", Path::new(self.name))(
                    io::ErrorKind::Other.into(),
                ));
            }
            self.log.lock().unwrap().push(format!("apply {}", self.name));
            Ok(())
        }

        fn revert(&mut self, _: u32, criteria: Criteria) -> Result<(), SystemError> {
            if criteria.matches(self.scope) {
                self.log.lock().unwrap().push(format!("revert {}", self.name));
            }
            Ok(())
        }

        fn path(&self) -> &Path {
            Path::new(self.name)
        }
    }

    fn system(ops: &[(&'static str, Scope, bool)]) -> (System, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut sys = System::new(1_000_009);
        for &(name, scope, fail) in ops {
            sys.push(Record {
                name,
                scope,
                fail,
                log: log.clone(),
            });
        }
        (sys, log)
    }

    #[test]
    fn criteria() {
        let all = Criteria::default();
        assert!(all.matches(Scope::PROCESS));
        assert!(all.matches(Scope::WAYLAND));
        assert!(!all.matches(Scope::USER));

        let c = Criteria::from(Scope::PROCESS | Scope::PULSE);
        assert!(c.matches(Scope::PULSE));
        assert!(!c.matches(Scope::WAYLAND));
        assert!(!c.matches(Scope::USER));
    }

    #[test]
    fn scope_names() {
        assert_eq!(Scope::USER.to_string(), "user");
        assert_eq!((Scope::WAYLAND | Scope::PROCESS).to_string(), "wayland, process");
        assert_eq!(
            Scope::from(Enablements::PULSE | Enablements::DBUS),
            Scope::DBUS | Scope::PULSE
        );
    }

    #[test]
    fn commit_then_revert() {
        let (mut sys, log) = system(&[
            ("a", Scope::USER, false),
            ("b", Scope::PROCESS, false),
            ("c", Scope::WAYLAND, false),
        ]);
        sys.commit().unwrap();
        assert!(matches!(sys.commit(), Err(SystemError::Committed)));
        sys.revert(Criteria::from(Scope::PROCESS | Scope::USER)).unwrap();
        // second revert does nothing
        sys.revert(Criteria::from(Scope::all())).unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            ["apply a", "apply b", "apply c", "revert b", "revert a"]
        );
    }

    #[test]
    fn partial_commit_rolls_back() {
        let (mut sys, log) = system(&[
            ("a", Scope::USER, false),
            ("b", Scope::PROCESS, false),
            ("c", Scope::PULSE, false),
            ("d", Scope::PROCESS, true),
            ("e", Scope::PROCESS, false),
        ]);
        assert!(sys.commit().is_err());
        assert_eq!(
            *log.lock().unwrap(),
            ["apply a", "apply b", "apply c", "revert c", "revert b"]
        );
    }

    #[test]
    fn joined_errors() {
        let err = SystemError::Revert(vec![
            SystemError::Committed,
            SystemError::io("remove", Path::new("/x"))(io::ErrorKind::NotFound.into()),
        ]);
        let s = err.to_string();
        assert!(s.starts_with("already committed\ncannot remove \"/x\""));
    }
}
