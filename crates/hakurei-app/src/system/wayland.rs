use std::fmt;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::acl::{self, Perms};
use super::{Criteria, Op, Scope, SystemError};
use crate::mediator::wayland::SecurityContext;

/// Wayland socket attached to a security context, reachable only by the
/// target uid.
#[derive(Debug)]
pub struct WaylandOp {
    dst: PathBuf,
    src: PathBuf,
    app_id: String,
    instance_id: String,
    context: Option<SecurityContext>,
}

impl WaylandOp {
    pub(super) fn new(dst: PathBuf, src: PathBuf, app_id: String, instance_id: String) -> Self {
        Self {
            dst,
            src,
            app_id,
            instance_id,
            context: None,
        }
    }
}

impl Op for WaylandOp {
    fn scope(&self) -> Scope {
        Scope::PROCESS
    }

    fn apply(&mut self, uid: u32) -> Result<(), SystemError> {
        let context = SecurityContext::new(&self.src, &self.dst, &self.app_id, &self.instance_id)?;
        info!("wayland listening on {:?}", self.dst);
        self.context = Some(context);

        fs::set_permissions(&self.dst, fs::Permissions::from_mode(0))
            .map_err(SystemError::io("chmod", &self.dst))?;
        acl::update(&self.dst, uid, Perms::all()).map_err(SystemError::io("apply ACL entry to", &self.dst))
    }

    fn revert(&mut self, _uid: u32, criteria: Criteria) -> Result<(), SystemError> {
        if !criteria.matches(Scope::PROCESS) {
            debug!("skipping wayland cleanup on {:?}", self.dst);
            return Ok(());
        }
        let Some(context) = self.context.take() else {
            return Ok(());
        };
        debug!("detaching from wayland on {:?}", self.src);
        context
            .close()
            .map_err(SystemError::io("close security context on", &self.dst))
    }

    fn path(&self) -> &Path {
        &self.dst
    }
}

impl fmt::Display for WaylandOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wayland socket at {:?}", self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mediator::wayland::WaylandError;

    #[test]
    fn compositor_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("wayland");
        let mut op = WaylandOp::new(
            dst.clone(),
            dir.path().join("wayland-0"),
            "org.example.App".into(),
            "0".repeat(32),
        );
        assert!(matches!(
            op.apply(1_000_009),
            Err(SystemError::Wayland(WaylandError::Connect { .. }))
        ));
        assert!(!dst.exists());
        // nothing attached, nothing to undo
        op.revert(1_000_009, Criteria::default()).unwrap();
        assert_eq!(op.to_string(), format!("wayland socket at {dst:?}"));
    }
}
