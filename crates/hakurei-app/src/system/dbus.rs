use std::fmt;
use std::path::Path;

use hakurei_container::path::NONEXISTENT;
use tracing::{debug, info};

use super::{Criteria, Op, Scope, SystemError};
use crate::mediator::dbus::{DBusError, Final, Proxy};

/// Message bus proxy running for the lifetime of the instance.
#[derive(Debug)]
pub struct DBusProxyOp {
    config: Final,
    proxy: Option<Proxy>,
}

impl DBusProxyOp {
    pub(super) fn new(config: Final) -> Self {
        Self {
            config,
            proxy: None,
        }
    }

    pub fn config(&self) -> &Final {
        &self.config
    }
}

impl Op for DBusProxyOp {
    fn scope(&self) -> Scope {
        Scope::PROCESS
    }

    fn apply(&mut self, _uid: u32) -> Result<(), SystemError> {
        info!(
            "session bus proxy on {:?} for upstream {:?}",
            self.config.session.socket, self.config.session.upstream
        );
        if let Some(system) = &self.config.system {
            info!(
                "system bus proxy on {:?} for upstream {:?}",
                system.socket, system.upstream
            );
        }
        let mut proxy = Proxy::start(&self.config, None)?;
        let ready = proxy.ready();
        // kept even when not ready, so the revert reaps it
        self.proxy = Some(proxy);
        ready?;
        debug!("message bus proxy ready");
        Ok(())
    }

    fn revert(&mut self, _uid: u32, _criteria: Criteria) -> Result<(), SystemError> {
        let Some(mut proxy) = self.proxy.take() else {
            return Ok(());
        };
        debug!("terminating message bus proxy");
        match proxy.wait() {
            Ok(code) => {
                debug!(code, "message bus proxy exit");
                Ok(())
            }
            Err(DBusError::Container(hakurei_container::ContainerError::Canceled)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn path(&self) -> &Path {
        Path::new(NONEXISTENT)
    }
}

impl fmt::Display for DBusProxyOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "message bus proxy on {:?}", self.config.session.socket)?;
        if let Some(system) = &self.config.system {
            write!(f, " and {:?}", system.socket)?;
        }
        Ok(())
    }
}
