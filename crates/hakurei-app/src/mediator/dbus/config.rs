//! Filtering rules handed to xdg-dbus-proxy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad interface string {0:?}")]
pub struct BadInterface(pub String);

/// Rules for one bus.
///
/// With `filter` unset the proxy passes everything through and only the
/// socket location changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Names the application may see.
    pub see: Vec<String>,
    /// Names the application may talk to.
    pub talk: Vec<String>,
    /// Names the application may own.
    pub own: Vec<String>,
    /// Call rules, keyed by name.
    pub call: BTreeMap<String, String>,
    /// Broadcast rules, keyed by name.
    pub broadcast: BTreeMap<String, String>,
    /// Log filtered traffic.
    pub log: bool,
    pub filter: bool,
}

impl Config {
    /// Defaults for application `id`.
    ///
    /// `defaults` grants access to the bus itself, notifications and the
    /// desktop portal; `mpris` lets the application own its MPRIS name.
    pub fn new(id: &str, defaults: bool, mpris: bool) -> Self {
        let mut c = Self {
            filter: true,
            ..Self::default()
        };
        if defaults {
            c.talk = vec![
                "org.freedesktop.DBus".into(),
                "org.freedesktop.Notifications".into(),
            ];
            c.call
                .insert("org.freedesktop.portal.*".into(), "*".into());
            c.broadcast
                .insert("org.freedesktop.portal.*".into(), "@/org/freedesktop/portal/*".into());
            if !id.is_empty() {
                c.own.push(format!("{id}.*"));
                if mpris {
                    c.own.push(format!("org.mpris.MediaPlayer2.{id}.*"));
                }
            }
        }
        c
    }

    /// Reject names that cannot be bus names or name prefixes.
    pub fn check_interfaces(&self) -> Result<(), BadInterface> {
        let names = self
            .see
            .iter()
            .chain(&self.talk)
            .chain(&self.own)
            .chain(self.call.keys())
            .chain(self.broadcast.keys());
        for name in names {
            let trimmed = name.strip_suffix(".*").unwrap_or(name);
            if !trimmed.contains('.') {
                return Err(BadInterface(name.clone()));
            }
        }
        Ok(())
    }

    /// Proxy arguments for upstream address `bus` and listening socket
    /// `path`.
    pub fn args(&self, bus: &str, path: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(
            3 + self.see.len()
                + self.talk.len()
                + self.own.len()
                + self.call.len()
                + self.broadcast.len(),
        );
        args.push(bus.to_owned());
        args.push(path.to_owned());
        if self.filter {
            args.push("--filter".into());
        }
        args.extend(self.see.iter().map(|n| format!("--see={n}")));
        args.extend(self.talk.iter().map(|n| format!("--talk={n}")));
        args.extend(self.own.iter().map(|n| format!("--own={n}")));
        args.extend(self.call.iter().map(|(n, r)| format!("--call={n}={r}")));
        args.extend(
            self.broadcast
                .iter()
                .map(|(n, r)| format!("--broadcast={n}={r}")),
        );
        if self.log {
            args.push("--log".into());
        }
        args
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_rules() {
        let c = Config::new("org.chromium.Chromium", true, true);
        assert!(c.filter);
        assert_eq!(
            c.own,
            [
                "org.chromium.Chromium.*",
                "org.mpris.MediaPlayer2.org.chromium.Chromium.*"
            ]
        );
        c.check_interfaces().unwrap();

        let bare = Config::new("org.chromium.Chromium", false, true);
        assert!(bare.filter);
        assert!(bare.talk.is_empty() && bare.own.is_empty());
    }

    #[test]
    fn proxy_args() {
        let c = Config::new("org.example.App", true, false);
        let args = c.args("unix:path=/run/user/1000/bus", "/tmp/bus");
        assert_eq!(
            args,
            [
                "unix:path=/run/user/1000/bus",
                "/tmp/bus",
                "--filter",
                "--talk=org.freedesktop.DBus",
                "--talk=org.freedesktop.Notifications",
                "--own=org.example.App.*",
                "--call=org.freedesktop.portal.*=*",
                "--broadcast=org.freedesktop.portal.*=@/org/freedesktop/portal/*",
            ]
        );

        let open = Config {
            log: true,
            ..Config::default()
        };
        assert_eq!(open.args("a", "b"), ["a", "b", "--log"]);
    }

    #[test]
    fn interface_check() {
        let mut c = Config::default();
        c.see.push("org.freedesktop.*".into());
        c.check_interfaces().unwrap();
        c.talk.push("nodots.*".into());
        assert_eq!(c.check_interfaces(), Err(BadInterface("nodots.*".into())));
    }
}
