//! D-Bus server address parsing.
//!
//! An address is a `;`-separated list of `method:key=value,...` entries;
//! values escape bytes outside `[-0-9A-Za-z_/.\*]` as `%xx`.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ENV_SESSION_BUS: &str = "DBUS_SESSION_BUS_ADDRESS";
pub const ENV_SYSTEM_BUS: &str = "DBUS_SYSTEM_BUS_ADDRESS";
pub const FALLBACK_SYSTEM_BUS: &str = "unix:path=/var/run/dbus/system_bus_socket";

/// Session bus address assumed for `uid` when none is set.
pub fn fallback_session_bus(uid: u32) -> String {
    format!("unix:path=/run/user/{uid}/bus")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("address does not contain a colon")]
    NoColon,
    #[error("'=' character not found")]
    BadPairSep,
    #[error("'=' character has no key preceding it")]
    BadPairKey,
    #[error("'=' character has no value following it")]
    BadPairVal,
    #[error("characters other than [-0-9A-Za-z_/.\\*] should have been escaped")]
    BadValByte,
    #[error("percent character was not followed by two hex digits")]
    BadValHexLength,
    #[error("percent character was followed by characters other than hex digits")]
    BadValHexByte,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad address entry {entry}: {kind}")]
pub struct BadAddress {
    pub kind: ParseErrorKind,
    pub entry: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddrEntry {
    pub method: String,
    pub values: Vec<(String, String)>,
}

impl AddrEntry {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Socket path of a `unix:path=` entry.
    pub fn unix_path(&self) -> Option<&str> {
        if self.method == "unix" {
            self.get("path")
        } else {
            None
        }
    }
}

impl fmt::Display for AddrEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.method)?;
        for (i, (k, v)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

pub fn parse(addr: &str) -> Result<Vec<AddrEntry>, BadAddress> {
    let addr = addr.strip_suffix(';').unwrap_or(addr);
    addr.split(';')
        .enumerate()
        .map(|(entry, s)| parse_entry(s).map_err(|kind| BadAddress { kind, entry }))
        .collect()
}

fn parse_entry(s: &str) -> Result<AddrEntry, ParseErrorKind> {
    let (method, list) = s.split_once(':').ok_or(ParseErrorKind::NoColon)?;
    let values = list
        .split(',')
        .map(|pair| {
            let (k, v) = pair.split_once('=').ok_or(ParseErrorKind::BadPairSep)?;
            if k.is_empty() {
                return Err(ParseErrorKind::BadPairKey);
            }
            if v.is_empty() {
                return Err(ParseErrorKind::BadPairVal);
            }
            Ok((k.to_owned(), unescape(v.as_bytes())?))
        })
        .collect::<Result<_, _>>()?;
    Ok(AddrEntry {
        method: method.to_owned(),
        values,
    })
}

fn optional_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"-_/.\\*".contains(&b)
}

fn unescape(v: &[u8]) -> Result<String, ParseErrorKind> {
    let mut out = Vec::with_capacity(v.len());
    let mut i = 0;
    while i < v.len() {
        let b = v[i];
        if optional_byte(b) {
            out.push(b);
            i += 1;
            continue;
        }
        if b != b'%' {
            return Err(ParseErrorKind::BadValByte);
        }
        let hex = v.get(i + 1..i + 3).ok_or(ParseErrorKind::BadValHexLength)?;
        let mut decoded = [0u8; 1];
        hex::decode_to_slice(hex, &mut decoded).map_err(|_| ParseErrorKind::BadValHexByte)?;
        out.push(decoded[0]);
        i += 3;
    }
    Ok(String::from_utf8_lossy(&out).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_address() {
        let got = parse("unix:path=/run/user/1971/bus").unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].method, "unix");
        assert_eq!(got[0].unix_path(), Some("/run/user/1971/bus"));
        assert_eq!(got[0].to_string(), "unix:path=/run/user/1971/bus");
    }

    #[test]
    fn multiple_entries() {
        let got = parse("unix:path=/a,guid=123;tcp:host=localhost,port=1;").unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].get("guid"), Some("123"));
        assert_eq!(got[1].method, "tcp");
        assert_eq!(got[1].unix_path(), None);
    }

    #[test]
    fn escaped_value() {
        let got = parse("unix:path=/tmp/a%20b").unwrap();
        assert_eq!(got[0].unix_path(), Some("/tmp/a b"));
    }

    #[test]
    fn bad_addresses() {
        let kind = |s| parse(s).unwrap_err().kind;
        assert_eq!(kind("unix"), ParseErrorKind::NoColon);
        assert_eq!(kind("unix:path"), ParseErrorKind::BadPairSep);
        assert_eq!(kind("unix:=/a"), ParseErrorKind::BadPairKey);
        assert_eq!(kind("unix:path="), ParseErrorKind::BadPairVal);
        assert_eq!(kind("unix:path=/a b"), ParseErrorKind::BadValByte);
        assert_eq!(kind("unix:path=/a%2"), ParseErrorKind::BadValHexLength);
        assert_eq!(kind("unix:path=/a%zz"), ParseErrorKind::BadValHexByte);
        assert_eq!(parse("unix:path=/a;x").unwrap_err().entry, 1);
    }
}
