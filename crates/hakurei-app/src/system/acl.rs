//! POSIX access ACL entries for the target uid.
//!
//! The ACL is edited directly through the `system.posix_acl_access`
//! extended attribute:
//!
//! ```text
//! u32 version (2)
//! { u16 tag, u16 perm, u32 id } ...   sorted by tag, then id
//! ```

use std::fmt;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use rustix::fs::{XattrFlags, getxattr, setxattr};
use rustix::io::Errno;
use tracing::debug;

use super::{Criteria, Op, Scope, SystemError};

const XATTR_NAME: &str = "system.posix_acl_access";
const VERSION: u32 = 2;
const ENTRY_LEN: usize = 8;
const UNDEFINED_ID: u32 = u32::MAX;

const TAG_USER_OBJ: u16 = 0x01;
const TAG_USER: u16 = 0x02;
const TAG_GROUP_OBJ: u16 = 0x04;
const TAG_GROUP: u16 = 0x08;
const TAG_MASK: u16 = 0x10;
const TAG_OTHER: u16 = 0x20;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Perms: u16 {
        const READ = 4;
        const WRITE = 2;
        const EXECUTE = 1;
    }
}

impl fmt::Display for Perms {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = |p, ch| if self.contains(p) { ch } else { '-' };
        write!(
            f,
            "{}{}{}",
            c(Self::READ, 'r'),
            c(Self::WRITE, 'w'),
            c(Self::EXECUTE, 'x')
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    tag: u16,
    id: u32,
    perm: u16,
}

fn decode(buf: &[u8]) -> io::Result<Vec<Entry>> {
    let (version, rest) = buf
        .split_first_chunk::<4>()
        .ok_or_else(|| io::Error::from(Errno::INVAL))?;
    if u32::from_le_bytes(*version) != VERSION || rest.len() % ENTRY_LEN != 0 {
        return Err(Errno::INVAL.into());
    }
    Ok(rest
        .chunks_exact(ENTRY_LEN)
        .map(|e| Entry {
            tag: u16::from_le_bytes([e[0], e[1]]),
            perm: u16::from_le_bytes([e[2], e[3]]),
            id: u32::from_le_bytes([e[4], e[5], e[6], e[7]]),
        })
        .collect())
}

fn encode(entries: &[Entry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + entries.len() * ENTRY_LEN);
    buf.extend_from_slice(&VERSION.to_le_bytes());
    for e in entries {
        buf.extend_from_slice(&e.tag.to_le_bytes());
        buf.extend_from_slice(&e.perm.to_le_bytes());
        buf.extend_from_slice(&e.id.to_le_bytes());
    }
    buf
}

/// Minimal ACL equivalent to `mode`.
fn from_mode(mode: u32) -> Vec<Entry> {
    let entry = |tag, shift| Entry {
        tag,
        id: UNDEFINED_ID,
        perm: ((mode >> shift) & 0o7u32) as u16,
    };
    vec![
        entry(TAG_USER_OBJ, 6),
        entry(TAG_GROUP_OBJ, 3),
        entry(TAG_OTHER, 0),
    ]
}

/// Replace the named entry of `uid` with `perms`, dropping it when `perms`
/// is empty, then recompute the mask.
fn update_entries(entries: &mut Vec<Entry>, uid: u32, perms: Perms) {
    entries.retain(|e| !(e.tag == TAG_USER && e.id == uid));
    if !perms.is_empty() {
        entries.push(Entry {
            tag: TAG_USER,
            id: uid,
            perm: perms.bits(),
        });
    }

    let named = entries
        .iter()
        .any(|e| e.tag == TAG_USER || e.tag == TAG_GROUP);
    let has_mask = entries.iter().any(|e| e.tag == TAG_MASK);
    if named || has_mask {
        let mask = entries
            .iter()
            .filter(|e| matches!(e.tag, TAG_USER | TAG_GROUP_OBJ | TAG_GROUP))
            .fold(0, |acc, e| acc | e.perm);
        entries.retain(|e| e.tag != TAG_MASK);
        entries.push(Entry {
            tag: TAG_MASK,
            id: UNDEFINED_ID,
            perm: mask,
        });
    }
    entries.sort_unstable();
}

fn read_acl(path: &Path) -> io::Result<Vec<Entry>> {
    let mut probe: [u8; 0] = [];
    let size = match getxattr(path, XATTR_NAME, &mut probe[..]) {
        Ok(size) => size,
        Err(Errno::NODATA) => {
            let mode = std::fs::metadata(path)?.permissions().mode();
            return Ok(from_mode(mode));
        }
        Err(errno) => return Err(errno.into()),
    };
    let mut buf = vec![0u8; size];
    let n = getxattr(path, XATTR_NAME, &mut buf[..])?;
    decode(&buf[..n])
}

/// Set the access ACL entry of `uid` on `path` to `perms`; empty `perms`
/// removes the entry.
pub fn update(path: &Path, uid: u32, perms: Perms) -> io::Result<()> {
    let mut entries = read_acl(path)?;
    update_entries(&mut entries, uid, perms);
    setxattr(path, XATTR_NAME, &encode(&entries), XattrFlags::empty())?;
    Ok(())
}

/// Grants the target uid `perms` on a path.
#[derive(Debug)]
pub struct AclOp {
    pub(super) scope: Scope,
    pub(super) path: PathBuf,
    pub(super) perms: Perms,
}

impl Op for AclOp {
    fn scope(&self) -> Scope {
        self.scope
    }

    fn apply(&mut self, uid: u32) -> Result<(), SystemError> {
        debug!("applying ACL {self}");
        update(&self.path, uid, self.perms).map_err(SystemError::io("apply ACL entry to", &self.path))
    }

    fn revert(&mut self, uid: u32, criteria: Criteria) -> Result<(), SystemError> {
        if !criteria.matches(self.scope) {
            debug!("skipping ACL {self}");
            return Ok(());
        }
        debug!("stripping ACL {self}");
        match update(&self.path, uid, Perms::empty()) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("target of ACL {self} no longer exists");
                Ok(())
            }
            r => r.map_err(SystemError::io("strip ACL entry from", &self.path)),
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for AclOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} type: {} path: {:?}", self.perms, self.scope, self.path)
    }
}
