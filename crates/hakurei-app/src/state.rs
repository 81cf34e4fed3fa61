//! Persistent record of running instances.
//!
//! ```text
//! <run_dir>/state/
//! ├── 9.lock                        flock held while a cursor is live
//! └── 9/
//!     └── 1a2b...                   one State per instance, rmp-serde
//! ```
//!
//! Entries are grouped by application identity. Each group is guarded by an
//! advisory lock so that the decision to tear down per-user resources sees a
//! consistent set of instances.

use std::fmt;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rustix::fs::{FlockOperation, flock};
use rustix::io::Errno;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::identity::IDENTITY_MAX;

const ID_LEN: usize = 16;

/// Random identifier of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId([u8; ID_LEN]);

impl InstanceId {
    pub fn random() -> Self {
        let mut id = [0u8; ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for InstanceId {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut id = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut id).map_err(|_| StateError::BadId(s.to_owned()))?;
        Ok(Self(id))
    }
}

/// A running instance as seen by `ps`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: InstanceId,
    /// Pid of the shim.
    pub pid: i32,
    pub time: DateTime<Utc>,
    pub config: AppConfig,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("invalid instance id {0:?}")]
    BadId(String),

    #[error("state file {path:?} holds instance {found}")]
    Mismatch { path: PathBuf, found: InstanceId },

    #[error("instance {0} already recorded")]
    Exists(InstanceId),

    #[error("cannot encode state: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("cannot decode state {path:?}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: rmp_serde::decode::Error,
    },

    #[error("cannot {action} {path:?}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StateError {
    let path = path.to_path_buf();
    move |source| StateError::Io {
        action,
        path,
        source,
    }
}

/// Instance records under one runtime directory.
#[derive(Debug, Clone)]
pub struct Store {
    base: PathBuf,
}

impl Store {
    pub fn new(run_dir: impl AsRef<Path>) -> Self {
        Self {
            base: run_dir.as_ref().join("state"),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn mkdir(path: &Path) -> Result<(), StateError> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
            .map_err(io_err("create state directory", path))
    }

    /// Run `f` with exclusive access to the records of `aid`.
    pub fn do_with<T>(
        &self,
        aid: u32,
        f: impl FnOnce(&Cursor) -> T,
    ) -> Result<T, StateError> {
        let dir = self.base.join(aid.to_string());
        Self::mkdir(&dir)?;

        let lock_path = self.base.join(format!("{aid}.lock"));
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .mode(0o600)
            .open(&lock_path)
            .map_err(io_err("open state lock", &lock_path))?;
        loop {
            match flock(&lock, FlockOperation::LockExclusive) {
                Ok(()) => break,
                Err(Errno::INTR) => {}
                Err(e) => return Err(io_err("lock", &lock_path)(e.into())),
            }
        }

        let cursor = Cursor { dir };
        let out = f(&cursor);
        if let Err(e) = flock(&lock, FlockOperation::Unlock) {
            warn!("cannot unlock {lock_path:?}: {e}");
        }
        Ok(out)
    }

    /// Identities with a record directory, in ascending order.
    pub fn list(&self) -> Result<Vec<u32>, StateError> {
        let entries = match fs::read_dir(&self.base) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            r => r.map_err(io_err("read state directory", &self.base))?,
        };
        let mut aids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("read state directory", &self.base))?;
            if !entry.file_type().is_ok_and(|t| t.is_dir()) {
                continue;
            }
            match entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) {
                Some(aid) if aid <= IDENTITY_MAX => aids.push(aid),
                _ => debug!("skipping {:?} in state directory", entry.file_name()),
            }
        }
        aids.sort_unstable();
        Ok(aids)
    }
}

/// Records of one identity, valid while the lock is held.
#[derive(Debug)]
pub struct Cursor {
    dir: PathBuf,
}

impl Cursor {
    fn path(&self, id: &InstanceId) -> PathBuf {
        self.dir.join(id.to_string())
    }

    pub fn save(&self, state: &State) -> Result<(), StateError> {
        let buf = rmp_serde::to_vec_named(state)?;
        let path = self.path(&state.id);
        let mut f = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StateError::Exists(state.id));
            }
            r => r.map_err(io_err("create state file", &path))?,
        };
        f.write_all(&buf).map_err(io_err("write state file", &path))?;
        debug!(id = %state.id, "saved state");
        Ok(())
    }

    pub fn destroy(&self, id: &InstanceId) -> Result<(), StateError> {
        let path = self.path(id);
        fs::remove_file(&path).map_err(io_err("remove state file", &path))
    }

    /// Every record of this identity. Unreadable files are reported by path.
    pub fn load(&self) -> Result<Vec<State>, StateError> {
        let entries = fs::read_dir(&self.dir).map_err(io_err("read state directory", &self.dir))?;
        let mut states = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err("read state directory", &self.dir))?;
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(|n| n.parse::<InstanceId>().ok()) else {
                debug!("skipping {name:?} in state directory");
                continue;
            };

            let path = entry.path();
            let f = File::open(&path).map_err(io_err("open state file", &path))?;
            let state: State =
                rmp_serde::from_read(f).map_err(|source| StateError::Decode {
                    path: path.clone(),
                    source,
                })?;
            if state.id != id {
                return Err(StateError::Mismatch {
                    path,
                    found: state.id,
                });
            }
            states.push(state);
        }
        states.sort_by_key(|s| s.time);
        Ok(states)
    }

    pub fn len(&self) -> Result<usize, StateError> {
        let entries = fs::read_dir(&self.dir).map_err(io_err("read state directory", &self.dir))?;
        Ok(entries
            .filter_map(Result::ok)
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.parse::<InstanceId>().is_ok())
            })
            .count())
    }

    pub fn is_empty(&self) -> Result<bool, StateError> {
        self.len().map(|n| n == 0)
    }
}
