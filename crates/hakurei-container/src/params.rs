//! Container parameters.
//!
//! [`Params`] is built by the caller, sealed by serialization and replayed by
//! init inside the new namespaces.
//!
//! ## Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `dir` | `/` |
//! | `uid`/`gid` | overflow id (`< 1`) |
//! | `parent_perm` | `0o755` |
//! | `seccomp_presets` | none (flags add the hardening presets) |
//! | `flags` | everything denied |
//! | `privileged` | `false` |

use std::path::PathBuf;

use bitflags::bitflags;
use hakurei_sys::seccomp::{ExportFlag, FilterPreset};
use serde::{Deserialize, Serialize};

use crate::ops::Ops;

bitflags! {
    /// Each flag removes one hardening measure.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct HardeningFlags: u32 {
        /// Skip the extended rule set.
        const SYSCALL_COMPAT = 1 << 0;
        /// Allow ptrace, perf and personality changes.
        const ALLOW_DEVEL = 1 << 1;
        /// Allow nested user namespaces.
        const ALLOW_USERNS = 1 << 2;
        /// Keep the session and allow terminal injection ioctls.
        const ALLOW_TTY = 1 << 3;
        /// Share the host network namespace.
        const ALLOW_NET = 1 << 4;
    }
}

impl HardeningFlags {
    /// Presets implied by the measures left in place.
    pub fn presets(self) -> FilterPreset {
        let mut p = FilterPreset::empty();
        if !self.contains(Self::SYSCALL_COMPAT) {
            p |= FilterPreset::EXT;
        }
        if !self.contains(Self::ALLOW_DEVEL) {
            p |= FilterPreset::DENY_DEVEL;
        }
        if !self.contains(Self::ALLOW_USERNS) {
            p |= FilterPreset::DENY_NS;
        }
        if !self.contains(Self::ALLOW_TTY) {
            p |= FilterPreset::DENY_TTY;
        }
        p
    }
}

pub const DEFAULT_PARENT_PERM: u32 = 0o755;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Initial working directory inside the container.
    pub dir: PathBuf,
    /// `KEY=value` pairs, passed to the payload as-is.
    pub env: Vec<String>,
    /// Payload executable; empty selects `$SHELL` or a lookup of `args[0]`.
    pub path: PathBuf,
    pub args: Vec<String>,
    pub uid: i32,
    pub gid: i32,
    pub hostname: String,
    pub ops: Ops,
    pub seccomp_flags: ExportFlag,
    pub seccomp_presets: FilterPreset,
    pub parent_perm: u32,
    pub privileged: bool,
    pub flags: HardeningFlags,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/"),
            env: Vec::new(),
            path: PathBuf::new(),
            args: Vec::new(),
            uid: 0,
            gid: 0,
            hostname: String::new(),
            ops: Ops::default(),
            seccomp_flags: ExportFlag::empty(),
            seccomp_presets: FilterPreset::empty(),
            parent_perm: DEFAULT_PARENT_PERM,
            privileged: false,
            flags: HardeningFlags::empty(),
        }
    }
}

impl Params {
    /// Presets the filter is actually built from.
    pub fn effective_presets(&self) -> FilterPreset {
        self.seccomp_presets | self.flags.presets()
    }

    /// Sort `env` so identical environments serialize identically.
    pub fn sort_env(&mut self) {
        self.env.sort_unstable();
        self.env.dedup();
    }
}

/// Payload received by init over the setup pipe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitParams {
    pub params: Params,
    pub host_uid: u32,
    pub host_gid: u32,
    /// Extra files preceding the setup pipe, starting at descriptor 3.
    pub count: usize,
    /// Caller's umask, restored for the payload.
    pub umask: u32,
    pub verbose: bool,
}
