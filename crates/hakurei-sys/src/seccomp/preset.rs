//! The closed catalogue of filter rules.
//!
//! Rules are grouped into presets; [`rules`] concatenates the selected presets
//! in a fixed order so identical input always yields an identical program.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use super::arch::Syscall;

bitflags! {
    /// Rule groups toggled per container.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct FilterPreset: u32 {
        /// Extended rules: time, modules, kexec, swap, identity changes.
        const EXT = 1 << 0;
        /// Deny namespace creation and mount manipulation.
        const DENY_NS = 1 << 1;
        /// Deny terminal input injection.
        const DENY_TTY = 1 << 2;
        /// Deny ptrace, perf and personality changes.
        const DENY_DEVEL = 1 << 3;
        /// Allow the `PER_LINUX32` persona instead of `PER_LINUX`.
        const LINUX32 = 1 << 4;

        /// Every hardening preset, as applied to helpers outside the container.
        const STRICT = Self::EXT.bits()
            | Self::DENY_NS.bits()
            | Self::DENY_TTY.bits()
            | Self::DENY_DEVEL.bits();
    }
}

bitflags! {
    /// Compile-time toggles that are not expressed as presets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct ExportFlag: u32 {
        /// Keep the compat architecture and skip the emulation rules.
        const ALLOW_MULTIARCH = 1 << 0;
        /// Allow `AF_CAN` sockets.
        const ALLOW_CAN = 1 << 1;
        /// Allow `AF_BLUETOOTH` sockets.
        const ALLOW_BLUETOOTH = 1 << 2;
    }
}

/// Comparison applied to one 64-bit syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compare {
    Ne(u64),
    Eq(u64),
    Ge(u64),
    /// `(arg & mask) == value`
    MaskedEq { mask: u64, value: u64 },
}

/// Condition on a syscall argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgCmp {
    pub index: u8,
    pub op: Compare,
}

/// Return `errno` from `syscall`, optionally only when `arg` matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rule {
    pub syscall: Syscall,
    pub errno: i32,
    pub arg: Option<ArgCmp>,
}

impl Rule {
    pub const fn deny(syscall: Syscall, errno: i32) -> Self {
        Self {
            syscall,
            errno,
            arg: None,
        }
    }

    pub const fn deny_if(syscall: Syscall, errno: i32, index: u8, op: Compare) -> Self {
        Self {
            syscall,
            errno,
            arg: Some(ArgCmp { index, op }),
        }
    }
}

const EPERM: i32 = libc::EPERM;
const ENOSYS: i32 = libc::ENOSYS;
const EAFNOSUPPORT: i32 = libc::EAFNOSUPPORT;

const CLONE_NEWUSER: u64 = 0x1000_0000;
const TIOCSTI: u64 = 0x5412;
const TIOCLINUX: u64 = 0x541C;
const PER_LINUX: u64 = 0x0000;
const PER_LINUX32: u64 = 0x0008;

const AF_UNSPEC: u64 = 0;
const AF_LOCAL: u64 = 1;
const AF_INET: u64 = 2;
const AF_INET6: u64 = 10;
const AF_NETLINK: u64 = 16;
const AF_CAN: u64 = 29;
const AF_BLUETOOTH: u64 = 31;

use Syscall::*;

const COMMON: &[Rule] = &[
    Rule::deny(Syslog, EPERM),
    Rule::deny(Uselib, EPERM),
    Rule::deny(Acct, EPERM),
    Rule::deny(Quotactl, EPERM),
    Rule::deny(AddKey, EPERM),
    Rule::deny(Keyctl, EPERM),
    Rule::deny(RequestKey, EPERM),
    Rule::deny(MovePages, EPERM),
    Rule::deny(Mbind, EPERM),
    Rule::deny(GetMempolicy, EPERM),
    Rule::deny(SetMempolicy, EPERM),
    Rule::deny(MigratePages, EPERM),
];

const COMMON_EXT: &[Rule] = &[
    Rule::deny(Adjtimex, EPERM),
    Rule::deny(ClockAdjtime, EPERM),
    Rule::deny(ClockAdjtime64, EPERM),
    Rule::deny(ClockSettime, EPERM),
    Rule::deny(ClockSettime64, EPERM),
    Rule::deny(Settimeofday, EPERM),
    Rule::deny(DeleteModule, EPERM),
    Rule::deny(FinitModule, EPERM),
    Rule::deny(InitModule, EPERM),
    Rule::deny(KexecFileLoad, EPERM),
    Rule::deny(KexecLoad, EPERM),
    Rule::deny(Reboot, EPERM),
    Rule::deny(Swapoff, EPERM),
    Rule::deny(Swapon, EPERM),
];

const NAMESPACE: &[Rule] = &[
    Rule::deny(Unshare, EPERM),
    Rule::deny(Setns, EPERM),
    Rule::deny(Mount, EPERM),
    Rule::deny(Umount, EPERM),
    Rule::deny(Umount2, EPERM),
    Rule::deny(PivotRoot, EPERM),
    Rule::deny(Chroot, EPERM),
    Rule::deny_if(
        Clone,
        EPERM,
        0,
        Compare::MaskedEq {
            mask: CLONE_NEWUSER,
            value: CLONE_NEWUSER,
        },
    ),
    // flags live behind a pointer, so callers must fall back to clone
    Rule::deny(Clone3, ENOSYS),
    Rule::deny(OpenTree, ENOSYS),
    Rule::deny(MoveMount, ENOSYS),
    Rule::deny(Fsopen, ENOSYS),
    Rule::deny(Fsconfig, ENOSYS),
    Rule::deny(Fsmount, ENOSYS),
    Rule::deny(Fspick, ENOSYS),
    Rule::deny(MountSetattr, ENOSYS),
];

const NAMESPACE_EXT: &[Rule] = &[
    Rule::deny(Chown, EPERM),
    Rule::deny(Chown32, EPERM),
    Rule::deny(Fchown, EPERM),
    Rule::deny(Fchown32, EPERM),
    Rule::deny(Fchownat, EPERM),
    Rule::deny(Lchown, EPERM),
    Rule::deny(Lchown32, EPERM),
    Rule::deny(Setgid, EPERM),
    Rule::deny(Setgid32, EPERM),
    Rule::deny(Setgroups, EPERM),
    Rule::deny(Setgroups32, EPERM),
    Rule::deny(Setregid, EPERM),
    Rule::deny(Setregid32, EPERM),
    Rule::deny(Setresgid, EPERM),
    Rule::deny(Setresgid32, EPERM),
    Rule::deny(Setresuid, EPERM),
    Rule::deny(Setresuid32, EPERM),
    Rule::deny(Setreuid, EPERM),
    Rule::deny(Setreuid32, EPERM),
    Rule::deny(Setuid, EPERM),
    Rule::deny(Setuid32, EPERM),
];

const TTY: &[Rule] = &[
    Rule::deny_if(
        Ioctl,
        EPERM,
        1,
        Compare::MaskedEq {
            mask: 0xFFFF_FFFF,
            value: TIOCSTI,
        },
    ),
    Rule::deny_if(
        Ioctl,
        EPERM,
        1,
        Compare::MaskedEq {
            mask: 0xFFFF_FFFF,
            value: TIOCLINUX,
        },
    ),
];

const EMU: &[Rule] = &[Rule::deny(ModifyLdt, EPERM)];

const EMU_EXT: &[Rule] = &[
    Rule::deny(SubpageProt, ENOSYS),
    Rule::deny(SwitchEndian, ENOSYS),
    Rule::deny(Vm86, ENOSYS),
    Rule::deny(Vm86old, ENOSYS),
];

fn devel(allowed_personality: u64) -> [Rule; 3] {
    [
        Rule::deny(PerfEventOpen, EPERM),
        Rule::deny_if(Personality, EPERM, 0, Compare::Ne(allowed_personality)),
        Rule::deny(Ptrace, EPERM),
    ]
}

/// Concatenate the rules selected by `presets` and `flags`.
pub fn rules(presets: FilterPreset, flags: ExportFlag) -> Vec<Rule> {
    let multiarch = flags.contains(ExportFlag::ALLOW_MULTIARCH);
    let mut rules = Vec::with_capacity(96);

    rules.extend_from_slice(COMMON);
    if presets.contains(FilterPreset::DENY_NS) {
        rules.extend_from_slice(NAMESPACE);
    }
    if presets.contains(FilterPreset::DENY_TTY) {
        rules.extend_from_slice(TTY);
    }
    if presets.contains(FilterPreset::DENY_DEVEL) {
        let persona = if presets.contains(FilterPreset::LINUX32) {
            PER_LINUX32
        } else {
            PER_LINUX
        };
        rules.extend_from_slice(&devel(persona));
    }
    if !multiarch {
        rules.extend_from_slice(EMU);
    }
    if presets.contains(FilterPreset::EXT) {
        rules.extend_from_slice(COMMON_EXT);
        if presets.contains(FilterPreset::DENY_NS) {
            rules.extend_from_slice(NAMESPACE_EXT);
        }
        if !multiarch {
            rules.extend_from_slice(EMU_EXT);
        }
    }

    rules.extend(socket_rules(flags));
    rules
}

/// Socket families outside the allowlist fail with `EAFNOSUPPORT`.
fn socket_rules(flags: ExportFlag) -> Vec<Rule> {
    let mut allowed = vec![AF_UNSPEC, AF_LOCAL, AF_INET, AF_INET6, AF_NETLINK];
    if flags.contains(ExportFlag::ALLOW_CAN) {
        allowed.push(AF_CAN);
    }
    if flags.contains(ExportFlag::ALLOW_BLUETOOTH) {
        allowed.push(AF_BLUETOOTH);
    }

    let mut rules = Vec::new();
    let mut next = 0;
    for family in allowed {
        for denied in next..family {
            rules.push(Rule::deny_if(Socket, EAFNOSUPPORT, 0, Compare::Eq(denied)));
        }
        next = family + 1;
    }
    rules.push(Rule::deny_if(Socket, EAFNOSUPPORT, 0, Compare::Ge(next)));
    rules
}
