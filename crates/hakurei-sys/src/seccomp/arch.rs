//! Architectures understood by the filter compiler and their syscall tables.
//!
//! Numbers are taken from the kernel's per-arch `unistd` tables. A syscall
//! that does not exist on an architecture resolves to `None` and is skipped
//! when that architecture's section is emitted.

use std::fmt;

const AUDIT_ARCH_X86_64: u32 = 0xc000003e;
const AUDIT_ARCH_I386: u32 = 0x40000003;
const AUDIT_ARCH_AARCH64: u32 = 0xc00000b7;
const AUDIT_ARCH_ARM: u32 = 0x40000028;

/// x32 syscalls on x86_64 have this bit set in `nr`.
pub(crate) const X32_SYSCALL_BIT: u32 = 0x4000_0000;

/// A target architecture as seen by `seccomp_data.arch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    X86_64,
    X86,
    Aarch64,
    Arm,
}

impl Arch {
    /// The architecture this binary was built for.
    pub const fn native() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(Self::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(Self::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(Self::Aarch64)
        } else if cfg!(target_arch = "arm") {
            Some(Self::Arm)
        } else {
            None
        }
    }

    /// The 32-bit compat architecture the kernel can run alongside this one.
    pub const fn secondary(self) -> Option<Self> {
        match self {
            Self::X86_64 => Some(Self::X86),
            Self::Aarch64 => Some(Self::Arm),
            Self::X86 | Self::Arm => None,
        }
    }

    /// `AUDIT_ARCH_*` value compared against `seccomp_data.arch`.
    pub const fn audit(self) -> u32 {
        match self {
            Self::X86_64 => AUDIT_ARCH_X86_64,
            Self::X86 => AUDIT_ARCH_I386,
            Self::Aarch64 => AUDIT_ARCH_AARCH64,
            Self::Arm => AUDIT_ARCH_ARM,
        }
    }

    const fn column(self) -> usize {
        match self {
            Self::X86_64 => 0,
            Self::X86 => 1,
            Self::Aarch64 => 2,
            Self::Arm => 3,
        }
    }

    /// Resolve a syscall to its number on this architecture.
    pub fn resolve(self, syscall: Syscall) -> Option<u32> {
        let nr = syscall.table()[self.column()];
        u32::try_from(nr).ok()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X86_64 => "x86_64",
            Self::X86 => "x86",
            Self::Aarch64 => "aarch64",
            Self::Arm => "arm",
        })
    }
}

macro_rules! syscalls {
    ($($variant:ident => $name:literal [$x86_64:literal, $x86:literal, $aarch64:literal, $arm:literal],)*) => {
        /// Syscalls referenced by the rule catalogue.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum Syscall {
            $($variant,)*
        }

        impl Syscall {
            /// Every syscall in the catalogue.
            pub const ALL: &'static [Syscall] = &[$(Syscall::$variant,)*];

            /// Kernel name of the syscall.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }

            // x86_64, x86, aarch64, arm; negative means absent.
            const fn table(self) -> [i32; 4] {
                match self {
                    $(Self::$variant => [$x86_64, $x86, $aarch64, $arm],)*
                }
            }
        }
    };
}

syscalls! {
    Syslog => "syslog" [103, 103, 116, 103],
    Uselib => "uselib" [134, 86, -1, 86],
    Acct => "acct" [163, 51, 89, 51],
    Quotactl => "quotactl" [179, 131, 60, 131],
    AddKey => "add_key" [248, 286, 217, 309],
    RequestKey => "request_key" [249, 287, 218, 310],
    Keyctl => "keyctl" [250, 288, 219, 311],
    MovePages => "move_pages" [279, 317, 239, 344],
    Mbind => "mbind" [237, 274, 235, 319],
    GetMempolicy => "get_mempolicy" [239, 275, 236, 320],
    SetMempolicy => "set_mempolicy" [238, 276, 237, 321],
    MigratePages => "migrate_pages" [256, 294, 238, 400],

    Adjtimex => "adjtimex" [159, 124, 171, 124],
    ClockAdjtime => "clock_adjtime" [305, 343, 266, 372],
    ClockAdjtime64 => "clock_adjtime64" [-1, 405, -1, 405],
    ClockSettime => "clock_settime" [227, 264, 112, 262],
    ClockSettime64 => "clock_settime64" [-1, 404, -1, 404],
    Settimeofday => "settimeofday" [164, 79, 170, 79],
    DeleteModule => "delete_module" [176, 129, 106, 129],
    FinitModule => "finit_module" [313, 350, 273, 379],
    InitModule => "init_module" [175, 128, 105, 128],
    KexecFileLoad => "kexec_file_load" [320, -1, 294, 401],
    KexecLoad => "kexec_load" [246, 283, 104, 347],
    Reboot => "reboot" [169, 88, 142, 88],
    Swapoff => "swapoff" [168, 115, 225, 115],
    Swapon => "swapon" [167, 87, 224, 87],

    Unshare => "unshare" [272, 310, 97, 337],
    Setns => "setns" [308, 346, 268, 375],
    Mount => "mount" [165, 21, 40, 21],
    Umount => "umount" [-1, 22, -1, -1],
    Umount2 => "umount2" [166, 52, 39, 52],
    PivotRoot => "pivot_root" [155, 217, 41, 218],
    Chroot => "chroot" [161, 61, 51, 61],
    Clone => "clone" [56, 120, 220, 120],
    Clone3 => "clone3" [435, 435, 435, 435],
    OpenTree => "open_tree" [428, 428, 428, 428],
    MoveMount => "move_mount" [429, 429, 429, 429],
    Fsopen => "fsopen" [430, 430, 430, 430],
    Fsconfig => "fsconfig" [431, 431, 431, 431],
    Fsmount => "fsmount" [432, 432, 432, 432],
    Fspick => "fspick" [433, 433, 433, 433],
    MountSetattr => "mount_setattr" [442, 442, 442, 442],

    Chown => "chown" [92, 182, -1, 182],
    Chown32 => "chown32" [-1, 212, -1, 212],
    Fchown => "fchown" [93, 95, 55, 95],
    Fchown32 => "fchown32" [-1, 207, -1, 207],
    Fchownat => "fchownat" [260, 298, 54, 325],
    Lchown => "lchown" [94, 16, -1, 16],
    Lchown32 => "lchown32" [-1, 198, -1, 198],
    Setgid => "setgid" [106, 46, 144, 46],
    Setgid32 => "setgid32" [-1, 214, -1, 214],
    Setgroups => "setgroups" [116, 81, 159, 81],
    Setgroups32 => "setgroups32" [-1, 206, -1, 206],
    Setregid => "setregid" [114, 71, 143, 71],
    Setregid32 => "setregid32" [-1, 204, -1, 204],
    Setresgid => "setresgid" [119, 170, 149, 170],
    Setresgid32 => "setresgid32" [-1, 210, -1, 210],
    Setresuid => "setresuid" [117, 164, 147, 164],
    Setresuid32 => "setresuid32" [-1, 208, -1, 208],
    Setreuid => "setreuid" [113, 70, 145, 70],
    Setreuid32 => "setreuid32" [-1, 203, -1, 203],
    Setuid => "setuid" [105, 23, 146, 23],
    Setuid32 => "setuid32" [-1, 213, -1, 213],

    Ioctl => "ioctl" [16, 54, 29, 54],

    PerfEventOpen => "perf_event_open" [298, 336, 241, 364],
    Personality => "personality" [135, 136, 92, 136],
    Ptrace => "ptrace" [101, 26, 117, 26],

    ModifyLdt => "modify_ldt" [154, 123, -1, -1],
    SubpageProt => "subpage_prot" [-1, -1, -1, -1],
    SwitchEndian => "switch_endian" [-1, -1, -1, -1],
    Vm86 => "vm86" [-1, 166, -1, -1],
    Vm86old => "vm86old" [-1, 113, -1, -1],

    Socket => "socket" [41, 359, 198, 281],
}

impl fmt::Display for Syscall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
