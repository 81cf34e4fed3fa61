//! Seccomp-BPF filter compiler.
//!
//! Builds a classic BPF program from a closed catalogue of rule presets and
//! either loads it into the calling task or streams it through a pipe.
//!
//! ## Filter Structure
//!
//! The default action is allow; the presets only carve out denials:
//!
//! 1. Dispatch on `seccomp_data.arch`, killing unknown architectures
//! 2. On x86_64, kill x32 syscall numbers
//! 3. For each syscall with rules, evaluate them in order
//! 4. The first matching rule returns its errno; otherwise allow
//!
//! ## Architectures
//!
//! The native architecture is always covered. The compat architecture (x86 on
//! x86_64, arm on aarch64) is only admitted with [`ExportFlag::ALLOW_MULTIARCH`];
//! without it, every compat syscall kills the process.
//!
//! ## Result Codes
//!
//! Failures carry a small numeric [`ResultCode`] naming the failing stage,
//! rendered as a fixed prefix followed by the errno.

mod arch;
mod compile;
mod preset;

use std::fs::File;
use std::io::Write;
use std::os::fd::OwnedFd;
use std::thread::JoinHandle;

use rustix::io::Errno;
use rustix::pipe::{PipeFlags, pipe_with};
use thiserror::Error;

use crate::last_errno;

pub use arch::{Arch, Syscall};
pub use compile::compile;
pub use preset::{ArgCmp, Compare, ExportFlag, FilterPreset, Rule, rules};

// Seccomp constants
const SECCOMP_SET_MODE_FILTER: u32 = 1;
pub const SECCOMP_RET_KILL_PROCESS: u32 = 0x8000_0000;
pub const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;

// BPF instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;

// BPF ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;

// BPF alu/jmp fields
pub const BPF_AND: u16 = 0x50;
pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;
pub const BPF_K: u16 = 0x00;

pub const BPF_MAXINSNS: usize = 4096;

// seccomp_data offsets
pub const OFFSET_SYSCALL_NR: u32 = 0;
pub const OFFSET_ARCH: u32 = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    #[inline]
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    #[inline]
    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct SockFprog {
    pub len: u16,
    pub filter: *const SockFilter,
}

/// Stage of filter construction that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Init = 1,
    ArchAdd = 2,
    ArchAddMultiarch = 3,
    Internal = 4,
    RuleAdd = 5,
    Export = 6,
    Load = 7,
}

impl ResultCode {
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::Init => "seccomp_init failed",
            Self::ArchAdd => "seccomp_arch_add failed",
            Self::ArchAddMultiarch => "seccomp_arch_add failed (multiarch)",
            Self::Internal => "internal libseccomp failure",
            Self::RuleAdd => "seccomp_rule_add failed",
            Self::Export => "seccomp_export_bpf failed",
            Self::Load => "seccomp_load failed",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SeccompError {
    #[error("invalid native rules slice")]
    InvalidRules,

    #[error("{}: {errno}", code.prefix())]
    Library { code: ResultCode, errno: Errno },
}

impl SeccompError {
    pub(crate) fn library(code: ResultCode, errno: i32) -> Self {
        Self::Library {
            code,
            errno: Errno::from_raw_os_error(errno),
        }
    }

    /// The result code, if the failure came from a construction stage.
    pub fn code(&self) -> Option<ResultCode> {
        match self {
            Self::InvalidRules => None,
            Self::Library { code, .. } => Some(*code),
        }
    }
}

/// Architectures a filter for `flags` covers, native first.
pub fn arches(flags: ExportFlag) -> Result<Vec<Arch>, SeccompError> {
    let native =
        Arch::native().ok_or_else(|| SeccompError::library(ResultCode::ArchAdd, libc::EOPNOTSUPP))?;
    let mut arches = vec![native];
    if flags.contains(ExportFlag::ALLOW_MULTIARCH) {
        if let Some(secondary) = native.secondary() {
            arches.push(secondary);
        }
    }
    Ok(arches)
}

/// Build the program for `presets` and `flags` on the native architecture.
pub fn program(presets: FilterPreset, flags: ExportFlag) -> Result<Vec<SockFilter>, SeccompError> {
    compile(&arches(flags)?, &rules(presets, flags))
}

/// Serialize a program the way `seccomp(2)` reads it: 8 bytes per instruction,
/// native endian.
pub fn to_bytes(program: &[SockFilter]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(program.len() * 8);
    for insn in program {
        buf.extend_from_slice(&insn.code.to_ne_bytes());
        buf.push(insn.jt);
        buf.push(insn.jf);
        buf.extend_from_slice(&insn.k.to_ne_bytes());
    }
    buf
}

/// Load `program` into the calling task.
///
/// Sets `PR_SET_NO_NEW_PRIVS` first, which the kernel requires for
/// unprivileged filters.
///
/// # Errors
///
/// Returns [`ResultCode::Load`] with the kernel errno on failure.
pub fn load(program: &[SockFilter]) -> Result<(), SeccompError> {
    let len = u16::try_from(program.len())
        .map_err(|_| SeccompError::library(ResultCode::Internal, libc::E2BIG))?;
    let fprog = SockFprog {
        len,
        filter: program.as_ptr(),
    };
    // SAFETY: fprog points into `program`, which outlives the call.
    unsafe { seccomp_set_mode_filter(&fprog) }.map_err(|errno| SeccompError::Library {
        code: ResultCode::Load,
        errno,
    })
}

/// Applies a seccomp-BPF filter to the current thread.
///
/// # Safety
///
/// This permanently restricts syscalls for this thread. The filter must be valid.
unsafe fn seccomp_set_mode_filter(fprog: &SockFprog) -> Result<(), Errno> {
    let ret = unsafe { libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) };
    if ret != 0 {
        return Err(last_errno());
    }

    let ret = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            0u32,
            fprog as *const _,
        )
    };
    if ret != 0 { Err(last_errno()) } else { Ok(()) }
}

/// Returns true if seccomp is available.
pub fn seccomp_available() -> bool {
    unsafe { libc::prctl(libc::PR_GET_SECCOMP, 0, 0, 0, 0) >= 0 }
}

/// A program being streamed into a pipe by a background thread.
///
/// Drain [`Exporter::reader`] to EOF, then call [`Exporter::wait`].
#[derive(Debug)]
pub struct Exporter {
    reader: File,
    writer: JoinHandle<Result<(), SeccompError>>,
}

impl Exporter {
    /// Compile `presets`/`flags` and start streaming the result.
    pub fn new(presets: FilterPreset, flags: ExportFlag) -> Result<Self, SeccompError> {
        Self::from_program(program(presets, flags)?)
    }

    pub fn from_program(program: Vec<SockFilter>) -> Result<Self, SeccompError> {
        let (r, w) = pipe_with(PipeFlags::CLOEXEC).map_err(|errno| SeccompError::Library {
            code: ResultCode::Export,
            errno,
        })?;
        let writer = std::thread::spawn(move || write_program(w, &program));
        Ok(Self {
            reader: File::from(r),
            writer,
        })
    }

    pub fn reader(&mut self) -> &mut File {
        &mut self.reader
    }

    /// Close the read end and collect the writer's result.
    pub fn wait(self) -> Result<(), SeccompError> {
        drop(self.reader);
        self.writer
            .join()
            .map_err(|_| SeccompError::library(ResultCode::Internal, libc::EIO))?
    }
}

fn write_program(fd: OwnedFd, program: &[SockFilter]) -> Result<(), SeccompError> {
    let mut w = File::from(fd);
    w.write_all(&to_bytes(program)).map_err(|e| {
        SeccompError::library(ResultCode::Export, e.raw_os_error().unwrap_or(libc::EIO))
    })
    // write end closes here, signalling EOF
}

#[cfg(test)]
mod vm;

#[cfg(test)]
mod tests {
    use std::io::Read;

    use sha2::{Digest, Sha512};

    use super::vm::{Data, run};
    use super::*;

    const ALL_PRESETS: FilterPreset = FilterPreset::EXT
        .union(FilterPreset::DENY_NS)
        .union(FilterPreset::DENY_TTY)
        .union(FilterPreset::DENY_DEVEL);

    fn native() -> Arch {
        Arch::native().expect("unsupported test architecture")
    }

    fn nr(arch: Arch, syscall: Syscall) -> i32 {
        arch.resolve(syscall).expect("syscall absent") as i32
    }

    fn verdict(program: &[SockFilter], arch: Arch, syscall: Syscall, args: [u64; 6]) -> u32 {
        run(program, &Data::new(nr(arch, syscall), arch.audit(), args))
    }

    fn errno(e: i32) -> u32 {
        SECCOMP_RET_ERRNO | e as u32
    }

    #[test]
    fn default_allows() {
        let p = program(ALL_PRESETS, ExportFlag::empty()).unwrap();
        let data = Data::new(libc::SYS_getpid as i32, native().audit(), [0; 6]);
        assert_eq!(run(&p, &data), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn common_denies() {
        let arch = native();
        let p = program(FilterPreset::empty(), ExportFlag::empty()).unwrap();
        assert_eq!(verdict(&p, arch, Syscall::Syslog, [0; 6]), errno(libc::EPERM));
        assert_eq!(verdict(&p, arch, Syscall::Keyctl, [0; 6]), errno(libc::EPERM));
        assert_eq!(verdict(&p, arch, Syscall::Mount, [0; 6]), SECCOMP_RET_ALLOW);
    }

    #[test]
    fn namespace_rules() {
        let arch = native();
        let p = program(FilterPreset::DENY_NS, ExportFlag::empty()).unwrap();
        for s in [
            Syscall::Unshare,
            Syscall::Setns,
            Syscall::Mount,
            Syscall::PivotRoot,
            Syscall::Chroot,
        ] {
            assert_eq!(verdict(&p, arch, s, [0; 6]), errno(libc::EPERM), "{s}");
        }
        assert_eq!(verdict(&p, arch, Syscall::Clone3, [0; 6]), errno(libc::ENOSYS));
        assert_eq!(verdict(&p, arch, Syscall::Fsopen, [0; 6]), errno(libc::ENOSYS));

        let newuser = libc::CLONE_NEWUSER as u64 | libc::SIGCHLD as u64;
        assert_eq!(
            verdict(&p, arch, Syscall::Clone, [newuser, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        let thread = (libc::CLONE_VM | libc::CLONE_THREAD | libc::CLONE_SIGHAND) as u64;
        assert_eq!(
            verdict(&p, arch, Syscall::Clone, [thread, 0, 0, 0, 0, 0]),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn tty_rules() {
        let arch = native();
        let p = program(FilterPreset::DENY_TTY, ExportFlag::empty()).unwrap();
        assert_eq!(
            verdict(&p, arch, Syscall::Ioctl, [0, 0x5412, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        assert_eq!(
            verdict(&p, arch, Syscall::Ioctl, [0, 0xdead_0000_0000_5412, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        assert_eq!(
            verdict(&p, arch, Syscall::Ioctl, [0, 0x541C, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        // TIOCGWINSZ
        assert_eq!(
            verdict(&p, arch, Syscall::Ioctl, [1, 0x5413, 0, 0, 0, 0]),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn devel_rules() {
        let arch = native();
        let p = program(FilterPreset::DENY_DEVEL, ExportFlag::empty()).unwrap();
        assert_eq!(verdict(&p, arch, Syscall::Ptrace, [0; 6]), errno(libc::EPERM));
        assert_eq!(verdict(&p, arch, Syscall::PerfEventOpen, [0; 6]), errno(libc::EPERM));
        assert_eq!(verdict(&p, arch, Syscall::Personality, [0; 6]), SECCOMP_RET_ALLOW);
        assert_eq!(
            verdict(&p, arch, Syscall::Personality, [8, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );
        assert_eq!(
            verdict(&p, arch, Syscall::Personality, [1 << 32, 0, 0, 0, 0, 0]),
            errno(libc::EPERM)
        );

        let p = program(FilterPreset::DENY_DEVEL | FilterPreset::LINUX32, ExportFlag::empty())
            .unwrap();
        assert_eq!(
            verdict(&p, arch, Syscall::Personality, [8, 0, 0, 0, 0, 0]),
            SECCOMP_RET_ALLOW
        );
    }

    #[test]
    fn socket_families() {
        let arch = native();
        let p = program(FilterPreset::empty(), ExportFlag::empty()).unwrap();
        let sock = |family: u64| verdict(&p, arch, Syscall::Socket, [family, 1, 0, 0, 0, 0]);
        for allowed in [0, 1, 2, 10, 16] {
            assert_eq!(sock(allowed), SECCOMP_RET_ALLOW, "family {allowed}");
        }
        for denied in [3, 9, 11, 15, 17, 29, 31, 44, u64::MAX] {
            assert_eq!(sock(denied), errno(libc::EAFNOSUPPORT), "family {denied}");
        }

        let p = program(
            FilterPreset::empty(),
            ExportFlag::ALLOW_CAN | ExportFlag::ALLOW_BLUETOOTH,
        )
        .unwrap();
        let sock = |family: u64| verdict(&p, arch, Syscall::Socket, [family, 1, 0, 0, 0, 0]);
        assert_eq!(sock(29), SECCOMP_RET_ALLOW);
        assert_eq!(sock(31), SECCOMP_RET_ALLOW);
        assert_eq!(sock(30), errno(libc::EAFNOSUPPORT));
        assert_eq!(sock(32), errno(libc::EAFNOSUPPORT));
    }

    #[test]
    fn foreign_arch_killed() {
        let p = program(ALL_PRESETS, ExportFlag::empty()).unwrap();
        let data = Data::new(0, 0xdead_beef, [0; 6]);
        assert_eq!(run(&p, &data), SECCOMP_RET_KILL_PROCESS);

        if let Some(secondary) = native().secondary() {
            let data = Data::new(20, secondary.audit(), [0; 6]);
            assert_eq!(run(&p, &data), SECCOMP_RET_KILL_PROCESS);
        }
    }

    #[test]
    fn multiarch_admits_compat() {
        let Some(secondary) = native().secondary() else {
            return;
        };
        let p = program(ALL_PRESETS, ExportFlag::ALLOW_MULTIARCH).unwrap();
        assert_eq!(
            verdict(&p, secondary, Syscall::Unshare, [0; 6]),
            errno(libc::EPERM)
        );
        // getpid on the compat table
        let data = Data::new(20, secondary.audit(), [0; 6]);
        assert_eq!(run(&p, &data), SECCOMP_RET_ALLOW);
        assert_eq!(
            verdict(&p, native(), Syscall::Mount, [0; 6]),
            errno(libc::EPERM)
        );
    }

    #[test]
    #[cfg(target_arch = "x86_64")]
    fn x32_killed() {
        let p = program(FilterPreset::empty(), ExportFlag::empty()).unwrap();
        let data = Data::new(0x4000_0027, Arch::X86_64.audit(), [0; 6]);
        assert_eq!(run(&p, &data), SECCOMP_RET_KILL_PROCESS);
    }

    #[test]
    fn empty_rules_rejected() {
        let err = compile(&[native()], &[]).unwrap_err();
        assert!(matches!(err, SeccompError::InvalidRules));
    }

    #[test]
    fn bad_arg_index() {
        let rule = Rule::deny_if(Syscall::Ioctl, libc::EPERM, 6, Compare::Eq(0));
        let err = compile(&[native()], &[rule]).unwrap_err();
        assert_eq!(err.code(), Some(ResultCode::RuleAdd));
        assert!(err.to_string().starts_with("seccomp_rule_add failed: "));
    }

    #[test]
    fn byte_stream_is_stable() {
        let configs = [
            (FilterPreset::empty(), ExportFlag::empty()),
            (ALL_PRESETS, ExportFlag::empty()),
            (ALL_PRESETS, ExportFlag::ALLOW_MULTIARCH),
            (FilterPreset::EXT | FilterPreset::DENY_DEVEL, ExportFlag::ALLOW_CAN),
        ];
        let mut digests = Vec::new();
        for (presets, flags) in configs {
            let a = Sha512::digest(to_bytes(&program(presets, flags).unwrap()));
            let b = Sha512::digest(to_bytes(&program(presets, flags).unwrap()));
            assert_eq!(hex::encode(a), hex::encode(b));
            digests.push(hex::encode(a));
        }
        digests.sort();
        digests.dedup();
        assert_eq!(digests.len(), configs.len());
    }

    #[test]
    fn export_streams_program() {
        let expected = to_bytes(&program(ALL_PRESETS, ExportFlag::empty()).unwrap());
        let mut exporter = Exporter::new(ALL_PRESETS, ExportFlag::empty()).unwrap();
        let mut got = Vec::new();
        exporter.reader().read_to_end(&mut got).unwrap();
        exporter.wait().unwrap();
        assert_eq!(got.len() % 8, 0);
        assert_eq!(got, expected);
    }

    #[test]
    fn result_code_prefixes() {
        let err = SeccompError::library(ResultCode::Load, libc::EINVAL);
        assert!(err.to_string().starts_with("seccomp_load failed: "));
        assert_eq!(
            ResultCode::ArchAddMultiarch.prefix(),
            "seccomp_arch_add failed (multiarch)"
        );
    }
}
