//! Rule list to cBPF translation.
//!
//! ## Program layout
//!
//! ```text
//! ld  arch
//! jeq <audit arch A>, +1, +0   ; per included arch
//! ja  <len(section A)>
//!     section A
//! ...
//! ret KILL_PROCESS             ; unknown arch
//!
//! section:
//! ld  nr
//! [x86_64: jge X32_BIT -> ret KILL_PROCESS]
//! jeq <nr>, +0, <len(body)>    ; one group per syscall, first-appearance order
//!     body: rule blocks, then ret ALLOW
//! ret ALLOW
//! ```
//!
//! Every rule block ends in `ret ERRNO(e)`; a failed argument comparison
//! falls through to the next block. Arguments are compared as 64-bit values
//! split into two 32-bit words.

use super::arch::{Arch, Syscall, X32_SYSCALL_BIT};
use super::preset::{Compare, Rule};
use super::{
    BPF_ABS, BPF_ALU, BPF_AND, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_K, BPF_LD,
    BPF_MAXINSNS, BPF_RET, BPF_W, OFFSET_ARCH, OFFSET_SYSCALL_NR, ResultCode,
    SECCOMP_RET_ALLOW, SECCOMP_RET_ERRNO, SECCOMP_RET_KILL_PROCESS, SeccompError, SockFilter,
};

const MAX_ARGS: u8 = 6;

#[cfg(target_endian = "little")]
const fn arg_lo(index: u8) -> u32 {
    16 + 8 * index as u32
}
#[cfg(target_endian = "little")]
const fn arg_hi(index: u8) -> u32 {
    16 + 8 * index as u32 + 4
}
#[cfg(target_endian = "big")]
const fn arg_lo(index: u8) -> u32 {
    16 + 8 * index as u32 + 4
}
#[cfg(target_endian = "big")]
const fn arg_hi(index: u8) -> u32 {
    16 + 8 * index as u32
}

const fn hi(v: u64) -> u32 {
    (v >> 32) as u32
}
const fn lo(v: u64) -> u32 {
    v as u32
}

fn ld(offset: u32) -> SockFilter {
    SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, offset)
}
fn ret(k: u32) -> SockFilter {
    SockFilter::stmt(BPF_RET | BPF_K, k)
}
fn jmp(op: u16, k: u32, jt: u8, jf: u8) -> SockFilter {
    SockFilter::jump(BPF_JMP | op | BPF_K, k, jt, jf)
}

/// Emit one rule block. Falling out of the block means "no match".
fn rule_block(rule: &Rule, out: &mut Vec<SockFilter>) -> Result<(), SeccompError> {
    let action = ret(SECCOMP_RET_ERRNO | (rule.errno as u32 & 0xffff));
    let Some(arg) = rule.arg else {
        out.push(action);
        return Ok(());
    };
    if arg.index >= MAX_ARGS {
        return Err(SeccompError::library(ResultCode::RuleAdd, libc::EINVAL));
    }
    let (l, h) = (arg_lo(arg.index), arg_hi(arg.index));

    match arg.op {
        Compare::Eq(v) => out.extend([
            ld(h),
            jmp(BPF_JEQ, hi(v), 0, 3),
            ld(l),
            jmp(BPF_JEQ, lo(v), 0, 1),
            action,
        ]),
        Compare::Ne(v) => out.extend([
            ld(h),
            jmp(BPF_JEQ, hi(v), 0, 2),
            ld(l),
            jmp(BPF_JEQ, lo(v), 1, 0),
            action,
        ]),
        Compare::Ge(v) => out.extend([
            ld(h),
            jmp(BPF_JGT, hi(v), 3, 0),
            jmp(BPF_JEQ, hi(v), 0, 3),
            ld(l),
            jmp(BPF_JGE, lo(v), 0, 1),
            action,
        ]),
        Compare::MaskedEq { mask, value } => {
            // high word is irrelevant when both mask and value are zero there
            if hi(mask) != 0 || hi(value) != 0 {
                out.extend([
                    ld(h),
                    SockFilter::stmt(BPF_ALU | BPF_AND | BPF_K, hi(mask)),
                    jmp(BPF_JEQ, hi(value), 0, 4),
                ]);
            }
            out.extend([
                ld(l),
                SockFilter::stmt(BPF_ALU | BPF_AND | BPF_K, lo(mask)),
                jmp(BPF_JEQ, lo(value), 0, 1),
                action,
            ]);
        }
    }
    Ok(())
}

/// Group rules by syscall, keeping first-appearance order.
fn group(rules: &[Rule]) -> Vec<(Syscall, Vec<&Rule>)> {
    let mut groups: Vec<(Syscall, Vec<&Rule>)> = Vec::new();
    for rule in rules {
        match groups.iter_mut().find(|(s, _)| *s == rule.syscall) {
            Some((_, list)) => list.push(rule),
            None => groups.push((rule.syscall, vec![rule])),
        }
    }
    groups
}

/// Append `body` guarded by a comparison of the accumulator against `k`.
fn guarded(k: u32, body: Vec<SockFilter>, out: &mut Vec<SockFilter>) -> Result<(), SeccompError> {
    match u8::try_from(body.len()) {
        Ok(skip) => out.push(jmp(BPF_JEQ, k, 0, skip)),
        Err(_) => {
            let skip = u32::try_from(body.len())
                .map_err(|_| SeccompError::library(ResultCode::Internal, libc::EOVERFLOW))?;
            out.push(jmp(BPF_JEQ, k, 1, 0));
            out.push(SockFilter::stmt(BPF_JMP | BPF_JA, skip));
        }
    }
    out.extend(body);
    Ok(())
}

fn section(arch: Arch, rules: &[Rule]) -> Result<Vec<SockFilter>, SeccompError> {
    let mut out = vec![ld(OFFSET_SYSCALL_NR)];
    if arch == Arch::X86_64 {
        out.push(jmp(BPF_JGE, X32_SYSCALL_BIT, 0, 1));
        out.push(ret(SECCOMP_RET_KILL_PROCESS));
    }

    for (syscall, list) in group(rules) {
        let Some(nr) = arch.resolve(syscall) else {
            continue;
        };
        let mut body = Vec::new();
        for rule in list {
            rule_block(rule, &mut body)?;
        }
        body.push(ret(SECCOMP_RET_ALLOW));
        guarded(nr, body, &mut out)?;
    }

    out.push(ret(SECCOMP_RET_ALLOW));
    Ok(out)
}

/// Compile `rules` into a program covering `arches`.
///
/// Syscalls from any other architecture kill the process.
pub fn compile(arches: &[Arch], rules: &[Rule]) -> Result<Vec<SockFilter>, SeccompError> {
    if rules.is_empty() {
        return Err(SeccompError::InvalidRules);
    }
    if arches.is_empty() {
        return Err(SeccompError::library(ResultCode::ArchAdd, libc::EINVAL));
    }

    let mut program = vec![ld(OFFSET_ARCH)];
    for &arch in arches {
        let body = section(arch, rules)?;
        let skip = u32::try_from(body.len())
            .map_err(|_| SeccompError::library(ResultCode::Internal, libc::EOVERFLOW))?;
        program.push(jmp(BPF_JEQ, arch.audit(), 1, 0));
        program.push(SockFilter::stmt(BPF_JMP | BPF_JA, skip));
        program.extend(body);
    }
    program.push(ret(SECCOMP_RET_KILL_PROCESS));

    if program.len() > BPF_MAXINSNS {
        return Err(SeccompError::library(ResultCode::Internal, libc::E2BIG));
    }
    Ok(program)
}
