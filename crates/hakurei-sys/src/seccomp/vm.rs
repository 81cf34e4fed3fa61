//! Minimal cBPF interpreter used to check compiled programs.

use super::{
    BPF_ABS, BPF_ALU, BPF_AND, BPF_JA, BPF_JEQ, BPF_JGE, BPF_JGT, BPF_JMP, BPF_JSET, BPF_LD,
    BPF_RET, BPF_W, SockFilter,
};

/// `struct seccomp_data` laid out as the kernel presents it.
pub struct Data([u8; 64]);

impl Data {
    pub fn new(nr: i32, arch: u32, args: [u64; 6]) -> Self {
        let mut buf = [0u8; 64];
        buf[0..4].copy_from_slice(&nr.to_ne_bytes());
        buf[4..8].copy_from_slice(&arch.to_ne_bytes());
        for (i, arg) in args.iter().enumerate() {
            let off = 16 + 8 * i;
            buf[off..off + 8].copy_from_slice(&arg.to_ne_bytes());
        }
        Self(buf)
    }

    fn word(&self, offset: u32) -> u32 {
        let off = offset as usize;
        let bytes: [u8; 4] = self.0[off..off + 4].try_into().unwrap();
        u32::from_ne_bytes(bytes)
    }
}

/// Run `program` against `data` and return the verdict.
pub fn run(program: &[SockFilter], data: &Data) -> u32 {
    let mut acc = 0u32;
    let mut pc = 0usize;
    loop {
        let insn = program[pc];
        pc += 1;
        match insn.code & 0x07 {
            c if c == BPF_LD => {
                assert_eq!(insn.code, BPF_LD | BPF_W | BPF_ABS, "unsupported load");
                acc = data.word(insn.k);
            }
            c if c == BPF_ALU => {
                assert_eq!(insn.code & 0xf0, BPF_AND, "unsupported alu op");
                acc &= insn.k;
            }
            c if c == BPF_RET => return insn.k,
            c if c == BPF_JMP => {
                let op = insn.code & 0xf0;
                if op == BPF_JA {
                    pc += insn.k as usize;
                    continue;
                }
                let taken = match op {
                    o if o == BPF_JEQ => acc == insn.k,
                    o if o == BPF_JGT => acc > insn.k,
                    o if o == BPF_JGE => acc >= insn.k,
                    o if o == BPF_JSET => acc & insn.k != 0,
                    _ => panic!("unsupported jump {op:#x}"),
                };
                pc += usize::from(if taken { insn.jt } else { insn.jf });
            }
            c => panic!("unsupported class {c:#x}"),
        }
    }
}
