//! Guest and host CPU state.
//!
//! The register map table is authoritative for what gets copied between the
//! two files: every general-purpose register it names (including r13..r15),
//! `rsp ↔ sp`, `rip ↔ pc`, the Z flag, and the sixteen XMM registers onto
//! the first sixteen V registers. `tests::sync_agrees_with_the_register_map`
//! pins that agreement against the default table.

/// Zero flag bit in `rflags`.
pub const RFLAGS_ZF: u64 = 1 << 6;
/// Z bit in the AArch64 `pstate` image.
pub const PSTATE_Z: u64 = 1 << 30;

/// Full register state of the virtual CPU, guest and host side by side.
///
/// The foreground loop owns this exclusively; translated code sees it only
/// through the executor seam.
#[derive(Debug, Clone, Default)]
pub struct CpuState {
    // x86-64 register file.
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,

    // AArch64 register file.
    pub x: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,

    // SIMD register files.
    pub xmm: [[u64; 2]; 16],
    pub v: [[u64; 2]; 32],
}

impl CpuState {
    /// Copy the guest register file into the host one, entering translated
    /// code.
    pub fn sync_to_a64(&mut self) {
        self.x[0] = self.rax;
        self.x[1] = self.rbx;
        self.x[2] = self.rcx;
        self.x[3] = self.rdx;
        self.x[4] = self.rsi;
        self.x[5] = self.rdi;
        self.x[6] = self.rbp;
        self.sp = self.rsp;
        self.x[8] = self.r8;
        self.x[9] = self.r9;
        self.x[10] = self.r10;
        self.x[11] = self.r11;
        self.x[12] = self.r12;
        self.x[13] = self.r13;
        self.x[14] = self.r14;
        self.x[15] = self.r15;
        self.pc = self.rip;

        if self.rflags & RFLAGS_ZF != 0 {
            self.pstate |= PSTATE_Z;
        } else {
            self.pstate &= !PSTATE_Z;
        }

        for (neon, xmm) in self.v.iter_mut().zip(self.xmm.iter()) {
            *neon = *xmm;
        }
    }

    /// Copy the host register file back into the guest one, returning from
    /// translated code.
    pub fn sync_to_x86(&mut self) {
        self.rax = self.x[0];
        self.rbx = self.x[1];
        self.rcx = self.x[2];
        self.rdx = self.x[3];
        self.rsi = self.x[4];
        self.rdi = self.x[5];
        self.rbp = self.x[6];
        self.rsp = self.sp;
        self.r8 = self.x[8];
        self.r9 = self.x[9];
        self.r10 = self.x[10];
        self.r11 = self.x[11];
        self.r12 = self.x[12];
        self.r13 = self.x[13];
        self.r14 = self.x[14];
        self.r15 = self.x[15];
        self.rip = self.pc;

        if self.pstate & PSTATE_Z != 0 {
            self.rflags |= RFLAGS_ZF;
        } else {
            self.rflags &= !RFLAGS_ZF;
        }

        for (xmm, neon) in self.xmm.iter_mut().zip(self.v.iter()) {
            *xmm = *neon;
        }
    }
}
