//! x86_64 system call ABI.
//!
//! Porting to another instruction set means redefining `Regs`, the argument
//! register order and `SYSCALL_SIZE`; nothing else in the crate looks at
//! individual machine registers.

use libc::c_ulong;

/// Length of the `syscall` instruction (0f 05).
pub const SYSCALL_SIZE: u64 = 2;

/// Value of the syscall number register that makes the kernel skip the call
/// at a syscall-enter-stop. The tracee then sees `-ENOSYS` unless the tracer
/// overwrites the return register at the following exit-stop.
pub const SKIP_SYSCALL: u64 = u64::MAX;

/// Mirror of the kernel's `struct user_regs_struct` as returned by
/// `ptrace(PTRACE_GETREGS, ...)`.
///
/// This is a plain value: changing a copy has no effect on the tracee until it
/// is written back with `Tracee::setregs`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Regs {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub orig_rax: u64,
    pub rip: u64,
    pub cs: u64,
    pub eflags: u64,
    pub rsp: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
    pub ds: u64,
    pub es: u64,
    pub fs: u64,
    pub gs: u64,
}

impl Regs {
    pub fn ip(&self) -> u64 {
        self.rip
    }

    /// Syscall number as seen at a syscall stop. At an exit-stop `rax` already
    /// holds the result, so the kernel's saved copy is used.
    pub fn syscall_nr(&self) -> u64 {
        self.orig_rax
    }

    pub fn syscall_ret(&self) -> u64 {
        self.rax
    }

    /// Arguments in calling convention order: rdi, rsi, rdx, r10, r8, r9.
    pub fn syscall_args(&self) -> [u64; 6] {
        [self.rdi, self.rsi, self.rdx, self.r10, self.r8, self.r9]
    }

    #[must_use]
    pub fn with_args(&self, args: &[u64; 6]) -> Regs {
        let mut copy = *self;
        copy.rdi = args[0];
        copy.rsi = args[1];
        copy.rdx = args[2];
        copy.r10 = args[3];
        copy.r8 = args[4];
        copy.r9 = args[5];
        copy
    }

    #[must_use]
    pub fn with_ret(&self, ret: u64) -> Regs {
        let mut copy = *self;
        copy.rax = ret;
        copy
    }

    /// Replace the syscall about to be executed at an enter-stop.
    #[must_use]
    pub fn with_syscall_nr(&self, nr: u64) -> Regs {
        let mut copy = *self;
        copy.orig_rax = nr;
        copy
    }

    /// Move the instruction pointer back onto the `syscall` instruction that
    /// just completed, so that resuming re-enters the kernel at the same trap point.
    #[must_use]
    pub fn rewind(&self) -> Regs {
        let mut copy = *self;
        copy.rip = self.rip.wrapping_sub(SYSCALL_SIZE);
        copy
    }

    /// Build the registers for a syscall re-executed from an exit-stop:
    /// `[nr, a1, ..., a6]`.
    #[must_use]
    pub fn prepare_syscall(&self, args: &[c_ulong; 7]) -> Regs {
        let mut copy = self.rewind();
        copy.rax = args[0];
        copy.orig_rax = args[0];
        copy.rdi = args[1];
        copy.rsi = args[2];
        copy.rdx = args[3];
        copy.r10 = args[4];
        copy.r8 = args[5];
        copy.r9 = args[6];
        copy
    }
}

/// Interpret a raw return register value as the kernel's signed result.
/// Values in `-4095..=-1` are negated errno values.
pub fn ret_is_error(ret: u64) -> bool {
    (ret as i64) < 0 && (ret as i64) >= -4095
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_size() {
        assert_eq!(
            std::mem::size_of::<Regs>(),
            std::mem::size_of::<libc::user_regs_struct>()
        );
    }

    #[test]
    fn test_prepare_syscall_rewinds() {
        let regs = Regs {
            rip: 0x1000,
            rax: 10,
            orig_rax: 1,
            rbx: 42,
            ..Default::default()
        };
        let prepared = regs.prepare_syscall(&[12, 0, 0, 0, 0, 0, 7]);
        assert_eq!(prepared.ip(), 0x1000 - SYSCALL_SIZE);
        assert_eq!(prepared.rax, 12);
        assert_eq!(prepared.syscall_nr(), 12);
        assert_eq!(prepared.r9, 7);
        // untouched registers survive
        assert_eq!(prepared.rbx, 42);
        // and the source snapshot is unchanged
        assert_eq!(regs.ip(), 0x1000);
        assert_eq!(regs.rax, 10);
    }

    #[test]
    fn test_args_order() {
        let regs = Regs::default().with_args(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(regs.rdi, 1);
        assert_eq!(regs.r10, 4);
        assert_eq!(regs.syscall_args(), [1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_ret_is_error() {
        assert!(ret_is_error(-(libc::EPERM as i64) as u64));
        assert!(!ret_is_error(0));
        assert!(!ret_is_error(0x5555_5555_0000));
        // mmap style addresses in the upper half are not errors
        assert!(!ret_is_error(-8192i64 as u64));
    }
}
