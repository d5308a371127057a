use std::fmt;

use crate::cpu::Regs;
use crate::syscalls;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Enter,
    Exit,
}

/// One syscall as observed at a single stop.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct SyscallEvent {
    pub number: u64,
    pub args: [u64; 6],
    pub phase: Phase,
    /// Signed kernel result, only present at the exit-stop.
    pub result: Option<i64>,
}

impl SyscallEvent {
    pub fn is(&self, nr: libc::c_long) -> bool {
        self.number == nr as u64
    }

    pub fn name(&self) -> &'static str {
        syscalls::name(self.number).unwrap_or("?")
    }
}

impl fmt::Display for SyscallEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = self.name();
        if name == "?" {
            write!(f, "syscall_{}(", self.number)?;
        } else {
            write!(f, "{}(", name)?;
        }
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{:#x}", arg)?;
        }
        write!(f, ")")?;
        if let Some(ret) = self.result {
            write!(f, " = {}", ret)?;
        }
        Ok(())
    }
}

/// Decode the syscall described by a snapshot taken at a syscall stop.
pub fn classify(regs: &Regs, phase: Phase) -> SyscallEvent {
    SyscallEvent {
        number: regs.syscall_nr(),
        args: regs.syscall_args(),
        phase,
        result: match phase {
            Phase::Enter => None,
            Phase::Exit => Some(regs.syscall_ret() as i64),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_enter() {
        let regs = Regs {
            orig_rax: libc::SYS_write as u64,
            rax: -(libc::ENOSYS as i64) as u64,
            rdi: 1,
            rsi: 0x7fff_0000,
            rdx: 10,
            ..Default::default()
        };
        let event = classify(&regs, Phase::Enter);
        assert!(event.is(libc::SYS_write));
        assert_eq!(event.args[..3], [1, 0x7fff_0000, 10]);
        assert_eq!(event.result, None);
    }

    #[test]
    fn test_classify_exit() {
        let regs = Regs {
            orig_rax: libc::SYS_read as u64,
            rax: -(libc::EPERM as i64) as u64,
            ..Default::default()
        };
        let event = classify(&regs, Phase::Exit);
        assert_eq!(event.result, Some(-(libc::EPERM as i64)));
        assert_eq!(
            event.to_string(),
            "read(0x0, 0x0, 0x0, 0x0, 0x0, 0x0) = -1"
        );
    }
}
