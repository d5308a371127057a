//! The ptrace requests a session issues against its one tracee.

use libc::{c_long, c_void};
use nix::errno::Errno;
use nix::sys::ptrace::{self, AddressType, Options, Request, RequestType};
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use simple_error::try_with;
use std::mem::MaybeUninit;
use std::ptr;

use crate::cpu::Regs;
use crate::result::Result;

/// Options set right after the initial stop:
/// - `EXITKILL`: the tracee dies with the tracer.
/// - `TRACESYSGOOD`: syscall stops arrive as `SIGTRAP | 0x80`.
/// - `TRACEEXEC`: a successful `execve` reports an event stop instead of
///   queueing a real `SIGTRAP` for the tracee.
fn trace_options() -> Options {
    Options::PTRACE_O_EXITKILL | Options::PTRACE_O_TRACESYSGOOD | Options::PTRACE_O_TRACEEXEC
}

/// `PTRACE_GETREGS` and `PTRACE_SETREGS` pass the whole register set through
/// `data`, which nix only exposes for `GETREGS`.
fn regs_request(request: Request, pid: Pid, regs: *mut Regs) -> nix::Result<()> {
    let res = unsafe {
        libc::ptrace(
            request as RequestType,
            libc::pid_t::from(pid),
            ptr::null_mut::<c_void>(),
            regs as *mut c_void,
        )
    };
    Errno::result(res).map(drop)
}

pub struct Thread {
    pub tid: Pid,
}

impl Thread {
    pub fn set_trace_options(&self) -> Result<()> {
        try_with!(
            ptrace::setoptions(self.tid, trace_options()),
            "cannot set ptrace options on {}",
            self.tid
        );
        Ok(())
    }

    pub fn getregs(&self) -> Result<Regs> {
        let mut regs = MaybeUninit::<Regs>::uninit();
        try_with!(
            regs_request(Request::PTRACE_GETREGS, self.tid, regs.as_mut_ptr()),
            "cannot get registers of {}",
            self.tid
        );
        // Safe, because the kernel filled the whole struct on success.
        Ok(unsafe { regs.assume_init() })
    }

    pub fn setregs(&self, regs: &Regs) -> Result<()> {
        let mut copy = *regs;
        try_with!(
            regs_request(Request::PTRACE_SETREGS, self.tid, &mut copy),
            "cannot set registers of {}",
            self.tid
        );
        Ok(())
    }

    /// Resume until the next syscall stop, delivering `sig` first.
    pub fn resume_to_syscall(&self, sig: Option<Signal>) -> Result<()> {
        try_with!(
            ptrace::syscall(self.tid, sig),
            "cannot resume {} to the next syscall",
            self.tid
        );
        Ok(())
    }

    /// A signal stop only carries siginfo if a signal is about to be delivered.
    /// Group-stops have none.
    pub fn is_signal_delivery(&self) -> bool {
        ptrace::getsiginfo(self.tid).is_ok()
    }

    pub fn peek(&self, addr: u64) -> Result<c_long> {
        Ok(try_with!(
            ptrace::read(self.tid, addr as AddressType),
            "cannot read tracee memory at {:#x}",
            addr
        ))
    }

    pub fn poke(&self, addr: u64, word: c_long) -> Result<()> {
        // Safe, because PTRACE_POKEDATA passes `data` by value and never dereferences it.
        unsafe {
            try_with!(
                ptrace::write(self.tid, addr as AddressType, word as *mut c_void),
                "cannot write tracee memory at {:#x}",
                addr
            );
        }
        Ok(())
    }

    pub fn detach(&self) -> Result<()> {
        try_with!(
            ptrace::detach(self.tid, None),
            "cannot detach from {}",
            self.tid
        );
        Ok(())
    }
}
