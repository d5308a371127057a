use libc::c_long;
use log::{debug, trace, warn};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use simple_error::{try_with, SimpleError};
use std::mem;

use crate::cpu::Regs;
use crate::result::{Error, Result, Termination};

pub mod inject_syscall;
pub mod memory;
pub mod proc;
pub mod ptrace;
pub mod sockaddr;
pub mod syscall;

pub use syscall::Phase;

/// Size of one unit of the memory channel.
pub const WORD_SIZE: usize = mem::size_of::<c_long>();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TraceeState {
    Running,
    /// Stopped for a signal, e.g. the trap after `execve`.
    StoppedAtSignal(Signal),
    StoppedAtEnter,
    StoppedAtExit,
    Exited(Termination),
    /// No longer traced by us.
    Detached,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    SyscallStop,
    Exited(i32),
    Killed(Signal),
}

/// The one process traced by a session.
///
/// Register and memory access is only allowed while the tracee is stopped.
/// Once it has exited every operation fails with `TargetTerminated` without
/// issuing a ptrace request, because the kernel may answer those with stale data.
pub struct Tracee {
    thread: ptrace::Thread,
    state: TraceeState,
    /// Signal that stopped the tracee and has to be delivered on the next resume.
    pending_signal: Option<Signal>,
}

impl Tracee {
    /// Wrap a child that requested tracing and is stopped in its first stop.
    pub fn from_stopped_child(pid: Pid, sig: Signal) -> Result<Tracee> {
        let tracee = Tracee {
            thread: ptrace::Thread { tid: pid },
            state: TraceeState::StoppedAtSignal(sig),
            pending_signal: None,
        };
        tracee.thread.set_trace_options()?;
        Ok(tracee)
    }

    pub fn pid(&self) -> Pid {
        self.thread.tid
    }

    pub fn state(&self) -> TraceeState {
        self.state
    }

    fn check_stopped(&self) -> Result<()> {
        match self.state {
            TraceeState::StoppedAtSignal(_)
            | TraceeState::StoppedAtEnter
            | TraceeState::StoppedAtExit => Ok(()),
            TraceeState::Exited(t) => Err(Error::TargetTerminated(t)),
            TraceeState::Running => Err(Error::TraceFault(SimpleError::new(
                "tracee is running, cannot access its state",
            ))),
            TraceeState::Detached => Err(Error::TraceFault(SimpleError::new(
                "tracee is no longer traced",
            ))),
        }
    }

    /// Snapshot of all general purpose registers.
    pub fn getregs(&self) -> Result<Regs> {
        self.check_stopped()?;
        self.thread.getregs()
    }

    /// Write back a whole snapshot. `PTRACE_SETREGS` replaces the register set
    /// in one request, so the tracee never resumes with a partial update.
    pub fn setregs(&self, regs: &Regs) -> Result<()> {
        self.check_stopped()?;
        self.thread.setregs(regs)
    }

    pub fn peek_word(&self, addr: u64) -> Result<i64> {
        self.check_stopped()?;
        let word = self.thread.peek(addr)?;
        Ok(word as i64)
    }

    pub fn poke_word(&self, addr: u64, value: i64) -> Result<()> {
        self.check_stopped()?;
        self.thread.poke(addr, value as c_long)
    }

    /// Resume until the next syscall stop and record it as `phase`.
    ///
    /// Callers track the enter/exit alternation themselves: the injector adds
    /// extra enter/exit pairs the kernel does not distinguish from the original ones.
    pub fn step(&mut self, phase: Phase) -> Result<StopReason> {
        self.check_stopped()?;
        loop {
            let sig = self.pending_signal.take();
            self.thread.resume_to_syscall(sig)?;
            self.state = TraceeState::Running;

            let status = try_with!(waitpid(self.pid(), None), "waitpid failed");
            match status {
                WaitStatus::PtraceSyscall(_) => {
                    self.state = match phase {
                        Phase::Enter => TraceeState::StoppedAtEnter,
                        Phase::Exit => TraceeState::StoppedAtExit,
                    };
                    return Ok(StopReason::SyscallStop);
                }
                WaitStatus::Exited(_, code) => {
                    debug!("tracee {} exited with {}", self.pid(), code);
                    self.state = TraceeState::Exited(Termination::Exited(code));
                    return Ok(StopReason::Exited(code));
                }
                WaitStatus::Signaled(_, sig, _) => {
                    debug!("tracee {} killed by {}", self.pid(), sig);
                    self.state = TraceeState::Exited(Termination::Killed(sig));
                    return Ok(StopReason::Killed(sig));
                }
                WaitStatus::Stopped(_, sig) => {
                    self.state = TraceeState::StoppedAtSignal(sig);
                    // A traceme tracee cannot remain in a group-stop: it is
                    // resumed without a signal, like strace does.
                    if self.thread.is_signal_delivery() {
                        trace!("forwarding {} to tracee {}", sig, self.pid());
                        self.pending_signal = Some(sig);
                    } else {
                        trace!("tracee {} entered group-stop with {}", self.pid(), sig);
                    }
                }
                WaitStatus::PtraceEvent(_, _, event) => {
                    trace!("ptrace event {} from tracee {}", event, self.pid());
                    self.state = TraceeState::StoppedAtSignal(Signal::SIGTRAP);
                }
                _ => {
                    self.state = TraceeState::StoppedAtSignal(Signal::SIGTRAP);
                }
            }
        }
    }

    /// Like `step`, but a terminated tracee is an error. Used inside injection
    /// sequences, which cannot be completed against a dead process.
    pub fn step_expect_stop(&mut self, phase: Phase) -> Result<()> {
        match self.step(phase)? {
            StopReason::SyscallStop => Ok(()),
            StopReason::Exited(code) => Err(Error::TargetTerminated(Termination::Exited(code))),
            StopReason::Killed(sig) => Err(Error::TargetTerminated(Termination::Killed(sig))),
        }
    }

    /// Install `regs` and let the tracee run unsupervised.
    pub fn detach(&mut self, regs: &Regs) -> Result<()> {
        self.setregs(regs)?;
        self.thread.detach()?;
        self.state = TraceeState::Detached;
        Ok(())
    }

    /// Wait until a detached (or already exited) tracee terminates.
    pub fn wait_exit(&mut self) -> Result<Termination> {
        if let TraceeState::Exited(t) = self.state {
            return Ok(t);
        }
        loop {
            let status = try_with!(waitpid(self.pid(), None), "waitpid failed");
            let termination = match status {
                WaitStatus::Exited(_, code) => Termination::Exited(code),
                WaitStatus::Signaled(_, sig, _) => Termination::Killed(sig),
                _ => continue,
            };
            self.state = TraceeState::Exited(termination);
            return Ok(termination);
        }
    }

    /// Terminate a tracee whose register state can no longer be trusted.
    pub fn kill(&mut self) -> Result<Termination> {
        if let TraceeState::Exited(t) = self.state {
            return Ok(t);
        }
        try_with!(
            signal::kill(self.pid(), Signal::SIGKILL),
            "cannot kill tracee {}",
            self.pid()
        );
        self.wait_exit()
    }
}

impl Drop for Tracee {
    fn drop(&mut self) {
        match self.state {
            TraceeState::Exited(_) | TraceeState::Detached => {}
            _ => {
                if let Err(e) = self.kill() {
                    warn!("cannot kill tracee {}: {}", self.pid(), e);
                }
            }
        }
    }
}
