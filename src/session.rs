use log::{debug, error, info, trace, warn};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use simple_error::SimpleError;
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::ptr;

use crate::cpu::{self, Regs};
use crate::policy::{InjectSequence, OriginalCall, Placement, Policy, PolicyDecision};
use crate::result::{Error, Result, Termination};
use crate::try_attach;
use crate::tracer::inject_syscall::{resolve, Injector};
use crate::tracer::syscall::{classify, SyscallEvent};
use crate::tracer::{Phase, StopReason, Tracee, TraceeState};

pub struct SessionOptions {
    /// Program and its arguments.
    pub command: Vec<String>,
    /// Detach once the policy reports that it is done.
    pub detach_when_done: bool,
}

/// Result of applying a decision to one syscall.
enum Applied {
    Completed { exit_regs: Regs, injected: Vec<u64> },
    Terminated(Termination),
}

/// Start `command` as a tracee. The child requests tracing itself and is
/// killed when the tracer dies, so it never runs unsupervised by accident.
pub fn spawn(command: &[String]) -> Result<Tracee> {
    let (program, args) = match command.split_first() {
        Some(v) => v,
        None => {
            return Err(Error::AttachFailure(SimpleError::new(
                "no program to trace given",
            )))
        }
    };
    let mut cmd = Command::new(program);
    cmd.args(args);
    // Safe, because prctl and ptrace are async-signal-safe and do not allocate.
    unsafe {
        cmd.pre_exec(|| {
            if libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) < 0 {
                return Err(io::Error::last_os_error());
            }
            let res = libc::ptrace(
                libc::PTRACE_TRACEME,
                0,
                ptr::null_mut::<libc::c_void>(),
                ptr::null_mut::<libc::c_void>(),
            );
            if res < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
    let child = try_attach!(cmd.spawn(), "cannot start {}", program);
    let pid = Pid::from_raw(child.id() as i32);

    let status = try_attach!(waitpid(pid, None), "waitpid for {} failed", pid);
    match status {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        other => {
            return Err(Error::AttachFailure(SimpleError::new(format!(
                "{} did not stop after exec: {:?}",
                program, other
            ))))
        }
    }
    debug!("started {} as pid {}", program, pid);

    match Tracee::from_stopped_child(pid, Signal::SIGTRAP) {
        Ok(t) => Ok(t),
        Err(Error::TraceFault(e)) => Err(Error::AttachFailure(e)),
        Err(e) => Err(e),
    }
}

/// Resolve the value reported for a suppressed call.
fn suppressed_result(original: &OriginalCall, injected: &[u64]) -> Result<Option<u64>> {
    match original {
        OriginalCall::Run => Ok(None),
        OriginalCall::Suppress(arg) => resolve(arg, injected).map(Some),
    }
}

fn inject_sequence(
    tracee: &mut Tracee,
    enter_regs: &Regs,
    event: &SyscallEvent,
    seq: &InjectSequence,
) -> Result<Applied> {
    match seq.placement {
        Placement::AfterOriginal => {
            let exit_regs = match finish(tracee)? {
                Some(regs) => regs,
                None => return terminated(tracee),
            };
            let mut injector = Injector::new(tracee, exit_regs)?;
            let injected = injector.run(&seq.steps)?;
            let reported = match suppressed_result(&seq.original, &injected)? {
                Some(v) => exit_regs.with_ret(v),
                None => exit_regs,
            };
            tracee.setregs(&reported)?;
            Ok(Applied::Completed {
                exit_regs: reported,
                injected,
            })
        }
        Placement::BeforeOriginal => {
            // take over the enter-stop: the kernel skips the original call
            tracee.setregs(&enter_regs.with_syscall_nr(cpu::SKIP_SYSCALL))?;
            tracee.step_expect_stop(Phase::Exit)?;
            let hijacked = tracee.getregs()?;

            let mut injector = Injector::new(tracee, hijacked)?;
            let injected = injector.run(&seq.steps)?;
            let reported = match suppressed_result(&seq.original, &injected)? {
                Some(v) => {
                    debug!("suppressed {}, reporting {:#x}", event.name(), v);
                    injector.regs().with_ret(v)
                }
                None => injector.replay(event)?,
            };
            // the tracee must find its argument registers as it left them
            let reported = reported
                .with_args(&enter_regs.syscall_args())
                .with_syscall_nr(enter_regs.syscall_nr());
            tracee.setregs(&reported)?;
            Ok(Applied::Completed {
                exit_regs: reported,
                injected,
            })
        }
    }
}

/// Let the call run to its exit-stop.
fn finish(tracee: &mut Tracee) -> Result<Option<Regs>> {
    match tracee.step(Phase::Exit)? {
        StopReason::SyscallStop => Ok(Some(tracee.getregs()?)),
        StopReason::Exited(_) | StopReason::Killed(_) => Ok(None),
    }
}

/// Carry out `decision` for the call stopped at its enter-stop in `enter_regs`
/// and leave the tracee at the call's exit-stop with the registers it has to
/// see when it resumes.
fn apply(
    tracee: &mut Tracee,
    enter_regs: &Regs,
    event: &SyscallEvent,
    decision: &PolicyDecision,
) -> Result<Applied> {
    let completed = |exit_regs| Applied::Completed {
        exit_regs,
        injected: vec![],
    };
    match decision {
        PolicyDecision::PassThrough => match finish(tracee)? {
            Some(regs) => Ok(completed(regs)),
            None => terminated(tracee),
        },
        PolicyDecision::ForceReturn(value) => match finish(tracee)? {
            Some(regs) => {
                let regs = regs.with_ret(*value as u64);
                tracee.setregs(&regs)?;
                Ok(completed(regs))
            }
            None => terminated(tracee),
        },
        PolicyDecision::Block(errno) => {
            tracee.setregs(&enter_regs.with_syscall_nr(cpu::SKIP_SYSCALL))?;
            tracee.step_expect_stop(Phase::Exit)?;
            let regs = tracee
                .getregs()?
                .with_syscall_nr(enter_regs.syscall_nr())
                .with_ret(-(*errno as i64) as u64);
            tracee.setregs(&regs)?;
            Ok(completed(regs))
        }
        PolicyDecision::ReplaceAndRun { number, args } => {
            let replaced = enter_regs.with_syscall_nr(*number as u64).with_args(args);
            tracee.setregs(&replaced)?;
            match finish(tracee)? {
                Some(regs) => {
                    let regs = regs.with_args(&enter_regs.syscall_args());
                    tracee.setregs(&regs)?;
                    Ok(completed(regs))
                }
                None => terminated(tracee),
            }
        }
        PolicyDecision::Duplicate => {
            let first = match finish(tracee)? {
                Some(regs) => regs,
                None => return terminated(tracee),
            };
            let mut injector = Injector::new(tracee, first)?;
            let second = injector.replay(event)?;
            debug!(
                "replayed {}: first = {}, second = {}",
                event.name(),
                first.syscall_ret() as i64,
                second.syscall_ret() as i64
            );
            Ok(Applied::Completed {
                exit_regs: second,
                injected: vec![first.syscall_ret(), second.syscall_ret()],
            })
        }
        PolicyDecision::InjectSequence(seq) => inject_sequence(tracee, enter_regs, event, seq),
    }
}

fn terminated(tracee: &Tracee) -> Result<Applied> {
    match tracee.state() {
        TraceeState::Exited(t) => Ok(Applied::Terminated(t)),
        state => Err(Error::TraceFault(SimpleError::new(format!(
            "tracee in unexpected state {:?}",
            state
        )))),
    }
}

/// Drive `tracee` until it exits, consulting `policy` on every syscall.
pub fn supervise(
    tracee: &mut Tracee,
    policy: &mut dyn Policy,
    detach_when_done: bool,
) -> Result<Termination> {
    loop {
        match tracee.step(Phase::Enter)? {
            StopReason::SyscallStop => {}
            StopReason::Exited(code) => return Ok(Termination::Exited(code)),
            StopReason::Killed(sig) => return Ok(Termination::Killed(sig)),
        }
        let enter_regs = tracee.getregs()?;
        let event = classify(&enter_regs, Phase::Enter);
        trace!("observed {}", event);

        let decision = policy.decide(&event, tracee)?;
        if decision != PolicyDecision::PassThrough {
            debug!("{}: {:?}", event, decision);
        }

        let (exit_regs, injected) = match apply(tracee, &enter_regs, &event, &decision)? {
            Applied::Completed {
                exit_regs,
                injected,
            } => (exit_regs, injected),
            Applied::Terminated(t) => return Ok(t),
        };
        policy.completed(&classify(&exit_regs, Phase::Exit), &injected);

        if detach_when_done && policy.is_done() {
            info!("detaching from {}", tracee.pid());
            tracee.detach(&exit_regs)?;
            return tracee.wait_exit();
        }
    }
}

/// Run `opts.command` under `policy` and return how it ended.
///
/// On a fatal error the tracee is killed, since its registers can no longer
/// be trusted.
pub fn run(opts: &SessionOptions, policy: &mut dyn Policy) -> Result<Termination> {
    let mut tracee = spawn(&opts.command)?;
    match supervise(&mut tracee, policy, opts.detach_when_done) {
        Ok(t) => Ok(t),
        Err(e) if !e.is_fatal() => {
            warn!("{}, injection sequence aborted", e);
            Err(e)
        }
        Err(e) => {
            error!("{}", e);
            if let Err(kill_err) = tracee.kill() {
                warn!("cannot kill tracee {}: {}", tracee.pid(), kill_err);
            }
            Err(e)
        }
    }
}
