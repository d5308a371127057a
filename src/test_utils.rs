use libc::c_long;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

use crate::cpu::Regs;
use crate::session;
use crate::tracer::{Phase, StopReason, Tracee};

pub fn compile_executable(source: &str, target: &Path) {
    let cc = std::env::var("CC").unwrap_or_else(|_| String::from("cc"));
    let args = &["-xc", "-", "-g", "-Wall", "-o", target.to_str().unwrap()];
    println!("$ {} {}", cc, args.join(" "));
    let mut child = Command::new(cc)
        .args(args)
        .stdin(Stdio::piped())
        .spawn()
        .expect("cannot compile program");
    {
        let stdin = child.stdin.as_mut().expect("cannot get child stdin");
        stdin
            .write_all(source.as_bytes())
            .expect("cannot write stdin");
    }
    assert!(child.wait().expect("process failed").success());
}

/// Continue a tracee that is about to enter a syscall until the next
/// occurrence of `nr` reaches `phase`.
pub fn step_to(tracee: &mut Tracee, nr: c_long, phase: Phase) -> Regs {
    loop {
        let reason = tracee.step(Phase::Enter).expect("cannot step tracee");
        assert_eq!(reason, StopReason::SyscallStop, "tracee exited early");
        let regs = tracee.getregs().expect("cannot get registers");
        let hit = regs.syscall_nr() == nr as u64;
        if hit && phase == Phase::Enter {
            return regs;
        }
        tracee
            .step_expect_stop(Phase::Exit)
            .expect("cannot step tracee");
        if hit {
            return tracee.getregs().expect("cannot get registers");
        }
    }
}

/// Start `binary` under ptrace and stop at the first `nr` in `phase`.
pub fn spawn_stopped_at(binary: &Path, nr: c_long, phase: Phase) -> (Tracee, Regs) {
    let command = vec![binary.to_str().unwrap().to_string()];
    let mut tracee = session::spawn(&command).expect("cannot spawn tracee");
    let regs = step_to(&mut tracee, nr, phase);
    (tracee, regs)
}
