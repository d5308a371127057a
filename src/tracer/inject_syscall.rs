use libc::{c_long, c_ulong};
use log::{debug, error, warn};
use simple_error::SimpleError;

use super::memory::{align_word, read_bytes, write_bytes};
use super::proc;
use super::syscall::{Phase, SyscallEvent};
use super::{Tracee, TraceeState, WORD_SIZE};
use crate::cpu::{self, Regs};
use crate::result::{Error, Result};
use crate::syscalls;

/// A range of tracee heap obtained by moving the program break.
///
/// Valid until the break moves again or the tracee exits. It is never freed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InjectedRegion {
    pub base_address: u64,
    pub length: u64,
}

impl InjectedRegion {
    pub fn end(&self) -> u64 {
        self.base_address + self.length
    }
}

/// Argument of a synthetic call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Arg {
    Raw(u64),
    /// Result of an earlier step in the same sequence. For `Grow` and `Stage`
    /// steps this is the base address of the region.
    Result(usize),
}

/// What an injected call has to return for the sequence to continue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expect {
    Nothing,
    /// Anything but an errno value.
    Success,
    Equals(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Step {
    Call {
        number: c_long,
        args: Vec<Arg>,
        expect: Expect,
    },
    /// Move the program break by `length` bytes.
    Grow { length: u64 },
    /// Allocate word aligned space for `record`, copy it in and verify the copy.
    Stage { record: Vec<u8> },
}

pub fn resolve(arg: &Arg, results: &[u64]) -> Result<u64> {
    match arg {
        Arg::Raw(v) => Ok(*v),
        Arg::Result(idx) => results.get(*idx).copied().ok_or_else(|| {
            Error::invalid(format!(
                "step {} refers to a result that is not available yet",
                idx
            ))
        }),
    }
}

/// Rejects an injected call that entered the kernel with another number than
/// the one that was set up.
pub fn check_entered(expected: u64, regs: &Regs) -> Result<()> {
    let actual = regs.syscall_nr();
    if actual != expected {
        return Err(Error::ProtocolViolation { expected, actual });
    }
    Ok(())
}

fn check_expect(expect: &Expect, number: c_long, ret: u64) -> Result<()> {
    let ok = match expect {
        Expect::Nothing => true,
        Expect::Success => !cpu::ret_is_error(ret),
        Expect::Equals(v) => ret == *v,
    };
    if !ok {
        error!(
            "injected {} returned {} ({:?} expected)",
            syscalls::name(number as u64).unwrap_or("syscall"),
            ret as i64,
            expect
        );
        return Err(Error::injection(format!(
            "injected syscall {} returned {}",
            number, ret as i64
        )));
    }
    Ok(())
}

macro_rules! syscall_args {
    ($regs:expr, $nr:expr, $a1:expr) => {
        ($regs).prepare_syscall(&[$nr, $a1 as c_ulong, 0, 0, 0, 0, 0])
    };

    ($regs:expr, $nr:expr, $a1:expr, $a2:expr, $a3:expr, $a4:expr, $a5:expr, $a6:expr) => {
        $regs.prepare_syscall(&[
            $nr,
            $a1 as c_ulong,
            $a2 as c_ulong,
            $a3 as c_ulong,
            $a4 as c_ulong,
            $a5 as c_ulong,
            $a6 as c_ulong,
        ])
    };
}

/// Runs syscalls the tracee never issued.
///
/// Every call starts from the exit-stop of a syscall: the instruction pointer
/// is moved back onto the `syscall` instruction, number and arguments are
/// replaced and the tracee is driven through one enter-stop and one exit-stop.
/// The snapshot captured at that exit-stop is the base for the next call.
/// Restoring the legitimate registers afterwards is up to the caller.
pub struct Injector<'a> {
    tracee: &'a mut Tracee,
    regs: Regs,
}

impl<'a> Injector<'a> {
    pub fn new(tracee: &'a mut Tracee, exit_regs: Regs) -> Result<Injector<'a>> {
        if tracee.state() != TraceeState::StoppedAtExit {
            return Err(Error::TraceFault(SimpleError::new(format!(
                "can only inject syscalls at a syscall-exit-stop, tracee is {:?}",
                tracee.state()
            ))));
        }
        Ok(Injector {
            tracee,
            regs: exit_regs,
        })
    }

    /// Snapshot of the last exit-stop driven by the injector.
    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    fn syscall(&mut self, regs: &Regs) -> Result<u64> {
        let nr = regs.syscall_nr();
        self.tracee.setregs(regs)?;

        self.tracee.step_expect_stop(Phase::Enter)?;
        let enter_regs = self.tracee.getregs()?;
        if let Err(e) = check_entered(nr, &enter_regs) {
            // do not let the unexpected call reach the kernel
            let cancelled = enter_regs.with_syscall_nr(cpu::SKIP_SYSCALL);
            if let Err(e) = self.tracee.setregs(&cancelled) {
                warn!("cannot cancel diverged syscall: {}", e);
            }
            return Err(e);
        }

        self.tracee.step_expect_stop(Phase::Exit)?;
        let result_regs = self.tracee.getregs()?;
        if result_regs.ip() != regs.ip() + cpu::SYSCALL_SIZE {
            return Err(Error::injection(format!(
                "tracee continued at {:#x} instead of {:#x} after injected syscall",
                result_regs.ip(),
                regs.ip() + cpu::SYSCALL_SIZE
            )));
        }
        let ret = result_regs.syscall_ret();
        debug!(
            "injected {}({:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}) = {:#x}",
            syscalls::name(nr).unwrap_or("?"),
            regs.rdi,
            regs.rsi,
            regs.rdx,
            regs.r10,
            regs.r8,
            regs.r9,
            ret
        );
        self.regs = result_regs;
        Ok(ret)
    }

    /// Run an arbitrary syscall and return the raw return register.
    pub fn call(&mut self, number: c_long, args: &[u64; 6]) -> Result<u64> {
        let regs = syscall_args!(
            self.regs, number as c_ulong, args[0], args[1], args[2], args[3], args[4], args[5]
        );
        self.syscall(&regs)
    }

    pub fn brk(&mut self, addr: u64) -> Result<u64> {
        let regs = syscall_args!(self.regs, libc::SYS_brk as c_ulong, addr);
        self.syscall(&regs)
    }

    /// Current program break without moving it. `brk(0)` lies below the data
    /// segment, so the kernel refuses to move the break and returns it unchanged.
    pub fn query_break(&mut self) -> Result<u64> {
        self.brk(0)
    }

    /// Read the break, then move it `length` bytes further
    /// and verify that the kernel granted exactly that.
    pub fn grow_heap(&mut self, length: u64) -> Result<InjectedRegion> {
        let current = self.query_break()?;
        let target = match current.checked_add(length) {
            Some(t) => t,
            None => {
                return Err(Error::invalid(format!(
                    "cannot grow heap at {:#x} by {}b",
                    current, length
                )))
            }
        };
        debug!("current_brk = {:#x}, target_brk = {:#x}", current, target);

        let granted = self.brk(target)?;
        if granted != target {
            error!(
                "target brk not reached. want {:#x}, get {:#x}",
                target, granted
            );
            return Err(Error::injection(format!(
                "program break moved to {:#x} instead of {:#x}",
                granted, target
            )));
        }

        match proc::heap_mapping(self.tracee.pid()) {
            Ok(Some(heap)) => {
                if !heap.covers_break(target as usize) {
                    return Err(Error::injection(format!(
                        "new break {:#x} lies outside of the heap mapping {:#x}-{:#x}",
                        target, heap.start, heap.end
                    )));
                }
            }
            Ok(None) => debug!("tracee has no heap mapping yet"),
            Err(e) => warn!("cannot check heap mapping: {}", e),
        }

        Ok(InjectedRegion {
            base_address: current,
            length,
        })
    }

    /// Allocate tracee memory for `record`, copy it in word by word and read
    /// it back to verify the copy.
    pub fn stage(&mut self, record: &[u8]) -> Result<InjectedRegion> {
        if record.is_empty() {
            return Err(Error::invalid("cannot stage an empty record"));
        }
        let mut image = record.to_vec();
        image.resize(align_word(record.len()), 0);

        let region = self.grow_heap(image.len() as u64)?;
        write_bytes(self.tracee, region.base_address, &image)?;

        let copied = read_bytes(self.tracee, region.base_address, image.len() / WORD_SIZE)?;
        if copied != image {
            error!(
                "record is not properly copied to {:#x}: expected {:?}, got {:?}",
                region.base_address, image, copied
            );
            return Err(Error::injection(format!(
                "staged record at {:#x} differs from the local copy",
                region.base_address
            )));
        }
        debug!(
            "record of {}b successfully stored at {:#x}",
            record.len(),
            region.base_address
        );
        Ok(region)
    }

    /// Execute the call observed in `event` once more with the same number and arguments.
    /// Returns the registers of the replay's exit-stop.
    pub fn replay(&mut self, event: &SyscallEvent) -> Result<Regs> {
        let a = &event.args;
        let regs = syscall_args!(
            self.regs,
            event.number as c_ulong,
            a[0],
            a[1],
            a[2],
            a[3],
            a[4],
            a[5]
        );
        self.syscall(&regs)?;
        Ok(self.regs)
    }

    /// Run `steps` in order. Returns one value per step: the return register
    /// of calls and the base address of allocated regions.
    pub fn run(&mut self, steps: &[Step]) -> Result<Vec<u64>> {
        let mut results = Vec::with_capacity(steps.len());
        for (i, step) in steps.iter().enumerate() {
            let value = match step {
                Step::Call {
                    number,
                    args,
                    expect,
                } => {
                    if args.len() > 6 {
                        return Err(Error::invalid(format!(
                            "step {} passes {} arguments, at most 6 are possible",
                            i,
                            args.len()
                        )));
                    }
                    let mut raw = [0u64; 6];
                    for (slot, arg) in raw.iter_mut().zip(args.iter()) {
                        *slot = resolve(arg, &results)?;
                    }
                    let ret = self.call(*number, &raw)?;
                    check_expect(expect, *number, ret)?;
                    ret
                }
                Step::Grow { length } => self.grow_heap(*length)?.base_address,
                Step::Stage { record } => self.stage(record)?.base_address,
            };
            results.push(value);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{compile_executable, spawn_stopped_at};
    use tempfile::tempdir;

    #[test]
    fn test_resolve() {
        let results = [3, 0x1000];
        assert_eq!(resolve(&Arg::Raw(7), &results).unwrap(), 7);
        assert_eq!(resolve(&Arg::Result(1), &results).unwrap(), 0x1000);
        assert!(matches!(
            resolve(&Arg::Result(2), &results),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_check_entered() {
        let regs = Regs {
            orig_rax: libc::SYS_write as u64,
            ..Default::default()
        };
        assert!(check_entered(libc::SYS_write as u64, &regs).is_ok());
        match check_entered(libc::SYS_read as u64, &regs) {
            Err(Error::ProtocolViolation { expected, actual }) => {
                assert_eq!(expected, libc::SYS_read as u64);
                assert_eq!(actual, libc::SYS_write as u64);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_check_expect() {
        assert!(check_expect(&Expect::Nothing, 0, u64::MAX).is_ok());
        assert!(check_expect(&Expect::Success, 0, 3).is_ok());
        assert!(check_expect(&Expect::Success, 0, -(libc::ENOENT as i64) as u64).is_err());
        assert!(check_expect(&Expect::Equals(0), 0, 1).is_err());
    }

    #[test]
    fn test_inject_at_enter_stop_is_rejected() {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <unistd.h>
int main() {
  getppid();
  return 0;
}
"#,
            &binary,
        );
        let (mut tracee, regs) = spawn_stopped_at(&binary, libc::SYS_getppid, Phase::Enter);
        assert!(matches!(
            Injector::new(&mut tracee, regs),
            Err(Error::TraceFault(_))
        ));
    }

    #[test]
    fn test_grow_stage_and_call() {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <unistd.h>
int main() {
  getppid();
  return 0;
}
"#,
            &binary,
        );
        let (mut tracee, exit_regs) = spawn_stopped_at(&binary, libc::SYS_getppid, Phase::Exit);
        let pid = tracee.pid();
        let mut injector = Injector::new(&mut tracee, exit_regs).expect("cannot create injector");

        let before = injector.query_break().expect("cannot query break");
        let region = injector.grow_heap(1024).expect("cannot grow heap");
        assert_eq!(region.base_address, before);
        let after = injector.query_break().expect("cannot query break");
        assert_eq!(after, before + 1024);
        assert!(after >= region.end());

        let record: Vec<u8> = (0..20).collect();
        let staged = injector.stage(&record).expect("cannot stage record");
        assert_eq!(staged.base_address, after);
        assert_eq!(staged.length, 24);

        assert!(matches!(
            injector.grow_heap(u64::MAX),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(injector.query_break().unwrap(), after + 24);

        let steps = vec![
            Step::Call {
                number: libc::SYS_getpid,
                args: vec![],
                expect: Expect::Equals(pid.as_raw() as u64),
            },
            Step::Grow { length: 64 },
            Step::Call {
                number: libc::SYS_brk,
                args: vec![Arg::Raw(0)],
                expect: Expect::Success,
            },
        ];
        let results = injector.run(&steps).expect("sequence failed");
        assert_eq!(results[1] + 64, results[2]);

        // the legitimate exit-stop continues as if nothing happened
        let rip = injector.regs().ip();
        assert_eq!(rip, exit_regs.ip());
        let copied = read_bytes(&tracee, staged.base_address, 3).unwrap();
        assert_eq!(&copied[..20], &record[..]);
        tracee.setregs(&exit_regs).unwrap();
        tracee.step(Phase::Enter).unwrap();
    }
}
