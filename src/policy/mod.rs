use libc::c_long;
use log::debug;
use nix::errno::Errno;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use crate::result::{Error, Result};
use crate::tracer::inject_syscall::{Arg, Step};
use crate::tracer::memory::read_c_string;
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

pub mod alloc;
pub mod block;
pub mod duplicate;
pub mod redirect;
pub mod trace;

pub use alloc::{AllocOptions, AllocPolicy};
pub use block::{BlockOptions, BlockPolicy};
pub use duplicate::{DuplicateOptions, DuplicatePolicy};
pub use redirect::{RedirectOptions, RedirectPolicy};
pub use trace::TracePolicy;

const PATH_MAX: usize = libc::PATH_MAX as usize;

/// Where synthetic calls run relative to the call that triggered them.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Placement {
    /// The original call is cancelled at its enter-stop and replayed after the sequence.
    BeforeOriginal,
    AfterOriginal,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OriginalCall {
    Run,
    /// Do not (re-)execute the original call and report this value instead.
    Suppress(Arg),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectSequence {
    pub placement: Placement,
    pub steps: Vec<Step>,
    pub original: OriginalCall,
}

/// What to do with one observed syscall. Produced at the enter-stop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PolicyDecision {
    PassThrough,
    /// Let the call run and overwrite its result.
    ForceReturn(i64),
    /// Cancel the call and fail it with `errno`.
    Block(Errno),
    ReplaceAndRun { number: c_long, args: [u64; 6] },
    /// Run the call a second time and report the second result.
    Duplicate,
    InjectSequence(InjectSequence),
}

/// Decides, once per original syscall, how the session treats it.
///
/// Any state a recipe needs across calls (counters, "already fired") lives in
/// the implementing struct.
pub trait Policy {
    fn decide(&mut self, event: &SyscallEvent, tracee: &Tracee) -> Result<PolicyDecision>;

    /// Called at the exit-stop of every call once its decision has been applied.
    /// `injected` holds one value per synthetic step, see `Injector::run`.
    fn completed(&mut self, _event: &SyscallEvent, _injected: &[u64]) {}

    /// Nothing left to do; the session may detach.
    fn is_done(&self) -> bool {
        false
    }
}

/// Selects the calls a recipe acts on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Trigger {
    pub syscall: c_long,
    /// Only calls whose path argument equals this path qualify.
    pub path: Option<PathBuf>,
}

impl Trigger {
    pub fn new(syscall: c_long) -> Trigger {
        Trigger {
            syscall,
            path: None,
        }
    }

    fn path_arg(&self, event: &SyscallEvent) -> u64 {
        if event.is(libc::SYS_openat) {
            event.args[1]
        } else {
            event.args[0]
        }
    }

    pub fn matches(&self, event: &SyscallEvent, tracee: &Tracee) -> Result<bool> {
        if !event.is(self.syscall) {
            return Ok(false);
        }
        let path = match &self.path {
            Some(p) => p,
            None => return Ok(true),
        };
        let addr = self.path_arg(event);
        if addr == 0 {
            return Ok(false);
        }
        let actual = match read_c_string(tracee, addr, PATH_MAX) {
            Ok(bytes) => bytes,
            // the kernel answers the call with EFAULT itself
            Err(Error::TraceFault(e)) => {
                debug!("cannot read path argument of {}: {}", event.name(), e);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };
        Ok(actual == path.as_os_str().as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::Termination;
    use crate::session::{self, SessionOptions};
    use crate::test_utils::{compile_executable, spawn_stopped_at, step_to};
    use crate::tracer::syscall::classify;
    use crate::tracer::Phase;
    use tempfile::tempdir;

    #[test]
    fn test_trigger_path() {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <fcntl.h>
#include <unistd.h>
int main() {
  getppid();
  openat(AT_FDCWD, "/etc/hostname-does-not-matter", O_RDONLY);
  return 0;
}
"#,
            &binary,
        );
        // the dynamic loader opens files before main
        let (mut tracee, _) = spawn_stopped_at(&binary, libc::SYS_getppid, Phase::Exit);
        let regs = step_to(&mut tracee, libc::SYS_openat, Phase::Enter);
        let event = classify(&regs, Phase::Enter);

        let any = Trigger::new(libc::SYS_openat);
        assert!(any.matches(&event, &tracee).unwrap());

        let mut exact = Trigger::new(libc::SYS_openat);
        exact.path = Some(PathBuf::from("/etc/hostname-does-not-matter"));
        assert!(exact.matches(&event, &tracee).unwrap());

        exact.path = Some(PathBuf::from("/etc/hostname"));
        assert!(!exact.matches(&event, &tracee).unwrap());

        let other = Trigger::new(libc::SYS_read);
        assert!(!other.matches(&event, &tracee).unwrap());
    }

    #[test]
    fn test_trigger_path_at_page_end() {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <fcntl.h>
#include <string.h>
#include <sys/mman.h>
#include <unistd.h>
int main() {
  long page = sysconf(_SC_PAGESIZE);
  char *p = mmap(NULL, 2 * page, PROT_READ | PROT_WRITE, MAP_PRIVATE | MAP_ANONYMOUS, -1, 0);
  if (p == MAP_FAILED) return 1;
  munmap(p + page, page);
  char *path = p + page - 5;
  memcpy(path, "abcd", 5);
  getppid();
  openat(AT_FDCWD, path, O_RDONLY);
  return 0;
}
"#,
            &binary,
        );
        let (mut tracee, _) = spawn_stopped_at(&binary, libc::SYS_getppid, Phase::Exit);
        let regs = step_to(&mut tracee, libc::SYS_openat, Phase::Enter);
        let event = classify(&regs, Phase::Enter);

        let mut trigger = Trigger::new(libc::SYS_openat);
        trigger.path = Some(PathBuf::from("abcd"));
        assert!(trigger.matches(&event, &tracee).unwrap());
    }

    #[test]
    fn test_trigger_bad_path_pointer() {
        let dir = tempdir().expect("cannot create tempdir");
        let binary = dir.path().join("main");
        compile_executable(
            r#"
#include <errno.h>
#include <fcntl.h>
int main() {
  int fd = openat(AT_FDCWD, (char *)8, O_RDONLY);
  return (fd == -1 && errno == EFAULT) ? 0 : 1;
}
"#,
            &binary,
        );
        let mut trigger = Trigger::new(libc::SYS_openat);
        trigger.path = Some(PathBuf::from("whatever"));
        let mut policy = DuplicatePolicy::new(DuplicateOptions { trigger });
        let opts = SessionOptions {
            command: vec![binary.to_str().unwrap().to_string()],
            detach_when_done: false,
        };
        assert_eq!(
            session::run(&opts, &mut policy).unwrap(),
            Termination::Exited(0)
        );
        assert_eq!(policy.duplicated(), 0);
    }
}
