use libc::c_int;
use log::info;

use super::{InjectSequence, OriginalCall, Placement, Policy, PolicyDecision, Trigger};
use crate::result::Result;
use crate::tracer::inject_syscall::{Arg, Expect, Step};
use crate::tracer::sockaddr::{AddressRecord, Destination};
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

const STEP_RECORD: usize = 0;
const STEP_SOCKET: usize = 1;

pub struct RedirectOptions {
    pub trigger: Trigger,
    pub destination: Destination,
    /// Skip the original call and report the connected socket in its place.
    pub suppress: bool,
    /// Skip the original call and report this value.
    pub return_value: Option<i64>,
}

/// Opens a stream socket in the tracee and connects it to `destination`
/// before the first qualifying call runs.
pub struct RedirectPolicy {
    opts: RedirectOptions,
    record: AddressRecord,
    fired: bool,
    socket: Option<c_int>,
}

impl RedirectPolicy {
    pub fn new(opts: RedirectOptions) -> Result<RedirectPolicy> {
        let record = AddressRecord::new(&opts.destination)?;
        Ok(RedirectPolicy {
            opts,
            record,
            fired: false,
            socket: None,
        })
    }

    /// File descriptor of the injected socket in the tracee.
    pub fn socket(&self) -> Option<c_int> {
        self.socket
    }

    fn original(&self) -> OriginalCall {
        match self.opts.return_value {
            Some(v) => OriginalCall::Suppress(Arg::Raw(v as u64)),
            None if self.opts.suppress => OriginalCall::Suppress(Arg::Result(STEP_SOCKET)),
            None => OriginalCall::Run,
        }
    }

    fn steps(&self) -> Vec<Step> {
        vec![
            Step::Stage {
                record: self.record.image().to_vec(),
            },
            Step::Call {
                number: libc::SYS_socket,
                args: vec![
                    Arg::Raw(self.record.family() as c_int as u64),
                    Arg::Raw(libc::SOCK_STREAM as u64),
                    Arg::Raw(0),
                ],
                expect: Expect::Success,
            },
            Step::Call {
                number: libc::SYS_connect,
                args: vec![
                    Arg::Result(STEP_SOCKET),
                    Arg::Result(STEP_RECORD),
                    Arg::Raw(self.record.addr_len() as u64),
                ],
                expect: Expect::Equals(0),
            },
        ]
    }
}

impl Policy for RedirectPolicy {
    fn decide(&mut self, event: &SyscallEvent, tracee: &Tracee) -> Result<PolicyDecision> {
        if self.fired || !self.opts.trigger.matches(event, tracee)? {
            return Ok(PolicyDecision::PassThrough);
        }
        self.fired = true;
        Ok(PolicyDecision::InjectSequence(InjectSequence {
            placement: Placement::BeforeOriginal,
            steps: self.steps(),
            original: self.original(),
        }))
    }

    fn completed(&mut self, event: &SyscallEvent, injected: &[u64]) {
        if !self.fired || self.socket.is_some() {
            return;
        }
        if let Some(fd) = injected.get(STEP_SOCKET) {
            info!(
                "connected fd {} to {} before {}",
                fd,
                self.opts.destination,
                event.name()
            );
            self.socket = Some(*fd as c_int);
        }
    }

    fn is_done(&self) -> bool {
        self.socket.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn policy(suppress: bool, return_value: Option<i64>) -> RedirectPolicy {
        RedirectPolicy::new(RedirectOptions {
            trigger: Trigger::new(libc::SYS_openat),
            destination: Destination::Unix(PathBuf::from("/tmp/socket")),
            suppress,
            return_value,
        })
        .expect("cannot create policy")
    }

    #[test]
    fn test_steps() {
        let p = policy(false, None);
        let steps = p.steps();
        assert_eq!(steps.len(), 3);
        match &steps[2] {
            Step::Call { number, args, .. } => {
                assert_eq!(*number, libc::SYS_connect);
                assert_eq!(args[0], Arg::Result(STEP_SOCKET));
                assert_eq!(args[1], Arg::Result(STEP_RECORD));
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert_eq!(p.original(), OriginalCall::Run);
    }

    #[test]
    fn test_original_disposition() {
        assert_eq!(
            policy(true, None).original(),
            OriginalCall::Suppress(Arg::Result(STEP_SOCKET))
        );
        assert_eq!(
            policy(true, Some(-2)).original(),
            OriginalCall::Suppress(Arg::Raw(-2i64 as u64))
        );
    }
}
