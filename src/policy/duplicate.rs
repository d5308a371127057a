use log::debug;

use super::{Policy, PolicyDecision, Trigger};
use crate::result::Result;
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

pub struct DuplicateOptions {
    pub trigger: Trigger,
}

/// Executes every qualifying call twice. The tracee sees the second result.
pub struct DuplicatePolicy {
    opts: DuplicateOptions,
    duplicated: u64,
    pending: bool,
}

impl DuplicatePolicy {
    pub fn new(opts: DuplicateOptions) -> DuplicatePolicy {
        DuplicatePolicy {
            opts,
            duplicated: 0,
            pending: false,
        }
    }

    pub fn duplicated(&self) -> u64 {
        self.duplicated
    }
}

impl Policy for DuplicatePolicy {
    fn decide(&mut self, event: &SyscallEvent, tracee: &Tracee) -> Result<PolicyDecision> {
        if !self.opts.trigger.matches(event, tracee)? {
            return Ok(PolicyDecision::PassThrough);
        }
        self.pending = true;
        Ok(PolicyDecision::Duplicate)
    }

    fn completed(&mut self, event: &SyscallEvent, injected: &[u64]) {
        if !self.pending {
            return;
        }
        self.pending = false;
        self.duplicated += 1;
        if let [first, second] = injected {
            debug!(
                "{} executed twice: {} then {}",
                event.name(),
                *first as i64,
                *second as i64
            );
        }
    }
}
