use log::info;

use super::{Policy, PolicyDecision};
use crate::result::Result;
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

/// Logs every syscall with its result and never interferes.
#[derive(Default)]
pub struct TracePolicy {
    calls: u64,
}

impl TracePolicy {
    pub fn new() -> TracePolicy {
        TracePolicy::default()
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl Policy for TracePolicy {
    fn decide(&mut self, _event: &SyscallEvent, _tracee: &Tracee) -> Result<PolicyDecision> {
        Ok(PolicyDecision::PassThrough)
    }

    fn completed(&mut self, event: &SyscallEvent, _injected: &[u64]) {
        self.calls += 1;
        info!("{}", event);
    }
}
