use log::info;

use super::{InjectSequence, OriginalCall, Placement, Policy, PolicyDecision, Trigger};
use crate::result::Result;
use crate::tracer::inject_syscall::{InjectedRegion, Step};
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

pub struct AllocOptions {
    pub trigger: Trigger,
    pub size: u64,
}

/// Grows the tracee's heap behind its back before the first qualifying call.
pub struct AllocPolicy {
    opts: AllocOptions,
    fired: bool,
    region: Option<InjectedRegion>,
}

impl AllocPolicy {
    pub fn new(opts: AllocOptions) -> AllocPolicy {
        AllocPolicy {
            opts,
            fired: false,
            region: None,
        }
    }

    /// The region carved out of the heap, once the recipe ran.
    pub fn region(&self) -> Option<InjectedRegion> {
        self.region
    }
}

impl Policy for AllocPolicy {
    fn decide(&mut self, event: &SyscallEvent, tracee: &Tracee) -> Result<PolicyDecision> {
        if self.fired || !self.opts.trigger.matches(event, tracee)? {
            return Ok(PolicyDecision::PassThrough);
        }
        self.fired = true;
        Ok(PolicyDecision::InjectSequence(InjectSequence {
            placement: Placement::BeforeOriginal,
            steps: vec![Step::Grow {
                length: self.opts.size,
            }],
            original: OriginalCall::Run,
        }))
    }

    fn completed(&mut self, _event: &SyscallEvent, injected: &[u64]) {
        if !self.fired || self.region.is_some() {
            return;
        }
        if let Some(base) = injected.first() {
            let region = InjectedRegion {
                base_address: *base,
                length: self.opts.size,
            };
            info!(
                "allocated {}b at {:#x}-{:#x}",
                region.length,
                region.base_address,
                region.end()
            );
            self.region = Some(region);
        }
    }

    fn is_done(&self) -> bool {
        self.region.is_some()
    }
}
