use log::debug;
use nix::errno::Errno;

use super::{Policy, PolicyDecision, Trigger};
use crate::result::{Error, Result};
use crate::tracer::syscall::SyscallEvent;
use crate::tracer::Tracee;

pub struct BlockOptions {
    pub trigger: Trigger,
    /// Number of qualifying calls that always pass.
    pub threshold: u64,
    pub interval: u64,
    pub errno: Errno,
}

/// Fails every `interval`th qualifying call once `threshold` calls have passed.
pub struct BlockPolicy {
    opts: BlockOptions,
    count: u64,
    blocked: u64,
}

/// `n` is the 1-based index of the qualifying call.
pub fn should_block(n: u64, threshold: u64, interval: u64) -> bool {
    n > threshold && n % interval == 0
}

impl BlockPolicy {
    pub fn new(opts: BlockOptions) -> Result<BlockPolicy> {
        if opts.interval == 0 {
            return Err(Error::invalid("blocking interval must be at least 1"));
        }
        Ok(BlockPolicy {
            opts,
            count: 0,
            blocked: 0,
        })
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn blocked(&self) -> u64 {
        self.blocked
    }
}

impl Policy for BlockPolicy {
    fn decide(&mut self, event: &SyscallEvent, tracee: &Tracee) -> Result<PolicyDecision> {
        if !self.opts.trigger.matches(event, tracee)? {
            return Ok(PolicyDecision::PassThrough);
        }
        self.count += 1;
        if !should_block(self.count, self.opts.threshold, self.opts.interval) {
            return Ok(PolicyDecision::PassThrough);
        }
        self.blocked += 1;
        debug!(
            "blocking {} #{} with {}",
            event.name(),
            self.count,
            self.opts.errno
        );
        Ok(PolicyDecision::Block(self.opts.errno))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcomes(calls: u64, threshold: u64, interval: u64) -> Vec<bool> {
        (1..=calls)
            .map(|n| should_block(n, threshold, interval))
            .collect()
    }

    #[test]
    fn test_ten_calls() {
        let mut expected = vec![false; 10];
        expected[9] = true;
        assert_eq!(outcomes(10, 5, 10), expected);
    }

    #[test]
    fn test_every_nth_after_threshold() {
        for threshold in 0..12 {
            for interval in 1..7 {
                let blocked: Vec<u64> = (1..=60)
                    .filter(|n| should_block(*n, threshold, interval))
                    .collect();
                assert!(blocked.iter().all(|n| *n > threshold && n % interval == 0));
                let expected = (threshold + 1..=60).filter(|n| n % interval == 0).count();
                assert_eq!(blocked.len(), expected);
            }
        }
    }

    #[test]
    fn test_zero_interval() {
        let opts = BlockOptions {
            trigger: Trigger::new(libc::SYS_read),
            threshold: 5,
            interval: 0,
            errno: Errno::EPERM,
        };
        assert!(matches!(
            BlockPolicy::new(opts),
            Err(Error::InvalidRequest(_))
        ));
    }
}
