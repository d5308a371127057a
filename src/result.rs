use nix::sys::signal::Signal;
use simple_error::SimpleError;
use std::{fmt, result};

pub type Result<T> = result::Result<T, Error>;

/// How the tracee ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Killed(Signal),
}

impl Termination {
    /// Exit code a shell would report for this termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Termination::Exited(code) => *code,
            Termination::Killed(sig) => 128 + *sig as i32,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with {}", code),
            Termination::Killed(sig) => write!(f, "killed by {}", sig),
        }
    }
}

#[derive(Debug)]
pub enum Error {
    /// The tracee could not be created or traced.
    AttachFailure(SimpleError),
    /// A ptrace or waitpid operation failed while the tracee should have been stopped.
    TraceFault(SimpleError),
    /// A replayed or injected call entered the kernel with an unexpected syscall number.
    ProtocolViolation { expected: u64, actual: u64 },
    /// The tracee went away.
    TargetTerminated(Termination),
    /// An injected call did not have the effect it was verified against.
    InjectionFailed(SimpleError),
    /// A policy asked for something the injector cannot express.
    InvalidRequest(SimpleError),
}

impl Error {
    pub fn injection(msg: impl AsRef<str>) -> Error {
        Error::InjectionFailed(SimpleError::new(msg.as_ref()))
    }

    pub fn invalid(msg: impl AsRef<str>) -> Error {
        Error::InvalidRequest(SimpleError::new(msg.as_ref()))
    }

    /// Only the tracee terminating on its own is not fatal to a session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::TargetTerminated(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::AttachFailure(e) => write!(f, "cannot start tracee: {}", e),
            Error::TraceFault(e) => write!(f, "trace operation failed: {}", e),
            Error::ProtocolViolation { expected, actual } => write!(
                f,
                "tracee entered syscall {} while syscall {} was expected",
                *actual as i64, *expected as i64
            ),
            Error::TargetTerminated(t) => write!(f, "tracee {}", t),
            Error::InjectionFailed(e) => write!(f, "syscall injection failed: {}", e),
            Error::InvalidRequest(e) => write!(f, "invalid policy decision: {}", e),
        }
    }
}

impl std::error::Error for Error {}

impl From<SimpleError> for Error {
    fn from(e: SimpleError) -> Error {
        Error::TraceFault(e)
    }
}

/// Like `simple_error::try_with!`, but reports an `AttachFailure`.
#[macro_export]
macro_rules! try_attach {
    ($expr: expr, $str: expr) => (match $expr {
        Ok(val) => val,
        Err(err) => {
            return Err($crate::result::Error::AttachFailure(
                ::simple_error::SimpleError::with($str, err),
            ));
        },
    });
    ($expr: expr, $fmt:expr, $($arg:tt)+) => (match $expr {
        Ok(val) => val,
        Err(err) => {
            return Err($crate::result::Error::AttachFailure(
                ::simple_error::SimpleError::with(&format!($fmt, $($arg)+), err),
            ));
        },
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(Termination::Exited(3).exit_code(), 3);
        assert_eq!(Termination::Killed(Signal::SIGKILL).exit_code(), 137);
    }

    #[test]
    fn test_fatality() {
        assert!(!Error::TargetTerminated(Termination::Exited(0)).is_fatal());
        assert!(Error::ProtocolViolation {
            expected: 1,
            actual: 0
        }
        .is_fatal());
        let e: Error = SimpleError::new("boom").into();
        assert!(matches!(e, Error::TraceFault(_)));
    }
}
