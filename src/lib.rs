#![deny(clippy::print_stdout, clippy::print_stderr, clippy::unwrap_used)]

#[cfg(not(target_arch = "x86_64"))]
compile_error!("syswrap only supports the x86_64 syscall ABI");

pub mod cpu;
pub mod policy;
pub mod result;
pub mod session;
pub mod syscalls;
pub mod tracer;

#[cfg(test)]
mod test_utils;
