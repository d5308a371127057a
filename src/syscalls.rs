//! Names for the syscalls that are commonly traced or hooked.

use libc::c_long;

const TABLE: &[(&str, c_long)] = &[
    ("read", libc::SYS_read),
    ("write", libc::SYS_write),
    ("open", libc::SYS_open),
    ("close", libc::SYS_close),
    ("stat", libc::SYS_stat),
    ("fstat", libc::SYS_fstat),
    ("lstat", libc::SYS_lstat),
    ("poll", libc::SYS_poll),
    ("lseek", libc::SYS_lseek),
    ("mmap", libc::SYS_mmap),
    ("mprotect", libc::SYS_mprotect),
    ("munmap", libc::SYS_munmap),
    ("brk", libc::SYS_brk),
    ("rt_sigaction", libc::SYS_rt_sigaction),
    ("rt_sigprocmask", libc::SYS_rt_sigprocmask),
    ("ioctl", libc::SYS_ioctl),
    ("pread64", libc::SYS_pread64),
    ("pwrite64", libc::SYS_pwrite64),
    ("readv", libc::SYS_readv),
    ("writev", libc::SYS_writev),
    ("access", libc::SYS_access),
    ("pipe", libc::SYS_pipe),
    ("dup", libc::SYS_dup),
    ("dup2", libc::SYS_dup2),
    ("nanosleep", libc::SYS_nanosleep),
    ("getpid", libc::SYS_getpid),
    ("socket", libc::SYS_socket),
    ("connect", libc::SYS_connect),
    ("accept", libc::SYS_accept),
    ("sendto", libc::SYS_sendto),
    ("recvfrom", libc::SYS_recvfrom),
    ("bind", libc::SYS_bind),
    ("listen", libc::SYS_listen),
    ("clone", libc::SYS_clone),
    ("fork", libc::SYS_fork),
    ("execve", libc::SYS_execve),
    ("exit", libc::SYS_exit),
    ("wait4", libc::SYS_wait4),
    ("kill", libc::SYS_kill),
    ("uname", libc::SYS_uname),
    ("fcntl", libc::SYS_fcntl),
    ("getcwd", libc::SYS_getcwd),
    ("unlink", libc::SYS_unlink),
    ("getdents64", libc::SYS_getdents64),
    ("arch_prctl", libc::SYS_arch_prctl),
    ("set_tid_address", libc::SYS_set_tid_address),
    ("exit_group", libc::SYS_exit_group),
    ("openat", libc::SYS_openat),
    ("newfstatat", libc::SYS_newfstatat),
    ("set_robust_list", libc::SYS_set_robust_list),
    ("prlimit64", libc::SYS_prlimit64),
    ("getrandom", libc::SYS_getrandom),
];

pub fn name(nr: u64) -> Option<&'static str> {
    TABLE
        .iter()
        .find(|(_, n)| *n as u64 == nr)
        .map(|(name, _)| *name)
}

/// Accepts a name from the table or a plain syscall number.
pub fn lookup(name: &str) -> Option<c_long> {
    if let Ok(nr) = name.parse::<c_long>() {
        return Some(nr);
    }
    TABLE.iter().find(|(n, _)| *n == name).map(|(_, nr)| *nr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(lookup("openat"), Some(libc::SYS_openat));
        assert_eq!(lookup("1"), Some(libc::SYS_write));
        assert_eq!(lookup("no_such_call"), None);
        assert_eq!(name(libc::SYS_brk as u64), Some("brk"));
        assert_eq!(name(100_000), None);
    }
}
