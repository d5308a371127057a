use log::*;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches};
use libc::c_long;
use nix::errno::Errno;

use syswrap::policy::{
    AllocOptions, AllocPolicy, BlockOptions, BlockPolicy, DuplicateOptions, DuplicatePolicy,
    Policy, RedirectOptions, RedirectPolicy, TracePolicy, Trigger,
};
use syswrap::result::{Error, Result};
use syswrap::session::{self, SessionOptions};
use syswrap::syscalls;
use syswrap::tracer::sockaddr::Destination;

/// Exit code when the session itself failed.
const SESSION_FAILURE: i32 = 125;

const ERRNOS: &[(&str, Errno)] = &[
    ("EPERM", Errno::EPERM),
    ("ENOENT", Errno::ENOENT),
    ("EINTR", Errno::EINTR),
    ("EIO", Errno::EIO),
    ("EBADF", Errno::EBADF),
    ("EAGAIN", Errno::EAGAIN),
    ("ENOMEM", Errno::ENOMEM),
    ("EACCES", Errno::EACCES),
    ("EFAULT", Errno::EFAULT),
    ("EBUSY", Errno::EBUSY),
    ("EINVAL", Errno::EINVAL),
    ("ENOSPC", Errno::ENOSPC),
    ("ENOSYS", Errno::ENOSYS),
];

fn command_args() -> Arg<'static> {
    Arg::new("command")
        .help("Program to run under the tracer, followed by its arguments")
        .multiple_occurrences(true)
        .required(true)
        .last(true)
}

fn syscall_arg(default: &'static str) -> Arg<'static> {
    Arg::new("syscall")
        .short('s')
        .long("syscall")
        .takes_value(true)
        .default_value(default)
        .help("Name or number of the syscall that triggers the recipe")
}

fn keep_tracing_arg() -> Arg<'static> {
    Arg::new("keep-tracing")
        .long("keep-tracing")
        .help("Keep tracing after the recipe fired instead of detaching")
}

fn parse_syscall(args: &ArgMatches) -> c_long {
    let name = args.value_of_t_or_exit::<String>("syscall");
    match syscalls::lookup(&name) {
        Some(nr) => nr,
        None => {
            error!("unknown syscall: {}", name);
            std::process::exit(SESSION_FAILURE);
        }
    }
}

fn parse_errno(name: &str) -> Option<Errno> {
    if let Ok(n) = name.parse::<i32>() {
        return Some(Errno::from_i32(n));
    }
    let upper = name.to_uppercase();
    ERRNOS
        .iter()
        .find(|(n, _)| *n == upper)
        .map(|(_, errno)| *errno)
}

fn session_options(args: &ArgMatches, detach_when_done: bool) -> SessionOptions {
    SessionOptions {
        command: args.values_of_t("command").unwrap_or_else(|e| e.exit()),
        detach_when_done,
    }
}

fn run(opts: &SessionOptions, policy: &mut dyn Policy) -> ! {
    match session::run(opts, policy) {
        Ok(termination) => {
            info!("tracee {}", termination);
            std::process::exit(termination.exit_code());
        }
        Err(Error::TargetTerminated(termination)) => std::process::exit(termination.exit_code()),
        Err(err) => {
            error!("{}", err);
            std::process::exit(SESSION_FAILURE);
        }
    }
}

fn exit_on_error<T>(res: Result<T>) -> T {
    match res {
        Ok(v) => v,
        Err(err) => {
            error!("{}", err);
            std::process::exit(SESSION_FAILURE);
        }
    }
}

fn trace(args: &ArgMatches) {
    let opts = session_options(args, false);
    run(&opts, &mut TracePolicy::new());
}

fn block(args: &ArgMatches) {
    let errno_name = args.value_of_t_or_exit::<String>("errno");
    let errno = match parse_errno(&errno_name) {
        Some(e) => e,
        None => {
            error!("unknown errno: {}", errno_name);
            std::process::exit(SESSION_FAILURE);
        }
    };
    let opts = BlockOptions {
        trigger: Trigger::new(parse_syscall(args)),
        threshold: args.value_of_t_or_exit("threshold"),
        interval: args.value_of_t_or_exit("interval"),
        errno,
    };
    let mut policy = exit_on_error(BlockPolicy::new(opts));
    run(&session_options(args, false), &mut policy);
}

fn duplicate(args: &ArgMatches) {
    let opts = DuplicateOptions {
        trigger: Trigger::new(parse_syscall(args)),
    };
    run(
        &session_options(args, false),
        &mut DuplicatePolicy::new(opts),
    );
}

fn alloc(args: &ArgMatches) {
    let opts = AllocOptions {
        trigger: Trigger::new(parse_syscall(args)),
        size: args.value_of_t_or_exit("size"),
    };
    let detach = !args.is_present("keep-tracing");
    run(&session_options(args, detach), &mut AllocPolicy::new(opts));
}

fn redirect(args: &ArgMatches) {
    let mut trigger = Trigger::new(parse_syscall(args));
    trigger.path = args.value_of("path-match").map(PathBuf::from);

    let destination = if let Some(path) = args.value_of("unix") {
        Destination::Unix(PathBuf::from(path))
    } else {
        Destination::Inet(args.value_of_t_or_exit::<SocketAddr>("inet"))
    };
    let return_value = if args.is_present("return") {
        Some(args.value_of_t_or_exit::<i64>("return"))
    } else {
        None
    };
    let opts = RedirectOptions {
        trigger,
        destination,
        suppress: args.is_present("suppress"),
        return_value,
    };
    let mut policy = exit_on_error(RedirectPolicy::new(opts));
    let detach = !args.is_present("keep-tracing");
    run(&session_options(args, detach), &mut policy);
}

fn setup_logging(matches: &clap::ArgMatches) {
    if matches.is_present("verbose") {
        env_logger::Builder::new().parse_filters("debug").init();
        return;
    }

    let loglevel = matches.value_of("loglevel");
    if let Some(level) = loglevel {
        env_logger::Builder::new().parse_filters(level).init();
        return;
    }

    // default
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

fn main() {
    let trace_command = App::new("trace")
        .about("Log every syscall of a program.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(command_args());

    let block_command = App::new("block")
        .about("Fail every Nth call of a syscall once a threshold has passed.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(syscall_arg("read"))
        .arg(
            Arg::new("threshold")
                .long("threshold")
                .takes_value(true)
                .default_value("5")
                .help("Number of calls that always pass"),
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .takes_value(true)
                .default_value("10")
                .help("Block calls whose index is a multiple of this"),
        )
        .arg(
            Arg::new("errno")
                .long("errno")
                .takes_value(true)
                .default_value("EPERM")
                .help("Error returned by blocked calls, by name or number"),
        )
        .arg(command_args());

    let duplicate_command = App::new("duplicate")
        .about("Execute every call of a syscall twice.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(syscall_arg("write"))
        .arg(command_args());

    let alloc_command = App::new("alloc")
        .about("Grow the heap of a program before its first call of a syscall.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(syscall_arg("write"))
        .arg(
            Arg::new("size")
                .long("size")
                .takes_value(true)
                .default_value("1024")
                .help("Number of bytes to add to the heap"),
        )
        .arg(keep_tracing_arg())
        .arg(command_args());

    let redirect_command = App::new("redirect")
        .about("Open and connect a socket in a program before its first call of a syscall.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .arg(syscall_arg("openat"))
        .arg(
            Arg::new("path-match")
                .long("path-match")
                .takes_value(true)
                .help("Only fire on calls with this path argument"),
        )
        .arg(
            Arg::new("unix")
                .long("unix")
                .takes_value(true)
                .conflicts_with("inet")
                .required_unless_present("inet")
                .help("Connect to this unix socket"),
        )
        .arg(
            Arg::new("inet")
                .long("inet")
                .takes_value(true)
                .help("Connect to this ADDRESS:PORT"),
        )
        .arg(
            Arg::new("suppress")
                .long("suppress")
                .help("Skip the original call and return the connected socket instead"),
        )
        .arg(
            Arg::new("return")
                .long("return")
                .takes_value(true)
                .allow_hyphen_values(true)
                .help("Skip the original call and return this value instead"),
        )
        .arg(keep_tracing_arg())
        .arg(command_args());

    let main_app = App::new("syswrap")
        .about("Intercept and inject syscalls of a program.")
        .version(crate_version!())
        .author(crate_authors!("\n"))
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(Arg::new("verbose")
             .short('v')
             .conflicts_with("loglevel")
             .help("shorthand for --loglevel debug)"))
        .arg(Arg::new("loglevel")
             .short('l')
             .takes_value(true)
             .help("Finegrained verbosity control. See docs.rs/env_logger. Examples: [error, warn, info, debug, trace]"))
        .subcommands([
            trace_command,
            block_command,
            duplicate_command,
            alloc_command,
            redirect_command
        ]);

    let matches = main_app.get_matches();
    setup_logging(&matches);
    match matches.subcommand() {
        Some(("trace", sub_matches)) => trace(sub_matches),
        Some(("block", sub_matches)) => block(sub_matches),
        Some(("duplicate", sub_matches)) => duplicate(sub_matches),
        Some(("alloc", sub_matches)) => alloc(sub_matches),
        Some(("redirect", sub_matches)) => redirect(sub_matches),
        Some((_, _)) => unreachable!(),
        None => unreachable!(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_errno() {
        assert_eq!(parse_errno("EPERM"), Some(Errno::EPERM));
        assert_eq!(parse_errno("eacces"), Some(Errno::EACCES));
        assert_eq!(parse_errno("2"), Some(Errno::ENOENT));
        assert_eq!(parse_errno("EWHATEVER"), None);
    }
}
