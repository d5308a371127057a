use nix::unistd::Pid;
use simple_error::{bail, try_with, SimpleError};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

/// One line of `/proc/<pid>/maps`, reduced to what the heap check needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mapping {
    pub start: usize,
    pub end: usize,
    /// Empty for anonymous mappings, `[heap]` for the program break.
    pub pathname: String,
}

impl Mapping {
    /// `addr` lies in the mapping or right at its end, as a program break does.
    pub fn covers_break(&self, addr: usize) -> bool {
        self.start <= addr && addr <= self.end
    }
}

pub fn pid_path(pid: Pid) -> PathBuf {
    PathBuf::from("/proc").join(pid.as_raw().to_string())
}

fn parse_address(field: &str) -> Result<usize, SimpleError> {
    Ok(try_with!(
        usize::from_str_radix(field, 16),
        "address is not a number: {}",
        field
    ))
}

/// Fields are `range perms offset dev inode [pathname]`; only the range and
/// the pathname are kept.
fn parse_line(line: &str) -> Result<Mapping, SimpleError> {
    let fields = line.split_whitespace().collect::<Vec<_>>();
    if fields.len() < 5 {
        bail!("expected at least 5 fields in maps line: {}", line);
    }
    let (start, end) = match fields[0].split_once('-') {
        Some((start, end)) => (parse_address(start)?, parse_address(end)?),
        None => bail!("address range is malformed: {}", fields[0]),
    };
    if start > end {
        bail!("mapping ends before it starts: {}", fields[0]);
    }
    Ok(Mapping {
        start,
        end,
        pathname: fields[5..].join(" "),
    })
}

pub fn maps(pid: Pid) -> Result<Vec<Mapping>, SimpleError> {
    let path = pid_path(pid).join("maps");
    let f = try_with!(File::open(&path), "cannot open {}", path.display());
    let buf = BufReader::new(f);
    let mut maps = vec![];
    for line in buf.lines() {
        let line = try_with!(line, "cannot read from {}", path.display());
        maps.push(try_with!(parse_line(&line), "cannot parse line {}", line));
    }
    Ok(maps)
}

/// The mapping backing the program break, if the heap has been created yet.
pub fn heap_mapping(pid: Pid) -> Result<Option<Mapping>, SimpleError> {
    Ok(maps(pid)?.into_iter().find(|m| m.pathname == "[heap]"))
}
