//! Connection-address records staged into tracee memory before an injected `connect`.

use nix::sys::socket::{AddressFamily, InetAddr, SockAddr};
use simple_error::try_with;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::slice;

use super::memory::align_word;
use crate::result::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Unix(PathBuf),
    Inet(SocketAddr),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Destination::Unix(path) => write!(f, "unix:{}", path.display()),
            Destination::Inet(addr) => write!(f, "inet:{}", addr),
        }
    }
}

/// Byte image of a `struct sockaddr_*`, zero padded to whole words.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddressRecord {
    image: Vec<u8>,
    addr_len: libc::socklen_t,
    family: AddressFamily,
}

impl AddressRecord {
    pub fn new(dest: &Destination) -> Result<AddressRecord> {
        let addr = match dest {
            Destination::Unix(path) => {
                try_with!(
                    SockAddr::new_unix(path.as_path()),
                    "invalid unix socket path {}",
                    path.display()
                )
            }
            Destination::Inet(addr) => SockAddr::new_inet(InetAddr::from_std(addr)),
        };
        let (raw, addr_len) = addr.as_ffi_pair();
        let len = addr_len as usize;
        // Safe, because as_ffi_pair() returns the length of the structure behind `raw`.
        let bytes = unsafe { slice::from_raw_parts(raw as *const libc::sockaddr as *const u8, len) };
        if bytes.is_empty() {
            return Err(Error::invalid(format!("empty address record for {}", dest)));
        }
        let mut image = bytes.to_vec();
        image.resize(align_word(len), 0);

        Ok(AddressRecord {
            image,
            addr_len,
            family: addr.family(),
        })
    }

    /// Word aligned bytes to be written into the tracee.
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    /// Length argument for `connect(2)`.
    pub fn addr_len(&self) -> libc::socklen_t {
        self.addr_len
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracer::WORD_SIZE;

    #[test]
    fn test_unix_record() {
        let record = AddressRecord::new(&Destination::Unix(PathBuf::from("socket"))).unwrap();
        assert_eq!(record.family(), AddressFamily::Unix);
        assert_eq!(record.image().len() % WORD_SIZE, 0);
        let family = u16::from_ne_bytes([record.image()[0], record.image()[1]]);
        assert_eq!(family, libc::AF_UNIX as u16);
        assert_eq!(&record.image()[2..8], b"socket");
        assert!(record.addr_len() as usize >= 2 + "socket".len());
        assert!(record.addr_len() as usize <= record.image().len());
    }

    #[test]
    fn test_inet_record() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let record = AddressRecord::new(&Destination::Inet(addr)).unwrap();
        assert_eq!(record.family(), AddressFamily::Inet);
        assert_eq!(
            record.addr_len() as usize,
            std::mem::size_of::<libc::sockaddr_in>()
        );
        // port in network byte order
        assert_eq!(&record.image()[2..4], &4242u16.to_be_bytes());
        assert_eq!(&record.image()[4..8], &[127, 0, 0, 1]);
    }
}
