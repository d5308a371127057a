//! Multi-word access to tracee memory built on `peek_word`/`poke_word`.

use log::trace;

use super::{Tracee, WORD_SIZE};
use crate::result::{Error, Result};

/// Round `len` up to a multiple of the word size.
pub fn align_word(len: usize) -> usize {
    (len + WORD_SIZE - 1) & !(WORD_SIZE - 1)
}

/// Copy `data` to `addr` one word at a time. `data` must be a whole number of words;
/// see `align_word`.
pub fn write_bytes(tracee: &Tracee, addr: u64, data: &[u8]) -> Result<()> {
    if data.len() % WORD_SIZE != 0 {
        return Err(Error::invalid(format!(
            "cannot write {}b to tracee, not a multiple of the word size",
            data.len()
        )));
    }
    for (i, chunk) in data.chunks_exact(WORD_SIZE).enumerate() {
        let mut raw = [0u8; WORD_SIZE];
        raw.copy_from_slice(chunk);
        let word = i64::from_ne_bytes(raw);
        let to = addr + (i * WORD_SIZE) as u64;
        trace!("copying word {:#x} to tracee address {:#x}", word, to);
        tracee.poke_word(to, word)?;
    }
    Ok(())
}

/// Read `words` words starting at `addr`.
pub fn read_bytes(tracee: &Tracee, addr: u64, words: usize) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(words * WORD_SIZE);
    for i in 0..words {
        let word = tracee.peek_word(addr + (i * WORD_SIZE) as u64)?;
        buf.extend_from_slice(&word.to_ne_bytes());
    }
    Ok(buf)
}

/// Read a NUL terminated string of at most `max` bytes, e.g. a path argument.
///
/// Words are peeked at aligned addresses only, so a string that ends right
/// before an unmapped page is read without touching that page.
pub fn read_c_string(tracee: &Tracee, addr: u64, max: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut word_addr = addr & !(WORD_SIZE as u64 - 1);
    let mut skip = (addr - word_addr) as usize;
    while bytes.len() < max {
        let word = tracee.peek_word(word_addr)?;
        for b in word.to_ne_bytes().iter().skip(skip) {
            if *b == 0 || bytes.len() == max {
                return Ok(bytes);
            }
            bytes.push(*b);
        }
        skip = 0;
        word_addr += WORD_SIZE as u64;
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_word() {
        assert_eq!(align_word(0), 0);
        assert_eq!(align_word(1), 8);
        assert_eq!(align_word(8), 8);
        assert_eq!(align_word(110), 112);
    }
}
