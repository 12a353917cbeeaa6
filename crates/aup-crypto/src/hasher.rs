use std::io::{self, Read};

use aup_types::Oid;

const CHUNK: usize = 64 * 1024;

/// Incremental BLAKE3 hasher producing an [`Oid`].
///
/// Feeding the same bytes in any chunking yields the same identifier as
/// [`identify`] over the concatenation.
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes to the hashed stream.
    pub fn add(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Number of bytes hashed so far.
    pub fn count(&self) -> u64 {
        self.inner.count()
    }

    /// Finish and return the identifier.
    pub fn finish(&self) -> Oid {
        Oid::from_hash(*self.inner.finalize().as_bytes())
    }
}

/// Identify a byte buffer.
pub fn identify(data: &[u8]) -> Oid {
    Oid::from_hash(*blake3::hash(data).as_bytes())
}

/// Identify everything a reader yields until end of stream.
pub fn identify_reader<R: Read>(mut reader: R) -> io::Result<Oid> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.add(&buf[..n]);
    }
    Ok(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identify_is_deterministic() {
        assert_eq!(identify(b"hello world"), identify(b"hello world"));
        assert_ne!(identify(b"hello"), identify(b"world"));
    }

    #[test]
    fn identify_is_plain_blake3() {
        let expected = *blake3::hash(b"abc").as_bytes();
        assert_eq!(identify(b"abc").as_bytes(), &expected);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut hasher = ContentHasher::new();
        hasher.add(b"hello ").add(b"world");
        assert_eq!(hasher.count(), 11);
        assert_eq!(hasher.finish(), identify(b"hello world"));
    }

    #[test]
    fn reader_matches_one_shot_across_chunks() {
        let data: Vec<u8> = (0..(CHUNK * 2 + 17)).map(|i| (i % 251) as u8).collect();
        let oid = identify_reader(io::Cursor::new(&data)).unwrap();
        assert_eq!(oid, identify(&data));
    }

    #[test]
    fn empty_input_is_not_null() {
        assert!(!identify(b"").is_null());
    }
}
