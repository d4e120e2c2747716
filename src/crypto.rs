//! SHA-256 helpers working on whole buffers or on a part of a stream.

use crate::error::Error;
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::stream::{ReadStream, WriteStream};
use sha2::{Digest, Sha256};
use std::cmp::min;

const BLOCK_SIZE: usize = 0x10000;

#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Sha256Hash(pub [u8; 0x20]);
impl_debug_deserialize_serialize_hexstring!(Sha256Hash);

impl Sha256Hash {
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl From<sha2::digest::Output<Sha256>> for Sha256Hash {
    fn from(out: sha2::digest::Output<Sha256>) -> Sha256Hash {
        let mut hash = [0; 0x20];
        hash.copy_from_slice(out.as_slice());
        Sha256Hash(hash)
    }
}

pub fn sha256(data: &[u8]) -> Sha256Hash {
    Sha256::digest(data).into()
}

/// Hash `size` bytes of `rs`, starting at its current position.
///
/// Fails with [`Error::ShortRead`] if the stream runs out before `size` bytes
/// were consumed.
pub fn sha256_part(rs: &mut dyn ReadStream, size: u64) -> Result<Sha256Hash, Error> {
    let mut hasher = Sha256::new();
    let mut block = vec![0; min(size, BLOCK_SIZE as u64) as usize];
    let mut left = size;
    while left != 0 {
        let next = min(left, BLOCK_SIZE as u64) as usize;
        rs.read_exact(&mut block[..next])?;
        hasher.update(&block[..next]);
        left -= next as u64;
    }
    Ok(hasher.finalize().into())
}

/// A [`WriteStream`] adapter hashing everything that goes through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: WriteStream> HashingWriter<W> {
    pub fn new(inner: W) -> HashingWriter<W> {
        HashingWriter {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn finalize(self) -> (W, Sha256Hash) {
        (self.inner, self.hasher.finalize().into())
    }
}

impl<W: WriteStream> WriteStream for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write(buf)?;
        self.hasher.update(buf);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.inner.tell()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::{MemoryStream, MemoryWriteStream};
    use hex_literal::hex;

    #[test]
    fn sha256_of_empty_buffer() {
        assert_eq!(
            sha256(b"").0,
            hex!("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855")
        );
    }

    #[test]
    fn partial_hash_only_covers_requested_range() {
        let data = vec![0x5a; 0x20000];
        let mut rs = MemoryStream::borrowed(&data);
        let hash = sha256_part(&mut rs, 0x10010).unwrap();
        assert_eq!(hash, sha256(&data[..0x10010]));
        assert_eq!(rs.tell(), 0x10010);
    }

    #[test]
    fn partial_hash_reports_short_reads() {
        let data = [0u8; 0x10];
        let mut rs = MemoryStream::borrowed(&data);
        assert!(matches!(
            sha256_part(&mut rs, 0x20),
            Err(Error::ShortRead { .. })
        ));
    }

    #[test]
    fn hashing_writer_matches_direct_hash() {
        let mut writer = HashingWriter::new(MemoryWriteStream::new());
        writer.write(b"hello ").unwrap();
        writer.write(b"world").unwrap();
        let (inner, hash) = writer.finalize();
        assert_eq!(inner.into_inner(), b"hello world");
        assert_eq!(hash, sha256(b"hello world"));
    }
}
