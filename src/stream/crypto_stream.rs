use crate::error::{Error, InvalidOperationSnafu, SeekRangeSnafu, UnalignedSnafu};
use crate::pki::Key128;
use crate::stream::ReadStream;
use crate::utils::{align_down, is_aligned};
use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use snafu::{ensure, OptionExt};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

const BLOCK_SIZE: u64 = 0x10;

/// A wrapper around a [`ReadStream`], decrypting its contents with AES-128-CTR.
///
/// Reads and seeks must stay aligned on the AES block size. The counter for
/// the block at byte offset `n` of the child is `ctr + n / 16`.
pub struct CryptoStream<R> {
    stream: R,
    key: Key128,
    ctr: Key128,
    // None once closed.
    cipher: Option<Aes128Ctr>,
}

impl<R: ReadStream> CryptoStream<R> {
    pub fn new(stream: R, key: Key128, ctr: Key128) -> CryptoStream<R> {
        let cipher = Some(Self::cipher_at(&key, &ctr, 0));
        CryptoStream {
            stream,
            key,
            ctr,
            cipher,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.stream
    }

    pub fn into_inner(self) -> R {
        self.stream
    }

    fn cipher_at(key: &Key128, ctr: &Key128, offset: u64) -> Aes128Ctr {
        let ctr = *ctr + Key128::from(u128::from(offset / BLOCK_SIZE));
        Aes128Ctr::new(&key.to_be_bytes().into(), &ctr.to_be_bytes().into())
    }
}

impl<R> std::fmt::Debug for CryptoStream<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoStream")
            .field("ctr", &self.ctr)
            .field("closed", &self.cipher.is_none())
            .finish()
    }
}

impl<R: ReadStream> ReadStream for CryptoStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let cipher = self.cipher.as_mut().context(InvalidOperationSnafu {
            reason: "stream is closed",
        })?;

        let read = self.stream.read(buf)?;
        ensure!(
            is_aligned(buf.len() as u64, BLOCK_SIZE),
            UnalignedSnafu {
                offset: buf.len() as u64
            }
        );

        // Near the end of the child we may get a partial block. It can't be
        // decrypted on its own, so drop it.
        let len = align_down(read, BLOCK_SIZE as usize);
        cipher.apply_keystream(&mut buf[..len]);
        Ok(len)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        ensure!(is_aligned(pos, BLOCK_SIZE), UnalignedSnafu { offset: pos });
        let size = self.stream.size();
        ensure!(pos < size, SeekRangeSnafu { pos, size });
        if pos != self.stream.tell() {
            self.stream.seek_abs(pos)?;
            if self.cipher.is_some() {
                self.cipher = Some(Self::cipher_at(&self.key, &self.ctr, pos));
            }
        }
        Ok(())
    }

    fn size(&self) -> u64 {
        self.stream.size()
    }

    fn tell(&self) -> u64 {
        self.stream.tell()
    }

    fn close(&mut self) {
        self.cipher = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::{MemoryStream, Subview};

    fn key() -> Key128 {
        Key128::new(0x000102030405060708090A0B0C0D0E0F)
    }

    fn ctr() -> Key128 {
        Key128::new(0xF0F1F2F3F4F5F6F7F8F9FAFBFCFDFEFF)
    }

    fn plaintext(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7) as u8).collect()
    }

    fn encrypt(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        key().apply_ctr(&mut out, &ctr());
        out
    }

    #[test]
    fn decrypts_reference_ciphertext() {
        for len in [0x10, 0x30, 0x200, 0x1230] {
            let plain = plaintext(len);
            let cipher = encrypt(&plain);
            let mut child = MemoryStream::borrowed(&cipher);
            let mut rs = CryptoStream::new(&mut child, key(), ctr());
            let mut buf = vec![0; len];
            assert_eq!(rs.read(&mut buf).unwrap(), len);
            assert_eq!(buf, plain);
        }
    }

    #[test]
    fn reseek_recomputes_counter() {
        let plain = plaintext(0x400);
        let cipher = encrypt(&plain);
        let mut rs = CryptoStream::new(MemoryStream::borrowed(&cipher), key(), ctr());

        let mut buf = [0; 0x20];
        rs.seek_abs(0x1F0).unwrap();
        rs.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &plain[0x1F0..0x210]);

        rs.seek_rel(-0x100).unwrap();
        assert_eq!(rs.tell(), 0x110);
        rs.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &plain[0x110..0x130]);
    }

    #[test]
    fn misaligned_seeks_fail_and_keep_position() {
        let cipher = encrypt(&plaintext(0x100));
        let mut rs = CryptoStream::new(MemoryStream::borrowed(&cipher), key(), ctr());
        rs.seek_abs(0x20).unwrap();
        assert!(matches!(rs.seek_abs(0x21), Err(Error::Unaligned { .. })));
        assert!(matches!(rs.seek_rel(8), Err(Error::Unaligned { .. })));
        assert_eq!(rs.tell(), 0x20);
    }

    #[test]
    fn seek_to_end_is_out_of_range() {
        let plain = plaintext(0x40);
        let cipher = encrypt(&plain);
        let mut rs = CryptoStream::new(MemoryStream::borrowed(&cipher), key(), ctr());
        let mut buf = [0; 0x40];
        assert_eq!(rs.read(&mut buf).unwrap(), 0x40);
        assert_eq!(rs.tell(), 0x40);
        assert!(matches!(rs.seek_abs(0x40), Err(Error::SeekRange { .. })));
        assert!(matches!(rs.seek_abs(0x80), Err(Error::SeekRange { .. })));
        assert_eq!(rs.tell(), 0x40);

        rs.seek_abs(0x30).unwrap();
        assert_eq!(rs.read(&mut buf[..0x10]).unwrap(), 0x10);
        assert_eq!(&buf[..0x10], &plain[0x30..0x40]);
    }

    #[test]
    fn misaligned_read_fails_after_consuming_child() {
        let cipher = encrypt(&plaintext(0x100));
        let mut rs = CryptoStream::new(MemoryStream::borrowed(&cipher), key(), ctr());
        let mut buf = [0; 0x11];
        assert!(matches!(rs.read(&mut buf), Err(Error::Unaligned { .. })));
        assert_eq!(rs.tell(), 0x11);
    }

    #[test]
    fn trailing_partial_block_is_dropped() {
        let plain = plaintext(0x28);
        let cipher = encrypt(&plain);
        let mut rs = CryptoStream::new(MemoryStream::borrowed(&cipher), key(), ctr());
        let mut buf = [0; 0x30];
        assert_eq!(rs.read(&mut buf).unwrap(), 0x20);
        assert_eq!(&buf[..0x20], &plain[..0x20]);
    }

    #[test]
    fn counter_is_relative_to_window() {
        // Encrypt only the window so offset 0 of the view uses the initial counter.
        let mut data = plaintext(0x300);
        let plain_window = data[0x100..0x200].to_vec();
        key().apply_ctr(&mut data[0x100..0x200], &ctr());

        let mut child = MemoryStream::borrowed(&data);
        let view = Subview::new(&mut child, 0x100, 0x100);
        let mut rs = CryptoStream::new(view, key(), ctr());
        rs.seek_abs(0x40).unwrap();
        let mut buf = [0; 0x40];
        rs.read(&mut buf).unwrap();
        assert_eq!(&buf[..], &plain_window[0x40..0x80]);
        assert_eq!(rs.size(), 0x100);
    }

    #[test]
    fn close_leaves_child_open() {
        let cipher = encrypt(&plaintext(0x40));
        let mut child = MemoryStream::owned(cipher);
        {
            let mut rs = CryptoStream::new(&mut child, key(), ctr());
            rs.close();
            let mut buf = [0; 0x10];
            assert!(matches!(
                rs.read(&mut buf),
                Err(Error::InvalidOperation { .. })
            ));
        }
        assert_eq!(child.size(), 0x40);
    }
}
