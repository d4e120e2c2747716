//! Byte-addressable streams
//!
//! Everything in this crate reads through [`ReadStream`] and writes through
//! [`WriteStream`]. Unlike `std::io::Seek`, seeking a [`ReadStream`] at or
//! past its end is an error, and a read only comes back short at end of
//! stream. Streams compose: a [`Subview`] restricts another stream to a
//! window, and a [`CryptoStream`] decrypts another stream on the fly.
//!
//! Wrappers never close the stream they wrap. Whoever opened a stream is
//! responsible for closing it.

mod crypto_stream;
mod subview;

pub use self::crypto_stream::CryptoStream;
pub use self::subview::Subview;

use crate::error::{Error, InvalidOperationSnafu, ResultExt, SeekRangeSnafu, ShortReadSnafu};
use snafu::{ensure, OptionExt};
use std::borrow::Cow;
use std::cmp::min;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const COPY_BLOCK_SIZE: usize = 0x10000;

pub trait ReadStream {
    /// Read up to `buf.len()` bytes, returning how many were read. Fewer bytes
    /// are only returned at the end of the stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    /// Move to `pos`. Fails if `pos` is at or past [`ReadStream::size`], in
    /// which case the position is left untouched.
    fn seek_abs(&mut self, pos: u64) -> Result<(), Error>;

    fn seek_rel(&mut self, offset: i64) -> Result<(), Error> {
        let pos = self.tell().checked_add_signed(offset).context(SeekRangeSnafu {
            pos: 0u64,
            size: self.size(),
        })?;
        self.seek_abs(pos)
    }

    fn size(&self) -> u64;

    fn tell(&self) -> u64;

    fn close(&mut self) {}

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), Error> {
        let got = self.read(buf)?;
        ensure!(
            got == buf.len(),
            ShortReadSnafu {
                expected: buf.len() as u64,
                got: got as u64,
            }
        );
        Ok(())
    }

    fn read_at_exact(&mut self, offset: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.seek_abs(offset)?;
        self.read_exact(buf)
    }
}

impl<S: ReadStream + ?Sized> ReadStream for &mut S {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read(buf)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        (**self).seek_abs(pos)
    }

    fn seek_rel(&mut self, offset: i64) -> Result<(), Error> {
        (**self).seek_rel(offset)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<S: ReadStream + ?Sized> ReadStream for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        (**self).read(buf)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        (**self).seek_abs(pos)
    }

    fn seek_rel(&mut self, offset: i64) -> Result<(), Error> {
        (**self).seek_rel(offset)
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

pub trait WriteStream {
    /// Write all of `buf`. There are no partial writes.
    fn write(&mut self, buf: &[u8]) -> Result<(), Error>;

    fn tell(&self) -> u64;

    fn is_seekable(&self) -> bool {
        false
    }

    fn seek_abs(&mut self, _pos: u64) -> Result<(), Error> {
        InvalidOperationSnafu {
            reason: "stream is not seekable",
        }
        .fail()
    }

    fn close(&mut self) {}

    fn write_zeroes(&mut self, count: u64) -> Result<(), Error> {
        let zeroes = [0; 0x200];
        let mut left = count;
        while left != 0 {
            let next = min(left, zeroes.len() as u64) as usize;
            self.write(&zeroes[..next])?;
            left -= next as u64;
        }
        Ok(())
    }
}

impl<W: WriteStream + ?Sized> WriteStream for &mut W {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        (**self).write(buf)
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        (**self).seek_abs(pos)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

impl<W: WriteStream + ?Sized> WriteStream for Box<W> {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        (**self).write(buf)
    }

    fn tell(&self) -> u64 {
        (**self).tell()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        (**self).seek_abs(pos)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

fn closed() -> Error {
    InvalidOperationSnafu {
        reason: "stream is closed",
    }
    .build()
}

/// A read-only file on the host filesystem.
#[derive(Debug)]
pub struct FileStream {
    file: Option<File>,
    size: u64,
    pos: u64,
}

impl FileStream {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<FileStream, Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| (err, path))?;
        FileStream::from_file(file).with_path(path)
    }

    pub fn from_file(mut file: File) -> Result<FileStream, Error> {
        let size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(FileStream {
            file: Some(file),
            size,
            pos: 0,
        })
    }
}

impl ReadStream for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(read) => total += read,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
        }
        self.pos += total as u64;
        Ok(total)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        ensure!(pos < self.size, SeekRangeSnafu { pos, size: self.size });
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn close(&mut self) {
        self.file = None;
    }
}

/// A stream over a memory buffer, either borrowed or owned. Closing an owned
/// stream frees its buffer.
#[derive(Debug, Clone)]
pub struct MemoryStream<'a> {
    data: Cow<'a, [u8]>,
    pos: u64,
}

impl<'a> MemoryStream<'a> {
    pub fn borrowed(data: &'a [u8]) -> MemoryStream<'a> {
        MemoryStream {
            data: Cow::Borrowed(data),
            pos: 0,
        }
    }

    pub fn owned(data: Vec<u8>) -> MemoryStream<'static> {
        MemoryStream {
            data: Cow::Owned(data),
            pos: 0,
        }
    }

    pub fn get_ref(&self) -> &[u8] {
        &self.data
    }
}

impl<'a> ReadStream for MemoryStream<'a> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let start = min(self.pos, self.data.len() as u64) as usize;
        let len = min(buf.len(), self.data.len() - start);
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        self.pos += len as u64;
        Ok(len)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        ensure!(
            pos < self.size(),
            SeekRangeSnafu {
                pos,
                size: self.size()
            }
        );
        self.pos = pos;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn close(&mut self) {
        self.data = Cow::Borrowed(&[]);
        self.pos = 0;
    }
}

/// A writable, seekable file on the host filesystem. Existing files are
/// truncated.
#[derive(Debug)]
pub struct FileWriteStream {
    file: Option<File>,
    pos: u64,
}

impl FileWriteStream {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<FileWriteStream, Error> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|err| (err, path))?;
        Ok(FileWriteStream {
            file: Some(file),
            pos: 0,
        })
    }
}

impl WriteStream for FileWriteStream {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        let file = self.file.as_mut().ok_or_else(closed)?;
        file.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.flush() {
                log::warn!("Failed to flush output file: {}", err);
            }
        }
    }
}

/// A growable, seekable in-memory output. Seeking past the end and writing
/// fills the gap with zeroes.
#[derive(Debug, Default, Clone)]
pub struct MemoryWriteStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryWriteStream {
    pub fn new() -> MemoryWriteStream {
        MemoryWriteStream::default()
    }

    pub fn get_ref(&self) -> &[u8] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl WriteStream for MemoryWriteStream {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        let end = self.pos + buf.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[self.pos..end].copy_from_slice(buf);
        self.pos = end;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos as u64
    }

    fn is_seekable(&self) -> bool {
        true
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        self.pos = pos as usize;
        Ok(())
    }
}

/// Forward-only adapter over any [`std::io::Write`], such as a pipe or
/// socket.
#[derive(Debug)]
pub struct IoWriteStream<W> {
    inner: W,
    pos: u64,
}

impl<W: Write> IoWriteStream<W> {
    pub fn new(inner: W) -> IoWriteStream<W> {
        IoWriteStream { inner, pos: 0 }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> WriteStream for IoWriteStream<W> {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.pos
    }
}

/// Copy the whole of `from`, starting at offset 0, into `to`.
///
/// Fails with [`Error::ShortRead`] if `from` yields less data than its
/// declared size.
pub fn copy(from: &mut dyn ReadStream, to: &mut dyn WriteStream) -> Result<(), Error> {
    let mut left = from.size();
    if left == 0 {
        return Ok(());
    }
    from.seek_abs(0)?;

    let mut block = vec![0; min(left, COPY_BLOCK_SIZE as u64) as usize];
    while left != 0 {
        let next = min(left, COPY_BLOCK_SIZE as u64) as usize;
        from.read_exact(&mut block[..next])?;
        to.write(&block[..next])?;
        left -= next as u64;
    }
    Ok(())
}
