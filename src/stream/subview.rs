use crate::error::{Error, SeekRangeSnafu};
use crate::stream::ReadStream;
use snafu::ensure;
use std::cmp::min;

/// A window of `size` bytes starting at `offset` in another stream.
///
/// Positions are relative to the window. The child is re-seeked before every
/// read, so several views may share one child as long as only one is used at
/// a time. Closing a view leaves the child open.
#[derive(Debug)]
pub struct Subview<R> {
    inner: R,
    offset: u64,
    size: u64,
    pos: u64,
}

impl<R: ReadStream> Subview<R> {
    pub fn new(inner: R, offset: u64, size: u64) -> Subview<R> {
        Subview {
            inner,
            offset,
            size,
            pos: 0,
        }
    }

    /// Offset of the window in the child stream.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: ReadStream> ReadStream for Subview<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        // Avoid reading out of the window's bound, or past the end of a
        // child shorter than the window.
        let child_left = self.inner.size().saturating_sub(self.offset + self.pos);
        let left = min(self.size.saturating_sub(self.pos), child_left);
        let len = min(buf.len() as u64, left) as usize;
        if len == 0 {
            return Ok(0);
        }
        self.inner.seek_abs(self.offset + self.pos)?;
        let read = self.inner.read(&mut buf[..len])?;
        self.pos += read as u64;
        Ok(read)
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        ensure!(pos < self.size, SeekRangeSnafu { pos, size: self.size });
        self.pos = pos;
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn tell(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::MemoryStream;

    fn backing() -> Vec<u8> {
        (0..0x100u32).map(|i| i as u8).collect()
    }

    #[test]
    fn reads_stay_inside_window() {
        let data = backing();
        let mut child = MemoryStream::borrowed(&data);
        let mut view = Subview::new(&mut child, 0x10, 0x20);
        assert_eq!(view.size(), 0x20);

        let mut buf = [0; 0x40];
        assert_eq!(view.read(&mut buf).unwrap(), 0x20);
        assert_eq!(&buf[..0x20], &data[0x10..0x30]);
        assert_eq!(view.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn size_ignores_child_size() {
        let data = backing();
        let view = Subview::new(MemoryStream::borrowed(&data), 0xF0, 0x8);
        assert_eq!(view.size(), 0x8);
    }

    #[test]
    fn seeks_are_window_relative() {
        let data = backing();
        let mut view = Subview::new(MemoryStream::borrowed(&data), 0x40, 0x10);
        view.seek_abs(0xC).unwrap();
        let mut buf = [0; 8];
        assert_eq!(view.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &data[0x4C..0x50]);

        assert!(matches!(view.seek_abs(0x10), Err(Error::SeekRange { .. })));
        assert_eq!(view.tell(), 0x10);
        view.seek_abs(0).unwrap();
        view.seek_rel(3).unwrap();
        assert_eq!(view.tell(), 3);
    }

    #[test]
    fn window_past_child_end_reads_short() {
        let data = backing();
        let mut view = Subview::new(MemoryStream::borrowed(&data), 0xF0, 0x40);
        assert_eq!(view.size(), 0x40);
        let mut buf = [0; 0x20];
        assert_eq!(view.read(&mut buf).unwrap(), 0x10);
        assert_eq!(&buf[..0x10], &data[0xF0..]);
        assert_eq!(view.read(&mut buf).unwrap(), 0);
        assert!(matches!(
            view.read_exact(&mut buf),
            Err(Error::ShortRead { got: 0, .. })
        ));
    }

    #[test]
    fn closing_view_keeps_child_open() {
        let data = backing();
        let mut child = MemoryStream::owned(data.clone());
        {
            let mut view = Subview::new(&mut child, 0, 4);
            view.close();
        }
        assert_eq!(child.size(), 0x100);
    }
}
