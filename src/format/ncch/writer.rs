use crate::crypto::{sha256, HashingWriter, Sha256Hash};
use crate::error::{Error, InvalidOperationSnafu, SectionTooSmallSnafu, UnsupportedSnafu};
use crate::format::exefs::ExefsPacker;
use crate::format::ncch::structures::{NcchHeader, MEDIA_UNIT, NCCH_HEADER_SIZE};
use crate::format::vfs::{DirectoryPacker, VirtualDirectory};
use crate::stream::{self, ReadStream, WriteStream};
use crate::utils::align_up;
use log::debug;
use snafu::{ensure, OptionExt};
use std::cmp::min;

/// Where the contents of an ExeFS or RomFS come from.
pub enum SectionSource<'a> {
    /// A ready-made section image, copied as is.
    Stream(&'a mut dyn ReadStream),
    /// A directory, serialized by a [`DirectoryPacker`] while writing.
    Directory(&'a dyn VirtualDirectory),
}

/// Captures the first `limit` bytes written through it.
struct PrefixWriter<W> {
    inner: W,
    limit: usize,
    prefix: Vec<u8>,
}

impl<W: WriteStream> PrefixWriter<W> {
    fn new(inner: W, limit: usize) -> PrefixWriter<W> {
        PrefixWriter {
            inner,
            limit,
            prefix: Vec::with_capacity(limit),
        }
    }
}

impl<W: WriteStream> WriteStream for PrefixWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<(), Error> {
        self.inner.write(buf)?;
        let missing = self.limit - self.prefix.len();
        self.prefix.extend_from_slice(&buf[..min(missing, buf.len())]);
        Ok(())
    }

    fn tell(&self) -> u64 {
        self.inner.tell()
    }
}

/// Placement of a written section, relative to the start of the container.
#[derive(Debug, Default, Clone, Copy)]
struct Placement {
    offset: u32,
    size: u32,
}

/// Lays out a plaintext NCCH.
///
/// Sections are written in order: extended header, logo, plain region,
/// ExeFS, RomFS. Each one is padded to a media unit. The header is written
/// last, from the template given to [`NcchWriter::new`] with every offset,
/// size and hash replaced.
///
/// ```no_run
/// # use ctrkit::error::Error;
/// # fn main() -> Result<(), Error> {
/// use ctrkit::format::ncch::{NcchHeader, NcchWriter, SectionSource};
/// use ctrkit::format::vfs::Vfs;
/// use ctrkit::stream::{FileStream, FileWriteStream};
///
/// let mut exheader = FileStream::open("exheader.bin")?;
/// let mut romfs = FileStream::open("romfs.bin")?;
/// let mut exefs = Vfs::new();
/// exefs.add_host_file("/.code", "code.bin")?;
///
/// let mut out = FileWriteStream::create("out.cxi")?;
/// NcchWriter::new(NcchHeader::default())
///     .exheader(&mut exheader)
///     .exefs(SectionSource::Directory(&exefs))
///     .romfs(SectionSource::Stream(&mut romfs))
///     .write(&mut out)?;
/// # Ok(())
/// # }
/// ```
pub struct NcchWriter<'a> {
    template: NcchHeader,
    exheader: Option<&'a mut dyn ReadStream>,
    logo: Option<&'a mut dyn ReadStream>,
    plain: Option<&'a mut dyn ReadStream>,
    exefs: Option<SectionSource<'a>>,
    romfs: Option<SectionSource<'a>>,
    romfs_packer: Option<&'a dyn DirectoryPacker>,
}

impl<'a> NcchWriter<'a> {
    pub fn new(template: NcchHeader) -> NcchWriter<'a> {
        NcchWriter {
            template,
            exheader: None,
            logo: None,
            plain: None,
            exefs: None,
            romfs: None,
            romfs_packer: None,
        }
    }

    pub fn exheader(mut self, rs: &'a mut dyn ReadStream) -> Self {
        self.exheader = Some(rs);
        self
    }

    pub fn logo(mut self, rs: &'a mut dyn ReadStream) -> Self {
        self.logo = Some(rs);
        self
    }

    pub fn plain_region(mut self, rs: &'a mut dyn ReadStream) -> Self {
        self.plain = Some(rs);
        self
    }

    pub fn exefs(mut self, source: SectionSource<'a>) -> Self {
        self.exefs = Some(source);
        self
    }

    pub fn romfs(mut self, source: SectionSource<'a>) -> Self {
        self.romfs = Some(source);
        self
    }

    /// Packer used when the RomFS comes from a directory.
    pub fn romfs_packer(mut self, packer: &'a dyn DirectoryPacker) -> Self {
        self.romfs_packer = Some(packer);
        self
    }

    /// Write the container at the current position of `ws`, and return the
    /// header that was written. On success `ws` is left at the end of the
    /// container.
    pub fn write(self, ws: &mut dyn WriteStream) -> Result<NcchHeader, Error> {
        ensure!(
            ws.is_seekable(),
            InvalidOperationSnafu {
                reason: "output stream must be seekable",
            }
        );
        let NcchWriter {
            mut template,
            exheader,
            logo,
            plain,
            exefs,
            romfs,
            romfs_packer,
        } = self;
        let exheader = exheader.context(InvalidOperationSnafu {
            reason: "an extended header is required",
        })?;
        if let (Some(SectionSource::Directory(_)), None) = (&romfs, romfs_packer) {
            return UnsupportedSnafu {
                what: "building a RomFS from a directory without a packer",
            }
            .fail();
        }

        let start = ws.tell();
        ws.write_zeroes(NCCH_HEADER_SIZE as u64)?;

        let exheader_len = exheader.size();
        ensure!(
            exheader_len != 0,
            SectionTooSmallSnafu {
                section: "extended header",
                size: 0u64
            }
        );
        let (_, exheader_hash) = write_exheader(ws, start, exheader)?;
        template.exheader_hash = exheader_hash;
        template.exheader_size = u32_field(exheader_len / 2)?;

        let mut logo_hash = Sha256Hash::default();
        let logo = match logo {
            Some(rs) if rs.size() != 0 => {
                let (placement, hash) = write_hashed(ws, start, rs, "logo")?;
                logo_hash = hash;
                placement
            }
            _ => Placement::default(),
        };
        template.logo_hash = logo_hash;

        let plain = match plain {
            Some(rs) if rs.size() != 0 => write_hashed(ws, start, rs, "plain region")?.0,
            _ => Placement::default(),
        };

        let exefs = match exefs {
            Some(source) => Some(write_superblock_hashed(
                ws,
                start,
                source,
                Some(&ExefsPacker),
                "ExeFS",
            )?),
            None => None,
        };
        let romfs = match romfs {
            Some(source) => Some(write_superblock_hashed(
                ws,
                start,
                source,
                romfs_packer,
                "RomFS",
            )?),
            None => None,
        };

        let end = ws.tell();
        let header = patch_header(template, (end - start) / MEDIA_UNIT, logo, plain, exefs, romfs)?;
        debug!(
            "Writing NCCH header for {} ({:#x} bytes)",
            header.title_id,
            end - start
        );
        ws.seek_abs(start)?;
        ws.write(&header.to_bytes()?)?;
        ws.seek_abs(end)?;
        Ok(header)
    }
}

fn u32_field(value: u64) -> Result<u32, Error> {
    u32::try_from(value).ok().context(InvalidOperationSnafu {
        reason: "container is too large",
    })
}

fn placement(start: u64, section_start: u64, section_end: u64) -> Result<Placement, Error> {
    Ok(Placement {
        offset: u32_field((section_start - start) / MEDIA_UNIT)?,
        size: u32_field((section_end - section_start) / MEDIA_UNIT)?,
    })
}

fn pad_to_media_unit(ws: &mut dyn WriteStream, start: u64) -> Result<(), Error> {
    let len = ws.tell() - start;
    ws.write_zeroes(align_up(len, MEDIA_UNIT) - len)
}

/// Copy `rs` and hash its exact content.
fn write_hashed(
    ws: &mut dyn WriteStream,
    start: u64,
    rs: &mut dyn ReadStream,
    name: &str,
) -> Result<(Placement, Sha256Hash), Error> {
    let section_start = ws.tell();
    debug!(
        "Writing {} at {:#x} ({:#x} bytes)",
        name,
        section_start - start,
        rs.size()
    );
    let mut hw = HashingWriter::new(&mut *ws);
    stream::copy(rs, &mut hw)?;
    let (_, hash) = hw.finalize();
    pad_to_media_unit(ws, start)?;
    Ok((placement(start, section_start, ws.tell())?, hash))
}

/// Copy the extended header. Only its first half, the part counted by the
/// size field, is hashed.
fn write_exheader(
    ws: &mut dyn WriteStream,
    start: u64,
    rs: &mut dyn ReadStream,
) -> Result<(Placement, Sha256Hash), Error> {
    let section_start = ws.tell();
    let hashed_len = rs.size() / 2;
    debug!(
        "Writing extended header at {:#x} ({:#x} bytes, {:#x} hashed)",
        section_start - start,
        rs.size(),
        hashed_len
    );
    let mut pw = PrefixWriter::new(&mut *ws, hashed_len as usize);
    stream::copy(rs, &mut pw)?;
    let hash = sha256(&pw.prefix);
    pad_to_media_unit(ws, start)?;
    Ok((placement(start, section_start, ws.tell())?, hash))
}

/// Write a section and hash its first media unit.
fn write_superblock_hashed(
    ws: &mut dyn WriteStream,
    start: u64,
    source: SectionSource<'_>,
    packer: Option<&dyn DirectoryPacker>,
    name: &'static str,
) -> Result<(Placement, Sha256Hash), Error> {
    let section_start = ws.tell();
    let mut sw = PrefixWriter::new(&mut *ws, MEDIA_UNIT as usize);
    match source {
        SectionSource::Stream(rs) => {
            debug!(
                "Writing {} at {:#x} ({:#x} bytes)",
                name,
                section_start - start,
                rs.size()
            );
            ensure!(
                rs.size() >= MEDIA_UNIT,
                SectionTooSmallSnafu {
                    section: name,
                    size: rs.size()
                }
            );
            stream::copy(rs, &mut sw)?;
        }
        SectionSource::Directory(dir) => {
            let packer = packer.context(UnsupportedSnafu {
                what: "building a section from a directory without a packer",
            })?;
            let len = packer.pack(dir, &mut sw)?;
            debug!(
                "Packed {} at {:#x} ({:#x} bytes)",
                name,
                section_start - start,
                len
            );
        }
    }
    let superblock = sw.prefix;
    ensure!(
        superblock.len() as u64 == MEDIA_UNIT,
        SectionTooSmallSnafu {
            section: name,
            size: superblock.len() as u64
        }
    );
    pad_to_media_unit(ws, start)?;
    Ok((placement(start, section_start, ws.tell())?, sha256(&superblock)))
}

fn patch_header(
    mut header: NcchHeader,
    content_size: u64,
    logo: Placement,
    plain: Placement,
    exefs: Option<(Placement, Sha256Hash)>,
    romfs: Option<(Placement, Sha256Hash)>,
) -> Result<NcchHeader, Error> {
    header.content_size = u32_field(content_size)?;
    header.logo_offset = logo.offset;
    header.logo_size = logo.size;
    header.plain_offset = plain.offset;
    header.plain_size = plain.size;

    let (exefs, exefs_hash) = exefs.unwrap_or_default();
    header.exefs_offset = exefs.offset;
    header.exefs_size = exefs.size;
    header.exefs_hash_size = u32::from(exefs.size != 0);
    header.exefs_hash = exefs_hash;

    let (romfs, romfs_hash) = romfs.unwrap_or_default();
    header.romfs_offset = romfs.offset;
    header.romfs_size = romfs.size;
    header.romfs_hash_size = u32::from(romfs.size != 0);
    header.romfs_hash = romfs_hash;

    header
        .flags
        .set_no_crypto(true)
        .set_fixed_key(false)
        .set_seed(false)
        .set_no_romfs(romfs.size == 0);
    Ok(header)
}
