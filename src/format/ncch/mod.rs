//! NCCH Parsing
//!
//! NCCH is the content container of the 3DS. Every application, system
//! module and data archive is stored in one, usually itself nested in a CIA
//! or a CCI. An NCCH holds up to five regions after its header:
//!
//! - the extended header, describing the title's runtime capabilities;
//! - the logo and the plain region, which are never encrypted;
//! - the ExeFS, holding the code, icon and banner;
//! - the RomFS, a read-only filesystem.
//!
//! The extended header, ExeFS and RomFS are encrypted with AES-CTR, unless
//! the no-crypto flag is set. To open them, use [`Ncch::open_section`]:
//!
//! ```no_run
//! # use ctrkit::error::Error;
//! # fn main() -> Result<(), Error> {
//! use ctrkit::format::ncch::{Ncch, Section};
//! use ctrkit::pki::{Keyset, SeedDb};
//! use ctrkit::stream::{FileStream, ReadStream};
//!
//! let mut keyset = Keyset::new();
//! keyset.load_boot9_file("boot9.bin", false)?;
//! keyset.load_defaults(false)?;
//! let seeddb = SeedDb::scan()?;
//!
//! let mut ncch = Ncch::from_stream(FileStream::open("game.cxi")?)?;
//! let mut romfs = ncch.open_section(Section::Romfs, &keyset, Some(&seeddb))?;
//! let mut superblock = [0; 0x200];
//! romfs.read_exact(&mut superblock)?;
//! # Ok(())
//! # }
//! ```
//!
//! For more information about the format, see the [3dbrew page].
//!
//! [3dbrew page]: https://www.3dbrew.org/wiki/NCCH

mod structures;
mod writer;

pub use self::structures::{
    media_to_bytes, CryptMethod, NcchFlags, NcchHeader, Section, Signature, EXHEADER_OFFSET,
    MEDIA_UNIT, NCCH_HEADER_SIZE,
};
pub use self::writer::{NcchWriter, SectionSource};

use crate::crypto::{sha256, sha256_part};
use crate::error::{
    Error, InvalidExefsSnafu, InvalidOperationSnafu, MissingExefsFileSnafu, MissingSectionSnafu,
    MissingSeedSnafu, SectionTooSmallSnafu, SeedHashMismatchSnafu, UnsupportedVersionSnafu,
};
use crate::format::exefs::ExefsHeader;
use crate::pki::{hwkgen, Key128, KeyName, Keyset, SeedDb, FIXED_SYSTEM_KEY, FIXED_ZERO_KEY};
use crate::stream::{CryptoStream, ReadStream, Subview};
use crate::utils::align_up;
use log::debug;
use snafu::{ensure, OptionExt};

/// Initial AES-CTR counter of a section.
///
/// Versions 0 and 2 put the partition id (big-endian) in the high half and
/// the section tag in the next byte. Version 1 puts the partition id
/// (little-endian) in the high half and the byte offset of the section in
/// the low 32 bits.
pub fn section_ctr(header: &NcchHeader, section: Section) -> Result<Key128, Error> {
    ensure_encrypted(header)?;
    let ctr = match header.version {
        0 | 2 => (u128::from(header.partition_id) << 64) | ((section as u128) << 56),
        1 => {
            let offset = match section {
                Section::ExtendedHeader => EXHEADER_OFFSET,
                Section::Exefs => media_to_bytes(header.exefs_offset),
                Section::Romfs => media_to_bytes(header.romfs_offset),
            };
            (u128::from(header.partition_id.swap_bytes()) << 64) | u128::from(offset as u32)
        }
        version => return UnsupportedVersionSnafu { version }.fail(),
    };
    Ok(Key128::from(ctr))
}

/// Resolve the KeyY of a container, applying its seed if it uses one.
pub fn derive_key_y(header: &NcchHeader, seeddb: Option<&SeedDb>) -> Result<Key128, Error> {
    let key_y = header.key_y();
    if !header.flags.seed() {
        return Ok(key_y);
    }

    let title_id = header.title_id;
    let seed = seeddb
        .and_then(|db| db.find(title_id))
        .context(MissingSeedSnafu { title_id })?;

    let mut check = [0; 0x18];
    check[..0x10].copy_from_slice(&seed.0);
    check[0x10..].copy_from_slice(&title_id.0.to_le_bytes());
    ensure!(
        sha256(&check).0[..4] == header.seed_hash,
        SeedHashMismatchSnafu { title_id }
    );

    let mut buf = [0; 0x20];
    buf[..0x10].copy_from_slice(&key_y.to_be_bytes());
    buf[0x10..].copy_from_slice(&seed.0);
    debug!("Using seed for title {}", title_id);
    Ok(Key128::from_be_slice(&sha256(&buf).0))
}

fn fixed_key(header: &NcchHeader) -> Key128 {
    if header.title_id.is_system() {
        FIXED_SYSTEM_KEY
    } else {
        FIXED_ZERO_KEY
    }
}

fn ensure_encrypted(header: &NcchHeader) -> Result<(), Error> {
    ensure!(
        !header.flags.no_crypto(),
        InvalidOperationSnafu {
            reason: "container is not encrypted",
        }
    );
    Ok(())
}

/// Derive the secondary key, used for the RomFS and the ExeFS code.
pub fn content_key(
    header: &NcchHeader,
    keyset: &Keyset,
    seeddb: Option<&SeedDb>,
) -> Result<Key128, Error> {
    ensure_encrypted(header)?;
    if header.flags.fixed_key() {
        debug!("Using fixed key (system: {})", header.title_id.is_system());
        return Ok(fixed_key(header));
    }

    let key_y = derive_key_y(header, seeddb)?;
    let method = header.crypt_method()?;
    debug!("Deriving content key with {:?}", method);
    let key_x = keyset.keyx(method.keyx_slot())?;
    Ok(hwkgen(key_x, key_y))
}

/// Derive the primary key, used for the extended header, the ExeFS header,
/// and the icon and banner.
pub fn menu_info_key(
    header: &NcchHeader,
    keyset: &Keyset,
    seeddb: Option<&SeedDb>,
) -> Result<Key128, Error> {
    ensure_encrypted(header)?;
    if header.flags.fixed_key() {
        return Ok(fixed_key(header));
    }

    let key_y = derive_key_y(header, seeddb)?;
    let key_x = keyset.keyx(KeyName::Slot0x2CKeyX)?;
    Ok(hwkgen(key_x, key_y))
}

/// Both keys of an encrypted container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NcchKeyPair {
    pub primary: Key128,
    pub secondary: Key128,
}

impl NcchKeyPair {
    pub fn derive(
        header: &NcchHeader,
        keyset: &Keyset,
        seeddb: Option<&SeedDb>,
    ) -> Result<NcchKeyPair, Error> {
        Ok(NcchKeyPair {
            primary: menu_info_key(header, keyset, seeddb)?,
            secondary: content_key(header, keyset, seeddb)?,
        })
    }
}

/// A readable view of an NCCH section, decrypted if needed.
pub enum SectionStream<R> {
    Plain(Subview<R>),
    Encrypted(CryptoStream<Subview<R>>),
}

impl<R: ReadStream> SectionStream<R> {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, SectionStream::Encrypted(_))
    }

    /// Offset of the section in the container.
    pub fn offset(&self) -> u64 {
        match self {
            SectionStream::Plain(view) => view.offset(),
            SectionStream::Encrypted(crypto) => crypto.get_ref().offset(),
        }
    }
}

impl<R: ReadStream> ReadStream for SectionStream<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        match self {
            SectionStream::Plain(rs) => rs.read(buf),
            SectionStream::Encrypted(rs) => rs.read(buf),
        }
    }

    fn seek_abs(&mut self, pos: u64) -> Result<(), Error> {
        match self {
            SectionStream::Plain(rs) => rs.seek_abs(pos),
            SectionStream::Encrypted(rs) => rs.seek_abs(pos),
        }
    }

    fn size(&self) -> u64 {
        match self {
            SectionStream::Plain(rs) => rs.size(),
            SectionStream::Encrypted(rs) => rs.size(),
        }
    }

    fn tell(&self) -> u64 {
        match self {
            SectionStream::Plain(rs) => rs.tell(),
            SectionStream::Encrypted(rs) => rs.tell(),
        }
    }

    fn close(&mut self) {
        match self {
            SectionStream::Plain(rs) => rs.close(),
            SectionStream::Encrypted(rs) => rs.close(),
        }
    }
}

#[derive(Debug)]
pub struct Ncch<R> {
    stream: R,
    header: NcchHeader,
}

impl<R: ReadStream> Ncch<R> {
    pub fn from_stream(mut stream: R) -> Result<Ncch<R>, Error> {
        let header = NcchHeader::parse(&mut stream)?;
        debug!(
            "NCCH {} ({}): version {}, {:?}, crypt method {:#04x}",
            header.product_code, header.title_id, header.version, header.flags, header.crypt_method
        );
        Ok(Ncch { stream, header })
    }

    /// Byte offset and size of a section in the container.
    fn section_window(&self, section: Section) -> Result<(u64, u64), Error> {
        let header = &self.header;
        let (offset, size) = match section {
            Section::ExtendedHeader => (EXHEADER_OFFSET, u64::from(header.exheader_size) * 2),
            Section::Exefs => (
                media_to_bytes(header.exefs_offset),
                media_to_bytes(header.exefs_size),
            ),
            Section::Romfs if header.flags.no_romfs() => (0, 0),
            Section::Romfs => (
                media_to_bytes(header.romfs_offset),
                media_to_bytes(header.romfs_size),
            ),
        };
        ensure!(size != 0, MissingSectionSnafu { section });
        Ok((offset, size))
    }

    /// Open a section. The extended header and the ExeFS are decrypted with
    /// the primary key, the RomFS with the secondary key.
    ///
    /// Only the ExeFS header, icon and banner are readable through the ExeFS
    /// stream of a container using a secondary key distinct from the primary
    /// one. Use [`Ncch::open_exefs_file`] to read other ExeFS files.
    pub fn open_section(
        &mut self,
        section: Section,
        keyset: &Keyset,
        seeddb: Option<&SeedDb>,
    ) -> Result<SectionStream<&mut R>, Error> {
        let (offset, size) = self.section_window(section)?;
        if self.header.flags.no_crypto() {
            return Ok(SectionStream::Plain(Subview::new(
                &mut self.stream,
                offset,
                size,
            )));
        }

        let ctr = section_ctr(&self.header, section)?;
        let key = match section {
            Section::ExtendedHeader | Section::Exefs => {
                menu_info_key(&self.header, keyset, seeddb)?
            }
            Section::Romfs => content_key(&self.header, keyset, seeddb)?,
        };
        debug!("Opening {} at {:#x} with counter {}", section, offset, ctr);
        let view = Subview::new(&mut self.stream, offset, size);
        Ok(SectionStream::Encrypted(CryptoStream::new(view, key, ctr)))
    }

    pub fn read_exefs_header(
        &mut self,
        keyset: &Keyset,
        seeddb: Option<&SeedDb>,
    ) -> Result<ExefsHeader, Error> {
        let mut rs = self.open_section(Section::Exefs, keyset, seeddb)?;
        ExefsHeader::parse(&mut rs)
    }

    /// Open a file of the ExeFS.
    ///
    /// When the container is encrypted, the view is rounded up to the AES
    /// block size, and may expose up to 15 bytes of padding past the end of
    /// the file.
    pub fn open_exefs_file(
        &mut self,
        name: &str,
        keyset: &Keyset,
        seeddb: Option<&SeedDb>,
    ) -> Result<SectionStream<&mut R>, Error> {
        let exefs = self.read_exefs_header(keyset, seeddb)?;
        let entry = exefs
            .find(name)
            .context(MissingExefsFileSnafu { name })?;
        let (exefs_offset, exefs_size) = self.section_window(Section::Exefs)?;

        let file_offset = entry.data_offset();
        let file_size = u64::from(entry.size);
        ensure!(
            file_offset + file_size <= exefs_size,
            InvalidExefsSnafu {
                error: "file extends past the end of the ExeFS",
            }
        );

        if self.header.flags.no_crypto() {
            return Ok(SectionStream::Plain(Subview::new(
                &mut self.stream,
                exefs_offset + file_offset,
                file_size,
            )));
        }

        let key = match name {
            "icon" | "banner" => menu_info_key(&self.header, keyset, seeddb)?,
            _ => content_key(&self.header, keyset, seeddb)?,
        };
        let ctr = section_ctr(&self.header, Section::Exefs)?
            + Key128::from(u128::from(file_offset / 0x10));
        let size = align_up(file_size, 0x10).min(exefs_size - file_offset);
        debug!("Opening ExeFS file {} at {:#x} with counter {}", name, file_offset, ctr);
        let view = Subview::new(&mut self.stream, exefs_offset + file_offset, size);
        Ok(SectionStream::Encrypted(CryptoStream::new(view, key, ctr)))
    }

    /// The logo region, if the container has one. It is never encrypted.
    pub fn open_logo(&mut self) -> Option<Subview<&mut R>> {
        let (offset, size) = (self.header.logo_offset, self.header.logo_size);
        if size == 0 {
            return None;
        }
        Some(Subview::new(
            &mut self.stream,
            media_to_bytes(offset),
            media_to_bytes(size),
        ))
    }

    /// The plain region, if the container has one. It is never encrypted.
    pub fn open_plain_region(&mut self) -> Option<Subview<&mut R>> {
        let (offset, size) = (self.header.plain_offset, self.header.plain_size);
        if size == 0 {
            return None;
        }
        Some(Subview::new(
            &mut self.stream,
            media_to_bytes(offset),
            media_to_bytes(size),
        ))
    }

    /// Check a section against the hash stored in the header.
    ///
    /// The extended header hash covers the first `exheader_size` bytes (the
    /// access descriptor is not hashed), the ExeFS and RomFS hashes only their
    /// first `*_hash_size` media units.
    pub fn verify_section(
        &mut self,
        section: Section,
        keyset: &Keyset,
        seeddb: Option<&SeedDb>,
    ) -> Result<bool, Error> {
        let (len, expected) = match section {
            Section::ExtendedHeader => (
                u64::from(self.header.exheader_size),
                self.header.exheader_hash,
            ),
            Section::Exefs => (
                media_to_bytes(self.header.exefs_hash_size),
                self.header.exefs_hash,
            ),
            Section::Romfs => (
                media_to_bytes(self.header.romfs_hash_size),
                self.header.romfs_hash,
            ),
        };
        let section_name = match section {
            Section::ExtendedHeader => "extended header",
            Section::Exefs => "ExeFS",
            Section::Romfs => "RomFS",
        };

        let mut rs = self.open_section(section, keyset, seeddb)?;
        let size = rs.size();
        ensure!(
            len <= size,
            SectionTooSmallSnafu {
                section: section_name,
                size
            }
        );
        Ok(sha256_part(&mut rs, len)? == expected)
    }
}

impl<R> Ncch<R> {
    pub fn header(&self) -> &NcchHeader {
        &self.header
    }

    pub fn into_inner(self) -> R {
        self.stream
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pki::{Seed, TitleId};
    use crate::stream::MemoryStream;

    fn plain_header() -> NcchHeader {
        let mut header = NcchHeader {
            partition_id: 0x0004000000055D00,
            title_id: TitleId(0x0004000000055D00),
            version: 2,
            exheader_size: 0x400,
            exefs_offset: 5,
            exefs_size: 2,
            ..Default::default()
        };
        header.flags.set_no_crypto(true);
        header
    }

    fn container(header: &NcchHeader, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        data[..0x200].copy_from_slice(&header.to_bytes().unwrap());
        data
    }

    #[test]
    fn missing_romfs_is_not_found() {
        let header = plain_header();
        let data = container(&header, 0x1000);
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        assert!(matches!(
            ncch.open_section(Section::Romfs, &Keyset::new(), None),
            Err(Error::MissingSection {
                section: Section::Romfs,
                ..
            })
        ));
    }

    #[test]
    fn romfs_size_is_in_media_units() {
        let mut header = plain_header();
        header.romfs_offset = 7;
        header.romfs_size = 3;
        let data = container(&header, 0x1400);
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        let rs = ncch
            .open_section(Section::Romfs, &Keyset::new(), None)
            .unwrap();
        assert!(!rs.is_encrypted());
        assert_eq!(rs.size(), 3 * 0x200);
        assert_eq!(rs.offset(), 7 * 0x200);
    }

    #[test]
    fn no_romfs_flag_hides_romfs() {
        let mut header = plain_header();
        header.romfs_offset = 7;
        header.romfs_size = 3;
        header.flags.set_no_romfs(true);
        let data = container(&header, 0x1400);
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        assert!(matches!(
            ncch.open_section(Section::Romfs, &Keyset::new(), None),
            Err(Error::MissingSection { .. })
        ));
    }

    #[test]
    fn exheader_window_is_twice_the_declared_size() {
        let header = plain_header();
        let data = container(&header, 0x1000);
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        let rs = ncch
            .open_section(Section::ExtendedHeader, &Keyset::new(), None)
            .unwrap();
        assert_eq!(rs.offset(), 0x200);
        assert_eq!(rs.size(), 0x800);
    }

    #[test]
    fn exheader_hash_skips_access_descriptor() {
        let mut header = plain_header();
        let exheader: Vec<u8> = (0..0x800u32).map(|i| (i * 5) as u8).collect();
        header.exheader_hash = sha256(&exheader[..0x400]);
        let mut data = container(&header, 0x1000);
        data[0x200..0xA00].copy_from_slice(&exheader);

        // The access descriptor lives in the second half.
        data[0x200 + 0x600] ^= 0xFF;
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        assert!(ncch
            .verify_section(Section::ExtendedHeader, &Keyset::new(), None)
            .unwrap());

        data[0x200 + 0x3FF] ^= 0xFF;
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        assert!(!ncch
            .verify_section(Section::ExtendedHeader, &Keyset::new(), None)
            .unwrap());
    }

    #[test]
    fn logo_and_plain_region_are_optional() {
        let mut header = plain_header();
        header.logo_offset = 3;
        header.logo_size = 1;
        let data = container(&header, 0x1000);
        let mut ncch = Ncch::from_stream(MemoryStream::borrowed(&data)).unwrap();
        assert_eq!(ncch.open_logo().unwrap().size(), 0x200);
        assert!(ncch.open_plain_region().is_none());
    }

    #[test]
    fn counters_by_version() {
        let mut header = plain_header();
        header.flags.set_no_crypto(false);
        header.partition_id = 0x0011223344556677;
        header.exefs_offset = 5;
        header.romfs_offset = 0x10;

        for version in [0, 2] {
            header.version = version;
            assert_eq!(
                section_ctr(&header, Section::ExtendedHeader).unwrap().value(),
                0x0011223344556677_0100000000000000
            );
            assert_eq!(
                section_ctr(&header, Section::Romfs).unwrap().value(),
                0x0011223344556677_0300000000000000
            );
        }

        header.version = 1;
        assert_eq!(
            section_ctr(&header, Section::ExtendedHeader).unwrap().value(),
            0x7766554433221100_0000000000000200
        );
        assert_eq!(
            section_ctr(&header, Section::Exefs).unwrap().value(),
            0x7766554433221100_0000000000000A00
        );
        assert_eq!(
            section_ctr(&header, Section::Romfs).unwrap().value(),
            0x7766554433221100_0000000000002000
        );

        header.version = 3;
        assert!(matches!(
            section_ctr(&header, Section::Exefs),
            Err(Error::UnsupportedVersion { version: 3, .. })
        ));

        header.flags.set_no_crypto(true);
        assert!(matches!(
            section_ctr(&header, Section::Exefs),
            Err(Error::InvalidOperation { .. })
        ));
    }

    fn seeded_header(seed: &Seed) -> NcchHeader {
        let mut header = plain_header();
        header.flags.set_no_crypto(false).set_seed(true);
        header.title_id = TitleId(0x0004000000001000);
        header.signature.0[..0x10].copy_from_slice(&[0x42; 0x10]);
        let mut check = [0; 0x18];
        check[..0x10].copy_from_slice(&seed.0);
        check[0x10..].copy_from_slice(&header.title_id.0.to_le_bytes());
        header.seed_hash.copy_from_slice(&sha256(&check).0[..4]);
        header
    }

    #[test]
    fn seeded_key_y() {
        let seed = Seed([0x11; 0x10]);
        let header = seeded_header(&seed);
        let mut db = SeedDb::new();
        db.push(header.title_id, seed);

        let mut buf = [0; 0x20];
        buf[..0x10].copy_from_slice(&[0x42; 0x10]);
        buf[0x10..].copy_from_slice(&[0x11; 0x10]);
        let expected = Key128::from_be_slice(&sha256(&buf).0);
        assert_eq!(derive_key_y(&header, Some(&db)).unwrap(), expected);

        let mut unseeded = header.clone();
        unseeded.flags.set_seed(false);
        assert_eq!(
            derive_key_y(&unseeded, None).unwrap(),
            Key128::from_be_bytes([0x42; 0x10])
        );
    }

    #[test]
    fn seed_errors() {
        let header = seeded_header(&Seed([0x11; 0x10]));
        assert!(matches!(
            derive_key_y(&header, None),
            Err(Error::MissingSeed { .. })
        ));

        let mut db = SeedDb::new();
        db.push(header.title_id, Seed([0x12; 0x10]));
        assert!(matches!(
            derive_key_y(&header, Some(&db)),
            Err(Error::SeedHashMismatch { .. })
        ));
    }

    #[test]
    fn content_key_selection() {
        let mut header = plain_header();
        assert!(matches!(
            content_key(&header, &Keyset::new(), None),
            Err(Error::InvalidOperation { .. })
        ));

        header.flags.set_no_crypto(false).set_fixed_key(true);
        assert_eq!(
            content_key(&header, &Keyset::new(), None).unwrap(),
            FIXED_ZERO_KEY
        );
        header.title_id = TitleId(0x0004013000002C02);
        assert_eq!(
            content_key(&header, &Keyset::new(), None).unwrap(),
            FIXED_SYSTEM_KEY
        );

        header.flags.set_fixed_key(false);
        header.crypt_method = 0x0A;
        assert!(matches!(
            content_key(&header, &Keyset::new(), None),
            Err(Error::MissingKey {
                key_name: KeyName::Slot0x18KeyX,
                ..
            })
        ));

        let mut keyset = Keyset::new();
        keyset.load_defaults(false).unwrap();
        let key = content_key(&header, &keyset, None).unwrap();
        assert_eq!(
            key,
            hwkgen(keyset.keyx(KeyName::Slot0x18KeyX).unwrap(), header.key_y())
        );

        header.crypt_method = 0x05;
        assert!(matches!(
            content_key(&header, &keyset, None),
            Err(Error::UnknownCryptMethod { method: 5, .. })
        ));
    }

    #[test]
    fn key_pair_uses_slot_0x2c_for_primary() {
        let mut header = plain_header();
        header.flags.set_no_crypto(false);
        header.crypt_method = 0x01;
        let mut keyset = Keyset::new();
        keyset.load_defaults(false).unwrap();
        assert!(matches!(
            NcchKeyPair::derive(&header, &keyset, None),
            Err(Error::MissingKey {
                key_name: KeyName::Slot0x2CKeyX,
                ..
            })
        ));

        keyset.set_keyx(KeyName::Slot0x2CKeyX, Key128::new(0x2C));
        let keys = NcchKeyPair::derive(&header, &keyset, None).unwrap();
        assert_eq!(keys.primary, hwkgen(Key128::new(0x2C), header.key_y()));
        assert_ne!(keys.primary, keys.secondary);
    }
}
