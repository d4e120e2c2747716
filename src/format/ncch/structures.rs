//! Raw NCCH structures
//!
//! See <https://www.3dbrew.org/wiki/NCCH#NCCH_Header>. All integers are
//! little-endian, except the KeyY which is the first 16 bytes of the
//! signature read as a big-endian value.

use crate::crypto::Sha256Hash;
use crate::error::{Error, InvalidMagicSnafu, InvalidSectionSnafu, UnknownCryptMethodSnafu};
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::pki::{Key128, KeyName, TitleId};
use crate::stream::ReadStream;
use bit_field::BitField;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use derive_more::Display;
use serde_derive::{Deserialize, Serialize};
use snafu::ensure;
use std::io::{Cursor, Read, Write};

/// Size of a media unit. Every offset and size in the header is counted in
/// media units.
pub const MEDIA_UNIT: u64 = 0x200;
pub const NCCH_HEADER_SIZE: usize = 0x200;
/// The extended header always directly follows the NCCH header.
pub const EXHEADER_OFFSET: u64 = 0x200;

const NCCH_MAGIC: &[u8; 4] = b"NCCH";

pub fn media_to_bytes(units: u32) -> u64 {
    u64::from(units) * MEDIA_UNIT
}

#[repr(transparent)]
#[derive(Clone, Copy)]
pub struct Signature(pub [u8; 0x100]);
impl_debug_deserialize_serialize_hexstring!(Signature);

impl Default for Signature {
    fn default() -> Signature {
        Signature([0; 0x100])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum Section {
    #[display(fmt = "extended header")]
    ExtendedHeader = 1,
    #[display(fmt = "ExeFS")]
    Exefs = 2,
    #[display(fmt = "RomFS")]
    Romfs = 3,
}

impl TryFrom<u8> for Section {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Section, Error> {
        match tag {
            1 => Ok(Section::ExtendedHeader),
            2 => Ok(Section::Exefs),
            3 => Ok(Section::Romfs),
            tag => InvalidSectionSnafu { tag }.fail(),
        }
    }
}

/// Secondary key selection, from byte 0x18B of the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptMethod {
    /// Same key as the primary one (slot 0x2C).
    Original,
    /// 7.0.0 titles (slot 0x25).
    Key7x,
    /// New 3DS 9.3.0 titles (slot 0x18).
    Key93,
    /// New 3DS 9.6.0 titles (slot 0x1B).
    Key96,
}

impl CryptMethod {
    pub fn keyx_slot(&self) -> KeyName {
        match self {
            CryptMethod::Original => KeyName::Slot0x2CKeyX,
            CryptMethod::Key7x => KeyName::Slot0x25KeyX,
            CryptMethod::Key93 => KeyName::Slot0x18KeyX,
            CryptMethod::Key96 => KeyName::Slot0x1BKeyX,
        }
    }
}

impl TryFrom<u8> for CryptMethod {
    type Error = Error;

    fn try_from(method: u8) -> Result<CryptMethod, Error> {
        match method {
            0x00 => Ok(CryptMethod::Original),
            0x01 => Ok(CryptMethod::Key7x),
            0x0A => Ok(CryptMethod::Key93),
            0x0B => Ok(CryptMethod::Key96),
            method => UnknownCryptMethodSnafu { method }.fail(),
        }
    }
}

/// Byte 0x18F of the header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NcchFlags(pub u8);

impl NcchFlags {
    const FIXED_KEY: usize = 0;
    const NO_ROMFS: usize = 1;
    const NO_CRYPTO: usize = 2;
    const SEED: usize = 5;

    pub fn fixed_key(&self) -> bool {
        self.0.get_bit(Self::FIXED_KEY)
    }

    pub fn no_romfs(&self) -> bool {
        self.0.get_bit(Self::NO_ROMFS)
    }

    pub fn no_crypto(&self) -> bool {
        self.0.get_bit(Self::NO_CRYPTO)
    }

    pub fn seed(&self) -> bool {
        self.0.get_bit(Self::SEED)
    }

    pub fn set_fixed_key(&mut self, value: bool) -> &mut Self {
        self.0.set_bit(Self::FIXED_KEY, value);
        self
    }

    pub fn set_no_romfs(&mut self, value: bool) -> &mut Self {
        self.0.set_bit(Self::NO_ROMFS, value);
        self
    }

    pub fn set_no_crypto(&mut self, value: bool) -> &mut Self {
        self.0.set_bit(Self::NO_CRYPTO, value);
        self
    }

    pub fn set_seed(&mut self, value: bool) -> &mut Self {
        self.0.set_bit(Self::SEED, value);
        self
    }
}

impl std::fmt::Debug for NcchFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NcchFlags")
            .field("fixed_key", &self.fixed_key())
            .field("no_romfs", &self.no_romfs())
            .field("no_crypto", &self.no_crypto())
            .field("seed", &self.seed())
            .finish()
    }
}

/// A parsed NCCH header.
///
/// Offsets and sizes are kept in media units, exactly as stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NcchHeader {
    pub signature: Signature,
    /// Content size, in media units.
    pub content_size: u32,
    pub partition_id: u64,
    pub maker_code: String,
    /// Format version. Selects how section counters are derived.
    pub version: u16,
    /// First 4 bytes of `SHA256(seed || title_id)`, for seeded titles.
    pub seed_hash: [u8; 4],
    pub title_id: TitleId,
    pub logo_hash: Sha256Hash,
    pub product_code: String,
    pub exheader_hash: Sha256Hash,
    /// Nominal extended header size in bytes. The actual extended header
    /// (including the access descriptor) is twice as large.
    pub exheader_size: u32,
    /// Bytes 0x188 to 0x18A, kept as is.
    pub reserved_flags: [u8; 3],
    pub crypt_method: u8,
    pub platform: u8,
    pub content_type: u8,
    pub content_unit_exponent: u8,
    pub flags: NcchFlags,
    pub plain_offset: u32,
    pub plain_size: u32,
    pub logo_offset: u32,
    pub logo_size: u32,
    pub exefs_offset: u32,
    pub exefs_size: u32,
    pub exefs_hash_size: u32,
    pub romfs_offset: u32,
    pub romfs_size: u32,
    pub romfs_hash_size: u32,
    /// Hash of the first `exefs_hash_size` media units of the ExeFS.
    pub exefs_hash: Sha256Hash,
    /// Hash of the first `romfs_hash_size` media units of the RomFS.
    pub romfs_hash: Sha256Hash,
}

fn read_string<R: Read>(rs: &mut R, len: usize) -> Result<String, Error> {
    let mut raw = vec![0; len];
    rs.read_exact(&mut raw)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn write_string<W: Write>(ws: &mut W, s: &str, len: usize) -> Result<(), Error> {
    let mut raw = vec![0; len];
    let bytes = s.as_bytes();
    let copied = bytes.len().min(len);
    raw[..copied].copy_from_slice(&bytes[..copied]);
    ws.write_all(&raw)?;
    Ok(())
}

fn read_hash<R: Read>(rs: &mut R) -> Result<Sha256Hash, Error> {
    let mut hash = Sha256Hash::default();
    rs.read_exact(&mut hash.0)?;
    Ok(hash)
}

impl NcchHeader {
    /// Read the header at offset 0 of `rs`.
    pub fn parse(rs: &mut dyn ReadStream) -> Result<NcchHeader, Error> {
        let mut raw = [0; NCCH_HEADER_SIZE];
        rs.read_at_exact(0, &mut raw)?;
        NcchHeader::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8; NCCH_HEADER_SIZE]) -> Result<NcchHeader, Error> {
        ensure!(&raw[0x100..0x104] == NCCH_MAGIC, InvalidMagicSnafu { what: "NCCH" });

        let mut signature = Signature::default();
        signature.0.copy_from_slice(&raw[..0x100]);

        let mut cur = Cursor::new(&raw[0x104..]);
        let content_size = cur.read_u32::<LittleEndian>()?;
        let partition_id = cur.read_u64::<LittleEndian>()?;
        let maker_code = read_string(&mut cur, 2)?;
        let version = cur.read_u16::<LittleEndian>()?;
        let mut seed_hash = [0; 4];
        cur.read_exact(&mut seed_hash)?;
        let title_id = TitleId(cur.read_u64::<LittleEndian>()?);
        // 0x120: reserved
        cur.set_position(0x130 - 0x104);
        let logo_hash = read_hash(&mut cur)?;
        let product_code = read_string(&mut cur, 0x10)?;
        let exheader_hash = read_hash(&mut cur)?;
        let exheader_size = cur.read_u32::<LittleEndian>()?;
        // 0x184: reserved
        cur.set_position(0x188 - 0x104);
        let mut reserved_flags = [0; 3];
        cur.read_exact(&mut reserved_flags)?;
        let crypt_method = cur.read_u8()?;
        let platform = cur.read_u8()?;
        let content_type = cur.read_u8()?;
        let content_unit_exponent = cur.read_u8()?;
        let flags = NcchFlags(cur.read_u8()?);
        let plain_offset = cur.read_u32::<LittleEndian>()?;
        let plain_size = cur.read_u32::<LittleEndian>()?;
        let logo_offset = cur.read_u32::<LittleEndian>()?;
        let logo_size = cur.read_u32::<LittleEndian>()?;
        let exefs_offset = cur.read_u32::<LittleEndian>()?;
        let exefs_size = cur.read_u32::<LittleEndian>()?;
        let exefs_hash_size = cur.read_u32::<LittleEndian>()?;
        let _reserved = cur.read_u32::<LittleEndian>()?;
        let romfs_offset = cur.read_u32::<LittleEndian>()?;
        let romfs_size = cur.read_u32::<LittleEndian>()?;
        let romfs_hash_size = cur.read_u32::<LittleEndian>()?;
        let _reserved = cur.read_u32::<LittleEndian>()?;
        let exefs_hash = read_hash(&mut cur)?;
        let romfs_hash = read_hash(&mut cur)?;

        Ok(NcchHeader {
            signature,
            content_size,
            partition_id,
            maker_code,
            version,
            seed_hash,
            title_id,
            logo_hash,
            product_code,
            exheader_hash,
            exheader_size,
            reserved_flags,
            crypt_method,
            platform,
            content_type,
            content_unit_exponent,
            flags,
            plain_offset,
            plain_size,
            logo_offset,
            logo_size,
            exefs_offset,
            exefs_size,
            exefs_hash_size,
            romfs_offset,
            romfs_size,
            romfs_hash_size,
            exefs_hash,
            romfs_hash,
        })
    }

    pub fn to_bytes(&self) -> Result<[u8; NCCH_HEADER_SIZE], Error> {
        let mut raw = [0; NCCH_HEADER_SIZE];
        raw[..0x100].copy_from_slice(&self.signature.0);
        raw[0x100..0x104].copy_from_slice(NCCH_MAGIC);

        let mut cur = Cursor::new(&mut raw[0x104..]);
        cur.write_u32::<LittleEndian>(self.content_size)?;
        cur.write_u64::<LittleEndian>(self.partition_id)?;
        write_string(&mut cur, &self.maker_code, 2)?;
        cur.write_u16::<LittleEndian>(self.version)?;
        cur.write_all(&self.seed_hash)?;
        cur.write_u64::<LittleEndian>(self.title_id.0)?;
        cur.set_position(0x130 - 0x104);
        cur.write_all(&self.logo_hash.0)?;
        write_string(&mut cur, &self.product_code, 0x10)?;
        cur.write_all(&self.exheader_hash.0)?;
        cur.write_u32::<LittleEndian>(self.exheader_size)?;
        cur.set_position(0x188 - 0x104);
        cur.write_all(&self.reserved_flags)?;
        cur.write_u8(self.crypt_method)?;
        cur.write_u8(self.platform)?;
        cur.write_u8(self.content_type)?;
        cur.write_u8(self.content_unit_exponent)?;
        cur.write_u8(self.flags.0)?;
        cur.write_u32::<LittleEndian>(self.plain_offset)?;
        cur.write_u32::<LittleEndian>(self.plain_size)?;
        cur.write_u32::<LittleEndian>(self.logo_offset)?;
        cur.write_u32::<LittleEndian>(self.logo_size)?;
        cur.write_u32::<LittleEndian>(self.exefs_offset)?;
        cur.write_u32::<LittleEndian>(self.exefs_size)?;
        cur.write_u32::<LittleEndian>(self.exefs_hash_size)?;
        cur.write_u32::<LittleEndian>(0)?;
        cur.write_u32::<LittleEndian>(self.romfs_offset)?;
        cur.write_u32::<LittleEndian>(self.romfs_size)?;
        cur.write_u32::<LittleEndian>(self.romfs_hash_size)?;
        cur.write_u32::<LittleEndian>(0)?;
        cur.write_all(&self.exefs_hash.0)?;
        cur.write_all(&self.romfs_hash.0)?;
        Ok(raw)
    }

    /// The KeyY embedded in the signature, before any seed is applied.
    pub fn key_y(&self) -> Key128 {
        Key128::from_be_slice(&self.signature.0[..0x10])
    }

    pub fn crypt_method(&self) -> Result<CryptMethod, Error> {
        CryptMethod::try_from(self.crypt_method)
    }

    /// Content unit size in bytes, `None` when the exponent does not fit a
    /// `u64`.
    pub fn content_unit_size(&self) -> Option<u64> {
        1u64.checked_shl(u32::from(self.content_unit_exponent))
            .and_then(|units| units.checked_mul(MEDIA_UNIT))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
