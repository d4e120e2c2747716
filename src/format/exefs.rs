//! ExeFS
//!
//! A flat archive of at most 10 files, preceded by a 0x200 byte header. See
//! <https://www.3dbrew.org/wiki/ExeFS>.
//!
//! ```text
//! 0x000  10 file entries of 0x10 bytes: name[8], offset: u32, size: u32
//! 0x0A0  reserved
//! 0x0C0  10 SHA-256 hashes, in reverse order (the hash of entry 0 is last)
//! 0x200  file data, each file aligned on 0x200 bytes
//! ```

use crate::crypto::{sha256, sha256_part, Sha256Hash};
use crate::error::{Error, InvalidExefsSnafu};
use crate::format::vfs::{DirectoryPacker, VirtualDirectory};
use crate::stream::{self, ReadStream, WriteStream};
use crate::utils::align_up;
use byteorder::{ByteOrder, LE};
use log::{debug, warn};
use snafu::ensure;

pub const EXEFS_HEADER_SIZE: u64 = 0x200;
pub const EXEFS_MAX_FILES: usize = 10;
const FILE_ALIGN: u64 = 0x200;
const NAME_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExefsEntry {
    pub name: String,
    /// Offset of the file data, relative to the end of the header.
    pub offset: u32,
    pub size: u32,
    pub hash: Sha256Hash,
}

impl ExefsEntry {
    /// Offset of the file data from the start of the ExeFS.
    pub fn data_offset(&self) -> u64 {
        EXEFS_HEADER_SIZE + u64::from(self.offset)
    }
}

fn hash_offset(index: usize) -> usize {
    EXEFS_HEADER_SIZE as usize - 0x20 * (index + 1)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExefsHeader {
    pub entries: Vec<ExefsEntry>,
}

impl ExefsHeader {
    pub fn parse(rs: &mut dyn ReadStream) -> Result<ExefsHeader, Error> {
        let mut raw = [0; EXEFS_HEADER_SIZE as usize];
        rs.read_at_exact(0, &mut raw)?;
        ExefsHeader::from_bytes(&raw)
    }

    pub fn from_bytes(raw: &[u8; EXEFS_HEADER_SIZE as usize]) -> Result<ExefsHeader, Error> {
        let mut entries = Vec::new();
        for (index, entry) in raw[..0xA0].chunks(0x10).enumerate() {
            // The table ends at the first unused entry.
            if entry[0] == 0 {
                break;
            }
            let name_len = entry[..NAME_SIZE]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(NAME_SIZE);
            let name = std::str::from_utf8(&entry[..name_len])
                .ok()
                .filter(|name| name.is_ascii())
                .ok_or_else(|| {
                    InvalidExefsSnafu {
                        error: "file name is not ASCII",
                    }
                    .build()
                })?;
            let mut hash = Sha256Hash::default();
            let hash_off = hash_offset(index);
            hash.0.copy_from_slice(&raw[hash_off..hash_off + 0x20]);
            entries.push(ExefsEntry {
                name: name.to_owned(),
                offset: LE::read_u32(&entry[0x8..0xC]),
                size: LE::read_u32(&entry[0xC..0x10]),
                hash,
            });
        }
        Ok(ExefsHeader { entries })
    }

    pub fn to_bytes(&self) -> Result<[u8; EXEFS_HEADER_SIZE as usize], Error> {
        ensure!(
            self.entries.len() <= EXEFS_MAX_FILES,
            InvalidExefsSnafu {
                error: "too many files",
            }
        );
        let mut raw = [0; EXEFS_HEADER_SIZE as usize];
        for (index, entry) in self.entries.iter().enumerate() {
            ensure!(
                !entry.name.is_empty() && entry.name.len() <= NAME_SIZE && entry.name.is_ascii(),
                InvalidExefsSnafu {
                    error: "file names must be 1 to 8 ASCII characters",
                }
            );
            let raw_entry = &mut raw[index * 0x10..(index + 1) * 0x10];
            raw_entry[..entry.name.len()].copy_from_slice(entry.name.as_bytes());
            LE::write_u32(&mut raw_entry[0x8..0xC], entry.offset);
            LE::write_u32(&mut raw_entry[0xC..0x10], entry.size);
            let hash_off = hash_offset(index);
            raw[hash_off..hash_off + 0x20].copy_from_slice(&entry.hash.0);
        }
        Ok(raw)
    }

    pub fn find(&self, name: &str) -> Option<&ExefsEntry> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// Check the data of `entry` against its hash. `rs` must be positioned on
    /// the ExeFS.
    pub fn verify(&self, rs: &mut dyn ReadStream, entry: &ExefsEntry) -> Result<bool, Error> {
        let hash = if entry.size == 0 {
            sha256(&[])
        } else {
            rs.seek_abs(entry.data_offset())?;
            sha256_part(rs, u64::from(entry.size))?
        };
        Ok(hash == entry.hash)
    }
}

/// Builds an ExeFS from the files at the root of a [`VirtualDirectory`].
/// Subdirectories are ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExefsPacker;

impl DirectoryPacker for ExefsPacker {
    fn pack(&self, dir: &dyn VirtualDirectory, ws: &mut dyn WriteStream) -> Result<u64, Error> {
        let mut files = Vec::new();
        for child in dir.children("/")? {
            if child.is_dir {
                warn!("Ignoring directory \"{}\" in ExeFS", child.path);
            } else {
                files.push(child);
            }
        }
        ensure!(
            files.len() <= EXEFS_MAX_FILES,
            InvalidExefsSnafu {
                error: "too many files",
            }
        );

        // First pass: sizes and hashes, so the header can go out first.
        let mut header = ExefsHeader::default();
        let mut offset = 0u64;
        for file in &files {
            let mut rs = dir.open(&file.path)?;
            let size = rs.size();
            let hash = if size == 0 {
                sha256(&[])
            } else {
                rs.seek_abs(0)?;
                sha256_part(&mut rs, size)?
            };
            rs.close();

            let entry_offset = u32::try_from(offset).ok();
            let entry_size = u32::try_from(size).ok();
            let (entry_offset, entry_size) = entry_offset.zip(entry_size).ok_or_else(|| {
                InvalidExefsSnafu {
                    error: "file too large",
                }
                .build()
            })?;
            header.entries.push(ExefsEntry {
                name: file.name.clone(),
                offset: entry_offset,
                size: entry_size,
                hash,
            });
            offset += align_up(size, FILE_ALIGN);
        }

        ws.write(&header.to_bytes()?)?;
        for (file, entry) in files.iter().zip(&header.entries) {
            debug!(
                "Packing ExeFS file {} at {:#x} ({:#x} bytes)",
                entry.name,
                entry.data_offset(),
                entry.size
            );
            let mut rs = dir.open(&file.path)?;
            stream::copy(&mut rs, ws)?;
            rs.close();
            let size = u64::from(entry.size);
            ws.write_zeroes(align_up(size, FILE_ALIGN) - size)?;
        }
        Ok(EXEFS_HEADER_SIZE + offset)
    }
}
