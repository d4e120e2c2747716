use crate::error::{Error, ResultExt};
use crate::impl_debug_deserialize_serialize_hexstring;
use crate::pki::{default_paths, TitleId};
use crate::stream::{FileStream, ReadStream};
use byteorder::{ByteOrder, LE};
use log::{debug, warn};
use std::cmp::min;
use std::io::ErrorKind;
use std::path::Path;

const SEEDDB_FILE_NAME: &str = "seeddb.bin";
const HEADER_SIZE: usize = 0x10;
const ENTRY_SIZE: usize = 0x20;

/// Per-title secret mixed into the KeyY of seeded titles.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Seed(pub [u8; 0x10]);
impl_debug_deserialize_serialize_hexstring!(Seed);

/// A seed database, as stored in `seeddb.bin`.
///
/// ```text
/// 0x00  u32    entry count
/// 0x04  [u8]   padding up to 0x10
/// 0x10  entries of 0x20 bytes:
///         0x00 u64      title id
///         0x08 [u8; 16] seed
///         0x18 [u8; 8]  padding
/// ```
#[derive(Debug, Clone, Default)]
pub struct SeedDb {
    entries: Vec<(TitleId, Seed)>,
}

impl SeedDb {
    pub fn new() -> SeedDb {
        SeedDb::default()
    }

    pub fn from_stream(rs: &mut dyn ReadStream) -> Result<SeedDb, Error> {
        let mut header = [0; HEADER_SIZE];
        rs.read_at_exact(0, &mut header)?;
        let count = LE::read_u32(&header[0..4]) as usize;

        // Don't trust the count for the allocation.
        let available = (rs.size() as usize).saturating_sub(HEADER_SIZE) / ENTRY_SIZE;
        let mut entries = Vec::with_capacity(min(count, available));
        let mut entry = [0; ENTRY_SIZE];
        for _ in 0..count {
            rs.read_exact(&mut entry)?;
            let mut seed = [0; 0x10];
            seed.copy_from_slice(&entry[0x08..0x18]);
            entries.push((TitleId(LE::read_u64(&entry[0x00..0x08])), Seed(seed)));
        }
        debug!("Loaded {} seeds", entries.len());
        Ok(SeedDb { entries })
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<SeedDb, Error> {
        let path = path.as_ref();
        let mut rs = FileStream::open(path)?;
        let ret = SeedDb::from_stream(&mut rs).with_path(path);
        rs.close();
        ret
    }

    /// Load the first `seeddb.bin` found in `<config dir>/3ds/` or `~/.3ds/`.
    /// Returns an empty database if there is none.
    pub fn scan() -> Result<SeedDb, Error> {
        for path in default_paths(SEEDDB_FILE_NAME) {
            match SeedDb::from_file(&path) {
                Ok(db) => return Ok(db),
                Err(Error::Io { ref error, .. }) if error.kind() == ErrorKind::NotFound => (),
                Err(err) => return Err(err),
            }
        }
        warn!("No {} found, seeded titles won't be decryptable", SEEDDB_FILE_NAME);
        Ok(SeedDb::new())
    }

    pub fn push(&mut self, title_id: TitleId, seed: Seed) {
        self.entries.push((title_id, seed));
    }

    /// Seed of `title_id`. If the database lists a title more than once, the
    /// first entry wins.
    pub fn find(&self, title_id: TitleId) -> Option<&Seed> {
        self.entries
            .iter()
            .find(|(tid, _)| *tid == title_id)
            .map(|(_, seed)| seed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(TitleId, Seed)> {
        self.entries.iter()
    }
}
