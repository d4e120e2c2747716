//! Key material
//!
//! A [`Keyset`] holds the KeyX values of the keyslots used by content
//! containers. They come from three sources:
//!
//! - the ARM9 boot ROM (`boot9.bin`), which holds the KeyX for slot 0x2C at a
//!   fixed offset;
//! - the compiled-in defaults for slots 0x25, 0x18 and 0x1B;
//! - a user-supplied `aes_keys.txt`.
//!
//! The first two sources exist in a retail and a developer flavor, and a
//! keyset only ever holds one flavor.
//!
//! Content keys are derived from a KeyX and a KeyY with [`hwkgen`], the same
//! scrambler the hardware AES engine uses. See
//! <https://www.3dbrew.org/wiki/AES_Registers#Algorithm_1>.

mod key128;
mod seeddb;

pub use self::key128::Key128;
pub use self::seeddb::{Seed, SeedDb};

use crate::error::{Error, KeysetMismatchSnafu, MissingKeySnafu, ResultExt};
use crate::stream::{FileStream, ReadStream};
use hex_literal::hex;
use ini::Ini;
use log::{debug, warn};
use snafu::{ensure, OptionExt};
use std::fmt;
use std::fs::File;
use std::io::{self, ErrorKind, Read};
use std::path::{Path, PathBuf};

const SCRAMBLER: Key128 = Key128::new(u128::from_be_bytes(hex!(
    "1FF9E9AAC5FE0408024591DC5D52768A"
)));

/// Fixed key used by system titles flagged with the fixed-key crypto flag.
pub const FIXED_SYSTEM_KEY: Key128 = Key128::new(u128::from_be_bytes(hex!(
    "527CE630A9CA305F3696F3CDE954194B"
)));

/// Fixed key used by every other title flagged with the fixed-key crypto flag.
pub const FIXED_ZERO_KEY: Key128 = Key128::new(0);

const BOOT9_KEYX_0X2C_RETAIL: u64 = 0x59D0;
const BOOT9_KEYX_0X2C_DEV: u64 = 0x5DD0;

const RETAIL_KEYX_0X25: [u8; 0x10] = hex!("CEE7D8AB30C00DAE850EF5E382AC5AF3");
const RETAIL_KEYX_0X18: [u8; 0x10] = hex!("82E9C9BEBFB8BDB875ECC0A07D474374");
const RETAIL_KEYX_0X1B: [u8; 0x10] = hex!("45AD04953992C7C893724A9A7BCE6182");

const DEV_KEYX_0X25: [u8; 0x10] = hex!("81907A4B6F1B47323A677974CE4AD71B");
const DEV_KEYX_0X18: [u8; 0x10] = hex!("304BF1468372EE64115EBD4093D84276");
const DEV_KEYX_0X1B: [u8; 0x10] = hex!("6C8B2944A0726035F941DFC018524FB6");

const KEYS_FILE_NAME: &str = "aes_keys.txt";

/// Compute a normal key from a KeyX/KeyY pair.
///
/// `KeyC = ((KeyX <<< 2) ^ KeyY) + C >>> 41`
pub fn hwkgen(keyx: Key128, keyy: Key128) -> Key128 {
    ((keyx.rol(2) ^ keyy) + SCRAMBLER).ror(41)
}

/// Candidate locations for a configuration file, in lookup order.
pub(crate) fn default_paths(name: &str) -> Vec<PathBuf> {
    [
        dirs_next::config_dir().map(|mut v| {
            v.push("3ds");
            v.push(name);
            v
        }),
        dirs_next::home_dir().map(|mut v| {
            v.push(".3ds");
            v.push(name);
            v
        }),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TitleId(pub u64);

impl TitleId {
    /// Whether the category bits mark this title as a system title.
    pub fn is_system(&self) -> bool {
        (self.0 >> 32) & 0x10 != 0
    }
}

impl fmt::Debug for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016X}", self.0)
    }
}

impl fmt::Display for TitleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl serde::Serialize for TitleId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for TitleId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<TitleId, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        u64::from_str_radix(s.trim_start_matches("0x"), 16)
            .map(TitleId)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeysetFlavor {
    Retail,
    Developer,
}

impl KeysetFlavor {
    fn from_dev(dev: bool) -> KeysetFlavor {
        if dev {
            KeysetFlavor::Developer
        } else {
            KeysetFlavor::Retail
        }
    }
}

/// The keyslots whose KeyX a [`Keyset`] can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyName {
    Slot0x2CKeyX,
    Slot0x25KeyX,
    Slot0x18KeyX,
    Slot0x1BKeyX,
}

impl KeyName {
    pub const ALL: [KeyName; 4] = [
        KeyName::Slot0x2CKeyX,
        KeyName::Slot0x25KeyX,
        KeyName::Slot0x18KeyX,
        KeyName::Slot0x1BKeyX,
    ];

    /// Name of the key in `aes_keys.txt`.
    pub fn ini_name(&self) -> &'static str {
        match self {
            KeyName::Slot0x2CKeyX => "slot0x2CKeyX",
            KeyName::Slot0x25KeyX => "slot0x25KeyX",
            KeyName::Slot0x18KeyX => "slot0x18KeyX",
            KeyName::Slot0x1BKeyX => "slot0x1BKeyX",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Keyset {
    slot0x2c_keyx: Option<Key128>,
    slot0x25_keyx: Option<Key128>,
    slot0x18_keyx: Option<Key128>,
    slot0x1b_keyx: Option<Key128>,
    boot9_loaded: bool,
    defaults_loaded: bool,
    flavor: Option<KeysetFlavor>,
}

impl Keyset {
    pub fn new() -> Keyset {
        Keyset::default()
    }

    /// Retail or developer, if a boot ROM or the default table was loaded.
    pub fn flavor(&self) -> Option<KeysetFlavor> {
        self.flavor
    }

    pub fn boot9_loaded(&self) -> bool {
        self.boot9_loaded
    }

    pub fn defaults_loaded(&self) -> bool {
        self.defaults_loaded
    }

    fn slot(&self, name: KeyName) -> &Option<Key128> {
        match name {
            KeyName::Slot0x2CKeyX => &self.slot0x2c_keyx,
            KeyName::Slot0x25KeyX => &self.slot0x25_keyx,
            KeyName::Slot0x18KeyX => &self.slot0x18_keyx,
            KeyName::Slot0x1BKeyX => &self.slot0x1b_keyx,
        }
    }

    fn slot_mut(&mut self, name: KeyName) -> &mut Option<Key128> {
        match name {
            KeyName::Slot0x2CKeyX => &mut self.slot0x2c_keyx,
            KeyName::Slot0x25KeyX => &mut self.slot0x25_keyx,
            KeyName::Slot0x18KeyX => &mut self.slot0x18_keyx,
            KeyName::Slot0x1BKeyX => &mut self.slot0x1b_keyx,
        }
    }

    /// Get a KeyX, failing with [`Error::MissingKey`] if no source provided it.
    pub fn keyx(&self, name: KeyName) -> Result<Key128, Error> {
        let key = *self.slot(name);
        key.context(MissingKeySnafu { key_name: name })
    }

    pub fn set_keyx(&mut self, name: KeyName, key: Key128) {
        *self.slot_mut(name) = Some(key);
    }

    fn check_flavor(&self, requested: KeysetFlavor) -> Result<(), Error> {
        if let Some(loaded) = self.flavor {
            ensure!(
                loaded == requested,
                KeysetMismatchSnafu { loaded, requested }
            );
        }
        Ok(())
    }

    /// Load the slot 0x2C KeyX from an ARM9 boot ROM dump.
    ///
    /// Loading a boot ROM twice is a no-op as long as both calls agree on the
    /// flavor.
    pub fn load_boot9(&mut self, rs: &mut dyn ReadStream, dev: bool) -> Result<(), Error> {
        let flavor = KeysetFlavor::from_dev(dev);
        self.check_flavor(flavor)?;
        if self.boot9_loaded {
            return Ok(());
        }

        let offset = if dev {
            BOOT9_KEYX_0X2C_DEV
        } else {
            BOOT9_KEYX_0X2C_RETAIL
        };
        let mut raw = [0; 0x10];
        rs.read_at_exact(offset, &mut raw)?;
        debug!("Loaded {:?} slot 0x2C KeyX from boot9", flavor);

        self.slot0x2c_keyx = Some(Key128::from_be_bytes(raw));
        self.boot9_loaded = true;
        self.flavor = Some(flavor);
        Ok(())
    }

    pub fn load_boot9_file<P: AsRef<Path>>(&mut self, path: P, dev: bool) -> Result<(), Error> {
        let path = path.as_ref();
        let mut rs = FileStream::open(path)?;
        let ret = self.load_boot9(&mut rs, dev).with_path(path);
        rs.close();
        ret
    }

    /// Load the compiled-in KeyX values for slots 0x25, 0x18 and 0x1B.
    pub fn load_defaults(&mut self, dev: bool) -> Result<(), Error> {
        let flavor = KeysetFlavor::from_dev(dev);
        self.check_flavor(flavor)?;
        if self.defaults_loaded {
            return Ok(());
        }

        let (kx25, kx18, kx1b) = if dev {
            (DEV_KEYX_0X25, DEV_KEYX_0X18, DEV_KEYX_0X1B)
        } else {
            (RETAIL_KEYX_0X25, RETAIL_KEYX_0X18, RETAIL_KEYX_0X1B)
        };
        self.slot0x25_keyx = Some(Key128::from_be_bytes(kx25));
        self.slot0x18_keyx = Some(Key128::from_be_bytes(kx18));
        self.slot0x1b_keyx = Some(Key128::from_be_bytes(kx1b));
        debug!("Loaded {:?} default KeyX table", flavor);

        self.defaults_loaded = true;
        self.flavor = Some(flavor);
        Ok(())
    }

    /// Read KeyX values from an `aes_keys.txt` style INI document. Slots that
    /// already hold a key are left alone.
    pub fn read_from_ini<R: Read>(&mut self, mut reader: R) -> Result<(), Error> {
        let config = Ini::read_from(&mut reader)?;
        let section = config.general_section();

        for name in KeyName::ALL {
            let value = section
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name.ini_name()))
                .map(|(_, v)| v.trim());
            if let Some(value) = value {
                let key = Key128::from_hex_named(name.ini_name(), value)?;
                let slot = self.slot_mut(name);
                if slot.is_none() {
                    debug!("Loaded {} from keys file", name.ini_name());
                    *slot = Some(key);
                }
            }
        }
        Ok(())
    }

    pub fn load_keys_file<P: AsRef<Path>>(&mut self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| (err, path))?;
        self.read_from_ini(file).with_path(path)
    }

    /// Look for `aes_keys.txt` in `<config dir>/3ds/` then `~/.3ds/`, and load
    /// the first one found.
    pub fn scan_keys_file(&mut self) -> Result<PathBuf, Error> {
        for path in default_paths(KEYS_FILE_NAME) {
            match File::open(&path) {
                Ok(file) => {
                    self.read_from_ini(file).with_path(&path)?;
                    return Ok(path);
                }
                Err(ref err) if err.kind() == ErrorKind::NotFound => (),
                Err(err) => warn!("Failed to open {}: {}", path.display(), err),
            }
        }
        Err(io::Error::new(ErrorKind::NotFound, "Keyfile not found.").into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::stream::MemoryStream;

    fn boot9(dev: bool) -> Vec<u8> {
        let mut data = vec![0; 0x10000];
        data[0x59D0..0x59E0].copy_from_slice(&[0xAA; 0x10]);
        data[0x5DD0..0x5DE0].copy_from_slice(&[0xDD; 0x10]);
        if dev {
            data[0x59D0..0x59E0].copy_from_slice(&[0; 0x10]);
        }
        data
    }

    #[test]
    fn hwkgen_is_deterministic() {
        let x = Key128::new(0x000102030405060708090A0B0C0D0E0F);
        let y = Key128::new(0xF0E0D0C0B0A090807060504030201000);
        assert_eq!(hwkgen(x, y), hwkgen(x, y));
        assert_eq!(hwkgen(x, y).to_string(), "242EB34F63086F613BB3594652294505");
        assert_eq!(hwkgen(Key128::default(), Key128::default()), SCRAMBLER.ror(41));
    }

    #[test]
    fn boot9_offsets_depend_on_flavor() {
        let data = boot9(false);
        let mut ks = Keyset::new();
        ks.load_boot9(&mut MemoryStream::borrowed(&data), false).unwrap();
        assert_eq!(ks.keyx(KeyName::Slot0x2CKeyX).unwrap().to_be_bytes(), [0xAA; 0x10]);
        assert_eq!(ks.flavor(), Some(KeysetFlavor::Retail));

        let data = boot9(true);
        let mut ks = Keyset::new();
        ks.load_boot9(&mut MemoryStream::borrowed(&data), true).unwrap();
        assert_eq!(ks.keyx(KeyName::Slot0x2CKeyX).unwrap().to_be_bytes(), [0xDD; 0x10]);
        assert_eq!(ks.flavor(), Some(KeysetFlavor::Developer));
    }

    #[test]
    fn mixing_flavors_fails() {
        let mut ks = Keyset::new();
        ks.load_defaults(false).unwrap();
        assert!(matches!(
            ks.load_defaults(true),
            Err(Error::KeysetMismatch { .. })
        ));
        let data = boot9(true);
        assert!(matches!(
            ks.load_boot9(&mut MemoryStream::borrowed(&data), true),
            Err(Error::KeysetMismatch { .. })
        ));
        assert!(!ks.boot9_loaded());

        let mut ks = Keyset::new();
        ks.load_boot9(&mut MemoryStream::borrowed(&data), true).unwrap();
        assert!(matches!(
            ks.load_defaults(false),
            Err(Error::KeysetMismatch { .. })
        ));
        assert!(ks.keyx(KeyName::Slot0x25KeyX).is_err());
    }

    #[test]
    fn loading_twice_is_idempotent() {
        let mut ks = Keyset::new();
        ks.load_defaults(true).unwrap();
        let before = ks.keyx(KeyName::Slot0x18KeyX).unwrap();
        ks.load_defaults(true).unwrap();
        assert_eq!(ks.keyx(KeyName::Slot0x18KeyX).unwrap(), before);
        assert_eq!(
            before.to_be_bytes(),
            hex!("304BF1468372EE64115EBD4093D84276")
        );

        let data = boot9(false);
        ks = Keyset::new();
        ks.load_boot9(&mut MemoryStream::borrowed(&data), false).unwrap();
        let other = vec![0x55; 0x10000];
        ks.load_boot9(&mut MemoryStream::borrowed(&other), false).unwrap();
        assert_eq!(ks.keyx(KeyName::Slot0x2CKeyX).unwrap().to_be_bytes(), [0xAA; 0x10]);
    }

    #[test]
    fn truncated_boot9_is_a_range_error() {
        let data = vec![0; 0x1000];
        let mut ks = Keyset::new();
        assert!(matches!(
            ks.load_boot9(&mut MemoryStream::borrowed(&data), false),
            Err(Error::SeekRange { .. })
        ));
        assert_eq!(ks.flavor(), None);
    }

    #[test]
    fn missing_keys_are_reported_by_name() {
        let ks = Keyset::new();
        match ks.keyx(KeyName::Slot0x1BKeyX) {
            Err(Error::MissingKey { key_name, .. }) => assert_eq!(key_name, KeyName::Slot0x1BKeyX),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn keys_file_fills_empty_slots() {
        let ini = "slot0x2CKeyX=0123456789ABCDEF0123456789ABCDEF\n\
                   SLOT0X25KEYX = 00000000000000000000000000000001\n";
        let mut ks = Keyset::new();
        ks.set_keyx(KeyName::Slot0x25KeyX, Key128::new(0x25));
        ks.read_from_ini(ini.as_bytes()).unwrap();
        assert_eq!(
            ks.keyx(KeyName::Slot0x2CKeyX).unwrap().value(),
            0x0123456789ABCDEF0123456789ABCDEF
        );
        assert_eq!(ks.keyx(KeyName::Slot0x25KeyX).unwrap().value(), 0x25);
        assert!(ks.keyx(KeyName::Slot0x18KeyX).is_err());
        assert_eq!(ks.flavor(), None);
    }

    #[test]
    fn keys_file_rejects_bad_hex() {
        let mut ks = Keyset::new();
        let err = ks.read_from_ini("slot0x18KeyX=1234\n".as_bytes()).unwrap_err();
        match err {
            Error::InvalidKey { name, .. } => assert_eq!(name, "slot0x18KeyX"),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn system_titles() {
        assert!(TitleId(0x0004001000021000).is_system());
        assert!(TitleId(0x0004013000002C02).is_system());
        assert!(!TitleId(0x0004000000055D00).is_system());
    }
}
