use crate::error::{Error, InvalidKeySnafu};
use aes::Aes128;
use cipher::{KeyIvInit, StreamCipher};
use std::fmt;
use std::ops::{Add, BitXor};

/// A 128-bit AES key, keyslot input or counter.
///
/// Stored as a native integer; the byte representation is always big-endian.
/// Addition and rotations wrap modulo 2^128.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Key128(u128);

impl Key128 {
    pub const fn new(value: u128) -> Key128 {
        Key128(value)
    }

    pub fn from_be_bytes(bytes: [u8; 0x10]) -> Key128 {
        Key128(u128::from_be_bytes(bytes))
    }

    /// Import the first 16 bytes of `bytes` as a big-endian value.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is shorter than 16 bytes.
    pub fn from_be_slice(bytes: &[u8]) -> Key128 {
        let mut raw = [0; 0x10];
        raw.copy_from_slice(&bytes[..0x10]);
        Key128::from_be_bytes(raw)
    }

    pub fn to_be_bytes(&self) -> [u8; 0x10] {
        self.0.to_be_bytes()
    }

    pub fn value(&self) -> u128 {
        self.0
    }

    /// Parse a 32 digit hexstring, with or without a `0x` prefix.
    pub fn from_hex(s: &str) -> Result<Key128, Error> {
        Key128::from_hex_named("hexstring", s)
    }

    pub(crate) fn from_hex_named(name: &str, s: &str) -> Result<Key128, Error> {
        let digits = s
            .strip_prefix("0x")
            .or_else(|| s.strip_prefix("0X"))
            .unwrap_or(s);
        if digits.len() != 32 {
            return InvalidKeySnafu {
                name,
                reason: format!("expected 32 hex digits, got {}", digits.len()),
            }
            .fail();
        }
        if let Some(c) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
            return InvalidKeySnafu {
                name,
                reason: format!("invalid character {:?}", c),
            }
            .fail();
        }
        u128::from_str_radix(digits, 16)
            .map(Key128)
            .map_err(|err| {
                InvalidKeySnafu {
                    name,
                    reason: err.to_string(),
                }
                .build()
            })
    }

    pub fn rol(&self, n: u32) -> Key128 {
        Key128(self.0.rotate_left(n))
    }

    pub fn ror(&self, n: u32) -> Key128 {
        Key128(self.0.rotate_right(n))
    }

    /// Encrypt or decrypt `buf` in place with AES-128-CTR, starting at counter
    /// `ctr`.
    pub fn apply_ctr(&self, buf: &mut [u8], ctr: &Key128) {
        let mut cipher = ctr::Ctr128BE::<Aes128>::new(
            &self.to_be_bytes().into(),
            &ctr.to_be_bytes().into(),
        );
        cipher.apply_keystream(buf);
    }
}

impl From<u128> for Key128 {
    fn from(value: u128) -> Key128 {
        Key128(value)
    }
}

impl From<Key128> for u128 {
    fn from(key: Key128) -> u128 {
        key.0
    }
}

impl BitXor for Key128 {
    type Output = Key128;

    fn bitxor(self, rhs: Key128) -> Key128 {
        Key128(self.0 ^ rhs.0)
    }
}

impl Add for Key128 {
    type Output = Key128;

    fn add(self, rhs: Key128) -> Key128 {
        Key128(self.0.wrapping_add(rhs.0))
    }
}

impl fmt::Display for Key128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032X}", self.0)
    }
}

impl fmt::Debug for Key128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Key128")
            .field(&format_args!("{}", self))
            .finish()
    }
}

impl serde::Serialize for Key128 {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Key128 {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Key128, D::Error> {
        let s = <std::borrow::Cow<'de, str>>::deserialize(deserializer)?;
        Key128::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hex_literal::hex;

    const SAMPLE: Key128 = Key128::new(0x0123456789ABCDEFFEDCBA9876543210);

    #[test]
    fn byte_order_is_big_endian() {
        let key = Key128::from_be_bytes(hex!("000102030405060708090A0B0C0D0E0F"));
        assert_eq!(key.value(), 0x000102030405060708090A0B0C0D0E0F);
        assert_eq!(key.to_be_bytes(), hex!("000102030405060708090A0B0C0D0E0F"));
        assert_eq!(Key128::from_be_slice(&[0xFF; 0x20]).value(), u128::MAX);
    }

    #[test]
    fn rotations_invert_each_other() {
        for n in 0..64 {
            assert_eq!(SAMPLE.ror(n).rol(n), SAMPLE);
            assert_eq!(SAMPLE.rol(n).ror(n), SAMPLE);
        }
        assert_eq!(SAMPLE.rol(0), SAMPLE);
        assert_eq!(SAMPLE.ror(0), SAMPLE);
        assert_eq!(Key128::new(1).ror(1), Key128::new(1 << 127));
    }

    #[test]
    fn add_carries_between_halves() {
        let low_max = Key128::new(u64::MAX as u128);
        assert_eq!((low_max + Key128::new(1)).value(), 1 << 64);
        assert_eq!((Key128::new(u128::MAX) + Key128::new(2)).value(), 1);
    }

    #[test]
    fn xor_is_bitwise() {
        assert_eq!(SAMPLE ^ SAMPLE, Key128::default());
        assert_eq!(
            (Key128::new(0xF0) ^ Key128::new(0x0F)).value(),
            0xFF
        );
    }

    #[test]
    fn hex_parsing() {
        assert_eq!(
            Key128::from_hex("0x0123456789abcdefFEDCBA9876543210").unwrap(),
            SAMPLE
        );
        assert_eq!(SAMPLE.to_string(), "0123456789ABCDEFFEDCBA9876543210");
        assert!(matches!(
            Key128::from_hex("0123"),
            Err(Error::InvalidKey { .. })
        ));
        assert!(matches!(
            Key128::from_hex("0123456789ABCDEFFEDCBA987654321G"),
            Err(Error::InvalidKey { .. })
        ));
    }

    #[test]
    fn ctr_round_trips() {
        let key = Key128::new(0x2B7E151628AED2A6ABF7158809CF4F3C);
        let ctr = Key128::new(0xF0F1F2F3F4F5F6F7F8F9FAFBFCFDFEFF);
        let plain = [0x42; 0x40];
        let mut buf = plain;
        key.apply_ctr(&mut buf, &ctr);
        assert_ne!(buf, plain);
        key.apply_ctr(&mut buf, &ctr);
        assert_eq!(buf, plain);
    }

    #[test]
    fn ctr_matches_nist_vector() {
        // SP 800-38A F.5.1, first block.
        let key = Key128::new(0x2B7E151628AED2A6ABF7158809CF4F3C);
        let ctr = Key128::new(0xF0F1F2F3F4F5F6F7F8F9FAFBFCFDFEFF);
        let mut buf = hex!("6BC1BEE22E409F96E93D7E117393172A");
        key.apply_ctr(&mut buf, &ctr);
        assert_eq!(buf, hex!("874D6191B620E3261BEF6864990DB6CE"));
    }
}
