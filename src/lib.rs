//! Nintendo 3DS content container manipulation.
//!
//! The crate is split in three layers:
//!
//! - [`stream`]: the byte-addressable stream model (files, memory buffers,
//!   windows over other streams and the AES-CTR decoder).
//! - [`pki`]: key material. KeyX sources, seeds and the hardware key
//!   scrambler.
//! - [`format`]: the NCCH container codec and the ExeFS/VFS pieces it needs.

pub mod crypto;
pub mod error;
pub mod format;
pub mod pki;
pub mod stream;
pub mod utils;
