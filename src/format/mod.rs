//! Container formats
//!
//! - [`ncch`]: the NCCH content container, reader and writer.
//! - [`exefs`]: the executable archive stored in an NCCH.
//! - [`vfs`]: directory-like sources the NCCH writer can pack sections from.

pub mod exefs;
pub mod ncch;
pub mod vfs;
