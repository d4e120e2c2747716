use crate::format::ncch::Section;
use crate::pki::{KeyName, KeysetFlavor, TitleId};
use snafu::Snafu;
use snafu::{Backtrace, GenerateImplicitData};
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to deserialize: {}", error))]
    Deserialization { error: serde_json::error::Error },
    #[snafu(display( "{}: {}", path.display(), error))]
    Io {
        error: io::Error,
        path: PathBuf,
        backtrace: Backtrace,
    },
    #[snafu(display(
        "Internal IO Error (please submit a bug report with the backtrace): {}",
        error
    ))]
    IoInternal {
        error: io::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Error parsing the INI file: {}", error))]
    Ini {
        error: ini::Error,
        backtrace: Backtrace,
    },
    #[snafu(display("Seek to {:#x} is out of range (stream size {:#x})", pos, size))]
    SeekRange {
        pos: u64,
        size: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Short read: wanted {:#x} bytes, got {:#x}", expected, got))]
    ShortRead {
        expected: u64,
        got: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("{:#x} is not aligned to the AES block size", offset))]
    Unaligned { offset: u64, backtrace: Backtrace },
    #[snafu(display("Invalid {} magic", what))]
    InvalidMagic {
        what: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Seed for title {:?} does not match the header seed check", title_id))]
    SeedHashMismatch {
        title_id: TitleId,
        backtrace: Backtrace,
    },
    #[snafu(display("{} section is too small ({:#x} bytes)", section, size))]
    SectionTooSmall {
        section: &'static str,
        size: u64,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid key {}: {}", name, reason))]
    InvalidKey {
        name: String,
        reason: String,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid ExeFS: {}", error))]
    InvalidExefs {
        error: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing key {:?}. Make sure your keyset is complete", key_name))]
    MissingKey {
        key_name: KeyName,
        backtrace: Backtrace,
    },
    #[snafu(display("Missing seed for {:?}. Make sure your seeddb is up to date", title_id))]
    MissingSeed {
        title_id: TitleId,
        backtrace: Backtrace,
    },
    #[snafu(display("Keyset is {:?}, refusing to load {:?} keys", loaded, requested))]
    KeysetMismatch {
        loaded: KeysetFlavor,
        requested: KeysetFlavor,
        backtrace: Backtrace,
    },
    #[snafu(display("Container has no {} section", section))]
    MissingSection {
        section: Section,
        backtrace: Backtrace,
    },
    #[snafu(display("Unknown crypt method {:#04x}", method))]
    UnknownCryptMethod { method: u8, backtrace: Backtrace },
    #[snafu(display("No ExeFS file named {:?}", name))]
    MissingExefsFile { name: String, backtrace: Backtrace },
    #[snafu(display("Invalid operation: {}", reason))]
    InvalidOperation {
        reason: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Unsupported NCCH format version {}", version))]
    UnsupportedVersion { version: u16, backtrace: Backtrace },
    #[snafu(display("Unsupported: {}", what))]
    Unsupported {
        what: &'static str,
        backtrace: Backtrace,
    },
    #[snafu(display("Invalid section tag {}", tag))]
    InvalidSection { tag: u8, backtrace: Backtrace },
}

impl Error {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Error {
        if let Error::IoInternal { error, backtrace } = self {
            Error::Io {
                error,
                path: path.as_ref().to_owned(),
                backtrace,
            }
        } else {
            self
        }
    }
}

pub trait ResultExt {
    fn with_path<T: AsRef<Path>>(self, path: T) -> Self;
}

impl<T> ResultExt for Result<T, Error> {
    fn with_path<U: AsRef<Path>>(self, path: U) -> Result<T, Error> {
        self.map_err(|err| err.with_path(path))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IoInternal {
            error: err,
            backtrace: Backtrace::generate(),
        }
    }
}

impl<T: AsRef<Path>> From<(io::Error, T)> for Error {
    fn from((error, path): (io::Error, T)) -> Error {
        Error::Io {
            error,
            path: path.as_ref().to_owned(),
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<ini::Error> for Error {
    fn from(error: ini::Error) -> Error {
        Error::Ini {
            error,
            backtrace: Backtrace::generate(),
        }
    }
}

impl From<serde_json::error::Error> for Error {
    fn from(error: serde_json::error::Error) -> Error {
        Error::Deserialization { error }
    }
}
