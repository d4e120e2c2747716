//! Directory-like sources for generated sections.
//!
//! The NCCH writer never walks the host filesystem itself. When a section is
//! generated from a tree of files, it goes through a [`VirtualDirectory`]
//! and a [`DirectoryPacker`] that knows the section's format.
//!
//! [`Vfs`] is the stock implementation: a flat table of nodes addressed by
//! normalized absolute paths, where the parent of a node is implied by its
//! path prefix.

use crate::error::{Error, InvalidOperationSnafu};
use crate::stream::{FileStream, MemoryStream, ReadStream, WriteStream};
use snafu::ensure;
use std::io::{self, ErrorKind};
use std::path::PathBuf;

/// A child of a directory, as returned by [`VirtualDirectory::children`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Absolute path of the child, usable with [`VirtualDirectory::open`].
    pub path: String,
    pub is_dir: bool,
}

pub trait VirtualDirectory {
    /// List the direct children of the directory at `dir`, in a stable order.
    fn children(&self, dir: &str) -> Result<Vec<DirEntry>, Error>;

    /// Open the file at `path` for reading.
    fn open(&self, path: &str) -> Result<Box<dyn ReadStream + '_>, Error>;
}

/// Serializes a [`VirtualDirectory`] into a section image.
pub trait DirectoryPacker {
    /// Write the section generated from `dir` to `ws`, sequentially, and
    /// return the number of bytes written.
    fn pack(&self, dir: &dyn VirtualDirectory, ws: &mut dyn WriteStream) -> Result<u64, Error>;
}

#[derive(Debug, Clone)]
pub enum FileSource {
    HostPath(PathBuf),
    Memory(Vec<u8>),
}

#[derive(Debug, Clone)]
enum NodeKind {
    Directory,
    File(FileSource),
}

#[derive(Debug, Clone)]
struct Node {
    path: String,
    kind: NodeKind,
}

/// Normalize `path` into `/a/b/c` form. `.` components and repeated
/// separators are dropped; `..` is rejected.
pub fn normalize_path(path: &str) -> Result<String, Error> {
    let mut out = String::new();
    for component in path.split('/') {
        match component {
            "" | "." => (),
            ".." => {
                return InvalidOperationSnafu {
                    reason: "parent components are not allowed in VFS paths",
                }
                .fail()
            }
            c => {
                out.push('/');
                out.push_str(c);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn name_of(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

#[derive(Debug, Clone)]
pub struct Vfs {
    nodes: Vec<Node>,
}

impl Default for Vfs {
    fn default() -> Vfs {
        Vfs {
            nodes: vec![Node {
                path: String::from("/"),
                kind: NodeKind::Directory,
            }],
        }
    }
}

impl Vfs {
    pub fn new() -> Vfs {
        Vfs::default()
    }

    fn find(&self, path: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.path == path)
    }

    fn insert(&mut self, path: String, kind: NodeKind) -> Result<(), Error> {
        if path != "/" {
            self.ensure_directory(parent_of(&path).to_owned())?;
        }
        match self.find(&path) {
            Some(idx) => {
                ensure!(
                    matches!(self.nodes[idx].kind, NodeKind::File(_))
                        == matches!(kind, NodeKind::File(_)),
                    InvalidOperationSnafu {
                        reason: "a VFS node can't change between file and directory",
                    }
                );
                self.nodes[idx].kind = kind;
            }
            None => self.nodes.push(Node { path, kind }),
        }
        Ok(())
    }

    fn ensure_directory(&mut self, path: String) -> Result<(), Error> {
        match self.find(&path) {
            Some(idx) => {
                ensure!(
                    matches!(self.nodes[idx].kind, NodeKind::Directory),
                    InvalidOperationSnafu {
                        reason: "a VFS file can't have children",
                    }
                );
                Ok(())
            }
            None => self.insert(path, NodeKind::Directory),
        }
    }

    /// Add a directory, creating missing parents.
    pub fn add_directory(&mut self, path: &str) -> Result<(), Error> {
        let path = normalize_path(path)?;
        self.ensure_directory(path)
    }

    /// Add a file, creating missing parents. Adding a file twice replaces
    /// its source.
    pub fn add_file(&mut self, path: &str, source: FileSource) -> Result<(), Error> {
        let path = normalize_path(path)?;
        ensure!(
            path != "/",
            InvalidOperationSnafu {
                reason: "the VFS root is a directory",
            }
        );
        self.insert(path, NodeKind::File(source))
    }

    pub fn add_host_file<P: Into<PathBuf>>(&mut self, path: &str, host_path: P) -> Result<(), Error> {
        self.add_file(path, FileSource::HostPath(host_path.into()))
    }

    pub fn add_memory_file(&mut self, path: &str, data: Vec<u8>) -> Result<(), Error> {
        self.add_file(path, FileSource::Memory(data))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        // The root always exists.
        self.nodes.len() == 1
    }
}

fn not_found(path: &str) -> Error {
    (io::Error::new(ErrorKind::NotFound, "no such VFS node"), path).into()
}

impl VirtualDirectory for Vfs {
    fn children(&self, dir: &str) -> Result<Vec<DirEntry>, Error> {
        let dir = normalize_path(dir)?;
        let idx = self.find(&dir).ok_or_else(|| not_found(&dir))?;
        ensure!(
            matches!(self.nodes[idx].kind, NodeKind::Directory),
            InvalidOperationSnafu {
                reason: "not a directory",
            }
        );

        Ok(self
            .nodes
            .iter()
            .filter(|node| node.path != "/" && parent_of(&node.path) == dir)
            .map(|node| DirEntry {
                name: name_of(&node.path).to_owned(),
                path: node.path.clone(),
                is_dir: matches!(node.kind, NodeKind::Directory),
            })
            .collect())
    }

    fn open(&self, path: &str) -> Result<Box<dyn ReadStream + '_>, Error> {
        let path = normalize_path(path)?;
        let idx = self.find(&path).ok_or_else(|| not_found(&path))?;
        match &self.nodes[idx].kind {
            NodeKind::File(FileSource::HostPath(host)) => Ok(Box::new(FileStream::open(host)?)),
            NodeKind::File(FileSource::Memory(data)) => Ok(Box::new(MemoryStream::borrowed(data))),
            NodeKind::Directory => InvalidOperationSnafu {
                reason: "can't open a directory",
            }
            .fail(),
        }
    }
}
