//! File handles exchanged between the server handler and its embedder
//!
//! The server never touches the filesystem itself: the `open_file` hook of
//! [`SectionHooks`](crate::SectionHooks) hands back an [`OpenedFile`] and the
//! handler streams it, then gives the handle back through `close_file`.

use std::fmt;
use std::io::{Read, Write};

/// Direction a file is opened in, from the server's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenMode {
    /// The client reads (RRQ); the server reads the file
    Read,
    /// The client writes (WRQ); the server writes the file
    Write,
}

impl OpenMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpenMode::Read => "read",
            OpenMode::Write => "write",
        }
    }
}

impl fmt::Display for OpenMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An open file owned by the transfer for its lifetime
pub enum FileHandle {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn Write + Send>),
}

impl FileHandle {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        FileHandle::Reader(Box::new(reader))
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        FileHandle::Writer(Box::new(writer))
    }

    /// The mode this handle can serve
    pub fn mode(&self) -> OpenMode {
        match self {
            FileHandle::Reader(_) => OpenMode::Read,
            FileHandle::Writer(_) => OpenMode::Write,
        }
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileHandle::Reader(_) => f.write_str("FileHandle::Reader(..)"),
            FileHandle::Writer(_) => f.write_str("FileHandle::Writer(..)"),
        }
    }
}

/// Result of opening a file: the handle plus its size when known.
///
/// A known size lets the server answer a `tsize` option on reads.
#[derive(Debug)]
pub struct OpenedFile {
    pub handle: FileHandle,
    pub size: Option<u64>,
}

impl OpenedFile {
    pub fn reader(reader: impl Read + Send + 'static) -> Self {
        Self {
            handle: FileHandle::reader(reader),
            size: None,
        }
    }

    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self {
            handle: FileHandle::writer(writer),
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }
}
