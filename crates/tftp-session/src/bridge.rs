//! Adapters between the engine's hook traits and the facade callbacks
//!
//! Each hook looks up the matching slot. A registered callback gets the
//! facade-level values (a [`Section`] view, owned strings) and its
//! [`OperationResult`] is turned back into an engine result; an empty slot
//! falls back to the default behavior below.

use std::fs::File;
use std::io::{self, BufWriter, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::Result;
use tftp::{FileHandle, OpenMode, OpenedFile, SectionHooks, SectionRef, TransferObserver};

use crate::callback::{ClientCallbacks, ServerCallbacks};
use crate::section::Section;
use crate::status::OperationResult;

/// Observer for one client transfer, borrowing the client's slots
pub(crate) struct ClientBridge<'a> {
    callbacks: &'a mut ClientCallbacks,
}

impl<'a> ClientBridge<'a> {
    pub(crate) fn new(callbacks: &'a mut ClientCallbacks) -> Self {
        Self { callbacks }
    }
}

impl TransferObserver for ClientBridge<'_> {
    fn error(&mut self, code: u16, message: &str) -> Result<()> {
        let message = message.to_owned();
        self.callbacks
            .error
            .dispatch_mut(|callback| callback(code, &message), || OperationResult::Ok)
            .into_engine("error")
    }

    fn data_received(&mut self, size: usize) -> Result<()> {
        self.callbacks
            .fetch_progress
            .dispatch_mut(|callback| callback(size), || OperationResult::Ok)
            .into_engine("fetch-progress")
    }

    fn option_accepted(&mut self, name: &str, value: &str) -> Result<()> {
        self.callbacks
            .option_accepted
            .dispatch_mut(|callback| callback(name, value), || OperationResult::Ok)
            .into_engine("option-accepted")
    }
}

/// Hooks for one listen run, holding a snapshot of the server's slots
pub(crate) struct ServerBridge {
    callbacks: ServerCallbacks,
    root: Option<PathBuf>,
}

impl ServerBridge {
    pub(crate) fn new(callbacks: ServerCallbacks, root: Option<PathBuf>) -> Self {
        Self { callbacks, root }
    }
}

impl SectionHooks for ServerBridge {
    fn section_started(&self, section: &SectionRef<'_>) -> Result<()> {
        let section = Section::new(*section);
        self.callbacks
            .section_started
            .dispatch(|callback| callback(&section), || OperationResult::Ok)
            .into_engine("section-started")
    }

    fn open_file(&self, section: &SectionRef<'_>, filename: &str, mode: OpenMode) -> Result<OpenedFile> {
        let section = Section::new(*section);
        let opened = self.callbacks.open_file.dispatch(
            |callback| callback(&section, filename, mode),
            || default_open(self.root.as_deref(), filename, mode),
        )?;
        Ok(opened)
    }

    fn close_file(&self, section: &SectionRef<'_>, file: FileHandle) -> Result<()> {
        let section = Section::new(*section);
        self.callbacks
            .close_file
            .dispatch_with(file, |callback, file| callback(&section, file), default_close)?;
        Ok(())
    }

    fn section_finished(&self, section: &SectionRef<'_>) -> Result<()> {
        let section = Section::new(*section);
        self.callbacks
            .section_finished
            .dispatch(|callback| callback(&section), || OperationResult::Ok)
            .into_engine("section-finished")
    }
}

/// Open `filename` on disk: an existing regular file for reads (with its
/// length as the known size), a created or truncated file for writes
pub(crate) fn default_open(root: Option<&Path>, filename: &str, mode: OpenMode) -> io::Result<OpenedFile> {
    let path = match root {
        Some(root) => resolve_in_root(root, filename)?,
        None => PathBuf::from(filename),
    };

    match mode {
        OpenMode::Read => {
            let file = File::open(&path)?;
            let metadata = file.metadata()?;
            if !metadata.is_file() {
                return Err(io::Error::new(
                    ErrorKind::PermissionDenied,
                    format!("'{}' is not a regular file", filename),
                ));
            }
            Ok(OpenedFile::reader(file).with_size(metadata.len()))
        }
        OpenMode::Write => Ok(OpenedFile::writer(BufWriter::new(File::create(&path)?))),
    }
}

/// Flush writers; readers need nothing beyond being dropped
pub(crate) fn default_close(file: FileHandle) -> io::Result<()> {
    match file {
        FileHandle::Writer(mut writer) => writer.flush(),
        FileHandle::Reader(_) => Ok(()),
    }
}

/// Resolve a requested name inside `root`, refusing anything that would
/// land outside it (parent components, or symlinks pointing elsewhere)
pub(crate) fn resolve_in_root(root: &Path, filename: &str) -> io::Result<PathBuf> {
    let denied = || {
        io::Error::new(
            ErrorKind::PermissionDenied,
            format!("'{}' is outside the root directory", filename),
        )
    };

    // Clients often send absolute-looking names; treat them as root-relative
    let relative = Path::new(filename.trim_start_matches('/'));
    if filename.contains('\0')
        || relative.as_os_str().is_empty()
        || relative.components().any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(denied());
    }

    let root = root.canonicalize()?;
    let requested = root.join(relative);

    let resolved = match requested.canonicalize() {
        Ok(existing) => existing,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            // Not created yet: its directory must already be inside the root
            let (Some(parent), Some(name)) = (requested.parent(), requested.file_name()) else {
                return Err(denied());
            };
            parent.canonicalize()?.join(name)
        }
        Err(e) => return Err(e),
    };

    if !resolved.starts_with(&root) {
        return Err(denied());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_resolve_in_root() {
        let root = tempdir().unwrap();
        std::fs::create_dir(root.path().join("pxe")).unwrap();
        std::fs::write(root.path().join("pxe/boot.img"), b"x").unwrap();
        let canonical = root.path().canonicalize().unwrap();

        let existing = resolve_in_root(root.path(), "pxe/boot.img").unwrap();
        assert_eq!(existing, canonical.join("pxe/boot.img"));

        let leading_slash = resolve_in_root(root.path(), "/pxe/boot.img").unwrap();
        assert_eq!(leading_slash, existing);

        let new_file = resolve_in_root(root.path(), "pxe/new.bin").unwrap();
        assert_eq!(new_file, canonical.join("pxe/new.bin"));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = tempdir().unwrap();
        for name in ["../etc/passwd", "pxe/../../x", "", "./x", "a\0b"] {
            let err = resolve_in_root(root.path(), name).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::PermissionDenied, "{:?}", name);
        }
        // Missing directory is not a traversal, just missing
        let err = resolve_in_root(root.path(), "nodir/file").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let root = tempdir().unwrap();
        let outside = tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"s").unwrap();
        std::os::unix::fs::symlink(outside.path().join("secret"), root.path().join("link")).unwrap();

        let err = resolve_in_root(root.path(), "link").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_default_open_and_close() {
        let root = tempdir().unwrap();
        std::fs::write(root.path().join("in.txt"), b"hello").unwrap();

        let opened = default_open(Some(root.path()), "in.txt", OpenMode::Read).unwrap();
        assert_eq!(opened.size, Some(5));
        let FileHandle::Reader(mut reader) = opened.handle else {
            panic!("expected a reader");
        };
        let mut content = String::new();
        reader.read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let opened = default_open(Some(root.path()), "out.txt", OpenMode::Write).unwrap();
        let FileHandle::Writer(mut writer) = opened.handle else {
            panic!("expected a writer");
        };
        writer.write_all(b"written").unwrap();
        default_close(FileHandle::Writer(writer)).unwrap();
        assert_eq!(std::fs::read(root.path().join("out.txt")).unwrap(), b"written");

        let err = default_open(Some(root.path()), "missing", OpenMode::Read).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_client_bridge_without_callbacks() {
        let mut callbacks = ClientCallbacks::default();
        let mut bridge = ClientBridge::new(&mut callbacks);
        assert!(bridge.error(1, "File not found").is_ok());
        assert!(bridge.data_received(512).is_ok());
        assert!(bridge.option_accepted("blksize", "1024").is_ok());
    }

    #[test]
    fn test_client_bridge_progress_error_aborts() {
        let mut callbacks = ClientCallbacks::default();
        callbacks
            .fetch_progress
            .set(Box::new(|size: usize| if size < 512 { OperationResult::Error } else { OperationResult::Ok }));

        let mut bridge = ClientBridge::new(&mut callbacks);
        assert!(bridge.data_received(512).is_ok());
        assert!(bridge.data_received(3).is_err());
    }
}
