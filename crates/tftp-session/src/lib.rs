//! TFTP Session Library
//!
//! Blocking client and server facades over the [`tftp`] engine.
//!
//! - [`TftpClient`] sends and fetches files, reporting errors, per-block
//!   progress and accepted options through optional callbacks.
//! - [`TftpServer`] listens on a caller-provided thread and runs every
//!   request as a *section*. Callbacks decide whether a section starts,
//!   where its data comes from or goes to, and observe how it ended.
//!
//! Every callback slot may be left empty. The defaults are: no-op for the
//! observers, and plain files on disk (optionally confined to a root
//! directory) for open-file/close-file.

mod bridge;
mod callback;
mod client;
mod error;
mod section;
mod server;
mod status;

pub use callback::{
    CloseFileCallback, ErrorCallback, FetchProgressCallback, OpenFileCallback, OptionAcceptedCallback, SectionCallback,
};
pub use client::TftpClient;
pub use error::{Error, Result};
pub use section::Section;
pub use server::TftpServer;
pub use status::{OperationResult, SectionStatus};
pub use tftp::{FileHandle, OpenMode, OpenedFile, SectionId};
