//! TFTP (Trivial File Transfer Protocol) Engine
//!
//! This crate provides the protocol engine behind `tftp-session`:
//! - Read (RRQ) and write (WRQ) requests, both as client and as server
//! - Block size negotiation (RFC 2348)
//! - Transfer size and timeout options (RFC 2349)
//! - Transfer-ID locking, retransmission and cooperative cancellation
//! - Concurrent server sections with per-section state
//!
//! Handlers are blocking: each one owns a tokio runtime and drives the async
//! transfer loop on it, so callers never need a runtime of their own.
//!
//! # Working with Protocol Types
//!
//! ```rust
//! use tftp::{BlockSize, TftpError, TftpErrorCode, TftpOpcode, TftpRequest, TransferMode, parse_request};
//!
//! let mut request = TftpRequest::read_request("boot.img", TransferMode::Octet);
//! request.with_option("blksize", "1400");
//!
//! let parsed = parse_request(&request.to_packet()).unwrap();
//! assert_eq!(parsed.opcode, TftpOpcode::ReadRequest);
//! assert_eq!(TftpOpcode::ReadRequest.name(), "RRQ");
//! assert!(parsed.mode.is_supported());
//!
//! let blksize = &parsed.options["blksize"];
//! assert_eq!(BlockSize::negotiate(blksize, 1024), Some(1024));
//!
//! let error = TftpError::with_default_message(TftpErrorCode::FileNotFound);
//! assert_eq!(error.raw_code(), 1);
//! ```
//!
//! # Serving Files
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tftp::{FileHandle, OpenMode, OpenedFile, SectionHooks, SectionRef, ServerHandler};
//!
//! struct Hello;
//!
//! impl SectionHooks for Hello {
//!     fn section_started(&self, _: &SectionRef<'_>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn open_file(&self, _: &SectionRef<'_>, _: &str, _: OpenMode) -> anyhow::Result<OpenedFile> {
//!         Ok(OpenedFile::reader(std::io::Cursor::new(b"hello".to_vec())).with_size(5))
//!     }
//!
//!     fn close_file(&self, _: &SectionRef<'_>, _: FileHandle) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//!
//!     fn section_finished(&self, _: &SectionRef<'_>) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let server = ServerHandler::create()?;
//!     server.set_port(6969)?;
//!     server.start_listening(Arc::new(Hello))
//! }
//! ```

mod client;
mod file;
mod protocol;
mod section;
mod server;
mod transfer;

pub use client::*;
pub use file::*;
pub use protocol::*;
pub use section::*;
pub use server::*;
pub use transfer::*;
