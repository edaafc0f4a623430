//! Section handle passed to server callbacks

use std::net::SocketAddr;

use tftp::{OpenMode, SectionId, SectionRef};

use crate::error::{Error, Result};
use crate::status::SectionStatus;

/// One client transfer on a server, as seen from a callback.
///
/// Callbacks only ever receive `&Section<'_>`, so the handle cannot outlive
/// the call. Code outside a callback refers to a section by its
/// [`SectionId`] through [`TftpServer`](crate::TftpServer).
#[derive(Debug, Clone, Copy)]
pub struct Section<'a> {
    inner: SectionRef<'a>,
}

impl<'a> Section<'a> {
    pub(crate) fn new(inner: SectionRef<'a>) -> Self {
        Self { inner }
    }

    fn not_found(&self) -> Error {
        Error::SectionNotFound(self.inner.id())
    }

    pub fn section_id(&self) -> Result<SectionId> {
        self.inner.get_section_id().map_err(|_| self.not_found())
    }

    /// Client IP address in presentation form
    pub fn client_ip(&self) -> Result<String> {
        self.inner.get_client_ip().map_err(|_| self.not_found())
    }

    pub fn client_addr(&self) -> Result<SocketAddr> {
        self.inner.get_client_addr().map_err(|_| self.not_found())
    }

    /// `Undefined` until the transfer concludes
    pub fn section_status(&self) -> Result<SectionStatus> {
        self.inner
            .get_section_status()
            .map(SectionStatus::from)
            .map_err(|_| self.not_found())
    }

    /// Message the client receives (with error code 0) if this section
    /// aborts after this call
    pub fn set_error_message(&self, text: impl Into<String>) -> Result<()> {
        self.inner.set_error_message(text).map_err(|_| self.not_found())
    }

    pub fn filename(&self) -> Result<String> {
        self.inner.filename().map_err(|_| self.not_found())
    }

    pub fn mode(&self) -> Result<OpenMode> {
        self.inner.mode().map_err(|_| self.not_found())
    }
}
