//! TFTP server facade

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tftp::{AlreadyListening, FileHandle, OpenMode, OpenedFile, SectionId, ServerHandler};

use crate::bridge::ServerBridge;
use crate::callback::ServerCallbacks;
use crate::error::{Error, Result};
use crate::section::Section;
use crate::status::{OperationResult, SectionStatus};

/// Blocking TFTP server.
///
/// [`start_listening`](Self::start_listening) runs on a thread the caller
/// provides; [`stop_listening`](Self::stop_listening) can be called from
/// any other thread.
///
/// ```no_run
/// use tftp_session::{OperationResult, TftpServer};
///
/// let mut server = TftpServer::new()?;
/// server.set_port(6969)?;
/// server.set_root_directory("/srv/tftp");
/// server.register_section_finished_callback(|section| {
///     println!("{:?} finished: {:?}", section.filename(), section.section_status());
///     OperationResult::Ok
/// });
///
/// std::thread::scope(|s| {
///     let listener = s.spawn(|| server.start_listening());
///     // ... later, from this thread:
///     server.stop_listening()?;
///     listener.join().expect("listener thread panicked")
/// })?;
/// # Ok::<(), tftp_session::Error>(())
/// ```
pub struct TftpServer {
    handler: ServerHandler,
    callbacks: ServerCallbacks,
    root: Option<PathBuf>,
}

impl TftpServer {
    pub fn new() -> Result<Self> {
        let handler = ServerHandler::create().map_err(Error::HandlerCreation)?;
        Ok(Self {
            handler,
            callbacks: ServerCallbacks::default(),
            root: None,
        })
    }

    pub fn set_port(&mut self, port: u16) -> Result<()> {
        self.handler.set_port(port).map_err(|_| Error::AlreadyListening)
    }

    /// Stop listening after `seconds` without requests or active sections;
    /// 0 listens until stopped
    pub fn set_timeout(&mut self, seconds: u64) -> Result<()> {
        self.handler
            .set_server_timeout(seconds)
            .map_err(|_| Error::AlreadyListening)
    }

    pub fn set_bind_address(&mut self, address: IpAddr) -> Result<()> {
        self.handler
            .set_bind_address(address)
            .map_err(|_| Error::AlreadyListening)
    }

    /// Retransmission interval; also how long active sections may run on
    /// after a stop before they are cancelled
    pub fn set_transfer_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.handler
            .update_config(|config| config.transfer.timeout = timeout)
            .map_err(|_| Error::AlreadyListening)
    }

    pub fn set_max_retries(&mut self, retries: usize) -> Result<()> {
        self.handler
            .update_config(|config| config.transfer.max_retries = retries)
            .map_err(|_| Error::AlreadyListening)
    }

    /// Directory the default open-file behavior serves from; without one,
    /// requested names are used as given
    pub fn set_root_directory(&mut self, root: impl Into<PathBuf>) {
        self.root = Some(root.into());
    }

    pub fn register_open_file_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Section<'_>, &str, OpenMode) -> io::Result<OpenedFile> + Send + Sync + 'static,
    {
        self.callbacks.open_file.set(Arc::new(callback));
    }

    pub fn unregister_open_file_callback(&mut self) {
        self.callbacks.open_file.clear();
    }

    pub fn register_close_file_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Section<'_>, FileHandle) -> io::Result<()> + Send + Sync + 'static,
    {
        self.callbacks.close_file.set(Arc::new(callback));
    }

    pub fn unregister_close_file_callback(&mut self) {
        self.callbacks.close_file.clear();
    }

    /// Returning [`OperationResult::Error`] refuses the request
    pub fn register_section_started_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Section<'_>) -> OperationResult + Send + Sync + 'static,
    {
        self.callbacks.section_started.set(Arc::new(callback));
    }

    pub fn unregister_section_started_callback(&mut self) {
        self.callbacks.section_started.clear();
    }

    pub fn register_section_finished_callback<F>(&mut self, callback: F)
    where
        F: Fn(&Section<'_>) -> OperationResult + Send + Sync + 'static,
    {
        self.callbacks.section_finished.set(Arc::new(callback));
    }

    pub fn unregister_section_finished_callback(&mut self) {
        self.callbacks.section_finished.clear();
    }

    /// Serve requests until stopped or idle. Blocks the calling thread;
    /// returns once every section it started has finished.
    pub fn start_listening(&self) -> Result<()> {
        tracing::debug!(
            "Starting TFTP server (custom open-file: {}, custom close-file: {}, root: {:?})",
            self.callbacks.open_file.is_registered(),
            self.callbacks.close_file.is_registered(),
            self.root
        );
        let hooks = Arc::new(ServerBridge::new(self.callbacks.clone(), self.root.clone()));
        self.handler.start_listening(hooks).map_err(|e| {
            if e.is::<AlreadyListening>() {
                Error::AlreadyListening
            } else {
                tracing::error!("TFTP server failed: {:#}", e);
                Error::Listen(e)
            }
        })
    }

    /// Request a stop. Returns immediately; a stop requested before
    /// listening starts makes the next `start_listening` return at once.
    pub fn stop_listening(&self) -> Result<()> {
        self.handler.stop_listening().map_err(Error::Listen)
    }

    pub fn is_listening(&self) -> bool {
        self.handler.is_listening()
    }

    /// Bound listener address while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.handler.local_addr()
    }

    /// Ids of the sections currently in progress
    pub fn active_sections(&self) -> Vec<SectionId> {
        self.handler.registry().active()
    }

    pub fn section_status(&self, id: SectionId) -> Result<SectionStatus> {
        self.handler
            .registry()
            .outcome(id)
            .map(SectionStatus::from)
            .map_err(|_| Error::SectionNotFound(id))
    }
}

impl Drop for TftpServer {
    fn drop(&mut self) {
        self.callbacks.clear();
    }
}
