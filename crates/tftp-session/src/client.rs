//! TFTP client facade

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use tftp::ClientHandler;

use crate::bridge::ClientBridge;
use crate::callback::ClientCallbacks;
use crate::error::{Error, Result};
use crate::status::OperationResult;

/// Blocking TFTP client.
///
/// ```no_run
/// use tftp_session::{OperationResult, TftpClient};
///
/// let mut client = TftpClient::new()?;
/// client.set_connection("192.0.2.10", 69)?;
/// client.register_error_callback(|code, message| {
///     eprintln!("server error {}: {}", code, message);
///     OperationResult::Ok
/// });
///
/// let mut image = Vec::new();
/// client.fetch_file("pxelinux.0", &mut image)?;
/// # Ok::<(), tftp_session::Error>(())
/// ```
pub struct TftpClient {
    handler: ClientHandler,
    callbacks: ClientCallbacks,
}

impl TftpClient {
    pub fn new() -> Result<Self> {
        let handler = ClientHandler::create().map_err(Error::HandlerCreation)?;
        Ok(Self {
            handler,
            callbacks: ClientCallbacks::default(),
        })
    }

    /// Point the client at a server. May be called again at any time; the
    /// next transfer goes to the new peer. On failure the client is left
    /// unconnected.
    pub fn set_connection(&mut self, host: &str, port: u16) -> Result<()> {
        self.handler
            .set_connection(host, port)
            .and_then(|()| self.handler.config_tftp())
            .map_err(|reason| Error::Connection {
                host: host.to_string(),
                port,
                reason,
            })?;

        if let Some(addr) = self.handler.server_addr() {
            tracing::debug!("TFTP client connected to {}", addr);
        }
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.handler.server_addr().is_some()
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.handler.server_addr()
    }

    /// Block size to propose with `blksize`; `None` uses the protocol default
    pub fn set_block_size(&mut self, size: Option<u16>) {
        self.handler.config_mut().block_size = size;
    }

    /// Ask the server for the file size (`tsize`) on fetches
    pub fn set_request_transfer_size(&mut self, enabled: bool) {
        self.handler.config_mut().request_transfer_size = enabled;
    }

    pub fn set_transfer_timeout(&mut self, timeout: Duration) {
        self.handler.config_mut().transfer.timeout = timeout;
    }

    pub fn set_max_retries(&mut self, retries: usize) {
        self.handler.config_mut().transfer.max_retries = retries;
    }

    /// Upload everything `source` yields as `filename`
    pub fn send_file<R: Read + ?Sized>(&mut self, filename: &str, source: &mut R) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut bridge = ClientBridge::new(&mut self.callbacks);
        self.handler
            .send_file(filename, source, &mut bridge)
            .map(|_| ())
            .map_err(|reason| Error::Transfer {
                filename: filename.to_string(),
                reason,
            })
    }

    /// Download `filename` into `sink`
    pub fn fetch_file<W: Write + ?Sized>(&mut self, filename: &str, sink: &mut W) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let mut bridge = ClientBridge::new(&mut self.callbacks);
        self.handler
            .fetch_file(filename, sink, &mut bridge)
            .map(|_| ())
            .map_err(|reason| Error::Transfer {
                filename: filename.to_string(),
                reason,
            })
    }

    /// Called with the TFTP error code and message when a transfer fails
    /// (code 0 for local failures)
    pub fn register_error_callback<F>(&mut self, callback: F)
    where
        F: FnMut(u16, &str) -> OperationResult + Send + 'static,
    {
        self.callbacks.error.set(Box::new(callback));
    }

    pub fn unregister_error_callback(&mut self) {
        self.callbacks.error.clear();
    }

    /// Called with the payload size of every block a fetch receives;
    /// returning [`OperationResult::Error`] aborts the fetch
    pub fn register_fetch_progress_callback<F>(&mut self, callback: F)
    where
        F: FnMut(usize) -> OperationResult + Send + 'static,
    {
        self.callbacks.fetch_progress.set(Box::new(callback));
    }

    pub fn unregister_fetch_progress_callback(&mut self) {
        self.callbacks.fetch_progress.clear();
    }

    /// Called for each option the server acknowledges
    pub fn register_option_accepted_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&str, &str) -> OperationResult + Send + 'static,
    {
        self.callbacks.option_accepted.set(Box::new(callback));
    }

    pub fn unregister_option_accepted_callback(&mut self) {
        self.callbacks.option_accepted.clear();
    }
}

impl Drop for TftpClient {
    fn drop(&mut self) {
        self.callbacks.clear();
    }
}
