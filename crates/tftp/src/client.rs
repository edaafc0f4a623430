//! TFTP Client Implementation
//!
//! Blocking client handler: each transfer drives the async transfer loop on
//! a runtime owned by the handler and reports progress to a
//! [`TransferObserver`].

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;

use anyhow::{Context, Result, anyhow};
use tokio::runtime::Runtime;

use crate::protocol::{
    BlockSize, TftpError, TftpErrorCode, TftpOpcode, TftpRequest, TransferMode, build_ack, get_tftp_opcode,
    options, parse_ack, parse_data, parse_oack,
};
use crate::transfer::{PeerChannel, TransferConfig, create_ephemeral_socket, receive_blocks, send_blocks};

/// Events reported while a client transfer runs
pub trait TransferObserver {
    /// The transfer failed. `code` is the peer's TFTP error code when the
    /// peer sent an ERROR packet, 0 for local failures.
    fn error(&mut self, code: u16, message: &str) -> Result<()>;

    /// A DATA block of `size` bytes was stored (fetches only); an error
    /// aborts the fetch
    fn data_received(&mut self, size: usize) -> Result<()>;

    /// The server acknowledged a requested option
    fn option_accepted(&mut self, name: &str, value: &str) -> Result<()>;
}

/// Observer that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl TransferObserver for NoopObserver {
    fn error(&mut self, _code: u16, _message: &str) -> Result<()> {
        Ok(())
    }

    fn data_received(&mut self, _size: usize) -> Result<()> {
        Ok(())
    }

    fn option_accepted(&mut self, _name: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

/// Client-side protocol settings
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// `blksize` to propose; `None` sends no option and uses 512
    pub block_size: Option<u16>,
    /// Ask for `tsize` on fetches
    pub request_transfer_size: bool,
    pub transfer: TransferConfig,
}

impl ClientConfig {
    /// Attach the configured options to a request
    fn decorate(&self, mut request: TftpRequest) -> TftpRequest {
        if let Some(size) = self.block_size {
            request.with_option(options::BLKSIZE, size.to_string());
        }
        if self.request_transfer_size && request.opcode == TftpOpcode::ReadRequest {
            request.with_option(options::TSIZE, "0");
        }
        request
    }
}

#[derive(Debug)]
struct Connection {
    host: String,
    port: u16,
    /// Filled in by `config_tftp`
    resolved: Option<SocketAddr>,
}

/// Client handler owning a single-threaded runtime
pub struct ClientHandler {
    runtime: Runtime,
    config: ClientConfig,
    connection: Option<Connection>,
}

impl ClientHandler {
    pub fn create() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build client runtime")?;

        Ok(Self {
            runtime,
            config: ClientConfig::default(),
            connection: None,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut ClientConfig {
        &mut self.config
    }

    /// Record the server to talk to. Takes effect at the next
    /// [`config_tftp`](Self::config_tftp); until then transfers fail.
    pub fn set_connection(&mut self, host: &str, port: u16) -> Result<()> {
        self.connection = None;
        let host = host.trim();
        if host.is_empty() {
            return Err(anyhow!("empty host name"));
        }

        self.connection = Some(Connection {
            host: host.to_string(),
            port,
            resolved: None,
        });
        Ok(())
    }

    /// Resolve the recorded connection
    pub fn config_tftp(&mut self) -> Result<()> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("no connection set"))?;
        let (host, port) = (connection.host.as_str(), connection.port);

        let addr = self.runtime.block_on(async {
            tokio::net::lookup_host((host, port))
                .await
                .with_context(|| format!("Failed to resolve {}", host))?
                .next()
                .ok_or_else(|| anyhow!("{} did not resolve to any address", host))
        })?;

        tracing::debug!("TFTP server {}:{} resolved to {}", host, port, addr);
        connection.resolved = Some(addr);
        Ok(())
    }

    /// Resolved server address, once configured
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.connection.as_ref().and_then(|c| c.resolved)
    }

    /// Upload `source` to the server as `filename` (WRQ)
    pub fn send_file<R: Read + ?Sized>(
        &mut self,
        filename: &str,
        source: &mut R,
        observer: &mut dyn TransferObserver,
    ) -> Result<u64> {
        let server = self.require_server()?;
        let request = self
            .config
            .decorate(TftpRequest::write_request(filename, TransferMode::Octet));
        let config = self.config.transfer.clone();

        let result = self.runtime.block_on(upload(server, request, source, config, &mut *observer));
        finish(filename, result, observer)
    }

    /// Download `filename` from the server into `sink` (RRQ)
    pub fn fetch_file<W: Write + ?Sized>(
        &mut self,
        filename: &str,
        sink: &mut W,
        observer: &mut dyn TransferObserver,
    ) -> Result<u64> {
        let server = self.require_server()?;
        let request = self
            .config
            .decorate(TftpRequest::read_request(filename, TransferMode::Octet));
        let config = self.config.transfer.clone();

        let result = self.runtime.block_on(download(server, request, sink, config, &mut *observer));
        finish(filename, result, observer)
    }

    fn require_server(&self) -> Result<SocketAddr> {
        self.server_addr()
            .ok_or_else(|| anyhow!("client connection is not configured"))
    }
}

/// Log the outcome and report failures to the observer
fn finish(filename: &str, result: Result<u64>, observer: &mut dyn TransferObserver) -> Result<u64> {
    match &result {
        Ok(bytes) => tracing::info!("Transfer of '{}' complete ({} bytes)", filename, bytes),
        Err(e) => {
            tracing::warn!("Transfer of '{}' failed: {:#}", filename, e);
            let (code, message) = match e.downcast_ref::<TftpError>() {
                Some(peer) => (peer.raw_code(), peer.message.clone()),
                None => (TftpErrorCode::NotDefined.as_u16(), format!("{:#}", e)),
            };
            if let Err(e) = observer.error(code, &message) {
                tracing::debug!("Error observer failed: {:#}", e);
            }
        }
    }
    result
}

async fn upload<R: Read + ?Sized>(
    server: SocketAddr,
    request: TftpRequest,
    source: &mut R,
    config: TransferConfig,
    observer: &mut dyn TransferObserver,
) -> Result<u64> {
    let socket = create_ephemeral_socket(server, config.local_bind).await?;
    let mut channel = PeerChannel::to_request_port(socket, server, config);

    tracing::debug!("Sending WRQ for '{}' to {}", request.filename, server);
    let reply = channel
        .exchange(&request.to_packet(), |response| match get_tftp_opcode(response) {
            Some(TftpOpcode::OptionAck) => Ok(Some(response.to_vec())),
            Some(TftpOpcode::Acknowledgment) if parse_ack(response).is_ok_and(|block| block == 0) => {
                Ok(Some(response.to_vec()))
            }
            _ => Ok(None),
        })
        .await
        .with_context(|| format!("write request for '{}' failed", request.filename))?;

    let block_size = match get_tftp_opcode(&reply) {
        Some(TftpOpcode::OptionAck) => accept_options(&mut channel, &request, &reply, observer).await?,
        _ => BlockSize::DEFAULT,
    };

    send_blocks(&mut channel, source, block_size).await
}

async fn download<W: Write + ?Sized>(
    server: SocketAddr,
    request: TftpRequest,
    sink: &mut W,
    config: TransferConfig,
    observer: &mut dyn TransferObserver,
) -> Result<u64> {
    let socket = create_ephemeral_socket(server, config.local_bind).await?;
    let mut channel = PeerChannel::to_request_port(socket, server, config);

    tracing::debug!("Sending RRQ for '{}' to {}", request.filename, server);
    let reply = channel
        .exchange(&request.to_packet(), |response| match get_tftp_opcode(response) {
            Some(TftpOpcode::OptionAck) => Ok(Some(response.to_vec())),
            Some(TftpOpcode::Data) if parse_data(response).is_ok_and(|(block, _)| block == 1) => {
                Ok(Some(response.to_vec()))
            }
            _ => Ok(None),
        })
        .await
        .with_context(|| format!("read request for '{}' failed", request.filename))?;

    let (block_size, first) = match get_tftp_opcode(&reply) {
        Some(TftpOpcode::OptionAck) => (accept_options(&mut channel, &request, &reply, observer).await?, None),
        // Server ignored our options and went straight to block 1
        _ => (BlockSize::DEFAULT, Some(reply)),
    };

    receive_blocks(&mut channel, sink, block_size, build_ack(0), first, |size| {
        observer.data_received(size)
    })
    .await
}

/// Validate an OACK against what was requested and return the block size
/// to use. A server acknowledging something we never asked for, or an
/// out-of-range block size, ends the transfer with error 8.
async fn accept_options(
    channel: &mut PeerChannel,
    request: &TftpRequest,
    oack: &[u8],
    observer: &mut dyn TransferObserver,
) -> Result<usize> {
    let checked = parse_oack(oack).and_then(|accepted| {
        let block_size = check_options(request, &accepted)?;
        Ok((accepted, block_size))
    });

    let (accepted, block_size) = match checked {
        Ok(checked) => checked,
        Err(e) => {
            channel
                .abort(&TftpError::with_default_message(TftpErrorCode::OptionNegotiationFailed))
                .await;
            return Err(e.context("option negotiation failed"));
        }
    };

    for (name, value) in &accepted {
        tracing::debug!("Server accepted option {}={}", name, value);
        if let Err(e) = observer.option_accepted(name, value) {
            tracing::debug!("Option observer failed: {:#}", e);
        }
    }

    Ok(block_size)
}

fn check_options(request: &TftpRequest, accepted: &HashMap<String, String>) -> Result<usize> {
    let mut block_size = BlockSize::DEFAULT;

    for (name, value) in accepted {
        let Some(proposed) = request.options.get(name) else {
            return Err(anyhow!("server acknowledged unrequested option '{}'", name));
        };

        if name == options::BLKSIZE {
            let size: usize = value
                .parse()
                .with_context(|| format!("invalid blksize '{}'", value))?;
            let limit: usize = proposed.parse().unwrap_or(BlockSize::DEFAULT);
            if size < BlockSize::MIN || size > limit {
                return Err(anyhow!("blksize {} outside 8..={}", size, limit));
            }
            block_size = size;
        }
    }

    Ok(block_size)
}
