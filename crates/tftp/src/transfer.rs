//! TFTP File Transfer Logic
//!
//! This module handles the block-level transfer loop shared by the client
//! and server handlers: a [`PeerChannel`] that owns one transfer socket and
//! retransmits until the peer answers, plus the two streaming directions
//! ([`send_blocks`] and [`receive_blocks`]).

use std::io::{ErrorKind, Read, Write};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tokio::net::UdpSocket;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tokio::time::{Instant, timeout_at};

use crate::protocol::{
    BlockSize, MAX_PACKET_SIZE, TftpError, TftpErrorCode, TftpOpcode, build_ack, build_data, get_tftp_opcode,
    parse_ack, parse_data, parse_tftp_error,
};

const TIMEOUT_SECS: u64 = 3;
const MAX_RETRIES: usize = 8;

/// Transfer session configuration
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Largest block size accepted when a peer proposes `blksize`
    pub max_block_size: usize,
    /// Retransmission interval
    pub timeout: Duration,
    /// Number of times a packet is sent before the transfer is abandoned
    pub max_retries: usize,
    /// Local address for transfer sockets; unspecified when `None`
    pub local_bind: Option<IpAddr>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_block_size: BlockSize::MAX,
            timeout: Duration::from_secs(TIMEOUT_SECS),
            max_retries: MAX_RETRIES,
            local_bind: None,
        }
    }
}

/// Run blocking work (embedder hooks, source and sink I/O) from async code.
///
/// On a multi-thread runtime the worker hands its other tasks to a fresh
/// worker first, so a slow hook never holds up other transfers or their
/// retransmission timers. A current-thread runtime runs `f` in place.
pub fn run_blocking<T>(f: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => tokio::task::block_in_place(f),
        _ => f(),
    }
}

/// Create an ephemeral UDP socket appropriate for the peer address family
pub async fn create_ephemeral_socket(peer: SocketAddr, local_bind: Option<IpAddr>) -> Result<UdpSocket> {
    let bind_addr = if let Some(ip) = local_bind {
        SocketAddr::new(ip, 0)
    } else {
        match peer {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        }
    };

    let sock = UdpSocket::bind(bind_addr)
        .await
        .context("failed to bind ephemeral socket")?;

    tracing::debug!("Transfer socket bound to {}", sock.local_addr()?);
    Ok(sock)
}

/// Socket plus the transfer identifier (address and port) of the other side
struct PeerLink {
    socket: UdpSocket,
    peer: SocketAddr,
    /// False until the peer's TID is known (client side, before the first reply)
    locked: bool,
    buf: Vec<u8>,
}

impl PeerLink {
    /// Receive a packet from the peer, answering strangers with error 5
    async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            let (n, src) = self.socket.recv_from(&mut self.buf).await?;

            if self.locked && src == self.peer {
                return Ok(self.buf[..n].to_vec());
            }

            if !self.locked && src.ip() == self.peer.ip() {
                tracing::debug!("Peer transfer ID is {}", src);
                self.peer = src;
                self.locked = true;
                return Ok(self.buf[..n].to_vec());
            }

            tracing::debug!("Ignoring packet from unexpected source {}", src);
            let reply = TftpError::with_default_message(TftpErrorCode::UnknownTransferId).to_packet();
            if let Err(e) = self.socket.send_to(&reply, src).await {
                tracing::debug!("Failed to answer stray packet from {}: {}", src, e);
            }
        }
    }
}

/// One side of a transfer: the socket, the peer, and retransmission policy
pub struct PeerChannel {
    link: PeerLink,
    config: TransferConfig,
    cancel: Option<watch::Receiver<bool>>,
    /// Replaces the message of every locally raised abort
    abort_message: Option<String>,
}

impl PeerChannel {
    /// Channel to a peer whose transfer ID is already known
    pub fn new(socket: UdpSocket, peer: SocketAddr, config: TransferConfig) -> Self {
        Self {
            link: PeerLink {
                socket,
                peer,
                locked: true,
                buf: vec![0u8; MAX_PACKET_SIZE],
            },
            config,
            cancel: None,
            abort_message: None,
        }
    }

    /// Channel whose first packet goes to a server's request port; the
    /// peer's transfer ID is taken from the first reply from the same host
    pub fn to_request_port(socket: UdpSocket, server: SocketAddr, config: TransferConfig) -> Self {
        let mut channel = Self::new(socket, server, config);
        channel.link.locked = false;
        channel
    }

    /// Abort waits with an error once `cancel` turns true
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn peer(&self) -> SocketAddr {
        self.link.peer
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Change the retransmission interval, e.g. after a `timeout` option
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.config.timeout = timeout;
    }

    /// Send one packet without waiting for an answer
    pub async fn send(&self, packet: &[u8]) -> Result<()> {
        self.link
            .socket
            .send_to(packet, self.link.peer)
            .await
            .with_context(|| format!("failed to send to {}", self.link.peer))?;
        Ok(())
    }

    /// Send `message` with code 0 instead of the engine's own error
    /// whenever this side aborts
    pub fn set_abort_message(&mut self, message: Option<String>) {
        self.abort_message = message;
    }

    /// Tell the peer the transfer is over; failures are only logged
    pub async fn abort(&self, error: &TftpError) {
        let packet = match &self.abort_message {
            Some(message) => TftpError::new(TftpErrorCode::NotDefined, message.as_str()).to_packet(),
            None => error.to_packet(),
        };
        tracing::debug!("Aborting transfer with {}: {}", self.link.peer, error);
        if let Err(e) = self.send(&packet).await {
            tracing::debug!("Failed to send error packet: {}", e);
        }
    }

    /// Send `packet` and wait for a reply that `accept` takes.
    ///
    /// `accept` returns `Ok(None)` for packets to ignore (duplicates, stale
    /// acknowledgments); those do not restart the retransmission interval.
    /// An ERROR packet from the peer ends the exchange with a [`TftpError`].
    pub async fn exchange<T>(&mut self, packet: &[u8], mut accept: impl FnMut(&[u8]) -> Result<Option<T>>) -> Result<T> {
        let attempts = self.config.max_retries.max(1);

        for attempt in 0..attempts {
            self.send(packet).await?;
            let deadline = Instant::now() + self.config.timeout;

            loop {
                let link = &mut self.link;
                let cancel = &mut self.cancel;

                let received = tokio::select! {
                    received = timeout_at(deadline, link.recv()) => Some(received),
                    _ = cancelled(cancel) => None,
                };

                let Some(received) = received else {
                    self.abort(&TftpError::new(TftpErrorCode::NotDefined, "Server shutting down"))
                        .await;
                    return Err(anyhow!("transfer cancelled"));
                };

                let Ok(received) = received else {
                    tracing::debug!(
                        "Timed out waiting for {} (attempt {}/{})",
                        self.link.peer,
                        attempt + 1,
                        attempts
                    );
                    break;
                };
                let response = received?;

                if get_tftp_opcode(&response) == Some(TftpOpcode::Error) {
                    return Err(parse_tftp_error(&response)?.into());
                }

                if let Some(value) = accept(&response)? {
                    return Ok(value);
                }
            }
        }

        Err(anyhow!(
            "No response from {} after {} attempts",
            self.link.peer,
            attempts
        ))
    }
}

async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = cancel {
        let signalled = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if signalled.is_ok() {
            return;
        }
    }
    // No cancel source, or its sender is gone: never cancelled
    std::future::pending::<()>().await
}

/// Fill `buf` from `source`, stopping early only at end of input
fn read_block<R: Read + ?Sized>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Stream `source` to the peer in DATA blocks, waiting for each ACK.
///
/// The final block is shorter than `block_size`; a source whose length is an
/// exact multiple of the block size (including an empty source) ends with an
/// empty block. Returns the number of payload bytes sent.
pub async fn send_blocks<R: Read + ?Sized>(channel: &mut PeerChannel, source: &mut R, block_size: usize) -> Result<u64> {
    let mut buf = vec![0u8; block_size];
    let mut block: u16 = 1;
    let mut total = 0u64;

    loop {
        let len = match run_blocking(|| read_block(source, &mut buf)) {
            Ok(len) => len,
            Err(e) => {
                channel.abort(&TftpError::from_io(&e)).await;
                return Err(e).context("failed to read from source");
            }
        };

        let packet = build_data(block, &buf[..len]);
        channel
            .exchange(&packet, |response| Ok(parse_ack(response).ok().filter(|&ack| ack == block)))
            .await
            .with_context(|| format!("block {} not acknowledged", block))?;

        total += len as u64;

        // A short block ends the transfer
        if len < block_size {
            return Ok(total);
        }

        block = block.wrapping_add(1);
    }
}

/// Receive DATA blocks from the peer into `sink`, acknowledging each one.
///
/// `opening` is the packet that solicits block 1 (ACK(0) or OACK for a
/// server, the request for a client); it is what gets retransmitted while
/// block 1 is outstanding. `first` is a DATA(1) packet that already arrived,
/// if any. `on_block` sees each payload size; an error from it aborts the
/// transfer. Returns the number of payload bytes received.
pub async fn receive_blocks<W, F>(
    channel: &mut PeerChannel,
    sink: &mut W,
    block_size: usize,
    opening: Vec<u8>,
    first: Option<Vec<u8>>,
    mut on_block: F,
) -> Result<u64>
where
    W: Write + ?Sized,
    F: FnMut(usize) -> Result<()>,
{
    let mut expected: u16 = 1;
    let mut reply = opening;
    let mut pending = first;
    let mut total = 0u64;

    loop {
        let packet = match pending.take() {
            Some(packet) => packet,
            None => {
                channel
                    .exchange(&reply, |response| match parse_data(response) {
                        Ok((block, _)) if block == expected => Ok(Some(response.to_vec())),
                        _ => Ok(None),
                    })
                    .await?
            }
        };

        let (block, payload) = parse_data(&packet)?;

        if payload.len() > block_size {
            channel
                .abort(&TftpError::new(TftpErrorCode::IllegalOperation, "Block larger than negotiated"))
                .await;
            return Err(anyhow!(
                "block {} carries {} bytes, negotiated {}",
                block,
                payload.len(),
                block_size
            ));
        }

        if let Err(e) = run_blocking(|| sink.write_all(payload)) {
            channel.abort(&TftpError::from_io(&e)).await;
            return Err(e).context("failed to write to sink");
        }
        total += payload.len() as u64;

        if let Err(e) = on_block(payload.len()) {
            channel
                .abort(&TftpError::new(TftpErrorCode::NotDefined, "Transfer aborted"))
                .await;
            return Err(e);
        }

        reply = build_ack(block);

        if payload.len() < block_size {
            channel.send(&reply).await?;
            run_blocking(|| sink.flush()).context("failed to flush sink")?;
            return Ok(total);
        }

        expected = expected.wrapping_add(1);
    }
}
