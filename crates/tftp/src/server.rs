//! TFTP Server Implementation
//!
//! This module contains the server handler: a listener that accepts RRQ and
//! WRQ requests and runs each one as a section on its own transfer socket.
//! What a section reads from or writes to is decided by the embedder through
//! [`SectionHooks`].

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::file::{FileHandle, OpenMode, OpenedFile};
use crate::protocol::{
    BlockSize, MAX_PACKET_SIZE, TftpError, TftpErrorCode, TftpOpcode, TftpRequest, build_ack, build_oack,
    get_tftp_opcode, options, parse_ack, parse_request,
};
use crate::section::{SectionId, SectionRef, SectionRegistry};
use crate::transfer::{
    PeerChannel, TransferConfig, create_ephemeral_socket, receive_blocks, run_blocking, send_blocks,
};

/// Well-known TFTP port
pub const DEFAULT_PORT: u16 = 69;

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 300;
const WORKER_THREADS: usize = 2;

/// Callbacks a server invokes while running a section.
///
/// For every section the order is `section_started`, `open_file`, the
/// transfer, `close_file` (only if `open_file` succeeded), then
/// `section_finished`. Hooks may block and may be called for several
/// sections at once; a blocked hook does not hold up other sections.
pub trait SectionHooks: Send + Sync + 'static {
    /// A request arrived; an error refuses it
    fn section_started(&self, section: &SectionRef<'_>) -> Result<()>;

    /// Produce the file to serve. An [`std::io::Error`] inside the returned
    /// error picks the TFTP error code the client receives.
    fn open_file(&self, section: &SectionRef<'_>, filename: &str, mode: OpenMode) -> Result<OpenedFile>;

    /// Release the file; an error fails the section
    fn close_file(&self, section: &SectionRef<'_>, file: FileHandle) -> Result<()>;

    /// The section's status is final; errors are only logged
    fn section_finished(&self, section: &SectionRef<'_>) -> Result<()>;
}

/// Returned by [`ServerHandler::start_listening`] when a listen run is
/// already in progress on the same handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyListening;

impl fmt::Display for AlreadyListening {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("server is already listening")
    }
}

impl std::error::Error for AlreadyListening {}

/// TFTP Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    pub port: u16,
    /// Stop listening after this long with no request and no active
    /// section; `None` listens until stopped
    pub idle_timeout: Option<Duration>,
    pub transfer: TransferConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            idle_timeout: Some(Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS)),
            transfer: TransferConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }
}

/// Server handler owning its runtime, listener state and section registry.
///
/// [`start_listening`](Self::start_listening) blocks the calling thread;
/// [`stop_listening`](Self::stop_listening) may be called from any other
/// thread, before or while it runs.
pub struct ServerHandler {
    runtime: Runtime,
    config: Mutex<ServerConfig>,
    registry: Arc<SectionRegistry>,
    stop: watch::Sender<bool>,
    listening: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl ServerHandler {
    /// Create a server handler with the default configuration
    pub fn create() -> Result<Self> {
        Self::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("tftp-server")
            .enable_all()
            .build()
            .context("Failed to build server runtime")?;

        Ok(Self {
            runtime,
            config: Mutex::new(config),
            registry: Arc::new(SectionRegistry::new()),
            stop: watch::Sender::new(false),
            listening: AtomicBool::new(false),
            local_addr: Mutex::new(None),
        })
    }

    /// Snapshot of the current configuration
    pub fn config(&self) -> ServerConfig {
        self.config.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Change the configuration; refused while listening
    pub fn update_config(&self, update: impl FnOnce(&mut ServerConfig)) -> Result<()> {
        let mut config = self.config.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_listening() {
            return Err(anyhow!("server is listening; stop it before reconfiguring"));
        }
        update(&mut config);
        Ok(())
    }

    pub fn set_port(&self, port: u16) -> Result<()> {
        self.update_config(|config| config.port = port)
    }

    pub fn set_bind_address(&self, address: IpAddr) -> Result<()> {
        self.update_config(|config| config.bind_address = address)
    }

    /// Idle timeout in seconds; 0 disables it
    pub fn set_server_timeout(&self, seconds: u64) -> Result<()> {
        let idle_timeout = (seconds > 0).then(|| Duration::from_secs(seconds));
        self.update_config(|config| config.idle_timeout = idle_timeout)
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Address the listener is bound to while listening
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn registry(&self) -> &SectionRegistry {
        &self.registry
    }

    /// Listen for requests until stopped or idle, then let active sections
    /// finish (up to one transfer timeout) before returning.
    ///
    /// A stop requested before this call makes it return at once.
    pub fn start_listening(&self, hooks: Arc<dyn SectionHooks>) -> Result<()> {
        if self
            .listening
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(AlreadyListening.into());
        }

        let config = self.config();
        let result = self.runtime.block_on(self.listen(config, hooks));

        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.stop.send_replace(false);
        self.listening.store(false, Ordering::Release);
        result
    }

    /// Ask the listener to stop; returns without waiting for it
    pub fn stop_listening(&self) -> Result<()> {
        tracing::info!("Stop requested for TFTP server");
        self.stop.send_replace(true);
        Ok(())
    }

    async fn listen(&self, config: ServerConfig, hooks: Arc<dyn SectionHooks>) -> Result<()> {
        let mut stop = self.stop.subscribe();
        if *stop.borrow_and_update() {
            tracing::info!("TFTP server stopped before listening");
            return Ok(());
        }

        let socket = bind_listener(config.listen_addr())?;
        let local_addr = socket.local_addr().context("Failed to get local address")?;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(local_addr);
        tracing::info!("TFTP server listening on {}", local_addr);

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut sections = JoinSet::new();
        let mut buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let idle = idle_timer(config.idle_timeout, sections.is_empty());

            tokio::select! {
                _ = stop.changed() => {
                    if *stop.borrow_and_update() {
                        break;
                    }
                }
                Some(joined) = sections.join_next(), if !sections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!("Section task failed: {}", e);
                    }
                }
                _ = idle => {
                    tracing::info!("No requests for {:?}, closing TFTP server", config.idle_timeout.unwrap_or_default());
                    break;
                }
                received = socket.recv_from(&mut buffer) => match received {
                    Ok((len, client)) => {
                        let request = SectionRequest {
                            registry: Arc::clone(&self.registry),
                            hooks: Arc::clone(&hooks),
                            transfer: config.transfer.clone(),
                            cancel: cancel_rx.clone(),
                        };
                        request.dispatch(&socket, &buffer[..len], client, &mut sections).await;
                    }
                    Err(e) => tracing::warn!("Error receiving TFTP request: {}", e),
                },
            }
        }

        drop(socket);
        drain_sections(&mut sections, &cancel_tx, config.transfer.timeout).await;
        tracing::info!("TFTP server on {} stopped", local_addr);
        Ok(())
    }
}

/// Bind the request socket; no address reuse, so a port already taken fails
fn bind_listener(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .context("Failed to create TFTP socket")?;

    if addr.is_ipv6() && addr.ip().is_unspecified() {
        // Accept IPv4-mapped clients too when bound to [::]
        if let Err(e) = socket.set_only_v6(false) {
            tracing::debug!("Failed to enable dual-stack TFTP socket: {}", e);
        }
    }

    socket
        .set_nonblocking(true)
        .context("Failed to set TFTP socket non-blocking")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind TFTP server to {}", addr))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).context("Failed to convert to Tokio socket")
}

async fn idle_timer(timeout: Option<Duration>, idle: bool) {
    match timeout {
        Some(timeout) if idle => tokio::time::sleep(timeout).await,
        _ => std::future::pending().await,
    }
}

/// Wait for sections to end; cancel whatever is left after `grace`
async fn drain_sections(sections: &mut JoinSet<()>, cancel: &watch::Sender<bool>, grace: Duration) {
    if sections.is_empty() {
        return;
    }

    tracing::info!("Waiting for {} active section(s)", sections.len());
    let drained = tokio::time::timeout(grace, join_all(sections)).await;
    if drained.is_err() {
        tracing::warn!("Cancelling {} section(s) still active after {:?}", sections.len(), grace);
        cancel.send_replace(true);
        join_all(sections).await;
    }
}

async fn join_all(sections: &mut JoinSet<()>) {
    while let Some(joined) = sections.join_next().await {
        if let Err(e) = joined {
            tracing::warn!("Section task failed: {}", e);
        }
    }
}

/// Shared state every section of one listening run receives
struct SectionRequest {
    registry: Arc<SectionRegistry>,
    hooks: Arc<dyn SectionHooks>,
    transfer: TransferConfig,
    cancel: watch::Receiver<bool>,
}

impl SectionRequest {
    /// Turn an incoming packet into a section, or answer it with an error
    async fn dispatch(self, socket: &UdpSocket, packet: &[u8], client: SocketAddr, sections: &mut JoinSet<()>) {
        let request = match parse_request(packet) {
            Ok(request) => request,
            Err(e) => {
                match get_tftp_opcode(packet) {
                    Some(TftpOpcode::ReadRequest | TftpOpcode::WriteRequest) => {
                        tracing::warn!("Rejecting malformed request from {}: {}", client, e);
                        let error = TftpError::new(TftpErrorCode::IllegalOperation, "Malformed request");
                        reply_error(socket, client, &error).await;
                    }
                    Some(opcode) => {
                        tracing::debug!("Ignoring unexpected {} from {}", opcode, client);
                    }
                    None => {
                        tracing::debug!("Received malformed packet from {}", client);
                    }
                }
                return;
            }
        };

        if !request.mode.is_supported() {
            tracing::warn!("Refusing {} mode request from {}", request.mode, client);
            let error = TftpError::new(TftpErrorCode::IllegalOperation, "Only octet mode is supported");
            reply_error(socket, client, &error).await;
            return;
        }

        let mode = match request.opcode {
            TftpOpcode::WriteRequest => OpenMode::Write,
            _ => OpenMode::Read,
        };
        let id = self.registry.open(client, request.filename.clone(), mode);

        tracing::info!(
            "{} for '{}' from {} (section {}, options: {:?})",
            request.opcode.name(),
            request.filename,
            client,
            id,
            request.options
        );

        let task = SectionTask {
            registration: Registration {
                id,
                registry: self.registry,
            },
            client,
            request,
            mode,
            hooks: self.hooks,
            transfer: self.transfer,
            cancel: self.cancel,
        };
        sections.spawn(task.run());
    }
}

async fn reply_error(socket: &UdpSocket, client: SocketAddr, error: &TftpError) {
    if let Err(e) = socket.send_to(&error.to_packet(), client).await {
        tracing::debug!("Failed to send error to {}: {}", client, e);
    }
}

/// Removes the section from the registry when the task ends, panics included
struct Registration {
    id: SectionId,
    registry: Arc<SectionRegistry>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}

struct SectionTask {
    registration: Registration,
    client: SocketAddr,
    request: TftpRequest,
    mode: OpenMode,
    hooks: Arc<dyn SectionHooks>,
    transfer: TransferConfig,
    cancel: watch::Receiver<bool>,
}

impl SectionTask {
    async fn run(self) {
        let id = self.registration.id;
        let registry = Arc::clone(&self.registration.registry);
        let section = registry.section(id);

        let result = self.serve(&section).await;
        match &result {
            Ok(bytes) => tracing::info!(
                "Section {} finished: {} '{}' with {} ({} bytes)",
                id,
                self.mode,
                self.request.filename,
                self.client,
                bytes
            ),
            Err(e) => tracing::warn!(
                "Section {} failed: {} '{}' with {}: {:#}",
                id,
                self.mode,
                self.request.filename,
                self.client,
                e
            ),
        }

        registry.finish(id, result.is_ok());
        if let Err(e) = run_blocking(|| self.hooks.section_finished(&section)) {
            tracing::warn!("section_finished hook failed for section {}: {:#}", id, e);
        }
    }

    async fn serve(&self, section: &SectionRef<'_>) -> Result<u64> {
        // Nothing may fail before section_started has run
        let started = run_blocking(|| self.hooks.section_started(section));

        let socket = create_ephemeral_socket(self.client, self.transfer.local_bind).await?;
        let mut channel =
            PeerChannel::new(socket, self.client, self.transfer.clone()).with_cancel(self.cancel.clone());

        if let Err(e) = started {
            let error = self.error_for(section, None);
            channel.abort(&error).await;
            return Err(e.context("request refused"));
        }

        let opened = match run_blocking(|| self.hooks.open_file(section, &self.request.filename, self.mode)) {
            Ok(opened) => opened,
            Err(e) => {
                let error = self.error_for(section, Some(&e));
                channel.abort(&error).await;
                return Err(e.context(format!("failed to open '{}'", self.request.filename)));
            }
        };

        // A message set by the hooks so far also covers transfer failures
        channel.set_abort_message(section.error_message().ok().flatten());

        let OpenedFile { mut handle, size } = opened;
        let handle_mode = handle.mode();
        let transferred = match &mut handle {
            FileHandle::Reader(source) if self.mode == OpenMode::Read => {
                self.serve_read(&mut channel, source.as_mut(), size).await
            }
            FileHandle::Writer(sink) if self.mode == OpenMode::Write => self.serve_write(&mut channel, sink.as_mut()).await,
            _ => {
                channel
                    .abort(&TftpError::with_default_message(TftpErrorCode::AccessViolation))
                    .await;
                Err(anyhow!(
                    "open_file returned a {} handle for a {} request",
                    handle_mode,
                    self.mode
                ))
            }
        };

        let closed = run_blocking(|| self.hooks.close_file(section, handle));
        match (transferred, closed) {
            (Ok(bytes), Ok(())) => Ok(bytes),
            (Ok(_), Err(e)) => Err(e.context("failed to close file")),
            (Err(e), closed) => {
                if let Err(close_error) = closed {
                    tracing::debug!("close_file also failed: {:#}", close_error);
                }
                Err(e)
            }
        }
    }

    /// Error sent to the client when the section is refused or cannot open
    /// its file: the section's custom message with code 0 if one was set,
    /// otherwise a code derived from the hook's I/O error.
    fn error_for(&self, section: &SectionRef<'_>, cause: Option<&anyhow::Error>) -> TftpError {
        if let Ok(Some(message)) = section.error_message() {
            return TftpError::new(TftpErrorCode::NotDefined, message);
        }

        match cause {
            None => TftpError::new(TftpErrorCode::NotDefined, "Request refused"),
            Some(e) => match e.downcast_ref::<std::io::Error>() {
                Some(io) => TftpError::from_io(io),
                None => TftpError::new(TftpErrorCode::NotDefined, "Unable to open file"),
            },
        }
    }

    async fn serve_read(
        &self,
        channel: &mut PeerChannel,
        source: &mut (dyn std::io::Read + Send),
        size: Option<u64>,
    ) -> Result<u64> {
        let (accepted, block_size) = self.negotiate(channel, size);

        if !accepted.is_empty() {
            let oack = build_oack(&accepted);
            tracing::debug!("Sending OACK to {}: {:?}", self.client, accepted);
            channel
                .exchange(&oack, |response| Ok(parse_ack(response).ok().filter(|&block| block == 0)))
                .await
                .context("no ACK(0) for OACK")?;
        }

        send_blocks(channel, source, block_size).await
    }

    async fn serve_write(&self, channel: &mut PeerChannel, sink: &mut (dyn std::io::Write + Send)) -> Result<u64> {
        let (accepted, block_size) = self.negotiate(channel, None);

        let opening = if accepted.is_empty() {
            build_ack(0)
        } else {
            tracing::debug!("Sending OACK to {}: {:?}", self.client, accepted);
            build_oack(&accepted)
        };

        receive_blocks(channel, sink, block_size, opening, None, |_| Ok(())).await
    }

    /// Decide which requested options to acknowledge and the block size to
    /// use. Unknown or malformed options are left out of the OACK.
    fn negotiate(&self, channel: &mut PeerChannel, size: Option<u64>) -> (HashMap<String, String>, usize) {
        let requested = &self.request.options;
        let mut accepted = HashMap::new();
        let mut block_size = BlockSize::DEFAULT;

        if let Some(size) = requested
            .get(options::BLKSIZE)
            .and_then(|value| BlockSize::negotiate(value, self.transfer.max_block_size))
        {
            block_size = size;
            accepted.insert(options::BLKSIZE.to_string(), size.to_string());
        }

        if let Some(value) = requested.get(options::TSIZE) {
            match self.mode {
                // Only answerable when the opened file knows its size
                OpenMode::Read => {
                    if let Some(size) = size {
                        accepted.insert(options::TSIZE.to_string(), size.to_string());
                    }
                }
                OpenMode::Write => {
                    if value.parse::<u64>().is_ok() {
                        accepted.insert(options::TSIZE.to_string(), value.clone());
                    }
                }
            }
        }

        if let Some(value) = requested.get(options::TIMEOUT)
            && let Ok(seconds) = value.parse::<u8>()
            && seconds > 0
        {
            channel.set_timeout(Duration::from_secs(u64::from(seconds)));
            accepted.insert(options::TIMEOUT.to_string(), value.clone());
        }

        if requested.contains_key(options::WINDOWSIZE) {
            // Lock-step transfers only
            accepted.insert(options::WINDOWSIZE.to_string(), "1".to_string());
        }

        (accepted, block_size)
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};
    use std::net::UdpSocket as StdUdpSocket;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::protocol::{build_data, build_error, parse_data, parse_oack, parse_tftp_error};

    /// Shared in-memory file for write tests
    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryHooks {
        files: Mutex<HashMap<String, Vec<u8>>>,
        upload: SharedBuf,
        refuse: bool,
        message: Option<&'static str>,
        events: Mutex<Vec<String>>,
    }

    impl MemoryHooks {
        fn with_file(name: &str, data: Vec<u8>) -> Self {
            let hooks = Self::default();
            hooks.files.lock().unwrap().insert(name.to_string(), data);
            hooks
        }

        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl SectionHooks for MemoryHooks {
        fn section_started(&self, section: &SectionRef<'_>) -> Result<()> {
            self.record("started");
            if let Some(message) = self.message {
                section.set_error_message(message)?;
            }
            if self.refuse {
                section.set_error_message("not today")?;
                return Err(anyhow!("refused"));
            }
            Ok(())
        }

        fn open_file(&self, _section: &SectionRef<'_>, filename: &str, mode: OpenMode) -> Result<OpenedFile> {
            self.record(format!("open {} {}", mode, filename));
            match mode {
                OpenMode::Read => {
                    let files = self.files.lock().unwrap();
                    let data = files
                        .get(filename)
                        .cloned()
                        .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::NotFound))?;
                    let size = data.len() as u64;
                    Ok(OpenedFile::reader(Cursor::new(data)).with_size(size))
                }
                OpenMode::Write => Ok(OpenedFile::writer(self.upload.clone())),
            }
        }

        fn close_file(&self, _section: &SectionRef<'_>, file: FileHandle) -> Result<()> {
            self.record(format!("close {}", file.mode()));
            Ok(())
        }

        fn section_finished(&self, section: &SectionRef<'_>) -> Result<()> {
            self.record(format!("finished {:?}", section.get_section_status()?));
            Ok(())
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            idle_timeout: None,
            transfer: TransferConfig {
                timeout: Duration::from_millis(300),
                max_retries: 3,
                ..Default::default()
            },
        }
    }

    fn wait_for_addr(server: &ServerHandler) -> SocketAddr {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(addr) = server.local_addr() {
                return addr;
            }
            assert!(Instant::now() < deadline, "server never bound");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn client_socket() -> StdUdpSocket {
        let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        socket
    }

    fn recv(socket: &StdUdpSocket) -> (Vec<u8>, SocketAddr) {
        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let (n, from) = socket.recv_from(&mut buf).unwrap();
        (buf[..n].to_vec(), from)
    }

    fn wait_for_sections(server: &ServerHandler) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !server.registry().is_empty() {
            assert!(Instant::now() < deadline, "sections never finished");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 69);
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
    }

    #[test]
    fn test_setters_update_config() {
        let server = ServerHandler::create().unwrap();
        server.set_port(6969).unwrap();
        server.set_server_timeout(0).unwrap();
        assert_eq!(server.config().port, 6969);
        assert_eq!(server.config().idle_timeout, None);

        server.set_server_timeout(5).unwrap();
        assert_eq!(server.config().idle_timeout, Some(Duration::from_secs(5)));
        assert!(!server.is_listening());
        assert!(server.local_addr().is_none());
    }

    #[test]
    fn test_stop_before_start_returns_immediately() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        server.stop_listening().unwrap();

        let started = Instant::now();
        server.start_listening(Arc::new(MemoryHooks::default())).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!server.is_listening());
    }

    #[test]
    fn test_idle_timeout_ends_listening() {
        let mut config = test_config();
        config.idle_timeout = Some(Duration::from_secs(1));
        let server = ServerHandler::with_config(config).unwrap();

        let started = Instant::now();
        server.start_listening(Arc::new(MemoryHooks::default())).unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn test_second_start_is_refused_and_config_locked() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::default());

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            wait_for_addr(&server);

            let err = server.start_listening(hooks.clone()).unwrap_err();
            assert!(err.is::<AlreadyListening>());
            assert!(server.set_port(1234).is_err());

            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert!(server.set_port(1234).is_ok());
    }

    #[test]
    fn test_read_with_options() {
        let data: Vec<u8> = (0..100u8).collect();
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::with_file("boot.img", data.clone()));

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            let mut request = TftpRequest::read_request("boot.img", crate::TransferMode::Octet);
            request.with_option("blksize", "64").with_option("tsize", "0");
            client.send_to(&request.to_packet(), addr).unwrap();

            let (oack, tid) = recv(&client);
            assert_ne!(tid, addr);
            let accepted = parse_oack(&oack).unwrap();
            assert_eq!(accepted.get("blksize").map(String::as_str), Some("64"));
            assert_eq!(accepted.get("tsize").map(String::as_str), Some("100"));

            let mut received = Vec::new();
            let mut ack = 0u16;
            loop {
                client.send_to(&build_ack(ack), tid).unwrap();
                let (packet, _) = recv(&client);
                let (block, payload) = parse_data(&packet).unwrap();
                assert_eq!(block, ack + 1);
                received.extend_from_slice(payload);
                ack = block;
                if payload.len() < 64 {
                    client.send_to(&build_ack(ack), tid).unwrap();
                    break;
                }
            }
            assert_eq!(received, data);

            wait_for_sections(&server);
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert_eq!(
            hooks.events(),
            vec!["started", "open read boot.img", "close read", "finished Succeeded"]
        );
    }

    #[test]
    fn test_write_without_options() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::default());

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            let request = TftpRequest::write_request("upload.bin", crate::TransferMode::Octet);
            client.send_to(&request.to_packet(), addr).unwrap();

            let (ack, tid) = recv(&client);
            assert_eq!(parse_ack(&ack).unwrap(), 0);

            let first = vec![7u8; 512];
            client.send_to(&build_data(1, &first), tid).unwrap();
            assert_eq!(parse_ack(&recv(&client).0).unwrap(), 1);
            client.send_to(&build_data(2, b"tail"), tid).unwrap();
            assert_eq!(parse_ack(&recv(&client).0).unwrap(), 2);

            wait_for_sections(&server);
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        let uploaded = hooks.upload.0.lock().unwrap().clone();
        assert_eq!(uploaded.len(), 516);
        assert_eq!(&uploaded[512..], b"tail");
        assert_eq!(hooks.events().last().map(String::as_str), Some("finished Succeeded"));
    }

    #[test]
    fn test_missing_file_gets_file_not_found() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::default());

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            let request = TftpRequest::read_request("nope", crate::TransferMode::Octet);
            client.send_to(&request.to_packet(), addr).unwrap();

            let error = parse_tftp_error(&recv(&client).0).unwrap();
            assert_eq!(error.code, TftpErrorCode::FileNotFound);

            wait_for_sections(&server);
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        // No close without a successful open
        assert_eq!(hooks.events(), vec!["started", "open read nope", "finished Failed"]);
    }

    #[test]
    fn test_refused_section_sends_custom_message() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks {
            refuse: true,
            ..Default::default()
        });

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            let request = TftpRequest::read_request("anything", crate::TransferMode::Octet);
            client.send_to(&request.to_packet(), addr).unwrap();

            let error = parse_tftp_error(&recv(&client).0).unwrap();
            assert_eq!(error.code, TftpErrorCode::NotDefined);
            assert_eq!(error.message, "not today");

            wait_for_sections(&server);
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert_eq!(hooks.events(), vec!["started", "finished Failed"]);
    }

    #[test]
    fn test_netascii_and_stray_packets() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::default());

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            // Stray DATA on the request port is ignored
            client.send_to(&build_data(1, b"x"), addr).unwrap();
            client.send_to(&build_error(0, "noise"), addr).unwrap();

            let request = TftpRequest::read_request("file", crate::TransferMode::NetAscii);
            client.send_to(&request.to_packet(), addr).unwrap();
            let error = parse_tftp_error(&recv(&client).0).unwrap();
            assert_eq!(error.code, TftpErrorCode::IllegalOperation);

            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert!(hooks.events().is_empty());
    }

    /// Request `name`, read the first DATA block and never acknowledge it.
    /// Returns every packet the client got after the stop.
    fn stall_then_stop(server: &ServerHandler, hooks: Arc<MemoryHooks>, name: &str) -> Vec<Vec<u8>> {
        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks));
            let addr = wait_for_addr(server);

            let client = client_socket();
            let request = TftpRequest::read_request(name, crate::TransferMode::Octet);
            client.send_to(&request.to_packet(), addr).unwrap();
            let (first, _) = recv(&client);
            assert_eq!(parse_data(&first).unwrap().0, 1);

            let stopped = Instant::now();
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
            assert!(stopped.elapsed() < Duration::from_secs(3));

            client.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
            let mut packets = Vec::new();
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            while let Ok((n, _)) = client.recv_from(&mut buf) {
                packets.push(buf[..n].to_vec());
            }
            packets
        })
    }

    #[test]
    fn test_stop_cancels_stalled_section() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(MemoryHooks::with_file("big", vec![1u8; 4096]));

        let packets = stall_then_stop(&server, hooks.clone(), "big");

        // Retransmits may come first; the section ends with an ERROR
        let last = packets.last().expect("client heard nothing after stop");
        let error = parse_tftp_error(last).unwrap();
        assert_eq!(error.code, TftpErrorCode::NotDefined);
        assert_eq!(error.message, "Server shutting down");

        assert!(server.registry().is_empty());
        assert_eq!(hooks.events().last().map(String::as_str), Some("finished Failed"));
    }

    #[test]
    fn test_cancelled_section_sends_custom_message() {
        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = MemoryHooks {
            message: Some("come back later"),
            ..MemoryHooks::with_file("big", vec![1u8; 4096])
        };

        let packets = stall_then_stop(&server, Arc::new(hooks), "big");

        let error = parse_tftp_error(packets.last().unwrap()).unwrap();
        assert_eq!(error.code, TftpErrorCode::NotDefined);
        assert_eq!(error.message, "come back later");
    }

    #[test]
    fn test_transfer_socket_failure_still_pairs_started_and_finished() {
        let mut config = test_config();
        // Documentation range, never assigned to a local interface
        config.transfer.local_bind = Some(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)));
        let server = ServerHandler::with_config(config).unwrap();
        let hooks = Arc::new(MemoryHooks::with_file("file", b"data".to_vec()));

        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let client = client_socket();
            let request = TftpRequest::read_request("file", crate::TransferMode::Octet);
            client.send_to(&request.to_packet(), addr).unwrap();

            let deadline = Instant::now() + Duration::from_secs(5);
            while !hooks.events().iter().any(|e| e.starts_with("finished")) {
                assert!(Instant::now() < deadline, "section never finished");
                thread::sleep(Duration::from_millis(10));
            }

            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert_eq!(hooks.events(), vec!["started", "finished Failed"]);
    }

    #[test]
    fn test_blocking_hooks_do_not_stall_other_sections() {
        const SECTIONS: usize = 4;

        /// Holds every open until all sections have reached it
        struct GatedHooks {
            inner: MemoryHooks,
            arrived: Mutex<usize>,
            all_arrived: std::sync::Condvar,
        }

        impl SectionHooks for GatedHooks {
            fn section_started(&self, section: &SectionRef<'_>) -> Result<()> {
                self.inner.section_started(section)
            }

            fn open_file(&self, section: &SectionRef<'_>, filename: &str, mode: OpenMode) -> Result<OpenedFile> {
                let mut arrived = self.arrived.lock().unwrap();
                *arrived += 1;
                self.all_arrived.notify_all();
                let (arrived, timeout) = self
                    .all_arrived
                    .wait_timeout_while(arrived, Duration::from_secs(5), |n| *n < SECTIONS)
                    .unwrap();
                drop(arrived);
                if timeout.timed_out() {
                    return Err(anyhow!("only some sections reached open_file"));
                }
                self.inner.open_file(section, filename, mode)
            }

            fn close_file(&self, section: &SectionRef<'_>, file: FileHandle) -> Result<()> {
                self.inner.close_file(section, file)
            }

            fn section_finished(&self, section: &SectionRef<'_>) -> Result<()> {
                self.inner.section_finished(section)
            }
        }

        let server = ServerHandler::with_config(test_config()).unwrap();
        let hooks = Arc::new(GatedHooks {
            inner: MemoryHooks::with_file("small", b"tiny".to_vec()),
            arrived: Mutex::new(0),
            all_arrived: std::sync::Condvar::new(),
        });

        let started = Instant::now();
        thread::scope(|s| {
            let listener = s.spawn(|| server.start_listening(hooks.clone()));
            let addr = wait_for_addr(&server);

            let clients: Vec<_> = (0..SECTIONS).map(|_| client_socket()).collect();
            for client in &clients {
                let request = TftpRequest::read_request("small", crate::TransferMode::Octet);
                client.send_to(&request.to_packet(), addr).unwrap();
            }
            for client in &clients {
                let (packet, tid) = recv(client);
                assert_eq!(parse_data(&packet).unwrap(), (1, &b"tiny"[..]));
                client.send_to(&build_ack(1), tid).unwrap();
            }

            wait_for_sections(&server);
            server.stop_listening().unwrap();
            listener.join().unwrap().unwrap();
        });

        assert!(started.elapsed() < Duration::from_secs(4));
        let finished = hooks.inner.events().iter().filter(|e| *e == "finished Succeeded").count();
        assert_eq!(finished, SECTIONS);
    }
}
