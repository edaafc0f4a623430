//! TFTP Session - Main executable
//!
//! Serve a directory over TFTP, or fetch/send single files from the command line.

use std::fs::{self, File};
use std::io::BufWriter;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use argh::FromArgs;
use tftp_session::{OperationResult, TftpClient, TftpServer};
use tracing_subscriber::EnvFilter;

const DEFAULT_ROOT: &str = "./tftp_root";
const DEFAULT_PORT: u16 = 6969; // use 6969 for non-root testing; pass --port 69 as root

#[derive(FromArgs, Debug)]
#[argh(
    description = "TFTP Session - TFTP server and client",
    example = "Serve a directory:\n  {command_name} serve --root /tftpboot --port 69",
    example = "Fetch a file:\n  {command_name} get 10.0.1.50 pxelinux.0 --port 69",
    example = "Send a file:\n  {command_name} put 10.0.1.50 ./config.txt --blksize 1400"
)]
struct Cli {
    #[argh(subcommand)]
    command: Command,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand)]
enum Command {
    Serve(ServeArgs),
    Get(GetArgs),
    Put(PutArgs),
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "serve", description = "serve files from a directory")]
struct ServeArgs {
    #[argh(
        option,
        short = 'r',
        description = "root directory",
        default = "PathBuf::from(DEFAULT_ROOT)"
    )]
    root: PathBuf,

    #[argh(
        option,
        short = 'b',
        description = "bind address",
        default = "IpAddr::from([0, 0, 0, 0])"
    )]
    bind: IpAddr,

    #[argh(option, short = 'p', description = "listen port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(
        option,
        description = "stop after this many idle seconds (0 = never)",
        default = "0"
    )]
    idle_timeout: u64,

    #[argh(switch, description = "refuse uploads")]
    read_only: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "get", description = "fetch a file from a server")]
struct GetArgs {
    #[argh(positional, description = "server host")]
    host: String,

    #[argh(positional, description = "remote file name")]
    remote: String,

    #[argh(option, short = 'o', description = "local file (default: remote file name)")]
    output: Option<PathBuf>,

    #[argh(option, short = 'p', description = "server port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, description = "block size to propose")]
    blksize: Option<u16>,

    #[argh(switch, description = "ask the server for the file size")]
    tsize: bool,
}

#[derive(FromArgs, Debug)]
#[argh(subcommand, name = "put", description = "send a file to a server")]
struct PutArgs {
    #[argh(positional, description = "server host")]
    host: String,

    #[argh(positional, description = "local file")]
    local: PathBuf,

    #[argh(option, short = 'n', description = "remote file name (default: local file name)")]
    name: Option<String>,

    #[argh(option, short = 'p', description = "server port", default = "DEFAULT_PORT")]
    port: u16,

    #[argh(option, description = "block size to propose")]
    blksize: Option<u16>,
}

fn serve(args: ServeArgs) -> Result<()> {
    let mut server = TftpServer::new()?;
    server.set_bind_address(args.bind)?;
    server.set_port(args.port)?;
    server.set_timeout(args.idle_timeout)?;
    server.set_root_directory(&args.root);

    let read_only = args.read_only;
    server.register_section_started_callback(move |section| {
        let client = section.client_ip().unwrap_or_default();
        let filename = section.filename().unwrap_or_default();
        if read_only && section.mode().is_ok_and(|mode| mode == tftp_session::OpenMode::Write) {
            tracing::warn!("Refusing upload of '{}' from {}", filename, client);
            if let Err(e) = section.set_error_message("Server is read-only") {
                tracing::debug!("Failed to set error message: {}", e);
            }
            return OperationResult::Error;
        }
        tracing::info!("{} requested '{}'", client, filename);
        OperationResult::Ok
    });
    server.register_section_finished_callback(|section| {
        tracing::info!(
            "Section {} for '{}' finished: {:?}",
            section.section_id().map(|id| id.to_string()).unwrap_or_default(),
            section.filename().unwrap_or_default(),
            section.section_status()
        );
        OperationResult::Ok
    });

    tracing::info!(
        "Starting TFTP server on {}:{} with root: {}",
        args.bind,
        args.port,
        args.root.display()
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build signal runtime")?;
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();

    let server = &server;
    std::thread::scope(|s| {
        let listener = s.spawn(move || {
            let result = server.start_listening();
            // Receiver may already be gone after ctrl-c
            let _ = done_tx.send(());
            result
        });

        runtime.block_on(async {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    signal.context("Failed to listen for ctrl-c")?;
                    tracing::info!("Interrupted, stopping TFTP server");
                    server.stop_listening()?;
                }
                _ = done_rx => {}
            }
            Ok::<(), anyhow::Error>(())
        })?;

        listener
            .join()
            .map_err(|_| anyhow!("TFTP listener thread panicked"))??;
        Ok(())
    })
}

fn connect(host: &str, port: u16, blksize: Option<u16>) -> Result<TftpClient> {
    let mut client = TftpClient::new()?;
    client.set_connection(host, port)?;
    client.set_block_size(blksize);

    client.register_error_callback(|code, message| {
        tracing::error!("TFTP error {}: {}", code, message);
        OperationResult::Ok
    });
    client.register_option_accepted_callback(|name, value| {
        tracing::info!("Server accepted {}={}", name, value);
        OperationResult::Ok
    });
    Ok(client)
}

fn get(args: GetArgs) -> Result<()> {
    let mut client = connect(&args.host, args.port, args.blksize)?;
    client.set_request_transfer_size(args.tsize);

    let mut received = 0u64;
    client.register_fetch_progress_callback(move |size| {
        received += size as u64;
        tracing::debug!("{} bytes received", received);
        OperationResult::Ok
    });

    let local = match args.output {
        Some(path) => path,
        None => default_local_name(&args.remote)?,
    };
    let mut sink = BufWriter::new(
        File::create(&local).with_context(|| format!("Failed to create {}", local.display()))?,
    );

    if let Err(e) = client.fetch_file(&args.remote, &mut sink) {
        drop(sink);
        if let Err(remove) = fs::remove_file(&local) {
            tracing::debug!("Failed to remove partial file {}: {}", local.display(), remove);
        }
        return Err(e.into());
    }

    tracing::info!("Fetched '{}' into {}", args.remote, local.display());
    Ok(())
}

fn put(args: PutArgs) -> Result<()> {
    let mut client = connect(&args.host, args.port, args.blksize)?;

    let name = match args.name {
        Some(name) => name,
        None => args
            .local
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Cannot derive a remote name from {}", args.local.display()))?,
    };
    let mut source = File::open(&args.local).with_context(|| format!("Failed to open {}", args.local.display()))?;

    client.send_file(&name, &mut source)?;
    tracing::info!("Sent {} as '{}'", args.local.display(), name);
    Ok(())
}

/// Last path segment of a remote name, so `pxe/boot.img` lands in `boot.img`
fn default_local_name(remote: &str) -> Result<PathBuf> {
    Path::new(remote)
        .file_name()
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("Cannot derive a local file name from '{}'", remote))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli: Cli = argh::from_env();
    match cli.command {
        Command::Serve(args) => serve(args),
        Command::Get(args) => get(args),
        Command::Put(args) => put(args),
    }
}
