//! # Peerway Node - Main Entry Point
//!
//! A minimal standalone process wrapping [`peerway::protocol::Protocol`]
//! around the reference TCP transport: bind a local endpoint, optionally
//! dial a peer, serve files out of a share directory to anyone who asks,
//! and keep running until interrupted.
//!
//! ## Architecture Overview
//!
//! 1. **Initialize logging**: dual-layer `tracing` setup, detailed
//!    file/stderr layer plus an optional colorized stdout layer.
//! 2. **Parse arguments**: listen address/port, optional peer to connect
//!    to, capability subjects, share directory.
//! 3. **Open the protocol layer**: bind the TCP transport, start the
//!    Connection Monitor's background loops.
//! 4. **Serve data requests**: install a [`peerway::DataRequestResolver`]
//!    resolving a requested hint to a file under the share directory.
//! 5. **Run until `ctrl-c`**, then close down cleanly.

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

use peerway::transport::tcp::TcpChannelTemplate;
use peerway::{
    logging::ColorizedFormatter, Address, ChannelTemplate, DataRequestResolver,
    DiscoveryInformation, EndpointId, IntersectingPolicy, ProtocolConfig, ProtocolDescription,
    ProtocolInformation, ProtocolVersion,
};

/// Run one peerway protocol endpoint.
#[derive(Parser, Debug)]
#[command(name = "peerway-node", version, about, long_about = None)]
struct Args {
    /// Interface/hostname to bind and advertise.
    #[arg(long, default_value = "127.0.0.1")]
    address: String,

    /// TCP port to listen on for framed messages. `0` lets the OS choose.
    #[arg(long, default_value_t = 0)]
    port: u16,

    /// `host:port` of a peer to connect to at startup.
    #[arg(long)]
    connect: Option<String>,

    /// Capability subjects this endpoint offers, comma separated.
    #[arg(long, value_delimiter = ',', default_value = "chat")]
    subjects: Vec<String>,

    /// Protocol version to speak, as `major.minor`.
    #[arg(long, default_value = "1.0")]
    version: String,

    /// Directory served to peers requesting a data download. Requests
    /// whose hint resolves outside this directory are refused.
    #[arg(long)]
    share_dir: Option<PathBuf>,

    /// Path to a log file, or "stderr" to log there instead of a file.
    #[arg(long)]
    log_file: Option<String>,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress the colorized stdout log.
    #[arg(short, long)]
    quiet: bool,
}

fn parse_version(raw: &str) -> Result<ProtocolVersion> {
    let (major, minor) = raw
        .split_once('.')
        .context("version must be formatted as major.minor")?;
    Ok(ProtocolVersion::new(
        major.parse().context("invalid major version")?,
        minor.parse().context("invalid minor version")?,
    ))
}

fn parse_tcp_address(raw: &str) -> Result<Address> {
    let addr = raw
        .to_socket_addrs()
        .with_context(|| format!("could not resolve {raw}"))?
        .next()
        .with_context(|| format!("{raw} resolved to no addresses"))?;
    Ok(Address::Tcp(addr))
}

/// Resolves an inbound download request's hint to a file under one fixed
/// directory, refusing anything that would escape it.
struct ShareDirResolver {
    root: PathBuf,
}

#[async_trait]
impl DataRequestResolver for ShareDirResolver {
    async fn resolve(&self, peer: EndpointId, target_hint: &str) -> Option<PathBuf> {
        let candidate = self.root.join(target_hint);
        let canonical = tokio::fs::canonicalize(&candidate).await.ok()?;
        if !canonical.starts_with(&self.root) {
            warn!("peer {peer} requested {target_hint:?}, which escapes the share directory");
            return None;
        }
        Some(canonical)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Configure logging level based on verbosity flags.
    // This level applies to both the log file and stdout.
    // - default: INFO
    // -v: DEBUG
    // -vv and more: TRACE
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Configure the detailed log layer (file or stderr).
    // The guard must be kept alive for the duration of the program for file logging.
    let guard;
    let detailed_log_layer;

    if let Some("stderr") = args.log_file.as_deref() {
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = Path::new(path_str);
                let log_dir = log_path.parent().unwrap_or_else(|| Path::new("."));
                let log_filename = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("peerway-node.log"));
                tracing_appender::rolling::daily(log_dir, log_filename)
            }
            None => tracing_appender::rolling::daily(".", "peerway-node.log"),
        };
        let (non_blocking_writer, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_log_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // This layer sends clean, user-facing output to stdout.
    // It is only enabled if the --quiet flag is NOT present.
    let stdout_log = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ColorizedFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_log_layer)
        .with(stdout_log)
        .init();

    // Keep the logging guard alive for the duration of the program.
    let _log_guard = guard;

    let local_id = EndpointId::generate();
    let version = parse_version(&args.version)?;
    let discovery_address = parse_tcp_address(&format!("{}:{}", args.address, args.port))?;
    let description = ProtocolDescription::new(args.subjects.iter().cloned());

    // A placeholder entry is required for `version` to be recognised as
    // locally supported before the transport has actually bound; the real
    // message/data addresses are published once `Protocol::open` returns.
    let mut local_protocol_by_version = HashMap::new();
    local_protocol_by_version.insert(
        version,
        ProtocolInformation {
            version,
            message_address: discovery_address.clone(),
            data_address: discovery_address.clone(),
        },
    );

    let template: Arc<dyn ChannelTemplate> =
        Arc::new(TcpChannelTemplate::new(args.address.clone(), args.port));
    let policy = Arc::new(IntersectingPolicy {
        local: description.clone(),
    });

    let protocol = Arc::new(peerway::Protocol::new(
        local_id,
        DiscoveryInformation {
            discovery_address,
        },
        description,
        local_protocol_by_version,
        template,
        policy,
        ProtocolConfig {
            tcp_port: args.port,
            tcp_base_address: args.address.clone(),
            ..ProtocolConfig::default()
        },
    ));

    protocol.open(&[version]).await?;
    info!("peerway node {local_id} listening");
    for (version, info) in protocol.local_connection_points().await {
        info!(
            "  version {version}: messages at {}, data at {}",
            info.message_address, info.data_address
        );
    }

    if let Some(share_dir) = args.share_dir.clone() {
        let root = tokio::fs::canonicalize(&share_dir)
            .await
            .with_context(|| format!("share directory {share_dir:?} does not exist"))?;
        info!("serving data downloads from {root:?}");
        protocol
            .respond_to_data_requests(Arc::new(ShareDirResolver { root }))
            .await?;
    }

    if let Some(peer_addr) = args.connect.as_deref() {
        let peer_id = EndpointId::generate();
        let peer_discovery = DiscoveryInformation {
            discovery_address: parse_tcp_address(peer_addr)?,
        };
        info!("connecting to {peer_addr}");
        protocol.connect_to(peer_id, peer_discovery).await;

        // Give the handshake a moment to complete, then confirm liveness
        // with an ad hoc keep-alive probe.
        tokio::time::sleep(Duration::from_millis(200)).await;
        match protocol
            .verify_connection(peer_id, Duration::from_secs(10), None)
            .await
        {
            Ok(_) => info!("connection to {peer_addr} confirmed"),
            Err(e) => error!("could not confirm connection to {peer_addr}: {e}"),
        }
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    protocol.close().await;
    Ok(())
}
