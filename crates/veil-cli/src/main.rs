//! VEIL sandbox driver.
//!
//! A small exerciser for the encrypted packet transport: an echo server,
//! a latency/throughput bench client, and a keep-alive probe.

mod config;

use clap::{Parser, Subcommand};
use config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use veil_crypto::os_random;
use veil_session::{packet_type, Packet, PacketBuffer, PacketFlags, Session};
use veil_transport::{Acceptor, AcceptorConfig, SecureTransport, TransportError};

/// VEIL - encrypted framed-message transport sandbox
#[derive(Parser)]
#[command(name = "veil")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Enable debug output (implies --verbose)
    #[arg(short, long)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, default_value = "veil.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the echo server
    Serve {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Cipher workers per session (0 = inline crypto)
        #[arg(long)]
        crypto_parallelism: Option<usize>,
    },

    /// Measure round-trip latency and bulk throughput against a server
    Bench {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Number of ping round-trips
        #[arg(long, default_value_t = 100)]
        pings: u32,

        /// Bulk payload size in KiB
        #[arg(long, default_value_t = 1024)]
        bulk_kib: usize,

        /// Cipher workers per session (0 = inline crypto)
        #[arg(long)]
        crypto_parallelism: Option<usize>,
    },

    /// Probe a server with keep-alive requests
    Keepalive {
        /// Server host
        #[arg(long)]
        host: Option<String>,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Seconds between probes
        #[arg(long, default_value_t = 2)]
        interval: u64,
    },
}

fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Serve {
            port,
            crypto_parallelism,
        } => serve(
            port.unwrap_or(config.network.port),
            crypto_parallelism.unwrap_or(config.session.crypto_parallelism),
            &config,
        ),
        Commands::Bench {
            host,
            port,
            pings,
            bulk_kib,
            crypto_parallelism,
        } => bench(
            &host.unwrap_or_else(|| config.network.host.clone()),
            port.unwrap_or(config.network.port),
            pings,
            bulk_kib,
            crypto_parallelism.unwrap_or(config.session.crypto_parallelism),
            &config,
        ),
        Commands::Keepalive {
            host,
            port,
            interval,
        } => keepalive(
            &host.unwrap_or_else(|| config.network.host.clone()),
            port.unwrap_or(config.network.port),
            interval,
            &config,
        ),
    };

    if let Err(err) = result {
        error!("{err}");
        std::process::exit(1);
    }
}

/// Echo server: `PING` bodies come back as `PING_REPLY`; keep-alives are
/// answered by the session itself.
fn serve(port: u16, crypto_parallelism: usize, config: &Config) -> Result<(), TransportError> {
    let acceptor = Acceptor::bind(
        ("0.0.0.0", port),
        Arc::new(move |transport: Arc<SecureTransport>| {
            let peer = transport.peer_addr();
            info!(?peer, "session established");

            let session = Arc::new(Session::new(transport, crypto_parallelism));
            let weak = Arc::downgrade(&session);
            session.on_recv(packet_type::PING, move |packet: Packet, received: u64| {
                if received < packet.header.size {
                    return;
                }
                if let Some(session) = weak.upgrade() {
                    // The reply mirrors the ping's flags, so a flagged ping
                    // displaces stale replies queued at the requester.
                    session.push(packet_type::PING_REPLY, packet.header.flags, packet.buffer);
                }
            });

            // Park until the peer goes away; the callbacks do the work.
            while session.is_connected() {
                std::thread::sleep(Duration::from_millis(100));
            }
            info!(?peer, "session closed");
        }),
        Some(Arc::new(
            |err: TransportError, transport: Arc<SecureTransport>| {
                warn!(peer = ?transport.peer_addr(), error = %err, "session failed");
            },
        )),
        os_random(),
        AcceptorConfig {
            key_bits: config.session.key_bits,
            no_delay: config.network.no_delay,
        },
    )?;

    info!(port, crypto_parallelism, "serving");
    acceptor.run()
}

fn connect(
    host: &str,
    port: u16,
    crypto_parallelism: usize,
    config: &Config,
) -> Result<Session, TransportError> {
    let transport = Arc::new(SecureTransport::new(os_random()));
    let session = Session::new(transport, crypto_parallelism);
    session.connect(host, port, config.network.no_delay)?;
    Ok(session)
}

/// Ping round-trips plus one bulk transfer, with transport metrics.
fn bench(
    host: &str,
    port: u16,
    pings: u32,
    bulk_kib: usize,
    crypto_parallelism: usize,
    config: &Config,
) -> Result<(), TransportError> {
    let session = connect(host, port, crypto_parallelism, config)?;
    info!(host, port, "connected");

    // Latency: small ping bodies echoed back.
    let mut total_rtt = Duration::ZERO;
    let mut worst_rtt = Duration::ZERO;
    for i in 0..pings {
        let start = Instant::now();
        session.push(
            packet_type::PING,
            PacketFlags::new(),
            Some(PacketBuffer::from_slice(&i.to_le_bytes())),
        );
        let reply = session.pull(packet_type::PING_REPLY);
        if !session.is_connected() {
            error!("connection lost after {i} pings");
            break;
        }
        let rtt = start.elapsed();
        total_rtt += rtt;
        worst_rtt = worst_rtt.max(rtt);
        drop(reply);
    }
    println!(
        "pings: {pings}  avg rtt: {:?}  worst rtt: {:?}",
        total_rtt / pings.max(1),
        worst_rtt
    );

    // Throughput: one large echo. The server mirrors REMOVE_PREVIOUS onto
    // its reply, which drops any stale replies still queued here.
    let payload: Vec<u8> = (0..bulk_kib * 1024).map(|i| (i % 251) as u8).collect();
    let start = Instant::now();
    session.push(
        packet_type::PING,
        PacketFlags::new().with_remove_previous(),
        Some(PacketBuffer::from_slice(&payload)),
    );
    let echoed = session.pull(packet_type::PING_REPLY);
    let elapsed = start.elapsed();
    if echoed.header.size as usize != payload.len() {
        warn!("bulk echo truncated");
    }
    let mbps = (payload.len() * 2) as f64 / elapsed.as_secs_f64() / 1_000_000.0;
    println!("bulk: {bulk_kib} KiB round trip in {elapsed:?} ({mbps:.1} MB/s both ways)");

    let metrics = session.transport().metrics();
    metrics.set_avg_read_speed((payload.len() as f64 / elapsed.as_secs_f64()) as f32);
    println!(
        "transport: {} bytes read / {} ops, {} bytes written / {} ops",
        metrics.bytes_read(),
        metrics.read_ops(),
        metrics.bytes_written(),
        metrics.write_ops(),
    );

    session.disconnect();
    Ok(())
}

/// Periodic keep-alive probes; a missing reply means the peer is gone.
fn keepalive(host: &str, port: u16, interval: u64, config: &Config) -> Result<(), TransportError> {
    let session = connect(host, port, 0, config)?;
    info!(host, port, "connected, probing");

    loop {
        session.push(packet_type::KEEP_ALIVE_REQUEST, PacketFlags::new(), None);
        let start = Instant::now();
        let reply = session.pull(packet_type::KEEP_ALIVE_REPLY);
        if !session.is_connected() && reply.header.packet_type == packet_type::UNDEFINED {
            error!("peer stopped answering keep-alives");
            return Ok(());
        }
        println!("keep-alive answered in {:?}", start.elapsed());
        std::thread::sleep(Duration::from_secs(interval));
    }
}
