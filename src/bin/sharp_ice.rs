use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sharp_ice::nat::ice::{IceAgent, IceConfig, IceRole, IceSocket, IceStatus, NominationMode};
use sharp_ice::nat::stun::{Message, StunSocket};
use sharp_ice::{init_logging, system_info};

#[derive(Parser, Debug)]
#[command(author, version, about = "SHARP ICE connectivity tool", long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// JSON agent configuration
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show version and usable interface addresses
    Info,

    /// Ask a STUN server for our mapped address
    Stun {
        /// Server as host:port
        server: String,

        /// Local bind address
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },

    /// Connect two agents on this machine and exchange a datagram
    Loopback {
        /// Number of streams
        #[arg(long, default_value_t = 2)]
        streams: usize,

        /// Components per stream
        #[arg(long, default_value_t = 2)]
        components: u16,

        /// Use aggressive nomination
        #[arg(long)]
        aggressive: bool,

        /// Give up after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = match &args.config {
        Some(path) => IceConfig::from_file(path)?,
        None => IceConfig::default(),
    };

    match args.command {
        Command::Info => {
            println!("{}", system_info());
            Ok(())
        }
        Command::Stun { server, bind } => run_stun(&server, bind, &config).await,
        Command::Loopback { streams, components, aggressive, timeout } => {
            let config = IceConfig {
                local_only: true,
                host_addresses: vec!["127.0.0.1".parse()?],
                nomination: if aggressive { NominationMode::Aggressive } else { config.nomination },
                ..config
            };
            run_loopback(config, streams, components, Duration::from_secs(timeout)).await
        }
    }
}

async fn run_stun(server: &str, bind: SocketAddr, config: &IceConfig) -> Result<()> {
    let dest = tokio::net::lookup_host(server)
        .await
        .with_context(|| format!("cannot resolve {}", server))?
        .find(|a| a.is_ipv4() == bind.is_ipv4())
        .with_context(|| format!("{} has no address of the bind family", server))?;

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let socket = StunSocket::bind(0, bind, config.transaction_config(), tx).await?;
    println!("Local:  {}", socket.local_addr());
    println!("Server: {} ({})", server, dest);

    let reply = socket
        .engine()
        .send_request(dest, &Message::binding_request(), None)
        .await?;
    match reply.mapped_address() {
        Some(mapped) => println!("Mapped: {} (rtt {:?})", mapped, reply.rtt),
        None => bail!("response carried no mapped address"),
    }
    socket.close();
    Ok(())
}

async fn run_loopback(config: IceConfig, streams: usize, components: u16, limit: Duration) -> Result<()> {
    let sockets: Vec<IceSocket> = (0..streams)
        .map(|i| IceSocket::new(format!("stream{}", i), components))
        .collect();

    let a = IceAgent::create_peer(IceRole::Controlling, None, false, sockets.clone(), config.clone()).await?;
    let b = IceAgent::create_peer(IceRole::Controlled, None, false, sockets, config).await?;
    println!("Agent A: {} ({})", a.peer_id(), a.role());
    println!("Agent B: {} ({})", b.peer_id(), b.role());

    a.set_remote(&b.local_description())?;
    b.set_remote(&a.local_description())?;

    let started = Instant::now();
    a.start()?;
    b.start()?;

    let (status_a, status_b) = tokio::time::timeout(limit, async {
        tokio::join!(a.wait_for_completion(), b.wait_for_completion())
    })
    .await
    .context("connectivity checks timed out")?;
    println!("Completed in {:?}: A={:?} B={:?}", started.elapsed(), status_a, status_b);
    if status_a != IceStatus::Success || status_b != IceStatus::Success {
        bail!("connectivity establishment failed");
    }

    for pair in a.selected_pairs() {
        println!(
            "  stream {} component {}: {} <-> {}",
            pair.stream, pair.component, pair.local.address, pair.remote.address
        );
    }

    let sender = a.channel(0, 1)?;
    let receiver = b.channel(0, 1)?;
    sender.write(b"Testing")?;
    let (from, data) = tokio::time::timeout(Duration::from_secs(5), receiver.receive())
        .await
        .context("datagram not delivered")??;
    println!("B received {:?} from {}", String::from_utf8_lossy(&data), from);

    let stats = a.stats();
    println!(
        "A: {} checks sent, {} succeeded, {} retransmissions",
        stats.checks_sent, stats.checks_succeeded, stats.retransmissions
    );

    a.close();
    b.close();
    Ok(())
}
