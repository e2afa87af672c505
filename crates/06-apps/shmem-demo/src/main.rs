//! Echo server, client, crash simulator and round-trip benchmark for shared-memory channels.

mod frame;

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use shmem_channel::{
    Channel, ChannelAddress, ChannelBuilder, ChannelConfig, Connection, LockStrategy,
};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-memory channel demos")]
struct Args {
    /// JSON file with channel tunables; missing fields keep their defaults
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding segment backing files (defaults to SHMEM_DIR or /dev/shm)
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Condition backing used when creating a channel
    #[arg(long, global = true, value_enum)]
    strategy: Option<Strategy>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept connections and answer every message with "<message> World!"
    Server {
        /// Link file clients use to find the segment
        #[arg(long)]
        flink: PathBuf,

        #[arg(long, default_value_t = 64 * 1024)]
        size: usize,

        /// Stop after serving this many connections
        #[arg(long)]
        connections: Option<usize>,

        /// Seconds to wait for a client or for the next message
        #[arg(long, default_value_t = 60)]
        idle_secs: u64,
    },
    /// Connect to a server and print its replies
    Client {
        /// shmem:///path/to/link or shmem+id://<os id>
        #[arg(long)]
        address: ChannelAddress,

        #[arg(long, default_value = "Hello")]
        message: String,

        #[arg(long, default_value_t = 1)]
        repeat: usize,
    },
    /// Connect, take the write turn and abort, leaving the server to notice
    Crash {
        #[arg(long)]
        address: ChannelAddress,
    },
    /// In-process round trips of three integers summed by the server
    Bench {
        #[arg(long, default_value_t = 10_000)]
        rounds: u64,

        #[arg(long, default_value_t = 4096)]
        size: usize,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Strategy {
    Spin,
    Os,
}

impl From<Strategy> for LockStrategy {
    fn from(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Spin => LockStrategy::Spin,
            Strategy::Os => LockStrategy::Os,
        }
    }
}

const TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ChannelConfig::default(),
    };
    if let Some(strategy) = args.strategy {
        config.lock_strategy = strategy.into();
    }
    let mut builder = ChannelBuilder::new().config(config);
    if let Some(dir) = &args.dir {
        builder = builder.dir(dir);
    }

    match args.command {
        Command::Server {
            flink,
            size,
            connections,
            idle_secs,
        } => run_server(
            builder.size(size).flink(flink),
            connections,
            Duration::from_secs(idle_secs),
        ),
        Command::Client {
            address,
            message,
            repeat,
        } => run_client(builder.address(&address), &message, repeat),
        Command::Crash { address } => run_crash(builder.address(&address)),
        Command::Bench { rounds, size } => run_bench(builder.size(size), rounds),
    }
}

/// Default filter when `RUST_LOG` is unset: demo progress plus channel lifecycle.
const DEFAULT_FILTER: &str = "warn,shmem_demo=info,shmem_channel=info,shmem=info";

fn init_tracing() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    if fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .try_init()
        .is_err()
    {
        eprintln!("tracing subscriber already installed");
    }
}

fn load_config(path: &Path) -> Result<ChannelConfig> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {path:?}"))?;
    serde_json::from_str(&raw).with_context(|| format!("failed to parse {path:?}"))
}

fn run_server(builder: ChannelBuilder, connections: Option<usize>, idle: Duration) -> Result<()> {
    let channel = builder.create_server().context("failed to create channel")?;
    info!(address = %channel.address(), "serving");

    let mut served = 0usize;
    while connections.map_or(true, |limit| served < limit) {
        let connection = match channel.accept(idle) {
            Ok(connection) => connection,
            Err(err) if err.is_timeout() => {
                info!("no client yet");
                continue;
            }
            Err(err) => return Err(err).context("accept failed"),
        };
        info!(client = connection.remote_pid(), "client connected");
        match echo(&connection, idle) {
            Ok(count) => info!(count, "client finished"),
            Err(err) => warn!("connection ended: {err:#}"),
        }
        served += 1;
    }

    channel.close().context("failed to close channel")?;
    channel.segment().close().context("failed to close segment")?;
    Ok(())
}

/// Answers messages until the client closes. Returns the number of replies.
fn echo(connection: &Connection, idle: Duration) -> Result<usize> {
    let mut count = 0;
    loop {
        let message = match connection.read(idle) {
            Ok(guard) => frame::decode(&guard)?.to_owned(),
            Err(err) if err.is_closed() => return Ok(count),
            Err(err) => return Err(err.into()),
        };
        let mut reply = connection.write(idle)?;
        frame::encode(&mut reply, &format!("{message} World!"))?;
        reply.commit()?;
        count += 1;
    }
}

fn run_client(builder: ChannelBuilder, message: &str, repeat: usize) -> Result<()> {
    let channel = builder.create_client().context("failed to open channel")?;
    let connection = channel.connect(TIMEOUT).context("connect failed")?;
    for _ in 0..repeat {
        let mut request = connection.write(TIMEOUT)?;
        frame::encode(&mut request, message)?;
        request.commit()?;

        let reply = connection.read(TIMEOUT)?;
        println!("{}", frame::decode(&reply)?);
    }
    connection.close()?;
    channel.segment().close()?;
    Ok(())
}

fn run_crash(builder: ChannelBuilder) -> Result<()> {
    let channel = builder.create_client().context("failed to open channel")?;
    let connection = channel.connect(TIMEOUT).context("connect failed")?;
    let request = connection.write(TIMEOUT)?;
    warn!(capacity = request.len(), "aborting while holding the write turn");
    std::process::abort()
}

fn run_bench(builder: ChannelBuilder, rounds: u64) -> Result<()> {
    if rounds == 0 {
        bail!("rounds must be positive");
    }
    let server = builder.create_server().context("failed to create channel")?;
    let client = builder
        .address(&server.address())
        .create_client()
        .context("failed to open channel")?;

    let elapsed = thread::scope(|scope| -> Result<Duration> {
        let summer = scope.spawn(|| sum_server(&server, rounds));
        let connection = client.connect(TIMEOUT)?;
        let started = Instant::now();
        for round in 0..rounds {
            let mut request = connection.write(TIMEOUT)?;
            for (slot, value) in [round, round * 2, round * 3].into_iter().enumerate() {
                request[slot * 8..slot * 8 + 8].copy_from_slice(&value.to_ne_bytes());
            }
            request.commit()?;

            let reply = connection.read(TIMEOUT)?;
            let sum = read_u64(&reply, 0);
            if sum != round * 6 {
                bail!("round {round}: expected {}, got {sum}", round * 6);
            }
        }
        let elapsed = started.elapsed();
        connection.close()?;
        summer
            .join()
            .map_err(|_| anyhow::anyhow!("server thread panicked"))??;
        Ok(elapsed)
    })?;

    let per_round = elapsed / u32::try_from(rounds).unwrap_or(u32::MAX);
    println!(
        "{rounds} round trips in {elapsed:?} ({per_round:?} each, {:.0}/s)",
        rounds as f64 / elapsed.as_secs_f64()
    );

    client.segment().close()?;
    server.close()?;
    server.segment().close()?;
    Ok(())
}

fn sum_server(channel: &Channel, rounds: u64) -> Result<()> {
    let connection = channel.accept(TIMEOUT)?;
    for _ in 0..rounds {
        let sum = {
            let request = connection.read(TIMEOUT)?;
            (0..3).map(|slot| read_u64(&request, slot * 8)).sum::<u64>()
        };
        let mut reply = connection.write(TIMEOUT)?;
        reply[..8].copy_from_slice(&sum.to_ne_bytes());
        reply.commit()?;
    }
    // Wait for the client to hang up before dropping our side.
    let result = match connection.read(TIMEOUT) {
        Err(err) if err.is_closed() => Ok(()),
        Err(err) => Err(err.into()),
        Ok(_) => bail!("unexpected message after the last round"),
    };
    result
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_ne_bytes(raw)
}
