//! CLI command implementations

use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use bytes::Bytes;
use clap::{Args, Subcommand};
use futures::StreamExt;
use teleflux_core::config::TelefluxConfig;
use teleflux_core::protocol::{DcId, MessageRef};
use teleflux_core::{Engine, RangeRequest, SpeedTestEvent};
use teleflux_sim::{FetchBehavior, SimulatedCluster};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Stream a byte range of a simulated file and verify it
    Stream {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// First byte of the range
        #[arg(long, default_value = "0")]
        from: u64,
        /// Last byte of the range, inclusive (defaults to end of file)
        #[arg(long)]
        until: Option<u64>,
        /// Disconnect after this many pieces
        #[arg(long)]
        disconnect_after: Option<usize>,
    },
    /// Benchmark every bot against a simulated file
    Bench {
        #[command(flatten)]
        cluster: ClusterArgs,
        /// Print progress events as JSON lines
        #[arg(long)]
        events: bool,
    },
    /// Stream a file once and print the bot health table
    Pool {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

/// Shape of the simulated cluster.
#[derive(Args, Clone)]
pub struct ClusterArgs {
    /// Number of simulated bots
    #[arg(short, long, default_value = "3")]
    bots: usize,
    /// Size of the simulated file in bytes
    #[arg(long, default_value = "8388608")]
    file_size: usize,
    /// Datacenter holding the file
    #[arg(long, default_value = "4")]
    dc: i32,
    /// Per-fetch latency in milliseconds
    #[arg(long, default_value = "5")]
    latency_ms: u64,
    /// Maximum extra random latency in milliseconds
    #[arg(long, default_value = "20")]
    jitter_ms: u64,
    /// Seed for reproducible jitter
    #[arg(long, default_value = "42")]
    seed: u64,
    /// Make the first bot drop every fetch
    #[arg(long)]
    flaky_primary: bool,
    /// Use production timeouts instead of the shortened test ones
    #[arg(long)]
    production_timing: bool,
}

struct Session {
    cluster: SimulatedCluster,
    engine: Engine,
    file: Simulated,
}

struct Simulated {
    message: MessageRef,
    data: Bytes,
}

impl ClusterArgs {
    fn build(&self) -> anyhow::Result<Session> {
        if self.bots == 0 {
            bail!("at least one bot is required");
        }

        let config = if self.production_timing {
            TelefluxConfig::from_env()
        } else {
            TelefluxConfig::for_testing()
        };
        let dc = DcId(self.dc);
        let mut builder = SimulatedCluster::builder().config(config);
        for index in 0..self.bots {
            let behavior = if index == 0 && self.flaky_primary {
                FetchBehavior::TransportErrors
            } else {
                FetchBehavior::Healthy
            };
            let latency = Duration::from_millis(self.latency_ms);
            let jitter = Duration::from_millis(self.jitter_ms);
            let seed = self.seed.wrapping_add(index as u64);
            builder = builder.bot(|bot| {
                bot.home_dc(dc)
                    .latency(latency)
                    .jitter(jitter, seed)
                    .fetch_behavior(behavior)
            });
        }

        let cluster = builder.build();
        let (message, data) = cluster.add_seeded_file(1, dc, self.file_size);
        let engine = cluster.engine();
        engine.start();

        Ok(Session {
            cluster,
            engine,
            file: Simulated {
                message,
                data,
            },
        })
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the first failure of the selected command
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Stream {
            cluster,
            from,
            until,
            disconnect_after,
        } => run_stream(&cluster, from, until, disconnect_after).await,
        Commands::Bench { cluster, events } => run_bench(&cluster, events).await,
        Commands::Pool { cluster } => show_pool(&cluster).await,
    }
}

/// Streams a range and checks the bytes against the stored file.
///
/// # Errors
/// - Range outside the file, stream aborted, or content mismatch
pub async fn run_stream(
    args: &ClusterArgs,
    from: u64,
    until: Option<u64>,
    disconnect_after: Option<usize>,
) -> anyhow::Result<()> {
    let session = args.build()?;
    let file_len = session.file.data.len() as u64;
    let until = until.unwrap_or(file_len.saturating_sub(1));

    let downstream = CancellationToken::new();
    let request = RangeRequest::new(session.file.message, from, until)
        .with_downstream(downstream.clone())
        .with_meta("source", "cli");
    let opened = session
        .engine
        .open_stream(request)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .context("Failed to open stream")?;

    println!("Stream {} for bytes {from}-{until}", opened.id);
    let started = Instant::now();
    let mut bytes = opened.bytes;
    let mut received = Vec::new();
    let mut pieces = 0usize;

    while let Some(piece) = bytes.next().await {
        let piece = piece.context("Stream aborted")?;
        received.extend_from_slice(&piece);
        pieces += 1;
        if disconnect_after.is_some_and(|limit| pieces >= limit) {
            println!("Disconnecting after {pieces} pieces");
            downstream.cancel();
        }
    }
    drop(bytes);

    let elapsed = started.elapsed().as_secs_f64();
    println!(
        "Received {} bytes in {pieces} pieces ({elapsed:.2}s)",
        received.len()
    );

    if disconnect_after.is_none() {
        let expected = &session.file.data[from as usize..=until as usize];
        if received.as_slice() != expected {
            bail!("Streamed bytes do not match the stored file");
        }
        println!("Content verified");
    }

    session.engine.shutdown().await;
    if let Some(state) = session.engine.registry().stream(&opened.id) {
        println!(
            "Status: {}, avg {:.2} MB/s, peak {:.2} MB/s",
            state.status, state.avg_mbps, state.peak_mbps
        );
    }
    print_pool(&session.engine);
    info!(summaries = session.cluster.sink().len(), "Stream complete");
    Ok(())
}

/// Benchmarks every bot, optionally printing events as they arrive.
///
/// # Errors
/// - The simulated pool is empty
pub async fn run_bench(args: &ClusterArgs, events: bool) -> anyhow::Result<()> {
    let session = args.build()?;
    let message = session.file.message;

    let results = if events {
        let mut receiver = session.engine.benchmark_all_with_events(message)?;
        let mut results = Vec::new();
        while let Some(event) = receiver.recv().await {
            println!("{}", serde_json::to_string(&event)?);
            if let SpeedTestEvent::Result { data, .. } = event {
                results.push(data);
            }
        }
        results
    } else {
        session.engine.benchmark_all(message).await?
    };

    println!("Speed Test Results");
    println!("{:-<60}", "");
    for result in &results {
        match &result.error {
            Some(error) => println!("{:<8} failed: {error}", result.display_name),
            None => println!(
                "{:<8} ping {:>8.1} ms  {:>8.2} MB/s  {} bytes",
                result.display_name,
                result.ping_ms.unwrap_or_default(),
                result.mbps.unwrap_or_default(),
                result.bytes_downloaded
            ),
        }
    }

    session.engine.shutdown().await;
    Ok(())
}

/// Streams the whole file once so the health table has data, then prints it.
///
/// # Errors
/// - Stream could not be opened or aborted
pub async fn show_pool(args: &ClusterArgs) -> anyhow::Result<()> {
    let session = args.build()?;
    let until = (session.file.data.len() as u64).saturating_sub(1);
    let opened = session
        .engine
        .open_stream(RangeRequest::new(session.file.message, 0, until))
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    let mut bytes = opened.bytes;
    while let Some(piece) = bytes.next().await {
        piece?;
    }
    drop(bytes);

    session.engine.shutdown().await;
    print_pool(&session.engine);
    println!(
        "{}",
        serde_json::to_string_pretty(&session.engine.stream_snapshot())?
    );
    Ok(())
}

fn print_pool(engine: &Engine) {
    println!("Bot Health");
    println!("{:-<60}", "");
    for bot in engine.bot_snapshot() {
        println!(
            "{:<8} load {:>2}  failures {:>3}  bypassed {:>3}  {:>7.2} MB/s  {:?}",
            bot.display_name,
            bot.current_load,
            bot.failures,
            bot.bypassed,
            bot.avg_mbps,
            bot.status
        );
    }
}
