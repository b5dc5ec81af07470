use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use reach_protocol::REACH_PORT;
use reach_transfer::{
    default_output, Client, ClientConfig, FetchRequest, TracingLogger, TransferProgress,
};
use tracing::info;

/// How often progress is logged while a fetch runs.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "reach-client")]
#[command(about = "Fetch a file from a REACH server over UDP")]
struct Cli {
    /// Path of the file on the server
    #[arg(value_name = "FILE")]
    file: String,

    /// Server IPv4 address
    #[arg(short, long, default_value_t = Ipv4Addr::LOCALHOST)]
    address: Ipv4Addr,

    /// Server UDP port
    #[arg(short, long, default_value_t = REACH_PORT)]
    port: u16,

    /// Local destination (defaults to the remote file name)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Concurrent window-workers, each with its own transfer id
    #[arg(short, long, default_value_t = 1, value_parser = clap::value_parser!(u16).range(1..=64))]
    workers: u16,
}

fn main() -> anyhow::Result<()> {
    let Cli {
        file,
        address,
        port,
        output,
        workers,
    } = Cli::parse();
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reach_client=info,reach_transfer=info".into()),
        )
        .init();

    let mut config = ClientConfig::from_env()?;
    config.server_addr = SocketAddr::new(IpAddr::V4(address), port);

    let output = output.unwrap_or_else(|| default_output(&file));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async move {
        let client = Client::connect(config, Some(Arc::new(TracingLogger)))?;
        let progress = Arc::new(TransferProgress::new());

        info!(
            "Fetching {} from {} into {}",
            file,
            client.config().server_addr,
            output.display()
        );
        let request = FetchRequest::new(file.as_str(), &output)
            .workers(usize::from(workers))
            .progress(progress.clone());

        let fetch = client.fetch(request);
        tokio::pin!(fetch);
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.tick().await;

        let report = loop {
            tokio::select! {
                result = &mut fetch => break result?,
                _ = ticker.tick() => {
                    info!(
                        "{:.1}% ({} / {} packets, {} lost chunks)",
                        progress.fraction() * 100.0,
                        progress.packets_done.load(Ordering::Relaxed),
                        progress.packets_total.load(Ordering::Relaxed),
                        progress.lost_chunks.load(Ordering::Relaxed),
                    );
                }
            }
        };

        println!(
            "{}: {} bytes in {:.2}s ({:.1} MB/s), {} lost chunks, {} unexpected packets",
            output.display(),
            report.file_size,
            report.duration.as_secs_f64(),
            report.throughput_bps() / 1_000_000.0,
            report.lost_chunks,
            report.unexpected,
        );
        Ok::<(), anyhow::Error>(())
    })
}
