use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use stepper_comm_sim::SOCKET_PATH;
use stepper_comm_sim::monitor::{self, Monitor};

#[derive(Parser, Debug)]
#[command(name = "speed-monitor")]
#[command(about = "Mock stepper driver peer - receive and report speed commands")]
struct Args {
    /// Socket path to listen on
    #[arg(short, long, default_value = SOCKET_PATH)]
    socket: PathBuf,

    /// Report interval in seconds
    #[arg(short = 'r', long, default_value = "5")]
    interval: u64,

    /// Time to run in seconds (0 = infinite)
    #[arg(short, long, default_value = "0")]
    time: u64,

    /// Verbose logging (default: false)
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let listener = monitor::bind_socket(&args.socket)?;
    info!("Listening on socket {}", args.socket.display());

    let monitor = Arc::new(Monitor::default());
    let start_time = Instant::now();

    // Periodic per-channel report
    let report_handle = {
        let monitor = monitor.clone();
        let mut ticker = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
        tokio::spawn(async move {
            ticker.tick().await; // the first tick completes immediately
            loop {
                ticker.tick().await;
                monitor.report();
            }
        })
    };

    let time_limit = async {
        if args.time > 0 {
            tokio::time::sleep(Duration::from_secs(args.time)).await;
        } else {
            std::future::pending::<()>().await;
        }
    };
    tokio::pin!(time_limit);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((mut stream, _addr)) => {
                        monitor.totals.connections.fetch_add(1, Ordering::Relaxed);
                        info!("Client connected");

                        let monitor = monitor.clone();
                        tokio::spawn(async move {
                            match monitor::drain_connection(&monitor, &mut stream).await {
                                Ok(()) => info!("Client disconnected"),
                                Err(e) => warn!("Connection error: {}", e),
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = &mut time_limit => {
                info!("Time limit reached, shutting down...");
                break;
            }
        }
    }

    report_handle.abort();
    monitor.summary(start_time.elapsed());

    // Leave no stale socket behind for the next run.
    if let Err(e) = std::fs::remove_file(&args.socket) {
        debug!("Failed to remove socket {}: {}", args.socket.display(), e);
    }

    Ok(())
}
