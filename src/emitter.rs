//! The test client side: connect once, then emit a speed command every
//! 1500 ms forever. Write failures are logged and tolerated on the same
//! connection; only the initial connect is fatal.

use anyhow::{Context, Result};
use rand::Rng;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, info, warn};

use crate::packet::{INITIAL_SPEED, SPEED_MAX, SPEED_MIN, SPEED_PACKET_LEN, SpeedCommand};

/// Fixed delay between consecutive speed commands.
pub const EMIT_INTERVAL: Duration = Duration::from_millis(1500);

/// Loop state threaded through the emit loop. The channel never changes
/// after startup; the speed is redrawn before every send after the first.
#[derive(Debug)]
pub struct EmitterState {
    pub channel: u8,
    pub speed: u8,
}

impl EmitterState {
    pub fn new() -> Self {
        Self {
            channel: 0,
            speed: INITIAL_SPEED,
        }
    }

    /// Redraw the speed for the next command.
    pub fn advance<R: Rng>(&mut self, rng: &mut R) {
        self.speed = rng.gen_range(SPEED_MIN..=SPEED_MAX);
    }

    pub fn command(&self) -> SpeedCommand {
        SpeedCommand {
            channel: self.channel,
            speed: self.speed,
        }
    }
}

impl Default for EmitterState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Stats {
    sent_packets: u64,
    sent_bytes: u64,
    errors: u64,
}

/// Open the control connection. Failure here is fatal to the process.
pub async fn connect(path: &Path) -> Result<UnixStream> {
    UnixStream::connect(path)
        .await
        .with_context(|| format!("Failed to connect to control socket {}", path.display()))
}

/// Write one encoded speed command to the stream.
pub async fn send_command(stream: &mut UnixStream, cmd: &SpeedCommand) -> std::io::Result<()> {
    stream.write_all(&cmd.encode()).await
}

/// Connect to the rendezvous socket and emit speed commands until killed.
pub async fn run(path: &Path) -> Result<()> {
    let mut stream = connect(path).await?;
    info!("Connected to control socket {}", path.display());

    let mut state = EmitterState::new();
    let mut stats = Stats::default();

    loop {
        let cmd = state.command();
        match send_command(&mut stream, &cmd).await {
            Ok(()) => {
                stats.sent_packets += 1;
                stats.sent_bytes += SPEED_PACKET_LEN as u64;

                if stats.sent_packets % 40 == 0 {
                    debug!(
                        "Sent {} commands ({} bytes, {} write errors)",
                        stats.sent_packets, stats.sent_bytes, stats.errors
                    );
                }
            }
            Err(e) => {
                // The connection is kept as-is; the next iteration will
                // try another write on it.
                stats.errors += 1;
                warn!("Failed to send speed command: {}", e);
            }
        }

        tokio::time::sleep(EMIT_INTERVAL).await;
        state.advance(&mut rand::thread_rng());
    }
}
