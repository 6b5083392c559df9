//! Mock peer for the stepper driver control socket: accept clients,
//! decode `{command, length, payload}` frames, and keep per-channel
//! reception statistics for reporting.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UnixListener;
use tracing::{debug, info, warn};

use crate::packet::{CommandHeader, CommandKind, HEADER_LEN, SpeedCommand};

/// No driver command carries a payload anywhere near this large; a bigger
/// length means the stream is desynced and the connection is dropped.
const MAX_FRAME_PAYLOAD: usize = 1024;

/// Per-channel reception statistics.
#[derive(Debug, Clone)]
pub struct ChannelStats {
    pub channel: u8,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub last_speed: Option<u8>,
    pub min_speed: Option<u8>,
    pub max_speed: Option<u8>,
    pub out_of_range: u64,
    pub max_gap_ms: u64,
    first_packet_time: Option<Instant>,
    last_packet_time: Option<Instant>,
    last_report_time: Instant,
    last_report_packets: u64,
}

impl ChannelStats {
    fn new(channel: u8) -> Self {
        Self {
            channel,
            packets_received: 0,
            bytes_received: 0,
            last_speed: None,
            min_speed: None,
            max_speed: None,
            out_of_range: 0,
            max_gap_ms: 0,
            first_packet_time: None,
            last_packet_time: None,
            last_report_time: Instant::now(),
            last_report_packets: 0,
        }
    }

    fn update(&mut self, frame_len: usize, cmd: SpeedCommand) {
        let now = Instant::now();

        if self.first_packet_time.is_none() {
            self.first_packet_time = Some(now);
        }
        if let Some(last_time) = self.last_packet_time {
            let gap_ms = now.duration_since(last_time).as_millis() as u64;
            if gap_ms > self.max_gap_ms {
                self.max_gap_ms = gap_ms;
            }
        }
        self.last_packet_time = Some(now);

        self.packets_received += 1;
        self.bytes_received += frame_len as u64;
        self.last_speed = Some(cmd.speed);

        if cmd.speed_in_range() {
            if self.min_speed.is_none() || Some(cmd.speed) < self.min_speed {
                self.min_speed = Some(cmd.speed);
            }
            if self.max_speed.is_none() || Some(cmd.speed) > self.max_speed {
                self.max_speed = Some(cmd.speed);
            }
        } else {
            self.out_of_range += 1;
            debug!(
                "Channel {} speed {} outside accepted range",
                cmd.channel, cmd.speed
            );
        }
    }
}

/// Process-wide frame counters, shared across connection tasks.
#[derive(Debug, Default)]
pub struct Totals {
    pub connections: AtomicU64,
    pub frames: AtomicU64,
    pub bytes: AtomicU64,
    pub unknown_commands: AtomicU64,
    pub malformed_frames: AtomicU64,
    pub truncated_frames: AtomicU64,
}

/// Shared monitor state updated by every connection task.
#[derive(Debug, Default)]
pub struct Monitor {
    channels: Mutex<HashMap<u8, ChannelStats>>,
    pub totals: Totals,
}

impl Monitor {
    fn record_speed(&self, frame_len: usize, cmd: SpeedCommand) {
        let mut channels = self.channels.lock();
        let stats = channels
            .entry(cmd.channel)
            .or_insert_with(|| ChannelStats::new(cmd.channel));
        stats.update(frame_len, cmd);
    }

    /// Snapshot of one channel's statistics.
    pub fn channel_stats(&self, channel: u8) -> Option<ChannelStats> {
        self.channels.lock().get(&channel).cloned()
    }

    /// Log per-channel rates and totals since the previous report.
    pub fn report(&self) {
        let mut channels = self.channels.lock();
        if channels.is_empty() {
            info!("No speed commands received yet");
            return;
        }

        let mut entries: Vec<&mut ChannelStats> = channels.values_mut().collect();
        entries.sort_by_key(|s| s.channel);

        for stats in entries {
            let now = Instant::now();
            let elapsed = now.duration_since(stats.last_report_time).as_secs_f64();
            let delta = stats.packets_received - stats.last_report_packets;
            let rate = if elapsed > 0.0 {
                delta as f64 / elapsed
            } else {
                0.0
            };

            info!(
                "Channel {}: {} commands ({:.2}/s) - last speed {} - range [{}..{}] - max gap {} ms - out of range {}",
                stats.channel,
                stats.packets_received,
                rate,
                fmt_speed(stats.last_speed),
                fmt_speed(stats.min_speed),
                fmt_speed(stats.max_speed),
                stats.max_gap_ms,
                stats.out_of_range,
            );

            stats.last_report_time = now;
            stats.last_report_packets = stats.packets_received;
        }
    }

    /// Print the final summary block.
    pub fn summary(&self, elapsed: Duration) {
        let frames = self.totals.frames.load(Ordering::Relaxed);
        let bytes = self.totals.bytes.load(Ordering::Relaxed);

        info!("======= MONITOR SUMMARY =======");
        info!("Run time: {:.2} seconds", elapsed.as_secs_f64());
        info!(
            "Connections accepted: {}",
            self.totals.connections.load(Ordering::Relaxed)
        );
        info!("Frames received: {} ({} bytes)", frames, bytes);
        info!(
            "Unknown commands: {}",
            self.totals.unknown_commands.load(Ordering::Relaxed)
        );
        info!(
            "Malformed frames: {}",
            self.totals.malformed_frames.load(Ordering::Relaxed)
        );
        info!(
            "Truncated frames: {}",
            self.totals.truncated_frames.load(Ordering::Relaxed)
        );

        let channels = self.channels.lock();
        let mut entries: Vec<&ChannelStats> = channels.values().collect();
        entries.sort_by_key(|s| s.channel);
        for stats in entries {
            info!(
                "Channel {}: {} commands, {} bytes, last speed {}, range [{}..{}], out of range {}",
                stats.channel,
                stats.packets_received,
                stats.bytes_received,
                fmt_speed(stats.last_speed),
                fmt_speed(stats.min_speed),
                fmt_speed(stats.max_speed),
                stats.out_of_range,
            );
        }
        info!("===============================");
    }
}

fn fmt_speed(speed: Option<u8>) -> String {
    match speed {
        Some(s) => s.to_string(),
        None => "-".to_string(),
    }
}

/// Bind the rendezvous socket, removing a stale socket file left behind
/// by a previous run.
pub fn bind_socket(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        info!("Socket {} already exists, removing", path.display());
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }

    UnixListener::bind(path)
        .with_context(|| format!("Failed to bind control socket {}", path.display()))
}

enum ReadOutcome {
    Full,
    Eof,
    Truncated,
}

async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<ReadOutcome>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Truncated
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

/// Decode frames from one client connection until it goes away.
///
/// A client disconnect on a frame boundary is a clean close, not an error.
/// A frame cut off mid-way is discarded and counted as truncated.
pub async fn drain_connection<R>(monitor: &Monitor, reader: &mut R) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        match read_exact_or_eof(reader, &mut header_buf).await? {
            ReadOutcome::Eof => return Ok(()),
            ReadOutcome::Truncated => {
                monitor.totals.truncated_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Client went away mid-header, discarding partial frame");
                return Ok(());
            }
            ReadOutcome::Full => {}
        }

        let header = CommandHeader::from_array(&header_buf);
        if header.length as usize > MAX_FRAME_PAYLOAD {
            monitor.totals.malformed_frames.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Dropping connection: frame length {} exceeds limit {}",
                header.length, MAX_FRAME_PAYLOAD
            );
            return Ok(());
        }

        let mut payload = vec![0u8; header.length as usize];
        match read_exact_or_eof(reader, &mut payload).await? {
            ReadOutcome::Eof | ReadOutcome::Truncated => {
                monitor.totals.truncated_frames.fetch_add(1, Ordering::Relaxed);
                warn!("Client went away mid-payload, discarding partial frame");
                return Ok(());
            }
            ReadOutcome::Full => {}
        }

        let frame_len = HEADER_LEN + payload.len();
        monitor.totals.frames.fetch_add(1, Ordering::Relaxed);
        monitor.totals.bytes.fetch_add(frame_len as u64, Ordering::Relaxed);

        match CommandKind::from(header.command) {
            CommandKind::SetSpeed => match SpeedCommand::from_payload(&payload) {
                Some(cmd) => {
                    debug!("Channel {} speed command: {}", cmd.channel, cmd.speed);
                    monitor.record_speed(frame_len, cmd);
                }
                None => {
                    monitor.totals.malformed_frames.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Speed command with unexpected payload length {}",
                        payload.len()
                    );
                }
            },
            CommandKind::Unknown(id) => {
                monitor.totals.unknown_commands.fetch_add(1, Ordering::Relaxed);
                debug!("Skipping unknown command {} ({} payload bytes)", id, payload.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{INITIAL_SPEED, SPEED_PACKET_LEN};

    fn frame(command: u32, payload: &[u8]) -> Vec<u8> {
        let header = CommandHeader {
            command,
            length: payload.len() as u32,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    #[tokio::test]
    async fn test_decodes_concatenated_frames() {
        let monitor = Monitor::default();

        let mut bytes = Vec::new();
        bytes.extend_from_slice(&SpeedCommand { channel: 0, speed: INITIAL_SPEED }.encode());
        bytes.extend_from_slice(&SpeedCommand { channel: 0, speed: 7 }.encode());
        bytes.extend_from_slice(&SpeedCommand { channel: 3, speed: 25 }.encode());

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.frames.load(Ordering::Relaxed), 3);
        assert_eq!(
            monitor.totals.bytes.load(Ordering::Relaxed),
            3 * SPEED_PACKET_LEN as u64
        );

        let ch0 = monitor.channel_stats(0).unwrap();
        assert_eq!(ch0.packets_received, 2);
        assert_eq!(ch0.bytes_received, 2 * SPEED_PACKET_LEN as u64);
        assert_eq!(ch0.last_speed, Some(7));
        assert_eq!(ch0.min_speed, Some(7));
        assert_eq!(ch0.max_speed, Some(INITIAL_SPEED));

        let ch3 = monitor.channel_stats(3).unwrap();
        assert_eq!(ch3.packets_received, 1);
        assert_eq!(ch3.last_speed, Some(25));
    }

    #[tokio::test]
    async fn test_unknown_command_skipped_and_counted() {
        let monitor = Monitor::default();
        let bytes = frame(9, &[0xde, 0xad, 0xbe, 0xef]);

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.frames.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.totals.unknown_commands.load(Ordering::Relaxed), 1);
        assert!(monitor.channel_stats(0).is_none());
    }

    #[tokio::test]
    async fn test_truncated_trailing_frame() {
        let monitor = Monitor::default();

        let mut bytes = SpeedCommand { channel: 0, speed: 5 }.encode().to_vec();
        bytes.extend_from_slice(&[1, 0, 0, 0]); // header cut short

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.frames.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.totals.truncated_frames.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.channel_stats(0).unwrap().packets_received, 1);
    }

    #[tokio::test]
    async fn test_clean_eof_on_frame_boundary() {
        let monitor = Monitor::default();
        let bytes = SpeedCommand { channel: 0, speed: 5 }.encode();

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.truncated_frames.load(Ordering::Relaxed), 0);
        assert_eq!(monitor.totals.frames.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_speed_counted() {
        let monitor = Monitor::default();
        let bytes = frame(1, &[0, 0]); // speed 0 is below the accepted range

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        let stats = monitor.channel_stats(0).unwrap();
        assert_eq!(stats.out_of_range, 1);
        assert_eq!(stats.last_speed, Some(0));
        assert_eq!(stats.min_speed, None);
        assert_eq!(stats.max_speed, None);
    }

    #[tokio::test]
    async fn test_bad_payload_length_is_malformed() {
        let monitor = Monitor::default();
        let bytes = frame(1, &[0, 12, 99]);

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.malformed_frames.load(Ordering::Relaxed), 1);
        assert!(monitor.channel_stats(0).is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_drops_connection() {
        let monitor = Monitor::default();
        let header = CommandHeader {
            command: 1,
            length: 1_000_000,
        };
        let bytes = header.to_bytes();

        let mut reader = bytes.as_slice();
        drain_connection(&monitor, &mut reader).await.unwrap();

        assert_eq!(monitor.totals.malformed_frames.load(Ordering::Relaxed), 1);
        assert_eq!(monitor.totals.frames.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_bind_socket_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        std::fs::write(&path, b"").unwrap();

        let listener = bind_socket(&path).unwrap();
        drop(listener);
    }
}
