//! Wire format for the stepper driver control socket.
//!
//! Every message is an 8-byte little-endian header `{command, length}`
//! followed by `length` payload bytes, emitted back-to-back on the stream
//! with no delimiters.

/// Command identifier for a speed change request.
pub const CMD_SET_SPEED: u32 = 1;

/// Fixed size of the frame header.
pub const HEADER_LEN: usize = 8;

/// Total encoded size of a speed command: header plus two payload bytes.
pub const SPEED_PACKET_LEN: usize = 10;

/// Speed range the driver accepts.
pub const SPEED_MIN: u8 = 1;
pub const SPEED_MAX: u8 = 25;

/// Speed carried by the very first command after emitter startup.
pub const INITIAL_SPEED: u8 = 12;

/// Frame header preceding every message on the control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    pub command: u32,
    pub length: u32,
}

impl CommandHeader {
    /// Decode a header from a full 8-byte buffer.
    pub fn from_array(buf: &[u8; HEADER_LEN]) -> Self {
        Self {
            command: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            length: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }

    /// Parse a header from the start of a frame.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let mut buf = [0u8; HEADER_LEN];
        buf.copy_from_slice(&data[..HEADER_LEN]);
        Some(Self::from_array(&buf))
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[..4].copy_from_slice(&self.command.to_le_bytes());
        buf[4..].copy_from_slice(&self.length.to_le_bytes());
        buf
    }
}

/// Commands understood by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    SetSpeed,
    Unknown(u32),
}

impl From<u32> for CommandKind {
    fn from(id: u32) -> Self {
        match id {
            CMD_SET_SPEED => CommandKind::SetSpeed,
            other => CommandKind::Unknown(other),
        }
    }
}

/// Speed command payload: target channel and requested speed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeedCommand {
    pub channel: u8,
    pub speed: u8,
}

impl SpeedCommand {
    /// Serialize the full 10-byte frame, header included.
    pub fn encode(&self) -> [u8; SPEED_PACKET_LEN] {
        let header = CommandHeader {
            command: CMD_SET_SPEED,
            length: 2,
        };

        let mut buf = [0u8; SPEED_PACKET_LEN];
        buf[..HEADER_LEN].copy_from_slice(&header.to_bytes());
        buf[8] = self.channel;
        buf[9] = self.speed;
        buf
    }

    /// Parse a speed command from a frame payload.
    pub fn from_payload(data: &[u8]) -> Option<Self> {
        if data.len() != 2 {
            return None;
        }
        Some(Self {
            channel: data[0],
            speed: data[1],
        })
    }

    /// Whether the speed byte lies in the range the driver accepts.
    pub fn speed_in_range(&self) -> bool {
        (SPEED_MIN..=SPEED_MAX).contains(&self.speed)
    }
}
