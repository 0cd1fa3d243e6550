//! Lockstep wire protocol: message kinds, the fixed header, connection kinds.

/// Size of every message header on the wire, in bytes.
pub const HEADER_SIZE: usize = 13;

/// Message kind, first byte of every header. Values are ASCII device control chars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Filler; never dispatched.
    Default = 0,
    /// Sync: client echoes the frame it decoded. Data transfer: package received.
    Ack = 6,
    /// Payload message. Sync: frame-numbered shared state. Data transfer: package.
    Data = 17,
    /// Server tells clients that the whole cluster is connected.
    Connected = 18,
    /// Graceful close of the connection.
    Disconnect = 19,
    /// Data transfer package, zlib-compressed; `uncompressed_size` is set.
    CompressedData = 21,
}

impl MessageKind {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageKind::Default),
            6 => Ok(MessageKind::Ack),
            17 => Ok(MessageKind::Data),
            18 => Ok(MessageKind::Connected),
            19 => Ok(MessageKind::Disconnect),
            21 => Ok(MessageKind::CompressedData),
            other => Err(other),
        }
    }
}

/// Fixed 13-byte message header. `payload_size` bytes follow it on the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: MessageKind,
    pub payload_size: u32,
    /// Inflated size for `CompressedData`; 0 otherwise.
    pub uncompressed_size: u32,
    /// Frame number on sync connections, package id on data-transfer connections.
    pub frame_number: u32,
}

impl Header {
    pub fn new(kind: MessageKind, frame_number: u32, payload_size: u32) -> Self {
        Self {
            kind,
            payload_size,
            uncompressed_size: 0,
            frame_number,
        }
    }
}

/// What traffic a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionKind {
    /// Frame-numbered shared state; takes part in the frame barrier.
    Sync,
    /// Out-of-band packages; acknowledged but never part of the barrier.
    DataTransfer,
}

impl std::fmt::Display for ConnectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionKind::Sync => f.write_str("sync"),
            ConnectionKind::DataTransfer => f.write_str("data transfer"),
        }
    }
}

/// Which end of the socket this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Listens and accepts; drives frames.
    Server,
    /// Connects out; follows frames.
    Client,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_values_match_wire() {
        assert_eq!(MessageKind::Default.as_u8(), 0);
        assert_eq!(MessageKind::Ack.as_u8(), 6);
        assert_eq!(MessageKind::Data.as_u8(), 17);
        assert_eq!(MessageKind::Connected.as_u8(), 18);
        assert_eq!(MessageKind::Disconnect.as_u8(), 19);
        assert_eq!(MessageKind::CompressedData.as_u8(), 21);
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(MessageKind::try_from(17), Ok(MessageKind::Data));
        assert_eq!(MessageKind::try_from(42), Err(42));
    }
}
