/// REACH wire messages.
///
/// One message per UDP datagram. Integers are little-endian.
///
/// ```text
/// Ping                [0]
/// Alive               [1] [version u64]
/// RequestFile         [2] [transfer id u64] [path, PATH_LENGTH bytes, NUL padded]
/// FileInfo            [3] [transfer id u64] [file size u64] [packet size u64]
/// RequestFilePackets  [4] [transfer id u64] [interval set]
/// FilePacket          [5] [transfer id u64] [packet id u64] [payload ...]
/// ```
///
/// The FilePacket payload is not length-prefixed: it runs to the end of the
/// datagram, so decoding must be given exactly the received bytes.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::range::IntervalSet;
use crate::reader::Reader;

/// Well-known server port.
pub const REACH_PORT: u16 = 52123;

/// Fixed size of the RequestFile path field.
pub const PATH_LENGTH: usize = 256;

/// Largest datagram either side sends or expects to receive.
pub const MAX_MESSAGE_SIZE: usize = 9 * 1024;

/// Packet size the server announces unless configured otherwise.
pub const DEFAULT_PACKET_SIZE: u64 = 8 * 1024;

/// Version carried by Alive.
pub const PROTOCOL_VERSION: u64 = 1;

/// Tag + transfer id + packet id.
pub const FILE_PACKET_HEADER: usize = 1 + 8 + 8;

/// Largest payload a FilePacket can carry.
pub const MAX_PACKET_PAYLOAD: usize = MAX_MESSAGE_SIZE - FILE_PACKET_HEADER;

/// Message type tag, the first byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 0,
    Alive = 1,
    RequestFile = 2,
    FileInfo = 3,
    RequestFilePackets = 4,
    FilePacket = 5,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => Self::Ping,
            1 => Self::Alive,
            2 => Self::RequestFile,
            3 => Self::FileInfo,
            4 => Self::RequestFilePackets,
            5 => Self::FilePacket,
            _ => return None,
        })
    }

    #[inline]
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Alive => "alive",
            Self::RequestFile => "request_file",
            Self::FileInfo => "file_info",
            Self::RequestFilePackets => "request_file_packets",
            Self::FilePacket => "file_packet",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded or to-be-encoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Keepalive probe. Carries no transfer id.
    Ping,
    /// Reply to Ping.
    Alive { version: u64 },
    /// Client asks for a file's metadata.
    RequestFile { transfer_id: u64, path: String },
    /// Server answers RequestFile.
    FileInfo {
        transfer_id: u64,
        file_size: u64,
        packet_size: u64,
    },
    /// Client asks for a set of packets.
    RequestFilePackets {
        transfer_id: u64,
        packets: IntervalSet,
    },
    /// One packet of file data. The payload is an owned copy, independent of
    /// the buffer it was decoded from.
    FilePacket {
        transfer_id: u64,
        packet_id: u64,
        payload: Bytes,
    },
}

impl Message {
    pub fn ping() -> Self {
        Self::Ping
    }

    pub fn alive() -> Self {
        Self::Alive {
            version: PROTOCOL_VERSION,
        }
    }

    pub fn request_file(transfer_id: u64, path: impl Into<String>) -> Self {
        Self::RequestFile {
            transfer_id,
            path: path.into(),
        }
    }

    pub fn file_info(transfer_id: u64, file_size: u64, packet_size: u64) -> Self {
        Self::FileInfo {
            transfer_id,
            file_size,
            packet_size,
        }
    }

    pub fn request_file_packets(transfer_id: u64, packets: IntervalSet) -> Self {
        Self::RequestFilePackets {
            transfer_id,
            packets,
        }
    }

    pub fn file_packet(transfer_id: u64, packet_id: u64, payload: impl Into<Bytes>) -> Self {
        Self::FilePacket {
            transfer_id,
            packet_id,
            payload: payload.into(),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Ping => MessageKind::Ping,
            Self::Alive { .. } => MessageKind::Alive,
            Self::RequestFile { .. } => MessageKind::RequestFile,
            Self::FileInfo { .. } => MessageKind::FileInfo,
            Self::RequestFilePackets { .. } => MessageKind::RequestFilePackets,
            Self::FilePacket { .. } => MessageKind::FilePacket,
        }
    }

    /// Transfer id used for demultiplexing. `None` for Ping and Alive.
    pub fn transfer_id(&self) -> Option<u64> {
        match self {
            Self::Ping | Self::Alive { .. } => None,
            Self::RequestFile { transfer_id, .. }
            | Self::FileInfo { transfer_id, .. }
            | Self::RequestFilePackets { transfer_id, .. }
            | Self::FilePacket { transfer_id, .. } => Some(*transfer_id),
        }
    }

    /// Size of the encoded datagram.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Self::Ping => 0,
            Self::Alive { .. } => 8,
            Self::RequestFile { .. } => 8 + PATH_LENGTH,
            Self::FileInfo { .. } => 8 + 8 + 8,
            Self::RequestFilePackets { packets, .. } => 8 + packets.encoded_len(),
            Self::FilePacket { payload, .. } => 8 + 8 + payload.len(),
        }
    }

    /// Append the encoded datagram to `buf`. Nothing is written on error.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let len = self.encoded_len();
        if len > MAX_MESSAGE_SIZE {
            return Err(EncodeError::MessageTooLarge { len });
        }

        match self {
            Self::Ping => {
                buf.put_u8(MessageKind::Ping.tag());
            }
            Self::Alive { version } => {
                buf.reserve(len);
                buf.put_u8(MessageKind::Alive.tag());
                buf.put_u64_le(*version);
            }
            Self::RequestFile { transfer_id, path } => {
                let bytes = path.as_bytes();
                if bytes.len() > PATH_LENGTH {
                    return Err(EncodeError::PathTooLong { len: bytes.len() });
                }
                if bytes.contains(&0) {
                    return Err(EncodeError::PathContainsNul);
                }
                buf.reserve(len);
                buf.put_u8(MessageKind::RequestFile.tag());
                buf.put_u64_le(*transfer_id);
                buf.put_slice(bytes);
                buf.put_bytes(0, PATH_LENGTH - bytes.len());
            }
            Self::FileInfo {
                transfer_id,
                file_size,
                packet_size,
            } => {
                buf.reserve(len);
                buf.put_u8(MessageKind::FileInfo.tag());
                buf.put_u64_le(*transfer_id);
                buf.put_u64_le(*file_size);
                buf.put_u64_le(*packet_size);
            }
            Self::RequestFilePackets {
                transfer_id,
                packets,
            } => {
                if packets.interval_count() > crate::range::MAX_ENCODED_INTERVALS {
                    return Err(EncodeError::TooManyIntervals(packets.interval_count()));
                }
                buf.reserve(len);
                buf.put_u8(MessageKind::RequestFilePackets.tag());
                buf.put_u64_le(*transfer_id);
                packets.encode(buf)?;
            }
            Self::FilePacket {
                transfer_id,
                packet_id,
                payload,
            } => {
                encode_file_packet(buf, *transfer_id, *packet_id, payload)?;
            }
        }
        Ok(())
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one datagram. `data` must be exactly the received bytes.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(data);
        let tag = r.read_u8("message tag")?;
        let kind = MessageKind::from_tag(tag).ok_or(DecodeError::UnknownTag(tag))?;

        let message = match kind {
            MessageKind::Ping => Self::Ping,
            MessageKind::Alive => Self::Alive {
                version: r.read_u64("version")?,
            },
            MessageKind::RequestFile => {
                let transfer_id = r.read_u64("transfer id")?;
                let raw = r.read_array::<PATH_LENGTH>("path")?;
                let end = raw.iter().position(|&b| b == 0).unwrap_or(PATH_LENGTH);
                let path = std::str::from_utf8(&raw[..end])
                    .map_err(|_| DecodeError::InvalidPath)?
                    .to_owned();
                Self::RequestFile { transfer_id, path }
            }
            MessageKind::FileInfo => Self::FileInfo {
                transfer_id: r.read_u64("transfer id")?,
                file_size: r.read_u64("file size")?,
                packet_size: r.read_u64("packet size")?,
            },
            MessageKind::RequestFilePackets => Self::RequestFilePackets {
                transfer_id: r.read_u64("transfer id")?,
                packets: IntervalSet::decode(&mut r)?,
            },
            MessageKind::FilePacket => {
                let transfer_id = r.read_u64("transfer id")?;
                let packet_id = r.read_u64("packet id")?;
                let payload = Bytes::copy_from_slice(r.read_rest());
                Self::FilePacket {
                    transfer_id,
                    packet_id,
                    payload,
                }
            }
        };

        r.finish()?;
        Ok(message)
    }
}

/// Encode a FilePacket straight from a borrowed payload, e.g. a slice of a
/// memory-mapped file, without building a [`Message`] first.
pub fn encode_file_packet(
    buf: &mut BytesMut,
    transfer_id: u64,
    packet_id: u64,
    payload: &[u8],
) -> Result<(), EncodeError> {
    let len = FILE_PACKET_HEADER + payload.len();
    if len > MAX_MESSAGE_SIZE {
        return Err(EncodeError::MessageTooLarge { len });
    }
    buf.reserve(len);
    buf.put_u8(MessageKind::FilePacket.tag());
    buf.put_u64_le(transfer_id);
    buf.put_u64_le(packet_id);
    buf.put_slice(payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), message.encoded_len());
        assert_eq!(bytes[0], message.kind().tag());
        let parsed = Message::decode(&bytes).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_ping() {
        let bytes = Message::ping().to_bytes().unwrap();
        assert_eq!(&bytes[..], &[0u8]);
        roundtrip(Message::ping());
        assert_eq!(Message::ping().transfer_id(), None);
    }

    #[test]
    fn test_alive() {
        let bytes = Message::alive().to_bytes().unwrap();
        assert_eq!(bytes.len(), 9);
        assert_eq!(bytes[0], 1);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), PROTOCOL_VERSION);
        roundtrip(Message::alive());
    }

    #[test]
    fn test_request_file() {
        let message = Message::request_file(3456, "/some/random/file");
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 8 + PATH_LENGTH);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 3456);
        assert_eq!(&bytes[9..9 + 17], b"/some/random/file");
        assert!(bytes[9 + 17..].iter().all(|&b| b == 0));

        match Message::decode(&bytes).unwrap() {
            Message::RequestFile { transfer_id, path } => {
                assert_eq!(transfer_id, 3456);
                assert_eq!(path, "/some/random/file");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_request_file_full_length_path() {
        roundtrip(Message::request_file(1, "a".repeat(PATH_LENGTH)));
    }

    #[test]
    fn test_request_file_path_limits() {
        let too_long = Message::request_file(1, "a".repeat(PATH_LENGTH + 1));
        assert_eq!(
            too_long.to_bytes(),
            Err(EncodeError::PathTooLong { len: PATH_LENGTH + 1 })
        );
        let nul = Message::request_file(1, "bad\0path");
        assert_eq!(nul.to_bytes(), Err(EncodeError::PathContainsNul));
    }

    #[test]
    fn test_request_file_invalid_utf8() {
        let mut bytes = Message::request_file(9, "ok").to_bytes().unwrap().to_vec();
        bytes[9] = 0xff;
        assert_eq!(Message::decode(&bytes), Err(DecodeError::InvalidPath));
    }

    #[test]
    fn test_file_info() {
        let message = Message::file_info(1234567, 75234, 1024);
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 8 + 8 + 8);
        assert_eq!(bytes[0], 3);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 1234567);
        assert_eq!(u64::from_le_bytes(bytes[9..17].try_into().unwrap()), 75234);
        assert_eq!(u64::from_le_bytes(bytes[17..25].try_into().unwrap()), 1024);
        assert_eq!(Message::decode(&bytes).unwrap(), message);
        assert_eq!(message.transfer_id(), Some(1234567));
    }

    #[test]
    fn test_request_file_packets() {
        let message = Message::request_file_packets(77, IntervalSet::from_range(2, 19));
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), 1 + 8 + 1 + 16);
        assert_eq!(bytes[0], 4);
        assert_eq!(u64::from_le_bytes(bytes[1..9].try_into().unwrap()), 77);
        assert_eq!(bytes[9], 1);
        assert_eq!(u64::from_le_bytes(bytes[10..18].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(bytes[18..26].try_into().unwrap()), 19);
        roundtrip(message);

        let mut split = IntervalSet::from_range(0, 4);
        split.add_range(10, 12);
        split.add(40);
        roundtrip(Message::request_file_packets(u64::MAX, split));
        roundtrip(Message::request_file_packets(5, IntervalSet::new()));
    }

    #[test]
    fn test_file_packet() {
        let payload: Vec<u8> = (0..100u8).collect();
        let message = Message::file_packet(12, 99, payload.clone());
        let bytes = message.to_bytes().unwrap();
        assert_eq!(bytes.len(), FILE_PACKET_HEADER + 100);
        roundtrip(message);

        // Payload survives the source buffer being overwritten.
        let mut recv_buf = bytes.to_vec();
        let parsed = Message::decode(&recv_buf).unwrap();
        recv_buf.fill(0);
        match parsed {
            Message::FilePacket { payload: p, .. } => assert_eq!(&p[..], &payload[..]),
            other => panic!("unexpected {other:?}"),
        }

        // Empty payload is legal (zero-length tail).
        roundtrip(Message::file_packet(1, 2, Vec::new()));
    }

    #[test]
    fn test_file_packet_size_limit() {
        let max = Message::file_packet(1, 1, vec![7u8; MAX_PACKET_PAYLOAD]);
        assert_eq!(max.to_bytes().unwrap().len(), MAX_MESSAGE_SIZE);

        let over = Message::file_packet(1, 1, vec![7u8; MAX_PACKET_PAYLOAD + 1]);
        assert_eq!(
            over.to_bytes(),
            Err(EncodeError::MessageTooLarge {
                len: MAX_MESSAGE_SIZE + 1
            })
        );
    }

    #[test]
    fn test_encode_file_packet_matches_message() {
        let mut direct = BytesMut::new();
        encode_file_packet(&mut direct, 3, 4, b"hello").unwrap();
        assert_eq!(
            direct.freeze(),
            Message::file_packet(3, 4, &b"hello"[..]).to_bytes().unwrap()
        );
    }

    #[test]
    fn test_truncated_messages_rejected() {
        let messages = [
            Message::alive(),
            Message::request_file(1, "/etc/hosts"),
            Message::file_info(1, 2, 3),
            Message::request_file_packets(1, IntervalSet::from_range(0, 64)),
        ];
        for message in messages {
            let bytes = message.to_bytes().unwrap();
            for cut in 0..bytes.len() {
                let result = Message::decode(&bytes[..cut]);
                assert!(
                    matches!(result, Err(DecodeError::Truncated { .. })),
                    "{} cut to {cut} bytes decoded as {result:?}",
                    message.kind()
                );
            }
        }

        // FilePacket header is fixed; only the payload may be short.
        let bytes = Message::file_packet(1, 2, vec![1, 2, 3]).to_bytes().unwrap();
        for cut in 0..FILE_PACKET_HEADER {
            assert!(Message::decode(&bytes[..cut]).is_err());
        }
    }

    #[test]
    fn test_unknown_tag_and_trailing_bytes() {
        assert_eq!(Message::decode(&[42]), Err(DecodeError::UnknownTag(42)));

        let mut bytes = Message::file_info(1, 2, 3).to_bytes().unwrap().to_vec();
        bytes.push(0);
        assert_eq!(Message::decode(&bytes), Err(DecodeError::TrailingBytes(1)));
    }
}
