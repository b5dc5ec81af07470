//! REACH protocol: wire format for reliable bulk file transfer over UDP.
//!
//! Provides:
//! - `IntervalSet`: sorted, merged `[start, end)` runs of packet identifiers
//! - `Message`: the tagged binary codec for every datagram kind
//! - `FileLayout`: packet offsets and lengths for a file
//! - A bounds-checked decode cursor; malformed datagrams fail, never over-read

pub mod error;
pub mod layout;
pub mod message;
pub mod range;
pub mod reader;

// Re-export key types for convenience.
pub use error::{DecodeError, EncodeError};
pub use layout::FileLayout;
pub use message::{
    encode_file_packet, Message, MessageKind, DEFAULT_PACKET_SIZE, FILE_PACKET_HEADER,
    MAX_MESSAGE_SIZE, MAX_PACKET_PAYLOAD, PATH_LENGTH, PROTOCOL_VERSION, REACH_PORT,
};
pub use range::{Interval, IntervalSet, Iter, MAX_ENCODED_INTERVALS};
pub use reader::Reader;
