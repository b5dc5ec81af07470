//! Packet arithmetic for a file split into fixed-size packets.
//!
//! Packet `i` covers bytes `[i * packet_size, min((i + 1) * packet_size, file_size))`.
//! Only the final packet may be short.

use crate::message::MAX_PACKET_PAYLOAD;

/// File size and packet size as announced by FileInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileLayout {
    pub file_size: u64,
    pub packet_size: u64,
    pub total_packets: u64,
}

impl FileLayout {
    /// Returns `None` when `packet_size` is zero or does not fit a datagram.
    pub fn new(file_size: u64, packet_size: u64) -> Option<Self> {
        if packet_size == 0 || packet_size > MAX_PACKET_PAYLOAD as u64 {
            return None;
        }
        Some(Self {
            file_size,
            packet_size,
            total_packets: file_size.div_ceil(packet_size),
        })
    }

    /// Byte offset of a packet, or `None` past the end of the file.
    #[inline]
    pub fn offset(&self, packet_id: u64) -> Option<u64> {
        if packet_id >= self.total_packets {
            return None;
        }
        Some(packet_id * self.packet_size)
    }

    /// Payload length of a packet, or `None` past the end of the file.
    pub fn payload_len(&self, packet_id: u64) -> Option<u64> {
        let offset = self.offset(packet_id)?;
        Some((self.file_size - offset).min(self.packet_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_counts() {
        let layout = FileLayout::new(75234, 1024).unwrap();
        assert_eq!(layout.total_packets, 74);
        assert_eq!(layout.payload_len(0), Some(1024));
        assert_eq!(layout.payload_len(73), Some(75234 - 73 * 1024));
        assert_eq!(layout.payload_len(74), None);
        assert_eq!(layout.offset(73), Some(73 * 1024));

        let exact = FileLayout::new(4096, 1024).unwrap();
        assert_eq!(exact.total_packets, 4);
        assert_eq!(exact.payload_len(3), Some(1024));

        let empty = FileLayout::new(0, 1024).unwrap();
        assert_eq!(empty.total_packets, 0);
        assert_eq!(empty.payload_len(0), None);
    }

    #[test]
    fn test_rejects_bad_packet_size() {
        assert!(FileLayout::new(10, 0).is_none());
        assert!(FileLayout::new(10, MAX_PACKET_PAYLOAD as u64 + 1).is_none());
        assert!(FileLayout::new(10, MAX_PACKET_PAYLOAD as u64).is_some());
    }
}
