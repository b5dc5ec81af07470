//! Structured per-transfer logging.
//!
//! The client sessions and the responder emit `TransferLog` entries through a
//! `TransferLogger`, so embedders can route them somewhere other than tracing.

use std::fmt;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: u64,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Client: RequestFile sent
    FileRequested {
        path: String,
        attempt: u32,
    },
    /// Client: handshake answered
    FileInfoReceived {
        file_size: u64,
        packet_size: u64,
        total_packets: u64,
    },
    /// Server: file mapped for a new session
    FileOpened {
        path: String,
        file_size: u64,
        peer: String,
    },
    /// Client: RequestFilePackets sent
    PacketsRequested {
        first: u64,
        count: u64,
        intervals: usize,
    },
    /// Server: packets sent for one request
    PacketsServed {
        count: u64,
        intervals: usize,
    },
    /// Client: in-flight chunk timed out and was re-queued
    ChunkLost {
        packets: u64,
        idle_rounds: u32,
    },
    /// Client: packet outside every live chunk
    UnexpectedPacket {
        packet_id: u64,
    },
    /// Server: idle session dropped
    SessionEvicted {
        idle_secs: u64,
    },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
        lost_chunks: u64,
        unexpected: u64,
    },
    /// Error occurred
    Error {
        message: String,
    },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileRequested { path, attempt } => {
                write!(f, "file_requested path={} attempt={}", path, attempt)
            }
            Self::FileInfoReceived { file_size, packet_size, total_packets } => {
                write!(f, "file_info size={} packet_size={} packets={}", file_size, packet_size, total_packets)
            }
            Self::FileOpened { path, file_size, peer } => {
                write!(f, "file_opened path={} size={} peer={}", path, file_size, peer)
            }
            Self::PacketsRequested { first, count, intervals } => {
                write!(f, "packets_requested first={} count={} intervals={}", first, count, intervals)
            }
            Self::PacketsServed { count, intervals } => {
                write!(f, "packets_served count={} intervals={}", count, intervals)
            }
            Self::ChunkLost { packets, idle_rounds } => {
                write!(f, "chunk_lost packets={} idle={}", packets, idle_rounds)
            }
            Self::UnexpectedPacket { packet_id } => {
                write!(f, "unexpected_packet id={}", packet_id)
            }
            Self::SessionEvicted { idle_secs } => {
                write!(f, "session_evicted idle_secs={}", idle_secs)
            }
            Self::TransferComplete { total_bytes, duration_ms, lost_chunks, unexpected } => {
                write!(
                    f,
                    "transfer_complete bytes={} duration_ms={} lost_chunks={} unexpected={}",
                    total_bytes, duration_ms, lost_chunks, unexpected
                )
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can write to tracing,
/// collect entries for tests, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Use info for key lifecycle events, debug for per-request spam
        match &entry.event {
            TransferEvent::FileRequested { .. }
            | TransferEvent::FileInfoReceived { .. }
            | TransferEvent::FileOpened { .. }
            | TransferEvent::SessionEvicted { .. }
            | TransferEvent::TransferComplete { .. }
            | TransferEvent::Error { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

/// Log through an optional logger.
pub(crate) fn emit(
    logger: &Option<std::sync::Arc<dyn TransferLogger>>,
    component: &'static str,
    transfer_id: u64,
    event: TransferEvent,
) {
    if let Some(logger) = logger {
        logger.log(TransferLog {
            component,
            transfer_id,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_display() {
        let event = TransferEvent::PacketsRequested {
            first: 64,
            count: 64,
            intervals: 1,
        };
        assert_eq!(event.to_string(), "packets_requested first=64 count=64 intervals=1");

        let event = TransferEvent::Error {
            message: "boom".into(),
        };
        assert_eq!(event.to_string(), "error: boom");
    }
}
