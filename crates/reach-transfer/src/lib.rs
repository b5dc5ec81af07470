//! REACH transfer engine: the client fetch sessions and the server responder.
//!
//! Provides:
//! - `Client`: handshake, windowed packet requests, loss recovery and
//!   multi-worker fetches into a memory-mapped destination
//! - `Dispatcher`: the client receive loop routing datagrams by transfer id
//! - `TransferWindow`: the I/O-free request window state machine
//! - `Responder`: the server loop answering handshakes and packet requests
//! - Socket setup, environment configuration and structured transfer logging

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod file_map;
pub mod logging;
pub mod responder;
pub mod session;
pub mod socket;
pub mod window;

// Re-export key types for convenience.
pub use config::{ClientConfig, ServerConfig};
pub use dispatcher::{Dispatcher, Registration};
pub use error::{ConfigError, Result, TransferError};
pub use file_map::{FileMap, FileSink};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use responder::Responder;
pub use session::{default_output, Client, FetchReport, FetchRequest, TransferProgress};
pub use socket::{bind_udp, send_datagram, UDP_SOCKET_BUFFER};
pub use window::{InFlightChunk, PacketOutcome, Reaped, TransferWindow, WindowConfig, WindowStats};
