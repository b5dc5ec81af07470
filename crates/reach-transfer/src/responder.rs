//! Server side: answer handshakes and stream requested packets.
//!
//! A single loop owns the socket. Sessions are keyed by (peer, transfer id),
//! hold a read-only mapping of the requested file and are evicted after a
//! period without requests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use reach_protocol::{encode_file_packet, FileLayout, IntervalSet, Message, MAX_MESSAGE_SIZE};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::error::{Result, TransferError};
use crate::file_map::FileMap;
use crate::logging::{emit, TransferEvent, TransferLogger};
use crate::socket::{bind_udp, is_connection_reset, send_datagram};

const COMPONENT: &str = "server";

/// Upper bound between eviction sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive receive errors tolerated before the loop gives up.
const MAX_RECV_ERRORS: u32 = 100;

struct ServeSession {
    file: Arc<FileMap>,
    layout: FileLayout,
    last_activity: Instant,
}

pub struct Responder {
    socket: Arc<UdpSocket>,
    config: ServerConfig,
    sessions: HashMap<(SocketAddr, u64), ServeSession>,
    logger: Option<Arc<dyn TransferLogger>>,
    send_buf: BytesMut,
}

impl Responder {
    pub fn new(
        socket: Arc<UdpSocket>,
        config: ServerConfig,
        logger: Option<Arc<dyn TransferLogger>>,
    ) -> Self {
        Self {
            socket,
            config,
            sessions: HashMap::new(),
            logger,
            send_buf: BytesMut::with_capacity(MAX_MESSAGE_SIZE),
        }
    }

    /// Validate `config` and bind its address.
    pub fn bind(config: ServerConfig, logger: Option<Arc<dyn TransferLogger>>) -> Result<Self> {
        config.validate()?;
        let socket = bind_udp(config.bind_addr).map_err(TransferError::Socket)?;
        Ok(Self::new(Arc::new(socket), config, logger))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(TransferError::Socket)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Serve until the socket keeps failing. Cancel the future to stop.
    pub async fn run(mut self) -> Result<()> {
        let socket = self.socket.clone();
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE + 64];
        let mut last_sweep = Instant::now();
        let mut recv_errors = 0u32;

        info!("Responder serving on {}", socket.local_addr().map_err(TransferError::Socket)?);

        loop {
            let received = tokio::time::timeout(SWEEP_INTERVAL, socket.recv_from(&mut buf)).await;

            if last_sweep.elapsed() >= SWEEP_INTERVAL {
                self.evict_idle();
                last_sweep = Instant::now();
            }

            let (len, peer) = match received {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(ref e)) if is_connection_reset(e) => continue,
                Ok(Err(e)) => {
                    recv_errors += 1;
                    error!("UDP recv error: {}", e);
                    if recv_errors >= MAX_RECV_ERRORS {
                        return Err(TransferError::Socket(e));
                    }
                    continue;
                }
            };
            recv_errors = 0;

            if len > MAX_MESSAGE_SIZE {
                warn!("Dropping oversized datagram ({} bytes) from {}", len, peer);
                continue;
            }
            match Message::decode(&buf[..len]) {
                Ok(message) => self.handle(message, peer).await,
                Err(e) => warn!("Dropping malformed datagram from {}: {}", peer, e),
            }
        }
    }

    /// Handle one decoded request. Failures are logged; none of them stop
    /// the loop.
    pub async fn handle(&mut self, message: Message, peer: SocketAddr) {
        let result = match message {
            Message::Ping => self.reply(&Message::alive(), peer).await,
            Message::RequestFile { transfer_id, path } => {
                self.open_file(peer, transfer_id, &path).await
            }
            Message::RequestFilePackets {
                transfer_id,
                packets,
            } => self.serve_packets(peer, transfer_id, &packets).await,
            other => {
                debug!("Ignoring {} from {}", other.kind(), peer);
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("Failed to answer {}: {}", peer, e);
        }
    }

    async fn open_file(&mut self, peer: SocketAddr, transfer_id: u64, path: &str) -> Result<()> {
        let key = (peer, transfer_id);

        // A retried handshake gets the same answer.
        if let Some(session) = self.sessions.get_mut(&key) {
            session.last_activity = Instant::now();
            let layout = session.layout;
            let info = Message::file_info(transfer_id, layout.file_size, layout.packet_size);
            return self.reply(&info, peer).await;
        }

        let resolved = match resolve_path(self.config.serve_root.as_deref(), path) {
            Some(resolved) => resolved,
            None => {
                warn!("Refusing path {:?} from {}", path, peer);
                self.log(transfer_id, TransferEvent::Error {
                    message: format!("refused path {:?}", path),
                });
                return Ok(());
            }
        };

        let file = match FileMap::open(&resolved) {
            Ok(file) => file,
            Err(e) => {
                warn!("Cannot serve {:?} to {}: {}", path, peer, e);
                self.log(transfer_id, TransferEvent::Error {
                    message: e.to_string(),
                });
                return Ok(());
            }
        };
        let layout = FileLayout::new(file.size(), self.config.packet_size).ok_or_else(|| {
            TransferError::Protocol(format!("packet size {} is unusable", self.config.packet_size))
        })?;

        self.log(transfer_id, TransferEvent::FileOpened {
            path: resolved.display().to_string(),
            file_size: layout.file_size,
            peer: peer.to_string(),
        });
        self.sessions.insert(key, ServeSession {
            file: Arc::new(file),
            layout,
            last_activity: Instant::now(),
        });

        let info = Message::file_info(transfer_id, layout.file_size, layout.packet_size);
        self.reply(&info, peer).await
    }

    async fn serve_packets(
        &mut self,
        peer: SocketAddr,
        transfer_id: u64,
        packets: &IntervalSet,
    ) -> Result<()> {
        let Some(session) = self.sessions.get_mut(&(peer, transfer_id)) else {
            debug!("Packets requested on unknown transfer {} by {}", transfer_id, peer);
            return Ok(());
        };
        session.last_activity = Instant::now();
        let file = session.file.clone();
        let layout = session.layout;

        let mut sent = 0u64;
        for packet_id in packets {
            // Ids are ascending, so nothing after this one exists either.
            let Some(payload) = file.packet(&layout, packet_id) else {
                debug!(
                    "Packet {} past end of transfer {} ({} packets)",
                    packet_id, transfer_id, layout.total_packets
                );
                break;
            };

            self.send_buf.clear();
            encode_file_packet(&mut self.send_buf, transfer_id, packet_id, payload)?;
            send_datagram(&self.socket, &self.send_buf, peer)
                .await
                .map_err(TransferError::Socket)?;
            sent += 1;

            if let Some(pacing) = self.config.send_pacing {
                tokio::time::sleep(pacing).await;
            }
        }

        self.log(transfer_id, TransferEvent::PacketsServed {
            count: sent,
            intervals: packets.interval_count(),
        });
        Ok(())
    }

    async fn reply(&self, message: &Message, peer: SocketAddr) -> Result<()> {
        let bytes = message.to_bytes()?;
        send_datagram(&self.socket, &bytes, peer)
            .await
            .map_err(TransferError::Socket)
    }

    /// Drop sessions without a request for longer than the session timeout.
    pub fn evict_idle(&mut self) {
        let timeout = self.config.session_timeout;
        let mut evicted = Vec::new();
        self.sessions.retain(|&(_, transfer_id), session| {
            let idle = session.last_activity.elapsed();
            if idle > timeout {
                evicted.push((transfer_id, idle));
                return false;
            }
            true
        });
        for (transfer_id, idle) in evicted {
            self.log(transfer_id, TransferEvent::SessionEvicted {
                idle_secs: idle.as_secs(),
            });
        }
    }

    fn log(&self, transfer_id: u64, event: TransferEvent) {
        emit(&self.logger, COMPONENT, transfer_id, event);
    }
}

/// Map a requested path onto the filesystem. With a serve root, the path is
/// taken relative to it and may not climb out of it.
fn resolve_path(serve_root: Option<&Path>, requested: &str) -> Option<PathBuf> {
    if requested.is_empty() {
        return None;
    }
    let Some(root) = serve_root else {
        return Some(PathBuf::from(requested));
    };

    let relative = Path::new(requested.trim_start_matches('/'));
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || relative.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(relative))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_without_root() {
        assert_eq!(
            resolve_path(None, "/etc/hostname"),
            Some(PathBuf::from("/etc/hostname"))
        );
        assert_eq!(resolve_path(None, ""), None);
    }

    #[test]
    fn test_resolve_under_root() {
        let root = Path::new("/srv/files");
        assert_eq!(
            resolve_path(Some(root), "/a/b.bin"),
            Some(PathBuf::from("/srv/files/a/b.bin"))
        );
        assert_eq!(
            resolve_path(Some(root), "./c"),
            Some(PathBuf::from("/srv/files/c"))
        );
        assert_eq!(resolve_path(Some(root), "../etc/passwd"), None);
        assert_eq!(resolve_path(Some(root), "a/../../x"), None);
        assert_eq!(resolve_path(Some(root), "/"), None);
    }

    async fn responder_with_file(
        contents: &[u8],
        session_timeout: Duration,
    ) -> (Responder, UdpSocket, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("data.bin"), contents).unwrap();
        let config = ServerConfig {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            packet_size: 4,
            serve_root: Some(dir.path().to_path_buf()),
            session_timeout,
            ..ServerConfig::default()
        };
        let responder = Responder::bind(config, None).unwrap();
        let peer = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        (responder, peer, dir)
    }

    async fn recv(socket: &UdpSocket) -> Message {
        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        Message::decode(&buf[..len]).unwrap()
    }

    #[tokio::test]
    async fn test_handshake_and_packets() {
        let (mut responder, peer, _dir) =
            responder_with_file(b"0123456789", Duration::from_secs(60)).await;
        let from = peer.local_addr().unwrap();

        responder.handle(Message::request_file(9, "data.bin"), from).await;
        assert_eq!(recv(&peer).await, Message::file_info(9, 10, 4));

        // Retried handshake is answered from the existing session.
        responder.handle(Message::request_file(9, "data.bin"), from).await;
        assert_eq!(recv(&peer).await, Message::file_info(9, 10, 4));
        assert_eq!(responder.session_count(), 1);

        let mut wanted = IntervalSet::from_range(1, 3);
        wanted.add(7);
        responder
            .handle(Message::request_file_packets(9, wanted), from)
            .await;
        assert_eq!(recv(&peer).await, Message::file_packet(9, 1, &b"4567"[..]));
        assert_eq!(recv(&peer).await, Message::file_packet(9, 2, &b"89"[..]));

        responder.handle(Message::ping(), from).await;
        assert_eq!(recv(&peer).await, Message::alive());
    }

    #[tokio::test]
    async fn test_unknown_file_and_session_get_no_reply() {
        let (mut responder, peer, _dir) =
            responder_with_file(b"abc", Duration::from_secs(60)).await;
        let from = peer.local_addr().unwrap();

        responder.handle(Message::request_file(1, "missing.bin"), from).await;
        responder.handle(Message::request_file(2, "../data.bin"), from).await;
        responder
            .handle(Message::request_file_packets(3, IntervalSet::single(0)), from)
            .await;
        assert_eq!(responder.session_count(), 0);

        responder.handle(Message::ping(), from).await;
        assert_eq!(recv(&peer).await, Message::alive());
    }

    #[tokio::test]
    async fn test_idle_sessions_evicted() {
        let (mut responder, peer, _dir) =
            responder_with_file(b"abc", Duration::from_millis(10)).await;
        let from = peer.local_addr().unwrap();

        responder.handle(Message::request_file(4, "data.bin"), from).await;
        assert_eq!(responder.session_count(), 1);

        tokio::time::sleep(Duration::from_millis(30)).await;
        responder.evict_idle();
        assert_eq!(responder.session_count(), 0);
    }
}
