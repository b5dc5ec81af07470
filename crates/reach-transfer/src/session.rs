//! Client fetch engine.
//!
//! ```text
//! RequestingFileInfo ──FileInfo──> Transferring ──all packets──> Complete
//!        │ retries exhausted             │ stalled / socket error
//!        └────────────> Failed <─────────┘
//! ```
//!
//! A fetch runs one or more window-workers. Each worker has its own transfer
//! id and handshake; all of them pop from one shared `outstanding` set and
//! write into one sink. Workers run on the calling task and only suspend at
//! send, receive and timer points.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures_util::future::try_join_all;
use reach_protocol::{FileLayout, IntervalSet, Message};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::dispatcher::{Dispatcher, Registration};
use crate::error::{Result, TransferError};
use crate::file_map::FileSink;
use crate::logging::{emit, TransferEvent, TransferLogger};
use crate::socket::bind_udp;
use crate::window::{PacketOutcome, TransferWindow, WindowStats};

const COMPONENT: &str = "client";

/// Progress counters readable from other tasks while a fetch runs.
#[derive(Debug, Default)]
pub struct TransferProgress {
    pub packets_done: AtomicU64,
    pub packets_total: AtomicU64,
    pub bytes_done: AtomicU64,
    pub bytes_total: AtomicU64,
    pub unexpected: AtomicU64,
    pub lost_chunks: AtomicU64,
}

impl TransferProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Completed fraction in `[0, 1]`; an empty file counts as done.
    pub fn fraction(&self) -> f64 {
        let total = self.packets_total.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        self.packets_done.load(Ordering::Relaxed) as f64 / total as f64
    }
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub path: String,
    pub output: PathBuf,
    pub workers: usize,
    pub progress: Option<Arc<TransferProgress>>,
}

impl FetchRequest {
    pub fn new(path: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            output: output.into(),
            workers: 1,
            progress: None,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn progress(mut self, progress: Arc<TransferProgress>) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Outcome of a completed fetch.
#[derive(Debug, Clone)]
pub struct FetchReport {
    pub transfer_ids: Vec<u64>,
    pub file_size: u64,
    pub packet_size: u64,
    pub total_packets: u64,
    pub duration: Duration,
    pub requests: u64,
    pub unexpected: u64,
    pub lost_chunks: u64,
    pub lost_packets: u64,
}

impl FetchReport {
    /// Payload throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        let secs = self.duration.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.file_size as f64 / secs
    }
}

/// A client bound to one server. Owns the socket, its receive loop and the
/// transfer-id counter.
pub struct Client {
    config: ClientConfig,
    dispatcher: Dispatcher,
    receive_task: JoinHandle<Result<()>>,
    next_transfer_id: AtomicU64,
    logger: Option<Arc<dyn TransferLogger>>,
}

impl Client {
    /// Bind an ephemeral socket and start the receive loop.
    ///
    /// Must be called from inside a tokio runtime.
    pub fn connect(
        config: ClientConfig,
        logger: Option<Arc<dyn TransferLogger>>,
    ) -> Result<Self> {
        config.validate()?;

        let local = if config.server_addr.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = Arc::new(bind_udp(local).map_err(TransferError::Socket)?);
        let dispatcher = Dispatcher::new(socket, config.server_addr);
        let receive_task = tokio::spawn(dispatcher.clone().run());

        // Random start so a restarted client does not collect stale replies
        // meant for its previous run.
        let first_id = u64::from(rand::random::<u32>()) + 1;

        Ok(Self {
            config,
            dispatcher,
            receive_task,
            next_transfer_id: AtomicU64::new(first_id),
            logger,
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn next_transfer_id(&self) -> u64 {
        self.next_transfer_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Round-trip time of a Ping/Alive exchange.
    pub async fn ping(&self) -> Result<Duration> {
        let attempts = self.config.send_retry;
        for attempt in 1..=attempts {
            let waiter = self.dispatcher.wait_alive()?;
            let started = Instant::now();
            self.dispatcher.send(&Message::ping()).await?;

            match tokio::time::timeout(self.config.receive_timeout, waiter).await {
                Ok(Ok(version)) => {
                    let rtt = started.elapsed();
                    debug!("Alive from {} (version {}) in {:?}", self.dispatcher.peer(), version, rtt);
                    return Ok(rtt);
                }
                Ok(Err(_)) => return Err(TransferError::DispatcherClosed),
                Err(_) => debug!("Ping attempt {}/{} timed out", attempt, attempts),
            }
        }
        Err(TransferError::NoResponse { attempts })
    }

    /// Fetch a remote file into `request.output`.
    pub async fn fetch(&self, request: FetchRequest) -> Result<FetchReport> {
        let started = Instant::now();
        let workers = request.workers.max(1);
        let progress = request.progress.clone().unwrap_or_default();

        let mut first = self.dispatcher.register(self.next_transfer_id())?;
        let layout = self.request_file_info(&mut first, &request.path).await?;

        progress.packets_total.store(layout.total_packets, Ordering::Relaxed);
        progress.bytes_total.store(layout.file_size, Ordering::Relaxed);

        let shared = SharedFetch {
            layout,
            outstanding: Mutex::new(IntervalSet::from_range(0, layout.total_packets)),
            sink: Mutex::new(FileSink::create(&request.output, layout.file_size)?),
            progress,
        };

        let mut registrations = vec![first];
        // Extra workers only help when there is more than one window to fill.
        let useful = layout.total_packets.div_ceil(self.config.window.request_window).max(1);
        for _ in 1..workers.min(useful as usize) {
            registrations.push(self.dispatcher.register(self.next_transfer_id())?);
        }
        let transfer_ids: Vec<u64> = registrations.iter().map(Registration::transfer_id).collect();

        let sessions = registrations
            .into_iter()
            .enumerate()
            .map(|(index, registration)| {
                let path = request.path.as_str();
                let shared = &shared;
                async move {
                    let mut registration = registration;
                    // The first worker already did the handshake.
                    if index > 0 {
                        let theirs = self.request_file_info(&mut registration, path).await?;
                        if theirs != shared.layout {
                            return Err(TransferError::Protocol(format!(
                                "worker {} saw {:?}, expected {:?}",
                                index, theirs, shared.layout
                            )));
                        }
                    }
                    TransferSession::new(self, registration, shared).run().await
                }
            });
        let stats = try_join_all(sessions).await?;

        shared.sink().flush()?;

        let mut report = FetchReport {
            transfer_ids,
            file_size: layout.file_size,
            packet_size: layout.packet_size,
            total_packets: layout.total_packets,
            duration: started.elapsed(),
            requests: 0,
            unexpected: 0,
            lost_chunks: 0,
            lost_packets: 0,
        };
        for s in &stats {
            report.requests += s.requests;
            report.unexpected += s.unexpected;
            report.lost_chunks += s.lost_chunks;
            report.lost_packets += s.lost_packets;
        }

        emit(
            &self.logger,
            COMPONENT,
            report.transfer_ids[0],
            TransferEvent::TransferComplete {
                total_bytes: report.file_size,
                duration_ms: report.duration.as_millis() as u64,
                lost_chunks: report.lost_chunks,
                unexpected: report.unexpected,
            },
        );
        info!(
            "Fetched {} ({} bytes) in {:.2}s: {:.1} MB/s, {} requests, {} lost chunks, {} unexpected",
            request.path,
            report.file_size,
            report.duration.as_secs_f64(),
            report.throughput_bps() / 1_000_000.0,
            report.requests,
            report.lost_chunks,
            report.unexpected,
        );
        Ok(report)
    }

    /// RequestFile handshake with bounded retries.
    async fn request_file_info(
        &self,
        registration: &mut Registration,
        path: &str,
    ) -> Result<FileLayout> {
        let transfer_id = registration.transfer_id();
        let request = Message::request_file(transfer_id, path);
        let attempts = self.config.send_retry;

        for attempt in 1..=attempts {
            emit(
                &self.logger,
                COMPONENT,
                transfer_id,
                TransferEvent::FileRequested {
                    path: path.to_string(),
                    attempt,
                },
            );
            self.dispatcher.send(&request).await?;

            let deadline = tokio::time::Instant::now() + self.config.receive_timeout;
            loop {
                match tokio::time::timeout_at(deadline, registration.recv()).await {
                    Err(_) => break,
                    Ok(None) => return Err(TransferError::DispatcherClosed),
                    Ok(Some(Message::FileInfo {
                        file_size,
                        packet_size,
                        ..
                    })) => {
                        let layout = FileLayout::new(file_size, packet_size).ok_or_else(|| {
                            TransferError::Protocol(format!(
                                "server announced unusable packet size {}",
                                packet_size
                            ))
                        })?;
                        emit(
                            &self.logger,
                            COMPONENT,
                            transfer_id,
                            TransferEvent::FileInfoReceived {
                                file_size,
                                packet_size,
                                total_packets: layout.total_packets,
                            },
                        );
                        return Ok(layout);
                    }
                    Ok(Some(other)) => {
                        debug!("Ignoring {} on transfer {} during handshake", other.kind(), transfer_id)
                    }
                }
            }
            warn!(
                "No FileInfo for {} on transfer {} (attempt {}/{})",
                path, transfer_id, attempt, attempts
            );
        }

        emit(
            &self.logger,
            COMPONENT,
            transfer_id,
            TransferEvent::Error {
                message: format!("no FileInfo after {} attempts", attempts),
            },
        );
        Err(TransferError::NoResponse { attempts })
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

/// State shared by the workers of one fetch.
struct SharedFetch {
    layout: FileLayout,
    outstanding: Mutex<IntervalSet>,
    sink: Mutex<FileSink>,
    progress: Arc<TransferProgress>,
}

impl SharedFetch {
    fn outstanding(&self) -> MutexGuard<'_, IntervalSet> {
        self.outstanding.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sink(&self) -> MutexGuard<'_, FileSink> {
        self.sink.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How a wait round ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitOutcome {
    /// The round interval elapsed without a chunk completing.
    Expired,
    /// A chunk completed, so a new request can go out.
    Cancelled,
}

/// One window-worker in the Transferring state.
struct TransferSession<'a> {
    client: &'a Client,
    registration: Registration,
    shared: &'a SharedFetch,
    window: TransferWindow,
}

impl<'a> TransferSession<'a> {
    fn new(client: &'a Client, registration: Registration, shared: &'a SharedFetch) -> Self {
        Self {
            client,
            registration,
            shared,
            window: TransferWindow::new(client.config.window.clone()),
        }
    }

    fn transfer_id(&self) -> u64 {
        self.registration.transfer_id()
    }

    async fn run(mut self) -> Result<WindowStats> {
        loop {
            // Pop work while holding the lock, send after releasing it.
            let (requests, finished, wait) = {
                let mut outstanding = self.shared.outstanding();
                let reaped = self.window.reap(&mut outstanding);
                for (packets, idle_rounds) in reaped.lost {
                    self.shared.progress.lost_chunks.fetch_add(1, Ordering::Relaxed);
                    self.log(TransferEvent::ChunkLost { packets, idle_rounds });
                }

                let mut requests = Vec::new();
                while let Some(packets) = self.window.next_request(&mut outstanding) {
                    requests.push(packets);
                }
                let finished = outstanding.is_empty() && self.window.is_drained();
                (requests, finished, self.window.should_wait(&outstanding))
            };

            if finished {
                return Ok(self.window.stats());
            }
            if self.window.is_stalled() {
                let timeouts = self.window.stalled_timeouts();
                self.log(TransferEvent::Error {
                    message: format!("stalled after {} chunk timeouts", timeouts),
                });
                return Err(TransferError::Stalled { timeouts });
            }

            for packets in requests {
                self.log(TransferEvent::PacketsRequested {
                    first: packets.first().unwrap_or_default(),
                    count: packets.element_count(),
                    intervals: packets.interval_count(),
                });
                let message = Message::request_file_packets(self.transfer_id(), packets);
                self.client.dispatcher.send(&message).await?;
            }

            if wait {
                if self.wait_round().await? == WaitOutcome::Expired {
                    self.window.age();
                }
            } else {
                // Only reached with the window pinned at the ceiling, so
                // nothing more can go out until a packet arrives.
                let mut drained = false;
                while let Some(message) = self.registration.try_recv() {
                    self.handle(message)?;
                    drained = true;
                }
                if !drained && self.wait_round().await? == WaitOutcome::Expired {
                    self.window.age();
                }
            }
        }
    }

    /// Wait up to one round interval, handling packets as they arrive.
    async fn wait_round(&mut self) -> Result<WaitOutcome> {
        let deadline = tokio::time::Instant::now() + self.window.config().round_interval;
        loop {
            match tokio::time::timeout_at(deadline, self.registration.recv()).await {
                Err(_) => return Ok(WaitOutcome::Expired),
                Ok(None) => return Err(TransferError::DispatcherClosed),
                Ok(Some(message)) => {
                    if self.handle(message)? == Some(PacketOutcome::ChunkComplete) {
                        return Ok(WaitOutcome::Cancelled);
                    }
                }
            }
        }
    }

    fn handle(&mut self, message: Message) -> Result<Option<PacketOutcome>> {
        let (packet_id, payload) = match message {
            Message::FilePacket {
                packet_id, payload, ..
            } => (packet_id, payload),
            Message::FileInfo { .. } => {
                // Answer to a handshake retry that crossed the first reply.
                return Ok(None);
            }
            other => {
                debug!("Ignoring {} on transfer {}", other.kind(), self.transfer_id());
                return Ok(None);
            }
        };

        let layout = self.shared.layout;
        let valid = layout
            .payload_len(packet_id)
            .filter(|&len| len == payload.len() as u64);
        let Some(offset) = valid.and_then(|_| layout.offset(packet_id)) else {
            self.window.note_unexpected();
            self.shared.progress.unexpected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rejecting packet {} ({} bytes) on transfer {}",
                packet_id,
                payload.len(),
                self.transfer_id()
            );
            return Ok(Some(PacketOutcome::Unexpected));
        };

        self.shared.sink().write_at(offset, &payload)?;

        let outcome = self.window.on_packet(packet_id);
        let progress = &self.shared.progress;
        let fresh = match outcome {
            PacketOutcome::Progress | PacketOutcome::ChunkComplete => true,
            PacketOutcome::Unexpected => {
                progress.unexpected.fetch_add(1, Ordering::Relaxed);
                self.log(TransferEvent::UnexpectedPacket { packet_id });
                // A late packet from a chunk that already timed out is still
                // good data; stop it from being requested again.
                let requeued = {
                    let mut outstanding = self.shared.outstanding();
                    let requeued = outstanding.contains(packet_id);
                    outstanding.subtract(packet_id);
                    requeued
                };
                if requeued {
                    self.window.note_recovered();
                }
                requeued
            }
        };
        if fresh {
            progress.packets_done.fetch_add(1, Ordering::Relaxed);
            progress.bytes_done.fetch_add(payload.len() as u64, Ordering::Relaxed);
        }
        Ok(Some(outcome))
    }

    fn log(&self, event: TransferEvent) {
        emit(&self.client.logger, COMPONENT, self.transfer_id(), event);
    }
}

/// Default output location for a remote path: its file name in the current
/// directory.
pub fn default_output(remote: &str) -> PathBuf {
    Path::new(remote)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("download.bin"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output() {
        assert_eq!(default_output("/srv/data/big.iso"), PathBuf::from("big.iso"));
        assert_eq!(default_output("notes.txt"), PathBuf::from("notes.txt"));
        assert_eq!(default_output("/"), PathBuf::from("download.bin"));
    }

    #[test]
    fn test_report_throughput() {
        let report = FetchReport {
            transfer_ids: vec![1],
            file_size: 10_000_000,
            packet_size: 8192,
            total_packets: 1221,
            duration: Duration::from_secs(2),
            requests: 20,
            unexpected: 0,
            lost_chunks: 0,
            lost_packets: 0,
        };
        assert_eq!(report.throughput_bps(), 5_000_000.0);
    }

    #[test]
    fn test_progress_fraction() {
        let progress = TransferProgress::new();
        assert_eq!(progress.fraction(), 1.0);
        progress.packets_total.store(4, Ordering::Relaxed);
        progress.packets_done.store(1, Ordering::Relaxed);
        assert_eq!(progress.fraction(), 0.25);
    }

    #[tokio::test]
    async fn test_handshake_without_server_gives_up() {
        // A bound socket that never answers.
        let silent = bind_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = silent.local_addr().unwrap();
        let config = ClientConfig {
            server_addr: addr,
            receive_timeout: Duration::from_millis(20),
            send_retry: 3,
            ..ClientConfig::default()
        };
        let client = Client::connect(config, None).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let err = client
            .fetch(FetchRequest::new("/nope", dir.path().join("out")))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::NoResponse { attempts: 3 }));
        drop(silent);
    }
}
