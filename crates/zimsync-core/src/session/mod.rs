//! Per-peer protocol state machine and the UDP server loop.
//!
//! Each peer conversation is handled by an independent task owning one
//! [`SyncEngine`]; all state mutation for a conversation is serialized inside
//! that task, so no locking is needed beyond the shared catalog, which is
//! read by every peer task and swapped atomically on refresh.
//!
//! ## Server-side states
//!
//! - **Idle**: await any packet. `Discover` refreshes the catalog and
//!   replies `Announce` + `FileList`; everything else is silently dropped.
//! - **Catalog-sent**: `FileRequest` starts a sender session and produces the
//!   first chunk; a repeated `Discover` re-announces.
//! - **Transferring**: `FileRequest` produces further chunks, `Ack` records
//!   receiver progress, inbound `FileData` routes to a receiver session and
//!   is acknowledged.
//!
//! Undecodable datagrams that are valid UTF-8 get a human-readable echo
//! reply for manual diagnostics; well-formed but semantically invalid
//! packets never do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::catalog::SharedCatalog;
use crate::device::DeviceInfo;
use crate::error::Error;
use crate::file::available_space;
use crate::protocol::{
    self, AckPayload, AnnouncePayload, ErrorCode, FileListPayload, FileRequestPayload, Packet,
    PacketFlags, PacketHeader,
};
use crate::transfer::{TransferEngine, MAX_CHUNK_SIZE};
use crate::transport::Listener;

/// Feature tags advertised in `Announce`.
pub const SUPPORTED_FEATURES: &[&str] = &["compression", "chunking", "resume"];

/// How long a peer task lingers without traffic before shutting down.
const PEER_IDLE_TIMEOUT: Duration = Duration::from_secs(120);

/// Queued datagrams per peer task.
const PEER_QUEUE_DEPTH: usize = 64;

/// Protocol state of one peer conversation, from the server's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerState {
    /// Nothing heard yet
    #[default]
    Idle,
    /// Announce + FileList sent
    CatalogSent,
    /// At least one transfer session active
    Transferring,
}

/// The protocol state machine for one peer conversation.
pub struct SyncEngine {
    device: Arc<DeviceInfo>,
    catalog: Arc<RwLock<SharedCatalog>>,
    inbound_dir: PathBuf,
    transfers: TransferEngine,
    state: PeerState,
    sequence: u16,
    last_sent_file: Option<Uuid>,
}

impl SyncEngine {
    /// Create an engine in the Idle state.
    #[must_use]
    pub fn new(
        device: Arc<DeviceInfo>,
        catalog: Arc<RwLock<SharedCatalog>>,
        inbound_dir: PathBuf,
    ) -> Self {
        Self {
            device,
            catalog,
            inbound_dir,
            transfers: TransferEngine::new(),
            state: PeerState::Idle,
            sequence: 0,
            last_sent_file: None,
        }
    }

    /// Current conversation state.
    #[must_use]
    pub fn state(&self) -> PeerState {
        self.state
    }

    /// Next outbound sequence number (wrapping).
    fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    fn encode_reply(&mut self, packet: &Packet, flags: PacketFlags) -> Option<Vec<u8>> {
        let sequence = self.next_sequence();
        match protocol::encode_with_flags(packet, sequence, flags) {
            Ok(datagram) => Some(datagram),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode reply");
                None
            }
        }
    }

    fn error_reply(&mut self, code: ErrorCode, message: &str) -> Vec<Vec<u8>> {
        self.encode_reply(&Packet::error(code, message), PacketFlags::empty())
            .into_iter()
            .collect()
    }

    /// Handle one inbound datagram and produce the reply datagrams.
    ///
    /// Decoding failures never produce an error: malformed datagrams are
    /// dropped (or echoed when they are plain text), version mismatches get
    /// a wire `Error(415)`.
    pub async fn handle_datagram(&mut self, datagram: &[u8]) -> Vec<Vec<u8>> {
        match protocol::decode(datagram) {
            Ok((header, packet)) => self.handle_packet(&header, packet).await,
            Err(Error::UnsupportedVersion(version)) => {
                tracing::warn!(version, "Peer speaks a newer protocol");
                self.error_reply(ErrorCode::UnsupportedFormat, "unsupported version")
            }
            Err(Error::InvalidPacket(reason)) => {
                if let Ok(text) = std::str::from_utf8(datagram) {
                    tracing::debug!("Echoing undecodable text datagram");
                    let text = text.trim_end_matches(['\r', '\n']);
                    vec![format!("ZimSync Echo: {text}\n").into_bytes()]
                } else {
                    tracing::debug!(reason, "Dropped undecodable datagram");
                    Vec::new()
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dropped datagram");
                Vec::new()
            }
        }
    }

    async fn handle_packet(&mut self, header: &PacketHeader, packet: Packet) -> Vec<Vec<u8>> {
        match packet {
            Packet::Discover(probe) => {
                tracing::info!(peer_device = %probe.device_id, "Discover received");
                self.handle_discover().await
            }
            Packet::FileRequest(request) => {
                if self.state == PeerState::Idle {
                    tracing::debug!("Dropping FileRequest before Discover");
                    return Vec::new();
                }
                self.handle_file_request(request).await
            }
            Packet::Ack(ack) => {
                self.handle_ack(&ack);
                Vec::new()
            }
            Packet::FileData(chunk) => {
                if self.state == PeerState::Idle {
                    tracing::debug!("Dropping FileData before Discover");
                    return Vec::new();
                }
                self.handle_file_data(header, &chunk).await
            }
            Packet::Error(report) => {
                tracing::warn!(
                    code = report.code.code(),
                    message = %report.message,
                    "Peer reported an error"
                );
                Vec::new()
            }
            Packet::Announce(_) | Packet::FileList(_) => {
                tracing::debug!("Ignoring client-bound packet");
                Vec::new()
            }
        }
    }

    async fn handle_discover(&mut self) -> Vec<Vec<u8>> {
        let catalog = Arc::clone(&self.catalog);
        let snapshot = {
            let mut catalog = catalog.write().await;
            match catalog.refresh().await {
                Ok(()) => Ok((
                    catalog.files().to_vec(),
                    catalog.total_size(),
                    available_space(catalog.dir()),
                )),
                Err(e) => Err(e),
            }
        };
        let (files, total_size, space) = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "Catalog refresh failed");
                return self.error_reply(ErrorCode::FileNotFound, "shared directory unavailable");
            }
        };

        let announce = Packet::Announce(AnnouncePayload {
            device_info: (*self.device).clone(),
            available_space: space,
            supported_features: SUPPORTED_FEATURES.iter().map(ToString::to_string).collect(),
        });
        let file_list = Packet::FileList(FileListPayload {
            total_size,
            files,
        });

        if self.state == PeerState::Idle {
            self.state = PeerState::CatalogSent;
        }

        [announce, file_list]
            .iter()
            .filter_map(|p| self.encode_reply(p, PacketFlags::empty()))
            .collect()
    }

    async fn handle_file_request(&mut self, request: FileRequestPayload) -> Vec<Vec<u8>> {
        if request.start_offset < 0 {
            return self.error_reply(ErrorCode::UnsupportedFormat, "negative start offset");
        }
        let Ok(chunk_size) = u32::try_from(request.chunk_size) else {
            return self.error_reply(ErrorCode::UnsupportedFormat, "invalid chunk size");
        };
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            return self.error_reply(ErrorCode::UnsupportedFormat, "invalid chunk size");
        }

        if !self.transfers.is_sending(request.file_id) {
            let catalog = Arc::clone(&self.catalog);
            let entry = {
                let catalog = catalog.read().await;
                catalog
                    .lookup(request.file_id)
                    .map(|(meta, path)| (meta.clone(), path.to_path_buf()))
            };
            let Some((meta, path)) = entry else {
                return self.error_reply(ErrorCode::FileNotFound, "File not found");
            };

            let compression = request.compression_type.unwrap_or_default();
            if let Err(e) = self
                .transfers
                .start_sending(meta, &path, chunk_size, compression)
                .await
            {
                tracing::error!(error = %e, "Cannot start send session");
                return self.error_reply(ErrorCode::FileNotFound, "File not found");
            }
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let chunk_index = (request.start_offset as u64 / u64::from(chunk_size)) as u32;

        match self.transfers.next_chunk(request.file_id, chunk_index).await {
            Ok(Some(chunk)) => {
                let last = chunk.chunk_index + 1 == chunk.total_chunks;
                let mut flags = PacketFlags::REQUIRES_ACK;
                if last {
                    flags = flags.union(PacketFlags::LAST_CHUNK);
                }

                self.state = PeerState::Transferring;
                self.last_sent_file = Some(request.file_id);

                self.encode_reply(&Packet::FileData(chunk), flags)
                    .into_iter()
                    .collect()
            }
            Ok(None) => {
                tracing::debug!(file_id = %request.file_id, "Request past end of file");
                self.transfers.finish_sending(request.file_id);
                Vec::new()
            }
            Err(e) => {
                tracing::warn!(error = %e, "Chunk read failed");
                let code = e.wire_code().unwrap_or(ErrorCode::FileNotFound);
                self.error_reply(code, "File not found")
            }
        }
    }

    fn handle_ack(&mut self, ack: &AckPayload) {
        tracing::trace!(sequence = ack.sequence_number, "Ack received");
        if let (Some(bitmap), Some(file_id)) = (&ack.received_bitmap, self.last_sent_file) {
            self.transfers.record_acked(file_id, bitmap);
        }
    }

    async fn handle_file_data(
        &mut self,
        header: &PacketHeader,
        chunk: &crate::protocol::FileDataPayload,
    ) -> Vec<Vec<u8>> {
        match self.transfers.receive_chunk(chunk).await {
            Ok(()) => {}
            Err(e) => {
                let code = e.wire_code().unwrap_or(ErrorCode::FileNotFound);
                return self.error_reply(code, &e.to_string());
            }
        }

        let bitmap = self.transfers.received_bitmap(chunk.file_id).ok();
        let ack = Packet::Ack(AckPayload {
            sequence_number: header.sequence,
            received_bitmap: bitmap,
        });
        let mut replies: Vec<Vec<u8>> = self
            .encode_reply(&ack, PacketFlags::empty())
            .into_iter()
            .collect();

        if self.transfers.is_receive_complete(chunk.file_id) {
            match self.transfers.complete_transfer(chunk.file_id).await {
                Ok(dest) => {
                    tracing::info!(dest = %dest.display(), "Inbound file verified");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Inbound file failed verification");
                    replies.extend(self.error_reply(ErrorCode::ChecksumMismatch, &e.to_string()));
                }
            }
        }

        replies
    }

    /// Begin receiving a pushed file into the inbound directory.
    ///
    /// # Errors
    ///
    /// Propagates [`TransferEngine::start_receiving`] failures.
    pub async fn accept_inbound(
        &mut self,
        meta: crate::file::FileMetadata,
        chunk_size: u32,
        compression: crate::protocol::CompressionType,
    ) -> crate::Result<()> {
        let dir = self.inbound_dir.clone();
        self.transfers
            .start_receiving(meta, &dir, chunk_size, compression)
            .await?;
        self.state = PeerState::Transferring;
        Ok(())
    }

    /// Tear down the conversation: drop sessions and partial files.
    pub async fn abort(&mut self) {
        self.transfers.abort_all().await;
        self.state = PeerState::Idle;
    }
}

/// The ZimSync UDP server.
///
/// One socket, one task per peer address; datagrams are routed to the
/// owning peer task over a bounded channel.
pub struct SyncServer {
    listener: Listener,
    device: Arc<DeviceInfo>,
    catalog: Arc<RwLock<SharedCatalog>>,
    inbound_dir: PathBuf,
    cancel: CancellationToken,
}

impl SyncServer {
    /// Bind the server socket and set up the shared catalog.
    ///
    /// Received files land in `inbound_dir`, or in the shared directory when
    /// it is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] when the port cannot be bound.
    pub fn new(
        device: DeviceInfo,
        port: u16,
        shared_dir: PathBuf,
        inbound_dir: Option<PathBuf>,
    ) -> crate::Result<Self> {
        let listener = Listener::bind(port)?;
        let inbound_dir = inbound_dir.unwrap_or_else(|| shared_dir.clone());

        Ok(Self {
            listener,
            device: Arc::new(device),
            catalog: Arc::new(RwLock::new(SharedCatalog::new(shared_dir))),
            inbound_dir,
            cancel: CancellationToken::new(),
        })
    }

    /// The bound local address.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS cannot report the address.
    pub fn local_addr(&self) -> crate::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// A token that stops the server when cancelled.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the receive loop until cancelled.
    ///
    /// # Errors
    ///
    /// Returns transport errors from the server socket.
    pub async fn run(&self) -> crate::Result<()> {
        let addr = self.local_addr()?;
        tracing::info!(%addr, device = %self.device.name, "ZimSync server listening");

        let mut peers: HashMap<SocketAddr, mpsc::Sender<Vec<u8>>> = HashMap::new();

        loop {
            let (datagram, peer_addr) = tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::info!("Server shutting down");
                    return Ok(());
                }
                received = self.listener.recv_from() => received?,
            };

            let tx = peers
                .entry(peer_addr)
                .or_insert_with(|| self.spawn_peer(peer_addr));

            if tx.try_send(datagram.clone()).is_err() {
                // Peer task gone (idle timeout) or queue full; restart it.
                let tx = self.spawn_peer(peer_addr);
                let _ = tx.try_send(datagram);
                peers.insert(peer_addr, tx);
            }
        }
    }

    fn spawn_peer(&self, peer_addr: SocketAddr) -> mpsc::Sender<Vec<u8>> {
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PEER_QUEUE_DEPTH);
        let socket = self.listener.socket();
        let cancel = self.cancel.clone();
        let mut engine = SyncEngine::new(
            Arc::clone(&self.device),
            Arc::clone(&self.catalog),
            self.inbound_dir.clone(),
        );

        tracing::debug!(%peer_addr, "Starting peer task");

        tokio::spawn(async move {
            loop {
                let datagram = tokio::select! {
                    () = cancel.cancelled() => break,
                    received = tokio::time::timeout(PEER_IDLE_TIMEOUT, rx.recv()) => {
                        match received {
                            Ok(Some(datagram)) => datagram,
                            Ok(None) => break,
                            Err(_) => {
                                tracing::debug!(%peer_addr, "Peer idle, stopping task");
                                break;
                            }
                        }
                    }
                };

                for reply in engine.handle_datagram(&datagram).await {
                    if let Err(e) = socket.send_to(&reply, peer_addr).await {
                        tracing::warn!(%peer_addr, error = %e, "Reply send failed");
                    }
                }
            }

            engine.abort().await;
            tracing::debug!(%peer_addr, "Peer task finished");
        });

        tx
    }
}
