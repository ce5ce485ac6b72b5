//! Pull-model client for talking to a ZimSync server.
//!
//! The client drives the symmetric side of the state machine: `Discover` →
//! `Announce` + `FileList`, then one `FileRequest` per chunk, acknowledging
//! with selective-ACK bitmaps and re-requesting whatever is still missing
//! before the final whole-file verification.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::device::DeviceInfo;
use crate::error::{Error, Result};
use crate::file::FileMetadata;
use crate::protocol::{
    self, AckPayload, CompressionType, DiscoverPayload, FileRequestPayload, Packet,
};
use crate::transfer::{total_chunks, TransferEngine};
use crate::transport::Connection;

/// How long to wait for each reply datagram.
const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Acknowledge after this many stored chunks.
const ACK_EVERY_CHUNKS: u32 = 16;

/// How many re-request rounds to attempt before giving up on a file.
const MAX_RETRY_ROUNDS: u32 = 3;

/// The result of a discovery exchange.
#[derive(Debug, Clone)]
pub struct PeerCatalog {
    /// The server's identity
    pub device_info: DeviceInfo,
    /// Bytes free on the server's shared volume
    pub available_space: i64,
    /// Feature tags the server advertised
    pub supported_features: Vec<String>,
    /// The server's shared files
    pub files: Vec<FileMetadata>,
}

/// A client conversation with one server.
pub struct SyncClient {
    connection: Connection,
    device: DeviceInfo,
    transfers: TransferEngine,
    sequence: u16,
}

impl SyncClient {
    /// Connect to a server endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::ConnectionFailed`] from the
    /// transport.
    pub async fn connect(endpoint: SocketAddr, device: DeviceInfo) -> Result<Self> {
        Self::connect_with_timeout(endpoint, device, crate::transport::CONNECT_TIMEOUT).await
    }

    /// Connect to a server endpoint with an explicit readiness bound.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Timeout`] or [`Error::ConnectionFailed`] from the
    /// transport.
    pub async fn connect_with_timeout(
        endpoint: SocketAddr,
        device: DeviceInfo,
        timeout: Duration,
    ) -> Result<Self> {
        let connection = Connection::connect_with_timeout(endpoint, timeout).await?;
        Ok(Self {
            connection,
            device,
            transfers: TransferEngine::new(),
            sequence: 0,
        })
    }

    /// The remote endpoint.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.connection.peer_addr()
    }

    fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let sequence = self.next_sequence();
        let datagram = protocol::encode(packet, sequence)?;
        self.connection.send(&datagram).await
    }

    async fn recv_packet(&self) -> Result<(protocol::PacketHeader, Packet)> {
        let datagram = self.connection.recv_timeout(REPLY_TIMEOUT).await?;
        protocol::decode(&datagram)
    }

    /// Probe the server and collect its catalog.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] when the server answers out of
    /// order, a transport error, or the server's wire error.
    pub async fn discover(&mut self) -> Result<PeerCatalog> {
        let probe = Packet::Discover(DiscoverPayload {
            device_id: self.device.id,
            timestamp: Utc::now(),
        });
        self.send_packet(&probe).await?;

        let (_, reply) = self.recv_packet().await?;
        let announce = match reply {
            Packet::Announce(announce) => announce,
            Packet::Error(report) => {
                return Err(Error::InvalidPacket(format!(
                    "server error {}: {}",
                    report.code.code(),
                    report.message
                )))
            }
            other => {
                return Err(Error::InvalidPacket(format!(
                    "expected Announce, got {:?}",
                    other.packet_type()
                )))
            }
        };

        let (_, reply) = self.recv_packet().await?;
        let Packet::FileList(file_list) = reply else {
            return Err(Error::InvalidPacket(format!(
                "expected FileList, got {:?}",
                reply.packet_type()
            )));
        };

        tracing::info!(
            device = %announce.device_info.name,
            files = file_list.files.len(),
            "Discovered peer catalog"
        );

        Ok(PeerCatalog {
            device_info: announce.device_info,
            available_space: announce.available_space,
            supported_features: announce.supported_features,
            files: file_list.files,
        })
    }

    async fn request_chunk(
        &mut self,
        file_id: Uuid,
        chunk_index: u32,
        chunk_size: u32,
        compression: CompressionType,
    ) -> Result<()> {
        let request = Packet::FileRequest(FileRequestPayload {
            file_id,
            start_offset: i64::from(chunk_index) * i64::from(chunk_size),
            chunk_size: i32::try_from(chunk_size).unwrap_or(i32::MAX),
            compression_type: Some(compression),
        });
        self.send_packet(&request).await
    }

    async fn store_reply_chunk(&mut self, file_id: Uuid) -> Result<()> {
        let (header, reply) = self.recv_packet().await?;
        match reply {
            Packet::FileData(chunk) => {
                if chunk.file_id != file_id {
                    return Err(Error::InvalidPacket(format!(
                        "chunk for unexpected file {}",
                        chunk.file_id
                    )));
                }
                self.transfers.receive_chunk(&chunk).await?;

                if chunk.chunk_index % ACK_EVERY_CHUNKS == ACK_EVERY_CHUNKS - 1
                    || chunk.chunk_index + 1 == chunk.total_chunks
                {
                    let ack = Packet::Ack(AckPayload {
                        sequence_number: header.sequence,
                        received_bitmap: Some(self.transfers.received_bitmap(file_id)?),
                    });
                    self.send_packet(&ack).await?;
                }
                Ok(())
            }
            Packet::Error(report) => Err(match report.code {
                protocol::ErrorCode::FileNotFound => Error::FileNotFound(report.message),
                protocol::ErrorCode::ChecksumMismatch => Error::ChecksumMismatch(report.message),
                _ => Error::InvalidPacket(format!(
                    "server error {}: {}",
                    report.code.code(),
                    report.message
                )),
            }),
            other => Err(Error::InvalidPacket(format!(
                "expected FileData, got {:?}",
                other.packet_type()
            ))),
        }
    }

    /// Fetch one file from the server into `dest_dir`.
    ///
    /// Pulls every chunk, re-requests the missing ones, and verifies the
    /// whole-file SHA-256 against the offered metadata. Returns the written
    /// path.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChecksumMismatch`] when verification fails (the
    /// partial file is removed), [`Error::Timeout`] when the server stalls,
    /// or any transport error.
    pub async fn fetch(
        &mut self,
        meta: &FileMetadata,
        dest_dir: &Path,
        chunk_size: u32,
        compression: CompressionType,
    ) -> Result<PathBuf> {
        let result = self.fetch_inner(meta, dest_dir, chunk_size, compression).await;
        if result.is_err() {
            self.transfers.abort_all().await;
        }
        result
    }

    async fn fetch_inner(
        &mut self,
        meta: &FileMetadata,
        dest_dir: &Path,
        chunk_size: u32,
        compression: CompressionType,
    ) -> Result<PathBuf> {
        self.transfers
            .start_receiving(meta.clone(), dest_dir, chunk_size, compression)
            .await?;

        let file_id = meta.id;
        let chunks = total_chunks(meta.size, chunk_size);

        for chunk_index in 0..chunks {
            self.request_chunk(file_id, chunk_index, chunk_size, compression)
                .await?;
            self.store_reply_chunk(file_id).await?;
        }

        // Datagrams can be lost; sweep for holes until nothing is missing.
        let mut rounds = 0;
        loop {
            let missing = self.transfers.missing_chunks(file_id)?;
            if missing.is_empty() {
                break;
            }
            rounds += 1;
            if rounds > MAX_RETRY_ROUNDS {
                return Err(Error::Timeout(REPLY_TIMEOUT.as_secs()));
            }
            tracing::debug!(missing = missing.len(), round = rounds, "Re-requesting chunks");
            for chunk_index in missing {
                self.request_chunk(file_id, chunk_index, chunk_size, compression)
                    .await?;
                self.store_reply_chunk(file_id).await?;
            }
        }

        self.transfers.complete_transfer(file_id).await
    }

    /// Send raw UTF-8 text and return the reply as text.
    ///
    /// The server's echo fallback answers these; used for manual
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// Returns a transport error, or [`Error::InvalidPacket`] if the reply
    /// is not text.
    pub async fn send_text(&mut self, text: &str) -> Result<String> {
        self.connection.send(text.as_bytes()).await?;
        let reply = self.connection.recv_timeout(REPLY_TIMEOUT).await?;
        String::from_utf8(reply)
            .map_err(|_| Error::InvalidPacket("reply is not UTF-8 text".to_string()))
    }

    /// Tear the conversation down, dropping any partial transfers.
    pub async fn close(mut self) {
        self.transfers.abort_all().await;
        self.connection.cancel();
    }
}
