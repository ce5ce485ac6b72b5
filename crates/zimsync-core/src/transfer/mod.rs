//! Chunked file transfer engine for ZimSync.
//!
//! Each in-flight file has one session per direction, keyed by its handle:
//!
//! - A [`SendSession`] slices the source file into offset-addressed chunks,
//!   applying the audio-aware compression policy per chunk.
//! - A [`ReceiveSession`] writes chunks at their offsets (datagrams may
//!   arrive in any order), tracks which indices have been stored, and
//!   verifies the whole-file SHA-256 on completion.
//!
//! Chunk accounting: `offset = chunk_index * chunk_size`,
//! `total_chunks = ceil(size / chunk_size)`, and only the last chunk may be
//! short. Retransmit is driven entirely by the receiver's selective-ACK
//! bitmap; [`TransferEngine::missing_chunks`] is the hook.

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::compression::{compress_audio_chunk, decompress};
use crate::error::{Error, Result};
use crate::file::{sanitize_file_name, sha256_file, FileMetadata};
use crate::protocol::{CompressionType, FileDataPayload};

/// Default chunk size (32 KiB).
pub const DEFAULT_CHUNK_SIZE: u32 = 32 * 1024;

/// Largest chunk size a peer may request.
///
/// A full chunk must still fit one datagram after base64 framing, so the
/// recommended 32 KiB is also the hard bound.
pub const MAX_CHUNK_SIZE: u32 = 32 * 1024;

/// Number of chunks needed to cover `size` bytes.
#[must_use]
pub fn total_chunks(size: u64, chunk_size: u32) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let chunks = size.div_ceil(u64::from(chunk_size)) as u32;
    chunks
}

/// Sender-side state for one in-flight file.
#[derive(Debug)]
pub struct SendSession {
    meta: FileMetadata,
    file: tokio::fs::File,
    chunk_size: u32,
    compression: CompressionType,
    acked_chunks: HashSet<u32>,
    started_at: Instant,
}

impl SendSession {
    /// Chunk indices the receiver has not yet acknowledged.
    #[must_use]
    pub fn unacked_chunks(&self) -> Vec<u32> {
        let total = total_chunks(self.meta.size, self.chunk_size);
        (0..total)
            .filter(|index| !self.acked_chunks.contains(index))
            .collect()
    }
}

/// Receiver-side state for one in-flight file.
#[derive(Debug)]
pub struct ReceiveSession {
    meta: FileMetadata,
    dest: PathBuf,
    file: tokio::fs::File,
    chunk_size: u32,
    compression: CompressionType,
    received_chunks: HashSet<u32>,
    started_at: Instant,
}

impl ReceiveSession {
    /// Total chunk count for the file.
    #[must_use]
    pub fn total_chunks(&self) -> u32 {
        total_chunks(self.meta.size, self.chunk_size)
    }

    /// Whether every chunk has been stored.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.received_chunks.len() as u64 == u64::from(self.total_chunks())
    }
}

/// Validate a requested chunk size.
fn check_chunk_size(chunk_size: u32) -> Result<()> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(Error::InvalidPacket(format!(
            "chunk size {chunk_size} outside 1..={MAX_CHUNK_SIZE}"
        )));
    }
    Ok(())
}

/// The per-peer transfer engine.
///
/// Owns every live session for one peer conversation, at most one per
/// (file id, direction).
#[derive(Debug, Default)]
pub struct TransferEngine {
    sending: HashMap<Uuid, SendSession>,
    receiving: HashMap<Uuid, ReceiveSession>,
}

impl TransferEngine {
    /// Create an engine with no sessions.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `path` for reading and register a sender session for `meta.id`.
    ///
    /// A session already registered for this handle is kept as-is.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPacket`] for a bad chunk size and
    /// [`Error::FileNotFound`] if the file cannot be opened.
    pub async fn start_sending(
        &mut self,
        meta: FileMetadata,
        path: &Path,
        chunk_size: u32,
        compression: CompressionType,
    ) -> Result<()> {
        check_chunk_size(chunk_size)?;

        if self.sending.contains_key(&meta.id) {
            return Ok(());
        }

        let file = tokio::fs::File::open(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;

        tracing::debug!(file = %meta.path, id = %meta.id, chunk_size, "Started send session");

        self.sending.insert(
            meta.id,
            SendSession {
                meta,
                file,
                chunk_size,
                compression,
                acked_chunks: HashSet::new(),
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Whether a sender session exists for this handle.
    #[must_use]
    pub fn is_sending(&self, file_id: Uuid) -> bool {
        self.sending.contains_key(&file_id)
    }

    /// Read and package one chunk from a sender session.
    ///
    /// Returns `Ok(None)` once `chunk_index` points at or past end of file
    /// (the end-of-file sentinel).
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle, or an I/O or
    /// compression error.
    pub async fn next_chunk(
        &mut self,
        file_id: Uuid,
        chunk_index: u32,
    ) -> Result<Option<FileDataPayload>> {
        let session = self
            .sending
            .get_mut(&file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        let offset = u64::from(chunk_index) * u64::from(session.chunk_size);
        if offset >= session.meta.size {
            return Ok(None);
        }

        #[allow(clippy::cast_possible_truncation)]
        let length = (session.meta.size - offset).min(u64::from(session.chunk_size)) as usize;

        session.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = vec![0u8; length];
        session.file.read_exact(&mut data).await?;

        let extension = session.meta.extension();
        let (data, applied) =
            compress_audio_chunk(&data, extension.as_deref(), session.compression)?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let payload = FileDataPayload {
            file_id,
            chunk_index,
            offset: offset as i64,
            total_chunks: total_chunks(session.meta.size, session.chunk_size),
            data,
            original_size: applied.map(|_| length as i32),
        };
        Ok(Some(payload))
    }

    /// Record the receiver's selective-ACK bitmap for a sender session.
    ///
    /// Acked chunks are no longer candidates for retransmit. Unknown handles
    /// are ignored.
    pub fn record_acked(&mut self, file_id: Uuid, bitmap: &[u8]) {
        if let Some(session) = self.sending.get_mut(&file_id) {
            let total = total_chunks(session.meta.size, session.chunk_size);
            for index in crate::protocol::decode_chunk_bitmap(bitmap) {
                if index < total {
                    session.acked_chunks.insert(index);
                }
            }
        }
    }

    /// Chunk indices of a sender session not yet acknowledged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle.
    pub fn unacked_chunks(&self, file_id: Uuid) -> Result<Vec<u32>> {
        self.sending
            .get(&file_id)
            .map(SendSession::unacked_chunks)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))
    }

    /// Drop a sender session, closing its handle.
    pub fn finish_sending(&mut self, file_id: Uuid) {
        if let Some(session) = self.sending.remove(&file_id) {
            tracing::debug!(
                file = %session.meta.path,
                elapsed_ms = session.started_at.elapsed().as_millis(),
                "Closed send session"
            );
        }
    }

    /// Create the target file and register a receiver session for `meta.id`.
    ///
    /// The target is `dir/meta.path`; the parent directory is created if
    /// missing and an existing target is truncated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPath`] when the transmitted name is not a
    /// bare basename, and [`Error::InvalidPacket`] for a bad chunk size.
    pub async fn start_receiving(
        &mut self,
        meta: FileMetadata,
        dir: &Path,
        chunk_size: u32,
        compression: CompressionType,
    ) -> Result<()> {
        check_chunk_size(chunk_size)?;
        sanitize_file_name(&meta.path)?;

        if self.receiving.contains_key(&meta.id) {
            return Ok(());
        }

        tokio::fs::create_dir_all(dir).await?;
        let dest = dir.join(&meta.path);
        let file = tokio::fs::File::create(&dest).await?;

        tracing::debug!(file = %meta.path, id = %meta.id, dest = %dest.display(), "Started receive session");

        self.receiving.insert(
            meta.id,
            ReceiveSession {
                meta,
                dest,
                file,
                chunk_size,
                compression,
                received_chunks: HashSet::new(),
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Whether a receiver session exists for this handle.
    #[must_use]
    pub fn is_receiving(&self, file_id: Uuid) -> bool {
        self.receiving.contains_key(&file_id)
    }

    /// Store one received chunk.
    ///
    /// When `original_size` is present the data is decompressed first and
    /// must expand to exactly that many bytes. The chunk is written at its
    /// offset, so datagrams may arrive in any order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle,
    /// [`Error::InvalidPacket`] for inconsistent offsets, and
    /// [`Error::ChecksumMismatch`] when the decompressed length is wrong.
    pub async fn receive_chunk(&mut self, packet: &FileDataPayload) -> Result<()> {
        let session = self
            .receiving
            .get_mut(&packet.file_id)
            .ok_or_else(|| Error::FileNotFound(packet.file_id.to_string()))?;

        let expected_offset = i64::from(packet.chunk_index) * i64::from(session.chunk_size);
        if packet.offset < 0 || packet.offset != expected_offset {
            return Err(Error::InvalidPacket(format!(
                "chunk {} claims offset {}, expected {expected_offset}",
                packet.chunk_index, packet.offset
            )));
        }

        let data = match packet.original_size {
            Some(original_size) => {
                let decompressed = decompress(&packet.data, session.compression)?;
                let expected = usize::try_from(original_size).unwrap_or(usize::MAX);
                if decompressed.len() != expected {
                    return Err(Error::ChecksumMismatch(format!(
                        "chunk {} decompressed to {} bytes, expected {original_size}",
                        packet.chunk_index,
                        decompressed.len()
                    )));
                }
                decompressed
            }
            None => packet.data.clone(),
        };

        #[allow(clippy::cast_sign_loss)]
        session
            .file
            .seek(std::io::SeekFrom::Start(packet.offset as u64))
            .await?;
        session.file.write_all(&data).await?;
        session.received_chunks.insert(packet.chunk_index);

        Ok(())
    }

    /// Chunk indices a receiver session is still missing, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle.
    pub fn missing_chunks(&self, file_id: Uuid) -> Result<Vec<u32>> {
        let session = self
            .receiving
            .get(&file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        Ok((0..session.total_chunks())
            .filter(|index| !session.received_chunks.contains(index))
            .collect())
    }

    /// Selective-ACK bitmap for a receiver session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle.
    pub fn received_bitmap(&self, file_id: Uuid) -> Result<Vec<u8>> {
        let session = self
            .receiving
            .get(&file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        Ok(crate::protocol::encode_chunk_bitmap(
            &session.received_chunks,
            session.total_chunks(),
        ))
    }

    /// Whether a receiver session has stored every chunk.
    #[must_use]
    pub fn is_receive_complete(&self, file_id: Uuid) -> bool {
        self.receiving
            .get(&file_id)
            .is_some_and(ReceiveSession::is_complete)
    }

    /// Finish a receiver session: flush, close, and verify the whole file.
    ///
    /// On success the target path is returned. On a hash mismatch the target
    /// is deleted; a partial or corrupt file is never kept.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FileNotFound`] for an unknown handle and
    /// [`Error::ChecksumMismatch`] when the recomputed SHA-256 differs from
    /// the offered metadata.
    pub async fn complete_transfer(&mut self, file_id: Uuid) -> Result<PathBuf> {
        let mut session = self
            .receiving
            .remove(&file_id)
            .ok_or_else(|| Error::FileNotFound(file_id.to_string()))?;

        session.file.flush().await?;
        session.file.sync_all().await?;
        drop(session.file);

        let actual = sha256_file(&session.dest).await?;
        if actual != session.meta.checksum {
            let _ = tokio::fs::remove_file(&session.dest).await;
            return Err(Error::ChecksumMismatch(format!(
                "received content of '{}' does not hash to the offered checksum",
                session.meta.path
            )));
        }

        tracing::info!(
            file = %session.meta.path,
            bytes = session.meta.size,
            elapsed_ms = session.started_at.elapsed().as_millis(),
            "Transfer complete and verified"
        );
        Ok(session.dest)
    }

    /// Drop every session, deleting partial receive targets.
    ///
    /// Called when the peer conversation terminates; the protocol has no
    /// durable resume.
    pub async fn abort_all(&mut self) {
        self.sending.clear();
        for (_, session) in self.receiving.drain() {
            drop(session.file);
            let _ = tokio::fs::remove_file(&session.dest).await;
            tracing::debug!(file = %session.meta.path, "Dropped partial receive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn meta_for(path: &Path) -> FileMetadata {
        crate::file::prepare_file_for_transfer(path)
            .await
            .expect("prepare")
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_total_chunks_math() {
        assert_eq!(total_chunks(0, 32_768), 0);
        assert_eq!(total_chunks(1, 32_768), 1);
        assert_eq!(total_chunks(32_768, 32_768), 1);
        assert_eq!(total_chunks(32_769, 32_768), 2);
        assert_eq!(total_chunks(100_000, 32_768), 4);
        assert_eq!(total_chunks(7, 1), 7);
    }

    #[test]
    fn test_chunk_size_bounds() {
        assert!(check_chunk_size(0).is_err());
        assert!(check_chunk_size(1).is_ok());
        assert!(check_chunk_size(MAX_CHUNK_SIZE).is_ok());
        assert!(check_chunk_size(MAX_CHUNK_SIZE + 1).is_err());
    }

    #[tokio::test]
    async fn test_next_chunk_slicing() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("note.bin");
        std::fs::write(&path, patterned(100_000)).expect("write");

        let meta = meta_for(&path).await;
        let id = meta.id;

        let mut engine = TransferEngine::new();
        engine
            .start_sending(meta, &path, 32_768, CompressionType::None)
            .await
            .expect("start");

        let mut sizes = Vec::new();
        for index in 0..4 {
            let chunk = engine
                .next_chunk(id, index)
                .await
                .expect("read")
                .expect("chunk exists");
            assert_eq!(chunk.chunk_index, index);
            assert_eq!(chunk.total_chunks, 4);
            assert_eq!(chunk.offset, i64::from(index) * 32_768);
            assert_eq!(chunk.original_size, None);
            sizes.push(chunk.data.len());
        }
        assert_eq!(sizes, vec![32_768, 32_768, 32_768, 1_696]);

        assert!(
            engine.next_chunk(id, 4).await.expect("read").is_none(),
            "past-EOF index must return the sentinel"
        );
    }

    #[tokio::test]
    async fn test_next_chunk_unknown_id() {
        let mut engine = TransferEngine::new();
        let result = engine.next_chunk(Uuid::new_v4(), 0).await;
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_out_of_order_receive_roundtrip() {
        let dir = TempDir::new().expect("temp dir");
        let src = dir.path().join("src.bin");
        let content = patterned(80_000);
        std::fs::write(&src, &content).expect("write");

        let meta = meta_for(&src).await;
        let id = meta.id;

        let mut sender = TransferEngine::new();
        sender
            .start_sending(meta.clone(), &src, 32_768, CompressionType::None)
            .await
            .expect("start send");

        let inbound = dir.path().join("inbound");
        let mut receiver = TransferEngine::new();
        receiver
            .start_receiving(meta.clone(), &inbound, 32_768, CompressionType::None)
            .await
            .expect("start receive");

        for index in [2u32, 0, 1] {
            let chunk = sender
                .next_chunk(id, index)
                .await
                .expect("read")
                .expect("chunk");
            receiver.receive_chunk(&chunk).await.expect("write");
        }

        assert!(receiver.is_receive_complete(id));
        let dest = receiver.complete_transfer(id).await.expect("verify");
        assert_eq!(std::fs::read(dest).expect("read dest"), content);
    }

    #[tokio::test]
    async fn test_missing_chunks_complement() {
        let dir = TempDir::new().expect("temp dir");
        let src = dir.path().join("src.bin");
        std::fs::write(&src, patterned(20 * 1024)).expect("write");

        let meta = meta_for(&src).await;
        let id = meta.id;

        let mut sender = TransferEngine::new();
        sender
            .start_sending(meta.clone(), &src, 1024, CompressionType::None)
            .await
            .expect("start send");

        let mut receiver = TransferEngine::new();
        receiver
            .start_receiving(meta, &dir.path().join("in"), 1024, CompressionType::None)
            .await
            .expect("start receive");

        let dropped = [3u32, 7, 15];
        for index in 0..20 {
            if dropped.contains(&index) {
                continue;
            }
            let chunk = sender
                .next_chunk(id, index)
                .await
                .expect("read")
                .expect("chunk");
            receiver.receive_chunk(&chunk).await.expect("write");
        }

        assert_eq!(receiver.missing_chunks(id).expect("missing"), vec![3, 7, 15]);
        assert!(!receiver.is_receive_complete(id));
    }

    #[tokio::test]
    async fn test_acked_bookkeeping() {
        let dir = TempDir::new().expect("temp dir");
        let src = dir.path().join("src.bin");
        std::fs::write(&src, patterned(4 * 1024)).expect("write");

        let meta = meta_for(&src).await;
        let id = meta.id;

        let mut engine = TransferEngine::new();
        engine
            .start_sending(meta, &src, 1024, CompressionType::None)
            .await
            .expect("start");

        let acked: HashSet<u32> = [0, 2].into_iter().collect();
        let bitmap = crate::protocol::encode_chunk_bitmap(&acked, 4);
        engine.record_acked(id, &bitmap);

        assert_eq!(engine.unacked_chunks(id).expect("unacked"), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_receive_rejects_traversal_names() {
        let dir = TempDir::new().expect("temp dir");
        let meta = FileMetadata {
            id: Uuid::new_v4(),
            path: "../escape.wav".to_string(),
            size: 10,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };

        let mut engine = TransferEngine::new();
        let result = engine
            .start_receiving(meta, dir.path(), 1024, CompressionType::None)
            .await;

        assert!(matches!(result, Err(Error::InvalidPath(_))));
        assert!(
            !dir.path().join("../escape.wav").exists(),
            "no file may be created for a rejected name"
        );
    }

    #[tokio::test]
    async fn test_receive_rejects_wrong_offset() {
        let dir = TempDir::new().expect("temp dir");
        let meta = FileMetadata {
            id: Uuid::new_v4(),
            path: "ok.bin".to_string(),
            size: 4096,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };
        let id = meta.id;

        let mut engine = TransferEngine::new();
        engine
            .start_receiving(meta, dir.path(), 1024, CompressionType::None)
            .await
            .expect("start");

        let chunk = FileDataPayload {
            file_id: id,
            chunk_index: 1,
            offset: 999,
            total_chunks: 4,
            data: vec![0u8; 1024],
            original_size: None,
        };
        assert!(matches!(
            engine.receive_chunk(&chunk).await,
            Err(Error::InvalidPacket(_))
        ));
    }

    #[tokio::test]
    async fn test_decompressed_size_mismatch() {
        let dir = TempDir::new().expect("temp dir");
        let meta = FileMetadata {
            id: Uuid::new_v4(),
            path: "ok.bin".to_string(),
            size: 4096,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };
        let id = meta.id;

        let mut engine = TransferEngine::new();
        engine
            .start_receiving(meta, dir.path(), 1024, CompressionType::Zlib)
            .await
            .expect("start");

        let compressed = crate::compression::compress(&[7u8; 1024], CompressionType::Zlib)
            .expect("compress")
            .expect("compressible");
        let chunk = FileDataPayload {
            file_id: id,
            chunk_index: 0,
            offset: 0,
            total_chunks: 4,
            data: compressed,
            original_size: Some(999),
        };

        assert!(matches!(
            engine.receive_chunk(&chunk).await,
            Err(Error::ChecksumMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_complete_transfer_mismatch_removes_file() {
        let dir = TempDir::new().expect("temp dir");
        let mut meta = FileMetadata {
            id: Uuid::new_v4(),
            path: "tamper.bin".to_string(),
            size: 1024,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };
        meta.checksum = [0x11; 32]; // will not match the written content
        let id = meta.id;

        let mut engine = TransferEngine::new();
        engine
            .start_receiving(meta, dir.path(), 1024, CompressionType::None)
            .await
            .expect("start");

        let chunk = FileDataPayload {
            file_id: id,
            chunk_index: 0,
            offset: 0,
            total_chunks: 1,
            data: vec![0xAA; 1024],
            original_size: None,
        };
        engine.receive_chunk(&chunk).await.expect("write");

        let result = engine.complete_transfer(id).await;
        assert!(matches!(result, Err(Error::ChecksumMismatch(_))));
        assert!(
            !dir.path().join("tamper.bin").exists(),
            "a corrupt file must not be kept"
        );
    }

    #[tokio::test]
    async fn test_empty_file_transfer() {
        let dir = TempDir::new().expect("temp dir");
        let src = dir.path().join("empty.bin");
        std::fs::write(&src, b"").expect("write");

        let meta = meta_for(&src).await;
        let id = meta.id;

        let mut sender = TransferEngine::new();
        sender
            .start_sending(meta.clone(), &src, 1024, CompressionType::None)
            .await
            .expect("start send");
        assert!(sender.next_chunk(id, 0).await.expect("read").is_none());

        let mut receiver = TransferEngine::new();
        receiver
            .start_receiving(meta, &dir.path().join("in"), 1024, CompressionType::None)
            .await
            .expect("start receive");

        assert!(receiver.is_receive_complete(id));
        receiver.complete_transfer(id).await.expect("verify empty");
    }

    #[tokio::test]
    async fn test_abort_drops_partial_files() {
        let dir = TempDir::new().expect("temp dir");
        let meta = FileMetadata {
            id: Uuid::new_v4(),
            path: "partial.bin".to_string(),
            size: 4096,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };

        let mut engine = TransferEngine::new();
        engine
            .start_receiving(meta, dir.path(), 1024, CompressionType::None)
            .await
            .expect("start");
        assert!(dir.path().join("partial.bin").exists());

        engine.abort_all().await;
        assert!(!dir.path().join("partial.bin").exists());
    }
}
