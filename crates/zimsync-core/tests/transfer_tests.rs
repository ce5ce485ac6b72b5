//! End-to-end transfer engine tests: integrity, corruption, and the
//! audio-aware compression policy.

use std::path::Path;

use rand::RngCore;
use tempfile::TempDir;

use zimsync_core::error::Error;
use zimsync_core::file::{prepare_file_for_transfer, sha256_file, FileMetadata};
use zimsync_core::protocol::CompressionType;
use zimsync_core::transfer::{total_chunks, TransferEngine, DEFAULT_CHUNK_SIZE};

async fn offer(path: &Path) -> FileMetadata {
    prepare_file_for_transfer(path).await.expect("prepare file")
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

/// Run a complete sender-to-receiver transfer and return the written path.
async fn pump_transfer(
    src: &Path,
    dest_dir: &Path,
    chunk_size: u32,
    compression: CompressionType,
    corrupt_chunk: Option<u32>,
) -> Result<std::path::PathBuf, Error> {
    let meta = offer(src).await;
    let id = meta.id;

    let mut sender = TransferEngine::new();
    sender
        .start_sending(meta.clone(), src, chunk_size, compression)
        .await?;

    let mut receiver = TransferEngine::new();
    receiver
        .start_receiving(meta.clone(), dest_dir, chunk_size, compression)
        .await?;

    for index in 0..total_chunks(meta.size, chunk_size) {
        let mut chunk = sender
            .next_chunk(id, index)
            .await?
            .expect("chunk within bounds");

        if corrupt_chunk == Some(index) {
            // Flip one byte the way a buggy sender would, keeping any
            // compression framing intact by corrupting uncompressed chunks
            // only.
            assert_eq!(chunk.original_size, None, "corrupt uncompressed chunks");
            chunk.data[0] ^= 0x01;
        }

        receiver.receive_chunk(&chunk).await?;
    }

    assert!(receiver.missing_chunks(id)?.is_empty());
    receiver.complete_transfer(id).await
}

#[tokio::test]
async fn five_mib_random_file_survives_transfer() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("bounce.bin");
    std::fs::write(&src, random_bytes(5 * 1024 * 1024)).expect("write source");

    let inbound = dir.path().join("inbound");
    let dest = pump_transfer(&src, &inbound, DEFAULT_CHUNK_SIZE, CompressionType::None, None)
        .await
        .expect("transfer");

    let sent = sha256_file(&src).await.expect("hash source");
    let received = sha256_file(&dest).await.expect("hash dest");
    assert_eq!(sent, received, "receiver must reproduce the sender's hash");
}

#[tokio::test]
async fn corrupted_chunk_fails_verification_and_keeps_nothing() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("bounce.bin");
    std::fs::write(&src, random_bytes(200_000)).expect("write source");

    let inbound = dir.path().join("inbound");
    let result = pump_transfer(
        &src,
        &inbound,
        DEFAULT_CHUNK_SIZE,
        CompressionType::None,
        Some(2),
    )
    .await;

    assert!(matches!(result, Err(Error::ChecksumMismatch(_))));
    assert!(
        !inbound.join("bounce.bin").exists(),
        "a corrupt file must not be retained"
    );
}

#[tokio::test]
async fn chunk_concatenation_reconstructs_exact_bytes() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("take.bin");
    let content = random_bytes(3 * 32_768 + 12_345);
    std::fs::write(&src, &content).expect("write source");

    let meta = offer(&src).await;
    let mut sender = TransferEngine::new();
    sender
        .start_sending(meta.clone(), &src, DEFAULT_CHUNK_SIZE, CompressionType::None)
        .await
        .expect("start");

    let mut reassembled = Vec::new();
    let mut index = 0;
    while let Some(chunk) = sender.next_chunk(meta.id, index).await.expect("read") {
        assert_eq!(chunk.offset, i64::from(index) * i64::from(DEFAULT_CHUNK_SIZE));
        reassembled.extend_from_slice(&chunk.data);
        index += 1;
    }

    assert_eq!(index, 4);
    assert_eq!(reassembled, content);
}

#[tokio::test]
async fn mp3_chunks_are_never_compressed() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("song.mp3");
    // Highly compressible content; the policy must still skip it.
    std::fs::write(&src, vec![0u8; 50_000]).expect("write source");

    let meta = offer(&src).await;
    let mut sender = TransferEngine::new();
    sender
        .start_sending(meta.clone(), &src, DEFAULT_CHUNK_SIZE, CompressionType::Zlib)
        .await
        .expect("start");

    let mut index = 0;
    while let Some(chunk) = sender.next_chunk(meta.id, index).await.expect("read") {
        assert_eq!(
            chunk.original_size, None,
            "already-compressed formats must pass through"
        );
        index += 1;
    }
    assert_eq!(index, 2);
}

#[tokio::test]
async fn compressible_wav_is_compressed_and_roundtrips() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("silence.wav");
    std::fs::write(&src, vec![0u8; 150_000]).expect("write source");

    let inbound = dir.path().join("inbound");

    // Check the wire form first: silent audio shrinks well past 10%.
    let meta = offer(&src).await;
    let mut sender = TransferEngine::new();
    sender
        .start_sending(meta.clone(), &src, DEFAULT_CHUNK_SIZE, CompressionType::Zlib)
        .await
        .expect("start");
    let first = sender
        .next_chunk(meta.id, 0)
        .await
        .expect("read")
        .expect("chunk");
    assert_eq!(first.original_size, Some(32_768));
    assert!(first.data.len() < 32_768 / 2);

    let dest = pump_transfer(&src, &inbound, DEFAULT_CHUNK_SIZE, CompressionType::Zlib, None)
        .await
        .expect("transfer");
    assert_eq!(
        sha256_file(&src).await.expect("hash src"),
        sha256_file(&dest).await.expect("hash dest")
    );
}

#[tokio::test]
async fn lz4_session_roundtrips() {
    let dir = TempDir::new().expect("temp dir");
    let src = dir.path().join("notes.txt");
    std::fs::write(&src, b"tempo 120 / key Am / ".repeat(5_000)).expect("write source");

    let inbound = dir.path().join("inbound");
    let dest = pump_transfer(&src, &inbound, DEFAULT_CHUNK_SIZE, CompressionType::Lz4, None)
        .await
        .expect("transfer");

    assert_eq!(
        sha256_file(&src).await.expect("hash src"),
        sha256_file(&dest).await.expect("hash dest")
    );
}
