//! File operations for ZimSync.
//!
//! This module handles:
//! - File metadata used as the transfer handle (`FileMetadata`)
//! - Streaming whole-file SHA-256 hashing
//! - Basename sanitization (no path traversal)
//! - WAV header sniffing for audio metadata
//! - Free-space queries for `Announce` replies

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Buffer size for streaming file hashing (1 MiB).
const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Audio properties of a shared file, when they could be determined.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMetadata {
    /// Duration in seconds
    pub duration_secs: f64,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
    /// Container/encoding name
    pub format: String,
}

/// Metadata describing one shared file.
///
/// The `id` is assigned by the sender when the file is offered and is the
/// handle used in every subsequent packet for this file. The `checksum` is
/// the SHA-256 of the entire content at the time the metadata was produced;
/// receivers recompute and compare it on completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    /// Sender-assigned handle
    pub id: Uuid,
    /// File basename (never a path)
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Modification timestamp
    pub modified: DateTime<Utc>,
    /// SHA-256 of the entire content
    #[serde(with = "crate::protocol::b64::checksum")]
    pub checksum: [u8; 32],
    /// Audio properties, when known
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub audio: Option<AudioMetadata>,
}

impl FileMetadata {
    /// The lowercase extension of the file name, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.path)
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_lowercase)
    }
}

/// Stat a file and build its transfer metadata.
///
/// Computes the full-content SHA-256 with a streaming hasher and assigns a
/// fresh UUID handle.
///
/// # Errors
///
/// Returns [`Error::FileNotFound`] if `path` does not name a regular file.
pub async fn prepare_file_for_transfer(path: &Path) -> Result<FileMetadata> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;

    if !metadata.is_file() {
        return Err(Error::FileNotFound(path.display().to_string()));
    }

    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(path.display().to_string()))?
        .to_string();

    let checksum = sha256_file(path).await?;

    let modified = metadata
        .modified()
        .map_or_else(|_| Utc::now(), DateTime::<Utc>::from);

    let audio = if Path::new(&name)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
    {
        sniff_wav(path).await
    } else {
        None
    };

    Ok(FileMetadata {
        id: Uuid::new_v4(),
        path: name,
        size: metadata.len(),
        modified,
        checksum,
        audio,
    })
}

/// Compute the SHA-256 of a file's entire content with a 1 MiB buffer.
///
/// # Errors
///
/// Returns an error if the file cannot be read.
pub async fn sha256_file(path: &Path) -> Result<[u8; 32]> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|_| Error::FileNotFound(path.display().to_string()))?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().into())
}

/// Validate that a transmitted file name is a bare basename.
///
/// Names containing path separators or `..` components would escape the
/// inbound directory and are rejected.
///
/// # Errors
///
/// Returns [`Error::InvalidPath`] for names that are empty, contain `/` or
/// `\`, or are a `..` component.
pub fn sanitize_file_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." {
        return Err(Error::InvalidPath(name.to_string()));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidPath(name.to_string()));
    }
    Ok(())
}

/// Bytes free on the volume holding `path`.
///
/// Returns 0 when the query fails or the platform has no answer.
#[cfg(unix)]
#[allow(unsafe_code)]
#[must_use]
pub fn available_space(path: &Path) -> i64 {
    use std::os::unix::ffi::OsStrExt;

    let Ok(cpath) = std::ffi::CString::new(path.as_os_str().as_bytes()) else {
        return 0;
    };

    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &raw mut stat) };
    if rc != 0 {
        return 0;
    }

    let bytes = u128::from(stat.f_bavail) * u128::from(stat.f_frsize);
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

/// Bytes free on the volume holding `path`.
///
/// Returns 0 when the query fails or the platform has no answer.
#[cfg(not(unix))]
#[must_use]
pub fn available_space(_path: &Path) -> i64 {
    0
}

/// Parse the RIFF/WAVE header of a file, if it has one.
///
/// Walks the chunk list looking for `fmt ` (sample rate, channels) and
/// `data` (payload size, for the duration). Anything that does not parse
/// yields `None`; a broken header is not an error, the file simply has no
/// audio metadata.
pub async fn sniff_wav(path: &Path) -> Option<AudioMetadata> {
    let mut file = tokio::fs::File::open(path).await.ok()?;

    let mut riff = [0u8; 12];
    file.read_exact(&mut riff).await.ok()?;
    if &riff[0..4] != b"RIFF" || &riff[8..12] != b"WAVE" {
        return None;
    }

    let mut sample_rate = None;
    let mut channels = None;
    let mut byte_rate = None;
    let mut data_size = None;

    loop {
        let mut chunk_header = [0u8; 8];
        if file.read_exact(&mut chunk_header).await.is_err() {
            break;
        }
        let chunk_id = [
            chunk_header[0],
            chunk_header[1],
            chunk_header[2],
            chunk_header[3],
        ];
        let chunk_size =
            u32::from_le_bytes([chunk_header[4], chunk_header[5], chunk_header[6], chunk_header[7]]);

        if &chunk_id == b"fmt " {
            if chunk_size < 16 {
                return None;
            }
            let mut fmt = [0u8; 16];
            file.read_exact(&mut fmt).await.ok()?;
            channels = Some(u16::from_le_bytes([fmt[2], fmt[3]]));
            sample_rate = Some(u32::from_le_bytes([fmt[4], fmt[5], fmt[6], fmt[7]]));
            byte_rate = Some(u32::from_le_bytes([fmt[8], fmt[9], fmt[10], fmt[11]]));
            let remaining = i64::from(chunk_size) - 16;
            if remaining > 0 {
                file.seek(std::io::SeekFrom::Current(remaining)).await.ok()?;
            }
        } else if &chunk_id == b"data" {
            data_size = Some(chunk_size);
            break;
        } else {
            // RIFF chunks are word-aligned
            let skip = i64::from(chunk_size) + i64::from(chunk_size % 2);
            file.seek(std::io::SeekFrom::Current(skip)).await.ok()?;
        }

        if sample_rate.is_some() && data_size.is_some() {
            break;
        }
    }

    let sample_rate = sample_rate?;
    let channels = channels?;
    let byte_rate = byte_rate?;
    let data_size = data_size?;

    if byte_rate == 0 {
        return None;
    }

    Some(AudioMetadata {
        duration_secs: f64::from(data_size) / f64::from(byte_rate),
        sample_rate,
        channels,
        format: "wav".to_string(),
    })
}

/// Format a file size for display.
#[must_use]
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Minimal valid WAV file: 16-bit mono PCM at 44.1 kHz with `samples`
    /// zero samples.
    fn build_wav(samples: u32) -> Vec<u8> {
        let data_size = samples * 2;
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_size).to_le_bytes());
        wav.extend_from_slice(b"WAVE");
        wav.extend_from_slice(b"fmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&44_100u32.to_le_bytes());
        wav.extend_from_slice(&88_200u32.to_le_bytes()); // byte rate
        wav.extend_from_slice(&2u16.to_le_bytes()); // block align
        wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_size.to_le_bytes());
        wav.extend(std::iter::repeat_n(0u8, data_size as usize));
        wav
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }

    #[test]
    fn test_sanitize_accepts_basenames() {
        assert!(sanitize_file_name("note.wav").is_ok());
        assert!(sanitize_file_name("weird name with spaces.flac").is_ok());
        assert!(sanitize_file_name("..twodots-prefix.txt").is_ok());
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_file_name("").is_err());
        assert!(sanitize_file_name("..").is_err());
        assert!(sanitize_file_name("../etc/passwd").is_err());
        assert!(sanitize_file_name("a/b.wav").is_err());
        assert!(sanitize_file_name("a\\b.wav").is_err());
        assert!(sanitize_file_name("/absolute").is_err());
    }

    #[tokio::test]
    async fn test_sha256_file_matches_one_shot_hash() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("content.bin");
        let content: Vec<u8> = (0u32..100_000).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).expect("write file");

        let streamed = sha256_file(&path).await.expect("hash");
        let expected: [u8; 32] = Sha256::digest(&content).into();
        assert_eq!(streamed, expected);
    }

    #[tokio::test]
    async fn test_prepare_file_for_transfer() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"one two three").expect("write file");

        let meta = prepare_file_for_transfer(&path).await.expect("prepare");

        assert_eq!(meta.path, "note.txt");
        assert_eq!(meta.size, 13);
        assert_eq!(meta.checksum, <[u8; 32]>::from(Sha256::digest(b"one two three")));
        assert!(meta.audio.is_none());

        let again = prepare_file_for_transfer(&path).await.expect("prepare");
        assert_ne!(meta.id, again.id, "each offer gets a fresh handle");
    }

    #[tokio::test]
    async fn test_prepare_missing_file_fails() {
        let dir = TempDir::new().expect("create temp dir");
        let result = prepare_file_for_transfer(&dir.path().join("absent.wav")).await;
        assert!(matches!(result, Err(Error::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_sniff_wav() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, build_wav(44_100)).expect("write wav");

        let audio = sniff_wav(&path).await.expect("wav metadata");
        assert_eq!(audio.sample_rate, 44_100);
        assert_eq!(audio.channels, 1);
        assert!((audio.duration_secs - 1.0).abs() < 0.01);
        assert_eq!(audio.format, "wav");
    }

    #[tokio::test]
    async fn test_sniff_wav_rejects_non_riff() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("not.wav");
        std::fs::write(&path, b"id3 tags are not RIFF").expect("write file");

        assert!(sniff_wav(&path).await.is_none());
    }

    #[tokio::test]
    async fn test_wav_file_gets_audio_metadata() {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("tone.wav");
        std::fs::write(&path, build_wav(22_050)).expect("write wav");

        let meta = prepare_file_for_transfer(&path).await.expect("prepare");
        let audio = meta.audio.expect("wav should carry audio metadata");
        assert!((audio.duration_secs - 0.5).abs() < 0.01);
    }

    #[test]
    fn test_metadata_json_shape() {
        let meta = FileMetadata {
            id: Uuid::nil(),
            path: "note.wav".to_string(),
            size: 100_000,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };

        let json = serde_json::to_string(&meta).expect("serialize");
        assert!(json.contains("\"path\":\"note.wav\""));
        assert!(json.contains("\"checksum\":\""));
        assert!(!json.contains("\"audio\""));

        let decoded: FileMetadata = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn test_extension() {
        let mut meta = FileMetadata {
            id: Uuid::nil(),
            path: "Take.FLAC".to_string(),
            size: 0,
            modified: Utc::now(),
            checksum: [0u8; 32],
            audio: None,
        };
        assert_eq!(meta.extension().as_deref(), Some("flac"));

        meta.path = "Makefile".to_string();
        assert_eq!(meta.extension(), None);
    }
}
