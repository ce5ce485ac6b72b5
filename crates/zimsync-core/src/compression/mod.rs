//! Buffer compression for file transfers.
//!
//! Chunks are compressed independently so every datagram stays
//! self-contained. Compression is transparent: when the compressed form of a
//! buffer is not strictly smaller than the input, the input is sent verbatim
//! and no compression is signaled.
//!
//! The audio-aware policy never recompresses formats that already carry their
//! own compression (`mp3`, `m4a`, `aac`, `ogg`, `opus`, `flac`) and keeps a
//! compressed chunk only when it saves more than 10% of the input.

use std::io::{Read, Write};

use crate::error::{Error, Result};
use crate::protocol::CompressionType;

/// File extensions whose content is already compressed.
///
/// Chunks of these files are sent verbatim regardless of content.
pub const COMPRESSED_AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "aac", "ogg", "opus", "flac"];

/// Keep a compressed chunk only below this fraction of the input size.
const COMPRESSION_KEEP_RATIO: f64 = 0.9;

/// Compress a buffer with the given algorithm.
///
/// Returns `None` when compression was not applied: the algorithm is
/// [`CompressionType::None`], or the output was not strictly smaller than the
/// input.
///
/// # Errors
///
/// Returns an error if the underlying compressor fails.
pub fn compress(data: &[u8], algorithm: CompressionType) -> Result<Option<Vec<u8>>> {
    let compressed = match algorithm {
        CompressionType::None => return Ok(None),
        CompressionType::Zlib => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|()| encoder.finish())
                .map_err(|e| Error::Compression(format!("zlib compress failed: {e}")))?
        }
        CompressionType::Lz4 => lz4_flex::compress_prepend_size(data),
        CompressionType::Lzma => {
            let mut output = Vec::new();
            lzma_rs::lzma_compress(&mut std::io::Cursor::new(data), &mut output)
                .map_err(|e| Error::Compression(format!("lzma compress failed: {e}")))?;
            output
        }
    };

    if compressed.len() < data.len() {
        Ok(Some(compressed))
    } else {
        Ok(None)
    }
}

/// Decompress a buffer with the given algorithm.
///
/// # Errors
///
/// Returns an error if the data is not valid for the algorithm.
/// [`CompressionType::None`] returns the input unchanged.
pub fn decompress(data: &[u8], algorithm: CompressionType) -> Result<Vec<u8>> {
    match algorithm {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Zlib => {
            let mut decoder = flate2::read::ZlibDecoder::new(data);
            let mut output = Vec::new();
            decoder
                .read_to_end(&mut output)
                .map_err(|e| Error::Compression(format!("zlib decompress failed: {e}")))?;
            Ok(output)
        }
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| Error::Compression(format!("lz4 decompress failed: {e}"))),
        CompressionType::Lzma => {
            let mut output = Vec::new();
            lzma_rs::lzma_decompress(&mut std::io::Cursor::new(data), &mut output)
                .map_err(|e| Error::Compression(format!("lzma decompress failed: {e:?}")))?;
            Ok(output)
        }
    }
}

/// Whether an extension names an already-compressed audio format.
#[must_use]
pub fn is_compressed_audio_extension(extension: &str) -> bool {
    let lowered = extension.to_lowercase();
    COMPRESSED_AUDIO_EXTENSIONS.contains(&lowered.as_str())
}

/// Apply the audio-aware compression policy to one chunk.
///
/// Already-compressed audio formats are passed through untouched. Everything
/// else is compressed with `algorithm` and kept only when the result is
/// smaller than 90% of the input; otherwise the input is returned verbatim.
///
/// The returned algorithm is `Some` iff the returned bytes are compressed.
///
/// # Errors
///
/// Returns an error if the compressor fails.
pub fn compress_audio_chunk(
    data: &[u8],
    extension: Option<&str>,
    algorithm: CompressionType,
) -> Result<(Vec<u8>, Option<CompressionType>)> {
    if extension.is_some_and(is_compressed_audio_extension) {
        return Ok((data.to_vec(), None));
    }

    let Some(compressed) = compress(data, algorithm)? else {
        return Ok((data.to_vec(), None));
    };

    #[allow(clippy::cast_precision_loss)]
    if (compressed.len() as f64) < data.len() as f64 * COMPRESSION_KEEP_RATIO {
        Ok((compressed, Some(algorithm)))
    } else {
        Ok((data.to_vec(), None))
    }
}
