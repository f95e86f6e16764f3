//! Gzip helpers for whole content buffers.
//!
//! Content is small enough (bounded by the max-content-length guard) that
//! buffer-at-once compression is fine; no streaming API is exposed.

use async_compression::tokio::write::{GzipDecoder, GzipEncoder};
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

/// Gzip-compress `data`.
pub async fn compress(data: &[u8]) -> std::io::Result<Bytes> {
    let mut encoder = GzipEncoder::new(Vec::with_capacity(data.len() / 2 + 64));
    encoder.write_all(data).await?;
    encoder.shutdown().await?;
    Ok(Bytes::from(encoder.into_inner()))
}

/// Decompress gzipped `data`. Fails with an `io::Error` if the buffer is
/// not a valid gzip stream.
pub async fn decompress(data: &[u8]) -> std::io::Result<Bytes> {
    let mut decoder = GzipDecoder::new(Vec::with_capacity(data.len() * 2));
    decoder.write_all(data).await?;
    decoder.shutdown().await?;
    Ok(Bytes::from(decoder.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_roundtrip() {
        let data = b"hello hello hello hello hello hello hello hello";
        let compressed = compress(data).await.unwrap();
        assert_ne!(compressed.as_ref(), data.as_ref());
        let decompressed = decompress(&compressed).await.unwrap();
        assert_eq!(decompressed.as_ref(), data.as_ref());
    }

    #[tokio::test]
    async fn test_repetitive_input_shrinks() {
        let data = vec![0u8; 64 * 1024];
        let compressed = compress(&data).await.unwrap();
        assert!(compressed.len() < data.len());
    }

    #[tokio::test]
    async fn test_empty_roundtrip() {
        let compressed = compress(b"").await.unwrap();
        let decompressed = decompress(&compressed).await.unwrap();
        assert!(decompressed.is_empty());
    }

    #[tokio::test]
    async fn test_decompress_garbage_fails() {
        assert!(decompress(b"definitely not gzip").await.is_err());
    }
}
