//! Compression interface (C5 dependency): two pure functions, no codec
//! shipped by the core. The algorithm identifier is an opaque string the
//! core never interprets beyond passing it back to `decompress`.

use crate::error::{CacheError, ErrorKind};

/// A compressed payload plus the algorithm identifier needed to reverse it.
#[derive(Debug, Clone)]
pub struct CompressedBlob {
    pub data: Vec<u8>,
    pub algorithm: &'static str,
}

/// Pure compress/decompress pair. Implementations are expected to be
/// deterministic and infallible on well-formed input; failures map to
/// `ErrorKind::CompressionError` / `ErrorKind::DataIntegrityError`.
pub trait Compressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<CompressedBlob, CacheError>;
    fn decompress(&self, data: &[u8], algorithm: &str) -> Result<Vec<u8>, CacheError>;
}

/// A compressor that never actually compresses; useful as a default when an
/// application has not wired in a real codec, and in tests. Storing through
/// it still exercises the `compressed` bookkeeping path end to end.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityCompressor;

const IDENTITY_ALGORITHM: &str = "identity";

impl Compressor for IdentityCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<CompressedBlob, CacheError> {
        Ok(CompressedBlob {
            data: bytes.to_vec(),
            algorithm: IDENTITY_ALGORITHM,
        })
    }

    fn decompress(&self, data: &[u8], algorithm: &str) -> Result<Vec<u8>, CacheError> {
        if algorithm != IDENTITY_ALGORITHM {
            return Err(CacheError::new(
                ErrorKind::DataIntegrityError,
                format!("unknown compression algorithm {algorithm}"),
            ));
        }
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trips() {
        let c = IdentityCompressor;
        let blob = c.compress(b"hello").unwrap();
        assert_eq!(c.decompress(&blob.data, blob.algorithm).unwrap(), b"hello");
    }

    #[test]
    fn decompress_rejects_unknown_algorithm() {
        let c = IdentityCompressor;
        let err = c.decompress(b"x", "zstd").unwrap_err();
        assert_eq!(err.kind, ErrorKind::DataIntegrityError);
    }
}
