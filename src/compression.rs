//! Body compression as negotiated in STARTUP.

use crate::error::{Error, Result};
use crate::options::Compression;

/// Compresses and decompresses frame bodies with the algorithm agreed on with the
/// server. Only the body is ever compressed; headers stay in the clear.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Compressor {
    algorithm: Compression,
}

impl Compressor {
    pub(crate) fn new(algorithm: Compression) -> Self {
        Self { algorithm }
    }

    #[allow(unused)]
    pub(crate) fn algorithm(&self) -> Compression {
        self.algorithm
    }

    pub(crate) fn compress(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            // The native protocol prefixes lz4 blocks with the uncompressed length as a
            // big-endian u32.
            #[cfg(feature = "lz4-compression")]
            Compression::Lz4 => {
                let mut out = Vec::with_capacity(body.len() / 2 + 4);
                out.extend_from_slice(&(body.len() as u32).to_be_bytes());
                out.extend_from_slice(&lz4_flex::compress(body));
                Ok(out)
            }
            #[cfg(feature = "snappy-compression")]
            Compression::Snappy => snap::raw::Encoder::new()
                .compress_vec(body)
                .map_err(|e| Error::internal(format!("snappy compression failed: {}", e))),
        }
    }

    pub(crate) fn decompress(&self, body: &[u8]) -> Result<Vec<u8>> {
        match self.algorithm {
            #[cfg(feature = "lz4-compression")]
            Compression::Lz4 => {
                if body.len() < 4 {
                    return Err(Error::protocol("lz4 body shorter than its length prefix"));
                }
                let uncompressed_length =
                    u32::from_be_bytes([body[0], body[1], body[2], body[3]]) as usize;
                if uncompressed_length > crate::frame::MAX_FRAME_LENGTH {
                    return Err(Error::protocol(format!(
                        "lz4 uncompressed length {} exceeds the frame cap",
                        uncompressed_length
                    )));
                }
                lz4_flex::decompress(&body[4..], uncompressed_length)
                    .map_err(|e| Error::protocol(format!("lz4 decompression failed: {}", e)))
            }
            #[cfg(feature = "snappy-compression")]
            Compression::Snappy => snap::raw::Decoder::new()
                .decompress_vec(body)
                .map_err(|e| Error::protocol(format!("snappy decompression failed: {}", e))),
        }
    }
}

#[cfg(all(test, feature = "lz4-compression"))]
mod test {
    use super::*;

    #[test]
    fn lz4_round_trips_with_length_prefix() {
        let compressor = Compressor::new(Compression::Lz4);
        let body = b"SELECT peer, data_center, rack FROM system.peers".repeat(20);
        let compressed = compressor.compress(&body).unwrap();
        assert!(compressed.len() < body.len());
        assert_eq!(
            u32::from_be_bytes([compressed[0], compressed[1], compressed[2], compressed[3]]),
            body.len() as u32
        );
        assert_eq!(compressor.decompress(&compressed).unwrap(), body);
    }

    #[test]
    fn truncated_lz4_prefix_is_a_protocol_error() {
        let compressor = Compressor::new(Compression::Lz4);
        assert!(compressor.decompress(&[0, 1]).is_err());
    }
}
