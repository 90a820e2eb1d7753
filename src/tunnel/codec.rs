//! Compression codec seeded with a fixed preset dictionary
//!
//! Both ends of the tunnel share the dictionary out of band, so short HTTP
//! messages compress to a handful of chunks.

use std::io::Write;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use flate2::write::ZlibEncoder;
use flate2::{Compress, Compression, Decompress, FlushDecompress, Status};
use once_cell::sync::Lazy;

use crate::error::{Result, TunnelError};

/// Size of the shared preset dictionary in bytes
pub const DICTIONARY_LEN: usize = 8192;

/// Shared preset dictionary, decoded once.
///
/// The text is embedded at build time, so a decode failure means a broken
/// build and is not recoverable.
static DICTIONARY: Lazy<Bytes> = Lazy::new(|| {
    decode_dictionary(include_str!("dictionary.b64"))
        .unwrap_or_else(|e| panic!("embedded compression dictionary is corrupt: {}", e))
});

/// Decode line-wrapped base64 dictionary text
fn decode_dictionary(text: &str) -> Result<Bytes> {
    let joined: String = text.lines().map(str::trim).collect();
    let bytes = STANDARD
        .decode(joined)
        .map_err(|e| TunnelError::Codec(format!("dictionary is not valid base64: {}", e)))?;
    if bytes.len() != DICTIONARY_LEN {
        return Err(TunnelError::Codec(format!(
            "dictionary is {} bytes, expected {}",
            bytes.len(),
            DICTIONARY_LEN
        )));
    }
    Ok(Bytes::from(bytes))
}

/// The preset dictionary both tunnel ends compress against
pub fn dictionary() -> Bytes {
    DICTIONARY.clone()
}

/// zlib (level 9) compressor/decompressor bound to one dictionary
#[derive(Debug, Clone)]
pub struct ZlibCodec {
    dictionary: Bytes,
}

impl ZlibCodec {
    pub fn new(dictionary: impl Into<Bytes>) -> Self {
        Self {
            dictionary: dictionary.into(),
        }
    }

    /// Compress `data` as one complete zlib stream
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut deflate = Compress::new(Compression::best(), true);
        deflate
            .set_dictionary(&self.dictionary)
            .map_err(|e| TunnelError::Codec(format!("cannot set dictionary: {}", e)))?;

        let mut encoder = ZlibEncoder::new_with_compress(Vec::with_capacity(data.len() / 2 + 64), deflate);
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map_err(|e| TunnelError::Codec(format!("compression failed: {}", e)))
    }

    /// Decompress a zlib stream.
    ///
    /// A truncated stream yields whatever output it produced; a corrupt
    /// stream or a dictionary mismatch is an error.
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut inflate = Decompress::new(true);
        let mut out = Vec::with_capacity(data.len().saturating_mul(4).max(4096));

        loop {
            if out.capacity() - out.len() < 1024 {
                out.reserve(out.capacity());
            }
            let consumed = inflate.total_in() as usize;
            let produced = inflate.total_out();

            match inflate.decompress_vec(&data[consumed..], &mut out, FlushDecompress::Sync) {
                Ok(Status::StreamEnd) => break,
                Ok(_) => {
                    if inflate.total_in() as usize == consumed && inflate.total_out() == produced {
                        break;
                    }
                }
                Err(e) if e.needs_dictionary().is_some() => {
                    inflate
                        .set_dictionary(&self.dictionary)
                        .map_err(|e| TunnelError::Codec(format!("dictionary mismatch: {}", e)))?;
                }
                Err(e) => return Err(TunnelError::Codec(format!("corrupt stream: {}", e))),
            }
        }

        Ok(out)
    }
}

impl Default for ZlibCodec {
    fn default() -> Self {
        Self::new(dictionary())
    }
}
