//! Compression of tile layer payloads

use byteorder::{ByteOrder, LittleEndian};
use tilecache_common::{Error, Result};

/// Compresses and decompresses the grid payload of a tile layer blob
pub trait TileCacheCompressor: Send + Sync {
    /// Upper bound of the compressed size for a buffer of `buffer_size` bytes
    fn max_compressed_size(&self, buffer_size: usize) -> usize;

    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data, which must unpack to exactly `expected_size` bytes
    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>>;
}

/// LZ4 compressor implementation using lz4_flex
#[derive(Debug, Default, Clone, Copy)]
pub struct Lz4Compressor;

impl TileCacheCompressor for Lz4Compressor {
    fn max_compressed_size(&self, buffer_size: usize) -> usize {
        // Size prefix plus the block bound
        4 + lz4_flex::block::get_maximum_output_size(buffer_size)
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        if data.len() < 4 {
            return Err(Error::Codec("missing size prefix".to_string()));
        }
        let (prefix, block) = data.split_at(4);
        let size = LittleEndian::read_u32(prefix) as usize;
        if size != expected_size {
            return Err(Error::Codec(format!(
                "size prefix {} does not match the expected {} bytes",
                size, expected_size
            )));
        }

        let mut out = vec![0u8; expected_size];
        let written = lz4_flex::block::decompress_into(block, &mut out)
            .map_err(|e| Error::Codec(e.to_string()))?;
        if written != expected_size {
            return Err(Error::Codec(format!(
                "decompressed {} of {} bytes",
                written, expected_size
            )));
        }
        Ok(out)
    }
}

/// Stores the payload as-is
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCompressor;

impl TileCacheCompressor for NoopCompressor {
    fn max_compressed_size(&self, buffer_size: usize) -> usize {
        buffer_size
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
        if data.len() != expected_size {
            return Err(Error::Codec(format!(
                "expected {} bytes, got {}",
                expected_size,
                data.len()
            )));
        }
        Ok(data.to_vec())
    }
}
