use crate::Compression;
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use flate2::{Compression as GzLevel, read::GzDecoder, write::GzEncoder};
use std::io::{Read, Write};
use tracing::{Span, instrument};

// Packed once by the uploader, unpacked by every peer that downloads it.
const GZIP_LEVEL: GzLevel = GzLevel::new(6);
#[cfg(feature = "zstd")]
const ZSTD_LEVEL: i32 = 3;

impl Compression {
    /// Pack a whole payload.
    ///
    /// ```
    /// use attire_compress::Compression;
    ///
    /// let packed = Compression::Lz4.compress(&[0u8; 256]).unwrap();
    /// assert!(packed.len() < 256);
    /// ```
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut packed = Vec::with_capacity(payload.len() / 2);
        self.compress_into(payload, &mut packed)?;
        Ok(packed)
    }

    /// Unpack a whole payload.
    pub fn decompress(&self, packed: &[u8]) -> Result<Vec<u8>> {
        let mut payload = Vec::new();
        self.decompress_into(packed, &mut payload)?;
        Ok(payload)
    }

    /// Append the packed form of `payload` to `out`, returning how many bytes
    /// were appended.
    #[instrument(skip_all, fields(codec = %self, from = payload.len(), to = tracing::field::Empty))]
    pub fn compress_into(&self, payload: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let start = out.len();
        match self {
            Compression::None => out.extend_from_slice(payload),
            Compression::Lz4 => out.extend_from_slice(&lz4_flex::block::compress_prepend_size(payload)),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(&mut *out, GZIP_LEVEL);
                encoder.write_all(payload).or_raise(|| ErrorKind::Write)?;
                encoder.finish().or_raise(|| ErrorKind::Write)?;
            },
            #[cfg(feature = "zstd")]
            Compression::Zstd => {
                let mut encoder = zstd::Encoder::new(&mut *out, ZSTD_LEVEL).or_raise(|| ErrorKind::Codec)?;
                encoder.write_all(payload).or_raise(|| ErrorKind::Write)?;
                encoder.finish().or_raise(|| ErrorKind::Write)?;
            },
        }
        let appended = out.len() - start;
        Span::current().record("to", appended);
        Ok(appended)
    }

    /// Append the unpacked form of `packed` to `out`, returning how many
    /// bytes were appended.
    #[instrument(skip_all, fields(codec = %self, from = packed.len(), to = tracing::field::Empty))]
    pub fn decompress_into(&self, packed: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let appended = match self {
            Compression::None => {
                out.extend_from_slice(packed);
                packed.len()
            },
            Compression::Lz4 => unpack_lz4(packed, out)?,
            Compression::Gzip => GzDecoder::new(packed).read_to_end(out).or_raise(|| ErrorKind::Corrupt)?,
            #[cfg(feature = "zstd")]
            Compression::Zstd => zstd::Decoder::new(packed)
                .or_raise(|| ErrorKind::Codec)?
                .read_to_end(out)
                .or_raise(|| ErrorKind::Corrupt)?,
        };
        Span::current().record("to", appended);
        Ok(appended)
    }
}

/// An LZ4 block carries its unpacked length as a little-endian `u32`. A block
/// that unpacks to anything else was cut short on the way.
fn unpack_lz4(packed: &[u8], out: &mut Vec<u8>) -> Result<usize> {
    let Some((prefix, _)) = packed.split_first_chunk::<4>() else {
        exn::bail!(ErrorKind::Corrupt);
    };
    let declared = u32::from_le_bytes(*prefix) as usize;
    let unpacked = lz4_flex::block::decompress_size_prepended(packed).or_raise(|| ErrorKind::Corrupt)?;
    if unpacked.len() != declared {
        exn::bail!(ErrorKind::Corrupt);
    }
    out.extend_from_slice(&unpacked);
    Ok(declared)
}
