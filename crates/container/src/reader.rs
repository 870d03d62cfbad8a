use crate::error::{ErrorKind, Result};
use crate::header::{BlockHeader, MARKER, MAX_HASH_LEN, MAX_LENGTH_DIGITS, SEPARATOR};
use crate::munge::MungeReader;
use attire_compress::Compression;
use exn::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};

/// One entry recovered from a container: the header and its still-compressed
/// payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub payload: Vec<u8>,
}

impl Block {
    pub fn hash(&self) -> &str {
        &self.header.hash
    }

    /// Decompress the payload back into the original file bytes.
    pub fn decompress(&self, compression: Compression) -> Result<Vec<u8>> {
        compression.decompress(&self.payload).or_raise(|| ErrorKind::Decompression)
    }
}

/// Sequential decoder for the container format.
///
/// Reads plain bytes; wrap the transport in [`MungeReader`] (or use
/// [`ContainerReader::munged`]) when reading straight off the wire.
///
/// After the first error the reader is finished: every later call to
/// [`next_block`](Self::next_block) returns `Ok(None)`, because the start of
/// the next header can no longer be located.
pub struct ContainerReader<R> {
    inner: BufReader<R>,
    finished: bool,
    blocks_read: usize,
}

impl<R: AsyncRead + Unpin> ContainerReader<MungeReader<R>> {
    /// Decode a container that's still munged (i.e. straight off the wire).
    pub fn munged(reader: R) -> Self {
        Self::new(MungeReader::new(reader))
    }
}

impl<R: AsyncRead + Unpin> ContainerReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            finished: false,
            blocks_read: 0,
        }
    }

    /// Number of entries successfully decoded so far.
    pub fn blocks_read(&self) -> usize {
        self.blocks_read
    }

    /// Read the next entry, or `None` once the container is exhausted.
    pub async fn next_block(&mut self) -> Result<Option<Block>> {
        if self.finished {
            return Ok(None);
        }
        match self.read_block().await {
            Ok(Some(block)) => {
                self.blocks_read += 1;
                Ok(Some(block))
            },
            Ok(None) => {
                self.finished = true;
                Ok(None)
            },
            Err(err) => {
                self.finished = true;
                tracing::warn!(blocks_read = self.blocks_read, error = ?err, "Container framing lost; abandoning remaining entries");
                Err(err)
            },
        }
    }

    async fn read_block(&mut self) -> Result<Option<Block>> {
        // A clean end of stream is only allowed where a header would start.
        let Some(first) = self.next_byte().await? else {
            return Ok(None);
        };
        if first != MARKER {
            exn::bail!(ErrorKind::MalformedHeader(format!("expected '#', found byte {first:#04x}")));
        }

        let mut hash = String::new();
        loop {
            let byte = self.next_byte().await?.ok_or(ErrorKind::Truncated("block header"))?;
            if byte == SEPARATOR {
                break;
            }
            if hash.len() >= MAX_HASH_LEN {
                exn::bail!(ErrorKind::MalformedHeader("hash too long".to_string()));
            }
            hash.push(char::from(byte));
        }

        let mut digits = String::new();
        loop {
            let byte = self.next_byte().await?.ok_or(ErrorKind::Truncated("block header"))?;
            if byte == MARKER {
                break;
            }
            if !byte.is_ascii_digit() || digits.len() >= MAX_LENGTH_DIGITS {
                exn::bail!(ErrorKind::MalformedHeader(format!("invalid length for block {hash}")));
            }
            digits.push(char::from(byte));
        }
        let length = digits
            .parse::<u64>()
            .or_raise(|| ErrorKind::MalformedHeader(format!("invalid length for block {hash}")))?;

        let mut payload = Vec::new();
        let read = (&mut self.inner).take(length).read_to_end(&mut payload).await.or_raise(|| ErrorKind::Io)?;
        if (read as u64) < length {
            exn::bail!(ErrorKind::Truncated("block payload"));
        }
        tracing::trace!(hash = %hash, length, "Decoded container block");
        Ok(Some(Block { header: BlockHeader { hash, length }, payload }))
    }

    async fn next_byte(&mut self) -> Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let read = self.inner.read(&mut byte).await.or_raise(|| ErrorKind::Io)?;
        Ok((read == 1).then_some(byte[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::munge::munged;
    use crate::writer::ContainerWriter;
    use rstest::rstest;

    fn hash_for(index: usize) -> String {
        format!("{index:040X}")
    }

    fn blob(index: usize) -> Vec<u8> {
        (0..(index * 37 % 500)).map(|i| (i * index % 251) as u8).collect()
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(50)]
    #[tokio::test]
    async fn test_container_round_trip(#[case] count: usize) {
        let mut writer = ContainerWriter::munged(Vec::new());
        let mut expected = Vec::new();
        for index in 0..count {
            let original = blob(index);
            let payload = Compression::Lz4.compress(&original).unwrap();
            writer.push(&hash_for(index), &payload).unwrap();
            expected.push((hash_for(index), payload.len() as u64, original));
        }
        let bytes = writer.finish();

        let mut reader = ContainerReader::munged(bytes.as_slice());
        let mut decoded = Vec::new();
        while let Some(block) = reader.next_block().await.unwrap() {
            let content = block.decompress(Compression::Lz4).unwrap();
            decoded.push((block.header.hash, block.header.length, content));
        }
        assert_eq!(decoded, expected);
        assert_eq!(reader.blocks_read(), count);
    }

    #[tokio::test]
    async fn test_plain_stream() {
        let bytes = b"#AB:3#xyz#CD:0#".to_vec();
        let mut reader = ContainerReader::new(bytes.as_slice());
        let first = reader.next_block().await.unwrap().unwrap();
        assert_eq!(first.hash(), "AB");
        assert_eq!(first.payload, b"xyz");
        let second = reader.next_block().await.unwrap().unwrap();
        assert_eq!(second.hash(), "CD");
        assert!(second.payload.is_empty());
        assert!(reader.next_block().await.unwrap().is_none());
    }

    #[rstest]
    #[case::header_cut_in_hash(b"#ABCD".as_slice(), ErrorKind::Truncated("block header"))]
    #[case::header_cut_in_length(b"#ABCD:12".as_slice(), ErrorKind::Truncated("block header"))]
    #[case::payload_short(b"#ABCD:12#short".as_slice(), ErrorKind::Truncated("block payload"))]
    #[tokio::test]
    async fn test_truncation(#[case] plain: &[u8], #[case] expected: ErrorKind) {
        let wire = munged(plain);
        let mut reader = ContainerReader::munged(wire.as_slice());
        let err = reader.next_block().await.unwrap_err();
        assert_eq!(*err, expected);
        assert!(err.is_corruption());
    }

    #[rstest]
    #[case::no_marker(b"ABCD:1#x".as_slice())]
    #[case::bad_digit(b"#ABCD:1x#x".as_slice())]
    #[case::empty_length(b"#ABCD:#x".as_slice())]
    #[tokio::test]
    async fn test_malformed_header(#[case] plain: &[u8]) {
        let mut reader = ContainerReader::new(plain);
        let err = reader.next_block().await.unwrap_err();
        assert!(matches!(*err, ErrorKind::MalformedHeader(_)));
    }

    #[tokio::test]
    async fn test_reader_stops_after_corruption() {
        let mut plain = b"#AA:1#a".to_vec();
        // Declares more payload than remains.
        plain.extend_from_slice(b"#BB:9#bb");
        let mut reader = ContainerReader::new(plain.as_slice());
        assert_eq!(reader.next_block().await.unwrap().unwrap().hash(), "AA");
        assert!(reader.next_block().await.is_err());
        assert!(reader.next_block().await.unwrap().is_none());
        assert_eq!(reader.blocks_read(), 1);
    }

    #[tokio::test]
    async fn test_undecompressable_payload() {
        let plain = b"#AA:3#abc".to_vec();
        let mut reader = ContainerReader::new(plain.as_slice());
        let block = reader.next_block().await.unwrap().unwrap();
        let err = block.decompress(Compression::Lz4).unwrap_err();
        assert_eq!(*err, ErrorKind::Decompression);
    }
}
