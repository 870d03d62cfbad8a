use crate::error::{ErrorKind, Result};
use crate::header::BlockHeader;
use crate::munge::munge_in_place;
use exn::ResultExt;
use std::io::Write;

/// Encoder for the container format, the counterpart to
/// [`ContainerReader`](crate::ContainerReader).
///
/// Payloads are written as given; compress them first.
pub struct ContainerWriter<W> {
    inner: W,
    munge: bool,
    scratch: Vec<u8>,
}

impl<W: Write> ContainerWriter<W> {
    /// Write plain, un-munged entries.
    pub fn new(inner: W) -> Self {
        Self { inner, munge: false, scratch: Vec::new() }
    }

    /// Write entries munged, ready to go on the wire.
    pub fn munged(inner: W) -> Self {
        Self { inner, munge: true, scratch: Vec::new() }
    }

    pub fn push(&mut self, hash: &str, payload: &[u8]) -> Result<()> {
        let header = BlockHeader::new(hash, payload.len() as u64);
        self.write(&header.encode())?;
        self.write(payload)
    }

    fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.munge {
            return self.inner.write_all(bytes).or_raise(|| ErrorKind::Io);
        }
        self.scratch.clear();
        self.scratch.extend_from_slice(bytes);
        munge_in_place(&mut self.scratch);
        self.inner.write_all(&self.scratch).or_raise(|| ErrorKind::Io)
    }

    pub fn finish(self) -> W {
        self.inner
    }
}
