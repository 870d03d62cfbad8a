//! The block container: many compressed files concatenated into one stream.
//!
//! A batched download is a sequence of entries, each a small text header
//! followed by the compressed payload:
//!
//! ```text
//! #<hash>:<decimal payload length>#<payload bytes>#<hash>:<length>#<payload>...
//! ```
//!
//! On the wire the whole stream, headers included, is XOR'd with a constant
//! key ([`MUNGE_KEY`]). That's there to stop intermediaries from recognising
//! and mangling or caching the payloads; it is not encryption.
//!
//! Munging lives at the stream boundary ([`MungeReader`], [`munge_in_place`])
//! so the framing code only ever sees plain bytes:
//!
//! ```
//! use attire_compress::Compression;
//! use attire_container::{ContainerReader, ContainerWriter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let payload = Compression::Lz4.compress(b"mesh data").unwrap();
//! let mut writer = ContainerWriter::munged(Vec::new());
//! writer.push("A94A8FE5CCB19BA61C4C0873D391E987982FBBD3", &payload).unwrap();
//! let bytes = writer.finish();
//!
//! let mut reader = ContainerReader::munged(bytes.as_slice());
//! let block = reader.next_block().await.unwrap().unwrap();
//! assert_eq!(block.decompress(Compression::Lz4).unwrap(), b"mesh data");
//! assert!(reader.next_block().await.unwrap().is_none());
//! # }
//! ```
//!
//! Framing is strictly sequential. Once a header or payload is cut short, the
//! position of every following entry is unknown, so the reader stops for good.

pub mod error;
mod header;
mod munge;
mod reader;
mod writer;

pub use crate::header::BlockHeader;
pub use crate::munge::{MUNGE_KEY, MungeReader, munge_in_place, munged};
pub use crate::reader::{Block, ContainerReader};
pub use crate::writer::ContainerWriter;
