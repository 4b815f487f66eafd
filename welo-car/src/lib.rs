//! Content-addressed archives.
//!
//! An archive is a CAR v1 stream: a length-prefixed DAG-CBOR header naming the root
//! identifiers, followed by length-prefixed `(cid, bytes)` sections. Uploads bundle every block
//! a peer needs to move from one index root to another into one archive.

mod error;
mod header;
mod reader;
mod util;
mod writer;

pub use crate::error::Error;
pub use crate::header::CarHeader;
pub use crate::reader::CarReader;
pub use crate::writer::CarWriter;

use welo_base::{Block, Cid};

/// Write `blocks` into an in-memory archive rooted at `root`.
///
/// Duplicate blocks are written once.
pub async fn pack(root: Cid, blocks: impl IntoIterator<Item = Block>) -> Result<Vec<u8>, Error> {
    let mut writer = CarWriter::new(CarHeader::new(vec![root]), Vec::new());
    for block in blocks {
        writer.write(&block).await?;
    }
    writer.finish().await
}

/// Read every block of an in-memory archive, verifying each one against its identifier.
pub async fn unpack(bytes: &[u8]) -> Result<(CarHeader, Vec<Block>), Error> {
    let mut reader = CarReader::new(bytes).await?;
    let mut blocks = Vec::new();
    while let Some(block) = reader.next_block().await? {
        blocks.push(block);
    }
    Ok((reader.header().clone(), blocks))
}
