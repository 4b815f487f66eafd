use std::collections::HashSet;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use welo_base::{Block, Cid};

use crate::{error::Error, header::CarHeader, util::ld_write};

/// Streams blocks into a CAR v1 archive.
///
/// The header is written lazily with the first block (or on [`CarWriter::finish`] for an
/// archive without blocks). A block whose identifier was already written is skipped.
#[derive(Debug)]
pub struct CarWriter<W> {
    header: CarHeader,
    writer: W,
    written: HashSet<Cid>,
    is_header_written: bool,
}

impl<W> CarWriter<W>
where
    W: AsyncWrite + Send + Unpin,
{
    /// Creates a writer that emits `header` followed by the blocks passed to [`Self::write`].
    pub fn new(header: CarHeader, writer: W) -> Self {
        CarWriter {
            header,
            writer,
            written: HashSet::new(),
            is_header_written: false,
        }
    }

    async fn write_header(&mut self) -> Result<(), Error> {
        if !self.is_header_written {
            let header_bytes = self.header.encode()?;
            ld_write(&mut self.writer, &[&header_bytes[..]]).await?;
            self.is_header_written = true;
        }
        Ok(())
    }

    /// Appends a block. Returns `false` if the block was already part of the archive.
    pub async fn write(&mut self, block: &Block) -> Result<bool, Error> {
        self.write_header().await?;
        if !self.written.insert(*block.cid()) {
            return Ok(false);
        }
        let cid = block.cid().to_bytes();
        ld_write(&mut self.writer, &[&cid[..], &block.data()[..]]).await?;
        Ok(true)
    }

    /// Number of distinct blocks written so far.
    pub fn len(&self) -> usize {
        self.written.len()
    }

    /// Whether no block was written yet.
    pub fn is_empty(&self) -> bool {
        self.written.is_empty()
    }

    /// Finishes writing, including flushing and returns the writer.
    pub async fn finish(mut self) -> Result<W, Error> {
        self.write_header().await?;
        self.writer.flush().await?;
        Ok(self.writer)
    }
}
