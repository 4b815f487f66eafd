use futures::Stream;
use tokio::io::AsyncRead;
use welo_base::Block;

use crate::{
    error::Error,
    header::CarHeader,
    util::{ld_read, read_block},
};

/// Reads CAR v1 archives, yielding verified [`Block`]s.
#[derive(Debug)]
pub struct CarReader<R> {
    reader: R,
    header: CarHeader,
    buffer: Vec<u8>,
}

impl<R> CarReader<R>
where
    R: AsyncRead + Send + Unpin,
{
    /// Creates a new CarReader and parses the CarHeader
    pub async fn new(mut reader: R) -> Result<Self, Error> {
        let mut buffer = Vec::new();

        let Some(header) = ld_read(&mut reader, &mut buffer).await? else {
            return Err(Error::Parsing(
                "failed to parse uvarint for header".to_string(),
            ));
        };
        let header = CarHeader::decode(header)?;

        Ok(CarReader {
            reader,
            header,
            buffer,
        })
    }

    /// Returns the header of this car file.
    pub fn header(&self) -> &CarHeader {
        &self.header
    }

    /// Returns the next block, `None` once the archive is exhausted.
    pub async fn next_block(&mut self) -> Result<Option<Block>, Error> {
        read_block(&mut self.reader, &mut self.buffer).await
    }

    /// Turns the reader into a stream of blocks.
    pub fn stream(self) -> impl Stream<Item = Result<Block, Error>> {
        futures::stream::try_unfold(self, |mut this| async move {
            let maybe_block = this.next_block().await?;
            Ok(maybe_block.map(|b| (b, this)))
        })
    }
}
