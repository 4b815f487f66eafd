use integer_encoding::{VarIntAsyncReader, VarIntAsyncWriter};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use welo_base::{Block, Cid};

use crate::error::Error;

/// Maximum size that is used for single node.
pub(crate) const MAX_ALLOC: usize = 4 * 1024 * 1024;

/// Read one length-delimited section into `buf`, `None` at a clean end of stream.
pub(crate) async fn ld_read<R>(mut reader: R, buf: &mut Vec<u8>) -> Result<Option<&[u8]>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let length: usize = match VarIntAsyncReader::read_varint_async(&mut reader).await {
        Ok(len) => len,
        Err(e) => {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(None);
            }
            return Err(Error::Parsing(e.to_string()));
        }
    };

    if length > MAX_ALLOC {
        return Err(Error::LdReadTooLarge(length));
    }
    if length > buf.len() {
        buf.resize(length, 0);
    }

    reader
        .read_exact(&mut buf[..length])
        .await
        .map_err(|e| Error::Parsing(e.to_string()))?;

    Ok(Some(&buf[..length]))
}

/// Write one length-delimited section made of `parts`.
pub(crate) async fn ld_write<W>(writer: &mut W, parts: &[&[u8]]) -> Result<(), Error>
where
    W: AsyncWrite + Send + Unpin,
{
    let len = parts.iter().map(|p| p.len()).sum::<usize>();
    writer.write_varint_async(len).await?;
    for part in parts {
        writer.write_all(part).await?;
    }
    Ok(())
}

/// Read the next block section, verifying its bytes against the identifier.
pub(crate) async fn read_block<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<Block>, Error>
where
    R: AsyncRead + Send + Unpin,
{
    let Some(section) = ld_read(reader, buf).await? else {
        return Ok(None);
    };
    let mut cursor = std::io::Cursor::new(section);
    let cid = Cid::read_bytes(&mut cursor)?;
    let pos = cursor.position() as usize;
    let block = Block::from_parts(cid, section[pos..].to_vec())?;
    Ok(Some(block))
}
