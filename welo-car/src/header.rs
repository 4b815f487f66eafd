use libipld::{cbor::DagCborCodec, codec::Codec, DagCbor};
use welo_base::Cid;

use crate::error::Error;

/// The only archive version we read or write.
const VERSION: u64 = 1;

/// A car header.
///
/// Only version 1 exists; an archive must name at least one root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarHeader {
    roots: Vec<Cid>,
}

/// Wire form of the header.
#[derive(Debug, Clone, Default, DagCbor, PartialEq, Eq)]
struct CarHeaderV1 {
    roots: Vec<Cid>,
    version: u64,
}

impl CarHeader {
    /// Creates a version 1 header for `roots`.
    pub fn new(roots: Vec<Cid>) -> Self {
        Self { roots }
    }

    pub(crate) fn decode(buffer: &[u8]) -> Result<Self, Error> {
        let header: CarHeaderV1 = DagCborCodec
            .decode(buffer)
            .map_err(|e| Error::Parsing(e.to_string()))?;

        if header.roots.is_empty() {
            return Err(Error::Parsing("empty CAR file".to_owned()));
        }

        if header.version != VERSION {
            return Err(Error::InvalidFile(format!(
                "only CAR version {VERSION} is supported, found {}",
                header.version
            )));
        }

        Ok(Self {
            roots: header.roots,
        })
    }

    pub(crate) fn encode(&self) -> Result<Vec<u8>, Error> {
        let header = CarHeaderV1 {
            roots: self.roots.clone(),
            version: VERSION,
        };
        DagCborCodec
            .encode(&header)
            .map_err(|e| Error::Encoding(e.to_string()))
    }

    /// The root identifiers named by the archive.
    pub fn roots(&self) -> &[Cid] {
        &self.roots
    }
}
