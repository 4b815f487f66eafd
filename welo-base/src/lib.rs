//! Base types and utilities for welo
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod base32;
pub mod block;
pub mod key;

pub use cid::Cid;

pub use self::block::{Block, BlockError};
pub use self::key::{KeyParsingError, PublicKey, SecretKey, Signature, SignatureError};
