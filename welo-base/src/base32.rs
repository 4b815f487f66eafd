//! Lowercase, unpadded base32 text forms used for keys and identifiers.

pub use data_encoding::{DecodeError, DecodeKind};

/// Convert to a base32 string
pub fn fmt(bytes: impl AsRef<[u8]>) -> String {
    let mut text = data_encoding::BASE32_NOPAD.encode(bytes.as_ref());
    text.make_ascii_lowercase();
    text
}

/// Convert to a base32 string limited to the first 5 bytes
pub fn fmt_short(bytes: impl AsRef<[u8]>) -> String {
    let len = bytes.as_ref().len().min(5);
    fmt(&bytes.as_ref()[..len])
}

/// Parse from a base32 string into a byte array
pub fn parse_array<const N: usize>(input: &str) -> Result<[u8; N], DecodeError> {
    data_encoding::BASE32_NOPAD
        .decode(input.to_ascii_uppercase().as_bytes())?
        .try_into()
        .map_err(|_| DecodeError {
            position: N,
            kind: DecodeKind::Length,
        })
}
