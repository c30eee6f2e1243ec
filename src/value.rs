//! BSON value <-> raw element bytes.
//!
//! A ciphertext blob stores the plaintext as the bare value bytes of a BSON
//! element plus its type tag. These helpers frame such bytes through a
//! single-element document with an empty key:
//!
//!   int32 total || type[1] || 0x00 (empty cstring key) || value bytes || 0x00

use bson::{Bson, Document};

use crate::error::{Error, Result};

/// Document framing overhead around a single empty-key element:
/// length prefix (4) + type tag (1) + key terminator (1) ... trailing NUL (1).
const PREFIX_LEN: usize = 4 + 1 + 1;
const SUFFIX_LEN: usize = 1;

/// Serialize a value into `(element_type, value_bytes)`.
pub fn encode_value(value: &Bson) -> Result<(u8, Vec<u8>)> {
    let mut doc = Document::new();
    doc.insert("", value.clone());

    let mut buf = Vec::new();
    doc.to_writer(&mut buf)
        .map_err(|e| Error::malformed(format!("failed to serialize value: {}", e)))?;

    let tag = buf[4];
    let bytes = buf[PREFIX_LEN..buf.len() - SUFFIX_LEN].to_vec();
    Ok((tag, bytes))
}

/// Re-interpret raw value bytes as a BSON value of the given element type.
pub fn decode_value(element_type: u8, bytes: &[u8]) -> Result<Bson> {
    let total = PREFIX_LEN + bytes.len() + SUFFIX_LEN;
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(total as i32).to_le_bytes());
    buf.push(element_type);
    buf.push(0);
    buf.extend_from_slice(bytes);
    buf.push(0);

    let mut doc = Document::from_reader(&buf[..])
        .map_err(|_| Error::malformed("malformed encrypted bson"))?;
    doc.remove("")
        .ok_or_else(|| Error::malformed("malformed encrypted bson"))
}
