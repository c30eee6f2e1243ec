//! Ciphertext blob wire format.
//!
//! Layout, no padding:
//!   blob_subtype[1] || key_uuid[16] || original_bson_type[1] || ciphertext[1+]
//!
//! Carried as a BSON binary of subtype 6. `blob_subtype` is 1 (deterministic)
//! or 2 (randomized) and is validated before any other field is read.

use crate::error::{Error, Result};

/// Raw key UUID length.
pub const KEY_UUID_LEN: usize = 16;

/// Minimum blob size: subtype (1) + key_uuid (16) + original_bson_type (1) +
/// at least one ciphertext byte.
pub const MIN_CIPHERTEXT_LEN: usize = 19;

/// Offset of `original_bson_type` within the blob.
const BSON_TYPE_OFFSET: usize = 1 + KEY_UUID_LEN;

/// Borrowed view of a parsed ciphertext blob. Valid only as long as the bytes
/// it was parsed from.
#[derive(Debug, Clone, Copy)]
pub struct CiphertextView<'a> {
    pub blob_subtype: u8,
    pub key_uuid: &'a [u8; KEY_UUID_LEN],
    pub original_bson_type: u8,
    pub ciphertext: &'a [u8],
}

pub fn decode_ciphertext(data: &[u8]) -> Result<CiphertextView<'_>> {
    if data.len() < MIN_CIPHERTEXT_LEN {
        return Err(Error::malformed("malformed ciphertext, too small"));
    }

    let blob_subtype = data[0];
    if blob_subtype != 1 && blob_subtype != 2 {
        return Err(Error::malformed(
            "malformed ciphertext, expected blob subtype of 1 or 2",
        ));
    }

    let key_uuid: &[u8; KEY_UUID_LEN] = data[1..1 + KEY_UUID_LEN]
        .try_into()
        .map_err(|_| Error::malformed("malformed ciphertext, truncated key id"))?;

    Ok(CiphertextView {
        blob_subtype,
        key_uuid,
        original_bson_type: data[BSON_TYPE_OFFSET],
        ciphertext: &data[BSON_TYPE_OFFSET + 1..],
    })
}

pub fn encode_ciphertext(
    blob_subtype: u8,
    key_uuid: &[u8; KEY_UUID_LEN],
    original_bson_type: u8,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    if blob_subtype != 1 && blob_subtype != 2 {
        return Err(Error::malformed("blob subtype must be 1 or 2"));
    }
    if ciphertext.is_empty() {
        return Err(Error::malformed("empty ciphertext"));
    }

    let mut out = Vec::with_capacity(MIN_CIPHERTEXT_LEN - 1 + ciphertext.len());
    out.push(blob_subtype);
    out.extend_from_slice(key_uuid);
    out.push(original_bson_type);
    out.extend_from_slice(ciphertext);
    Ok(out)
}
