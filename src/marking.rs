//! Marking envelope: the placeholder an external query analyzer leaves where
//! a field must be encrypted.
//!
//! Carried as a BSON binary of subtype 6 whose first content byte is 0; the
//! rest of the payload is a document:
//!
//! * `a`  — int32 algorithm tag
//! * `ki` — key UUID (binary), **or** `ka` — key alt name (string); exactly one
//! * `iv` — optional explicit IV (binary)
//! * `v`  — the value to encrypt

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::broker::{KeyIdentifier, KeyUuid};
use crate::crypto::Algorithm;
use crate::error::{Error, Result};

/// First content byte of a subtype-6 binary that holds a marking.
pub const MARKING_DISCRIMINATOR: u8 = 0;

/// A parsed (or synthesized) marking.
#[derive(Clone, Debug)]
pub struct Marking {
    pub key: KeyIdentifier,
    pub algorithm: Algorithm,
    pub iv: Option<Vec<u8>>,
    pub value: Bson,
}

/// Parse a marking payload (the bytes after the discriminator byte).
pub fn decode_marking(payload: &[u8]) -> Result<Marking> {
    let doc = Document::from_reader(payload)
        .map_err(|_| Error::malformed("malformed marking, invalid BSON"))?;

    let algorithm_raw = doc
        .get_i32("a")
        .map_err(|_| Error::malformed("malformed marking, missing algorithm"))?;
    let algorithm = u8::try_from(algorithm_raw)
        .ok()
        .and_then(Algorithm::from_wire)
        .ok_or_else(|| Error::malformed("malformed marking, unsupported algorithm"))?;

    let key = match (doc.get("ki"), doc.get("ka")) {
        (Some(_), Some(_)) => {
            return Err(Error::malformed(
                "malformed marking, cannot have both key id and key alt name",
            ));
        }
        (Some(Bson::Binary(bin)), None) => KeyIdentifier::Uuid(KeyUuid::from_bytes(&bin.bytes)?),
        (Some(_), None) => {
            return Err(Error::malformed("malformed marking, key id must be binary"));
        }
        (None, Some(Bson::String(name))) => KeyIdentifier::AltName(name.clone()),
        (None, Some(_)) => {
            return Err(Error::malformed("malformed marking, key alt name must be a string"));
        }
        (None, None) => {
            return Err(Error::malformed("malformed marking, no key id or key alt name"));
        }
    };

    let iv = match doc.get("iv") {
        None => None,
        Some(Bson::Binary(bin)) => Some(bin.bytes.clone()),
        Some(_) => return Err(Error::malformed("malformed marking, iv must be binary")),
    };

    let value = doc
        .get("v")
        .cloned()
        .ok_or_else(|| Error::malformed("malformed marking, no 'v'"))?;

    Ok(Marking { key, algorithm, iv, value })
}

/// Serialize a marking into full subtype-6 binary content (discriminator byte
/// included). The engine never emits markings itself; this is the counterpart
/// query analyzers and test fixtures use.
pub fn encode_marking(marking: &Marking) -> Result<Vec<u8>> {
    let mut doc = Document::new();
    doc.insert("a", marking.algorithm.as_wire() as i32);
    match &marking.key {
        KeyIdentifier::Uuid(uuid) => {
            doc.insert("ki", Bson::Binary(uuid.to_binary()));
        }
        KeyIdentifier::AltName(name) => {
            doc.insert("ka", name.clone());
        }
    }
    if let Some(iv) = &marking.iv {
        doc.insert(
            "iv",
            Bson::Binary(Binary { subtype: BinarySubtype::Generic, bytes: iv.clone() }),
        );
    }
    doc.insert("v", marking.value.clone());

    let mut out = vec![MARKING_DISCRIMINATOR];
    doc.to_writer(&mut out)
        .map_err(|e| Error::malformed(format!("failed to serialize marking: {}", e)))?;
    Ok(out)
}
