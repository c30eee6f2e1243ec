//! Recursive traversal of subtype-6 binary values inside a document tree.
//!
//! Both the encrypt and decrypt paths are driven by the same walk: find every
//! binary value of subtype 6 whose first content byte selects the wanted
//! discriminator, and either visit it (key collection) or replace it
//! (finalization). Embedded documents and arrays are recursed into; everything
//! else passes through untouched.

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Document};

use crate::error::{Error, Result};
use crate::marking::MARKING_DISCRIMINATOR;

/// Largest serialized document / replacement value the engine will emit.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024;

/// Which envelope a traversal is looking for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraverseMatch {
    /// First content byte 1 or 2. The callback receives the full envelope.
    Ciphertext,
    /// First content byte 0. The callback receives the payload after the
    /// discriminator byte.
    Marking,
}

impl TraverseMatch {
    fn matches(self, first: u8) -> bool {
        match self {
            TraverseMatch::Ciphertext => first == 1 || first == 2,
            TraverseMatch::Marking => first == MARKING_DISCRIMINATOR,
        }
    }

    fn payload(self, bytes: &[u8]) -> &[u8] {
        match self {
            TraverseMatch::Ciphertext => bytes,
            TraverseMatch::Marking => &bytes[1..],
        }
    }
}

fn candidate(bin: &Binary, mat: TraverseMatch) -> Option<&[u8]> {
    if bin.subtype != BinarySubtype::Encrypted {
        return None;
    }
    let first = *bin.bytes.first()?;
    mat.matches(first).then(|| mat.payload(&bin.bytes))
}

/// Visit every matching value. Short-circuits on the first callback failure.
pub fn traverse_binary<F>(doc: &Document, mat: TraverseMatch, visit: &mut F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    for (_, value) in doc {
        visit_value(value, mat, visit)?;
    }
    Ok(())
}

fn visit_value<F>(value: &Bson, mat: TraverseMatch, visit: &mut F) -> Result<()>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    match value {
        Bson::Binary(bin) => {
            if let Some(payload) = candidate(bin, mat) {
                visit(payload)?;
            }
        }
        Bson::Document(doc) => traverse_binary(doc, mat, visit)?,
        Bson::Array(items) => {
            for item in items {
                visit_value(item, mat, visit)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Rebuild the document, replacing every matching value with the callback's
/// result. Field names and order are preserved, as are array positions.
pub fn transform_binary<F>(doc: &Document, mat: TraverseMatch, replace: &mut F) -> Result<Document>
where
    F: FnMut(&[u8]) -> Result<Bson>,
{
    let mut out = Document::new();
    for (name, value) in doc {
        out.insert(name.clone(), transform_value(value, mat, replace)?);
    }
    Ok(out)
}

fn transform_value<F>(value: &Bson, mat: TraverseMatch, replace: &mut F) -> Result<Bson>
where
    F: FnMut(&[u8]) -> Result<Bson>,
{
    match value {
        Bson::Binary(bin) => match candidate(bin, mat) {
            Some(payload) => {
                let replacement = replace(payload)?;
                ensure_replacement_size(&replacement)?;
                Ok(replacement)
            }
            None => Ok(value.clone()),
        },
        Bson::Document(doc) => Ok(Bson::Document(transform_binary(doc, mat, replace)?)),
        Bson::Array(items) => items
            .iter()
            .map(|item| transform_value(item, mat, replace))
            .collect::<Result<Vec<_>>>()
            .map(Bson::Array),
        other => Ok(other.clone()),
    }
}

fn ensure_replacement_size(value: &Bson) -> Result<()> {
    let len = match value {
        Bson::Binary(bin) => bin.bytes.len(),
        Bson::String(s) => s.len(),
        _ => 0,
    };
    if len > MAX_DOCUMENT_LEN {
        return Err(Error::malformed("replacement value too large"));
    }
    Ok(())
}
