//! Key broker: per-context coordinator for document-key acquisition.
//!
//! Accumulates the set of key identifiers a context needs, deduplicates the
//! fetches through the engine-wide key cache (the first context to ask for an
//! identifier owns the fetch; later ones become dependents), ingests key-vault
//! documents, hands the encrypted key material to the caller as opaque
//! key-management requests, and serves the decrypted material back out.

use std::fmt;
use std::sync::Arc;

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use zeroize::Zeroizing;

use crate::cache::{Cache, PairState};
use crate::ciphertext::KEY_UUID_LEN;
use crate::crypto::KeyMaterial;
use crate::error::{Error, Result};

/// Upper bound on distinct identifiers a single broker will track.
pub const MAX_KEYS_PER_BROKER: usize = 64;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Raw 16-byte document-key UUID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyUuid([u8; KEY_UUID_LEN]);

impl KeyUuid {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; KEY_UUID_LEN] = bytes
            .try_into()
            .map_err(|_| Error::malformed("key id must be 16 bytes"))?;
        Ok(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_UUID_LEN] {
        &self.0
    }

    /// BSON binary representation (subtype 4, UUID).
    pub fn to_binary(&self) -> Binary {
        Binary { subtype: BinarySubtype::Uuid, bytes: self.0.to_vec() }
    }
}

impl From<[u8; KEY_UUID_LEN]> for KeyUuid {
    fn from(raw: [u8; KEY_UUID_LEN]) -> Self {
        Self(raw)
    }
}

impl fmt::Display for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyUuid({})", hex::encode(self.0))
    }
}

/// How a key is referred to before resolution: by UUID or by alternate name.
/// The two namespaces merge once a key document naming both arrives.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyIdentifier {
    Uuid(KeyUuid),
    AltName(String),
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyIdentifier::Uuid(uuid) => write!(f, "id {}", uuid),
            KeyIdentifier::AltName(name) => write!(f, "alt name \"{}\"", name),
        }
    }
}

/// Engine-wide cache of decrypted key material, keyed by identifier.
pub type KeyCache = Cache<KeyIdentifier, KeyMaterial>;

// ---------------------------------------------------------------------------
// Entries
// ---------------------------------------------------------------------------

/// Lifecycle of a broker entry.
///
/// ```text
/// ADDED ──→ REQUESTED ──→ KMS_PENDING ──→ DECRYPTED
///   │                          │
///   └── (cache hit) ───────────┴──→ DECRYPTED      REQUESTED ──→ NOT_FOUND
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyEntryState {
    /// Known to be needed; another context owns the fetch.
    Added,
    /// This context owns the fetch; the key document has not arrived yet.
    Requested,
    /// Key document ingested; encrypted material awaits the KMS round-trip.
    KmsPending,
    /// Material decrypted and published.
    Decrypted,
    /// The key vault returned no document for this identifier.
    NotFound,
}

struct KeyEntry {
    uuid: Option<KeyUuid>,
    alt_names: Vec<String>,
    /// Cache keys this entry was requested under (grows when a UUID entry and
    /// an alt-name entry merge).
    cache_keys: Vec<KeyIdentifier>,
    state: KeyEntryState,
    owner: u32,
    encrypted_material: Option<Vec<u8>>,
    material: Option<Arc<KeyMaterial>>,
    kms_taken: bool,
    kms_fed: bool,
}

impl KeyEntry {
    fn matches_uuid(&self, uuid: &KeyUuid) -> bool {
        self.uuid.as_ref() == Some(uuid)
    }

    fn matches_name(&self, name: &str) -> bool {
        self.alt_names.iter().any(|n| n == name)
    }
}

/// Overall broker disposition, input to the context's next-state decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BrokerReadiness {
    /// Every entry is decrypted (or conclusively absent from the vault).
    Ready,
    /// This context owns fetches that have not been performed yet.
    NeedKeys,
    /// Key documents arrived; their material awaits KMS decryption.
    NeedKms,
    /// All remaining entries are owned by other contexts.
    Waiting,
}

/// One opaque key-management round-trip: the caller sends [`message`] to its
/// KMS however it likes and feeds the decrypted reply back through
/// `Context::kms_feed`.
///
/// [`message`]: KmsRequest::message
pub struct KmsRequest {
    pub(crate) entry: usize,
    message: Vec<u8>,
}

impl KmsRequest {
    pub fn message(&self) -> &[u8] {
        &self.message
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

pub struct KeyBroker {
    ctx_id: u32,
    cache: Arc<KeyCache>,
    entries: Vec<KeyEntry>,
    next_dep: usize,
}

impl KeyBroker {
    pub fn new(ctx_id: u32, cache: Arc<KeyCache>) -> Self {
        Self { ctx_id, cache, entries: Vec::new(), next_dep: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Request a key by UUID. Repeated additions are deduplicated.
    pub fn add_id(&mut self, uuid: KeyUuid) -> Result<()> {
        if self.entries.iter().any(|e| e.matches_uuid(&uuid)) {
            return Ok(());
        }
        let key = KeyIdentifier::Uuid(uuid);
        let mut entry = self.new_entry(&key)?;
        entry.uuid = Some(uuid);
        self.entries.push(entry);
        Ok(())
    }

    /// Request a key by alternate name. Repeated additions are deduplicated.
    pub fn add_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if self.entries.iter().any(|e| e.matches_name(&name)) {
            return Ok(());
        }
        let key = KeyIdentifier::AltName(name.clone());
        let mut entry = self.new_entry(&key)?;
        entry.alt_names.push(name);
        self.entries.push(entry);
        Ok(())
    }

    fn new_entry(&mut self, key: &KeyIdentifier) -> Result<KeyEntry> {
        if self.entries.len() >= MAX_KEYS_PER_BROKER {
            return Err(Error::key_unavailable(format!(
                "too many keys requested, limit is {}",
                MAX_KEYS_PER_BROKER
            )));
        }

        let mut entry = KeyEntry {
            uuid: None,
            alt_names: Vec::new(),
            cache_keys: vec![key.clone()],
            state: KeyEntryState::Added,
            owner: 0,
            encrypted_material: None,
            material: None,
            kms_taken: false,
            kms_fed: false,
        };

        match self.cache.get_or_create(key, self.ctx_id) {
            (PairState::Done, _, Some(material)) => {
                entry.material = Some(material);
                entry.state = KeyEntryState::Decrypted;
            }
            (PairState::Done, _, None) => {
                return Err(Error::collaborator("cache entry done without value"));
            }
            (PairState::Pending, owner, _) if owner == self.ctx_id => {
                entry.state = KeyEntryState::Requested;
                entry.owner = owner;
            }
            (PairState::Pending, owner, _) => {
                entry.owner = owner;
            }
        }
        Ok(entry)
    }

    /// Key-vault filter covering every fetch this context owns, or `None` when
    /// it owns nothing.
    pub fn filter(&self) -> Option<Document> {
        let mut ids = Vec::new();
        let mut names = Vec::new();
        for entry in self.entries.iter().filter(|e| e.state == KeyEntryState::Requested) {
            if let Some(uuid) = &entry.uuid {
                ids.push(Bson::Binary(uuid.to_binary()));
            } else if let Some(name) = entry.alt_names.first() {
                names.push(Bson::String(name.clone()));
            }
        }

        let mut clauses = Vec::new();
        if !ids.is_empty() {
            clauses.push(Bson::Document(doc! { "_id": { "$in": ids } }));
        }
        if !names.is_empty() {
            clauses.push(Bson::Document(doc! { "keyAltNames": { "$in": names } }));
        }
        if clauses.is_empty() {
            return None;
        }
        Some(doc! { "$or": clauses })
    }

    /// Ingest one key document from the vault: `_id` (UUID binary), optional
    /// `keyAltNames`, and `keyMaterial` (the encrypted material the KMS will
    /// decrypt). A UUID entry and an alt-name entry resolved to the same key
    /// merge into one.
    pub fn feed_key_doc(&mut self, doc: &Document) -> Result<()> {
        let uuid = match doc.get("_id") {
            Some(Bson::Binary(bin)) => KeyUuid::from_bytes(&bin.bytes)?,
            _ => return Err(Error::malformed("key document missing binary '_id'")),
        };

        let mut alt_names = Vec::new();
        match doc.get("keyAltNames") {
            None => {}
            Some(Bson::Array(items)) => {
                for item in items {
                    match item {
                        Bson::String(name) => alt_names.push(name.clone()),
                        _ => {
                            return Err(Error::malformed(
                                "key document 'keyAltNames' must contain strings",
                            ));
                        }
                    }
                }
            }
            Some(_) => {
                return Err(Error::malformed("key document 'keyAltNames' must be an array"));
            }
        }

        let encrypted_material = match doc.get("keyMaterial") {
            Some(Bson::Binary(bin)) if !bin.bytes.is_empty() => bin.bytes.clone(),
            _ => return Err(Error::malformed("key document missing binary 'keyMaterial'")),
        };

        let matched: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.matches_uuid(&uuid) || alt_names.iter().any(|n| e.matches_name(n))
            })
            .map(|(i, _)| i)
            .collect();

        let Some(&keep) = matched.first() else {
            return Err(Error::malformed(
                "unexpected key document, no matching key was requested",
            ));
        };

        // Merge later matches into the first, folding their cache keys in so
        // the eventual publish wakes every dependent.
        for &idx in matched.iter().skip(1).rev() {
            let merged = self.entries.remove(idx);
            let kept = &mut self.entries[keep];
            kept.cache_keys.extend(merged.cache_keys);
            for name in merged.alt_names {
                if !kept.matches_name(&name) {
                    kept.alt_names.push(name);
                }
            }
        }

        let entry = &mut self.entries[keep];
        if entry.state == KeyEntryState::Decrypted {
            // Already served from the cache; nothing left to do.
            return Ok(());
        }
        entry.uuid = Some(uuid);
        for name in alt_names {
            if !entry.matches_name(&name) {
                entry.alt_names.push(name);
            }
        }
        entry.encrypted_material = Some(encrypted_material);
        entry.state = KeyEntryState::KmsPending;
        Ok(())
    }

    /// The caller is done feeding vault replies. Owned fetches that received
    /// no document become `NotFound`; their pending cache entries are released
    /// so dependents can draw their own conclusion.
    pub fn done_adding_docs(&mut self) {
        for entry in &mut self.entries {
            if entry.state == KeyEntryState::Requested {
                tracing::debug!(key = %entry.cache_keys[0], "no key document returned by vault");
                entry.state = KeyEntryState::NotFound;
                for key in &entry.cache_keys {
                    self.cache.remove_pending(key, self.ctx_id);
                }
            }
        }
    }

    /// Next key-management round-trip, if any entry still needs one.
    pub fn next_kms_request(&mut self) -> Option<KmsRequest> {
        let (idx, entry) = self
            .entries
            .iter_mut()
            .enumerate()
            .find(|(_, e)| e.state == KeyEntryState::KmsPending && !e.kms_taken)?;
        entry.kms_taken = true;
        Some(KmsRequest {
            entry: idx,
            message: entry.encrypted_material.clone().unwrap_or_default(),
        })
    }

    /// Feed the decrypted reply for a previously handed-out request.
    pub fn kms_feed(&mut self, request: &KmsRequest, reply: &[u8]) -> Result<()> {
        let entry = self
            .entries
            .get_mut(request.entry)
            .ok_or_else(|| Error::client_misuse("unknown key management request"))?;
        if entry.state != KeyEntryState::KmsPending {
            return Err(Error::client_misuse("key management request already completed"));
        }
        if reply.is_empty() {
            return Err(Error::collaborator("empty reply from key management service"));
        }
        entry.material = Some(Arc::new(Zeroizing::new(reply.to_vec())));
        entry.kms_fed = true;
        Ok(())
    }

    /// All handed-out requests must have been fed. Completed entries become
    /// `Decrypted` and their material is published to the engine cache under
    /// every identifier that can name them.
    pub fn kms_done(&mut self) -> Result<()> {
        if self
            .entries
            .iter()
            .any(|e| e.state == KeyEntryState::KmsPending && !e.kms_fed)
        {
            return Err(Error::client_misuse(
                "not all key management requests were completed",
            ));
        }

        for entry in &mut self.entries {
            if entry.state != KeyEntryState::KmsPending {
                continue;
            }
            entry.state = KeyEntryState::Decrypted;
            let material = entry.material.clone().expect("fed entry has material");

            let mut publish_keys = entry.cache_keys.clone();
            if let Some(uuid) = &entry.uuid {
                let key = KeyIdentifier::Uuid(*uuid);
                if !publish_keys.contains(&key) {
                    publish_keys.push(key);
                }
            }
            for name in &entry.alt_names {
                let key = KeyIdentifier::AltName(name.clone());
                if !publish_keys.contains(&key) {
                    publish_keys.push(key);
                }
            }
            for key in &publish_keys {
                self.cache.put_done(key, material.clone());
            }
        }
        Ok(())
    }

    /// Re-poll foreign-owned dependencies against the cache. With
    /// `block = true`, sleeps on the cache condition until every dependency is
    /// resolved or this context inherits a fetch; with `block = false`,
    /// performs a single pass.
    pub fn check_cache_and_wait(&mut self, block: bool) -> Result<()> {
        loop {
            let generation = self.cache.generation();
            let mut foreign_pending = false;
            let mut inherited_fetch = false;

            for idx in 0..self.entries.len() {
                if self.entries[idx].state != KeyEntryState::Added {
                    continue;
                }
                let key = self.entries[idx].cache_keys[0].clone();
                let found = match self.cache.lookup(&key) {
                    Some(found) => found,
                    // Entry vanished: the owner aborted. Re-enter the
                    // protocol; we may win ownership this time.
                    None => self.cache.get_or_create(&key, self.ctx_id),
                };
                let entry = &mut self.entries[idx];
                match found {
                    (PairState::Done, _, Some(material)) => {
                        entry.material = Some(material);
                        entry.state = KeyEntryState::Decrypted;
                    }
                    (PairState::Done, _, None) => {
                        return Err(Error::collaborator("cache entry done without value"));
                    }
                    (PairState::Pending, owner, _) if owner == self.ctx_id => {
                        entry.state = KeyEntryState::Requested;
                        entry.owner = owner;
                        inherited_fetch = true;
                    }
                    (PairState::Pending, owner, _) => {
                        entry.owner = owner;
                        foreign_pending = true;
                    }
                }
            }

            if !foreign_pending || inherited_fetch || !block {
                return Ok(());
            }
            self.cache.wait_until_changed(generation);
        }
    }

    /// Decrypted material by UUID. Best effort: `None` for unknown or
    /// unresolved keys — partial decryption turns that into a pass-through.
    pub fn decrypted_key_by_id(&self, uuid: &KeyUuid) -> Option<Arc<KeyMaterial>> {
        self.entries
            .iter()
            .find(|e| e.state == KeyEntryState::Decrypted && e.matches_uuid(uuid))
            .and_then(|e| e.material.clone())
    }

    /// Decrypted material by either identifier form.
    pub fn decrypted_key(&self, id: &KeyIdentifier) -> Option<Arc<KeyMaterial>> {
        match id {
            KeyIdentifier::Uuid(uuid) => self.decrypted_key_by_id(uuid),
            KeyIdentifier::AltName(name) => self
                .entries
                .iter()
                .find(|e| e.state == KeyEntryState::Decrypted && e.matches_name(name))
                .and_then(|e| e.material.clone()),
        }
    }

    /// The canonical UUID an identifier resolved to, once known.
    pub fn resolved_uuid(&self, id: &KeyIdentifier) -> Option<KeyUuid> {
        match id {
            KeyIdentifier::Uuid(uuid) => Some(*uuid),
            KeyIdentifier::AltName(name) => self
                .entries
                .iter()
                .find(|e| e.matches_name(name))
                .and_then(|e| e.uuid),
        }
    }

    /// Owner id of the next unresolved foreign-owned dependency, or 0 when
    /// there is none. Successive calls rotate through the dependencies.
    pub fn next_ctx_id(&mut self) -> u32 {
        let len = self.entries.len();
        for step in 0..len {
            let idx = (self.next_dep + step) % len.max(1);
            let entry = &self.entries[idx];
            if entry.state == KeyEntryState::Added && entry.owner != 0 && entry.owner != self.ctx_id
            {
                self.next_dep = idx + 1;
                return entry.owner;
            }
        }
        0
    }

    pub fn readiness(&self) -> BrokerReadiness {
        if self.entries.iter().any(|e| e.state == KeyEntryState::Requested) {
            BrokerReadiness::NeedKeys
        } else if self.entries.iter().any(|e| e.state == KeyEntryState::KmsPending) {
            BrokerReadiness::NeedKms
        } else if self.entries.iter().any(|e| e.state == KeyEntryState::Added) {
            BrokerReadiness::Waiting
        } else {
            BrokerReadiness::Ready
        }
    }
}
