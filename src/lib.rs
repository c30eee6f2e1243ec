//! # fieldvault
//!
//! Driver-agnostic client-side field-level encryption engine.
//!
//! The engine is a pure state machine: it encrypts outgoing database commands
//! and decrypts returned documents, but performs no I/O itself. Each job is a
//! [`Context`] that walks the caller through the round-trips it needs — the
//! `listCollections` lookup, the marking query, the key-vault fetch, the
//! key-management round-trips — one observable [`State`] at a time.
//! Engine-wide caches deduplicate schema and key fetches across concurrent
//! contexts: the first context to need an entry owns the fetch, everyone else
//! waits (or runs the owner first via [`Context::next_dependent_ctx_id`]).
//!
//! ## Quick Start
//!
//! ```ignore
//! use fieldvault::{Algorithm, Engine, KeyUuid, State};
//!
//! let engine = Engine::new();
//!
//! // Explicit encryption: wrap the value as {"v": ...}.
//! let mut ctx = engine
//!     .ctx_builder()
//!     .key_id(KeyUuid::from([1u8; 16]))
//!     .algorithm(Algorithm::Randomized)
//!     .build_explicit_encrypt(&msg_bytes)?;
//!
//! // Drive the state machine; the caller performs the I/O between states.
//! loop {
//!     match ctx.state() {
//!         State::NeedKeys => {
//!             let filter = ctx.op()?;               // run against the key vault
//!             ctx.feed(&key_doc_bytes)?;            // one reply per document
//!             ctx.done()?;
//!         }
//!         State::NeedKms => {
//!             while let Some(req) = ctx.next_kms_request()? {
//!                 let reply = kms.decrypt(req.message());   // caller's KMS
//!                 ctx.kms_feed(&req, &reply)?;
//!             }
//!             ctx.kms_done()?;
//!         }
//!         State::Waiting => ctx.wait_done()?,
//!         State::Ready => break,
//!         other => panic!("unexpected state {other}"),
//!     }
//! }
//! let encrypted = ctx.finalize()?;                  // {"v": <ciphertext blob>}
//! ```

pub mod broker;
pub mod cache;
pub mod ciphertext;
pub mod crypto;
pub mod ctx;
pub mod engine;
pub mod error;
pub mod marking;
pub mod traverse;
pub mod value;

// Re-export main types for convenience
pub use broker::{
    BrokerReadiness, KeyBroker, KeyCache, KeyEntryState, KeyIdentifier, KeyUuid, KmsRequest,
    MAX_KEYS_PER_BROKER,
};
pub use cache::{Cache, PairState};
pub use ciphertext::{
    decode_ciphertext, encode_ciphertext, CiphertextView, KEY_UUID_LEN, MIN_CIPHERTEXT_LEN,
};
pub use crypto::{AesGcmCrypto, Algorithm, CryptoProvider, KeyMaterial, IV_LEN, KEY_LEN};
pub use ctx::{Context, ContextOptions, KmsProvider, State};
pub use engine::{ContextBuilder, Engine, EngineBuilder};
pub use error::{Error, ErrorKind, Result};
pub use marking::{decode_marking, encode_marking, Marking, MARKING_DISCRIMINATOR};
pub use traverse::{transform_binary, traverse_binary, TraverseMatch, MAX_DOCUMENT_LEN};
pub use value::{decode_value, encode_value};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
