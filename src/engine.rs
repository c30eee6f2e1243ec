//! Engine handle: the shared state every context hangs off.
//!
//! An [`Engine`] is a cheap-clone handle over the engine-wide caches, the
//! context id counter, and the crypto provider. Contexts are created through
//! [`Engine::ctx_builder`]; concurrent contexts built from clones of the same
//! handle share the caches and therefore deduplicate schema and key fetches.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bson::Document;

use crate::broker::{KeyCache, KeyUuid};
use crate::cache::Cache;
use crate::crypto::{AesGcmCrypto, Algorithm, CryptoProvider};
use crate::ctx::{Context, ContextOptions, KmsProvider};
use crate::error::Result;

struct Shared {
    collinfo_cache: Cache<String, Document>,
    key_cache: Arc<KeyCache>,
    crypto: Arc<dyn CryptoProvider>,
    ctx_counter: AtomicU32,
    cache_noblock: bool,
}

#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
}

impl Engine {
    /// Engine with the default AES-256-GCM provider and blocking waits.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder { crypto: Arc::new(AesGcmCrypto), cache_noblock: false }
    }

    /// Start configuring a new context.
    pub fn ctx_builder(&self) -> ContextBuilder {
        ContextBuilder {
            engine: self.clone(),
            opts: ContextOptions::default(),
            cache_noblock: None,
        }
    }

    pub(crate) fn collinfo_cache(&self) -> &Cache<String, Document> {
        &self.shared.collinfo_cache
    }

    pub(crate) fn key_cache(&self) -> Arc<KeyCache> {
        self.shared.key_cache.clone()
    }

    pub(crate) fn crypto(&self) -> Arc<dyn CryptoProvider> {
        self.shared.crypto.clone()
    }

    /// Allocate the next context id. Ids start at 1; 0 is the no-owner
    /// sentinel in cache entries.
    pub(crate) fn next_ctx_id(&self) -> u32 {
        self.shared.ctx_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn default_noblock(&self) -> bool {
        self.shared.cache_noblock
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EngineBuilder {
    crypto: Arc<dyn CryptoProvider>,
    cache_noblock: bool,
}

impl EngineBuilder {
    /// Swap in a custom crypto provider.
    pub fn crypto_provider(mut self, provider: Arc<dyn CryptoProvider>) -> Self {
        self.crypto = provider;
        self
    }

    /// Default blocking mode for `wait_done` on contexts of this engine.
    pub fn cache_noblock(mut self, noblock: bool) -> Self {
        self.cache_noblock = noblock;
        self
    }

    pub fn build(self) -> Engine {
        Engine {
            shared: Arc::new(Shared {
                collinfo_cache: Cache::new(),
                key_cache: Arc::new(Cache::new()),
                crypto: self.crypto,
                ctx_counter: AtomicU32::new(1),
                cache_noblock: self.cache_noblock,
            }),
        }
    }
}

/// Collects context options, then initializes a context of one of the four
/// kinds. Option validation happens at build time against the kind's spec.
pub struct ContextBuilder {
    engine: Engine,
    opts: ContextOptions,
    cache_noblock: Option<bool>,
}

impl ContextBuilder {
    pub fn key_id(mut self, id: KeyUuid) -> Self {
        self.opts.key_id = Some(id);
        self
    }

    pub fn key_alt_name(mut self, name: impl Into<String>) -> Self {
        self.opts.key_alt_name = Some(name.into());
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.opts.algorithm = Some(algorithm);
        self
    }

    pub fn iv(mut self, iv: impl Into<Vec<u8>>) -> Self {
        self.opts.iv = Some(iv.into());
        self
    }

    pub fn local_schema(mut self, schema: Document) -> Self {
        self.opts.local_schema = Some(schema);
        self
    }

    pub fn kms_provider(mut self, provider: KmsProvider) -> Self {
        self.opts.kms_provider = Some(provider);
        self
    }

    pub fn aws_cmk(mut self, cmk: impl Into<String>) -> Self {
        self.opts.aws_cmk = Some(cmk.into());
        self
    }

    pub fn aws_region(mut self, region: impl Into<String>) -> Self {
        self.opts.aws_region = Some(region.into());
        self
    }

    /// Override the engine's blocking mode for this context.
    pub fn cache_noblock(mut self, noblock: bool) -> Self {
        self.cache_noblock = Some(noblock);
        self
    }

    fn noblock(&self) -> bool {
        self.cache_noblock.unwrap_or_else(|| self.engine.default_noblock())
    }

    /// Automatic encryption of a command against `<db>.<coll>`.
    pub fn build_encrypt(self, ns: &str, cmd: &[u8]) -> Result<Context> {
        let noblock = self.noblock();
        Context::auto_encrypt(self.engine, self.opts, noblock, ns, cmd)
    }

    /// Explicit encryption of a single `{"v": ...}` wrapped value.
    pub fn build_explicit_encrypt(self, msg: &[u8]) -> Result<Context> {
        let noblock = self.noblock();
        Context::explicit_encrypt(self.engine, self.opts, noblock, msg)
    }

    /// Automatic decryption of a full document.
    pub fn build_decrypt(self, doc: &[u8]) -> Result<Context> {
        let noblock = self.noblock();
        Context::auto_decrypt(self.engine, self.opts, noblock, doc)
    }

    /// Explicit decryption of a single `{"v": <binary>}` wrapped value.
    pub fn build_explicit_decrypt(self, msg: &[u8]) -> Result<Context> {
        let noblock = self.noblock();
        Context::explicit_decrypt(self.engine, self.opts, noblock, msg)
    }
}
