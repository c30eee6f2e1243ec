//! Per-request context state machine.
//!
//! A context carries everything one encryption or decryption job needs and
//! walks the caller through the I/O it must perform: for each active state the
//! caller asks for an op ([`Context::op`]), feeds zero or more replies
//! ([`Context::feed`]), and signals completion ([`Context::done`]), whereupon
//! the context re-evaluates. No call performs I/O; suspension happens only at
//! state boundaries.
//!
//! The four context kinds share the machine but install different behavior per
//! state. Kind dispatch is a plain enum: hooks a kind does not implement
//! simply do not exist for it, and their states are never entered.

use std::fmt;
use std::sync::Arc;

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};

use crate::broker::{BrokerReadiness, KeyBroker, KeyIdentifier, KeyUuid, KmsRequest};
use crate::cache::PairState;
use crate::ciphertext::{decode_ciphertext, encode_ciphertext};
use crate::crypto::{Algorithm, CryptoProvider};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::marking::{decode_marking, Marking};
use crate::traverse::{transform_binary, traverse_binary, TraverseMatch, MAX_DOCUMENT_LEN};
use crate::value::{decode_value, encode_value};

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// Externally observable context state.
///
/// ```text
/// NEED_COLLINFO → NEED_MARKINGS → NEED_KEYS → NEED_KMS → READY → DONE
///                       (any step may detour through WAITING)
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum State {
    /// Caller must run the `listCollections` filter from [`Context::op`].
    NeedCollInfo,
    /// Caller must run the marking query (the schema) through its analyzer.
    NeedMarkings,
    /// Caller must run the key-vault filter.
    NeedKeys,
    /// Caller must perform the opaque key-management round-trips.
    NeedKms,
    /// Blocked on a cache entry another context owns.
    Waiting,
    /// All inputs gathered; call [`Context::finalize`].
    Ready,
    /// Nothing requires encryption; pass the command through unchanged.
    NothingToDo,
    /// Terminal success.
    Done,
    /// Terminal failure; see [`Context::status`].
    Error,
}

impl State {
    pub fn is_terminal(&self) -> bool {
        matches!(self, State::Done | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            State::NeedCollInfo => "NEED_COLLINFO",
            State::NeedMarkings => "NEED_MARKINGS",
            State::NeedKeys => "NEED_KEYS",
            State::NeedKms => "NEED_KMS",
            State::Waiting => "WAITING",
            State::Ready => "READY",
            State::NothingToDo => "NOTHING_TO_DO",
            State::Done => "DONE",
            State::Error => "ERROR",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Where a master key lives. Carried for datakey-creating embedders; every
/// context kind in this crate prohibits it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum KmsProvider {
    Aws,
    Local,
}

/// Validated configuration snapshot. Built through the
/// [`ContextBuilder`](crate::engine::ContextBuilder).
#[derive(Clone, Default)]
pub struct ContextOptions {
    pub(crate) kms_provider: Option<KmsProvider>,
    pub(crate) aws_cmk: Option<String>,
    pub(crate) aws_region: Option<String>,
    pub(crate) local_schema: Option<Document>,
    pub(crate) key_id: Option<KeyUuid>,
    pub(crate) key_alt_name: Option<String>,
    pub(crate) iv: Option<Vec<u8>>,
    pub(crate) algorithm: Option<Algorithm>,
}

impl ContextOptions {
    fn key_identifier(&self) -> Option<KeyIdentifier> {
        if let Some(uuid) = self.key_id {
            Some(KeyIdentifier::Uuid(uuid))
        } else {
            self.key_alt_name.clone().map(KeyIdentifier::AltName)
        }
    }
}

#[derive(Clone, Copy)]
enum OptReq {
    Prohibited,
    Required,
    Optional,
}

/// Per-kind option acceptance. One slot per option group.
struct OptsSpec {
    masterkey: OptReq,
    schema: OptReq,
    key_descriptor: OptReq,
    iv: OptReq,
    algorithm: OptReq,
}

impl OptsSpec {
    fn prohibit_all() -> Self {
        Self {
            masterkey: OptReq::Prohibited,
            schema: OptReq::Prohibited,
            key_descriptor: OptReq::Prohibited,
            iv: OptReq::Prohibited,
            algorithm: OptReq::Prohibited,
        }
    }
}

fn check_opt(req: OptReq, present: bool, name: &str) -> Result<()> {
    match req {
        OptReq::Prohibited if present => Err(Error::client_misuse(format!(
            "{} must not be set for this context kind",
            name
        ))),
        OptReq::Required if !present => Err(Error::client_misuse(format!(
            "{} is required for this context kind",
            name
        ))),
        _ => Ok(()),
    }
}

fn validate_opts(opts: &ContextOptions, spec: &OptsSpec) -> Result<()> {
    let masterkey =
        opts.kms_provider.is_some() || opts.aws_cmk.is_some() || opts.aws_region.is_some();
    check_opt(spec.masterkey, masterkey, "masterkey options")?;
    check_opt(spec.schema, opts.local_schema.is_some(), "local schema")?;
    if opts.key_id.is_some() && opts.key_alt_name.is_some() {
        return Err(Error::client_misuse("cannot set both key id and key alt name"));
    }
    check_opt(
        spec.key_descriptor,
        opts.key_id.is_some() || opts.key_alt_name.is_some(),
        "key id or key alt name",
    )?;
    check_opt(spec.iv, opts.iv.is_some(), "iv")?;
    check_opt(spec.algorithm, opts.algorithm.is_some(), "algorithm")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Kinds
// ---------------------------------------------------------------------------

struct AutoEncrypt {
    ns: String,
    /// Byte offset of the '.' separating db from collection.
    dot: usize,
    waiting_for_collinfo: bool,
    collinfo_owner: u32,
    schema: Option<Document>,
    original_cmd: Document,
    marked_cmd: Option<Document>,
}

impl AutoEncrypt {
    fn coll_name(&self) -> &str {
        &self.ns[self.dot + 1..]
    }
}

struct ExplicitEncrypt {
    value: Bson,
    key: KeyIdentifier,
    algorithm: Algorithm,
    iv: Option<Vec<u8>>,
}

struct AutoDecrypt {
    original_doc: Document,
}

struct ExplicitDecrypt {
    /// Content bytes of the single subtype-6 value unwrapped from `"v"`.
    payload: Vec<u8>,
}

enum Kind {
    AutoEncrypt(AutoEncrypt),
    ExplicitEncrypt(ExplicitEncrypt),
    AutoDecrypt(AutoDecrypt),
    ExplicitDecrypt(ExplicitDecrypt),
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

pub struct Context {
    engine: Engine,
    id: u32,
    state: State,
    status: Option<Error>,
    broker: KeyBroker,
    cache_noblock: bool,
    kind: Kind,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("status", &self.status)
            .finish()
    }
}

impl Context {
    // -- construction (one entry point per kind) ----------------------------

    pub(crate) fn auto_encrypt(
        engine: Engine,
        opts: ContextOptions,
        cache_noblock: bool,
        ns: &str,
        cmd: &[u8],
    ) -> Result<Self> {
        validate_opts(
            &opts,
            &OptsSpec {
                masterkey: OptReq::Prohibited,
                schema: OptReq::Optional,
                key_descriptor: OptReq::Prohibited,
                iv: OptReq::Prohibited,
                algorithm: OptReq::Prohibited,
            },
        )?;

        let dot = ns
            .find('.')
            .filter(|&i| i > 0 && i + 1 < ns.len())
            .ok_or_else(|| Error::client_misuse("invalid ns, must be <db>.<coll>"))?;
        let original_cmd = parse_document(cmd)?;

        let id = engine.next_ctx_id();
        let broker = KeyBroker::new(id, engine.key_cache());
        let local_schema = opts.local_schema.clone();

        let mut ctx = Self {
            engine,
            id,
            state: State::NeedCollInfo,
            status: None,
            broker,
            cache_noblock,
            kind: Kind::AutoEncrypt(AutoEncrypt {
                ns: ns.to_string(),
                dot,
                waiting_for_collinfo: false,
                collinfo_owner: 0,
                schema: local_schema.clone(),
                original_cmd,
                marked_cmd: None,
            }),
        };

        if local_schema.is_some() {
            // A local schema overrides collection discovery entirely.
            ctx.state = State::NeedMarkings;
        } else {
            ctx.try_collinfo_from_cache()?;
        }
        Ok(ctx)
    }

    pub(crate) fn explicit_encrypt(
        engine: Engine,
        opts: ContextOptions,
        cache_noblock: bool,
        msg: &[u8],
    ) -> Result<Self> {
        validate_opts(
            &opts,
            &OptsSpec {
                masterkey: OptReq::Prohibited,
                schema: OptReq::Prohibited,
                key_descriptor: OptReq::Required,
                iv: OptReq::Optional,
                algorithm: OptReq::Required,
            },
        )?;

        let msg = parse_document(msg)?;
        let value = msg
            .get("v")
            .cloned()
            .ok_or_else(|| Error::malformed("invalid msg, must contain 'v'"))?;
        let key = opts
            .key_identifier()
            .ok_or_else(|| Error::client_misuse("key id or key alt name required"))?;
        let algorithm = opts
            .algorithm
            .ok_or_else(|| Error::client_misuse("algorithm required"))?;

        let id = engine.next_ctx_id();
        let mut broker = KeyBroker::new(id, engine.key_cache());
        match &key {
            KeyIdentifier::Uuid(uuid) => broker.add_id(*uuid)?,
            KeyIdentifier::AltName(name) => broker.add_name(name.clone())?,
        }

        let mut ctx = Self {
            engine,
            id,
            state: State::Ready,
            status: None,
            broker,
            cache_noblock,
            kind: Kind::ExplicitEncrypt(ExplicitEncrypt {
                value,
                key,
                algorithm,
                iv: opts.iv.clone(),
            }),
        };
        ctx.state_from_key_broker();
        Ok(ctx)
    }

    pub(crate) fn auto_decrypt(
        engine: Engine,
        opts: ContextOptions,
        cache_noblock: bool,
        doc: &[u8],
    ) -> Result<Self> {
        validate_opts(&opts, &OptsSpec::prohibit_all())?;
        let original_doc = parse_document(doc)?;

        let id = engine.next_ctx_id();
        let mut broker = KeyBroker::new(id, engine.key_cache());
        traverse_binary(&original_doc, TraverseMatch::Ciphertext, &mut |payload| {
            let view = decode_ciphertext(payload)?;
            broker.add_id(KeyUuid::from(*view.key_uuid))
        })?;

        let mut ctx = Self {
            engine,
            id,
            state: State::Ready,
            status: None,
            broker,
            cache_noblock,
            kind: Kind::AutoDecrypt(AutoDecrypt { original_doc }),
        };
        ctx.state_from_key_broker();
        Ok(ctx)
    }

    pub(crate) fn explicit_decrypt(
        engine: Engine,
        opts: ContextOptions,
        cache_noblock: bool,
        msg: &[u8],
    ) -> Result<Self> {
        validate_opts(&opts, &OptsSpec::prohibit_all())?;
        let msg = parse_document(msg)?;
        let payload = match msg.get("v") {
            Some(Bson::Binary(bin)) => bin.bytes.clone(),
            Some(_) => return Err(Error::malformed("invalid msg, 'v' must contain a binary")),
            None => return Err(Error::malformed("invalid msg, must contain 'v'")),
        };
        let view = decode_ciphertext(&payload)?;
        let uuid = KeyUuid::from(*view.key_uuid);

        let id = engine.next_ctx_id();
        let mut broker = KeyBroker::new(id, engine.key_cache());
        broker.add_id(uuid)?;

        let mut ctx = Self {
            engine,
            id,
            state: State::Ready,
            status: None,
            broker,
            cache_noblock,
            kind: Kind::ExplicitDecrypt(ExplicitDecrypt { payload }),
        };
        ctx.state_from_key_broker();
        Ok(ctx)
    }

    // -- observers ----------------------------------------------------------

    /// Engine-unique context id. Dependents of a pending cache entry observe
    /// the owner's id through [`Context::next_dependent_ctx_id`].
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// First failure, if any. Subsequent operations on a failed context
    /// return this same error without mutating anything.
    pub fn status(&self) -> Result<()> {
        match &self.status {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    // -- caller protocol ----------------------------------------------------

    /// The blob to send to the current state's collaborator.
    pub fn op(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let result = self.op_inner();
        self.fail_on_err(result)
    }

    /// Feed one reply document back.
    pub fn feed(&mut self, reply: &[u8]) -> Result<()> {
        self.ensure_active()?;
        let result = self.feed_inner(reply);
        self.fail_on_err(result)
    }

    /// No more replies for the current state; re-evaluate.
    pub fn done(&mut self) -> Result<()> {
        self.ensure_active()?;
        let result = self.done_inner();
        self.fail_on_err(result)
    }

    /// Next outstanding key-management round-trip (state `NeedKms`).
    pub fn next_kms_request(&mut self) -> Result<Option<KmsRequest>> {
        self.ensure_active()?;
        if self.state != State::NeedKms {
            let err = Error::client_misuse(format!(
                "no key management requests in state {}",
                self.state
            ));
            return Err(self.fail(err));
        }
        Ok(self.broker.next_kms_request())
    }

    /// Feed the decrypted key material for one request.
    pub fn kms_feed(&mut self, request: &KmsRequest, reply: &[u8]) -> Result<()> {
        self.ensure_active()?;
        let result = self.broker.kms_feed(request, reply);
        self.fail_on_err(result)
    }

    /// All key-management round-trips completed; re-evaluate.
    pub fn kms_done(&mut self) -> Result<()> {
        self.ensure_active()?;
        if let Err(err) = self.broker.kms_done() {
            return Err(self.fail(err));
        }
        self.state_from_key_broker();
        Ok(())
    }

    /// Resolve a `Waiting` state. Blocking unless the context was built with
    /// `cache_noblock`; in non-blocking mode one re-check is performed and
    /// remaining in `Waiting` is the busy signal.
    pub fn wait_done(&mut self) -> Result<()> {
        self.ensure_active()?;
        let result = self.wait_done_inner();
        self.fail_on_err(result)
    }

    /// Id of a context this one is waiting on, or 0 when none. Lets a caller
    /// schedule the owning context instead of blocking.
    pub fn next_dependent_ctx_id(&mut self) -> u32 {
        match &mut self.kind {
            Kind::AutoEncrypt(enc) if enc.waiting_for_collinfo => {
                std::mem::take(&mut enc.collinfo_owner)
            }
            _ => self.broker.next_ctx_id(),
        }
    }

    /// Produce the output document (state `Ready`, or `NothingToDo` for the
    /// pass-through case). Transitions to `Done`.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        self.ensure_active()?;
        let result = self.finalize_inner();
        self.fail_on_err(result)
    }

    // -- error plumbing -----------------------------------------------------

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            State::Error => Err(self
                .status
                .clone()
                .unwrap_or_else(|| Error::client_misuse("context in error state"))),
            State::Done => Err(Error::client_misuse("context is done")),
            _ => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        if self.status.is_none() {
            self.status = Some(err.clone());
        }
        tracing::debug!(ctx = self.id, error = %err, "context failed");
        self.state = State::Error;
        err
    }

    fn fail_on_err<T>(&mut self, result: Result<T>) -> Result<T> {
        result.map_err(|e| self.fail(e))
    }

    // -- per-state behavior -------------------------------------------------

    fn op_inner(&mut self) -> Result<Vec<u8>> {
        match self.state {
            State::NeedCollInfo => {
                let Kind::AutoEncrypt(enc) = &self.kind else {
                    return Err(Error::client_misuse("no collection info op for this context"));
                };
                serialize_document(&doc! { "name": enc.coll_name() })
            }
            State::NeedMarkings => {
                let Kind::AutoEncrypt(enc) = &self.kind else {
                    return Err(Error::client_misuse("no marking op for this context"));
                };
                let schema = enc
                    .schema
                    .as_ref()
                    .ok_or_else(|| Error::client_misuse("no schema to analyze"))?;
                serialize_document(schema)
            }
            State::NeedKeys => {
                let filter = self
                    .broker
                    .filter()
                    .ok_or_else(|| Error::client_misuse("no keys to request"))?;
                serialize_document(&filter)
            }
            _ => Err(Error::client_misuse(format!(
                "no operation to emit in state {}",
                self.state
            ))),
        }
    }

    fn feed_inner(&mut self, reply: &[u8]) -> Result<()> {
        let reply = parse_document(reply)?;
        match self.state {
            State::NeedCollInfo => self.feed_collinfo(reply),
            State::NeedMarkings => self.feed_markings(reply),
            State::NeedKeys => self.broker.feed_key_doc(&reply),
            _ => Err(Error::client_misuse(format!(
                "cannot feed a reply in state {}",
                self.state
            ))),
        }
    }

    fn done_inner(&mut self) -> Result<()> {
        match self.state {
            State::NeedCollInfo => {
                let Kind::AutoEncrypt(enc) = &self.kind else {
                    return Err(Error::client_misuse("not a collection-info context"));
                };
                self.state = if enc.schema.is_some() {
                    State::NeedMarkings
                } else {
                    State::NothingToDo
                };
                Ok(())
            }
            State::NeedMarkings => {
                self.state_from_key_broker();
                Ok(())
            }
            State::NeedKeys => {
                self.broker.done_adding_docs();
                self.state_from_key_broker();
                Ok(())
            }
            _ => Err(Error::client_misuse(format!(
                "nothing to complete in state {}",
                self.state
            ))),
        }
    }

    fn feed_collinfo(&mut self, reply: Document) -> Result<()> {
        let Kind::AutoEncrypt(enc) = &mut self.kind else {
            return Err(Error::client_misuse("collection info not accepted by this context"));
        };
        // Cache the reply first: a rejected reply (e.g. a view) must still be
        // visible to dependents so they reach the same verdict.
        self.engine
            .collinfo_cache()
            .put_done(&enc.ns, Arc::new(reply.clone()));
        enc.schema = extract_schema(&reply)?;
        Ok(())
    }

    fn feed_markings(&mut self, reply: Document) -> Result<()> {
        let Kind::AutoEncrypt(enc) = &mut self.kind else {
            return Err(Error::client_misuse("markings not accepted by this context"));
        };

        if matches!(reply.get_bool("schemaRequiresEncryption"), Ok(false)) {
            return Ok(());
        }
        if matches!(reply.get_bool("hasEncryptedPlaceholders"), Ok(false)) {
            return Ok(());
        }

        let marked = match reply.get("result") {
            Some(Bson::Document(d)) => d.clone(),
            Some(_) => {
                return Err(Error::malformed("malformed marking reply, 'result' must be a document"));
            }
            None => return Err(Error::malformed("malformed marking reply, no 'result'")),
        };

        let broker = &mut self.broker;
        traverse_binary(&marked, TraverseMatch::Marking, &mut |payload| {
            let marking = decode_marking(payload)?;
            match marking.key {
                KeyIdentifier::Uuid(uuid) => broker.add_id(uuid),
                KeyIdentifier::AltName(name) => broker.add_name(name),
            }
        })?;

        enc.marked_cmd = Some(marked);
        Ok(())
    }

    fn state_from_key_broker(&mut self) {
        let next = match self.broker.readiness() {
            BrokerReadiness::Ready => State::Ready,
            BrokerReadiness::NeedKeys => State::NeedKeys,
            BrokerReadiness::NeedKms => State::NeedKms,
            BrokerReadiness::Waiting => State::Waiting,
        };
        tracing::trace!(ctx = self.id, state = %next, "state from key broker");
        self.state = next;
    }

    fn try_collinfo_from_cache(&mut self) -> Result<()> {
        let Kind::AutoEncrypt(enc) = &mut self.kind else {
            return Err(Error::client_misuse("not a collection-info context"));
        };
        enc.collinfo_owner = 0;
        enc.waiting_for_collinfo = false;

        let (state, owner, value) = self.engine.collinfo_cache().get_or_create(&enc.ns, self.id);
        match state {
            PairState::Done => {
                let collinfo =
                    value.ok_or_else(|| Error::collaborator("cache entry done without value"))?;
                enc.schema = extract_schema(&collinfo)?;
                self.state = if enc.schema.is_some() {
                    State::NeedMarkings
                } else {
                    State::NothingToDo
                };
            }
            PairState::Pending if owner == self.id => {
                self.state = State::NeedCollInfo;
            }
            PairState::Pending => {
                enc.waiting_for_collinfo = true;
                enc.collinfo_owner = owner;
                self.state = State::Waiting;
            }
        }
        Ok(())
    }

    fn wait_done_inner(&mut self) -> Result<()> {
        if self.state != State::Waiting {
            return Err(Error::client_misuse("context is not waiting"));
        }

        let waiting_for_collinfo =
            matches!(&self.kind, Kind::AutoEncrypt(enc) if enc.waiting_for_collinfo);
        if waiting_for_collinfo {
            loop {
                let generation = self.engine.collinfo_cache().generation();
                self.try_collinfo_from_cache()?;
                if self.state != State::Waiting || self.cache_noblock {
                    return Ok(());
                }
                self.engine.collinfo_cache().wait_until_changed(generation);
            }
        } else {
            self.broker.check_cache_and_wait(!self.cache_noblock)?;
            self.state_from_key_broker();
            Ok(())
        }
    }

    fn finalize_inner(&mut self) -> Result<Vec<u8>> {
        match self.state {
            State::Ready | State::NothingToDo => {}
            _ => {
                return Err(Error::client_misuse(format!(
                    "cannot finalize in state {}",
                    self.state
                )));
            }
        }

        let crypto = self.engine.crypto();
        let broker = &self.broker;

        let out = match &self.kind {
            Kind::AutoEncrypt(enc) => match &enc.marked_cmd {
                // Nothing was marked (empty schema, or the analyzer said the
                // command needs no encryption): pass the command through.
                None => serialize_document(&enc.original_cmd)?,
                Some(marked) => {
                    let converted =
                        transform_binary(marked, TraverseMatch::Marking, &mut |payload| {
                            let marking = decode_marking(payload)?;
                            marking_to_ciphertext(broker, crypto.as_ref(), &marking)
                        })?;
                    serialize_document(&converted)?
                }
            },
            Kind::ExplicitEncrypt(enc) => {
                let marking = Marking {
                    key: enc.key.clone(),
                    algorithm: enc.algorithm,
                    iv: enc.iv.clone(),
                    value: enc.value.clone(),
                };
                let encrypted = marking_to_ciphertext(broker, crypto.as_ref(), &marking)?;
                serialize_document(&doc! { "v": encrypted })?
            }
            Kind::AutoDecrypt(dec) => {
                let converted = transform_binary(
                    &dec.original_doc,
                    TraverseMatch::Ciphertext,
                    &mut |payload| ciphertext_to_value(broker, crypto.as_ref(), payload, true),
                )?;
                serialize_document(&converted)?
            }
            Kind::ExplicitDecrypt(dec) => {
                let value = ciphertext_to_value(broker, crypto.as_ref(), &dec.payload, false)?;
                serialize_document(&doc! { "v": value })?
            }
        };

        self.state = State::Done;
        Ok(out)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        // Release any fetches this context still owns; dependents re-enter
        // the cache protocol and one of them wins ownership.
        self.engine.collinfo_cache().remove_by_owner(self.id);
        self.engine.key_cache().remove_by_owner(self.id);
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_document(bytes: &[u8]) -> Result<Document> {
    Document::from_reader(bytes).map_err(|_| Error::malformed("malformed BSON document"))
}

fn serialize_document(doc: &Document) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    doc.to_writer(&mut out)
        .map_err(|e| Error::malformed(format!("failed to serialize document: {}", e)))?;
    if out.len() > MAX_DOCUMENT_LEN {
        return Err(Error::malformed("serialized document too large"));
    }
    Ok(out)
}

/// Pull the JSON schema out of a cached or fed `listCollections` reply.
/// Views are refused; unrecognized siblings of `$jsonSchema` under
/// `validator` are surfaced rather than silently ignored.
fn extract_schema(collinfo: &Document) -> Result<Option<Document>> {
    if let Ok(t) = collinfo.get_str("type") {
        if t == "view" {
            return Err(Error::policy("cannot auto encrypt a view"));
        }
    }

    let validator = collinfo
        .get_document("options")
        .ok()
        .and_then(|options| options.get_document("validator").ok());
    let Some(validator) = validator else {
        return Ok(None);
    };

    for (field, _) in validator {
        if field != "$jsonSchema" {
            tracing::warn!(field = %field, "unrecognized validator field alongside $jsonSchema");
        }
    }

    match validator.get("$jsonSchema") {
        None => Ok(None),
        Some(Bson::Document(schema)) => Ok(Some(schema.clone())),
        Some(_) => Err(Error::malformed("malformed JSONSchema")),
    }
}

/// Encrypt one marking into a serialized ciphertext blob value.
fn marking_to_ciphertext(
    broker: &KeyBroker,
    crypto: &dyn CryptoProvider,
    marking: &Marking,
) -> Result<Bson> {
    let material = broker
        .decrypted_key(&marking.key)
        .ok_or_else(|| Error::key_unavailable(format!("no decrypted key for {}", marking.key)))?;
    let uuid = broker
        .resolved_uuid(&marking.key)
        .ok_or_else(|| Error::key_unavailable(format!("no key id resolved for {}", marking.key)))?;

    let (original_bson_type, plaintext) = encode_value(&marking.value)?;

    let iv = match &marking.iv {
        Some(iv) => iv.clone(),
        None => match marking.algorithm {
            Algorithm::Deterministic => {
                return Err(Error::client_misuse(
                    "deterministic algorithm requires an explicit iv",
                ));
            }
            Algorithm::Randomized => crypto.random_iv()?,
        },
    };

    let sealed = crypto.encrypt(material.as_slice(), &iv, &plaintext)?;
    let blob = encode_ciphertext(
        marking.algorithm.as_wire(),
        uuid.as_bytes(),
        original_bson_type,
        &sealed,
    )?;
    Ok(Bson::Binary(Binary { subtype: BinarySubtype::Encrypted, bytes: blob }))
}

/// Decrypt one ciphertext blob back into its original value. With
/// `allow_missing`, an unresolved key leaves the blob in place instead of
/// failing — partial decryption.
fn ciphertext_to_value(
    broker: &KeyBroker,
    crypto: &dyn CryptoProvider,
    payload: &[u8],
    allow_missing: bool,
) -> Result<Bson> {
    let view = decode_ciphertext(payload)?;
    let uuid = KeyUuid::from(*view.key_uuid);

    match broker.decrypted_key_by_id(&uuid) {
        Some(material) => {
            let plaintext = crypto.decrypt(material.as_slice(), view.ciphertext)?;
            decode_value(view.original_bson_type, &plaintext)
        }
        None if allow_missing => {
            tracing::warn!(key = %uuid, "missing key, skipping decryption for this value");
            Ok(Bson::Binary(Binary {
                subtype: BinarySubtype::Encrypted,
                bytes: payload.to_vec(),
            }))
        }
        None => Err(Error::key_unavailable(format!("no decrypted key for id {}", uuid))),
    }
}
