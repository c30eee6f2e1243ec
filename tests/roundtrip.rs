//! End-to-end caller-protocol scenarios: each test plays the database driver
//! and KMS, feeding replies between states.

use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use fieldvault::{
    encode_marking, traverse_binary, Algorithm, Context, Engine, ErrorKind, KeyIdentifier,
    KeyUuid, Marking, State, TraverseMatch,
};

const MATERIAL_A: [u8; 32] = [7; 32];
const MATERIAL_B: [u8; 32] = [8; 32];

fn to_bytes(doc: &Document) -> Vec<u8> {
    let mut out = Vec::new();
    doc.to_writer(&mut out).unwrap();
    out
}

fn from_bytes(bytes: &[u8]) -> Document {
    Document::from_reader(bytes).unwrap()
}

fn uuid(n: u8) -> KeyUuid {
    KeyUuid::from([n; 16])
}

fn key_doc(id: KeyUuid, names: &[&str], wrapped: &[u8]) -> Document {
    let mut d = doc! {
        "_id": Bson::Binary(id.to_binary()),
        "keyMaterial": Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: wrapped.to_vec(),
        }),
        "status": 0,
    };
    if !names.is_empty() {
        let names: Vec<Bson> = names.iter().map(|n| Bson::String(n.to_string())).collect();
        d.insert("keyAltNames", names);
    }
    d
}

/// Play the key vault and KMS: feed the given key documents, then answer each
/// key-management request through `kms`.
fn run_keys_and_kms(ctx: &mut Context, docs: &[Document], kms: impl Fn(&[u8]) -> Vec<u8>) {
    assert_eq!(ctx.state(), State::NeedKeys);
    let filter = ctx.op().unwrap();
    assert!(from_bytes(&filter).contains_key("$or"));
    for d in docs {
        ctx.feed(&to_bytes(d)).unwrap();
    }
    ctx.done().unwrap();

    if ctx.state() == State::NeedKms {
        while let Some(req) = ctx.next_kms_request().unwrap() {
            let reply = kms(req.message());
            ctx.kms_feed(&req, &reply).unwrap();
        }
        ctx.kms_done().unwrap();
    }
}

fn unwrap_binary(doc: &Document, key: &str) -> Binary {
    match doc.get(key) {
        Some(Bson::Binary(bin)) => bin.clone(),
        other => panic!("expected binary at {:?}, got {:?}", key, other),
    }
}

// === Explicit round-trips ===

#[test]
fn explicit_encrypt_then_decrypt_roundtrip() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "hello" });

    let mut ctx = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Deterministic)
        .iv(vec![9u8; 12])
        .build_explicit_encrypt(&msg)
        .unwrap();
    assert_eq!(ctx.state(), State::NeedKeys);

    run_keys_and_kms(&mut ctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    assert_eq!(ctx.state(), State::Ready);

    let encrypted = ctx.finalize().unwrap();
    assert_eq!(ctx.state(), State::Done);

    // Blob layout: subtype 1 (deterministic), key uuid, original type (string).
    let bin = unwrap_binary(&from_bytes(&encrypted), "v");
    assert_eq!(bin.subtype, BinarySubtype::Encrypted);
    assert_eq!(bin.bytes[0], 1);
    assert_eq!(&bin.bytes[1..17], uuid(1).as_bytes());
    assert_eq!(bin.bytes[17], 0x02);

    // Decrypt on a fresh engine so the key must be fetched again.
    let engine2 = Engine::new();
    let mut dctx = engine2.ctx_builder().build_explicit_decrypt(&encrypted).unwrap();
    run_keys_and_kms(&mut dctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    let decrypted = dctx.finalize().unwrap();
    assert_eq!(from_bytes(&decrypted), doc! { "v": "hello" });
}

#[test]
fn explicit_decrypt_served_from_shared_cache() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "hello" });

    let mut ctx = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    run_keys_and_kms(&mut ctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    let encrypted = ctx.finalize().unwrap();

    // The key was published engine-wide; the second context needs no I/O.
    let mut dctx = engine.ctx_builder().build_explicit_decrypt(&encrypted).unwrap();
    assert_eq!(dctx.state(), State::Ready);
    let decrypted = dctx.finalize().unwrap();
    assert_eq!(from_bytes(&decrypted), doc! { "v": "hello" });
}

#[test]
fn deterministic_encrypt_is_stable() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "hello" });
    let iv = vec![3u8; 12];

    let mut first = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Deterministic)
        .iv(iv.clone())
        .build_explicit_encrypt(&msg)
        .unwrap();
    run_keys_and_kms(&mut first, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    let out1 = first.finalize().unwrap();

    let mut second = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Deterministic)
        .iv(iv)
        .build_explicit_encrypt(&msg)
        .unwrap();
    assert_eq!(second.state(), State::Ready); // cache hit
    let out2 = second.finalize().unwrap();

    assert_eq!(out1, out2);
}

#[test]
fn randomized_encrypt_differs_per_run() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "hello" });

    let mut first = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    run_keys_and_kms(&mut first, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    let out1 = first.finalize().unwrap();

    let mut second = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    let out2 = second.finalize().unwrap();

    assert_ne!(out1, out2);

    let mut dctx = engine.ctx_builder().build_explicit_decrypt(&out2).unwrap();
    let decrypted = dctx.finalize().unwrap();
    assert_eq!(from_bytes(&decrypted), doc! { "v": "hello" });
}

#[test]
fn explicit_decrypt_missing_key_is_hard_error() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "secret" });

    let mut ctx = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    run_keys_and_kms(&mut ctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    let encrypted = ctx.finalize().unwrap();

    let engine2 = Engine::new();
    let mut dctx = engine2.ctx_builder().build_explicit_decrypt(&encrypted).unwrap();
    // The vault has nothing for this key.
    run_keys_and_kms(&mut dctx, &[], |_| unreachable!());
    assert_eq!(dctx.state(), State::Ready);

    let err = dctx.finalize().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::KeyUnavailable);
    assert_eq!(dctx.state(), State::Error);
}

// === Automatic decryption ===

/// Encrypt a single value explicitly and pull the resulting blob out.
fn make_blob(engine: &Engine, id: KeyUuid, wrapped: &[u8], material: &[u8], value: &str) -> Binary {
    let msg = to_bytes(&doc! { "v": value });
    let mut ctx = engine
        .ctx_builder()
        .key_id(id)
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    if ctx.state() == State::NeedKeys {
        let material = material.to_vec();
        run_keys_and_kms(&mut ctx, &[key_doc(id, &[], wrapped)], move |_| material.clone());
    }
    let out = ctx.finalize().unwrap();
    unwrap_binary(&from_bytes(&out), "v")
}

#[test]
fn partial_auto_decrypt_leaves_unknown_ciphertext() {
    let crafting = Engine::new();
    let blob_a = make_blob(&crafting, uuid(1), b"wrapped-a", &MATERIAL_A, "alpha");
    let blob_b = make_blob(&crafting, uuid(2), b"wrapped-b", &MATERIAL_B, "beta");
    let input = doc! { "a": Bson::Binary(blob_a), "b": Bson::Binary(blob_b.clone()) };

    let engine = Engine::new();
    let mut ctx = engine.ctx_builder().build_decrypt(&to_bytes(&input)).unwrap();
    // The vault only knows the first key.
    run_keys_and_kms(&mut ctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    assert_eq!(ctx.state(), State::Ready);

    let out = from_bytes(&ctx.finalize().unwrap());
    assert_eq!(ctx.state(), State::Done);
    assert!(ctx.status().is_ok());

    assert_eq!(out.get_str("a").unwrap(), "alpha");
    assert_eq!(unwrap_binary(&out, "b"), blob_b); // left encrypted in place
}

#[test]
fn auto_decrypt_without_ciphertexts_passes_through() {
    let engine = Engine::new();
    let input = doc! { "plain": 1, "nested": { "x": "y" } };

    let mut ctx = engine.ctx_builder().build_decrypt(&to_bytes(&input)).unwrap();
    assert_eq!(ctx.state(), State::Ready);
    let out = ctx.finalize().unwrap();
    assert_eq!(from_bytes(&out), input);
}

// === Automatic encryption ===

fn schema() -> Document {
    doc! {
        "bsonType": "object",
        "properties": { "ssn": { "encrypt": { "bsonType": "string" } } },
    }
}

fn collinfo_with_schema(name: &str) -> Document {
    doc! {
        "name": name,
        "type": "collection",
        "options": { "validator": { "$jsonSchema": schema() } },
    }
}

fn marked_command(key: KeyIdentifier, value: &str) -> Document {
    let marking = Marking {
        key,
        algorithm: Algorithm::Randomized,
        iv: None,
        value: Bson::String(value.to_string()),
    };
    doc! {
        "find": "people",
        "filter": {
            "ssn": Bson::Binary(Binary {
                subtype: BinarySubtype::Encrypted,
                bytes: encode_marking(&marking).unwrap(),
            }),
        },
    }
}

#[test]
fn auto_encrypt_full_flow_then_decrypt_restores() {
    let engine = Engine::new();
    let cmd = doc! { "find": "people", "filter": { "ssn": "123-45-6789" } };

    let mut ctx = engine.ctx_builder().build_encrypt("db.people", &to_bytes(&cmd)).unwrap();
    assert_eq!(ctx.state(), State::NeedCollInfo);
    assert_eq!(from_bytes(&ctx.op().unwrap()), doc! { "name": "people" });

    ctx.feed(&to_bytes(&collinfo_with_schema("people"))).unwrap();
    ctx.done().unwrap();
    assert_eq!(ctx.state(), State::NeedMarkings);
    assert_eq!(from_bytes(&ctx.op().unwrap()), schema());

    let marked = marked_command(KeyIdentifier::Uuid(uuid(1)), "123-45-6789");
    ctx.feed(&to_bytes(&doc! { "result": marked })).unwrap();
    ctx.done().unwrap();

    run_keys_and_kms(&mut ctx, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    assert_eq!(ctx.state(), State::Ready);

    let encrypted = from_bytes(&ctx.finalize().unwrap());
    assert_eq!(ctx.state(), State::Done);

    let blob = unwrap_binary(encrypted.get_document("filter").unwrap(), "ssn");
    assert_eq!(blob.subtype, BinarySubtype::Encrypted);
    assert_eq!(blob.bytes[0], 2);
    assert_eq!(&blob.bytes[1..17], uuid(1).as_bytes());

    // Re-running encryption on its own output finds no markings.
    let mut markings = 0;
    traverse_binary(&encrypted, TraverseMatch::Marking, &mut |_| {
        markings += 1;
        Ok(())
    })
    .unwrap();
    assert_eq!(markings, 0);

    // Decrypting with the full key set restores the marked command's value.
    let mut dctx = engine.ctx_builder().build_decrypt(&to_bytes(&encrypted)).unwrap();
    assert_eq!(dctx.state(), State::Ready); // key already cached engine-wide
    let restored = from_bytes(&dctx.finalize().unwrap());
    assert_eq!(restored.get_document("filter").unwrap().get_str("ssn").unwrap(), "123-45-6789");
}

#[test]
fn auto_encrypt_resolves_alt_name_markings() {
    let engine = Engine::new();
    let cmd = doc! { "find": "people" };

    let mut ctx = engine
        .ctx_builder()
        .local_schema(schema())
        .build_encrypt("db.people", &to_bytes(&cmd))
        .unwrap();
    assert_eq!(ctx.state(), State::NeedMarkings);

    let marked = marked_command(KeyIdentifier::AltName("payroll".into()), "x");
    ctx.feed(&to_bytes(&doc! { "result": marked })).unwrap();
    ctx.done().unwrap();

    run_keys_and_kms(&mut ctx, &[key_doc(uuid(4), &["payroll"], b"wrapped-a")], |_| {
        MATERIAL_A.to_vec()
    });

    let encrypted = from_bytes(&ctx.finalize().unwrap());
    let blob = unwrap_binary(encrypted.get_document("filter").unwrap(), "ssn");
    // The alt name resolved to the vault's canonical UUID.
    assert_eq!(&blob.bytes[1..17], uuid(4).as_bytes());
}

#[test]
fn noop_marking_reply_passes_command_through() {
    let engine = Engine::new();
    let cmd = doc! { "find": "people", "filter": { "x": 1 } };
    let cmd_bytes = to_bytes(&cmd);

    let mut ctx = engine.ctx_builder().build_encrypt("db.people", &cmd_bytes).unwrap();
    ctx.feed(&to_bytes(&collinfo_with_schema("people"))).unwrap();
    ctx.done().unwrap();

    ctx.feed(&to_bytes(&doc! { "schemaRequiresEncryption": false })).unwrap();
    ctx.done().unwrap();
    assert_eq!(ctx.state(), State::Ready);

    let out = ctx.finalize().unwrap();
    assert_eq!(out, cmd_bytes);
}

#[test]
fn schemaless_collection_is_nothing_to_do() {
    let engine = Engine::new();
    let cmd = doc! { "find": "c" };
    let cmd_bytes = to_bytes(&cmd);

    let mut ctx = engine.ctx_builder().build_encrypt("db.c", &cmd_bytes).unwrap();
    ctx.feed(&to_bytes(&doc! { "name": "c", "type": "collection" })).unwrap();
    ctx.done().unwrap();
    assert_eq!(ctx.state(), State::NothingToDo);

    // Pass-through finalize for callers that want the bytes anyway.
    let out = ctx.finalize().unwrap();
    assert_eq!(out, cmd_bytes);
}

#[test]
fn view_collections_are_rejected() {
    let engine = Engine::new();
    let cmd = to_bytes(&doc! { "find": "c" });

    let mut ctx = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    let err = ctx.feed(&to_bytes(&doc! { "name": "c", "type": "view" })).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Policy);
    assert!(err.message().contains("view"));
    assert_eq!(ctx.state(), State::Error);

    // The failure is sticky.
    let err = ctx.op().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Policy);
    assert_eq!(ctx.state(), State::Error);
}

// === Cache sharing between contexts ===

#[test]
fn second_context_waits_on_collinfo_owner() {
    let engine = Engine::new();
    let cmd = to_bytes(&doc! { "find": "c" });

    let mut ctx1 = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    assert_eq!(ctx1.state(), State::NeedCollInfo);

    let mut ctx2 = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    assert_eq!(ctx2.state(), State::Waiting);
    assert_eq!(ctx2.next_dependent_ctx_id(), ctx1.id());

    ctx1.feed(&to_bytes(&collinfo_with_schema("c"))).unwrap();
    ctx1.done().unwrap();
    assert_eq!(ctx1.state(), State::NeedMarkings);

    // The schema is published; the dependent inherits it without I/O.
    ctx2.wait_done().unwrap();
    assert_eq!(ctx2.state(), State::NeedMarkings);
}

#[test]
fn aborted_owner_hands_collinfo_fetch_off() {
    let engine = Engine::new();
    let cmd = to_bytes(&doc! { "find": "c" });

    let ctx1 = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    let mut ctx2 = engine
        .ctx_builder()
        .cache_noblock(true)
        .build_encrypt("db.c", &cmd)
        .unwrap();
    assert_eq!(ctx2.state(), State::Waiting);

    drop(ctx1); // owner aborts; its pending entry is released

    ctx2.wait_done().unwrap();
    assert_eq!(ctx2.state(), State::NeedCollInfo);
}

#[test]
fn waiting_context_resumes_across_threads() {
    let engine = Engine::new();
    let cmd = to_bytes(&doc! { "find": "c" });

    let mut ctx1 = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    let mut ctx2 = engine.ctx_builder().build_encrypt("db.c", &cmd).unwrap();
    assert_eq!(ctx2.state(), State::Waiting);

    let waiter = std::thread::spawn(move || {
        ctx2.wait_done().unwrap(); // blocks until the owner publishes
        ctx2.state()
    });

    ctx1.feed(&to_bytes(&collinfo_with_schema("c"))).unwrap();
    ctx1.done().unwrap();

    assert_eq!(waiter.join().unwrap(), State::NeedMarkings);
}

#[test]
fn concurrent_contexts_dedup_key_fetches() {
    let engine = Engine::new();
    let msg = to_bytes(&doc! { "v": "hello" });

    let mut ctx1 = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    assert_eq!(ctx1.state(), State::NeedKeys);

    let mut ctx2 = engine
        .ctx_builder()
        .key_id(uuid(1))
        .algorithm(Algorithm::Randomized)
        .build_explicit_encrypt(&msg)
        .unwrap();
    assert_eq!(ctx2.state(), State::Waiting);
    assert_eq!(ctx2.next_dependent_ctx_id(), ctx1.id());

    run_keys_and_kms(&mut ctx1, &[key_doc(uuid(1), &[], b"wrapped-a")], |_| MATERIAL_A.to_vec());
    ctx1.finalize().unwrap();

    ctx2.wait_done().unwrap();
    assert_eq!(ctx2.state(), State::Ready);
    let out = ctx2.finalize().unwrap();
    let bin = unwrap_binary(&from_bytes(&out), "v");
    assert_eq!(&bin.bytes[1..17], uuid(1).as_bytes());
}
