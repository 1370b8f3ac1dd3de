//! Cross-crate property tests.

use std::sync::Arc;

use proptest::prelude::*;

use peervault_blobs::BlobStore;
use peervault_core::VaultDocument;
use peervault_crypto::{open, seal};
use peervault_proto::{deserialize, serialize, Message};
use peervault_storage::{MemoryStorage, Storage};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("runtime builds")
}

async fn fresh_document() -> VaultDocument {
    VaultDocument::load(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>)
        .await
        .expect("document loads")
}

/// One random mutation against a document.
#[derive(Debug, Clone)]
enum Op {
    Create(String),
    SetText(String, String),
    Delete(String),
}

fn path_strategy() -> impl Strategy<Value = String> {
    // Small path space so operations collide across peers
    prop::sample::select(vec![
        "a.md".to_string(),
        "b.md".to_string(),
        "dir/c.md".to_string(),
        "dir/sub/d.md".to_string(),
        "dir/e.md".to_string(),
    ])
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        path_strategy().prop_map(Op::Create),
        (path_strategy(), "[a-z ]{0,24}").prop_map(|(p, t)| Op::SetText(p, t)),
        path_strategy().prop_map(Op::Delete),
    ]
}

fn apply(document: &VaultDocument, ops: &[Op]) {
    for op in ops {
        match op {
            Op::Create(path) => document.handle_file_create(path, None).expect("create"),
            Op::SetText(path, text) => {
                document.handle_file_create(path, None).expect("create");
                document.set_text_content(path, text).expect("set text");
            }
            Op::Delete(path) => {
                document.handle_file_delete(path).expect("delete");
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Any two edit histories converge after one exchange, in either
    /// import order, to identical paths and content.
    #[test]
    fn prop_documents_converge(
        ops_a in prop::collection::vec(op_strategy(), 0..12),
        ops_b in prop::collection::vec(op_strategy(), 0..12),
    ) {
        runtime().block_on(async {
            let a = fresh_document().await;
            let b = fresh_document().await;

            apply(&a, &ops_a);
            apply(&b, &ops_b);

            let from_a = a.export_updates(None).expect("export a");
            let from_b = b.export_updates(None).expect("export b");

            // Opposite orders on the two sides
            a.import_updates(&from_b).expect("import into a");
            b.import_updates(&from_a).expect("import into b");

            prop_assert_eq!(a.list_all_paths(), b.list_all_paths());
            for path in a.list_all_paths() {
                prop_assert_eq!(a.get_content(&path), b.get_content(&path), "{}", path);
                prop_assert_eq!(a.get_blob_hash(&path), b.get_blob_hash(&path));
            }
            Ok(())
        })?;
    }

    /// Compaction never changes observable state.
    #[test]
    fn prop_compaction_preserves_state(
        ops in prop::collection::vec(op_strategy(), 1..16),
    ) {
        runtime().block_on(async {
            let document = fresh_document().await;
            apply(&document, &ops);

            let paths_before = document.list_all_paths();
            let contents_before: Vec<Option<String>> =
                paths_before.iter().map(|p| document.get_content(p)).collect();

            document.compact().expect("compact");

            prop_assert_eq!(document.list_all_paths(), paths_before.clone());
            let contents_after: Vec<Option<String>> =
                paths_before.iter().map(|p| document.get_content(p)).collect();
            prop_assert_eq!(contents_after, contents_before);
            Ok(())
        })?;
    }

    /// Blob store: content comes back verbatim and the hash is the
    /// SHA-256 of the content.
    #[test]
    fn prop_blob_roundtrip(content in prop::collection::vec(any::<u8>(), 0..2048)) {
        runtime().block_on(async {
            let blobs = BlobStore::new(Arc::new(MemoryStorage::new()) as Arc<dyn Storage>);
            let hash = blobs.add(&content, None).await.expect("add");
            prop_assert_eq!(&hash, &BlobStore::hash_content(&content));
            prop_assert_eq!(blobs.get(&hash).await.expect("get"), content);
            Ok(())
        })?;
    }

    /// Wire frames survive a serialize/deserialize cycle.
    #[test]
    fn prop_codec_roundtrip(
        seq in any::<u32>(),
        op_count in any::<u32>(),
        payload in prop::collection::vec(any::<u8>(), 0..512),
        ts in any::<u64>(),
    ) {
        for message in [
            Message::Ping { seq },
            Message::Pong { seq },
            Message::Updates { op_count, updates: payload.clone() },
            Message::SyncComplete { version: payload.clone() },
        ] {
            let envelope = deserialize(&serialize(&message, ts)).expect("roundtrip");
            prop_assert_eq!(envelope.timestamp_ms, ts);
            prop_assert_eq!(envelope.message, message);
        }
    }

    /// Sealed data opens to the original; flipping any single byte of the
    /// sealed blob fails authentication.
    #[test]
    fn prop_encryption_roundtrip_and_tamper(
        key in any::<[u8; 32]>(),
        plaintext in prop::collection::vec(any::<u8>(), 0..256),
        flip in any::<prop::sample::Index>(),
    ) {
        let sealed = seal(&key, &plaintext, b"").expect("seal");
        prop_assert_eq!(open(&key, &sealed, b"").expect("open"), plaintext);

        let mut tampered = sealed.clone();
        let index = flip.index(tampered.len());
        tampered[index] ^= 0x01;
        prop_assert!(open(&key, &tampered, b"").is_err());
    }
}
