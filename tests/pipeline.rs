//! End-to-end pipeline scenarios: signed envelopes entering through the
//! queues, processed to confirmed messages and derived state.

use std::sync::Arc;

use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use tempfile::TempDir;

use aleph_ccn::config::Config;
use aleph_ccn::context::NodeContext;
use aleph_ccn::db::pending_messages::insert_pending_message;
use aleph_ccn::db::pending_txs::{upsert_pending_tx, PendingTxRow, TxProtocol};
use aleph_ccn::db::{unix_now, Db};
use aleph_ccn::jobs::pending_messages::PendingMessageProcessor;
use aleph_ccn::jobs::pending_txs::PendingTxProcessor;
use aleph_ccn::signing::verification_buffer;
use aleph_ccn::storage::gc::GarbageCollector;
use aleph_ccn::storage::{ObjectStore, StorageService};
use aleph_ccn::types::{
    sha256_hex, Chain, Confirmation, ItemType, MessageEnvelope, MessageOrigin, MessageType,
};

/// A test identity: an EVM key and its derived address.
struct Account {
    key: SigningKey,
    address: String,
}

impl Account {
    fn new(seed: u8) -> Self {
        let key = SigningKey::from_bytes(&[seed; 32].into()).unwrap();
        let point = key.verifying_key().to_encoded_point(false);
        let mut hasher = Keccak256::new();
        hasher.update(&point.as_bytes()[1..]);
        let digest = hasher.finalize();
        let address = format!("0x{}", hex::encode(&digest[12..]));
        Self { key, address }
    }

    /// Build and personal-sign an inline envelope.
    fn envelope(&self, message_type: MessageType, content: &serde_json::Value) -> MessageEnvelope {
        let item_content = content.to_string();
        let mut envelope = MessageEnvelope {
            chain: Chain::Eth,
            sender: self.address.clone(),
            message_type,
            channel: "TEST".to_string(),
            time: content["time"].as_f64().unwrap_or(100.0),
            item_type: ItemType::Inline,
            item_hash: sha256_hex(item_content.as_bytes()),
            item_content: Some(item_content),
            signature: String::new(),
        };

        let buffer = verification_buffer(&envelope);
        let mut hasher = Keccak256::new();
        hasher.update(format!("\x19Ethereum Signed Message:\n{}", buffer.len()).as_bytes());
        hasher.update(&buffer);
        let digest: [u8; 32] = hasher.finalize().into();

        let (signature, recovery_id) = self.key.sign_prehash_recoverable(&digest).unwrap();
        let mut sig_bytes = signature.to_bytes().to_vec();
        sig_bytes.push(recovery_id.to_byte() + 27);
        envelope.signature = format!("0x{}", hex::encode(sig_bytes));
        envelope
    }
}

struct TestNode {
    ctx: Arc<NodeContext>,
    processor: PendingMessageProcessor,
    _dir: TempDir,
}

impl TestNode {
    async fn new() -> Self {
        Self::with_config(Config::default()).await
    }

    async fn with_config(config: Config) -> Self {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Db::open_in_memory().unwrap());
        let storage = Arc::new(StorageService::new(
            ObjectStore::new(dir.path()).await.unwrap(),
            None,
        ));
        let ctx = Arc::new(NodeContext::new(config, db, storage, None));
        let processor = PendingMessageProcessor::new(Arc::clone(&ctx));
        Self {
            ctx,
            processor,
            _dir: dir,
        }
    }

    fn enqueue(
        &self,
        envelope: &MessageEnvelope,
        origin: MessageOrigin,
        confirmation: Option<&Confirmation>,
    ) {
        self.ctx
            .db
            .with_conn(|conn| {
                insert_pending_message(conn, envelope, origin, confirmation, true, unix_now())
            })
            .unwrap();
    }

    async fn drain(&self) -> usize {
        self.processor.process_available().await.unwrap()
    }
}

#[tokio::test]
async fn inline_aggregate_round_trip() {
    let node = TestNode::new().await;
    let alice = Account::new(1);

    // Three AGGREGATE messages, the third arriving out of order with a null
    // delete that an even later revision already overrode
    for (time, content) in [
        (100.0, serde_json::json!({"name": "x"})),
        (200.0, serde_json::json!({"name": "y", "age": 3})),
        (150.0, serde_json::json!({"age": null})),
    ] {
        let envelope = alice.envelope(
            MessageType::Aggregate,
            &serde_json::json!({
                "address": alice.address,
                "key": "profile",
                "content": content,
                "time": time,
            }),
        );
        node.enqueue(&envelope, MessageOrigin::Http, None);
        node.drain().await;
    }

    node.ctx
        .db
        .with_conn(|conn| {
            let aggregate =
                aleph_ccn::db::aggregates::get_aggregate(conn, &alice.address, "profile")?
                    .unwrap();
            assert_eq!(
                aggregate.content,
                serde_json::json!({"name": "y", "age": 3})
            );
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn cross_source_delivery_is_exactly_once() {
    let node = TestNode::new().await;
    let alice = Account::new(2);

    let envelope = alice.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address,
            "type": "blog",
            "content": {"body": "hello"},
            "time": 100.0,
        }),
    );

    // Same envelope through all three sources; only the chain copy carries
    // a confirmation
    let confirmation = Confirmation {
        chain: Chain::Eth,
        height: 1234,
        tx_hash: "0xccc".to_string(),
    };
    node.enqueue(&envelope, MessageOrigin::P2p, None);
    node.enqueue(&envelope, MessageOrigin::Http, None);
    node.enqueue(&envelope, MessageOrigin::Onchain, Some(&confirmation));

    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            assert_eq!(aleph_ccn::db::messages::count_messages(conn)?, 1);

            let confirmations =
                aleph_ccn::db::messages::get_confirmations(conn, &envelope.item_hash)?;
            assert_eq!(confirmations.len(), 1);
            assert_eq!(confirmations[0].height, 1234);

            // Exactly one post row despite three deliveries
            let posts: u64 = conn.query_row("SELECT COUNT(*) FROM post", [], |r| r.get(0))?;
            assert_eq!(posts, 1);

            assert_eq!(
                aleph_ccn::db::pending_messages::count_pending_messages(conn)?,
                0
            );
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn store_forget_and_collect() {
    let mut config = Config::default();
    config.storage.grace_period_secs = 60;
    let node = TestNode::with_config(config).await;
    let alice = Account::new(3);

    // A 2 MB file already in the object store
    let file_bytes = vec![7u8; 2 * 1024 * 1024];
    let file_hash = node.ctx.storage.add_bytes(&file_bytes).await.unwrap();

    let store_envelope = alice.envelope(
        MessageType::Store,
        &serde_json::json!({
            "address": alice.address,
            "item_type": "storage",
            "item_hash": file_hash,
            "time": 100.0,
        }),
    );
    node.enqueue(&store_envelope, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            let file = aleph_ccn::db::files::get_file(conn, &file_hash)?.unwrap();
            assert_eq!(file.pin_count, 1);
            assert!(file.pin_delete_at.is_none());
            Ok(())
        })
        .unwrap();

    // Forget the STORE message
    let forget_envelope = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [store_envelope.item_hash],
            "reason": "cleanup",
            "time": 200.0,
        }),
    );
    node.enqueue(&forget_envelope, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            let file = aleph_ccn::db::files::get_file(conn, &file_hash)?.unwrap();
            assert_eq!(file.pin_count, 0);
            assert!(file.pin_delete_at.is_some());

            // The STORE message is tombstoned, not deleted
            let store =
                aleph_ccn::db::messages::get_message(conn, &store_envelope.item_hash)?.unwrap();
            assert!(store.content.is_none());
            assert_eq!(
                store.forgotten_by.as_deref(),
                Some(forget_envelope.item_hash.as_str())
            );
            Ok(())
        })
        .unwrap();

    // GC past the grace period removes file and row
    let gc = GarbageCollector::new(
        Arc::clone(&node.ctx.db),
        Arc::clone(&node.ctx.storage),
        3600,
    );
    let collected = gc.collect_once(unix_now() + 120).await.unwrap();
    assert_eq!(collected, 1);
    assert!(!node.ctx.storage.local().exists(&file_hash).await);
    node.ctx
        .db
        .with_conn(|conn| {
            assert!(aleph_ccn::db::files::get_file(conn, &file_hash)?.is_none());
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn forget_reverses_aggregate_state() {
    let node = TestNode::new().await;
    let alice = Account::new(4);

    let first = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address, "key": "profile",
            "content": {"name": "x"}, "time": 100.0,
        }),
    );
    let second = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address, "key": "profile",
            "content": {"age": 3}, "time": 200.0,
        }),
    );
    node.enqueue(&first, MessageOrigin::Http, None);
    node.enqueue(&second, MessageOrigin::Http, None);
    node.drain().await;

    let forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [second.item_hash],
            "time": 300.0,
        }),
    );
    node.enqueue(&forget, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            // Derived state equals the pre-second-message fold
            let aggregate =
                aleph_ccn::db::aggregates::get_aggregate(conn, &alice.address, "profile")?
                    .unwrap();
            assert_eq!(aggregate.content, serde_json::json!({"name": "x"}));

            let target = aleph_ccn::db::messages::get_message(conn, &second.item_hash)?.unwrap();
            assert!(target.content.is_none());
            assert_eq!(target.forgotten_by.as_deref(), Some(forget.item_hash.as_str()));
            Ok(())
        })
        .unwrap();

    // A second FORGET over the same target is a silent no-op
    let forget_again = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [second.item_hash],
            "time": 400.0,
        }),
    );
    node.enqueue(&forget_again, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            // Still attributed to the first FORGET
            let target = aleph_ccn::db::messages::get_message(conn, &second.item_hash)?.unwrap();
            assert_eq!(target.forgotten_by.as_deref(), Some(forget.item_hash.as_str()));
            let rejected: u64 =
                conn.query_row("SELECT COUNT(*) FROM rejected_message", [], |r| r.get(0))?;
            assert_eq!(rejected, 0);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn forget_aggregates_wholesale_by_key() {
    let node = TestNode::new().await;
    let alice = Account::new(10);

    let first = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address, "key": "notes",
            "content": {"a": 1}, "time": 100.0,
        }),
    );
    let second = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address, "key": "notes",
            "content": {"b": 2}, "time": 200.0,
        }),
    );
    // A different key that must survive
    let other = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address, "key": "profile",
            "content": {"name": "x"}, "time": 100.0,
        }),
    );
    node.enqueue(&first, MessageOrigin::Http, None);
    node.enqueue(&second, MessageOrigin::Http, None);
    node.enqueue(&other, MessageOrigin::Http, None);
    node.drain().await;

    let forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [],
            "aggregates": ["notes"],
            "time": 300.0,
        }),
    );
    node.enqueue(&forget, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            // The whole key is gone: view, elements, and both messages are
            // tombstoned
            assert!(
                aleph_ccn::db::aggregates::get_aggregate(conn, &alice.address, "notes")?
                    .is_none()
            );
            let elements: u64 = conn.query_row(
                "SELECT COUNT(*) FROM aggregate_element WHERE key = 'notes'",
                [],
                |r| r.get(0),
            )?;
            assert_eq!(elements, 0);
            for target in [&first, &second] {
                let row =
                    aleph_ccn::db::messages::get_message(conn, &target.item_hash)?.unwrap();
                assert!(row.content.is_none());
                assert_eq!(row.forgotten_by.as_deref(), Some(forget.item_hash.as_str()));
            }

            // The untargeted key is intact
            let profile =
                aleph_ccn::db::aggregates::get_aggregate(conn, &alice.address, "profile")?
                    .unwrap();
            assert_eq!(profile.content, serde_json::json!({"name": "x"}));
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn delegation_applies_symmetrically_to_forget() {
    let node = TestNode::new().await;
    let alice = Account::new(11);
    let delegate = Account::new(12);

    // Alice delegates to the second key through her security aggregate
    let security = alice.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address,
            "key": "security",
            "content": {"authorizations": [{"address": delegate.address}]},
            "time": 10.0,
        }),
    );
    node.enqueue(&security, MessageOrigin::Http, None);
    node.drain().await;

    // The delegate posts on Alice's behalf
    let delegated_post = delegate.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address, "type": "blog",
            "content": {"body": "by delegate"}, "time": 20.0,
        }),
    );
    // Alice posts herself
    let own_post = alice.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address, "type": "blog",
            "content": {"body": "by owner"}, "time": 30.0,
        }),
    );
    node.enqueue(&delegated_post, MessageOrigin::Http, None);
    node.enqueue(&own_post, MessageOrigin::Http, None);
    node.drain().await;

    // The owner forgets the delegate's post...
    let owner_forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [delegated_post.item_hash],
            "time": 40.0,
        }),
    );
    // ...and the delegate forgets the owner's, both through the same
    // delegation
    let delegate_forget = delegate.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [own_post.item_hash],
            "time": 50.0,
        }),
    );
    node.enqueue(&owner_forget, MessageOrigin::Http, None);
    node.enqueue(&delegate_forget, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            let first =
                aleph_ccn::db::messages::get_message(conn, &delegated_post.item_hash)?.unwrap();
            assert!(first.content.is_none());
            assert_eq!(
                first.forgotten_by.as_deref(),
                Some(owner_forget.item_hash.as_str())
            );

            let second =
                aleph_ccn::db::messages::get_message(conn, &own_post.item_hash)?.unwrap();
            assert!(second.content.is_none());
            assert_eq!(
                second.forgotten_by.as_deref(),
                Some(delegate_forget.item_hash.as_str())
            );

            let rejected: u64 =
                conn.query_row("SELECT COUNT(*) FROM rejected_message", [], |r| r.get(0))?;
            assert_eq!(rejected, 0);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn forget_messages_are_not_forgettable() {
    let node = TestNode::new().await;
    let alice = Account::new(9);

    let post = alice.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address, "type": "blog",
            "content": {"body": "A"}, "time": 10.0,
        }),
    );
    let forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [post.item_hash],
            "time": 20.0,
        }),
    );
    node.enqueue(&post, MessageOrigin::Http, None);
    node.enqueue(&forget, MessageOrigin::Http, None);
    node.drain().await;

    // Attempting to forget the FORGET itself rejects permanently
    let forget_the_forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [forget.item_hash],
            "time": 30.0,
        }),
    );
    node.enqueue(&forget_the_forget, MessageOrigin::Http, None);
    node.drain().await;

    // A FORGET naming no targets rejects as malformed
    let empty_forget = alice.envelope(
        MessageType::Forget,
        &serde_json::json!({
            "address": alice.address,
            "hashes": [],
            "time": 40.0,
        }),
    );
    node.enqueue(&empty_forget, MessageOrigin::Http, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            let first = aleph_ccn::db::messages::get_message(conn, &forget.item_hash)?.unwrap();
            assert!(first.forgotten_by.is_none());

            let rejected: u64 =
                conn.query_row("SELECT COUNT(*) FROM rejected_message", [], |r| r.get(0))?;
            assert_eq!(rejected, 2);
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn post_amendments_pick_latest_time() {
    let node = TestNode::new().await;
    let alice = Account::new(5);

    let original = alice.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address, "type": "blog",
            "content": {"body": "A"}, "time": 10.0,
        }),
    );
    node.enqueue(&original, MessageOrigin::Http, None);
    node.drain().await;

    for (time, body) in [(20.0, "B"), (15.0, "C")] {
        let amendment = alice.envelope(
            MessageType::Post,
            &serde_json::json!({
                "address": alice.address, "type": "blog",
                "content": {"body": body}, "ref": original.item_hash, "time": time,
            }),
        );
        node.enqueue(&amendment, MessageOrigin::Http, None);
        node.drain().await;
    }

    node.ctx
        .db
        .with_conn(|conn| {
            let visible =
                aleph_ccn::db::posts::get_effective_revision(conn, &original.item_hash)?.unwrap();
            assert_eq!(visible.content, Some(serde_json::json!({"body": "B"})));
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn unauthorized_delegation_is_rejected() {
    let node = TestNode::new().await;
    let alice = Account::new(6);
    let mallory = Account::new(7);

    // Mallory signs an aggregate claiming Alice's address with no delegation
    let envelope = mallory.envelope(
        MessageType::Aggregate,
        &serde_json::json!({
            "address": alice.address,
            "key": "profile",
            "content": {"name": "evil"},
            "time": 100.0,
        }),
    );
    node.enqueue(&envelope, MessageOrigin::P2p, None);
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            assert!(
                aleph_ccn::db::aggregates::get_aggregate(conn, &alice.address, "profile")?
                    .is_none()
            );
            let (reason,): (String,) = conn.query_row(
                "SELECT reason FROM rejected_message WHERE item_hash = ?1",
                [&envelope.item_hash],
                |r| Ok((r.get(0)?,)),
            )?;
            assert!(reason.contains("not authorized"));
            Ok(())
        })
        .unwrap();
}

#[tokio::test]
async fn chain_tx_fan_out_reaches_message_state() {
    let node = TestNode::new().await;
    let alice = Account::new(8);

    let envelope = alice.envelope(
        MessageType::Post,
        &serde_json::json!({
            "address": alice.address, "type": "note",
            "content": {"body": "from chain"}, "time": 50.0,
        }),
    );

    let payload = serde_json::json!([serde_json::to_value(&envelope).unwrap()]).to_string();
    let tx = PendingTxRow {
        chain: Chain::Eth,
        tx_hash: "0xsync".to_string(),
        height: 77,
        tx_index: 0,
        publisher: "0xpublisher".to_string(),
        protocol: TxProtocol::BatchInline,
        payload,
        retries: 0,
        next_attempt_at: 0,
    };
    node.ctx
        .db
        .with_conn(|conn| upsert_pending_tx(conn, &tx, unix_now()))
        .unwrap();

    // A reorg re-scan would upsert the same tx again: a no-op
    node.ctx
        .db
        .with_conn(|conn| upsert_pending_tx(conn, &tx, unix_now()))
        .unwrap();

    let ptp = PendingTxProcessor::new(Arc::clone(&node.ctx));
    ptp.process_tx(tx).await.unwrap();
    node.drain().await;

    node.ctx
        .db
        .with_conn(|conn| {
            let message =
                aleph_ccn::db::messages::get_message(conn, &envelope.item_hash)?.unwrap();
            assert_eq!(message.sender, alice.address);

            let confirmations =
                aleph_ccn::db::messages::get_confirmations(conn, &envelope.item_hash)?;
            assert_eq!(confirmations.len(), 1);
            assert_eq!(confirmations[0].tx_hash, "0xsync");
            assert_eq!(confirmations[0].height, 77);
            Ok(())
        })
        .unwrap();
}
