//! End-to-end scenarios: a scripted block producer feeds the consumer while
//! the HTTP API is exercised against the same in-memory store.

use async_trait::async_trait;
use axum_test::TestServer;
use kupo::chain::consumer::{ChainConsumer, ForcedRollback};
use kupo::chain::{ChainEvent, ChainProducer, FetchBlockClient, ProducerConnector};
use kupo::error::ChainError;
use kupo::health::Health;
use kupo::http::{build_router, AppState};
use kupo::model::{
    Address, Block, Checkpoint, DatumHash, HeaderHash, Output, Point, Transaction, TransactionId, Value,
};
use kupo::pattern::Pattern;
use kupo::registry::PatternRegistry;
use kupo::storage::{InputManagement, Storage};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

fn hash32(n: u64) -> HeaderHash {
    let mut bytes = [0u8; 32];
    bytes[24..].copy_from_slice(&n.to_be_bytes());
    HeaderHash(bytes)
}

fn tx_id(n: u64) -> TransactionId {
    let mut bytes = [0u8; 32];
    bytes[..8].copy_from_slice(&n.to_be_bytes());
    TransactionId(bytes)
}

fn test_address(seed: u8) -> Address {
    let mut payload = vec![0x00];
    payload.extend_from_slice(&[seed; 28]);
    payload.extend_from_slice(&[seed.wrapping_add(1); 28]);
    let hrp = bech32::Hrp::parse("addr").unwrap();
    Address::from_text(&bech32::encode::<bech32::Bech32m>(hrp, &payload).unwrap()).unwrap()
}

fn block_with_output(slot_no: u64, address: &Address) -> Block {
    Block {
        slot_no,
        header_hash: hash32(slot_no),
        transactions: vec![Transaction {
            id: tx_id(slot_no),
            spends: vec![],
            outputs: vec![Output {
                address: address.clone(),
                value: Value::coins(1_000_000),
                datum_hash: None,
                script_hash: None,
            }],
            datums: BTreeMap::new(),
            scripts: BTreeMap::new(),
            metadata: None,
        }],
    }
}

fn point_at(slot_no: u64) -> Point {
    Point::At { slot_no, header_hash: hash32(slot_no) }
}

/// A producer whose roll-forward/backward sequence is driven by the test.
/// Intersections always succeed on the first candidate.
#[derive(Clone)]
struct ScriptedProducer {
    events: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ChainEvent>>>,
    blocks: Arc<Mutex<HashMap<u64, Block>>>,
}

#[async_trait]
impl ChainProducer for ScriptedProducer {
    async fn find_intersection(&mut self, candidates: Vec<Point>) -> Result<(Option<Point>, Point), ChainError> {
        Ok((candidates.first().copied(), Point::Origin))
    }

    async fn next_event(&mut self) -> Result<ChainEvent, ChainError> {
        let mut events = self.events.lock().await;
        events.recv().await.ok_or_else(|| ChainError::ProducerUnreachable("script finished".to_string()))
    }
}

#[async_trait]
impl ProducerConnector for ScriptedProducer {
    async fn connect(&self) -> Result<Box<dyn ChainProducer>, ChainError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl FetchBlockClient for ScriptedProducer {
    async fn fetch_block(&self, point: &Point) -> Result<Option<Block>, ChainError> {
        Ok(self.blocks.lock().unwrap().get(&point.slot_no()).cloned())
    }
}

struct Harness {
    server: TestServer,
    storage: Arc<Storage>,
    health: Arc<Health>,
    feed: mpsc::UnboundedSender<ChainEvent>,
    blocks: Arc<Mutex<HashMap<u64, Block>>>,
    _shutdown: watch::Sender<bool>,
}

impl Harness {
    async fn start(patterns: &[Pattern], since: Point, longest_rollback: u64) -> Harness {
        let storage = Storage::in_memory(longest_rollback, InputManagement::RemoveSpentInputs).unwrap();
        let seeded = patterns.to_vec();
        storage
            .write(move |conn| {
                for pattern in &seeded {
                    kupo::storage::ops::insert_pattern(conn, pattern)?;
                }
                Ok(())
            })
            .await
            .unwrap();
        let registry = PatternRegistry::new(patterns.to_vec());
        let health = Health::new(InputManagement::RemoveSpentInputs);

        let (feed, events) = mpsc::unbounded_channel();
        let blocks = Arc::new(Mutex::new(HashMap::new()));
        let producer = ScriptedProducer { events: Arc::new(tokio::sync::Mutex::new(events)), blocks: Arc::clone(&blocks) };

        let (forced_tx, forced_rx) = mpsc::channel::<ForcedRollback>(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let consumer = ChainConsumer::new(
            Arc::clone(&storage),
            registry.clone(),
            Arc::clone(&health),
            Some(since),
            Duration::from_secs(60),
        );
        tokio::spawn(consumer.run(Box::new(producer.clone()), forced_rx, shutdown_rx));

        let state = AppState {
            storage: Arc::clone(&storage),
            registry,
            health: Arc::clone(&health),
            forced: forced_tx,
            fetch: Arc::new(producer),
            concurrency: Arc::new(Semaphore::new(50)),
        };
        let server = TestServer::new(build_router(state)).unwrap();
        Harness { server, storage, health, feed, blocks, _shutdown: shutdown_tx }
    }

    fn roll_forward(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.slot_no, block.clone());
        self.feed.send(ChainEvent::RollForward { block, tip: point_at(1_000) }).unwrap();
    }

    fn roll_backward(&self, point: Point) {
        self.feed.send(ChainEvent::RollBackward { point, tip: point_at(1_000) }).unwrap();
    }

    /// Wait until the consumer's most recent checkpoint reaches `slot_no`.
    async fn synced_to(&self, slot_no: u64) {
        for _ in 0..500 {
            if self.health.most_recent_checkpoint().map(|c| c.slot_no) == Some(slot_no) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "consumer never reached slot {} (at {:?})",
            slot_no,
            self.health.most_recent_checkpoint().map(|c| c.slot_no)
        );
    }

    async fn matches(&self, path: &str) -> Vec<Json> {
        let response = self.server.get(path).await;
        response.assert_status_ok();
        ndjson(&response.text())
    }
}

fn ndjson(text: &str) -> Vec<Json> {
    text.lines().filter(|line| !line.is_empty()).map(|line| serde_json::from_str(line).unwrap()).collect()
}

#[tokio::test]
async fn scenario_1_ingests_blocks_and_serves_matches_and_checkpoints() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    for slot in [10, 20, 30] {
        harness.roll_forward(block_with_output(slot, &address));
    }
    harness.synced_to(30).await;

    let matches = harness.matches("/matches/*").await;
    assert_eq!(matches.len(), 3);
    let slots: Vec<u64> = matches.iter().map(|m| m["created_at"]["slot_no"].as_u64().unwrap()).collect();
    assert_eq!(slots, vec![30, 20, 10], "matches are ordered by creation slot, descending");
    assert_eq!(matches[0]["address"], address.text());

    let response = harness.server.get("/checkpoints").await;
    response.assert_status_ok();
    assert_eq!(
        response.header("X-Most-Recent-Checkpoint").to_str().unwrap(),
        "30",
        "responses advertise the most recent checkpoint"
    );
    let checkpoints: Vec<u64> = ndjson(&response.text()).iter().map(|c| c["slot_no"].as_u64().unwrap()).collect();
    assert_eq!(checkpoints, vec![30, 20, 10]);
}

#[tokio::test]
async fn scenario_2_rollback_drops_later_state_and_checkpoint_lookups_follow() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    for slot in [10, 20, 30] {
        harness.roll_forward(block_with_output(slot, &address));
    }
    harness.synced_to(30).await;

    harness.roll_backward(point_at(20));
    harness.synced_to(20).await;

    assert_eq!(harness.matches("/matches/*").await.len(), 2);

    let strict = harness.server.get("/checkpoints/20?strict=true").await;
    strict.assert_status_ok();
    let body: Json = serde_json::from_str(&strict.text()).unwrap();
    assert_eq!(body["slot_no"], 20);
    assert_eq!(body["header_hash"], hash32(20).to_string());

    let missing = harness.server.get("/checkpoints/25?strict=true").await;
    missing.assert_status_ok();
    assert_eq!(missing.text(), "null");

    let ancestor = harness.server.get("/checkpoints/25?strict=false").await;
    let body: Json = serde_json::from_str(&ancestor.text()).unwrap();
    assert_eq!(body["slot_no"], 20);
}

#[tokio::test]
async fn scenario_3_put_pattern_forces_a_rollback_and_reindexes_forward() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let known = test_address(0x10);
    let fresh = test_address(0x42);
    for slot in [10, 20, 30] {
        harness.roll_forward(block_with_output(slot, &known));
    }
    harness.synced_to(30).await;

    let body = serde_json::json!({ "since": format!("15.{}", hash32(15)), "limit": "within_safe_zone" });
    let response = harness.server.put(&format!("/patterns/{}", fresh.text())).json(&body).await;
    response.assert_status_ok();
    harness.synced_to(15).await;

    let patterns: Vec<String> = harness.server.get("/patterns").await.json();
    assert!(patterns.contains(&fresh.text().to_string()), "the new pattern is active: {:?}", patterns);

    // replaying forward from slot 15 picks up outputs for the new pattern
    for slot in [20, 30] {
        harness.roll_forward(block_with_output(slot, &known));
    }
    harness.roll_forward(block_with_output(35, &fresh));
    harness.synced_to(35).await;

    let matches = harness.matches(&format!("/matches/{}", fresh.text())).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0]["created_at"]["slot_no"], 35);
    assert_eq!(harness.matches("/matches/*").await.len(), 4);
}

#[tokio::test]
async fn scenario_3b_unsafe_rollbacks_are_refused_within_safe_zone_limit() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 5).await;
    let address = test_address(0x10);
    for slot in [10, 20, 30] {
        harness.roll_forward(block_with_output(slot, &address));
    }
    harness.synced_to(30).await;

    let target = test_address(0x42);
    let body = serde_json::json!({ "since": format!("10.{}", hash32(10)), "limit": "within_safe_zone" });
    let refused = harness.server.put(&format!("/patterns/{}", target.text())).json(&body).await;
    refused.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&refused.text()).unwrap();
    assert_eq!(error["code"], "unsafeRollbackBeyondSafeZone");

    // the same target is accepted when the caller opts out of the safe zone
    let body = serde_json::json!({ "since": format!("10.{}", hash32(10)), "limit": "any" });
    let allowed = harness.server.put(&format!("/patterns/{}", target.text())).json(&body).await;
    allowed.assert_status_ok();
    harness.synced_to(10).await;
}

#[tokio::test]
async fn scenario_4_deleting_matches_requires_retiring_the_pattern_first() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    for slot in [10, 20] {
        harness.roll_forward(block_with_output(slot, &address));
    }
    harness.synced_to(20).await;

    let refused = harness.server.delete("/matches/*").await;
    refused.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&refused.text()).unwrap();
    assert_eq!(error["code"], "stillActivePattern");

    let retired = harness.server.delete("/patterns/*").await;
    retired.assert_status_ok();
    let body: Json = serde_json::from_str(&retired.text()).unwrap();
    assert_eq!(body["deleted"], 1);

    let deleted = harness.server.delete("/matches/*").await;
    deleted.assert_status_ok();
    let body: Json = serde_json::from_str(&deleted.text()).unwrap();
    assert_eq!(body["deleted"], 2);
    assert_eq!(harness.matches("/matches/*").await.len(), 0);
}

#[tokio::test]
async fn scenario_5_concurrent_readers_observe_prefix_consistent_snapshots() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 10_000).await;
    let address = test_address(0x10);
    let fed: Vec<u64> = (1..=200).collect();

    let readers: Vec<_> = (0..10)
        .map(|_| {
            let server = &harness.server;
            async move {
                let response = server.get("/matches/*").await;
                response.assert_status_ok();
                ndjson(&response.text())
            }
        })
        .collect();

    let feeder = async {
        for slot in &fed {
            harness.roll_forward(block_with_output(*slot, &address));
            tokio::task::yield_now().await;
        }
    };

    let (results, _) = tokio::join!(futures::future::join_all(readers), feeder);
    harness.synced_to(200).await;

    for rows in results {
        let mut slots: Vec<u64> = rows.iter().map(|m| m["created_at"]["slot_no"].as_u64().unwrap()).collect();
        slots.sort_unstable();
        slots.dedup();
        assert_eq!(slots.len(), rows.len(), "a snapshot never shows the same output twice");
        let expected: Vec<u64> = fed.iter().copied().take(slots.len()).collect();
        assert_eq!(slots, expected, "every snapshot is a prefix of the fed chain");
    }
    assert_eq!(harness.matches("/matches/*").await.len(), 200);
}

#[tokio::test]
async fn scenario_6_datums_are_served_or_null_or_rejected() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    let datum_hash = DatumHash([0xd0; 32]);

    let script_hash = kupo::model::ScriptHash([0x5c; 28]);
    let mut block = block_with_output(10, &address);
    block.transactions[0].outputs[0].datum_hash = Some(datum_hash);
    block.transactions[0].datums.insert(datum_hash, vec![0xca, 0xfe]);
    block.transactions[0].outputs[0].script_hash = Some(script_hash);
    block.transactions[0]
        .scripts
        .insert(script_hash, kupo::model::Script { language: kupo::model::ScriptLanguage::PlutusV2, bytes: vec![0xab] });
    harness.roll_forward(block);
    harness.synced_to(10).await;

    let found = harness.server.get(&format!("/datums/{}", datum_hash)).await;
    found.assert_status_ok();
    let body: Json = serde_json::from_str(&found.text()).unwrap();
    assert_eq!(body["datum"], "cafe");

    let unknown = harness.server.get(&format!("/datums/{}", DatumHash([0x01; 32]))).await;
    unknown.assert_status_ok();
    assert_eq!(unknown.text(), "null");

    let malformed = harness.server.get("/datums/zzzz").await;
    malformed.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&malformed.text()).unwrap();
    assert_eq!(error["code"], "malformedDatumHash");

    let script = harness.server.get(&format!("/scripts/{}", script_hash)).await;
    script.assert_status_ok();
    let body: Json = serde_json::from_str(&script.text()).unwrap();
    assert_eq!(body["language"], "plutus:v2");
    assert_eq!(body["script"], "ab");

    let unknown_script = harness.server.get(&format!("/scripts/{}", kupo::model::ScriptHash([0x02; 28]))).await;
    unknown_script.assert_status_ok();
    assert_eq!(unknown_script.text(), "null");

    let bad_script = harness.server.get("/scripts/zzzz").await;
    bad_script.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&bad_script.text()).unwrap();
    assert_eq!(error["code"], "malformedScriptHash");
}

#[tokio::test]
async fn rollback_replay_converges_to_the_same_state() {
    // a forward/backward/forward detour ends in the same storage state as a
    // plain replay of the final chain
    let detour = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    for slot in [10, 20, 30] {
        detour.roll_forward(block_with_output(slot, &address));
    }
    detour.synced_to(30).await;
    detour.roll_backward(point_at(20));
    detour.synced_to(20).await;
    detour.roll_forward(block_with_output(25, &address));
    detour.synced_to(25).await;

    let straight = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    for slot in [10, 20, 25] {
        straight.roll_forward(block_with_output(slot, &address));
    }
    straight.synced_to(25).await;

    let lhs = detour.matches("/matches/*").await;
    let rhs = straight.matches("/matches/*").await;
    assert_eq!(lhs, rhs, "detour and replay disagree");

    let lhs: Vec<Json> = ndjson(&detour.server.get("/checkpoints").await.text());
    let rhs: Vec<Json> = ndjson(&straight.server.get("/checkpoints").await.text());
    assert_eq!(lhs, rhs);
}

#[tokio::test]
async fn spends_are_marked_and_status_flags_filter() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    harness.roll_forward(block_with_output(10, &address));

    let spender = Block {
        slot_no: 20,
        header_hash: hash32(20),
        transactions: vec![Transaction {
            id: tx_id(9_999),
            spends: vec![kupo::model::OutputReference { transaction_id: tx_id(10), output_index: 0 }],
            outputs: vec![],
            datums: BTreeMap::new(),
            scripts: BTreeMap::new(),
            metadata: None,
        }],
    };
    harness.roll_forward(spender);
    harness.synced_to(20).await;

    assert_eq!(harness.matches("/matches/*?unspent").await.len(), 0);
    let spent = harness.matches("/matches/*?spent").await;
    assert_eq!(spent.len(), 1);
    assert_eq!(spent[0]["spent_at"]["slot_no"], 20);
    assert_eq!(spent[0]["spent_at"]["transaction_id"], tx_id(9_999).to_string());

    // rolling the spend back makes the output unspent again
    harness.roll_backward(point_at(10));
    harness.synced_to(10).await;
    assert_eq!(harness.matches("/matches/*?unspent").await.len(), 1);

    let both = harness.server.get("/matches/*?spent&unspent").await;
    both.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&both.text()).unwrap();
    assert_eq!(error["code"], "invalidStatusFlag");
}

#[tokio::test]
async fn metadata_is_fetched_from_the_ancestor_block() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    let mut block = block_with_output(10, &address);
    block.transactions[0].metadata = Some(serde_json::json!({ "674": { "msg": ["hello"] } }));
    harness.roll_forward(block);
    harness.synced_to(10).await;

    let response = harness.server.get("/metadata/15").await;
    response.assert_status_ok();
    assert_eq!(response.header("X-Block-Header-Hash").to_str().unwrap(), hash32(10).to_string());
    let lines = ndjson(&response.text());
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["transaction_id"], tx_id(10).to_string());
    assert_eq!(lines[0]["schema"]["674"]["msg"][0], "hello");

    let below = harness.server.get("/metadata/5").await;
    below.assert_status(http::StatusCode::NOT_FOUND);
    let error: Json = serde_json::from_str(&below.text()).unwrap();
    assert_eq!(error["code"], "noAncestor");
}

#[tokio::test]
async fn health_negotiates_json_and_prometheus() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    harness.roll_forward(block_with_output(10, &test_address(0x10)));
    harness.synced_to(10).await;

    let json = harness.server.get("/health").add_header("Accept", "application/json").await;
    json.assert_status_ok();
    let body: Json = serde_json::from_str(&json.text()).unwrap();
    assert_eq!(body["connection_status"], "connected");
    assert_eq!(body["most_recent_checkpoint"]["slot_no"], 10);

    let text = harness.server.get("/health").add_header("Accept", "text/plain").await;
    text.assert_status_ok();
    assert!(text.text().contains("kupo_most_recent_checkpoint 10"));

    let neither = harness.server.get("/health").add_header("Accept", "application/cbor").await;
    neither.assert_status(http::StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn unknown_routes_and_methods_are_tagged() {
    let harness = Harness::start(&[], Point::Origin, 100).await;

    let missing = harness.server.get("/nope").await;
    missing.assert_status(http::StatusCode::NOT_FOUND);

    let wrong_method = harness.server.post("/checkpoints").await;
    wrong_method.assert_status(http::StatusCode::METHOD_NOT_ALLOWED);

    let bad_pattern = harness.server.get("/matches/not-a-pattern").await;
    bad_pattern.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&bad_pattern.text()).unwrap();
    assert_eq!(error["code"], "invalidPattern");

    let bad_sort = harness.server.get("/matches/*?order=sideways").await;
    bad_sort.assert_status(http::StatusCode::BAD_REQUEST);
    let error: Json = serde_json::from_str(&bad_sort.text()).unwrap();
    assert_eq!(error["code"], "invalidSortDirection");
}

#[tokio::test]
async fn deleting_a_pattern_keeps_existing_matches_until_matches_deletion() {
    let harness = Harness::start(&[Pattern::Any], Point::Origin, 100).await;
    let address = test_address(0x10);
    harness.roll_forward(block_with_output(10, &address));
    harness.synced_to(10).await;

    harness.server.delete("/patterns/*").await.assert_status_ok();
    let patterns: Vec<String> = harness.server.get("/patterns").await.json();
    assert!(patterns.is_empty());
    // indexed rows survive the pattern removal until GC or explicit deletion
    assert_eq!(harness.matches("/matches/*").await.len(), 1);

    // the pattern no longer being active, matches can now be deleted
    let deleted = harness.server.delete("/matches/*").await;
    deleted.assert_status_ok();
    assert_eq!(harness.matches("/matches/*").await.len(), 0);
    // storage-level sanity: nothing funny happened to the checkpoint ring
    let checkpoints = harness.storage.read(kupo::storage::checkpoints::list_descending).await.unwrap();
    assert_eq!(checkpoints.len(), 1);
    assert_eq!(checkpoints[0], Checkpoint { slot_no: 10, header_hash: hash32(10) });
}
