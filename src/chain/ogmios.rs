use crate::chain::{ChainEvent, ChainProducer, FetchBlockClient, ProducerConnector};
use crate::error::ChainError;
use crate::model::{
    Address, AssetId, AssetName, Block, DatumHash, HeaderHash, Output, OutputReference, Point, PolicyId, Script,
    ScriptHash, ScriptLanguage, Transaction, TransactionId, Value,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The JSON-RPC code the bridge answers with when none of the proposed
/// intersection candidates is on its chain.
const INTERSECTION_NOT_FOUND: i64 = 1000;

/// Client for the JSON-RPC WebSocket bridge exposing `findIntersection`,
/// `nextBlock` and `queryBlock` over the node's chain-sync.
pub struct OgmiosProducer {
    socket: Socket,
    next_id: u64,
}

impl OgmiosProducer {
    pub async fn connect(host: &str, port: u16) -> Result<Self, ChainError> {
        let url = format!("ws://{}:{}", host, port);
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| ChainError::ProducerUnreachable(format!("{}: {}", url, e)))?;
        Ok(OgmiosProducer { socket, next_id: 0 })
    }

    async fn request(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, ChainError> {
        self.next_id += 1;
        let id = self.next_id;
        let payload = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": id });
        self.socket.send(Message::Text(payload.to_string())).await?;
        self.read_response(id).await
    }

    async fn read_response(&mut self, id: u64) -> Result<serde_json::Value, ChainError> {
        loop {
            let message = self
                .socket
                .next()
                .await
                .ok_or_else(|| ChainError::ProducerUnreachable("bridge closed the connection".to_string()))??;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(ChainError::ProducerUnreachable("bridge closed the connection".to_string()))
                }
                _ => continue,
            };
            let response: WireResponse = serde_json::from_str(&text)?;
            if response.id != Some(id) {
                continue;
            }
            if let Some(error) = response.error {
                if error.code == INTERSECTION_NOT_FOUND {
                    return Ok(json!({ "intersectionNotFound": true }));
                }
                return Err(ChainError::Custom(format!("bridge error {}: {}", error.code, error.message)));
            }
            return response.result.ok_or_else(|| ChainError::Custom("bridge response without result".to_string()));
        }
    }
}

#[async_trait]
impl ChainProducer for OgmiosProducer {
    async fn find_intersection(&mut self, candidates: Vec<Point>) -> Result<(Option<Point>, Point), ChainError> {
        let points: Vec<serde_json::Value> = candidates.iter().map(point_to_wire).collect();
        let result = self.request("findIntersection", json!({ "points": points })).await?;
        if result.get("intersectionNotFound").is_some() {
            return Ok((None, Point::Origin));
        }
        let parsed: WireIntersection = serde_json::from_value(result)?;
        Ok((Some(parsed.intersection.to_point()?), parsed.tip.to_point()?))
    }

    async fn next_event(&mut self) -> Result<ChainEvent, ChainError> {
        let result = self.request("nextBlock", json!({})).await?;
        let parsed: WireNextBlock = serde_json::from_value(result)?;
        match parsed {
            WireNextBlock::Forward { block, tip } => {
                Ok(ChainEvent::RollForward { block: block.into_block()?, tip: tip.to_point()? })
            }
            WireNextBlock::Backward { point, tip } => {
                Ok(ChainEvent::RollBackward { point: point.to_point()?, tip: tip.to_point()? })
            }
        }
    }
}

/// Dials a fresh bridge session for every (re-)intersection.
pub struct OgmiosConnector {
    host: String,
    port: u16,
}

impl OgmiosConnector {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        OgmiosConnector { host: host.into(), port }
    }
}

#[async_trait]
impl ProducerConnector for OgmiosConnector {
    async fn connect(&self) -> Result<Box<dyn ChainProducer>, ChainError> {
        Ok(Box::new(OgmiosProducer::connect(&self.host, self.port).await?))
    }
}

/// Block fetches for `/metadata` run on their own short-lived bridge
/// connection so they never interleave with the consumer's session.
pub struct OgmiosFetchClient {
    host: String,
    port: u16,
}

impl OgmiosFetchClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        OgmiosFetchClient { host: host.into(), port }
    }
}

#[async_trait]
impl FetchBlockClient for OgmiosFetchClient {
    async fn fetch_block(&self, point: &Point) -> Result<Option<Block>, ChainError> {
        let mut session = OgmiosProducer::connect(&self.host, self.port).await?;
        let result = session.request("queryBlock", json!({ "point": point_to_wire(point) })).await?;
        if result.is_null() {
            return Ok(None);
        }
        let block: WireBlock = serde_json::from_value(result)?;
        Ok(Some(block.into_block()?))
    }
}

fn point_to_wire(point: &Point) -> serde_json::Value {
    match point {
        Point::Origin => json!("origin"),
        Point::At { slot_no, header_hash } => json!({ "slot": slot_no, "id": header_hash.to_string() }),
    }
}

#[derive(Deserialize)]
struct WireResponse {
    id: Option<u64>,
    result: Option<serde_json::Value>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct WireIntersection {
    intersection: WirePoint,
    tip: WirePoint,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WirePoint {
    Origin(String),
    At { slot: u64, id: String },
}

impl WirePoint {
    fn to_point(&self) -> Result<Point, ChainError> {
        match self {
            WirePoint::Origin(tag) if tag == "origin" => Ok(Point::Origin),
            WirePoint::Origin(tag) => Err(ChainError::Custom(format!("unexpected point tag: {}", tag))),
            WirePoint::At { slot, id } => Ok(Point::At {
                slot_no: *slot,
                header_hash: id.parse::<HeaderHash>().map_err(|e| ChainError::Custom(e.to_string()))?,
            }),
        }
    }
}

#[derive(Deserialize)]
#[serde(tag = "direction", rename_all = "camelCase")]
enum WireNextBlock {
    Forward { block: WireBlock, tip: WirePoint },
    Backward { point: WirePoint, tip: WirePoint },
}

#[derive(Deserialize)]
struct WireBlock {
    id: String,
    slot: u64,
    #[serde(default)]
    transactions: Vec<WireTransaction>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTransaction {
    id: String,
    #[serde(default)]
    inputs: Vec<WireInput>,
    #[serde(default)]
    outputs: Vec<WireOutput>,
    #[serde(default)]
    datums: BTreeMap<String, String>,
    #[serde(default)]
    metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct WireInput {
    transaction: WireTransactionId,
    index: u16,
}

#[derive(Deserialize)]
struct WireTransactionId {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOutput {
    address: String,
    value: serde_json::Value,
    #[serde(default)]
    datum_hash: Option<String>,
    #[serde(default)]
    script: Option<WireScript>,
}

#[derive(Deserialize)]
struct WireScript {
    language: String,
    cbor: String,
    hash: String,
}

impl WireBlock {
    fn into_block(self) -> Result<Block, ChainError> {
        let header_hash = self.id.parse::<HeaderHash>().map_err(|e| ChainError::Custom(e.to_string()))?;
        let transactions =
            self.transactions.into_iter().map(WireTransaction::into_transaction).collect::<Result<Vec<_>, _>>()?;
        Ok(Block { slot_no: self.slot, header_hash, transactions })
    }
}

impl WireTransaction {
    fn into_transaction(self) -> Result<Transaction, ChainError> {
        let id = self.id.parse::<TransactionId>().map_err(|e| ChainError::Custom(e.to_string()))?;
        let spends = self
            .inputs
            .into_iter()
            .map(|input| {
                Ok(OutputReference {
                    transaction_id: input
                        .transaction
                        .id
                        .parse::<TransactionId>()
                        .map_err(|e| ChainError::Custom(e.to_string()))?,
                    output_index: input.index,
                })
            })
            .collect::<Result<Vec<_>, ChainError>>()?;

        let mut datums = BTreeMap::new();
        for (hash, bytes) in self.datums {
            let hash = hash.parse::<DatumHash>().map_err(|e| ChainError::Custom(e.to_string()))?;
            let bytes = hex::decode(&bytes).map_err(|e| ChainError::Custom(e.to_string()))?;
            datums.insert(hash, bytes);
        }

        let mut scripts = BTreeMap::new();
        let mut outputs = Vec::with_capacity(self.outputs.len());
        for wire_output in self.outputs {
            let address = Address::from_text(&wire_output.address)
                .ok_or_else(|| ChainError::Custom(format!("unreadable address: {}", wire_output.address)))?;
            let value = parse_wire_value(&wire_output.value)?;
            let datum_hash = wire_output
                .datum_hash
                .map(|hash| hash.parse::<DatumHash>().map_err(|e| ChainError::Custom(e.to_string())))
                .transpose()?;
            let script_hash = match wire_output.script {
                None => None,
                Some(script) => {
                    let hash = script.hash.parse::<ScriptHash>().map_err(|e| ChainError::Custom(e.to_string()))?;
                    let language = ScriptLanguage::from_str(&script.language)
                        .map_err(|_| ChainError::Custom(format!("unknown script language: {}", script.language)))?;
                    let bytes = hex::decode(&script.cbor).map_err(|e| ChainError::Custom(e.to_string()))?;
                    scripts.insert(hash, Script { language, bytes });
                    Some(hash)
                }
            };
            outputs.push(Output { address, value, datum_hash, script_hash });
        }

        Ok(Transaction { id, spends, outputs, datums, scripts, metadata: self.metadata })
    }
}

/// The bridge renders values as `{"ada": {"lovelace": n}, "<policy>":
/// {"<asset name hex>": quantity}}`.
fn parse_wire_value(value: &serde_json::Value) -> Result<Value, ChainError> {
    let object = value.as_object().ok_or_else(|| ChainError::Custom("value is not an object".to_string()))?;
    let mut parsed = Value::default();
    for (key, quantities) in object {
        let quantities =
            quantities.as_object().ok_or_else(|| ChainError::Custom(format!("malformed value under {}", key)))?;
        if key == "ada" {
            parsed.coins = quantities
                .get("lovelace")
                .and_then(|coin| coin.as_u64())
                .ok_or_else(|| ChainError::Custom("missing lovelace quantity".to_string()))?;
            continue;
        }
        let policy_id = key.parse::<PolicyId>().map_err(|e| ChainError::Custom(e.to_string()))?;
        for (asset, quantity) in quantities {
            let asset_name = AssetName(hex::decode(asset).map_err(|e| ChainError::Custom(e.to_string()))?);
            let quantity =
                quantity.as_u64().ok_or_else(|| ChainError::Custom(format!("malformed quantity for {}", asset)))?;
            parsed.assets.insert(AssetId { policy_id, asset_name }, quantity);
        }
    }
    Ok(parsed)
}
