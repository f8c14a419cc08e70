use crate::error::AppError;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

macro_rules! hex_digest {
    ($name:ident, $len:expr) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8] {
                &self.0
            }

            pub fn from_slice(bytes: &[u8]) -> Option<Self> {
                bytes.try_into().ok().map($name)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(self.0))
            }
        }

        impl FromStr for $name {
            type Err = hex::FromHexError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let bytes = hex::decode(s)?;
                let arr: [u8; $len] = bytes.try_into().map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok($name(arr))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(D::Error::custom)
            }
        }
    };
}

hex_digest!(HeaderHash, 32);
hex_digest!(TransactionId, 32);
hex_digest!(DatumHash, 32);
hex_digest!(ScriptHash, 28);
hex_digest!(PolicyId, 28);
hex_digest!(Credential, 28);

/// A position on the chain, or the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Point {
    Origin,
    At { slot_no: u64, header_hash: HeaderHash },
}

impl Point {
    pub fn slot_no(&self) -> u64 {
        match self {
            Point::Origin => 0,
            Point::At { slot_no, .. } => *slot_no,
        }
    }

    pub fn header_hash(&self) -> Option<HeaderHash> {
        match self {
            Point::Origin => None,
            Point::At { header_hash, .. } => Some(*header_hash),
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Point::Origin => write!(f, "origin"),
            Point::At { slot_no, header_hash } => write!(f, "{}.{}", slot_no, header_hash),
        }
    }
}

impl FromStr for Point {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "origin" {
            return Ok(Point::Origin);
        }
        let (slot, hash) = s.split_once('.').ok_or(AppError::MalformedPoint)?;
        let slot_no: u64 = slot.parse().map_err(|_| AppError::MalformedPoint)?;
        let header_hash: HeaderHash = hash.parse().map_err(|_| AppError::MalformedPoint)?;
        Ok(Point::At { slot_no, header_hash })
    }
}

/// A persisted resume/rollback anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub slot_no: u64,
    pub header_hash: HeaderHash,
}

impl Checkpoint {
    pub fn as_point(&self) -> Point {
        Point::At { slot_no: self.slot_no, header_hash: self.header_hash }
    }
}

impl From<Checkpoint> for Point {
    fn from(c: Checkpoint) -> Point {
        c.as_point()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutputReference {
    pub transaction_id: TransactionId,
    pub output_index: u16,
}

impl OutputReference {
    /// Storage key: transaction id followed by the big-endian index, so a
    /// transaction-id prefix maps onto a contiguous key range.
    pub fn to_bytes(&self) -> [u8; 34] {
        let mut out = [0u8; 34];
        out[..32].copy_from_slice(&self.transaction_id.0);
        out[32..].copy_from_slice(&self.output_index.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 34 {
            return None;
        }
        let transaction_id = TransactionId::from_slice(&bytes[..32])?;
        let output_index = u16::from_be_bytes([bytes[32], bytes[33]]);
        Some(OutputReference { transaction_id, output_index })
    }
}

impl fmt::Display for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.output_index, self.transaction_id)
    }
}

/// An address as seen on outputs: opaque text plus the credential extracts
/// used by credential patterns and indexes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    text: String,
    payment_credential: Option<Credential>,
    delegation_credential: Option<Credential>,
}

impl Address {
    pub fn from_text(s: &str) -> Option<Address> {
        if let Ok((hrp, payload)) = bech32::decode(s) {
            let hrp = hrp.as_str();
            if hrp.starts_with("addr") || hrp.starts_with("stake") {
                return Some(Self::from_payload(s.to_string(), &payload));
            }
            return None;
        }
        if bs58::decode(s).with_check(None).into_vec().is_ok() {
            // Byron era; carries no extractable credentials.
            return Some(Address { text: s.to_string(), payment_credential: None, delegation_credential: None });
        }
        if let Ok(payload) = hex::decode(s) {
            if !payload.is_empty() {
                return Some(Self::from_payload(s.to_string(), &payload));
            }
        }
        None
    }

    fn from_payload(text: String, payload: &[u8]) -> Address {
        let mut payment_credential = None;
        let mut delegation_credential = None;
        if payload.len() >= 29 {
            match payload[0] >> 4 {
                // base addresses: payment + delegation parts
                0..=3 => {
                    payment_credential = Credential::from_slice(&payload[1..29]);
                    if payload.len() >= 57 {
                        delegation_credential = Credential::from_slice(&payload[29..57]);
                    }
                }
                // pointer & enterprise addresses: payment part only
                4..=7 => {
                    payment_credential = Credential::from_slice(&payload[1..29]);
                }
                // reward accounts: delegation part only
                14 | 15 => {
                    delegation_credential = Credential::from_slice(&payload[1..29]);
                }
                _ => {}
            }
        }
        Address { text, payment_credential, delegation_credential }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn payment_credential(&self) -> Option<&Credential> {
        self.payment_credential.as_ref()
    }

    pub fn delegation_credential(&self) -> Option<&Credential> {
        self.delegation_credential.as_ref()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetName(pub Vec<u8>);

impl AssetName {
    pub fn empty() -> Self {
        AssetName(Vec::new())
    }
}

impl fmt::Display for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AssetId {
    pub policy_id: PolicyId,
    pub asset_name: AssetName,
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.asset_name.0.is_empty() {
            write!(f, "{}", self.policy_id)
        } else {
            write!(f, "{}.{}", self.policy_id, self.asset_name)
        }
    }
}

impl FromStr for AssetId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            None => Ok(AssetId { policy_id: s.parse().map_err(|_| ())?, asset_name: AssetName::empty() }),
            Some((policy, name)) => Ok(AssetId {
                policy_id: policy.parse().map_err(|_| ())?,
                asset_name: AssetName(hex::decode(name).map_err(|_| ())?),
            }),
        }
    }
}

/// Ada plus native assets. Persisted as CBOR bytes, rendered as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Value {
    pub coins: u64,
    pub assets: BTreeMap<AssetId, u64>,
}

impl Value {
    pub fn coins(coins: u64) -> Self {
        Value { coins, assets: BTreeMap::new() }
    }

    pub fn with_asset(mut self, policy_id: PolicyId, asset_name: AssetName, quantity: u64) -> Self {
        self.assets.insert(AssetId { policy_id, asset_name }, quantity);
        self
    }

    pub fn has_policy(&self, policy_id: &PolicyId) -> bool {
        self.assets.keys().any(|asset| &asset.policy_id == policy_id)
    }

    pub fn has_asset(&self, policy_id: &PolicyId, asset_name: &AssetName) -> bool {
        self.assets.keys().any(|asset| &asset.policy_id == policy_id && &asset.asset_name == asset_name)
    }

    pub fn to_cbor(&self) -> Vec<u8> {
        let mut out = Vec::new();
        ciborium::ser::into_writer(self, &mut out).expect("value serialization is infallible");
        out
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, ciborium::de::Error<std::io::Error>> {
        ciborium::de::from_reader(bytes)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("coins", &self.coins)?;
        let assets: BTreeMap<String, u64> = self.assets.iter().map(|(k, v)| (k.to_string(), *v)).collect();
        map.serialize_entry("assets", &assets)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw {
            coins: u64,
            #[serde(default)]
            assets: BTreeMap<String, u64>,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mut assets = BTreeMap::new();
        for (key, quantity) in raw.assets {
            let asset: AssetId = key.parse().map_err(|_| D::Error::custom(format!("invalid asset id: {}", key)))?;
            assets.insert(asset, quantity);
        }
        Ok(Value { coins: raw.coins, assets })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptLanguage {
    #[serde(rename = "native")]
    Native,
    #[serde(rename = "plutus:v1")]
    PlutusV1,
    #[serde(rename = "plutus:v2")]
    PlutusV2,
    #[serde(rename = "plutus:v3")]
    PlutusV3,
}

impl ScriptLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptLanguage::Native => "native",
            ScriptLanguage::PlutusV1 => "plutus:v1",
            ScriptLanguage::PlutusV2 => "plutus:v2",
            ScriptLanguage::PlutusV3 => "plutus:v3",
        }
    }
}

impl FromStr for ScriptLanguage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "native" => Ok(ScriptLanguage::Native),
            "plutus:v1" => Ok(ScriptLanguage::PlutusV1),
            "plutus:v2" => Ok(ScriptLanguage::PlutusV2),
            "plutus:v3" => Ok(ScriptLanguage::PlutusV3),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    pub language: ScriptLanguage,
    pub bytes: Vec<u8>,
}

/// A transaction output as produced by the block provider, before matching.
#[derive(Debug, Clone)]
pub struct Output {
    pub address: Address,
    pub value: Value,
    pub datum_hash: Option<DatumHash>,
    pub script_hash: Option<ScriptHash>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: TransactionId,
    pub spends: Vec<OutputReference>,
    pub outputs: Vec<Output>,
    pub datums: BTreeMap<DatumHash, Vec<u8>>,
    pub scripts: BTreeMap<ScriptHash, Script>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub slot_no: u64,
    pub header_hash: HeaderHash,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn point(&self) -> Point {
        Point::At { slot_no: self.slot_no, header_hash: self.header_hash }
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint { slot_no: self.slot_no, header_hash: self.header_hash }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SpentAt {
    pub slot_no: u64,
    pub header_hash: HeaderHash,
    pub transaction_id: TransactionId,
}

/// A materialized output: the unit of storage and of `/matches` responses.
#[derive(Debug, Clone)]
pub struct Input {
    pub output_reference: OutputReference,
    pub address: Address,
    pub value: Value,
    pub datum_hash: Option<DatumHash>,
    pub script_hash: Option<ScriptHash>,
    pub created_at: Checkpoint,
    pub spent_at: Option<SpentAt>,
}

impl Serialize for Input {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(8))?;
        map.serialize_entry("transaction_id", &self.output_reference.transaction_id)?;
        map.serialize_entry("output_index", &self.output_reference.output_index)?;
        map.serialize_entry("address", self.address.text())?;
        map.serialize_entry("value", &self.value)?;
        map.serialize_entry("datum_hash", &self.datum_hash)?;
        map.serialize_entry("script_hash", &self.script_hash)?;
        map.serialize_entry("created_at", &self.created_at)?;
        map.serialize_entry("spent_at", &self.spent_at)?;
        map.end()
    }
}

/// Narrows `/matches` (and deletions) to unspent, spent, or all rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatusFlag {
    #[default]
    Any,
    OnlyUnspent,
    OnlySpent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

impl SortDirection {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}
