use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub id: i64,
    pub bits: i64,
    pub height: i32,
    pub nonce: i64,
    pub version: i32,
    pub hash_prev_block: String,
    pub hash_merkle_root: String,
    pub created_at: DateTime<Utc>,
    pub hash: String,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
    #[serde(default)]
    pub price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: i64,
    pub block_id: i64,
    pub hash: String,
    pub has_witness: bool,
    /// Creation time of the containing block.
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub price: Option<f64>,
    pub txins: Vec<TxIn>,
    pub txouts: Vec<TxOut>,
    /// Identities of every address touched by the inputs and outputs.
    #[serde(default)]
    pub addresses: Vec<i64>,
}

impl Transaction {
    /// Ordered union of input source and output destination address ids.
    /// Output ids are passed in because outputs only carry address hashes.
    pub fn collect_addresses(&mut self, output_ids: impl IntoIterator<Item = i64>) {
        let mut ids: Vec<i64> = Vec::new();
        let inputs = self.txins.iter().filter_map(|txin| txin.address_id);
        for id in inputs.chain(output_ids) {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        self.addresses = ids;
    }

    pub fn is_coinbase(&self) -> bool {
        self.txins.len() == 1 && self.txins[0].is_coinbase()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxIn {
    /// Row id in the relational layout; the blob layout has none.
    #[serde(default)]
    pub id: Option<i64>,
    pub amount: i64,
    /// Previous outpoint as `txid:vout`.
    pub prev_out: String,
    pub size: i32,
    pub signature_script: String,
    pub sequence: i64,
    #[serde(default)]
    pub witness: Option<String>,
    /// Canonical hash of the spent output's owner. Set by ingest and filled
    /// on read; storage keeps only `address_id`.
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub address_id: Option<i64>,
}

pub const COINBASE_PREV_TXID: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

impl TxIn {
    pub fn is_coinbase(&self) -> bool {
        self.prev_out
            .split_once(':')
            .map_or(false, |(txid, _)| txid == COINBASE_PREV_TXID)
    }

    /// Split `prev_out` into the spent txid and output index.
    pub fn outpoint(&self) -> Option<(&str, u32)> {
        let (txid, vout) = self.prev_out.split_once(':')?;
        Some((txid, vout.parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxOut {
    #[serde(default)]
    pub id: Option<i64>,
    pub value: i64,
    /// Hex encoded output script.
    pub pk_script: String,
    /// Owner addresses; `None` until resolved, see `TxOut::addresses`.
    #[serde(default, skip_deserializing)]
    pub addresses: Option<Vec<String>>,
}

impl TxOut {
    pub fn new(value: i64, pk_script: impl Into<String>) -> Self {
        Self {
            id: None,
            value,
            pk_script: pk_script.into(),
            addresses: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Address {
    pub id: i64,
    pub hash: String,
    pub income: i64,
    pub outcome: i64,
    pub balance: i64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

/// One point of the BTC/USD price history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub created_at: DateTime<Utc>,
    pub price: f64,
}
