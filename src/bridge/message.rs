use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::rawblock::RawBlock;

/// An event as produced by an upstream source, before fan-out.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    BlockConnected {
        height: i32,
        hash: String,
        merkle_root: String,
        prev_block_hash: String,
        transactions: Vec<String>,
    },
    /// A storage change notification. The payload is the changed row.
    Notification { channel: String, payload: Value },
}

impl UpstreamEvent {
    pub fn block_connected(height: i32, block: &RawBlock) -> Self {
        UpstreamEvent::BlockConnected {
            height,
            hash: block.hash.clone(),
            merkle_root: block.merkle_root.clone(),
            prev_block_hash: block.previous_block.clone(),
            transactions: block.transactions.iter().map(|tx| tx.txid.clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BlockConnected,
    Notification,
}

/// One text frame sent to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub seq: u64,
    pub kind: EventKind,
    pub hash: Option<String>,
    pub merkle_root: Option<String>,
    pub prev_block_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transactions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

fn field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_owned)
}

impl WireMessage {
    pub fn from_event(seq: u64, event: UpstreamEvent) -> Self {
        match event {
            UpstreamEvent::BlockConnected {
                height,
                hash,
                merkle_root,
                prev_block_hash,
                transactions,
            } => WireMessage {
                seq,
                kind: EventKind::BlockConnected,
                hash: Some(hash),
                merkle_root: Some(merkle_root),
                prev_block_hash: Some(prev_block_hash),
                height: Some(height),
                transactions,
                channel: None,
                payload: None,
            },
            // block rows carry their header hashes, address rows only a hash
            UpstreamEvent::Notification { channel, payload } => WireMessage {
                seq,
                kind: EventKind::Notification,
                hash: field(&payload, "hash"),
                merkle_root: field(&payload, "hash_merkle_root"),
                prev_block_hash: field(&payload, "hash_prev_block"),
                height: payload
                    .get("height")
                    .and_then(Value::as_i64)
                    .and_then(|h| i32::try_from(h).ok()),
                transactions: Vec::new(),
                channel: Some(channel),
                payload: Some(payload),
            },
        }
    }
}
