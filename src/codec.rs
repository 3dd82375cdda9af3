//! Denormalized storage encoding of a transaction's inputs, outputs and
//! touched addresses: three independent JSON arrays.
//!
//! Records are strict. Every field must be present and unknown fields are
//! rejected, so a row written under a different layout fails loudly
//! instead of decoding into half-filled structs. Resolved output addresses
//! are not persisted; they are recomputed after decoding.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{Transaction, TxIn, TxOut};

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TxInRecord {
    amount: i64,
    // nullable but required: a missing key is a shape mismatch
    #[serde(deserialize_with = "Option::deserialize")]
    address_id: Option<i64>,
    prev_out: String,
    size: i32,
    signature_script: String,
    sequence: i64,
    #[serde(deserialize_with = "Option::deserialize")]
    witness: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct TxOutRecord {
    val: i64,
    pk_script: String,
}

pub fn encode_txins(txins: &[TxIn]) -> Result<String> {
    let records: Vec<TxInRecord> = txins
        .iter()
        .map(|txin| TxInRecord {
            amount: txin.amount,
            address_id: txin.address_id,
            prev_out: txin.prev_out.clone(),
            size: txin.size,
            signature_script: txin.signature_script.clone(),
            sequence: txin.sequence,
            witness: txin.witness.clone(),
        })
        .collect();
    Ok(serde_json::to_string(&records)?)
}

pub fn decode_txins(raw: &str) -> Result<Vec<TxIn>> {
    let records: Vec<TxInRecord> =
        serde_json::from_str(raw).map_err(|e| Error::decode("txins", e))?;
    Ok(records
        .into_iter()
        .map(|r| TxIn {
            id: None,
            amount: r.amount,
            prev_out: r.prev_out,
            size: r.size,
            signature_script: r.signature_script,
            sequence: r.sequence,
            witness: r.witness,
            address: None,
            address_id: r.address_id,
        })
        .collect())
}

pub fn encode_txouts(txouts: &[TxOut]) -> Result<String> {
    let records: Vec<TxOutRecord> = txouts
        .iter()
        .map(|txout| TxOutRecord {
            val: txout.value,
            pk_script: txout.pk_script.clone(),
        })
        .collect();
    Ok(serde_json::to_string(&records)?)
}

pub fn decode_txouts(raw: &str) -> Result<Vec<TxOut>> {
    let records: Vec<TxOutRecord> =
        serde_json::from_str(raw).map_err(|e| Error::decode("txouts", e))?;
    Ok(records
        .into_iter()
        .map(|r| TxOut::new(r.val, r.pk_script))
        .collect())
}

pub fn encode_addresses(ids: &[i64]) -> Result<String> {
    Ok(serde_json::to_string(ids)?)
}

pub fn decode_addresses(raw: &str) -> Result<Vec<i64>> {
    serde_json::from_str(raw).map_err(|e| Error::decode("addresses", e))
}

/// The three blobs stored alongside a transaction's scalar columns.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTransaction {
    pub txins: String,
    pub txouts: String,
    pub addresses: String,
}

impl EncodedTransaction {
    pub fn encode(tx: &Transaction) -> Result<Self> {
        Ok(Self {
            txins: encode_txins(&tx.txins)?,
            txouts: encode_txouts(&tx.txouts)?,
            addresses: encode_addresses(&tx.addresses)?,
        })
    }
}
