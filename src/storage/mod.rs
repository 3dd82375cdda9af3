//! Storage capability set consumed by the core.
//!
//! The core only needs to read rows (join or blob shape), look up single
//! records, insert blocks and transactions, and update address totals.
//! Ingest writes a whole block through [`Storage::store_block`] so a failed
//! block leaves no partial rows or address changes behind.
//! Backends: [`postgres::PgStorage`] and [`memory::MemoryStorage`].

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::assembler::{BlobRow, JoinRow};
use crate::error::Result;
use crate::models::{Address, Block, PriceSample, Transaction, TxOut};

/// Historical coinbase txids that appear twice on chain (BIP30). A second
/// insert of either one is a no-op instead of a uniqueness violation.
pub const DUPLICATE_TXIDS: [&str; 2] = [
    "d5d27987d2a3dfc724e359870c6644b40e497bdc0589a033220fe15429d88599",
    "e3bf3d07d4b0375638d5f1db5255fe07ba2c4cb067cd81b84ee974b6585fb468",
];

pub fn is_known_duplicate(txid: &str) -> bool {
    DUPLICATE_TXIDS.contains(&txid)
}

/// Net change a block makes to one address. A zero delta still creates the
/// address so it can be linked from the block's transactions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressDelta {
    pub hash: String,
    pub income: i64,
    pub outcome: i64,
}

/// Fill `TxIn::address_id` from `TxIn::address` and set the transaction's
/// address set from its inputs and every resolved output owner.
pub fn link_addresses(tx: &mut Transaction, ids: &HashMap<String, i64>) {
    for txin in &mut tx.txins {
        if let Some(id) = txin.address.as_ref().and_then(|hash| ids.get(hash)) {
            txin.address_id = Some(*id);
        }
    }
    let output_ids: Vec<i64> = tx
        .txouts
        .iter()
        .flat_map(|txout| txout.addresses.iter().flatten())
        .filter_map(|hash| ids.get(hash).copied())
        .collect();
    tx.collect_addresses(output_ids);
}

/// Which transactions to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxFilter {
    BlockId(i64),
    /// Transactions whose inputs or outputs touch the address.
    Address { id: i64, hash: String },
    Hash(String),
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Cross-join rows, contiguous per transaction, newest transaction first.
    async fn join_rows(&self, filter: &TxFilter) -> Result<Vec<JoinRow>>;

    /// Pre-joined rows, newest transaction first.
    async fn blob_rows(&self, filter: &TxFilter) -> Result<Vec<BlobRow>>;

    async fn block_by_hash(&self, hash: &str) -> Result<Block>;

    async fn latest_blocks(&self, limit: i64) -> Result<Vec<Block>>;

    async fn address_by_hash(&self, hash: &str) -> Result<Address>;

    /// Canonical hashes for address ids. Unknown ids are left out.
    async fn address_hashes(&self, ids: &[i64]) -> Result<HashMap<i64, String>>;

    /// The stored output `vout` of transaction `txid`, if both are known.
    async fn previous_output(&self, txid: &str, vout: u32) -> Result<Option<TxOut>>;

    /// Insert a block and fill in its id.
    async fn insert_block(&self, block: &mut Block) -> Result<()>;

    /// Insert a transaction with its encoded inputs, outputs and addresses,
    /// filling in its id. Known duplicate txids resolve to the stored row.
    async fn insert_transaction(&self, tx: &mut Transaction) -> Result<()>;

    /// Write `block`, its transactions and `deltas` as one unit, filling in
    /// block, transaction and address ids. Transactions name addresses by
    /// hash (`TxIn::address`, resolved `TxOut` owners); every hash they use
    /// must appear in `deltas`. Any error leaves storage unchanged.
    async fn store_block(&self, block: &mut Block, deltas: &[AddressDelta]) -> Result<()>;

    /// Add to an address's income and outcome, creating it on first use.
    /// Keeps `balance = income - outcome`.
    async fn apply_address_delta(
        &self,
        hash: &str,
        income: i64,
        outcome: i64,
        at: DateTime<Utc>,
    ) -> Result<Address>;

    /// Samples in `[from, to]` plus the last sample before `from`.
    async fn price_samples(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceSample>>;

    async fn insert_prices(&self, samples: &[PriceSample]) -> Result<u64>;
}
