//! In-memory storage backend.
//!
//! Keeps transactions in their encoded (blob) form, like the Postgres
//! backend, and derives cross-join rows from them on demand. Useful for
//! tests and dry-run ingests. All data is lost when the process exits.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{is_known_duplicate, link_addresses, AddressDelta, Storage, TxFilter};
use crate::assembler::{BlobRow, InputColumns, JoinRow, OutputColumns, TxColumns};
use crate::codec::{self, EncodedTransaction};
use crate::error::{Error, Result};
use crate::models::{Address, Block, PriceSample, Transaction, TxOut};

struct StoredTx {
    columns: TxColumns,
    encoded: EncodedTransaction,
    /// Row ids handed out to inputs and outputs, for the join shape.
    input_ids: Vec<i64>,
    output_ids: Vec<i64>,
}

#[derive(Default)]
struct Tables {
    blocks: Vec<Block>,
    transactions: Vec<StoredTx>,
    addresses: Vec<Address>,
    prices: Vec<PriceSample>,
    next_row_id: i64,
}

impl Tables {
    fn row_id(&mut self) -> i64 {
        self.next_row_id += 1;
        self.next_row_id
    }

    fn stored_tx_id(&self, hash: &str) -> Option<i64> {
        self.transactions
            .iter()
            .find(|t| t.columns.hash == hash)
            .map(|t| t.columns.id)
    }

    fn push_block(&mut self, block: &mut Block) {
        block.id = self.blocks.len() as i64 + 1;
        let mut stored = block.clone();
        stored.transactions.clear();
        stored.price = None;
        self.blocks.push(stored);
    }

    fn push_transaction(&mut self, tx: &mut Transaction, encoded: EncodedTransaction) {
        tx.id = self.transactions.len() as i64 + 1;
        let input_ids = (0..tx.txins.len()).map(|_| self.row_id()).collect();
        let output_ids = (0..tx.txouts.len()).map(|_| self.row_id()).collect();
        self.transactions.push(StoredTx {
            columns: TxColumns {
                id: tx.id,
                block_id: tx.block_id,
                hash: tx.hash.clone(),
                has_witness: tx.has_witness,
                created_at: tx.created_at,
            },
            encoded,
            input_ids,
            output_ids,
        });
    }

    fn upsert_address(&mut self, hash: &str, income: i64, outcome: i64, at: DateTime<Utc>) -> Address {
        if let Some(address) = self.addresses.iter_mut().find(|a| a.hash == hash) {
            address.income += income;
            address.outcome += outcome;
            address.balance = address.income - address.outcome;
            address.updated_at = at;
            return address.clone();
        }
        let address = Address {
            id: self.addresses.len() as i64 + 1,
            hash: hash.to_string(),
            income,
            outcome,
            balance: income - outcome,
            updated_at: at,
            transactions: Vec::new(),
        };
        self.addresses.push(address.clone());
        address
    }

    fn matching(&self, filter: &TxFilter) -> Result<Vec<&StoredTx>> {
        let mut found = Vec::new();
        for stored in &self.transactions {
            let hit = match filter {
                TxFilter::BlockId(id) => stored.columns.block_id == *id,
                TxFilter::Hash(hash) => stored.columns.hash == *hash,
                TxFilter::Address { id, .. } => {
                    codec::decode_addresses(&stored.encoded.addresses)?.contains(id)
                }
            };
            if hit {
                found.push(stored);
            }
        }
        found.sort_by(|a, b| b.columns.id.cmp(&a.columns.id));
        Ok(found)
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transaction_count(&self) -> usize {
        self.tables.lock().unwrap().transactions.len()
    }

    pub fn block_count(&self) -> usize {
        self.tables.lock().unwrap().blocks.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn join_rows(&self, filter: &TxFilter) -> Result<Vec<JoinRow>> {
        let tables = self.tables.lock().unwrap();
        let mut rows = Vec::new();
        for stored in tables.matching(filter)? {
            let txins = codec::decode_txins(&stored.encoded.txins)?;
            let txouts = codec::decode_txouts(&stored.encoded.txouts)?;

            let inputs: Vec<Option<InputColumns>> = if txins.is_empty() {
                vec![None]
            } else {
                txins
                    .into_iter()
                    .zip(&stored.input_ids)
                    .map(|(txin, &id)| {
                        let address = txin
                            .address_id
                            .and_then(|aid| tables.addresses.iter().find(|a| a.id == aid))
                            .map(|a| a.hash.clone());
                        Some(InputColumns {
                            id,
                            amount: txin.amount,
                            prev_out: txin.prev_out,
                            size: txin.size,
                            signature_script: txin.signature_script,
                            sequence: txin.sequence,
                            witness: txin.witness,
                            address,
                            address_id: txin.address_id,
                        })
                    })
                    .collect()
            };
            let outputs: Vec<Option<OutputColumns>> = if txouts.is_empty() {
                vec![None]
            } else {
                txouts
                    .into_iter()
                    .zip(&stored.output_ids)
                    .map(|(txout, &id)| {
                        Some(OutputColumns {
                            id,
                            value: txout.value,
                            pk_script: txout.pk_script,
                        })
                    })
                    .collect()
            };

            for input in &inputs {
                for output in &outputs {
                    rows.push(JoinRow {
                        tx: stored.columns.clone(),
                        input: input.clone(),
                        output: output.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn blob_rows(&self, filter: &TxFilter) -> Result<Vec<BlobRow>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .matching(filter)?
            .into_iter()
            .map(|stored| BlobRow {
                tx: stored.columns.clone(),
                txins: stored.encoded.txins.clone(),
                txouts: stored.encoded.txouts.clone(),
                addresses: stored.encoded.addresses.clone(),
            })
            .collect())
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Block> {
        let tables = self.tables.lock().unwrap();
        tables
            .blocks
            .iter()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("block {hash}")))
    }

    async fn latest_blocks(&self, limit: i64) -> Result<Vec<Block>> {
        let tables = self.tables.lock().unwrap();
        let mut blocks = tables.blocks.clone();
        blocks.sort_by(|a, b| b.id.cmp(&a.id));
        blocks.truncate(limit.max(0) as usize);
        Ok(blocks)
    }

    async fn address_by_hash(&self, hash: &str) -> Result<Address> {
        let tables = self.tables.lock().unwrap();
        tables
            .addresses
            .iter()
            .find(|a| a.hash == hash)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("address {hash}")))
    }

    async fn address_hashes(&self, ids: &[i64]) -> Result<HashMap<i64, String>> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .addresses
            .iter()
            .filter(|a| ids.contains(&a.id))
            .map(|a| (a.id, a.hash.clone()))
            .collect())
    }

    async fn previous_output(&self, txid: &str, vout: u32) -> Result<Option<TxOut>> {
        let tables = self.tables.lock().unwrap();
        let Some(stored) = tables.transactions.iter().find(|t| t.columns.hash == txid) else {
            return Ok(None);
        };
        let mut txouts = codec::decode_txouts(&stored.encoded.txouts)?;
        let index = vout as usize;
        if index >= txouts.len() {
            return Ok(None);
        }
        Ok(Some(txouts.swap_remove(index)))
    }

    async fn insert_block(&self, block: &mut Block) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        if tables.blocks.iter().any(|b| b.hash == block.hash) {
            return Err(Error::DuplicateKey(format!("block {}", block.hash)));
        }
        tables.push_block(block);
        Ok(())
    }

    async fn insert_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let encoded = EncodedTransaction::encode(tx)?;
        let mut tables = self.tables.lock().unwrap();

        if let Some(id) = tables.stored_tx_id(&tx.hash) {
            if is_known_duplicate(&tx.hash) {
                tx.id = id;
                return Ok(());
            }
            return Err(Error::DuplicateKey(format!("transaction {}", tx.hash)));
        }
        tables.push_transaction(tx, encoded);
        Ok(())
    }

    async fn store_block(&self, block: &mut Block, deltas: &[AddressDelta]) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();

        // every check runs before the first write
        if tables.blocks.iter().any(|b| b.hash == block.hash) {
            return Err(Error::DuplicateKey(format!("block {}", block.hash)));
        }
        {
            let mut seen = HashSet::new();
            for tx in &block.transactions {
                let repeated = tables.stored_tx_id(&tx.hash).is_some() || !seen.insert(tx.hash.as_str());
                if repeated && !is_known_duplicate(&tx.hash) {
                    return Err(Error::DuplicateKey(format!("transaction {}", tx.hash)));
                }
            }
        }

        let mut ids: HashMap<String, i64> = HashMap::with_capacity(deltas.len());
        let mut next_address = tables.addresses.len() as i64;
        for delta in deltas {
            if ids.contains_key(&delta.hash) {
                continue;
            }
            let id = match tables.addresses.iter().find(|a| a.hash == delta.hash) {
                Some(address) => address.id,
                None => {
                    next_address += 1;
                    next_address
                }
            };
            ids.insert(delta.hash.clone(), id);
        }

        let block_id = tables.blocks.len() as i64 + 1;
        let mut encoded = Vec::with_capacity(block.transactions.len());
        for tx in &mut block.transactions {
            tx.block_id = block_id;
            link_addresses(tx, &ids);
            encoded.push(EncodedTransaction::encode(tx)?);
        }

        tables.push_block(block);
        for delta in deltas {
            tables.upsert_address(&delta.hash, delta.income, delta.outcome, block.created_at);
        }
        for (tx, encoded) in block.transactions.iter_mut().zip(encoded) {
            match tables.stored_tx_id(&tx.hash) {
                Some(id) => tx.id = id,
                None => tables.push_transaction(tx, encoded),
            }
        }
        Ok(())
    }

    async fn apply_address_delta(
        &self,
        hash: &str,
        income: i64,
        outcome: i64,
        at: DateTime<Utc>,
    ) -> Result<Address> {
        let mut tables = self.tables.lock().unwrap();
        Ok(tables.upsert_address(hash, income, outcome, at))
    }

    async fn price_samples(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceSample>> {
        let tables = self.tables.lock().unwrap();
        let mut samples: Vec<PriceSample> = tables.prices.clone();
        samples.sort_by_key(|s| s.created_at);
        let before = samples.iter().rev().find(|s| s.created_at < from).copied();
        Ok(before
            .into_iter()
            .chain(samples.into_iter().filter(|s| s.created_at >= from && s.created_at <= to))
            .collect())
    }

    async fn insert_prices(&self, samples: &[PriceSample]) -> Result<u64> {
        let mut tables = self.tables.lock().unwrap();
        tables.prices.extend_from_slice(samples);
        Ok(samples.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assembler::{assemble_blobs, assemble_rows};
    use crate::models::TxIn;
    use crate::storage::DUPLICATE_TXIDS;
    use chrono::TimeZone;

    fn tx(hash: &str, inputs: usize, outputs: usize) -> Transaction {
        Transaction {
            id: 0,
            block_id: 1,
            hash: hash.into(),
            has_witness: false,
            created_at: Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap(),
            price: None,
            txins: (0..inputs)
                .map(|i| TxIn {
                    id: None,
                    amount: 10,
                    prev_out: format!("{}:{i}", "ab".repeat(32)),
                    size: 41,
                    signature_script: String::new(),
                    sequence: 0,
                    witness: None,
                    address: None,
                    address_id: None,
                })
                .collect(),
            txouts: (0..outputs).map(|i| TxOut::new(i as i64, "51")).collect(),
            addresses: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_hashes_are_rejected_unless_known() {
        let store = MemoryStorage::new();
        store.insert_transaction(&mut tx("aa", 1, 1)).await.unwrap();
        let err = store.insert_transaction(&mut tx("aa", 1, 1)).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));

        let dup = DUPLICATE_TXIDS[0];
        let mut first = tx(dup, 1, 1);
        let mut second = tx(dup, 1, 1);
        store.insert_transaction(&mut first).await.unwrap();
        store.insert_transaction(&mut second).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(store.transaction_count(), 2);
    }

    #[tokio::test]
    async fn join_and_blob_shapes_describe_the_same_transactions() {
        let store = MemoryStorage::new();
        store.insert_transaction(&mut tx("t1", 3, 2)).await.unwrap();
        store.insert_transaction(&mut tx("t2", 0, 2)).await.unwrap();

        let filter = TxFilter::BlockId(1);
        let rows = store.join_rows(&filter).await.unwrap();
        assert_eq!(rows.len(), 3 * 2 + 2);

        let joined = assemble_rows(rows);
        let blobs = assemble_blobs(store.blob_rows(&filter).await.unwrap()).unwrap();
        assert_eq!(joined.len(), 2);
        assert_eq!(blobs.len(), 2);
        for (a, b) in joined.iter().zip(&blobs) {
            assert_eq!(a.hash, b.hash);
            assert_eq!(a.txins.len(), b.txins.len());
            assert_eq!(a.txouts.len(), b.txouts.len());
        }
        assert_eq!(joined[0].hash, "t2");
    }

    fn block(hash: &str, transactions: Vec<Transaction>) -> Block {
        Block {
            id: 0,
            bits: 0x1d00ffff,
            height: 1,
            nonce: 0,
            version: 1,
            hash_prev_block: "00".repeat(32),
            hash_merkle_root: "00".repeat(32),
            created_at: Utc.with_ymd_and_hms(2012, 1, 1, 0, 0, 0).unwrap(),
            hash: hash.into(),
            transactions,
            price: None,
        }
    }

    fn delta(hash: &str, income: i64, outcome: i64) -> AddressDelta {
        AddressDelta { hash: hash.into(), income, outcome }
    }

    #[tokio::test]
    async fn store_block_links_addresses_and_assigns_ids() {
        let store = MemoryStorage::new();
        store.apply_address_delta("1old", 50, 0, Utc::now()).await.unwrap();

        let mut paying = tx("t1", 1, 1);
        paying.txins[0].address = Some("1old".into());
        paying.txouts[0].addresses = Some(vec!["1new".into()]);
        let mut b = block("b1", vec![paying]);
        store
            .store_block(&mut b, &[delta("1old", 0, 10), delta("1new", 10, 0)])
            .await
            .unwrap();

        let tx = &b.transactions[0];
        assert_eq!(b.id, 1);
        assert_eq!(tx.block_id, 1);
        assert_eq!(tx.txins[0].address_id, Some(1));
        assert_eq!(tx.addresses, vec![1, 2]);
        assert_eq!(store.address_by_hash("1old").await.unwrap().balance, 40);
        assert_eq!(store.address_by_hash("1new").await.unwrap().id, 2);
        let rows = store.blob_rows(&TxFilter::BlockId(1)).await.unwrap();
        assert_eq!(rows[0].addresses, "[1,2]");
    }

    #[tokio::test]
    async fn failed_store_block_writes_nothing() {
        let store = MemoryStorage::new();
        store.store_block(&mut block("b1", vec![tx("t1", 1, 1)]), &[]).await.unwrap();

        let mut fork = block("b2", vec![tx("t2", 1, 1), tx("t1", 1, 1)]);
        let err = store
            .store_block(&mut fork, &[delta("1someone", 10, 0)])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey(_)));
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.transaction_count(), 1);
        assert!(store.address_by_hash("1someone").await.unwrap_err().is_not_found());

        let mut twice = block("b3", vec![tx("t3", 1, 1), tx("t3", 1, 1)]);
        assert!(store.store_block(&mut twice, &[]).await.is_err());
        assert_eq!(store.block_count(), 1);
    }

    #[tokio::test]
    async fn address_delta_keeps_balance() {
        let store = MemoryStorage::new();
        let at = Utc::now();
        store.apply_address_delta("1abc", 100, 0, at).await.unwrap();
        let address = store.apply_address_delta("1abc", 0, 30, at).await.unwrap();
        assert_eq!((address.income, address.outcome, address.balance), (100, 30, 70));
        assert!(store.address_by_hash("1zzz").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn price_window_includes_preceding_sample() {
        let store = MemoryStorage::new();
        let t = |h| Utc.with_ymd_and_hms(2013, 1, 1, h, 0, 0).unwrap();
        store
            .insert_prices(&[
                PriceSample { created_at: t(1), price: 1.0 },
                PriceSample { created_at: t(2), price: 2.0 },
                PriceSample { created_at: t(5), price: 5.0 },
                PriceSample { created_at: t(9), price: 9.0 },
            ])
            .await
            .unwrap();
        let window = store.price_samples(t(3), t(6)).await.unwrap();
        let prices: Vec<f64> = window.iter().map(|s| s.price).collect();
        assert_eq!(prices, vec![2.0, 5.0]);
    }
}
