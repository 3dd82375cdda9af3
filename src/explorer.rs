//! Read side: blocks, addresses and their transactions, priced and with
//! output owners resolved.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::assembler::{assemble_blobs, assemble_rows};
use crate::config::{Context, RowShape};
use crate::error::Result;
use crate::models::{Address, Block, Transaction};
use crate::price::{PriceHistory, PriceReport};
use crate::storage::{Storage, TxFilter};

/// An address with its transactions, plus the hashes of transactions whose
/// price could not be determined.
#[derive(Debug, Serialize)]
pub struct AddressView {
    #[serde(flatten)]
    pub address: Address,
    pub unpriced: Vec<String>,
}

pub struct Explorer {
    storage: Arc<dyn Storage>,
    ctx: Arc<Context>,
}

impl Explorer {
    pub fn new(storage: Arc<dyn Storage>, ctx: Arc<Context>) -> Self {
        Self { storage, ctx }
    }

    /// Transactions matching `filter`, newest first, through whichever row
    /// shape is configured. Input owners are filled from the address table
    /// and output owners are resolved from their scripts.
    pub async fn transactions(&self, filter: &TxFilter) -> Result<Vec<Transaction>> {
        let mut transactions = match self.ctx.config.row_shape {
            RowShape::Blob => assemble_blobs(self.storage.blob_rows(filter).await?)?,
            RowShape::Join => assemble_rows(self.storage.join_rows(filter).await?),
        };

        let missing: Vec<i64> = transactions
            .iter()
            .flat_map(|tx| &tx.txins)
            .filter(|txin| txin.address.is_none())
            .filter_map(|txin| txin.address_id)
            .collect();
        if !missing.is_empty() {
            let hashes = self.storage.address_hashes(&missing).await?;
            for txin in transactions.iter_mut().flat_map(|tx| tx.txins.iter_mut()) {
                if txin.address.is_none() {
                    txin.address = txin.address_id.and_then(|id| hashes.get(&id).cloned());
                }
            }
        }

        let network = self.ctx.network();
        for tx in &mut transactions {
            tx.resolve_outputs(network)?;
        }
        debug!(?filter, count = transactions.len(), "transactions assembled");
        Ok(transactions)
    }

    pub async fn block_by_hash(&self, hash: &str) -> Result<Block> {
        let mut block = self.storage.block_by_hash(hash).await?;
        block.transactions = self.transactions(&TxFilter::BlockId(block.id)).await?;

        let prices = self.prices_for(block.created_at, block.created_at).await?;
        if let Err(e) = prices.attach_block(&mut block) {
            warn!(block = %block.hash, error = %e, "block left unpriced");
        }
        prices.attach_transactions(&mut block.transactions);
        Ok(block)
    }

    pub async fn address_by_hash(&self, hash: &str) -> Result<AddressView> {
        let mut address = self.storage.address_by_hash(hash).await?;
        let filter = TxFilter::Address {
            id: address.id,
            hash: address.hash.clone(),
        };
        address.transactions = self.transactions(&filter).await?;

        let report = match window(&address.transactions) {
            Some((from, to)) => self
                .prices_for(from, to)
                .await?
                .attach_transactions(&mut address.transactions),
            None => PriceReport::default(),
        };
        for (tx, e) in &report.missing {
            warn!(address = %address.hash, tx = %tx, error = %e, "transaction left unpriced");
        }
        Ok(AddressView {
            address,
            unpriced: report.missing.into_iter().map(|(tx, _)| tx).collect(),
        })
    }

    pub async fn latest_blocks(&self, limit: i64) -> Result<Vec<Block>> {
        self.storage.latest_blocks(limit).await
    }

    async fn prices_for(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<PriceHistory> {
        Ok(PriceHistory::new(self.storage.price_samples(from, to).await?))
    }
}

fn window(transactions: &[Transaction]) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let from = transactions.iter().map(|tx| tx.created_at).min()?;
    let to = transactions.iter().map(|tx| tx.created_at).max()?;
    Some((from, to))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::Error;
    use crate::models::{PriceSample, TxIn, TxOut};
    use crate::storage::memory::MemoryStorage;
    use chrono::{Duration, TimeZone};

    const OWNER: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
    const OWNER_SCRIPT: &str = "76a91462e907b15cbf27d5425399ebf6f0fb50ebb88f1888ac";

    fn explorer(storage: Arc<MemoryStorage>, row_shape: RowShape) -> Explorer {
        Explorer::new(
            storage,
            Context::new(Config {
                row_shape,
                ..Config::default()
            }),
        )
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2014, 3, 1, 12, 0, 0).unwrap()
    }

    async fn seed(storage: &MemoryStorage) -> Block {
        let mut block = Block {
            id: 0,
            bits: 0x1d00ffff,
            height: 10,
            nonce: 1,
            version: 2,
            hash_prev_block: "11".repeat(32),
            hash_merkle_root: "22".repeat(32),
            created_at: t0(),
            hash: "33".repeat(32),
            transactions: vec![],
            price: None,
        };
        storage.insert_block(&mut block).await.unwrap();
        let owner = storage.apply_address_delta(OWNER, 50, 0, t0()).await.unwrap();

        let mut tx = Transaction {
            id: 0,
            block_id: block.id,
            hash: "44".repeat(32),
            has_witness: false,
            created_at: t0(),
            price: None,
            txins: vec![TxIn {
                id: None,
                amount: 50,
                prev_out: format!("{}:0", "55".repeat(32)),
                size: 41,
                signature_script: "00".into(),
                sequence: 0xffff_ffff,
                witness: None,
                address: None,
                address_id: Some(owner.id),
            }],
            txouts: vec![TxOut::new(20, OWNER_SCRIPT), TxOut::new(30, "ff00")],
            addresses: vec![owner.id],
        };
        storage.insert_transaction(&mut tx).await.unwrap();
        block
    }

    #[tokio::test]
    async fn block_view_is_the_same_for_both_row_shapes() {
        let storage = Arc::new(MemoryStorage::new());
        let seeded = seed(&storage).await;
        storage
            .insert_prices(&[PriceSample { created_at: t0() - Duration::hours(1), price: 600.0 }])
            .await
            .unwrap();

        for shape in [RowShape::Blob, RowShape::Join] {
            let block = explorer(storage.clone(), shape)
                .block_by_hash(&seeded.hash)
                .await
                .unwrap();
            assert_eq!(block.price, Some(600.0));
            assert_eq!(block.transactions.len(), 1);

            let tx = &block.transactions[0];
            assert_eq!(tx.price, Some(600.0));
            assert_eq!(tx.txins[0].address.as_deref(), Some(OWNER));
            assert_eq!(tx.txouts[0].addresses.as_deref(), Some(&[OWNER.to_string()][..]));
            assert_eq!(
                tx.txouts[1].addresses.as_deref(),
                Some(&["nonstandard-ff00".to_string()][..])
            );
        }
    }

    #[tokio::test]
    async fn missing_price_leaves_block_unpriced() {
        let storage = Arc::new(MemoryStorage::new());
        let seeded = seed(&storage).await;
        let block = explorer(storage, RowShape::Blob)
            .block_by_hash(&seeded.hash)
            .await
            .unwrap();
        assert_eq!(block.price, None);
        assert_eq!(block.transactions[0].price, None);
    }

    #[tokio::test]
    async fn address_view_reports_unpriced_transactions() {
        let storage = Arc::new(MemoryStorage::new());
        seed(&storage).await;
        let view = explorer(storage, RowShape::Blob)
            .address_by_hash(OWNER)
            .await
            .unwrap();
        assert_eq!(view.address.transactions.len(), 1);
        assert_eq!(view.unpriced, vec!["44".repeat(32)]);
    }

    #[tokio::test]
    async fn unknown_hashes_are_not_found() {
        let storage = Arc::new(MemoryStorage::new());
        let explorer = explorer(storage, RowShape::Blob);
        assert!(matches!(explorer.block_by_hash("00").await, Err(Error::NotFound(_))));
        assert!(matches!(explorer.address_by_hash("1x").await, Err(Error::NotFound(_))));
        assert!(explorer.latest_blocks(10).await.unwrap().is_empty());
    }
}
