//! Point-in-time BTC price lookup: the nearest sample at or before a
//! timestamp, never a later one.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Block, PriceSample, Transaction};

#[derive(Debug, Clone, Default)]
pub struct PriceHistory {
    samples: Vec<PriceSample>,
}

/// Outcome of pricing a batch: one entry per transaction that stayed
/// unpriced, the rest were filled in.
#[derive(Debug, Default)]
pub struct PriceReport {
    pub priced: usize,
    pub missing: Vec<(String, Error)>,
}

impl PriceHistory {
    pub fn new(mut samples: Vec<PriceSample>) -> Self {
        samples.sort_by_key(|s| s.created_at);
        Self { samples }
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn price_at(&self, at: DateTime<Utc>) -> Result<f64> {
        let idx = self.samples.partition_point(|s| s.created_at <= at);
        idx.checked_sub(1)
            .map(|i| self.samples[i].price)
            .ok_or(Error::PriceUnavailable { at })
    }

    pub fn attach_block(&self, block: &mut Block) -> Result<f64> {
        let price = self.price_at(block.created_at)?;
        block.price = Some(price);
        Ok(price)
    }

    /// Price every transaction independently. A missing sample leaves that
    /// transaction's price `None` and is reported, the batch carries on.
    pub fn attach_transactions(&self, transactions: &mut [Transaction]) -> PriceReport {
        let mut report = PriceReport::default();
        for tx in transactions.iter_mut() {
            match self.price_at(tx.created_at) {
                Ok(price) => {
                    tx.price = Some(price);
                    report.priced += 1;
                }
                Err(e) => {
                    debug!(tx = %tx.hash, error = %e, "transaction left unpriced");
                    tx.price = None;
                    report.missing.push((tx.hash.clone(), e));
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_300_000_000 + secs, 0).unwrap()
    }

    fn tx_at(hash: &str, at: DateTime<Utc>) -> Transaction {
        Transaction {
            id: 1,
            block_id: 1,
            hash: hash.into(),
            has_witness: false,
            created_at: at,
            price: None,
            txins: vec![],
            txouts: vec![],
            addresses: vec![],
        }
    }

    fn history() -> PriceHistory {
        PriceHistory::new(vec![
            PriceSample { created_at: t(300), price: 30.0 },
            PriceSample { created_at: t(100), price: 10.0 },
            PriceSample { created_at: t(200), price: 20.0 },
        ])
    }

    #[test]
    fn nearest_preceding_sample_wins() {
        let prices = history();
        assert_eq!(prices.price_at(t(100)).unwrap(), 10.0);
        assert_eq!(prices.price_at(t(199)).unwrap(), 10.0);
        assert_eq!(prices.price_at(t(200)).unwrap(), 20.0);
        assert_eq!(prices.price_at(t(10_000)).unwrap(), 30.0);
    }

    #[test]
    fn before_first_sample_is_unavailable_not_zero() {
        let err = history().price_at(t(99)).unwrap_err();
        assert!(matches!(err, Error::PriceUnavailable { at } if at == t(99)));
        assert!(PriceHistory::default().price_at(t(0)).is_err());
    }

    #[test]
    fn batch_reports_missing_prices_per_transaction() {
        // T1 < T2 < T3 with one sample at T2
        let prices = PriceHistory::new(vec![PriceSample { created_at: t(200), price: 7.5 }]);
        let mut txs = vec![
            tx_at("t1", t(100)),
            tx_at("t2", t(200)),
            tx_at("t3", t(200) + Duration::seconds(60)),
        ];
        let report = prices.attach_transactions(&mut txs);

        assert_eq!(report.priced, 2);
        assert_eq!(report.missing.len(), 1);
        assert_eq!(report.missing[0].0, "t1");
        assert_eq!(txs[0].price, None);
        assert_eq!(txs[1].price, Some(7.5));
        assert_eq!(txs[2].price, Some(7.5));
    }

    #[test]
    fn block_price_follows_creation_time() {
        let mut block = Block {
            id: 1,
            bits: 0x1d00ffff,
            height: 0,
            nonce: 0,
            version: 1,
            hash_prev_block: String::new(),
            hash_merkle_root: String::new(),
            created_at: t(250),
            hash: "00".into(),
            transactions: vec![],
            price: None,
        };
        assert_eq!(history().attach_block(&mut block).unwrap(), 20.0);
        assert_eq!(block.price, Some(20.0));
    }
}
