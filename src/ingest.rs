//! Loads raw `blk*.dat` files into storage.
//!
//! A blocking reader task walks the block files in name order and hands
//! decoded blocks over a channel; the consumer derives heights, resolves
//! addresses and writes through the [`Storage`] interface.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::Context;
use crate::error::{Error, Result};
use crate::models::{Block, Transaction, TxIn, TxOut, COINBASE_PREV_TXID};
use crate::rawblock::{self, RawBlock, RawTransaction};
use crate::storage::{is_known_duplicate, AddressDelta, Storage, TxFilter};

const PROGRESS_EVERY: usize = 250;

/// What happened to one block handed to [`Ingestor::ingest_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored, together with any held children it unblocked.
    Stored { hashes: Vec<String> },
    /// Parent unknown so far; kept until it arrives.
    Held,
    /// Already in storage.
    Duplicate,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestSummary {
    pub files: usize,
    pub stored: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Blocks still held at the end: the parent never showed up, or the
    /// block failed to store once it did.
    pub orphaned: usize,
}

/// Address totals one block changes, in first-touched order.
#[derive(Debug, Default)]
struct Ledger {
    deltas: Vec<AddressDelta>,
    index: HashMap<String, usize>,
}

impl Ledger {
    fn add(&mut self, hash: &str, income: i64, outcome: i64) {
        match self.index.get(hash) {
            Some(&i) => {
                self.deltas[i].income += income;
                self.deltas[i].outcome += outcome;
            }
            None => {
                self.index.insert(hash.to_string(), self.deltas.len());
                self.deltas.push(AddressDelta {
                    hash: hash.to_string(),
                    income,
                    outcome,
                });
            }
        }
    }
}

pub struct Ingestor {
    storage: Arc<dyn Storage>,
    ctx: Arc<Context>,
    /// Blocks waiting for their parent, keyed by the parent hash.
    pending: HashMap<String, Vec<RawBlock>>,
}

impl Ingestor {
    pub fn new(storage: Arc<dyn Storage>, ctx: Arc<Context>) -> Self {
        Self {
            storage,
            ctx,
            pending: HashMap::new(),
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Store `raw` if its parent is known, then every held descendant it
    /// unblocks. A held descendant that fails to store is logged and held
    /// again; an error is only returned for `raw` itself.
    pub async fn ingest_block(&mut self, raw: RawBlock) -> Result<IngestOutcome> {
        if self.is_block_stored(&raw.hash).await? {
            debug!(block = %raw.hash, "block already stored");
            return Ok(IngestOutcome::Duplicate);
        }
        let height = match self.parent_height(&raw.previous_block).await? {
            Some(parent) => parent + 1,
            None => {
                debug!(block = %raw.hash, parent = %raw.previous_block, "parent not stored yet, holding block");
                self.hold(raw);
                return Ok(IngestOutcome::Held);
            }
        };

        self.store(&raw, height).await?;
        let mut queue: VecDeque<(RawBlock, i32)> = self.take_children(&raw.hash, height).into();
        let mut hashes = vec![raw.hash];
        while let Some((child, height)) = queue.pop_front() {
            match self.store_held(&child, height).await {
                Ok(true) => {
                    queue.extend(self.take_children(&child.hash, height));
                    hashes.push(child.hash);
                }
                Ok(false) => debug!(block = %child.hash, "held block already stored"),
                Err(e) => {
                    warn!(block = %child.hash, error = %e, "held block failed to store, keeping it pending");
                    self.hold(child);
                }
            }
        }
        Ok(IngestOutcome::Stored { hashes })
    }

    fn hold(&mut self, raw: RawBlock) {
        self.pending.entry(raw.previous_block.clone()).or_default().push(raw);
    }

    fn take_children(&mut self, hash: &str, height: i32) -> Vec<(RawBlock, i32)> {
        self.pending
            .remove(hash)
            .unwrap_or_default()
            .into_iter()
            .map(|child| (child, height + 1))
            .collect()
    }

    async fn store_held(&self, raw: &RawBlock, height: i32) -> Result<bool> {
        if self.is_block_stored(&raw.hash).await? {
            return Ok(false);
        }
        self.store(raw, height).await?;
        Ok(true)
    }

    async fn is_block_stored(&self, hash: &str) -> Result<bool> {
        match self.storage.block_by_hash(hash).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Height of the stored parent. `Some(-1)` for the genesis block.
    async fn parent_height(&self, previous_block: &str) -> Result<Option<i32>> {
        if previous_block == COINBASE_PREV_TXID {
            return Ok(Some(-1));
        }
        match self.storage.block_by_hash(previous_block).await {
            Ok(parent) => Ok(Some(parent.height)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Build the block with its transactions and address changes, then hand
    /// everything to storage in one write.
    async fn store(&self, raw: &RawBlock, height: i32) -> Result<Block> {
        let mut block = Block {
            id: 0,
            bits: i64::from(raw.bits),
            height,
            nonce: i64::from(raw.nonce),
            version: raw.version,
            hash_prev_block: raw.previous_block.clone(),
            hash_merkle_root: raw.merkle_root.clone(),
            created_at: raw.time,
            hash: raw.hash.clone(),
            transactions: Vec::with_capacity(raw.transactions.len()),
            price: None,
        };

        let mut ledger = Ledger::default();
        // outputs created earlier in this block
        let mut created: HashMap<String, Vec<TxOut>> = HashMap::new();
        for raw_tx in &raw.transactions {
            let tx = self.build_transaction(&block, raw_tx, &created, &mut ledger).await?;
            created.insert(tx.hash.clone(), tx.txouts.clone());
            block.transactions.push(tx);
        }

        self.storage.store_block(&mut block, &ledger.deltas).await?;
        debug!(block = %block.hash, height, txs = block.transactions.len(), "block stored");
        Ok(block)
    }

    async fn build_transaction(
        &self,
        block: &Block,
        raw: &RawTransaction,
        created: &HashMap<String, Vec<TxOut>>,
        ledger: &mut Ledger,
    ) -> Result<Transaction> {
        let mut tx = Transaction {
            id: 0,
            block_id: 0,
            hash: raw.txid.clone(),
            has_witness: raw.has_witness(),
            created_at: block.created_at,
            price: None,
            txins: Vec::with_capacity(raw.inputs.len()),
            txouts: raw
                .outputs
                .iter()
                .map(|out| TxOut::new(out.value, out.script_pub_key.clone()))
                .collect(),
            addresses: Vec::new(),
        };

        // A known duplicate keeps its first occurrence and must not be
        // credited twice.
        if is_known_duplicate(&tx.hash)
            && !self.storage.blob_rows(&TxFilter::Hash(tx.hash.clone())).await?.is_empty()
        {
            warn!(tx = %tx.hash, "duplicate coinbase txid, skipping");
            return Ok(tx);
        }

        for input in &raw.inputs {
            let mut txin = TxIn {
                id: None,
                amount: 0,
                prev_out: format!("{}:{}", input.previous_txid, input.previous_output_index),
                size: input.size as i32,
                signature_script: input.script_sig.clone(),
                sequence: i64::from(input.sequence),
                witness: input.witness.as_deref().map(rawblock::encode_witness),
                address: None,
                address_id: None,
            };
            if !txin.is_coinbase() {
                self.debit_input(&mut txin, created, ledger).await?;
            }
            tx.txins.push(txin);
        }

        let network = self.ctx.network();
        tx.resolve_outputs(network)?;
        for txout in &mut tx.txouts {
            let value = txout.value;
            // the first owner is credited; the rest are linked only
            if let Some((first, rest)) = txout.addresses(network)?.split_first() {
                ledger.add(first, value, 0);
                for other in rest {
                    ledger.add(other, 0, 0);
                }
            }
        }
        Ok(tx)
    }

    /// Attach the spent output's value and owner to the input and debit
    /// that owner. Unknown previous outputs leave the input unresolved.
    async fn debit_input(
        &self,
        txin: &mut TxIn,
        created: &HashMap<String, Vec<TxOut>>,
        ledger: &mut Ledger,
    ) -> Result<()> {
        let Some((txid, vout)) = txin.outpoint() else {
            return Ok(());
        };
        let spent = match created.get(txid).and_then(|outs| outs.get(vout as usize)) {
            Some(out) => Some(out.clone()),
            None => self.storage.previous_output(txid, vout).await?,
        };
        let Some(mut spent) = spent else {
            debug!(prev_out = %txin.prev_out, "previous output not stored");
            return Ok(());
        };
        let value = spent.value;
        txin.amount = value;
        if let Some(owner) = spent.addresses(self.ctx.network())?.first() {
            ledger.add(owner, 0, value);
            txin.address = Some(owner.clone());
        }
        Ok(())
    }
}

/// Read every `blk*.dat` file under `dir` and ingest its blocks in order.
pub async fn run(storage: Arc<dyn Storage>, ctx: Arc<Context>, dir: &Path) -> Result<IngestSummary> {
    let paths = rawblock::block_files(dir)?;
    let mut summary = IngestSummary {
        files: paths.len(),
        ..Default::default()
    };
    info!(files = paths.len(), dir = %dir.display(), "starting ingest");

    let (tx, mut rx) = mpsc::channel::<(PathBuf, RawBlock)>(100);
    let reader = task::spawn_blocking(move || -> Result<()> {
        for path in paths {
            let blocks = rawblock::read_block_file(&path)?;
            debug!(file = %path.display(), blocks = blocks.len(), "block file decoded");
            for block in blocks {
                if tx.blocking_send((path.clone(), block)).is_err() {
                    return Ok(());
                }
            }
        }
        Ok(())
    });

    let mut ingestor = Ingestor::new(storage, ctx);
    let mut since_report = 0;
    let mut start_time = Instant::now();
    while let Some((path, block)) = rx.recv().await {
        let hash = block.hash.clone();
        match ingestor.ingest_block(block).await {
            Ok(IngestOutcome::Stored { hashes }) => {
                summary.stored += hashes.len();
                since_report += hashes.len();
            }
            Ok(IngestOutcome::Held) => {}
            Ok(IngestOutcome::Duplicate) => summary.duplicates += 1,
            Err(e) => {
                warn!(block = %hash, file = %path.display(), error = %e, "failed to ingest block");
                summary.failed += 1;
            }
        }
        if since_report >= PROGRESS_EVERY {
            info!(blocks = since_report, elapsed = ?start_time.elapsed(), "ingest progress");
            since_report = 0;
            start_time = Instant::now();
        }
    }

    reader
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

    summary.orphaned = ingestor.pending();
    if summary.orphaned > 0 {
        warn!(blocks = summary.orphaned, "blocks left without a parent");
    }
    info!(?summary, "ingest finished");
    Ok(summary)
}
