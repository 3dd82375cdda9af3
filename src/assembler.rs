//! Rebuilds nested transactions from stored rows.
//!
//! Two row shapes exist. Blob rows carry each transaction once, with its
//! inputs, outputs and addresses as encoded arrays. Join rows come from the
//! legacy `transaction x txin x txout` cross join: a transaction with N
//! inputs and M outputs arrives as N*M rows, all rows of one transaction
//! contiguous. The join path de-crosses those rows in one pass.

use chrono::{DateTime, Utc};

use crate::codec;
use crate::error::Result;
use crate::models::{Transaction, TxIn, TxOut};

/// Scalar columns of the `transaction` table, joined with its block time.
#[derive(Debug, Clone, PartialEq)]
pub struct TxColumns {
    pub id: i64,
    pub block_id: i64,
    pub hash: String,
    pub has_witness: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputColumns {
    pub id: i64,
    pub amount: i64,
    pub prev_out: String,
    pub size: i32,
    pub signature_script: String,
    pub sequence: i64,
    pub witness: Option<String>,
    pub address: Option<String>,
    pub address_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumns {
    pub id: i64,
    pub value: i64,
    pub pk_script: String,
}

/// One row of the cross join. Input or output columns are `None` when the
/// transaction has no inputs or no outputs (outer join).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRow {
    pub tx: TxColumns,
    pub input: Option<InputColumns>,
    pub output: Option<OutputColumns>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobRow {
    pub tx: TxColumns,
    pub txins: String,
    pub txouts: String,
    pub addresses: String,
}

impl TxColumns {
    fn into_transaction(self) -> Transaction {
        Transaction {
            id: self.id,
            block_id: self.block_id,
            hash: self.hash,
            has_witness: self.has_witness,
            created_at: self.created_at,
            price: None,
            txins: Vec::new(),
            txouts: Vec::new(),
            addresses: Vec::new(),
        }
    }
}

impl From<InputColumns> for TxIn {
    fn from(c: InputColumns) -> Self {
        TxIn {
            id: Some(c.id),
            amount: c.amount,
            prev_out: c.prev_out,
            size: c.size,
            signature_script: c.signature_script,
            sequence: c.sequence,
            witness: c.witness,
            address: c.address,
            address_id: c.address_id,
        }
    }
}

impl From<OutputColumns> for TxOut {
    fn from(c: OutputColumns) -> Self {
        TxOut {
            id: Some(c.id),
            value: c.value,
            pk_script: c.pk_script,
            addresses: None,
        }
    }
}

/// Tracks the identities seen on one side (inputs or outputs) of the
/// current transaction's rows.
///
/// A repeat of the previous id is the same entry paired with another row of
/// the other side. Meeting the first id again after other ids means the
/// cross product started over, so this side is complete.
#[derive(Debug, Default)]
struct Axis {
    first: Option<i64>,
    last: Option<i64>,
    wrapped: bool,
}

impl Axis {
    /// Returns true when `id` opens a new entry.
    fn observe(&mut self, id: i64) -> bool {
        if self.wrapped || self.last == Some(id) {
            return false;
        }
        if self.first == Some(id) {
            self.wrapped = true;
            return false;
        }
        self.first.get_or_insert(id);
        self.last = Some(id);
        true
    }
}

struct OpenTransaction {
    tx: Transaction,
    inputs: Axis,
    outputs: Axis,
}

/// Single pass de-crossing of join rows.
#[derive(Default)]
pub struct RowAssembler {
    done: Vec<Transaction>,
    open: Option<OpenTransaction>,
}

impl RowAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: JoinRow) {
        let JoinRow { tx, input, output } = row;

        let switch = self.open.as_ref().map_or(true, |open| open.tx.id != tx.id);
        if switch {
            if let Some(open) = self.open.take() {
                self.done.push(open.tx);
            }
            self.open = Some(OpenTransaction {
                tx: tx.into_transaction(),
                inputs: Axis::default(),
                outputs: Axis::default(),
            });
        }

        let Some(open) = self.open.as_mut() else {
            return;
        };
        if let Some(input) = input {
            if open.inputs.observe(input.id) {
                open.tx.txins.push(input.into());
            }
        }
        if let Some(output) = output {
            if open.outputs.observe(output.id) {
                open.tx.txouts.push(output.into());
            }
        }
    }

    pub fn finish(mut self) -> Vec<Transaction> {
        if let Some(open) = self.open.take() {
            self.done.push(open.tx);
        }
        self.done
    }
}

pub fn assemble_rows(rows: impl IntoIterator<Item = JoinRow>) -> Vec<Transaction> {
    let mut assembler = RowAssembler::new();
    for row in rows {
        assembler.push(row);
    }
    assembler.finish()
}

/// Decode one pre-joined row. Any array that fails to decode fails the
/// transaction.
pub fn transaction_from_blob(row: BlobRow) -> Result<Transaction> {
    let BlobRow {
        tx,
        txins,
        txouts,
        addresses,
    } = row;
    let hash = tx.hash.clone();
    let mut transaction = tx.into_transaction();
    transaction.txins = codec::decode_txins(&txins).map_err(|e| e.in_transaction(&hash))?;
    transaction.txouts = codec::decode_txouts(&txouts).map_err(|e| e.in_transaction(&hash))?;
    transaction.addresses =
        codec::decode_addresses(&addresses).map_err(|e| e.in_transaction(&hash))?;
    Ok(transaction)
}

pub fn assemble_blobs(rows: impl IntoIterator<Item = BlobRow>) -> Result<Vec<Transaction>> {
    rows.into_iter().map(transaction_from_blob).collect()
}
