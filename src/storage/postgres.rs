//! PostgreSQL backend over a `bb8` pool.
//!
//! Transactions are stored once with their inputs, outputs and address ids
//! as JSONB arrays (the blob shape). The legacy `txin`/`txout` tables are
//! still filled so the join shape can be served from the same data.
//! A block, its transactions and its address changes commit together.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bb8::Pool;
use bb8_postgres::PostgresConnectionManager;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use tokio_postgres::types::ToSql;
use tokio_postgres::{CopyInSink, NoTls, Row, Transaction as DbTransaction};
use tracing::{debug, info};

use super::{is_known_duplicate, link_addresses, AddressDelta, Storage, TxFilter};
use crate::assembler::{BlobRow, InputColumns, JoinRow, OutputColumns, TxColumns};
use crate::codec::{self, EncodedTransaction};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::models::{Address, Block, PriceSample, Transaction, TxOut};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS block (
        id BIGSERIAL PRIMARY KEY,
        bits BIGINT NOT NULL,
        height INT NOT NULL,
        nonce BIGINT NOT NULL,
        version INT NOT NULL,
        hash_prev_block VARCHAR(64) NOT NULL,
        hash_merkle_root VARCHAR(64) NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        hash VARCHAR(64) NOT NULL UNIQUE
    );

    CREATE TABLE IF NOT EXISTS address (
        id BIGSERIAL PRIMARY KEY,
        hash TEXT NOT NULL UNIQUE,
        income BIGINT NOT NULL DEFAULT 0,
        outcome BIGINT NOT NULL DEFAULT 0,
        balance BIGINT NOT NULL DEFAULT 0,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );

    CREATE TABLE IF NOT EXISTS transaction (
        id BIGSERIAL PRIMARY KEY,
        block_id BIGINT NOT NULL REFERENCES block(id),
        hash VARCHAR(64) NOT NULL UNIQUE,
        has_witness BOOLEAN NOT NULL DEFAULT false,
        txins JSONB NOT NULL DEFAULT '[]',
        txouts JSONB NOT NULL DEFAULT '[]',
        addresses JSONB NOT NULL DEFAULT '[]'
    );
    CREATE INDEX IF NOT EXISTS transaction_block_id ON transaction (block_id);
    CREATE INDEX IF NOT EXISTS transaction_addresses ON transaction USING GIN (addresses);

    CREATE TABLE IF NOT EXISTS txin (
        id BIGSERIAL PRIMARY KEY,
        transaction_id BIGINT NOT NULL REFERENCES transaction(id),
        amount BIGINT NOT NULL,
        prev_out TEXT NOT NULL,
        size INT NOT NULL,
        signature_script TEXT NOT NULL,
        sequence BIGINT NOT NULL,
        witness TEXT,
        address_id BIGINT REFERENCES address(id)
    );
    CREATE INDEX IF NOT EXISTS txin_transaction_id ON txin (transaction_id);

    CREATE TABLE IF NOT EXISTS txout (
        id BIGSERIAL PRIMARY KEY,
        transaction_id BIGINT NOT NULL REFERENCES transaction(id),
        val BIGINT NOT NULL,
        pk_script TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS txout_transaction_id ON txout (transaction_id);

    CREATE TABLE IF NOT EXISTS btc_price (
        created_at TIMESTAMPTZ NOT NULL,
        price DOUBLE PRECISION NOT NULL
    );
    CREATE INDEX IF NOT EXISTS btc_price_created_at ON btc_price (created_at);

    CREATE OR REPLACE FUNCTION notify_block() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('blocks_notify', row_to_json(NEW)::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql;

    CREATE OR REPLACE FUNCTION notify_address() RETURNS trigger AS $$
    BEGIN
        PERFORM pg_notify('address_notify', row_to_json(NEW)::text);
        RETURN NEW;
    END;
    $$ LANGUAGE plpgsql;

    DROP TRIGGER IF EXISTS block_inserted ON block;
    CREATE TRIGGER block_inserted AFTER INSERT ON block
        FOR EACH ROW EXECUTE FUNCTION notify_block();

    DROP TRIGGER IF EXISTS address_changed ON address;
    CREATE TRIGGER address_changed AFTER INSERT OR UPDATE ON address
        FOR EACH ROW EXECUTE FUNCTION notify_address();
";

const TX_COLUMNS: &str = "t.id, t.block_id, t.hash, t.has_witness, b.created_at";

const BLOCK_COLUMNS: &str =
    "id, bits, height, nonce, version, hash_prev_block, hash_merkle_root, created_at, hash";

const ADDRESS_COLUMNS: &str = "id, hash, income, outcome, balance, updated_at";

pub struct PgStorage {
    pool: PgPool,
}

impl PgStorage {
    pub async fn connect(config: &Config) -> Result<Self> {
        let pg_config = config
            .database_url
            .parse::<tokio_postgres::Config>()
            .map_err(|e| Error::Config(format!("DATABASE_URL: {e}")))?;
        let manager = PostgresConnectionManager::new(pg_config, NoTls);
        let pool = Pool::builder()
            .max_size(config.pool_size)
            .build(manager)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables, indexes and NOTIFY triggers. Safe to rerun.
    pub async fn setup_database(&self) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.batch_execute(SCHEMA).await?;
        info!("database schema ready");
        Ok(())
    }
}

/// The WHERE clause and its single parameter for a filter.
fn filter_sql(filter: &TxFilter) -> (&'static str, &(dyn ToSql + Sync)) {
    match filter {
        TxFilter::BlockId(id) => ("t.block_id = $1", id),
        TxFilter::Address { id, .. } => ("t.addresses @> jsonb_build_array($1::bigint)", id),
        TxFilter::Hash(hash) => ("t.hash = $1", hash),
    }
}

fn tx_columns(row: &Row) -> Result<TxColumns> {
    Ok(TxColumns {
        id: row.try_get(0)?,
        block_id: row.try_get(1)?,
        hash: row.try_get(2)?,
        has_witness: row.try_get(3)?,
        created_at: row.try_get(4)?,
    })
}

fn block_from_row(row: &Row) -> Result<Block> {
    Ok(Block {
        id: row.try_get("id")?,
        bits: row.try_get("bits")?,
        height: row.try_get("height")?,
        nonce: row.try_get("nonce")?,
        version: row.try_get("version")?,
        hash_prev_block: row.try_get("hash_prev_block")?,
        hash_merkle_root: row.try_get("hash_merkle_root")?,
        created_at: row.try_get("created_at")?,
        hash: row.try_get("hash")?,
        transactions: Vec::new(),
        price: None,
    })
}

fn address_from_row(row: &Row) -> Result<Address> {
    Ok(Address {
        id: row.try_get("id")?,
        hash: row.try_get("hash")?,
        income: row.try_get("income")?,
        outcome: row.try_get("outcome")?,
        balance: row.try_get("balance")?,
        updated_at: row.try_get("updated_at")?,
        transactions: Vec::new(),
    })
}

/// Quote a CSV field for COPY. Unquoted empty fields load as NULL.
fn csv_text(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

fn csv_opt_text(value: Option<&str>) -> String {
    value.map(csv_text).unwrap_or_default()
}

fn csv_opt_id(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

async fn write_block(db_tx: &DbTransaction<'_>, block: &mut Block) -> Result<()> {
    let row = db_tx
        .query_opt(
            "INSERT INTO block
                (bits, height, nonce, version, hash_prev_block, hash_merkle_root, created_at, hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (hash) DO NOTHING
            RETURNING id",
            &[
                &block.bits,
                &block.height,
                &block.nonce,
                &block.version,
                &block.hash_prev_block,
                &block.hash_merkle_root,
                &block.created_at,
                &block.hash,
            ],
        )
        .await?
        .ok_or_else(|| Error::DuplicateKey(format!("block {}", block.hash)))?;
    block.id = row.try_get(0)?;
    Ok(())
}

/// Insert the transaction row and its legacy txin/txout rows. A known
/// duplicate txid resolves to the stored row and writes nothing.
async fn write_transaction(db_tx: &DbTransaction<'_>, tx: &mut Transaction) -> Result<()> {
    let encoded = EncodedTransaction::encode(tx)?;
    let inserted = db_tx
        .query_opt(
            "INSERT INTO transaction (block_id, hash, has_witness, txins, txouts, addresses)
            VALUES ($1, $2, $3, $4::text::jsonb, $5::text::jsonb, $6::text::jsonb)
            ON CONFLICT (hash) DO NOTHING
            RETURNING id",
            &[
                &tx.block_id,
                &tx.hash,
                &tx.has_witness,
                &encoded.txins,
                &encoded.txouts,
                &encoded.addresses,
            ],
        )
        .await?;

    let Some(row) = inserted else {
        if !is_known_duplicate(&tx.hash) {
            return Err(Error::DuplicateKey(format!("transaction {}", tx.hash)));
        }
        let existing = db_tx
            .query_one("SELECT id FROM transaction WHERE hash = $1", &[&tx.hash])
            .await?;
        tx.id = existing.try_get(0)?;
        debug!(tx = %tx.hash, "known duplicate txid, keeping stored row");
        return Ok(());
    };
    tx.id = row.try_get(0)?;

    if !tx.txins.is_empty() {
        let mut sink: Pin<Box<CopyInSink<bytes::Bytes>>> = Box::pin(
            db_tx
                .copy_in(
                    "COPY txin (transaction_id, amount, prev_out, size, signature_script, sequence, witness, address_id) FROM STDIN WITH (FORMAT csv)",
                )
                .await?,
        );
        for txin in &tx.txins {
            let line = format!(
                "{},{},{},{},{},{},{},{}\n",
                tx.id,
                txin.amount,
                csv_text(&txin.prev_out),
                txin.size,
                csv_text(&txin.signature_script),
                txin.sequence,
                csv_opt_text(txin.witness.as_deref()),
                csv_opt_id(txin.address_id),
            );
            sink.as_mut().send(line.into()).await?;
        }
        sink.as_mut().close().await?;
    }

    if !tx.txouts.is_empty() {
        let mut sink: Pin<Box<CopyInSink<bytes::Bytes>>> = Box::pin(
            db_tx
                .copy_in("COPY txout (transaction_id, val, pk_script) FROM STDIN WITH (FORMAT csv)")
                .await?,
        );
        for txout in &tx.txouts {
            let line = format!("{},{},{}\n", tx.id, txout.value, csv_text(&txout.pk_script));
            sink.as_mut().send(line.into()).await?;
        }
        sink.as_mut().close().await?;
    }
    Ok(())
}

async fn upsert_address(
    db_tx: &DbTransaction<'_>,
    hash: &str,
    income: i64,
    outcome: i64,
    at: DateTime<Utc>,
) -> Result<Address> {
    let sql = format!(
        "INSERT INTO address (hash, income, outcome, balance, updated_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (hash) DO UPDATE SET
            income = address.income + EXCLUDED.income,
            outcome = address.outcome + EXCLUDED.outcome,
            balance = address.balance + EXCLUDED.balance,
            updated_at = EXCLUDED.updated_at
        RETURNING {ADDRESS_COLUMNS}"
    );
    let balance = income - outcome;
    let row = db_tx
        .query_one(sql.as_str(), &[&hash, &income, &outcome, &balance, &at])
        .await?;
    address_from_row(&row)
}

#[async_trait]
impl Storage for PgStorage {
    async fn join_rows(&self, filter: &TxFilter) -> Result<Vec<JoinRow>> {
        let (clause, param) = filter_sql(filter);
        let sql = format!(
            "SELECT {TX_COLUMNS},
                ti.id, ti.amount, ti.prev_out, ti.size, ti.signature_script, ti.sequence,
                ti.witness, a.hash, ti.address_id,
                tot.id, tot.val, tot.pk_script
            FROM transaction t
            JOIN block b ON b.id = t.block_id
            LEFT JOIN txin ti ON ti.transaction_id = t.id
            LEFT JOIN address a ON a.id = ti.address_id
            LEFT JOIN txout tot ON tot.transaction_id = t.id
            WHERE {clause}
            ORDER BY t.id DESC, ti.id, tot.id"
        );
        let conn = self.pool.get().await?;
        let rows = conn.query(sql.as_str(), &[param]).await?;
        debug!(rows = rows.len(), ?filter, "join rows fetched");

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let input = match row.try_get::<_, Option<i64>>(5)? {
                Some(id) => Some(InputColumns {
                    id,
                    amount: row.try_get(6)?,
                    prev_out: row.try_get(7)?,
                    size: row.try_get(8)?,
                    signature_script: row.try_get(9)?,
                    sequence: row.try_get(10)?,
                    witness: row.try_get(11)?,
                    address: row.try_get(12)?,
                    address_id: row.try_get(13)?,
                }),
                None => None,
            };
            let output = match row.try_get::<_, Option<i64>>(14)? {
                Some(id) => Some(OutputColumns {
                    id,
                    value: row.try_get(15)?,
                    pk_script: row.try_get(16)?,
                }),
                None => None,
            };
            out.push(JoinRow {
                tx: tx_columns(row)?,
                input,
                output,
            });
        }
        Ok(out)
    }

    async fn blob_rows(&self, filter: &TxFilter) -> Result<Vec<BlobRow>> {
        let (clause, param) = filter_sql(filter);
        let sql = format!(
            "SELECT {TX_COLUMNS}, t.txins::text, t.txouts::text, t.addresses::text
            FROM transaction t
            JOIN block b ON b.id = t.block_id
            WHERE {clause}
            ORDER BY t.id DESC"
        );
        let conn = self.pool.get().await?;
        let rows = conn.query(sql.as_str(), &[param]).await?;
        rows.iter()
            .map(|row| {
                Ok(BlobRow {
                    tx: tx_columns(row)?,
                    txins: row.try_get(5)?,
                    txouts: row.try_get(6)?,
                    addresses: row.try_get(7)?,
                })
            })
            .collect()
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Block> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM block WHERE hash = $1");
        let row = conn
            .query_opt(sql.as_str(), &[&hash])
            .await?
            .ok_or_else(|| Error::NotFound(format!("block {hash}")))?;
        block_from_row(&row)
    }

    async fn latest_blocks(&self, limit: i64) -> Result<Vec<Block>> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {BLOCK_COLUMNS} FROM block ORDER BY id DESC LIMIT $1");
        let rows = conn.query(sql.as_str(), &[&limit]).await?;
        rows.iter().map(block_from_row).collect()
    }

    async fn address_by_hash(&self, hash: &str) -> Result<Address> {
        let conn = self.pool.get().await?;
        let sql = format!("SELECT {ADDRESS_COLUMNS} FROM address WHERE hash = $1");
        let row = conn
            .query_opt(sql.as_str(), &[&hash])
            .await?
            .ok_or_else(|| Error::NotFound(format!("address {hash}")))?;
        address_from_row(&row)
    }

    async fn address_hashes(&self, ids: &[i64]) -> Result<HashMap<i64, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let conn = self.pool.get().await?;
        let rows = conn
            .query("SELECT id, hash FROM address WHERE id = ANY($1)", &[&ids])
            .await?;
        rows.iter()
            .map(|row| Ok((row.try_get(0)?, row.try_get(1)?)))
            .collect()
    }

    async fn previous_output(&self, txid: &str, vout: u32) -> Result<Option<TxOut>> {
        let conn = self.pool.get().await?;
        let Some(row) = conn
            .query_opt("SELECT txouts::text FROM transaction WHERE hash = $1", &[&txid])
            .await?
        else {
            return Ok(None);
        };
        let encoded: String = row.try_get(0)?;
        let mut txouts = codec::decode_txouts(&encoded).map_err(|e| e.in_transaction(txid))?;
        let index = vout as usize;
        if index >= txouts.len() {
            return Ok(None);
        }
        Ok(Some(txouts.swap_remove(index)))
    }

    async fn insert_block(&self, block: &mut Block) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let db_tx = conn.transaction().await?;
        write_block(&db_tx, block).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn insert_transaction(&self, tx: &mut Transaction) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let db_tx = conn.transaction().await?;
        write_transaction(&db_tx, tx).await?;
        db_tx.commit().await?;
        Ok(())
    }

    async fn store_block(&self, block: &mut Block, deltas: &[AddressDelta]) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let db_tx = conn.transaction().await?;

        write_block(&db_tx, block).await?;
        let mut ids = HashMap::with_capacity(deltas.len());
        for delta in deltas {
            let address =
                upsert_address(&db_tx, &delta.hash, delta.income, delta.outcome, block.created_at).await?;
            ids.insert(address.hash, address.id);
        }
        for tx in &mut block.transactions {
            tx.block_id = block.id;
            link_addresses(tx, &ids);
            write_transaction(&db_tx, tx).await?;
        }

        db_tx.commit().await?;
        debug!(block = %block.hash, txs = block.transactions.len(), addresses = ids.len(), "block committed");
        Ok(())
    }

    async fn apply_address_delta(
        &self,
        hash: &str,
        income: i64,
        outcome: i64,
        at: DateTime<Utc>,
    ) -> Result<Address> {
        let mut conn = self.pool.get().await?;
        let db_tx = conn.transaction().await?;
        let address = upsert_address(&db_tx, hash, income, outcome, at).await?;
        db_tx.commit().await?;
        Ok(address)
    }

    async fn price_samples(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<PriceSample>> {
        let conn = self.pool.get().await?;
        let rows = conn
            .query(
                "(SELECT created_at, price FROM btc_price
                    WHERE created_at < $1 ORDER BY created_at DESC LIMIT 1)
                UNION ALL
                (SELECT created_at, price FROM btc_price
                    WHERE created_at >= $1 AND created_at <= $2)
                ORDER BY created_at",
                &[&from, &to],
            )
            .await?;
        rows.iter()
            .map(|row| {
                Ok(PriceSample {
                    created_at: row.try_get(0)?,
                    price: row.try_get(1)?,
                })
            })
            .collect()
    }

    async fn insert_prices(&self, samples: &[PriceSample]) -> Result<u64> {
        let conn = self.pool.get().await?;
        let mut sink: Pin<Box<CopyInSink<bytes::Bytes>>> = Box::pin(
            conn.copy_in("COPY btc_price (created_at, price) FROM STDIN WITH (FORMAT csv)")
                .await?,
        );
        for sample in samples {
            let line = format!("{},{}\n", sample.created_at.to_rfc3339(), sample.price);
            sink.as_mut().send(line.into()).await?;
        }
        let written = sink.as_mut().finish().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_fields_quote_commas_and_quotes() {
        assert_eq!(csv_text("ab,cd"), "\"ab,cd\"");
        assert_eq!(csv_text("a\"b"), "\"a\"\"b\"");
        assert_eq!(csv_text(""), "\"\"");
        assert_eq!(csv_opt_text(None), "");
        assert_eq!(csv_opt_id(Some(7)), "7");
        assert_eq!(csv_opt_id(None), "");
    }

    #[test]
    fn filters_bind_one_parameter() {
        let (clause, _) = filter_sql(&TxFilter::BlockId(3));
        assert_eq!(clause, "t.block_id = $1");
        let (clause, _) = filter_sql(&TxFilter::Address { id: 1, hash: "1abc".into() });
        assert!(clause.contains("addresses @>"));
        let (clause, _) = filter_sql(&TxFilter::Hash("ff".into()));
        assert_eq!(clause, "t.hash = $1");
    }

    #[test]
    fn schema_never_drops_tables() {
        assert!(!SCHEMA.contains("DROP TABLE"));
        assert!(SCHEMA.contains("pg_notify('blocks_notify'"));
        assert!(SCHEMA.contains("pg_notify('address_notify'"));
    }
}
