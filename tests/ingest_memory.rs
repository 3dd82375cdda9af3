use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use chrono::{TimeZone, Utc};

use bitcoin_pg_explorer::config::RowShape;
use bitcoin_pg_explorer::explorer::Explorer;
use bitcoin_pg_explorer::ingest;
use bitcoin_pg_explorer::models::{PriceSample, Transaction, TxOut};
use bitcoin_pg_explorer::storage::memory::MemoryStorage;
use bitcoin_pg_explorer::storage::{Storage, TxFilter, DUPLICATE_TXIDS};
use bitcoin_pg_explorer::{Config, Context, Error};

const GENESIS_BLOCK: &str = "0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";
const GENESIS_HASH: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const GENESIS_TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";
const GENESIS_ADDRESS: &str = "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa";
const MAINNET_MAGIC: u32 = 0xd9b4_bef9;

fn write_block_file(dir: &std::path::Path, name: &str, blocks: &[&str]) {
    let mut file = File::create(dir.join(name)).unwrap();
    for block in blocks {
        let bytes = hex::decode(block).unwrap();
        file.write_all(&MAINNET_MAGIC.to_le_bytes()).unwrap();
        file.write_all(&(bytes.len() as u32).to_le_bytes()).unwrap();
        file.write_all(&bytes).unwrap();
    }
    file.write_all(&[0u8; 8]).unwrap();
}

fn context(row_shape: RowShape) -> Arc<Context> {
    Context::new(Config {
        row_shape,
        ..Config::default()
    })
}

#[tokio::test]
async fn ingest_then_explore_genesis() {
    let dir = tempfile::tempdir().unwrap();
    write_block_file(dir.path(), "blk00000.dat", &[GENESIS_BLOCK]);
    // files that are not blk*.dat are ignored
    File::create(dir.path().join("rev00000.dat")).unwrap();

    let storage = Arc::new(MemoryStorage::new());
    let summary = ingest::run(storage.clone(), context(RowShape::Blob), dir.path())
        .await
        .unwrap();
    assert_eq!(summary.files, 1);
    assert_eq!(summary.stored, 1);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.orphaned, 0);

    storage
        .insert_prices(&[PriceSample {
            created_at: Utc.with_ymd_and_hms(2009, 1, 1, 0, 0, 0).unwrap(),
            price: 0.0008,
        }])
        .await
        .unwrap();

    for shape in [RowShape::Blob, RowShape::Join] {
        let explorer = Explorer::new(storage.clone(), context(shape));
        let block = explorer.block_by_hash(GENESIS_HASH).await.unwrap();
        assert_eq!(block.height, 0);
        assert_eq!(block.price, Some(0.0008));
        assert_eq!(block.transactions.len(), 1);

        let coinbase = &block.transactions[0];
        assert_eq!(coinbase.hash, GENESIS_TXID);
        assert!(coinbase.is_coinbase());
        assert_eq!(coinbase.txouts[0].value, 5_000_000_000);
        assert_eq!(
            coinbase.txouts[0].addresses.as_deref(),
            Some(&[GENESIS_ADDRESS.to_string()][..])
        );

        let view = explorer.address_by_hash(GENESIS_ADDRESS).await.unwrap();
        assert_eq!(view.address.balance, 5_000_000_000);
        assert_eq!(view.address.transactions.len(), 1);
        assert!(view.unpriced.is_empty());
    }
}

#[tokio::test]
async fn reingesting_the_same_files_only_counts_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    write_block_file(dir.path(), "blk00000.dat", &[GENESIS_BLOCK]);

    let storage = Arc::new(MemoryStorage::new());
    ingest::run(storage.clone(), context(RowShape::Blob), dir.path())
        .await
        .unwrap();
    let again = ingest::run(storage.clone(), context(RowShape::Blob), dir.path())
        .await
        .unwrap();
    assert_eq!(again.stored, 0);
    assert_eq!(again.duplicates, 1);
    assert_eq!(storage.block_count(), 1);
    assert_eq!(storage.transaction_count(), 1);
}

#[tokio::test]
async fn known_duplicate_txids_insert_twice() {
    let storage = MemoryStorage::new();
    let make = |hash: &str| Transaction {
        id: 0,
        block_id: 1,
        hash: hash.to_string(),
        has_witness: false,
        created_at: Utc.with_ymd_and_hms(2010, 11, 14, 0, 0, 0).unwrap(),
        price: None,
        txins: vec![],
        txouts: vec![TxOut::new(5_000_000_000, "51")],
        addresses: vec![],
    };

    for hash in DUPLICATE_TXIDS {
        let mut first = make(hash);
        let mut second = make(hash);
        storage.insert_transaction(&mut first).await.unwrap();
        storage.insert_transaction(&mut second).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    let mut other = make(&"ab".repeat(32));
    storage.insert_transaction(&mut other).await.unwrap();
    let err = storage.insert_transaction(&mut make(&"ab".repeat(32))).await.unwrap_err();
    assert!(matches!(err, Error::DuplicateKey(_)));
}

#[tokio::test]
async fn unknown_rows_are_not_found() {
    let storage = Arc::new(MemoryStorage::new());
    let explorer = Explorer::new(storage.clone(), context(RowShape::Blob));
    assert!(explorer.block_by_hash(GENESIS_HASH).await.unwrap_err().is_not_found());
    assert!(explorer.address_by_hash(GENESIS_ADDRESS).await.unwrap_err().is_not_found());
    assert!(storage
        .blob_rows(&TxFilter::Hash(GENESIS_TXID.into()))
        .await
        .unwrap()
        .is_empty());
}
