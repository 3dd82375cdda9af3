//! Bitcoin wire-format block decoding.
//!
//! Used for `blk*.dat` files on disk and for raw blocks pushed by the
//! chain observer. Hashes are reversed double-SHA256, hex encoded the way
//! block explorers print them.

use std::fs::File;
use std::io::{self, BufReader, Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use chrono::{DateTime, Utc};
use hex::encode;
use sha2::{Digest, Sha256};

const HEADER_LEN: usize = 80;
const MAX_SCRIPT_LEN: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct RawBlock {
    pub hash: String,
    pub version: i32,
    pub previous_block: String,
    pub merkle_root: String,
    pub time: DateTime<Utc>,
    pub bits: u32,
    pub nonce: u32,
    pub size: usize,
    pub transactions: Vec<RawTransaction>,
}

#[derive(Debug, Clone)]
pub struct RawTransaction {
    pub txid: String,
    pub version: i32,
    pub locktime: u32,
    pub size: usize,
    pub inputs: Vec<RawInput>,
    pub outputs: Vec<RawOutput>,
}

impl RawTransaction {
    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|i| i.witness.is_some())
    }
}

#[derive(Debug, Clone)]
pub struct RawInput {
    pub previous_txid: String,
    pub previous_output_index: u32,
    pub script_sig: String,
    pub sequence: u32,
    /// Serialized bytes of the input, used as its size.
    pub size: usize,
    pub witness: Option<Vec<Vec<u8>>>,
}

#[derive(Debug, Clone)]
pub struct RawOutput {
    pub value: i64,
    pub script_pub_key: String,
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

fn display_hash(hash: [u8; 32]) -> String {
    encode(hash.iter().rev().cloned().collect::<Vec<u8>>())
}

pub fn read_var_int<R: Read>(reader: &mut R) -> io::Result<u64> {
    let mut first = [0; 1];
    reader.read_exact(&mut first)?;

    match first[0] {
        0xFD => Ok(reader.read_u16::<LittleEndian>()? as u64),
        0xFE => Ok(reader.read_u32::<LittleEndian>()? as u64),
        0xFF => Ok(reader.read_u64::<LittleEndian>()?),
        _ => Ok(first[0] as u64),
    }
}

fn read_hash<R: Read>(reader: &mut R) -> io::Result<String> {
    let mut hash = [0; 32];
    reader.read_exact(&mut hash)?;
    Ok(display_hash(hash))
}

fn read_bytes<R: Read>(reader: &mut R, len: usize, what: &str) -> io::Result<Vec<u8>> {
    if len > MAX_SCRIPT_LEN {
        return Err(invalid(format!("{what} length too large")));
    }
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

/// Decode one serialized block (header followed by transactions).
pub fn parse_block(bytes: &[u8]) -> io::Result<RawBlock> {
    if bytes.len() < HEADER_LEN {
        return Err(invalid("block shorter than its header"));
    }
    let mut reader = Cursor::new(bytes);

    let version = reader.read_i32::<LittleEndian>()?;
    let previous_block = read_hash(&mut reader)?;
    let merkle_root = read_hash(&mut reader)?;
    let timestamp = reader.read_u32::<LittleEndian>()?;
    let time = DateTime::<Utc>::from_timestamp(timestamp as i64, 0)
        .ok_or_else(|| invalid("block time out of range"))?;
    let bits = reader.read_u32::<LittleEndian>()?;
    let nonce = reader.read_u32::<LittleEndian>()?;
    let hash = display_hash(double_sha256(&bytes[..HEADER_LEN]));

    let tx_count = read_var_int(&mut reader)?;
    let mut transactions = Vec::with_capacity(tx_count.min(100_000) as usize);
    for _ in 0..tx_count {
        transactions.push(read_transaction(&mut reader)?);
    }

    Ok(RawBlock {
        hash,
        version,
        previous_block,
        merkle_root,
        time,
        bits,
        nonce,
        size: reader.position() as usize,
        transactions,
    })
}

fn read_transaction(reader: &mut Cursor<&[u8]>) -> io::Result<RawTransaction> {
    let buf: &[u8] = *reader.get_ref();
    let start = reader.position() as usize;
    let version = reader.read_i32::<LittleEndian>()?;

    let mut segwit = false;
    let marker = reader.read_u8()?;
    if marker == 0 {
        let flag = reader.read_u8()?;
        if flag != 1 {
            return Err(invalid("Invalid SegWit flag"));
        }
        segwit = true;
    } else {
        reader.set_position(reader.position() - 1);
    }

    let body_start = reader.position() as usize;
    let input_count = read_var_int(reader)?;
    let mut inputs = Vec::with_capacity(input_count.min(10_000) as usize);
    for _ in 0..input_count {
        inputs.push(read_input(reader)?);
    }

    let output_count = read_var_int(reader)?;
    let mut outputs = Vec::with_capacity(output_count.min(10_000) as usize);
    for _ in 0..output_count {
        outputs.push(read_output(reader)?);
    }
    let body_end = reader.position() as usize;

    if segwit {
        for input in inputs.iter_mut() {
            let stack = read_witness_data(reader)?;
            if !stack.is_empty() {
                input.witness = Some(stack);
            }
        }
    }

    let locktime = reader.read_u32::<LittleEndian>()?;
    let end = reader.position() as usize;

    // txid commits to the legacy serialization only
    let mut legacy = Vec::with_capacity(body_end - body_start + 8);
    legacy.extend_from_slice(&version.to_le_bytes());
    legacy.extend_from_slice(&buf[body_start..body_end]);
    legacy.extend_from_slice(&locktime.to_le_bytes());

    Ok(RawTransaction {
        txid: display_hash(double_sha256(&legacy)),
        version,
        locktime,
        size: end - start,
        inputs,
        outputs,
    })
}

fn read_witness_data<R: Read>(reader: &mut R) -> io::Result<Vec<Vec<u8>>> {
    let witness_count = read_var_int(reader)?;
    let mut witness_fields = Vec::with_capacity(witness_count.min(10_000) as usize);

    for _ in 0..witness_count {
        let length = read_var_int(reader)? as usize;
        witness_fields.push(read_bytes(reader, length, "witness item")?);
    }

    Ok(witness_fields)
}

fn read_input(reader: &mut Cursor<&[u8]>) -> io::Result<RawInput> {
    let start = reader.position();
    let previous_txid = read_hash(reader)?;
    let previous_output_index = reader.read_u32::<LittleEndian>()?;
    let script_sig_length = read_var_int(reader)? as usize;
    let script_sig = read_bytes(reader, script_sig_length, "scriptSig")?;
    let sequence = reader.read_u32::<LittleEndian>()?;

    Ok(RawInput {
        previous_txid,
        previous_output_index,
        script_sig: encode(script_sig),
        sequence,
        size: (reader.position() - start) as usize,
        witness: None,
    })
}

fn read_output<R: Read>(reader: &mut R) -> io::Result<RawOutput> {
    let value = reader.read_i64::<LittleEndian>()?;
    let script_pub_key_length = read_var_int(reader)? as usize;
    let script_pub_key = read_bytes(reader, script_pub_key_length, "scriptPubKey")?;

    Ok(RawOutput {
        value,
        script_pub_key: encode(script_pub_key),
    })
}

/// Hex-encode a witness stack as `<item>,<item>,...`.
pub fn encode_witness(stack: &[Vec<u8>]) -> String {
    stack.iter().map(encode).collect::<Vec<_>>().join(",")
}

/// `blk*.dat` files in a directory, in name order.
pub fn block_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, io::Error>>()?;
    paths.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    Ok(paths
        .into_iter()
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            name.starts_with("blk") && path.extension().map_or(false, |ext| ext == "dat")
        })
        .collect())
}

/// Read every block of a `blk*.dat` file. Each record is framed by the
/// network magic and a little-endian length; zero padding ends the file.
pub fn read_block_file(path: &Path) -> io::Result<Vec<RawBlock>> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut blocks = Vec::new();

    loop {
        let magic = match reader.read_u32::<LittleEndian>() {
            Ok(magic) => magic,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        };
        if magic == 0 {
            break;
        }
        let size = reader.read_u32::<LittleEndian>()? as usize;
        let mut record = vec![0; size];
        reader.read_exact(&mut record)?;
        blocks.push(parse_block(&record)?);
    }

    Ok(blocks)
}
