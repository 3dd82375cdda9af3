//! Output script classification and owner address derivation.
//!
//! Scripts are matched against the standard templates with the `bitcoin`
//! crate's script predicates. Key and script hashes are encoded with
//! base58-check under the network's version byte, witness v0 programs as
//! bech32. Bare multisig keys are read off the script's instructions. Scripts matching no template get a
//! synthetic `nonstandard-` address so every output stays attributable.

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::opcodes::Opcode;
use bitcoin::script::Instruction;
use bitcoin::{Address, PubkeyHash, Script};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::{Transaction, TxOut};

pub const NONSTANDARD_PREFIX: &str = "nonstandard-";
/// Number of script hex characters kept in a synthetic address.
pub const NONSTANDARD_HEX_LEN: usize = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    fn params(self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            other => Err(format!("unknown network {other:?}")),
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => f.write_str("mainnet"),
            Network::Testnet => f.write_str("testnet"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptClass {
    PubKeyHash,
    ScriptHash,
    PubKey,
    MultiSig,
    NullData,
    WitnessV0KeyHash,
    WitnessV0ScriptHash,
    NonStandard,
}

fn is_pubkey(data: &[u8]) -> bool {
    match data.len() {
        33 => matches!(data[0], 0x02 | 0x03),
        65 => matches!(data[0], 0x04 | 0x06 | 0x07),
        _ => false,
    }
}

fn small_int(op: Opcode) -> Option<usize> {
    let code = op.to_u8();
    (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
        .contains(&code)
        .then(|| (code - OP_PUSHNUM_1.to_u8() + 1) as usize)
}

/// Keys of an `m <keys..> n OP_CHECKMULTISIG` script, in script order.
fn multisig_keys(script: &Script) -> Option<Vec<Vec<u8>>> {
    let ops: Vec<Instruction<'_>> = script.instructions().collect::<std::result::Result<_, _>>().ok()?;
    let (first, rest) = ops.split_first()?;
    let (last, rest) = rest.split_last()?;
    let (count, keys) = rest.split_last()?;
    if *last != Instruction::Op(OP_CHECKMULTISIG) {
        return None;
    }
    let required = first.opcode().and_then(small_int)?;
    let total = count.opcode().and_then(small_int)?;
    if keys.len() != total || required > total {
        return None;
    }
    keys.iter()
        .map(|op| match op.push_bytes() {
            Some(key) if is_pubkey(key.as_bytes()) => Some(key.as_bytes().to_vec()),
            _ => None,
        })
        .collect()
}

/// The key pushed by a pay-to-pubkey script.
fn p2pk_key(script: &Script) -> Option<Vec<u8>> {
    match script.instructions().next()? {
        Ok(Instruction::PushBytes(key)) => Some(key.as_bytes().to_vec()),
        _ => None,
    }
}

pub fn classify(script: &[u8]) -> ScriptClass {
    let script = Script::from_bytes(script);
    if script.is_p2pkh() {
        ScriptClass::PubKeyHash
    } else if script.is_p2sh() {
        ScriptClass::ScriptHash
    } else if script.is_p2wpkh() {
        ScriptClass::WitnessV0KeyHash
    } else if script.is_p2wsh() {
        ScriptClass::WitnessV0ScriptHash
    } else if script.is_p2pk() {
        ScriptClass::PubKey
    } else if script.is_op_return() {
        ScriptClass::NullData
    } else if multisig_keys(script).is_some() {
        ScriptClass::MultiSig
    } else {
        ScriptClass::NonStandard
    }
}

fn pubkey_address(pubkey: &[u8], network: Network) -> String {
    Address::p2pkh(PubkeyHash::hash(pubkey), network.params()).to_string()
}

/// Classify `script` and extract the addresses able to spend it. Non-standard
/// scripts come back with an empty list; see [`resolve`] for the fallback.
pub fn extract_addresses(script: &[u8], network: Network) -> (ScriptClass, Vec<String>) {
    let class = classify(script);
    let script = Script::from_bytes(script);
    let addresses = match class {
        ScriptClass::PubKeyHash
        | ScriptClass::ScriptHash
        | ScriptClass::WitnessV0KeyHash
        | ScriptClass::WitnessV0ScriptHash => match Address::from_script(script, network.params()) {
            Ok(address) => vec![address.to_string()],
            Err(e) => {
                debug!(error = %e, "output script not encodable");
                return (ScriptClass::NonStandard, Vec::new());
            }
        },
        ScriptClass::PubKey => p2pk_key(script)
            .map(|key| vec![pubkey_address(&key, network)])
            .unwrap_or_default(),
        ScriptClass::MultiSig => multisig_keys(script)
            .map(|keys| keys.iter().map(|k| pubkey_address(k, network)).collect())
            .unwrap_or_default(),
        ScriptClass::NullData | ScriptClass::NonStandard => Vec::new(),
    };
    (class, addresses)
}

/// Synthetic owner for a script that matches no template. Hex case does not
/// change the result.
pub fn nonstandard_address(pk_script_hex: &str) -> String {
    let hex = pk_script_hex.to_ascii_lowercase();
    let end = hex
        .char_indices()
        .nth(NONSTANDARD_HEX_LEN)
        .map_or(hex.len(), |(i, _)| i);
    format!("{NONSTANDARD_PREFIX}{}", &hex[..end])
}

/// Decode a hex output script and return its owner addresses.
///
/// Malformed hex is a decode error. Non-standard scripts never fail: they
/// resolve to a single synthetic address. Null-data outputs have no owner.
pub fn resolve(pk_script_hex: &str, network: Network) -> Result<Vec<String>> {
    let script = hex::decode(pk_script_hex).map_err(|e| Error::decode("pk_script", e))?;
    let (class, addresses) = extract_addresses(&script, network);
    if class == ScriptClass::NonStandard {
        debug!(pk_script = pk_script_hex, "nonstandard txout");
        return Ok(vec![nonstandard_address(pk_script_hex)]);
    }
    Ok(addresses)
}

impl TxOut {
    /// Owner addresses, decoded on first call and cached on the output.
    pub fn addresses(&mut self, network: Network) -> Result<&[String]> {
        if self.addresses.is_none() {
            self.addresses = Some(resolve(&self.pk_script, network)?);
        }
        Ok(self.addresses.get_or_insert_with(Vec::new).as_slice())
    }
}

impl Transaction {
    /// Fill the address cache of every output. Errors name the transaction
    /// and output index.
    pub fn resolve_outputs(&mut self, network: Network) -> Result<()> {
        let hash = self.hash.clone();
        for (index, txout) in self.txouts.iter_mut().enumerate() {
            txout
                .addresses(network)
                .map_err(|e| e.in_output(&hash, index))?;
        }
        Ok(())
    }
}
