//! `BlockTemplate`: one candidate block, from `getblocktemplate` result to
//! a fully assembled, submittable block.
//!
//! A template owns everything needed to answer a `mining.notify` and to
//! validate shares against it: the coinbase split around the extranonce
//! region, the Merkle branch over the other transactions, the network
//! target, and a ledger of already-accepted `(e1, e2, ntime, nonce)`
//! tuples for duplicate detection.

use crate::hash::Algorithm;
use crate::rpc::GetBlockTemplateResult;
use crate::{EXTRANONCE_SEPARATOR, EXTRANONCE1_SIZE, EXTRANONCE2_SIZE};
use bitcoin::hashes::Hash as _;
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, OutPoint, PubkeyHash, ScriptBuf, Sequence,
    Transaction, TxIn, TxOut, Txid, Witness,
};
use bitcoin_hashes::sha256d;
use primitive_types::U256;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Sibling hashes needed to recompute the Merkle root given a new
/// coinbase transaction hash, in bottom-up order. This is the same
/// left-fold used by `calculate_merkle_root` in the original template
/// builder, just packaged as its own type since the registry treats a
/// template's Merkle data as a first-class piece of its contract.
#[derive(Debug, Clone, Default)]
pub struct MerkleBranch(pub Vec<[u8; 32]>);

impl MerkleBranch {
    pub fn from_transactions(non_coinbase_txids: &[Txid]) -> Self {
        // The branch for a 1-coinbase-plus-N-other-tx block is exactly
        // the standard bottom level of a bitcoin Merkle tree: each
        // non-coinbase txid, paired in sequence, duplicating the last
        // one if the level is odd, collapsed upward. What ends up
        // stored is the list of hashes the coinbase must be folded
        // against, in order, to reach the final root -- i.e. precisely
        // what `with_first` expects.
        let mut level: Vec<[u8; 32]> = non_coinbase_txids
            .iter()
            .map(|txid| *txid.as_raw_hash().as_byte_array())
            .collect();
        if level.is_empty() {
            return MerkleBranch(Vec::new());
        }
        // At each level the coinbase (or its accumulated hash) occupies
        // index 0; the sibling it is paired with is index 1, which is
        // exactly what `with_first` needs to fold against next.
        let mut branch = Vec::new();
        while level.len() > 1 {
            if level.len() % 2 == 1 {
                level.push(*level.last().unwrap());
            }
            branch.push(level[1]);
            let mut next = Vec::with_capacity(level.len() / 2);
            for pair in level.chunks(2) {
                next.push(double_sha256_concat(&pair[0], &pair[1]));
            }
            level = next;
        }
        MerkleBranch(branch)
    }

    /// Recomputes the Merkle root given a fresh coinbase transaction
    /// hash, folding it against each stored sibling in order. O(log n)
    /// in the number of transactions.
    pub fn with_first(&self, coinbase_hash: [u8; 32]) -> [u8; 32] {
        let mut acc = coinbase_hash;
        for sibling in &self.0 {
            acc = double_sha256_concat(&acc, sibling);
        }
        acc
    }
}

fn double_sha256_concat(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut buf = [0u8; 64];
    buf[..32].copy_from_slice(a);
    buf[32..].copy_from_slice(b);
    *sha256d::Hash::hash(&buf).as_byte_array()
}

/// Stratum `mining.notify` parameters, precomputed once when the
/// template is built so a busy notify fan-out never recomputes the
/// coinbase split or Merkle branch per connection.
#[derive(Debug, Clone)]
pub struct BroadcastArgs {
    pub job_id: String,
    pub prevhash_hex: String,
    pub coinb1_hex: String,
    pub coinb2_hex: String,
    pub merkle_branch_hex: Vec<String>,
    pub version_hex: String,
    pub nbits_hex: String,
    pub ntime_hex: String,
}

/// A finalized job, after a block-candidate share has committed its
/// header fields. Only needed on the (rare) block-candidate path.
#[derive(Debug, Clone)]
struct Finalized {
    merkle_root_int: U256,
    extranonce1: Vec<u8>,
    extranonce2: Vec<u8>,
    /// Word-reversed ntime field exactly as fed to `serialize_header`: 4
    /// bytes for every algorithm except riecoin's 8-byte field. Stored in
    /// full (not just the leading 4-byte timestamp) so `serialize()`
    /// reconstructs the same header that was hashed to win.
    ntime_bin: Vec<u8>,
    nonce: Vec<u8>,
}

/// Default ntime roll window: shares may be timestamped up to two hours
/// ahead of the template's base time, matching Bitcoin Core's own
/// future-block-time tolerance.
pub const NTIME_ROLL_WINDOW_SECS: u32 = 7200;

pub struct BlockTemplate {
    pub job_id: String,
    pub prevhash_hex: String,
    pub height: u64,
    pub algorithm: Algorithm,

    coinbase_prefix: Vec<u8>,
    coinbase_suffix: Vec<u8>,
    pub extranonce1_size: usize,
    pub extranonce2_size: usize,

    merkle_branch: MerkleBranch,
    pub vtx: Vec<Transaction>,

    pub target: U256,
    bits: Vec<u8>,
    version: i32,
    curtime: u32,

    pub broadcast_args: BroadcastArgs,

    submits: Mutex<HashSet<(Vec<u8>, Vec<u8>, Vec<u8>, Vec<u8>)>>,
    finalized: Mutex<Option<Finalized>>,
}

impl BlockTemplate {
    /// Builds a template from an upstream `getblocktemplate` result. The
    /// coinbase transaction is synthesized with a single input carrying
    /// the BIP-34 height push followed by an extranonce placeholder
    /// (`EXTRANONCE_SEPARATOR`, sized `extranonce1_size + extranonce2_size`)
    /// and a single payout output; the raw bytes are then split around
    /// the placeholder window to produce `coinb1`/`coinb2`, the same
    /// technique the original template builder uses.
    #[allow(clippy::too_many_arguments)]
    pub fn fill_from_rpc(
        data: &GetBlockTemplateResult,
        job_id: String,
        algorithm: Algorithm,
        payout_script: ScriptBuf,
        extranonce1_size: usize,
        extranonce2_size: usize,
    ) -> Self {
        let prevhash_hex = hex::encode(data.previous_block_hash);
        let placeholder_len = extranonce1_size + extranonce2_size;
        let mut script_sig = crate::template_creator::encode_bip34_height(data.height);
        script_sig.extend(std::iter::repeat(EXTRANONCE_SEPARATOR[0]).take(placeholder_len.max(EXTRANONCE_SEPARATOR.len())));

        let coinbase_input = TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from_bytes(script_sig),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        };
        let payout = TxOut {
            value: Amount::from_sat(data.coinbase_value),
            script_pubkey: payout_script,
        };
        let mut outputs = vec![payout];
        if let Some(commitment) = &data.witness_commitment {
            outputs.push(TxOut {
                value: Amount::ZERO,
                script_pubkey: ScriptBuf::from_bytes(commitment.clone()),
            });
        }
        let coinbase_tx = Transaction {
            version: Version::non_standard(1),
            lock_time: LockTime::ZERO,
            input: vec![coinbase_input],
            output: outputs,
        };

        let raw = bitcoin::consensus::serialize(&coinbase_tx);
        let marker = vec![EXTRANONCE_SEPARATOR[0]; placeholder_len.max(EXTRANONCE_SEPARATOR.len())];
        let marker_pos = find_subslice(&raw, &marker).unwrap_or(raw.len());
        let (coinbase_prefix, rest) = raw.split_at(marker_pos);
        let coinbase_suffix = rest.get(marker.len()..).unwrap_or(&[]);

        let non_coinbase_txids: Vec<Txid> = data.transactions.iter().map(|t| t.compute_txid()).collect();
        let merkle_branch = MerkleBranch::from_transactions(&non_coinbase_txids);

        let broadcast_args = BroadcastArgs {
            job_id: job_id.clone(),
            prevhash_hex: reversed_hex(&data.previous_block_hash),
            coinb1_hex: hex::encode(coinbase_prefix),
            coinb2_hex: hex::encode(coinbase_suffix),
            merkle_branch_hex: merkle_branch.0.iter().map(hex::encode).collect(),
            version_hex: hex::encode(data.version.to_be_bytes()),
            nbits_hex: hex::encode(&data.bits),
            ntime_hex: hex::encode(data.cur_time.to_be_bytes()),
        };

        BlockTemplate {
            job_id,
            prevhash_hex,
            height: data.height,
            algorithm,
            coinbase_prefix: coinbase_prefix.to_vec(),
            coinbase_suffix: coinbase_suffix.to_vec(),
            extranonce1_size,
            extranonce2_size,
            merkle_branch,
            vtx: data.transactions.clone(),
            target: U256::from_big_endian(&data.target),
            bits: data.bits.clone(),
            version: data.version,
            curtime: data.cur_time,
            broadcast_args,
            submits: Mutex::new(HashSet::new()),
            finalized: Mutex::new(None),
        }
    }

    /// `n ≤ now + NTIME_ROLL_WINDOW_SECS`, and not absurdly in the past
    /// (before the template's own base time minus the same window).
    pub fn check_ntime(&self, n: u32) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(self.curtime);
        let lower = self.curtime.saturating_sub(NTIME_ROLL_WINDOW_SECS);
        let upper = now.saturating_add(NTIME_ROLL_WINDOW_SECS);
        n >= lower && n <= upper
    }

    /// Returns `true` the first time this exact tuple is submitted,
    /// `false` on every subsequent identical submission.
    pub fn register_submit(&self, e1: &[u8], e2: &[u8], ntime: &[u8], nonce: &[u8]) -> bool {
        let key = (e1.to_vec(), e2.to_vec(), ntime.to_vec(), nonce.to_vec());
        self.submits.lock().expect("submits lock poisoned").insert(key)
    }

    /// Recomputes the Merkle root for a coinbase transaction hashing to
    /// `coinbase_hash`, folding it against this template's precomputed
    /// sibling list.
    pub fn merkle_root_with_coinbase(&self, coinbase_hash: [u8; 32]) -> [u8; 32] {
        self.merkle_branch.with_first(coinbase_hash)
    }

    pub fn serialize_coinbase(&self, e1: &[u8], e2: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            self.coinbase_prefix.len() + e1.len() + e2.len() + self.coinbase_suffix.len(),
        );
        out.extend_from_slice(&self.coinbase_prefix);
        out.extend_from_slice(e1);
        out.extend_from_slice(e2);
        out.extend_from_slice(&self.coinbase_suffix);
        out
    }

    /// Builds the header bytes hashed for proof-of-work: the standard
    /// 80-byte layout (version, prevhash, merkle root, ntime, bits,
    /// nonce) for every algorithm except riecoin, whose wider ntime (8
    /// bytes) and nonce (32 bytes) fields bring the header to 112 bytes.
    pub fn serialize_header(&self, merkle_root_int: U256, ntime_bin: &[u8], nonce_bin: &[u8]) -> Vec<u8> {
        let mut header = Vec::with_capacity(112);
        header.extend_from_slice(&self.version.to_le_bytes());
        header.extend_from_slice(&reversed(&hex::decode(&self.prevhash_hex).unwrap_or_default()));
        let mut merkle_root_bytes = [0u8; 32];
        merkle_root_int.to_little_endian(&mut merkle_root_bytes);
        header.extend_from_slice(&merkle_root_bytes);
        header.extend_from_slice(ntime_bin);
        header.extend_from_slice(&self.bits);
        header.extend_from_slice(nonce_bin);
        header
    }

    /// Commits the header fields a winning submission produced so
    /// `serialize()` can assemble the full block later. `ntime_bin` is
    /// the word-reversed ntime field exactly as passed to
    /// `serialize_header` for the winning header.
    pub fn finalize(&self, merkle_root_int: U256, e1: &[u8], e2: &[u8], ntime_bin: &[u8], nonce: &[u8]) {
        *self.finalized.lock().expect("finalize lock poisoned") = Some(Finalized {
            merkle_root_int,
            extranonce1: e1.to_vec(),
            extranonce2: e2.to_vec(),
            ntime_bin: ntime_bin.to_vec(),
            nonce: nonce.to_vec(),
        });
    }

    /// Self-check after `finalize`: the template must actually have been
    /// finalized, the finalized field sizes must match this template's
    /// algorithm, the coinbase bytes must consensus-decode into a single-
    /// input transaction, and the committed Merkle root must actually
    /// fold up from that coinbase and this template's other transactions
    /// (not just an arbitrary value passed to `finalize`). Returning
    /// `false` indicates an internal programming error, not a miner
    /// fault.
    pub fn is_valid(&self) -> bool {
        let finalized = self.finalized.lock().expect("finalize lock poisoned");
        let f = match finalized.as_ref() {
            Some(f) => f,
            None => return false,
        };
        if f.extranonce1.len() != self.extranonce1_size || f.extranonce2.len() != self.extranonce2_size {
            return false;
        }

        let (expected_ntime_len, expected_nonce_len, expected_header_len) = if self.algorithm == Algorithm::Riecoin {
            (8, 32, 112)
        } else {
            (4, 4, 80)
        };
        if f.ntime_bin.len() != expected_ntime_len || f.nonce.len() != expected_nonce_len {
            return false;
        }

        let coinbase_bytes = self.serialize_coinbase(&f.extranonce1, &f.extranonce2);
        let coinbase_tx: Transaction = match bitcoin::consensus::deserialize(&coinbase_bytes) {
            Ok(tx) => tx,
            Err(_) => return false,
        };
        if coinbase_tx.input.len() != 1 || coinbase_tx.output.is_empty() {
            return false;
        }

        // The committed Merkle root must actually fold up from this
        // coinbase and the template's other transactions, not just an
        // arbitrary value a caller happened to pass to `finalize`.
        let coinbase_hash = crate::template_creator::double_sha256(&coinbase_bytes);
        let recomputed_root = U256::from_little_endian(&self.merkle_root_with_coinbase(coinbase_hash));
        if recomputed_root != f.merkle_root_int {
            return false;
        }

        let header = self.serialize_header(f.merkle_root_int, &f.ntime_bin, &f.nonce);
        header.len() == expected_header_len
    }

    /// Serializes the complete, solved block: the finalized coinbase
    /// transaction followed by every other transaction in the template.
    pub fn serialize(&self) -> Option<Vec<u8>> {
        let finalized = self.finalized.lock().expect("finalize lock poisoned");
        let f = finalized.as_ref()?;
        let coinbase_bytes = self.serialize_coinbase(&f.extranonce1, &f.extranonce2);
        let header = self.serialize_header(f.merkle_root_int, &f.ntime_bin, &f.nonce);

        let mut out = Vec::new();
        out.extend_from_slice(&header);
        out.extend_from_slice(&crate::template_creator::encode_varint(1 + self.vtx.len() as u64));
        out.extend_from_slice(&coinbase_bytes);
        for tx in &self.vtx {
            out.extend_from_slice(&bitcoin::consensus::serialize(tx));
        }
        Some(out)
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn reversed(bytes: &[u8]) -> Vec<u8> {
    let mut v = bytes.to_vec();
    v.reverse();
    v
}

fn reversed_hex(bytes: &[u8; 32]) -> String {
    let mut v = bytes.to_vec();
    v.reverse();
    hex::encode(v)
}

/// A lone `PubkeyHash` payout script helper used by tests and by the
/// default CLI configuration when no payout address is configured.
pub fn p2pkh_script(hash: PubkeyHash) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&hash)
}
