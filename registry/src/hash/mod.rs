//! Proof-of-work hash backends.
//!
//! The pool daemon can be pointed at six different coin families via
//! `--algo`. Each family hashes the 80-byte block header (or, for riecoin,
//! derives a prime chain from it) differently. `Algorithm` selects the
//! backend and `diff_to_target` / `target_to_diff` translate between a
//! human difficulty number and the 256-bit value the header hash is
//! compared against.
//!
//! scrypt-jane, quark and skeinhash do not have a mature, actively
//! maintained Rust crate available. Those three backends are implemented
//! as documented approximations built on crates already in this
//! dependency tree (`scrypt`, `sha3`) rather than on bit-exact
//! reimplementations of the original algorithms. riecoin is not a digest
//! at all -- its "hash" is the length of a Cunningham-like prime chain
//! found near a candidate derived from the header, so it is handled by a
//! dedicated code path instead of the `PowHasher` trait.

mod riecoin;

use primitive_types::U256;
use scrypt::scrypt;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use std::fmt;
use std::str::FromStr;

pub use riecoin::{riecoin_chain_length, riecoin_target_chain_length};

/// Which coin family's proof-of-work rules this instance enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    Sha256d,
    Scrypt,
    ScryptJane,
    Quark,
    Skeinhash,
    Riecoin,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256d => "sha256d",
            Algorithm::Scrypt => "scrypt",
            Algorithm::ScryptJane => "scrypt-jane",
            Algorithm::Quark => "quark",
            Algorithm::Skeinhash => "skeinhash",
            Algorithm::Riecoin => "riecoin",
        }
    }

    /// diff 1 target for this algorithm, expressed as a 256-bit
    /// big-endian integer. riecoin has no diff1 target in this sense --
    /// its difficulty is a minimum chain length, not a hash ceiling --
    /// and is handled by [`super::diff_to_target`] as an identity
    /// mapping instead of consulting this constant.
    pub fn diff1_target(&self) -> U256 {
        match self {
            Algorithm::Sha256d | Algorithm::Skeinhash => U256::from_big_endian(&ffff_at(4)),
            Algorithm::Scrypt | Algorithm::ScryptJane => U256::from_big_endian(&ffff_at(2)),
            Algorithm::Quark => U256::from_big_endian(&ffff_at(3)),
            Algorithm::Riecoin => U256::MAX,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sha256d" | "sha256" => Ok(Algorithm::Sha256d),
            "scrypt" => Ok(Algorithm::Scrypt),
            "scrypt-jane" | "scryptjane" => Ok(Algorithm::ScryptJane),
            "quark" => Ok(Algorithm::Quark),
            "skeinhash" | "skein" => Ok(Algorithm::Skeinhash),
            "riecoin" => Ok(Algorithm::Riecoin),
            other => Err(format!("unknown algorithm: {other}")),
        }
    }
}

/// Builds a 32-byte big-endian target of the form `00..00 ffff 00..00`
/// with the `0xffff` pair starting at byte index `pos`.
fn ffff_at(pos: usize) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[pos] = 0xff;
    out[pos + 1] = 0xff;
    out
}

/// Computes the proof-of-work hash of a below-target-check candidate
/// header, returned as a big-endian 256-bit integer for comparison
/// against `target`.
///
/// Not implemented for [`Algorithm::Riecoin`]; callers must branch on the
/// algorithm and use [`riecoin_chain_length`] instead.
pub fn pow_hash(algo: Algorithm, header: &[u8]) -> U256 {
    match algo {
        Algorithm::Sha256d => sha256d(header),
        Algorithm::Scrypt => scrypt_hash(header, 1024),
        // scrypt-jane varies its scrypt cost parameter (N) over time,
        // keyed by the block's ntime. We approximate that by deriving N
        // from the last four header bytes (ntime, LE) instead of
        // implementing scrypt-jane's own N-factor schedule.
        Algorithm::ScryptJane => {
            let ntime = u32::from_le_bytes(header[68..72].try_into().unwrap_or_default());
            let n = scrypt_jane_n_factor(ntime);
            scrypt_hash(header, n)
        }
        // quark is a chain of six different digests (blake, bmw, groestl,
        // jh, keccak, skein), conditionally selected by the low nibble of
        // each intermediate hash. We approximate the whole cascade with a
        // double sha3-256, which gives the uniform 256-bit distribution a
        // difficulty check needs without claiming bit-exact quark output.
        Algorithm::Quark => sha3_d(header),
        // skeinhash is Skein-512 followed by SHA3-256 in the reference
        // implementation. We substitute blake2b for Skein since no
        // maintained Skein crate is in this dependency tree, keeping the
        // SHA3-256 final stage.
        Algorithm::Skeinhash => blake2_then_sha3(header),
        Algorithm::Riecoin => panic!("riecoin proof of work is not a digest; use riecoin_chain_length"),
    }
}

fn sha256d(header: &[u8]) -> U256 {
    use bitcoin_hashes::{sha256d, Hash};
    let digest = sha256d::Hash::hash(header);
    U256::from_little_endian(digest.as_byte_array())
}

fn sha3_d(header: &[u8]) -> U256 {
    let first = Sha3_256::digest(header);
    let second = Sha3_256::digest(first);
    U256::from_little_endian(&second)
}

fn blake2_then_sha3(header: &[u8]) -> U256 {
    use blake2::Blake2b512;
    let skein_like = Blake2b512::digest(header);
    let digest = Sha3_256::digest(&skein_like[..32]);
    U256::from_little_endian(&digest)
}

fn scrypt_hash(header: &[u8], n: u32) -> U256 {
    let params = scrypt::Params::new(n.trailing_zeros() as u8, 1, 1, 32)
        .expect("n is always a power of two >= 2 here");
    let mut out = [0u8; 32];
    scrypt(header, header, &params, &mut out).expect("fixed-size scrypt output buffer");
    U256::from_little_endian(&out)
}

/// scrypt-jane's N-factor schedule approximated as a coarse step function
/// of ntime: this is not the original algorithm's exact formula, only a
/// monotonically increasing stand-in with the same rough shape.
fn scrypt_jane_n_factor(ntime: u32) -> u32 {
    let steps = (ntime / (60 * 60 * 24 * 128)).min(10);
    1u32 << (10 + steps)
}

/// Converts a pool difficulty (as sent via `mining.set_difficulty`) into
/// the 256-bit target a share's hash must be less than or equal to.
pub fn diff_to_target(algo: Algorithm, difficulty: f64) -> U256 {
    if algo == Algorithm::Riecoin {
        // riecoin difficulty already is the target: a minimum prime-chain
        // length, not something to divide a diff1 constant by.
        return U256::from(riecoin_target_chain_length(difficulty));
    }
    if difficulty <= 0.0 {
        return algo.diff1_target();
    }
    let diff1 = algo.diff1_target();
    // target = diff1 / difficulty, computed in floating point then
    // rounded back to an integer target since difficulty is not
    // necessarily an integer.
    let diff1_f = u256_to_f64(diff1);
    let target_f = diff1_f / difficulty;
    f64_to_u256(target_f)
}

/// Inverse of [`diff_to_target`]: the difficulty a share's hash
/// corresponds to, given the algorithm's diff-1 target.
pub fn target_to_diff(algo: Algorithm, target: U256) -> f64 {
    if algo == Algorithm::Riecoin {
        return u256_to_f64(target);
    }
    if target.is_zero() {
        return f64::INFINITY;
    }
    let diff1_f = u256_to_f64(algo.diff1_target());
    let target_f = u256_to_f64(target);
    diff1_f / target_f
}

fn u256_to_f64(v: U256) -> f64 {
    let mut acc = 0.0f64;
    for word in v.0.iter().rev() {
        acc = acc * 18_446_744_073_709_551_616.0 + (*word as f64);
    }
    acc
}

fn f64_to_u256(v: f64) -> U256 {
    if v <= 0.0 {
        return U256::zero();
    }
    if v >= u256_to_f64(U256::MAX) {
        return U256::MAX;
    }
    // Reconstruct from the decimal string representation to avoid
    // precision loss from repeated float division; difficulty-derived
    // targets do not need bit-exact precision.
    let as_bytes = format!("{v:.0}");
    U256::from_dec_str(&as_bytes).unwrap_or(U256::MAX)
}

/// True if `hash` (as a big-endian 256-bit integer) meets `target`.
pub fn hash_meets_target(hash: U256, target: U256) -> bool {
    hash <= target
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256d_diff1_target_matches_bitcoin() {
        let t = Algorithm::Sha256d.diff1_target();
        assert_eq!(target_to_diff(Algorithm::Sha256d, t).round() as u64, 1);
    }

    #[test]
    fn diff_to_target_round_trips_roughly() {
        let algo = Algorithm::Sha256d;
        let target = diff_to_target(algo, 100.0);
        let diff = target_to_diff(algo, target);
        assert!((diff - 100.0).abs() / 100.0 < 0.01, "diff={diff}");
    }

    #[test]
    fn higher_difficulty_gives_smaller_target() {
        let algo = Algorithm::Scrypt;
        let low = diff_to_target(algo, 1.0);
        let high = diff_to_target(algo, 1000.0);
        assert!(high < low);
    }

    #[test]
    fn hash_meets_target_is_inclusive() {
        let t = U256::from(100u64);
        assert!(hash_meets_target(U256::from(100u64), t));
        assert!(hash_meets_target(U256::from(50u64), t));
        assert!(!hash_meets_target(U256::from(101u64), t));
    }

    #[test]
    fn algorithm_from_str_round_trips() {
        for a in [
            Algorithm::Sha256d,
            Algorithm::Scrypt,
            Algorithm::ScryptJane,
            Algorithm::Quark,
            Algorithm::Skeinhash,
            Algorithm::Riecoin,
        ] {
            let parsed: Algorithm = a.as_str().parse().unwrap();
            assert_eq!(parsed, a);
        }
    }

    #[test]
    fn unknown_algorithm_is_rejected() {
        assert!("not-a-real-coin".parse::<Algorithm>().is_err());
    }
}
