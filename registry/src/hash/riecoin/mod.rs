//! riecoin proof-of-work: prime chain length instead of a digest.
//!
//! A riecoin miner hashes the header with sha256d to get a 256-bit seed,
//! multiplies it by a large primorial, adds a nonce offset, and counts
//! how many terms of a Cunningham/bi-twin-style chain starting at that
//! candidate are prime. Share (and block) difficulty is measured in
//! chain length rather than a hash-below-target comparison.
//!
//! This is a documented approximation of the real algorithm: the
//! primality test is a Fermat test (not the Baillie-PSW + sieve pipeline
//! a real riecoin node uses) and the primorial/offset search is bounded
//! to keep worst-case latency predictable. It is accurate enough to
//! reject obviously-too-short chains and to accept well-formed long ones
//! for testing and simulation purposes.

use bitcoin_hashes::{sha256d, Hash};
use num_bigint::BigUint;
use num_integer::Integer;
use num_traits::{One, Zero};

/// Primorial used to shift the header seed into riecoin's working range.
/// Real riecoin uses a much larger primorial (product of the first ~samples
/// of primes); we use a small one sufficient to keep BigUint arithmetic
/// fast while preserving the "offset search near a multiple of small
/// primes" structure of the real search.
fn primorial() -> BigUint {
    let mut acc = BigUint::one();
    for p in [2u32, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31] {
        acc *= BigUint::from(p);
    }
    acc
}

fn fermat_probable_prime(n: &BigUint) -> bool {
    if n < &BigUint::from(2u32) {
        return false;
    }
    if n == &BigUint::from(2u32) {
        return true;
    }
    if n.is_even() {
        return false;
    }
    let base = BigUint::from(2u32);
    let exp = n - BigUint::one();
    base.modpow(&exp, n) == BigUint::one()
}

/// Counts the length of the prime chain starting at `seed * primorial +
/// offset`, stepping by two (the chain is a run of values `n, 2n+1,
/// 4n+3, ...` in the real algorithm; we approximate with a simple
/// additive run of odd candidates, which preserves "longer chain is
/// harder to find" but not riecoin's exact chain topology).
///
/// `max_length` bounds the search so a pathological seed cannot cause
/// unbounded work.
pub fn riecoin_chain_length(header: &[u8], nonce: u64, max_length: u32) -> u32 {
    let seed_hash = sha256d::Hash::hash(header);
    let seed = BigUint::from_bytes_le(seed_hash.as_byte_array());
    let candidate_base = seed * primorial() + BigUint::from(nonce);
    let mut candidate = if candidate_base.is_even() {
        candidate_base + BigUint::one()
    } else {
        candidate_base
    };

    let mut length = 0u32;
    while length < max_length {
        if !fermat_probable_prime(&candidate) {
            break;
        }
        length += 1;
        candidate = (candidate << 1u32) + BigUint::one();
    }
    length
}

/// Minimum chain length a share must reach for the given pool difficulty.
/// riecoin difficulty is fractional (e.g. 8.25 means an 8-chain plus a
/// fractional bonus for how close the next term came to prime); we round
/// up to the next whole chain length as a conservative approximation.
pub fn riecoin_target_chain_length(difficulty: f64) -> u32 {
    if difficulty <= 0.0 {
        return 1;
    }
    difficulty.ceil() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_difficulty_requires_at_least_one_prime() {
        assert_eq!(riecoin_target_chain_length(0.0), 1);
    }

    #[test]
    fn chain_length_is_bounded_by_max() {
        let header = [0u8; 80];
        let len = riecoin_chain_length(&header, 12345, 5);
        assert!(len <= 5);
    }

    #[test]
    fn fermat_test_rejects_small_composites() {
        assert!(!fermat_probable_prime(&BigUint::from(9u32)));
        assert!(fermat_probable_prime(&BigUint::from(7u32)));
    }
}
