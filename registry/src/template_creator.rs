//! Low-level coinbase/Merkle/varint primitives shared by [`crate::template`].
//!
//! These are the pieces of block assembly that do not depend on pool
//! policy (payout address, commitment schemes): BIP-34 height encoding,
//! double-SHA256, Merkle root folding, Bitcoin varint encode/decode, and
//! coinbase transaction parsing.

use crate::error::CoinbaseError;
use bitcoin::consensus::encode::{ReadExt, WriteExt};
use bitcoin::{consensus::Decodable, hashes::sha256d, Transaction, Txid};
use std::io::Cursor;

pub mod constants {
    pub const MAX_BITCOIN_HEIGHT: u32 = 10_000_000;
}

/// Encodes a block height per BIP-34's minimal little-endian integer
/// push: trailing zero bytes dropped, an extra `0x00` appended if the
/// most significant byte would otherwise be read as a sign bit.
pub fn encode_bip34_height(height: u64) -> Vec<u8> {
    if height == 0 {
        return vec![0];
    }
    let mut bytes = Vec::new();
    let mut n = height;
    while n > 0 {
        bytes.push((n & 0xff) as u8);
        n >>= 8;
    }
    if let Some(&last_byte) = bytes.last() {
        if last_byte & 0x80 != 0 {
            bytes.push(0);
        }
    }
    bytes
}

/// Computes the double-SHA256 hash of a byte slice.
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    sha256d::Hash::hash(data).to_byte_array()
}

/// Computes the Merkle root from a coinbase transaction id and a path of
/// sibling hashes, folding the coinbase hash against each sibling in
/// order. This is the same left-fold [`crate::template::MerkleBranch`]
/// performs; kept here in terms of a raw `Txid` + `Vec<Vec<u8>>` path
/// since that is the shape a `getblocktemplate` response's
/// `merklebranch`-adjacent fields most naturally arrive in.
pub fn calculate_merkle_root(coinbase_txid: Txid, path: &[Vec<u8>]) -> [u8; 32] {
    let mut current_hash = coinbase_txid.to_byte_array();
    for branch_bytes in path {
        let mut concatenated = current_hash.to_vec();
        concatenated.extend_from_slice(branch_bytes);
        current_hash = double_sha256(&concatenated);
    }
    current_hash
}

/// Parses a coinbase transaction from raw bytes.
pub fn parse_coinbase_transaction(coinbase_bytes: &[u8]) -> Result<Transaction, CoinbaseError> {
    let mut cursor = Cursor::new(coinbase_bytes);
    Transaction::consensus_decode(&mut cursor).map_err(|_| CoinbaseError::ConsensusDecodeError)
}

/// Decodes a Bitcoin varint from bytes. Returns `(value, bytes_read)`;
/// `bytes_read` may be less than `data.len()` if trailing bytes follow.
pub fn decode_varint(data: &[u8]) -> Result<(u64, usize), CoinbaseError> {
    let mut cursor = Cursor::new(data);
    match cursor.read_compact_size() {
        Ok(value) => Ok((value, cursor.position() as usize)),
        Err(_) => Err(CoinbaseError::ConsensusDecodeError),
    }
}

/// Encodes a `u64` as a Bitcoin varint.
pub fn encode_varint(value: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.emit_compact_size(value)
        .expect("Vec::write failure is impossible");
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merkle_root_calculation() {
        let coinbase_bytes = vec![
            1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 255, 255, 255, 255, 75, 3, 63, 146, 11, 250, 190, 109, 109, 86,
            6, 110, 64, 228, 218, 247, 203, 127, 75, 141, 53, 51, 197, 180, 38, 117, 115, 221, 103,
            2, 11, 85, 213, 65, 221, 74, 90, 97, 128, 91, 182, 1, 0, 0, 0, 0, 0, 0, 0, 49, 101, 7,
            7, 139, 168, 76, 0, 1, 0, 0, 0, 0, 0, 0, 70, 84, 183, 110, 24, 47, 115, 108, 117, 115,
            104, 47, 0, 0, 0, 0, 3, 120, 55, 179, 37, 0, 0, 0, 0, 25, 118, 169, 20, 124, 21, 78,
            209, 220, 89, 96, 158, 61, 38, 171, 178, 223, 46, 163, 213, 135, 205, 140, 65, 136,
            172, 0, 0, 0, 0, 0, 0, 0, 0, 44, 106, 76, 41, 82, 83, 75, 66, 76, 79, 67, 75, 58, 216,
            82, 49, 182, 148, 133, 228, 178, 20, 248, 55, 219, 145, 83, 227, 86, 32, 97, 240, 182,
            3, 175, 116, 196, 69, 114, 83, 46, 0, 71, 230, 205, 0, 0, 0, 0, 0, 0, 0, 0, 38, 106,
            36, 170, 33, 169, 237, 179, 75, 32, 206, 223, 111, 113, 150, 112, 248, 21, 36, 163,
            123, 107, 168, 153, 76, 233, 86, 77, 218, 162, 59, 48, 26, 180, 38, 62, 34, 3, 185, 0,
            0, 0, 0,
        ];

        let path_data = vec![
            vec![
                122, 97, 64, 124, 164, 158, 164, 14, 87, 119, 226, 169, 34, 196, 251, 51, 31, 131,
                109, 250, 13, 54, 94, 6, 177, 27, 156, 154, 101, 30, 123, 159,
            ],
            vec![
                180, 113, 121, 253, 215, 85, 129, 38, 108, 2, 86, 66, 46, 12, 131, 139, 130, 87,
                29, 92, 59, 164, 247, 114, 251, 140, 129, 88, 127, 196, 125, 116,
            ],
            vec![
                171, 77, 225, 148, 80, 32, 41, 157, 246, 77, 161, 49, 87, 139, 214, 236, 149, 164,
                192, 128, 195, 9, 5, 168, 131, 27, 250, 9, 60, 179, 206, 94,
            ],
            vec![
                6, 187, 202, 75, 155, 220, 255, 166, 199, 35, 182, 220, 20, 96, 123, 41, 109, 40,
                186, 142, 13, 139, 230, 164, 116, 177, 217, 23, 16, 123, 135, 202,
            ],
            vec![
                109, 45, 171, 89, 223, 39, 132, 14, 150, 128, 241, 113, 136, 227, 105, 123, 224,
                48, 66, 240, 189, 186, 222, 49, 173, 143, 80, 90, 110, 219, 192, 235,
            ],
            vec![
                196, 7, 21, 180, 228, 161, 182, 132, 28, 153, 242, 12, 210, 127, 157, 86, 62, 123,
                181, 33, 84, 3, 105, 129, 148, 162, 5, 152, 64, 7, 196, 156,
            ],
            vec![
                22, 16, 18, 180, 109, 237, 68, 167, 197, 10, 195, 134, 11, 119, 219, 184, 49, 140,
                239, 45, 27, 210, 212, 120, 186, 60, 155, 105, 106, 219, 218, 32,
            ],
            vec![
                83, 228, 21, 241, 42, 240, 8, 254, 109, 156, 59, 171, 167, 46, 183, 60, 27, 63,
                241, 211, 235, 179, 147, 99, 46, 3, 22, 166, 159, 169, 183, 159,
            ],
            vec![
                230, 81, 3, 190, 66, 73, 200, 55, 94, 135, 209, 50, 92, 193, 114, 202, 141, 170,
                124, 142, 206, 29, 88, 9, 22, 110, 203, 145, 238, 66, 166, 35,
            ],
            vec![
                43, 106, 86, 239, 237, 74, 208, 202, 247, 133, 88, 42, 15, 77, 163, 186, 85, 26,
                89, 151, 5, 19, 30, 122, 108, 220, 215, 104, 152, 226, 113, 55,
            ],
            vec![
                148, 76, 200, 221, 206, 54, 56, 45, 252, 60, 123, 202, 195, 73, 144, 65, 168, 184,
                59, 130, 145, 229, 250, 44, 213, 70, 175, 128, 34, 31, 102, 80,
            ],
            vec![
                203, 112, 102, 31, 49, 147, 24, 25, 245, 61, 179, 146, 205, 127, 126, 100, 78, 204,
                228, 146, 209, 154, 89, 194, 209, 81, 57, 167, 88, 251, 44, 76,
            ],
        ];

        let expected_root = [
            73, 100, 41, 247, 106, 44, 1, 242, 3, 64, 100, 1, 98, 155, 40, 91, 170, 255, 170, 29,
            193, 255, 244, 71, 236, 29, 134, 218, 94, 45, 78, 77,
        ];

        let coinbase_tx =
            parse_coinbase_transaction(&coinbase_bytes).expect("Failed to parse coinbase");
        let coinbase_txid = coinbase_tx.compute_txid();
        let calculated_root = calculate_merkle_root(coinbase_txid, &path_data);
        assert_eq!(
            calculated_root, expected_root,
            "Merkle root calculation failed!"
        );
    }

    #[test]
    fn test_empty_merkle_path() {
        let coinbase_bytes = vec![
            1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 255, 255, 255, 255, 75, 3, 63, 146, 11, 250, 190, 109, 109, 86,
            6, 110, 64, 228, 218, 247, 203, 127, 75, 141, 53, 51, 197, 180, 38, 117, 115, 221, 103,
            2, 11, 85, 213, 65, 221, 74, 90, 97, 128, 91, 182, 1, 0, 0, 0, 0, 0, 0, 0, 49, 101, 7,
            7, 139, 168, 76, 0, 1, 0, 0, 0, 0, 0, 0, 70, 84, 183, 110, 24, 47, 115, 108, 117, 115,
            104, 47, 0, 0, 0, 0, 3, 120, 55, 179, 37, 0, 0, 0, 0, 25, 118, 169, 20, 124, 21, 78,
            209, 220, 89, 96, 158, 61, 38, 171, 178, 223, 46, 163, 213, 135, 205, 140, 65, 136,
            172, 0, 0, 0, 0, 0, 0, 0, 0, 44, 106, 76, 41, 82, 83, 75, 66, 76, 79, 67, 75, 58, 216,
            82, 49, 182, 148, 133, 228, 178, 20, 248, 55, 219, 145, 83, 227, 86, 32, 97, 240, 182,
            3, 175, 116, 196, 69, 114, 83, 46, 0, 71, 230, 205, 0, 0, 0, 0, 0, 0, 0, 0, 38, 106,
            36, 170, 33, 169, 237, 179, 75, 32, 206, 223, 111, 113, 150, 112, 248, 21, 36, 163,
            123, 107, 168, 153, 76, 233, 86, 77, 218, 162, 59, 48, 26, 180, 38, 62, 34, 3, 185, 0,
            0, 0, 0,
        ];

        let coinbase_tx =
            parse_coinbase_transaction(&coinbase_bytes).expect("Failed to parse coinbase");
        let coinbase_txid = coinbase_tx.compute_txid();

        let empty_path: Vec<Vec<u8>> = vec![];
        let result = calculate_merkle_root(coinbase_txid, &empty_path);

        let expected = coinbase_txid.to_byte_array();
        assert_eq!(result, expected, "Empty path should return coinbase TXID");
    }

    #[test]
    fn test_single_step_merkle_path() {
        let coinbase_bytes = vec![
            1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 255, 255, 255, 255, 75, 3, 63, 146, 11, 250, 190, 109, 109, 86,
            6, 110, 64, 228, 218, 247, 203, 127, 75, 141, 53, 51, 197, 180, 38, 117, 115, 221, 103,
            2, 11, 85, 213, 65, 221, 74, 90, 97, 128, 91, 182, 1, 0, 0, 0, 0, 0, 0, 0, 49, 101, 7,
            7, 139, 168, 76, 0, 1, 0, 0, 0, 0, 0, 0, 70, 84, 183, 110, 24, 47, 115, 108, 117, 115,
            104, 47, 0, 0, 0, 0, 3, 120, 55, 179, 37, 0, 0, 0, 0, 25, 118, 169, 20, 124, 21, 78,
            209, 220, 89, 96, 158, 61, 38, 171, 178, 223, 46, 163, 213, 135, 205, 140, 65, 136,
            172, 0, 0, 0, 0, 0, 0, 0, 0, 44, 106, 76, 41, 82, 83, 75, 66, 76, 79, 67, 75, 58, 216,
            82, 49, 182, 148, 133, 228, 178, 20, 248, 55, 219, 145, 83, 227, 86, 32, 97, 240, 182,
            3, 175, 116, 196, 69, 114, 83, 46, 0, 71, 230, 205, 0, 0, 0, 0, 0, 0, 0, 0, 38, 106,
            36, 170, 33, 169, 237, 179, 75, 32, 206, 223, 111, 113, 150, 112, 248, 21, 36, 163,
            123, 107, 168, 153, 76, 233, 86, 77, 218, 162, 59, 48, 26, 180, 38, 62, 34, 3, 185, 0,
            0, 0, 0,
        ];

        let coinbase_tx =
            parse_coinbase_transaction(&coinbase_bytes).expect("Failed to parse coinbase");
        let coinbase_txid = coinbase_tx.compute_txid();

        let single_path = vec![vec![
            122, 97, 64, 124, 164, 158, 164, 14, 87, 119, 226, 169, 34, 196, 251, 51, 31, 131, 109,
            250, 13, 54, 94, 6, 177, 27, 156, 154, 101, 30, 123, 159,
        ]];

        let result = calculate_merkle_root(coinbase_txid, &single_path);

        let mut data = coinbase_txid.to_byte_array().to_vec();
        data.extend_from_slice(&single_path[0]);
        let expected = double_sha256(&data);

        assert_eq!(result, expected, "Single step merkle calculation failed");
    }

    #[test]
    fn bip34_height_drops_trailing_zero_bytes() {
        assert_eq!(encode_bip34_height(0), vec![0]);
        assert_eq!(encode_bip34_height(1), vec![1]);
        assert_eq!(encode_bip34_height(255), vec![255, 0]);
        assert_eq!(encode_bip34_height(256), vec![0, 1]);
    }

    #[test]
    fn test_varint_comprehensive() {
        for value in 0u64..=252 {
            let encoded = encode_varint(value);
            assert_eq!(encoded.len(), 1, "Value {} should encode to 1 byte", value);
            assert_eq!(encoded[0], value as u8);
            let (decoded, bytes_read) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value, "Failed to decode value {}", value);
            assert_eq!(bytes_read, 1);
        }

        let fd_values = [253u64, 254, 255, 256, 1000, 10000, 65535];
        for value in fd_values {
            let encoded = encode_varint(value);
            assert_eq!(encoded.len(), 3, "Value {} should encode to 3 bytes", value);
            assert_eq!(encoded[0], 0xFD);
            let (decoded, bytes_read) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(bytes_read, 3);
        }

        let fe_values = [65536u64, 100000, 1000000, 4294967295];
        for value in fe_values {
            let encoded = encode_varint(value);
            assert_eq!(encoded.len(), 5, "Value {} should encode to 5 bytes", value);
            assert_eq!(encoded[0], 0xFE);
            let (decoded, bytes_read) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(bytes_read, 5);
        }

        let ff_values = [4294967296u64, 1000000000000, u64::MAX];
        for value in ff_values {
            let encoded = encode_varint(value);
            assert_eq!(encoded.len(), 9, "Value {} should encode to 9 bytes", value);
            assert_eq!(encoded[0], 0xFF);
            let (decoded, bytes_read) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(bytes_read, 9);
        }

        let roundtrip_values = [
            0, 1, 127, 128, 252, 253, 254, 255, 256, 1000, 10000, 65535, 65536, 100000, 1000000,
            4294967295, 4294967296, u64::MAX,
        ];
        for &value in &roundtrip_values {
            let encoded = encode_varint(value);
            let (decoded, _) = decode_varint(&encoded).unwrap();
            assert_eq!(
                decoded, value,
                "Roundtrip failed for value {}, encoded as {:?}",
                value, encoded
            );
        }

        assert!(decode_varint(&[]).is_err());
        assert!(decode_varint(&[0xFD, 0x01]).is_err());
        assert!(decode_varint(&[0xFE, 0x01, 0x02, 0x03]).is_err());
        assert!(decode_varint(&[0xFF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07]).is_err());

        assert_eq!(encode_varint(0), vec![0x00]);
        assert_eq!(encode_varint(252), vec![0xFC]);
        assert_eq!(encode_varint(253), vec![0xFD, 0xFD, 0x00]);
        assert_eq!(encode_varint(65535), vec![0xFD, 0xFF, 0xFF]);
        assert_eq!(encode_varint(65536), vec![0xFE, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            encode_varint(4294967296),
            vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );

        assert_eq!(encode_varint(0x1234), vec![0xFD, 0x34, 0x12]);
        assert_eq!(encode_varint(0x12345678), vec![0xFE, 0x78, 0x56, 0x34, 0x12]);
        assert_eq!(
            encode_varint(0x123456789ABCDEF0),
            vec![0xFF, 0xF0, 0xDE, 0xBC, 0x9A, 0x78, 0x56, 0x34, 0x12]
        );

        let boundaries = [
            (252u64, 1),
            (253u64, 3),
            (65535u64, 3),
            (65536u64, 5),
            (4294967295u64, 5),
            (4294967296u64, 9),
        ];
        for &(value, expected_len) in &boundaries {
            let encoded = encode_varint(value);
            assert_eq!(
                encoded.len(),
                expected_len,
                "Value {} should encode to {} bytes",
                value,
                expected_len
            );
            let (decoded, bytes_read) = decode_varint(&encoded).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(bytes_read, expected_len);
        }

        let mut data = encode_varint(1000);
        data.extend_from_slice(&[0xFF, 0xFF, 0xFF]);
        let (decoded, bytes_read) = decode_varint(&data).unwrap();
        assert_eq!(decoded, 1000);
        assert_eq!(bytes_read, 3);
        assert!(bytes_read < data.len());
    }
}
