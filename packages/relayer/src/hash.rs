//! Hash primitives shared by the relay and transport engines
//!
//! The hub contracts hash with keccak256 while Bitcoin-family source chains
//! use double SHA-256 with byte-reversed ("display order") identifiers.

use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

/// Commitment binding a header payload to the relayer that fetched it.
///
/// Matches `keccak256(abi.encodePacked(bytes rawHeader, address relayer))`:
/// packed encoding concatenates the raw bytes with the 20-byte address.
pub fn header_commitment(raw_header: &[u8], relayer: &[u8; 20]) -> [u8; 32] {
    let mut data = Vec::with_capacity(raw_header.len() + 20);
    data.extend_from_slice(raw_header);
    data.extend_from_slice(relayer);
    keccak256(&data)
}

/// SHA-256 applied twice
pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// Transaction id in display order (the form returned by node RPCs)
pub fn txid_display(raw_tx: &[u8]) -> [u8; 32] {
    reverse32(&double_sha256(raw_tx))
}

/// Reverse a 32-byte hash between internal and display byte order
pub fn reverse32(hash: &[u8; 32]) -> [u8; 32] {
    let mut out = *hash;
    out.reverse();
    out
}

/// Format bytes as 0x-prefixed hex string
pub fn bytes32_to_hex(bytes: &[u8; 32]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a 32-byte hash from hex, with or without 0x prefix
pub fn parse_bytes32(s: &str) -> Result<[u8; 32], String> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() != 64 {
        return Err(format!("expected 64 hex chars, got {}", s.len()));
    }
    let bytes = hex::decode(s).map_err(|e| format!("invalid hex: {}", e))?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_empty() {
        let hash = keccak256(&[]);
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_double_sha256_known_vector() {
        // sha256(sha256("hello"))
        assert_eq!(
            hex::encode(double_sha256(b"hello")),
            "9595c9df90075148eb06860365df33584b75bff782a510c6cd4883a419833d50"
        );
    }

    #[test]
    fn test_commitment_is_packed_concat() {
        let raw = [0xabu8; 80];
        let relayer = [0x11u8; 20];
        let mut packed = raw.to_vec();
        packed.extend_from_slice(&relayer);
        assert_eq!(header_commitment(&raw, &relayer), keccak256(&packed));
    }

    #[test]
    fn test_commitment_differs_per_relayer() {
        let raw = [0x01u8; 80];
        assert_ne!(
            header_commitment(&raw, &[0x11; 20]),
            header_commitment(&raw, &[0x22; 20])
        );
    }

    #[test]
    fn test_parse_bytes32() {
        let hex_str = format!("0x{}", "ab".repeat(32));
        let parsed = parse_bytes32(&hex_str).unwrap();
        assert_eq!(parsed, [0xab; 32]);
        assert_eq!(bytes32_to_hex(&parsed), hex_str);
        assert!(parse_bytes32("0x1234").is_err());
        assert!(parse_bytes32(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_reverse32_roundtrip() {
        let mut h = [0u8; 32];
        h[0] = 1;
        let r = reverse32(&h);
        assert_eq!(r[31], 1);
        assert_eq!(reverse32(&r), h);
    }
}
