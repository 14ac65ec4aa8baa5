//! HMAC-SHA1 keyed hashing.
//!
//! [`hmac_sha1`] is the standard 64-byte-block construction used for
//! MESSAGE-INTEGRITY. [`hmac_sha1_with_block_size`] exposes the block size
//! so credential derivation can use its short 8-byte variant.

use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use zeroize::Zeroizing;

/// HMAC-SHA1 output length
pub const HMAC_SHA1_LEN: usize = 20;

/// SHA-1 block size used by standard HMAC
pub const SHA1_BLOCK_SIZE: usize = 64;

const IPAD: u8 = 0x36;
const OPAD: u8 = 0x5c;

type HmacSha1 = Hmac<Sha1>;

/// Standard HMAC-SHA1 of `text` under `key`
#[must_use]
pub fn hmac_sha1(key: &[u8], text: &[u8]) -> [u8; HMAC_SHA1_LEN] {
    // HMAC takes keys of any length; the manual engine only backs an
    // implementation that would reject one.
    <HmacSha1 as KeyInit>::new_from_slice(key).map_or_else(
        |_| hmac_sha1_with_block_size(key, text, SHA1_BLOCK_SIZE),
        |mut mac| {
            mac.update(text);
            mac.finalize().into_bytes().into()
        },
    )
}

/// HMAC-SHA1 with an explicit key block size
///
/// Keys longer than `block_size` are replaced by their SHA-1 digest
/// (truncated to the block), shorter keys are zero-padded. The result is
/// `SHA1((K ^ opad) || SHA1((K ^ ipad) || text))`.
#[must_use]
pub fn hmac_sha1_with_block_size(
    key: &[u8],
    text: &[u8],
    block_size: usize,
) -> [u8; HMAC_SHA1_LEN] {
    let mut block = Zeroizing::new(vec![0u8; block_size]);
    if key.len() > block_size {
        let digest = Sha1::digest(key);
        let len = digest.len().min(block_size);
        block[..len].copy_from_slice(&digest[..len]);
    } else {
        block[..key.len()].copy_from_slice(key);
    }

    let mut inner = Sha1::new();
    let inner_key: Zeroizing<Vec<u8>> = Zeroizing::new(block.iter().map(|b| b ^ IPAD).collect());
    inner.update(inner_key.as_slice());
    inner.update(text);
    let inner_hash = inner.finalize();

    let mut outer = Sha1::new();
    let outer_key: Zeroizing<Vec<u8>> = Zeroizing::new(block.iter().map(|b| b ^ OPAD).collect());
    outer.update(outer_key.as_slice());
    outer.update(inner_hash);
    outer.finalize().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vector_key(start: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| start.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_fips_198a_sample_1() {
        let key = vector_key(0x00, 64);
        assert_eq!(
            hex::encode(hmac_sha1(&key, b"Sample #1")),
            "4f4ca3d5d68ba7cc0a1208c9c61e9c5da0403c0a"
        );
    }

    #[test]
    fn test_fips_198a_sample_2() {
        let key = vector_key(0x30, 20);
        assert_eq!(
            hex::encode(hmac_sha1(&key, b"Sample #2")),
            "0922d3405faa3d194f82a45830737d5cc6c75d24"
        );
    }

    #[test]
    fn test_fips_198a_sample_3() {
        let key = vector_key(0x50, 100);
        assert_eq!(
            hex::encode(hmac_sha1(&key, b"Sample #3")),
            "bcf41eab8bb2d802f3d05caf7cb092ecf8d1a3aa"
        );
    }

    #[test]
    fn test_manual_engine_matches_standard() {
        for len in [0, 8, 20, 64, 65, 100, 1000] {
            let key = vector_key(0x11, len);
            assert_eq!(
                hmac_sha1_with_block_size(&key, b"stunprobe", SHA1_BLOCK_SIZE),
                hmac_sha1(&key, b"stunprobe"),
                "key length {len}"
            );
        }
    }

    #[test]
    fn test_short_block_variant() {
        let key = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let text = 1_700_000_000_000u64.to_be_bytes();
        let short = hmac_sha1_with_block_size(&key, &text, 8);
        assert_eq!(short.len(), HMAC_SHA1_LEN);
        assert_ne!(short, hmac_sha1(&key, &text));
        assert_eq!(short, hmac_sha1_with_block_size(&key, &text, 8));
    }
}
