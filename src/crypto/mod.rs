//! Connection cipher for lobby traffic.
//!
//! The protocol uses a little-endian Blowfish variant keyed by an MD5 digest
//! of a fixed-layout record: a magic constant, a numeric key the client
//! picks per connection, a protocol version, and a 32-byte ASCII handshake
//! phrase. The digest output is the symmetric key for the remainder of the
//! connection; both directions share one instance.
//!
//! Operations are block-oriented and in-place. Buffers must be padded to an
//! 8-byte multiple before enciphering; the segment header records the real
//! payload length, so zero padding is transparent to the peer.

use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::BlowfishLE;
use md5::{Digest, Md5};

use crate::error::{ProtocolError, Result};

/// Cipher block width in bytes.
pub const BLOCK_SIZE: usize = 8;

/// Required handshake phrase length in ASCII bytes.
pub const PHRASE_LEN: usize = 32;

/// Magic constant leading the key derivation record.
const KEY_MAGIC: u32 = 0x1234_5678;

/// Derive the 16-byte connection key from the handshake inputs.
///
/// The record layout is fixed: magic `u32`, key `u32`, version `u32`, then
/// the 32-byte phrase — 44 bytes, little-endian, no padding. Deterministic:
/// identical inputs always produce the identical key.
pub fn derive_key(phrase: &str, key: u32, version: u32) -> Result<[u8; 16]> {
    if phrase.len() != PHRASE_LEN || !phrase.is_ascii() {
        return Err(ProtocolError::Cipher(format!(
            "handshake phrase must be {PHRASE_LEN} ASCII bytes"
        )));
    }

    let mut record = [0u8; 12 + PHRASE_LEN];
    record[0..4].copy_from_slice(&KEY_MAGIC.to_le_bytes());
    record[4..8].copy_from_slice(&key.to_le_bytes());
    record[8..12].copy_from_slice(&version.to_le_bytes());
    record[12..].copy_from_slice(phrase.as_bytes());

    let digest = Md5::digest(record);
    Ok(digest.into())
}

/// The connection cipher. Stateless beyond its key schedule, so one instance
/// is safely shared for both directions and across tasks operating on
/// independent buffers.
pub struct LobbyCipher {
    inner: BlowfishLE,
}

impl LobbyCipher {
    /// Build a cipher from the handshake phrase, numeric key, and version.
    pub fn new(phrase: &str, key: u32, version: u32) -> Result<Self> {
        Self::from_key(&derive_key(phrase, key, version)?)
    }

    /// Build a cipher directly from derived key material.
    pub fn from_key(key: &[u8; 16]) -> Result<Self> {
        let inner = BlowfishLE::new_from_slice(key)
            .map_err(|e| ProtocolError::Cipher(format!("invalid key length: {e}")))?;
        Ok(Self { inner })
    }

    /// Encipher `buf` in place. The length must be a multiple of
    /// [`BLOCK_SIZE`]; use [`LobbyCipher::encipher_padded`] for arbitrary
    /// plaintext lengths.
    pub fn encipher(&self, buf: &mut [u8]) -> Result<()> {
        self.check_aligned(buf.len())?;
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.inner.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Decipher `buf` in place. The length must be a multiple of
    /// [`BLOCK_SIZE`]; clientbound ciphertext always is.
    pub fn decipher(&self, buf: &mut [u8]) -> Result<()> {
        self.check_aligned(buf.len())?;
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            self.inner.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Zero-pad `buf` up to the next block boundary, then encipher.
    pub fn encipher_padded(&self, buf: &mut Vec<u8>) -> Result<()> {
        let padded = buf.len().div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        buf.resize(padded, 0);
        self.encipher(buf)
    }

    fn check_aligned(&self, len: usize) -> Result<()> {
        if len % BLOCK_SIZE != 0 {
            return Err(ProtocolError::Cipher(format!(
                "buffer length {len} is not a multiple of the {BLOCK_SIZE}-byte block size"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PHRASE: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn key_derivation_is_deterministic() {
        let a = derive_key(PHRASE, 1234, 7000).unwrap();
        let b = derive_key(PHRASE, 1234, 7000).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn any_input_change_changes_the_key() {
        let base = derive_key(PHRASE, 1234, 7000).unwrap();
        assert_ne!(base, derive_key(PHRASE, 1235, 7000).unwrap());
        assert_ne!(base, derive_key(PHRASE, 1234, 7001).unwrap());
        let other_phrase = "fedcba9876543210fedcba9876543210";
        assert_ne!(base, derive_key(other_phrase, 1234, 7000).unwrap());
    }

    #[test]
    fn phrase_length_is_enforced() {
        assert!(derive_key("too short", 1, 7000).is_err());
    }

    #[test]
    fn encipher_decipher_round_trip() {
        let cipher = LobbyCipher::new(PHRASE, 99, 7000).unwrap();
        let plaintext: Vec<u8> = (0..64u8).collect();
        let mut buf = plaintext.clone();
        cipher.encipher(&mut buf).unwrap();
        assert_ne!(buf, plaintext);
        cipher.decipher(&mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn padded_encipher_rounds_up_with_zeros() {
        let cipher = LobbyCipher::new(PHRASE, 99, 7000).unwrap();
        let mut buf = vec![0xFFu8; 13];
        cipher.encipher_padded(&mut buf).unwrap();
        assert_eq!(buf.len(), 16);
        cipher.decipher(&mut buf).unwrap();
        assert_eq!(&buf[..13], &[0xFFu8; 13][..]);
        assert_eq!(&buf[13..], &[0, 0, 0]);
    }

    #[test]
    fn misaligned_buffers_are_rejected() {
        let cipher = LobbyCipher::new(PHRASE, 99, 7000).unwrap();
        let mut buf = vec![0u8; 10];
        assert!(cipher.encipher(&mut buf).is_err());
        assert!(cipher.decipher(&mut buf).is_err());
    }

    #[test]
    fn same_key_different_instances_interoperate() {
        let a = LobbyCipher::new(PHRASE, 7, 7000).unwrap();
        let b = LobbyCipher::new(PHRASE, 7, 7000).unwrap();
        let mut buf = vec![0x5Au8; 24];
        a.encipher(&mut buf).unwrap();
        b.decipher(&mut buf).unwrap();
        assert_eq!(buf, vec![0x5Au8; 24]);
    }
}
