//! Cryptographic primitives of the encrypted storage format.
//!
//! Thin, allocation-light wrappers over the RustCrypto crates: PBKDF2 with
//! HMAC-SHA1 for key derivation, AES-256-CBC block decryption without
//! padding, and constant-time HMAC-SHA1 verification. Higher layers own
//! the page layout; this module only knows bytes.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use subtle::ConstantTimeEq;

use crate::config::{HMAC_SIZE, IV_SIZE, KEY_SIZE};

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type HmacSha1 = Hmac<Sha1>;

/// AES block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Derives `out.len()` bytes from `password` and `salt` per RFC 2898.
#[inline]
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32, out: &mut [u8]) {
    pbkdf2_hmac::<Sha1>(password, salt, iterations, out);
}

/// Decrypts `data` in place with AES-256-CBC and no padding.
///
/// `data` must be block-aligned; the plaintext replaces the ciphertext
/// byte for byte.
pub fn aes_cbc_decrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], data: &mut [u8]) {
    debug_assert_eq!(data.len() % BLOCK_SIZE, 0);

    let mut cipher = Aes256CbcDec::new(key.into(), iv.into());
    for block in data.chunks_exact_mut(BLOCK_SIZE) {
        cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Computes HMAC-SHA1 over the concatenation of `parts`.
pub fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; HMAC_SIZE] {
    let mut mac = HmacSha1::new_from_slice(key).expect("hmac accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Verifies an HMAC-SHA1 tag in constant time.
pub fn hmac_sha1_verify(key: &[u8], parts: &[&[u8]], tag: &[u8]) -> bool {
    if tag.len() != HMAC_SIZE {
        return false;
    }
    let computed = hmac_sha1(key, parts);
    bool::from(computed.ct_eq(tag))
}

/// XORs every byte of `data` with `b`, returning the result.
pub fn xor_bytes(data: &[u8], b: u8) -> Vec<u8> {
    data.iter().map(|&x| x ^ b).collect()
}
