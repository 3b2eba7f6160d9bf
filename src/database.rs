//! Page-level decryption of the encrypted message databases.
//!
//! Each database is a sequence of 4096-byte pages. Page 0 opens with a
//! 16-byte salt; every page ends with a 48-byte reserve holding the
//! AES-CBC IV (and, on page 0, the HMAC tag that authenticates the key).
//! Decryption rewrites the page bodies in place and carries the reserve
//! through untouched, prepending the standard SQLite header the encrypted
//! format elides.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::config::{
    DEFAULT_ITER, HMAC_SIZE, IV_SIZE, KEY_SIZE, MAC_ITER, MAC_SALT_XOR, PAGE_SIZE, RESERVE_SIZE,
    SALT_SIZE, SQLITE_HEADER,
};
use crate::crypto;
use crate::error::DbError;

/// Decrypted bytes per page 0 body (salt and reserve excluded).
const PAGE0_BODY: usize = PAGE_SIZE - SALT_SIZE - RESERVE_SIZE;

/// Decrypted bytes per subsequent page body.
const PAGE_BODY: usize = PAGE_SIZE - RESERVE_SIZE;

/// Encryption and authentication keys derived from one database salt.
struct PageKeys {
    enc: [u8; KEY_SIZE],
    mac: [u8; KEY_SIZE],
}

impl PageKeys {
    /// Runs the format's two-stage PBKDF2 schedule.
    fn derive(password: &[u8], salt: &[u8]) -> Self {
        let mut enc = [0u8; KEY_SIZE];
        crypto::derive_key(password, salt, DEFAULT_ITER, &mut enc);

        let mac_salt = crypto::xor_bytes(salt, MAC_SALT_XOR);
        let mut mac = [0u8; KEY_SIZE];
        crypto::derive_key(&enc, &mac_salt, MAC_ITER, &mut mac);

        Self { enc, mac }
    }
}

/// Checks the page-0 HMAC that authenticates a candidate password.
///
/// `body` is the page with the salt stripped (4080 bytes). The tag covers
/// everything up to itself plus the little-endian page number 1.
fn page0_authentic(keys: &PageKeys, body: &[u8]) -> bool {
    let tag_at = body.len() - RESERVE_SIZE + IV_SIZE;
    crypto::hmac_sha1_verify(
        &keys.mac,
        &[&body[..tag_at], &1u32.to_le_bytes()],
        &body[tag_at..tag_at + HMAC_SIZE],
    )
}

/// Reads up to one full page, tolerating EOF mid-call.
///
/// Returns the number of bytes actually read; 0 means clean EOF.
fn read_page<R: Read>(reader: &mut R, buf: &mut [u8; PAGE_SIZE]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < PAGE_SIZE {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Tests `key` against the database at `path` without producing output.
///
/// This is exactly the page-0 authentication step; the key scout uses it
/// to rule candidate keys in or out.
pub fn verify_key(path: &Path, key: &[u8]) -> Result<bool, DbError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut page = [0u8; PAGE_SIZE];
    if read_page(&mut reader, &mut page)? != PAGE_SIZE {
        return Err(DbError::ShortRead);
    }

    let keys = PageKeys::derive(key, &page[..SALT_SIZE]);
    Ok(page0_authentic(&keys, &page[SALT_SIZE..]))
}

/// Decrypts the database at `src` into `dst`.
///
/// The destination is created (and truncated) only after the key has been
/// authenticated against page 0, so a wrong password leaves no file
/// behind. Page reserves are preserved verbatim.
pub fn decrypt_database(src: &Path, key: &[u8], dst: &Path) -> Result<(), DbError> {
    let mut reader = BufReader::with_capacity(PAGE_SIZE * 100, File::open(src)?);

    let mut page = [0u8; PAGE_SIZE];
    if read_page(&mut reader, &mut page)? != PAGE_SIZE {
        return Err(DbError::ShortRead);
    }

    let keys = PageKeys::derive(key, &page[..SALT_SIZE]);
    if !page0_authentic(&keys, &page[SALT_SIZE..]) {
        return Err(DbError::WrongPassword);
    }

    let mut writer = BufWriter::new(File::create(dst)?);
    writer.write_all(SQLITE_HEADER)?;

    // Page 0: body sits behind the salt, IV at the head of the reserve.
    let body = &mut page[SALT_SIZE..];
    let iv: [u8; IV_SIZE] = body[PAGE0_BODY..PAGE0_BODY + IV_SIZE].try_into().unwrap();
    crypto::aes_cbc_decrypt(&keys.enc, &iv, &mut body[..PAGE0_BODY]);
    writer.write_all(body)?;

    loop {
        let n = read_page(&mut reader, &mut page)?;
        if n == 0 {
            break;
        }
        if n < PAGE_SIZE {
            return Err(DbError::Corrupt(n));
        }

        let iv: [u8; IV_SIZE] = page[PAGE_BODY..PAGE_BODY + IV_SIZE].try_into().unwrap();
        crypto::aes_cbc_decrypt(&keys.enc, &iv, &mut page[..PAGE_BODY]);
        writer.write_all(&page)?;
    }

    writer.flush()?;
    Ok(())
}

/// Test fixtures: the encryption-side inverse of this module.
#[cfg(test)]
pub(crate) mod testutil {
    use aes::Aes256;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncryptMut, KeyIvInit};

    use super::*;

    fn aes_cbc_encrypt(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE], data: &mut [u8]) {
        let mut cipher = cbc::Encryptor::<Aes256>::new(key.into(), iv.into());
        for block in data.chunks_exact_mut(crypto::BLOCK_SIZE) {
            cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
    }

    /// Builds an encrypted database image from plaintext page bodies.
    ///
    /// `bodies[0]` must be [`PAGE0_BODY`] bytes, the rest [`PAGE_BODY`].
    /// The plaintext a correct decryption reproduces is the SQLite header
    /// followed by each body and its reserve.
    pub(crate) fn encrypt_fixture(key: &[u8], salt: &[u8; SALT_SIZE], bodies: &[Vec<u8>]) -> Vec<u8> {
        let keys = PageKeys::derive(key, salt);
        let mut out = Vec::with_capacity(bodies.len() * PAGE_SIZE);

        for (page_no, body) in bodies.iter().enumerate() {
            let mut enc = body.clone();
            let iv = [page_no as u8 ^ 0xA5; IV_SIZE];
            aes_cbc_encrypt(&keys.enc, &iv, &mut enc);

            if page_no == 0 {
                assert_eq!(body.len(), PAGE0_BODY);
                out.extend_from_slice(salt);
                out.extend_from_slice(&enc);
                out.extend_from_slice(&iv);
                let tag = crypto::hmac_sha1(&keys.mac, &[&enc, &iv, &1u32.to_le_bytes()]);
                out.extend_from_slice(&tag);
                out.extend_from_slice(&[0u8; RESERVE_SIZE - IV_SIZE - HMAC_SIZE]);
            } else {
                assert_eq!(body.len(), PAGE_BODY);
                out.extend_from_slice(&enc);
                out.extend_from_slice(&iv);
                out.extend_from_slice(&[0u8; RESERVE_SIZE - IV_SIZE]);
            }
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::testutil::encrypt_fixture;
    use super::*;

    const KEY: [u8; KEY_SIZE] = [0x5A; KEY_SIZE];

    fn salt() -> [u8; SALT_SIZE] {
        core::array::from_fn(|i| i as u8)
    }

    fn bodies(pages: usize) -> Vec<Vec<u8>> {
        (0..pages)
            .map(|p| {
                let len = if p == 0 { PAGE0_BODY } else { PAGE_BODY };
                (0..len).map(|i| (i as u8).wrapping_add(p as u8)).collect()
            })
            .collect()
    }

    #[test]
    fn decrypts_single_page_with_sqlite_header() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("Media.db");
        let dst = dir.path().join("Media.dec.db");
        fs::write(&src, encrypt_fixture(&KEY, &salt(), &bodies(1))).unwrap();

        decrypt_database(&src, &KEY, &dst).unwrap();

        let out = fs::read(&dst).unwrap();
        assert_eq!(&out[..16], SQLITE_HEADER);
        assert_eq!(&out[16..16 + PAGE0_BODY], &bodies(1)[0][..]);
        // Page size preserved: header + body + reserve.
        assert_eq!(out.len(), 16 + PAGE0_BODY + RESERVE_SIZE);
    }

    #[test]
    fn round_trips_multiple_pages() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("MSG0.db");
        let dst = dir.path().join("MSG0.dec.db");
        let bodies = bodies(4);
        fs::write(&src, encrypt_fixture(&KEY, &salt(), &bodies)).unwrap();

        decrypt_database(&src, &KEY, &dst).unwrap();

        let out = fs::read(&dst).unwrap();
        assert_eq!(out.len(), 16 + PAGE0_BODY + RESERVE_SIZE + 3 * PAGE_SIZE);

        // Every body is back in the clear at its page offset.
        assert_eq!(&out[16..16 + PAGE0_BODY], &bodies[0][..]);
        for page in 1..4 {
            let at = 16 + PAGE0_BODY + RESERVE_SIZE + (page - 1) * PAGE_SIZE;
            assert_eq!(&out[at..at + PAGE_BODY], &bodies[page][..]);
        }
    }

    #[test]
    fn wrong_password_leaves_no_output() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("Media.db");
        let dst = dir.path().join("Media.dec.db");
        fs::write(&src, encrypt_fixture(&KEY, &salt(), &bodies(1))).unwrap();

        let mut flipped = KEY;
        flipped[0] ^= 0x01;
        match decrypt_database(&src, &flipped, &dst) {
            Err(DbError::WrongPassword) => {}
            other => panic!("expected WrongPassword, got {other:?}"),
        }
        assert!(!dst.exists());
    }

    #[test]
    fn short_inputs_are_rejected() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("out.db");

        for len in [0usize, 1, PAGE_SIZE - 1] {
            let src = dir.path().join(format!("short{len}.db"));
            fs::write(&src, vec![0u8; len]).unwrap();
            match decrypt_database(&src, &KEY, &dst) {
                Err(DbError::ShortRead) => {}
                other => panic!("expected ShortRead for {len} bytes, got {other:?}"),
            }
        }
    }

    #[test]
    fn truncated_trailing_page_is_corrupt() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("MSG0.db");
        let dst = dir.path().join("MSG0.dec.db");
        let mut data = encrypt_fixture(&KEY, &salt(), &bodies(2));
        data.truncate(PAGE_SIZE + 100);
        fs::write(&src, data).unwrap();

        match decrypt_database(&src, &KEY, &dst) {
            Err(DbError::Corrupt(100)) => {}
            other => panic!("expected Corrupt(100), got {other:?}"),
        }
    }

    #[test]
    fn verify_key_matches_decrypt_verdict() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("Media.db");
        fs::write(&src, encrypt_fixture(&KEY, &salt(), &bodies(1))).unwrap();

        assert!(verify_key(&src, &KEY).unwrap());

        let mut flipped = KEY;
        flipped[31] ^= 0x80;
        assert!(!verify_key(&src, &flipped).unwrap());
    }
}
