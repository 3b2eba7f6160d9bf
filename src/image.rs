//! De-obfuscation of `.dat` attachment images.
//!
//! A `.dat` file is an ordinary image XORed byte-wise with one secret
//! byte. The byte is recovered by lining the file head up against known
//! image magics; the first magic whose every position agrees on the same
//! XOR byte wins.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::ImageError;

/// Known image magics, tried in this order.
const MAGICS: &[(&str, &[u8])] = &[
    ("jpeg", &[0xFF, 0xD8, 0xFF]),
    ("png", &[0x89, 0x50, 0x4E, 0x47]),
    ("gif", &[0x47, 0x49, 0x46, 0x38]),
    ("tiff", &[0x49, 0x49, 0x2A, 0x00]),
    ("bmp", &[0x42, 0x4D]),
];

/// Length of the longest magic; shorter inputs cannot be classified.
const MIN_HEAD: usize = 4;

/// Bytes sniffed from the file head for key recovery.
const SNIFF_LEN: usize = 10;

/// Copy buffer for the streaming XOR pass.
const XOR_BUF: usize = 1024;

/// Recovers the XOR byte from the first bytes of an obfuscated image.
///
/// Returns the key and the detected format name. Heads shorter than the
/// longest magic are rejected outright; a 2-byte agreement on a truncated
/// file would say nothing.
pub fn detect_xor_key(head: &[u8]) -> Result<(u8, &'static str), ImageError> {
    if head.len() < MIN_HEAD {
        return Err(ImageError::UnknownImage);
    }

    for (format, magic) in MAGICS {
        let key = magic[0] ^ head[0];
        if magic.iter().zip(head).all(|(&m, &b)| m ^ b == key) {
            return Ok((key, format));
        }
    }

    Err(ImageError::UnknownImage)
}

/// Decrypts the obfuscated image at `src` into `dst`.
///
/// The whole file, including the sniffed head, is streamed through the
/// recovered single-byte XOR.
pub fn decrypt_dat(src: &Path, dst: &Path) -> Result<(), ImageError> {
    let mut reader = BufReader::new(File::open(src)?);

    let mut head = [0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        let n = reader.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    let (key, _) = detect_xor_key(&head[..filled])?;

    let mut writer = BufWriter::new(File::create(dst)?);
    writer.write_all(&crate::crypto::xor_bytes(&head[..filled], key))?;

    let mut buf = [0u8; XOR_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        for b in &mut buf[..n] {
            *b ^= key;
        }
        writer.write_all(&buf[..n])?;
    }

    writer.flush()?;
    Ok(())
}
