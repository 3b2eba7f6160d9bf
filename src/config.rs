//! Storage-format and pipeline constants.
//!
//! Everything in this module is a protocol constant of the encrypted
//! on-disk format or a load-bearing tuning value of the export pipeline.
//! The cryptographic parameters must match the source application exactly;
//! changing any of them makes every existing database unreadable.

/// The application name used in user-facing output.
pub const APP_NAME: &str = "wxbackup";

/// Raw length of the database master key in bytes.
pub const KEY_SIZE: usize = 32;

/// PBKDF2 iteration count for deriving the page-encryption key.
///
/// This is the iteration count baked into the storage format, not a
/// tunable. 64 000 rounds of HMAC-SHA1 over the per-database salt.
pub const DEFAULT_ITER: u32 = 64_000;

/// PBKDF2 iteration count for deriving the MAC key from the page key.
pub const MAC_ITER: u32 = 2;

/// Fixed size of one encrypted database page.
pub const PAGE_SIZE: usize = 4096;

/// Byte XORed into every salt byte to obtain the MAC salt.
pub const MAC_SALT_XOR: u8 = 0x3A;

/// Length of the per-database salt at the head of page 0.
pub const SALT_SIZE: usize = 16;

/// Length of the AES-CBC initialization vector in each page trailer.
pub const IV_SIZE: usize = 16;

/// Length of the HMAC-SHA1 tag in the page-0 verification region.
pub const HMAC_SIZE: usize = 20;

/// Trailing bytes of every page reserved for IV, MAC tag, and padding.
///
/// The trailer is carried through decryption untouched; readers of the
/// produced file tolerate it because the reconstructed header accounts
/// for the reserve.
pub const RESERVE_SIZE: usize = 48;

/// The 16-byte file header the encrypted format elides.
///
/// Written verbatim at offset 0 of every decrypted database to
/// reconstruct a standard SQLite file.
pub const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\x00";

/// Sample rate, in Hz, used for both SILK decode and MP3 encode.
pub const VOICE_SAMPLE_RATE: u32 = 24_000;

/// LAME quality setting for voice transcoding (0 best, 9 worst).
pub const VOICE_MP3_QUALITY: u32 = 5;

/// Copy/stream buffer for the range file server: 100 KiB.
pub const SERVE_BUFFER_SIZE: usize = 100 * 1024;

/// Registry file name at the export root.
pub const REGISTRY_FILE: &str = "config.json";

/// Directory under the export root that holds one subtree per account.
pub const USER_DIR: &str = "User";

/// File name of the self-copied executable in a portable export.
pub const SHARED_EXE_NAME: &str = "wxbackup.exe";

/// Log file name, written beside the registry.
pub const LOG_FILE: &str = "app.log";
