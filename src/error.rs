//! Error kinds shared across the decryption and export pipeline.
//!
//! Components return these to their callers and never log on the caller's
//! behalf; the CLI boundary wraps them with `anyhow` context.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures of the database page decryptor.
#[derive(Debug, Error)]
pub enum DbError {
    /// The source ended before a full first page could be read.
    #[error("database shorter than one page")]
    ShortRead,

    /// The page-0 HMAC did not match under the supplied key.
    #[error("incorrect password for database")]
    WrongPassword,

    /// A non-final page was truncated mid-stream.
    #[error("truncated page of {0} bytes")]
    Corrupt(usize),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the image de-obfuscator.
#[derive(Debug, Error)]
pub enum ImageError {
    /// No known image magic agrees on a single XOR byte.
    #[error("unrecognized image header")]
    UnknownImage,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the voice transcoder.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The SILK decoder produced no samples; no output file is created.
    #[error("silk decode produced no samples")]
    TranscodeEmpty,

    /// Error reported by an injected codec implementation.
    #[error("codec: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the process scout and key recovery.
#[derive(Debug, Error)]
pub enum ScoutError {
    /// Every candidate pointer was exhausted without a validating key.
    #[error("database key not found in process memory")]
    KeyNotFound,

    /// The platform refused access to the target process.
    #[error("access to process {0} denied")]
    PermissionDenied(u32),

    /// A platform call failed; candidates hitting this are skipped.
    #[error("process read failed: {0}")]
    Platform(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Pre-flight and session-fatal failures of the export orchestrator.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The source tree is missing or not a directory.
    #[error("source {0} is not a directory")]
    BadSource(PathBuf),

    /// The destination refused a canary write.
    #[error("destination {0} is not writable")]
    DestinationNotWritable(PathBuf),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failures of the account registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The persisted registry file exists but cannot be parsed.
    #[error("invalid registry file: {0}")]
    InvalidConfig(String),

    /// Portable-export target already exists.
    #[error("path exists: {0}")]
    PathExists(PathBuf),

    /// The requested account is not known to the registry.
    #[error("unknown account {0}")]
    UnknownAccount(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}
