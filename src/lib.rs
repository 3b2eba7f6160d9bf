//! wxbackup - forensic backup engine for WeChat desktop data.
//!
//! The pipeline, end to end:
//! - recover the in-memory database master key from a live process
//! - decrypt the page-encrypted databases (PBKDF2-HMAC-SHA1 + AES-CBC)
//! - de-obfuscate attachment images and transcode voice notes
//! - mirror everything into a self-contained export tree
//! - serve that tree over HTTP with single-range semantics for media
//!   playback

pub mod config;
pub mod crypto;
pub mod database;
pub mod error;
pub mod export;
pub mod image;
pub mod media;
pub mod registry;
pub mod scout;
pub mod server;
