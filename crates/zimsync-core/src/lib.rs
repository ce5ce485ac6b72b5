//! # ZimSync Core Library
//!
//! `zimsync-core` provides the core functionality for ZimSync, a peer-to-peer
//! file synchronization service for LAN environments, tuned for moving large
//! audio files between machines on the same network segment.
//!
//! ## Features
//!
//! - **Datagram wire protocol**: 16-byte framed packets with payload
//!   checksums over UDP
//! - **Chunked transfers**: offset-addressed chunks with selective
//!   acknowledgement and whole-file SHA-256 verification
//! - **Content-aware compression**: already-compressed audio formats are
//!   never recompressed
//! - **Zero-configuration discovery**: peers advertise via mDNS/DNS-SD
//!
//! ## Modules
//!
//! - [`catalog`] - Shared-directory file catalog
//! - [`client`] - Pull-model client for discovering and fetching files
//! - [`compression`] - Buffer compression and the audio-aware chunk policy
//! - [`config`] - Configuration management
//! - [`device`] - Device identity
//! - [`discovery`] - mDNS/DNS-SD advertisement and browsing
//! - [`mod@file`] - File metadata, hashing, and path sanitization
//! - [`protocol`] - ZimSync wire protocol (packet model and codec)
//! - [`session`] - Per-peer protocol state machine and UDP server
//! - [`transfer`] - Chunked file transfer engine
//! - [`transport`] - Datagram transport adapter
//!
//! ## Example
//!
//! ```rust,ignore
//! use zimsync_core::client::SyncClient;
//!
//! let mut client = SyncClient::connect("192.168.1.20:8080".parse()?).await?;
//! let (device, files) = client.discover().await?;
//! for meta in &files {
//!     println!("{} ({} bytes)", meta.path, meta.size);
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]

pub mod catalog;
pub mod client;
pub mod compression;
pub mod config;
pub mod device;
pub mod discovery;
pub mod error;
pub mod file;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default server port (UDP)
pub const DEFAULT_PORT: u16 = 8080;

/// Connect readiness bound in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 3;
