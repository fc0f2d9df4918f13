//! # paddock-image
//!
//! Root filesystem provisioning for the Paddock server.
//!
//! Handles:
//! - **Sources**: the default rootfs, `file://` directories and `tar://` archives.
//! - **Storage**: a content-addressed cache of extracted archives.
//! - **Hashing**: SHA-256 keys for that cache.
//! - **Layers**: archive extraction.
//! - **Providers**: per-container roots, either an overlay on top of the
//!   image or a scratch directory for host isolation.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod hash;
pub mod layer;
pub mod provider;
pub mod source;
pub mod storage;
