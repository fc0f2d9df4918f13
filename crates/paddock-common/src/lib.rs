//! # paddock-common
//!
//! Shared types, error definitions, configuration models, and constants
//! used across the Paddock workspace.
//!
//! This crate is the leaf of the dependency graph. It depends on no other
//! internal crate and carries the vocabulary every other crate speaks:
//! container handles, limits, network rules, metrics and the
//! [`PaddockError`](error::PaddockError) taxonomy.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod config;
pub mod constants;
pub mod error;
pub mod metrics;
pub mod network;
pub mod types;
