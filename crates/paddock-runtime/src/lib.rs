//! Container supervision for the Paddock server.
//!
//! The [`Engine`](engine::Engine) ties the pieces together: a registry of
//! containers, a process supervisor, a resource limiter, and a network
//! rule manager, each over a backend trait so tests can swap in fakes.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod diagnostics;
pub mod engine;
pub mod env;
mod exec;
pub mod limiter;
pub mod metrics;
pub mod network;
pub mod process;
pub mod state;
pub mod stream;
