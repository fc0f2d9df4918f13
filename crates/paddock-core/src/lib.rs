//! # paddock-core
//!
//! Low-level Linux isolation and accounting primitives for the Paddock
//! server.
//!
//! This crate provides safe abstractions over:
//! - **Cgroups v2**: per-container memory ceilings and accounting.
//! - **Project quotas**: per-subtree disk ceilings and usage.
//! - **Namespaces**: a holder process owning a container's mount, UTS, IPC
//!   and network namespaces, and the `setns(2)` path new processes use to
//!   join them.
//! - **Filesystem**: `OverlayFS` layers, container mount plans, `/etc` files.
//! - **Capabilities**: bounding-set reduction for unprivileged containers.
//! - **Users**: `/etc/passwd` lookup inside a root filesystem.
//!
//! All unsafe system calls are encapsulated in safe wrappers with
//! proper error handling and `// SAFETY:` documentation. Functions meant to
//! run between `fork(2)` and `execve(2)` are marked as such and stay
//! async-signal-safe: no allocation, no locks.

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod capability;
pub mod cgroup;
pub mod filesystem;
pub mod namespace;
pub mod quota;
pub mod user;
