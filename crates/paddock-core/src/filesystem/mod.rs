//! Filesystem management for container isolation.
//!
//! Provides `OverlayFS` layer management, the mount plan applied inside a
//! container's mount namespace, the `/etc` files a container needs for
//! name resolution, and symlink-aware path lookup inside a root.

pub mod etc;
pub mod mount;
pub mod overlayfs;
pub mod resolve;
