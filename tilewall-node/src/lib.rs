//! # tilewall-node: one process of a display wall
//!
//! Loads the deployment configuration and runs one role on top of
//! `tilewall-core`.
//!
//! ## Roles
//!
//! - **Bridge**: allocates members to producers and relays their pixel
//!   streams to the display nodes.
//! - **Display**: receives and reassembles the streams for its tiles.
//! - **Sync**: coordinates buffer swaps across display nodes.

pub mod config;
pub mod service;
