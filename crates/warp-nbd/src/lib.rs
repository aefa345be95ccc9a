//! NBD Block Device Gateway for WARP Storage
//!
//! This crate provides a Network Block Device (NBD) server that exposes
//! volumes of a warp object store as network block devices.
//!
//! # Features
//!
//! - Fixed-newstyle NBD negotiation and transmission for Linux clients
//! - Pipelined requests with replies sent as operations complete
//! - Ordering of overlapping operations per export, at object granularity
//! - Block-to-object mapping with sparse reads and read-modify-write
//! - Atomic multi-object writes through store transactions
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐
//! │ NBD Client  │
//! │ (nbd-client)│
//! └──────┬──────┘
//!        │ NBD Protocol
//! ┌──────▼──────┐
//! │  NbdServer  │  one NbdConnection task per client
//! └──────┬──────┘
//!        │ BlockBackend
//! ┌──────▼──────────┐
//! │ OrderedBackend  │  overlapping ranges run in issue order
//! └──────┬──────────┘
//! ┌──────▼──────────┐
//! │ ObjectBackend   │  byte ranges → fixed-size objects
//! └──────┬──────────┘
//!        │ ObjectStore
//! ┌──────▼──────┐
//! │warp-objstore│
//! └─────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use warp_nbd::{NbdConfig, NbdServer, ObjectBackend, OrderedBackend};
//! use warp_objstore::{MemoryStore, VolumePolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(MemoryStore::new());
//! store.create_volume("default", "vol1", VolumePolicy::new(1 << 30, 4 << 20))?;
//!
//! let backend = OrderedBackend::new(ObjectBackend::new(store, "default", "nbd"));
//! let server = NbdServer::new(Arc::new(backend), NbdConfig::default());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod config;
pub mod error;
pub mod nbd;
pub mod server;

pub use backend::{BlockBackend, Completion, Geometry, ObjectBackend, OrderedBackend};
pub use config::{NbdConfig, VolumeConfig};
pub use error::{BlockError, BlockResult, NbdError};
pub use nbd::{ConnectionState, NbdConnection};
pub use server::NbdServer;
