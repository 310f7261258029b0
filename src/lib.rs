//! CinderDB: the region server of a distributed, range-partitioned,
//! log-structured table store.
//!
//! A cluster shards one logical table space into contiguous key ranges
//! called *regions*; each region server owns a disjoint set of them. This
//! crate implements the server side: the per-region MVCC store (memcache
//! plus immutable store files), the shared write-ahead log, the periodic
//! flush/compact/split chores, the master heartbeat protocol, leased
//! scanners, and the catalog-rewriting region merge procedure.
//!
//! ```text
//!  client RPC ──► RegionRegistry ──► Region ──► Store ──► Memcache
//!                                      │          │           │ flush
//!                                      │          │           ▼
//!                                      │          └──► [store files]
//!                                      ▼
//!                               Hlog (shared WAL)
//! ```
//!
//! The RPC transport, the distributed filesystem, and the master's
//! placement logic are external collaborators: the server exposes its
//! surface as methods and consumes the master through [`master::MasterClient`].

// `error` comes first so its exported macros are in textual scope for the
// rest of the crate.
pub mod error;

pub mod catalog;
pub mod chore;
pub mod chores;
pub mod config;
pub mod flock;
pub mod key;
pub mod leases;
pub mod master;
pub mod merge;
pub mod region;
pub mod registry;
pub mod server;
pub mod tmpfs;
pub mod wal;

pub use config::Config;
pub use error::{Error, Result};
pub use server::RegionServer;

/// Current version of CinderDB.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
