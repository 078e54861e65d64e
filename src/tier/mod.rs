//! Tier collaborators: the engine talks to these at interface boundaries.
//!
//! - [`fast`]: `FastCache` — capacity-bounded in-process cache with
//!   eviction notification, plus the LRU reference implementation
//! - [`store`]: `DurableStore` — order-preserving batch get/put, plus an
//!   in-memory implementation
//! - [`fs`]: `FsStore` — file-backed durable store over sharded directories

pub mod fast;
pub mod fs;
pub mod store;
