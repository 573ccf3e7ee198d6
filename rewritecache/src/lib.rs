//! # Rewrite cache primitives
//!
//! Building blocks for caching the result of expensive lookups:
//!
//! - [`Tier`]: a lock-guarded map bounded by size (least recently used
//!   entries are evicted first) and by age (a per-tier TTL).
//! - [`Coalesce`]: shares one in-flight request between concurrent callers
//!   asking for the same key.
//! - [`SharedDuration`]: a TTL that can be changed while the tier is in use.

mod coalesce;
mod tier;
mod ttl;

pub use coalesce::{BoxFut, Coalesce, Handle};
pub use tier::{Lookup, Tier, TierCounters, TierStats};
pub use ttl::SharedDuration;
