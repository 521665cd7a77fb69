pub mod api;
pub mod errors;
pub mod fingerprint;
pub mod flight;
pub mod hash;
pub mod key;
pub mod metrics;
pub mod model;
pub mod policy;
pub mod resolver;
pub mod store;

pub use api::{InterpretationCache, InterpretationCacheBuilder};
pub use errors::{CacheError, StoreError};
pub use fingerprint::{digest_elements, InteractiveElement};
pub use key::CacheKey;
pub use model::{CacheEntry, CacheStatus, HitRecord, StoreStats, SweepStats};
pub use policy::CachePolicy;
pub use resolver::AiResolver;
pub use store::{memory::MemoryCacheStore, sqlite::SqliteCacheStore, CacheStore};
