pub use crate::builder::{CacheBuilder, Options};
pub use crate::cache::{CacheCore, PolicyInfo};
pub use crate::error::{ConfigError, LoadError};
pub use crate::loading::LoadFuture;
pub use crate::stats::CacheStats;
pub use crate::time::{MockTicker, SystemTicker, Ticker};
pub use crate::traits::{
    DirectExecutor, Executor, Expiry, Loader, RemovalCause, RemovalListener, ThreadSpawnExecutor,
    UnitWeigher, Weigher,
};
