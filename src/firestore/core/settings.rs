//! Client configuration.
//!
//! Every tunable of the engine lives here with a fixed default; none of the values change
//! correctness, only latency and space.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::{GarbageCollectorSettings, LruParams, DEFAULT_CACHE_SIZE_BYTES};
use crate::firestore::remote::{RemoteStoreConfig, DEFAULT_IDLE_TIMEOUT, DEFAULT_ONLINE_STATE_TIMEOUT};
use crate::util::{duration_millis, BackoffSettings};

pub const DEFAULT_LIMBO_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;
pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_REGULAR_DELAY: Duration = Duration::from_secs(5 * 60);

/// Where cached documents live.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheSettings {
    /// Lost when the client terminates.
    Memory {
        #[serde(default)]
        garbage_collector: GarbageCollectorSettings,
    },
    /// Durable JSON file, collected with the LRU policy once it exceeds `size_bytes`.
    Persistent {
        path: PathBuf,
        #[serde(default = "default_cache_size")]
        size_bytes: i64,
    },
}

fn default_cache_size() -> i64 {
    DEFAULT_CACHE_SIZE_BYTES
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings::Memory {
            garbage_collector: GarbageCollectorSettings::Eager,
        }
    }
}

impl CacheSettings {
    pub fn garbage_collector(&self) -> GarbageCollectorSettings {
        match self {
            CacheSettings::Memory { garbage_collector } => *garbage_collector,
            CacheSettings::Persistent { size_bytes, .. } => {
                GarbageCollectorSettings::Lru(LruParams::with_cache_size(*size_bytes))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FirestoreSettings {
    pub cache: CacheSettings,
    pub backoff: BackoffSettings,
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
    #[serde(with = "duration_millis")]
    pub online_state_timeout: Duration,
    /// A limbo document not confirmed within this long is treated as deleted.
    #[serde(with = "duration_millis")]
    pub limbo_resolution_timeout: Duration,
    pub max_concurrent_limbo_resolutions: usize,
    #[serde(with = "duration_millis")]
    pub gc_initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub gc_regular_delay: Duration,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            backoff: BackoffSettings::default(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            online_state_timeout: DEFAULT_ONLINE_STATE_TIMEOUT,
            limbo_resolution_timeout: DEFAULT_LIMBO_RESOLUTION_TIMEOUT,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_regular_delay: DEFAULT_GC_REGULAR_DELAY,
        }
    }
}

impl FirestoreSettings {
    pub fn with_cache(mut self, cache: CacheSettings) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffSettings) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn with_online_state_timeout(mut self, timeout: Duration) -> Self {
        self.online_state_timeout = timeout;
        self
    }

    pub fn with_limbo_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.limbo_resolution_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_gc_delays(mut self, initial: Duration, regular: Duration) -> Self {
        self.gc_initial_delay = initial;
        self.gc_regular_delay = regular;
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if !self.backoff.factor.is_finite() || self.backoff.factor < 1.0 {
            return Err(invalid_argument(format!(
                "backoff factor must be a finite number of at least 1.0, got {}",
                self.backoff.factor
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff.jitter) {
            return Err(invalid_argument(format!(
                "backoff jitter must be in [0, 1], got {}",
                self.backoff.jitter
            )));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(invalid_argument("backoff initial_delay exceeds max_delay"));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max_concurrent_limbo_resolutions must be greater than zero",
            ));
        }
        if let GarbageCollectorSettings::Lru(params) = self.cache.garbage_collector() {
            params.validate()?;
        }
        Ok(())
    }

    pub(crate) fn remote_store_config(&self) -> RemoteStoreConfig {
        RemoteStoreConfig {
            backoff: self.backoff,
            idle_timeout: self.idle_timeout,
            online_state_timeout: self.online_state_timeout,
        }
    }
}
