//! Cache counters carried in `status.cacheStatus`

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::quantity::{ByteQuantity, CachedRatio};
use crate::Error;

/// Fixed record of the four cache counters
///
/// Keeps the wire shape of a string-keyed map (`cached`, `cacheable`,
/// `needMoreForCache`, `cachedPercentage`) but rejects unknown keys.
/// `needMoreForCache` and `cachedPercentage` are derived and are always
/// recomputed before a status is persisted.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CacheStatus {
    /// Bytes currently cached across eligible nodes
    #[serde(default)]
    pub cached: ByteQuantity,

    /// Bytes eligible for caching
    #[serde(default, alias = "cachable")]
    pub cacheable: ByteQuantity,

    /// Bytes still required to cache everything cacheable
    #[serde(default)]
    pub need_more_for_cache: ByteQuantity,

    /// `cached / total`
    #[serde(default)]
    pub cached_percentage: CachedRatio,
}

impl CacheStatus {
    /// Build a normalized cache status, checking `cached <= cacheable <= total`
    pub fn derive(
        total: ByteQuantity,
        cacheable: ByteQuantity,
        cached: ByteQuantity,
    ) -> Result<Self, Error> {
        if cached > cacheable || cacheable > total {
            return Err(Error::inconsistent_cache(
                cached.bytes(),
                cacheable.bytes(),
                total.bytes(),
            ));
        }
        Ok(Self {
            cached,
            cacheable,
            need_more_for_cache: cacheable.saturating_sub(cached),
            cached_percentage: CachedRatio::of(cached, total),
        })
    }

    /// Recompute the derived fields against `total`, discarding supplied values
    pub fn recompute(&self, total: ByteQuantity) -> Result<Self, Error> {
        Self::derive(total, self.cacheable, self.cached)
    }

    /// Whether the cache has reached its currently achievable ceiling
    pub fn is_fully_cached(&self) -> bool {
        self.cached == self.cacheable
    }
}
