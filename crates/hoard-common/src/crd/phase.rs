//! Dataset lifecycle phase and its transition rules

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::cache_status::CacheStatus;
use crate::Error;

/// Coarse lifecycle indicator for a Dataset
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum CachePhase {
    /// Reserved; never entered
    #[serde(alias = "planning")]
    Planning,
    /// Cache is filling (or refilling after invalidation)
    #[serde(alias = "loading")]
    Loading,
    /// Everything currently cacheable is cached
    #[serde(alias = "ready")]
    Ready,
    /// Deletion in progress; waiting for cache workers to release copies
    #[serde(alias = "terminating")]
    Terminating,
}

impl fmt::Display for CachePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Planning => write!(f, "Planning"),
            Self::Loading => write!(f, "Loading"),
            Self::Ready => write!(f, "Ready"),
            Self::Terminating => write!(f, "Terminating"),
        }
    }
}

fn phase_label(phase: Option<CachePhase>) -> String {
    phase.map_or_else(|| "none".to_string(), |p| p.to_string())
}

impl CachePhase {
    /// Decide whether `from -> to` is legal given the counters being written.
    ///
    /// `cache` is the proposed (already normalized) cache status, so the
    /// `Ready` guard sees the counters that will be persisted with it.
    ///
    /// `Ready -> Ready` is a no-op and does not recheck the counters. A caller
    /// whose cached bytes fell below cacheable must propose `Loading` instead.
    pub fn transition(
        from: Option<CachePhase>,
        to: CachePhase,
        cache: &CacheStatus,
    ) -> Result<CachePhase, Error> {
        match (from, to) {
            (Some(CachePhase::Terminating), CachePhase::Terminating) => Ok(to),
            (Some(CachePhase::Terminating), _) => Err(Error::invalid_transition(
                phase_label(from),
                to.to_string(),
                "dataset is being deleted",
            )),
            (_, CachePhase::Planning) => Err(Error::invalid_transition(
                phase_label(from),
                to.to_string(),
                "Planning is reserved",
            )),
            (_, CachePhase::Terminating) => Err(Error::invalid_transition(
                phase_label(from),
                to.to_string(),
                "Terminating is entered only by deletion",
            )),
            (_, CachePhase::Loading) => Ok(to),
            (Some(CachePhase::Ready), CachePhase::Ready) => Ok(to),
            (_, CachePhase::Ready) if cache.is_fully_cached() => Ok(to),
            (_, CachePhase::Ready) => Err(Error::invalid_transition(
                phase_label(from),
                to.to_string(),
                format!(
                    "cached {} != cacheable {}",
                    cache.cached, cache.cacheable
                ),
            )),
        }
    }

    /// Whether this phase can still move to another phase
    pub fn is_terminal(self) -> bool {
        matches!(self, CachePhase::Terminating)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quantity::ByteQuantity;

    fn cache(cacheable: u64, cached: u64) -> CacheStatus {
        CacheStatus::derive(
            ByteQuantity::from_bytes(100),
            ByteQuantity::from_bytes(cacheable),
            ByteQuantity::from_bytes(cached),
        )
        .unwrap()
    }

    #[test]
    fn loading_to_ready_requires_full_cache() {
        let done = cache(40, 40);
        let partial = cache(40, 15);

        assert_eq!(
            CachePhase::transition(Some(CachePhase::Loading), CachePhase::Ready, &done).unwrap(),
            CachePhase::Ready
        );
        let err = CachePhase::transition(Some(CachePhase::Loading), CachePhase::Ready, &partial)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidPhaseTransition { .. }));
        assert!(err.to_string().contains("Loading -> Ready"));
    }

    #[test]
    fn fresh_status_follows_same_guards() {
        assert_eq!(
            CachePhase::transition(None, CachePhase::Loading, &cache(40, 0)).unwrap(),
            CachePhase::Loading
        );
        assert!(CachePhase::transition(None, CachePhase::Ready, &cache(40, 0)).is_err());
        assert!(CachePhase::transition(None, CachePhase::Ready, &cache(0, 0)).is_ok());
    }

    #[test]
    fn regression_and_no_ops_are_allowed() {
        let partial = cache(40, 15);
        for (from, to) in [
            (CachePhase::Ready, CachePhase::Loading),
            (CachePhase::Loading, CachePhase::Loading),
            (CachePhase::Ready, CachePhase::Ready),
        ] {
            assert_eq!(
                CachePhase::transition(Some(from), to, &partial).unwrap(),
                to,
                "{} -> {}",
                from,
                to
            );
        }
    }

    #[test]
    fn shrunken_ready_cache_is_moved_back_by_proposing_loading() {
        let shrunk = cache(60, 40);
        let from = Some(CachePhase::Ready);
        // Staying Ready is not checked against the counters
        assert!(CachePhase::transition(from, CachePhase::Ready, &shrunk).is_ok());
        assert_eq!(
            CachePhase::transition(from, CachePhase::Loading, &shrunk).unwrap(),
            CachePhase::Loading
        );
        // Once back in Loading, Ready needs the full cache again
        let back = Some(CachePhase::Loading);
        assert!(CachePhase::transition(back, CachePhase::Ready, &shrunk).is_err());
        assert!(CachePhase::transition(back, CachePhase::Ready, &cache(60, 60)).is_ok());
    }

    #[test]
    fn reserved_and_deletion_phases_cannot_be_requested() {
        let c = cache(10, 10);
        for from in [None, Some(CachePhase::Loading), Some(CachePhase::Ready)] {
            assert!(CachePhase::transition(from, CachePhase::Planning, &c).is_err());
            assert!(CachePhase::transition(from, CachePhase::Terminating, &c).is_err());
        }
    }

    #[test]
    fn nothing_leaves_terminating() {
        let c = cache(10, 10);
        let from = Some(CachePhase::Terminating);
        assert!(CachePhase::transition(from, CachePhase::Terminating, &c).is_ok());
        assert!(CachePhase::transition(from, CachePhase::Loading, &c).is_err());
        assert!(CachePhase::transition(from, CachePhase::Ready, &c).is_err());
        assert!(CachePhase::Terminating.is_terminal());
    }

    #[test]
    fn phase_wire_names() {
        assert_eq!(serde_json::to_string(&CachePhase::Ready).unwrap(), "\"Ready\"");
        let p: CachePhase = serde_json::from_str("\"loading\"").unwrap();
        assert_eq!(p, CachePhase::Loading);
        assert!(serde_json::from_str::<CachePhase>("\"Failed\"").is_err());
    }
}
