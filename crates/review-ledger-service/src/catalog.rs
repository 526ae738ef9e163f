//! Catalog existence collaborator.
//!
//! The catalog service owns the items being reviewed; this client only asks
//! whether an item currently exists. A transient lookup failure is a distinct
//! condition from a definitive "item does not exist" so callers can decide
//! whether a retry is safe.

use std::collections::BTreeSet;

use review_ledger_core::{now_utc, ItemId};

use crate::breaker::{BreakerConfig, BreakerState, CircuitBreaker};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CatalogError {
    #[error("catalog backend unavailable: {0}")]
    Unavailable(String),
    #[error("malformed catalog response: {0}")]
    MalformedResponse(String),
    #[error("catalog circuit open, probe skipped")]
    CircuitOpen,
}

/// Capability handle for the upstream catalog existence check.
pub trait CatalogDirectory {
    /// # Errors
    /// Returns [`CatalogError::Unavailable`] or
    /// [`CatalogError::MalformedResponse`] when the lookup cannot complete;
    /// `Ok(false)` is a definitive miss.
    fn exists_by_item_id(&self, item_id: ItemId) -> Result<bool, CatalogError>;
}

/// Catalog that reports every item as existing. Useful where the upstream
/// check is handled elsewhere or deliberately skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct PermissiveCatalog;

impl CatalogDirectory for PermissiveCatalog {
    fn exists_by_item_id(&self, _item_id: ItemId) -> Result<bool, CatalogError> {
        Ok(true)
    }
}

/// Catalog backed by a fixed id set.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    known: BTreeSet<i64>,
}

impl StaticCatalog {
    #[must_use]
    pub fn from_ids(ids: impl IntoIterator<Item = i64>) -> Self {
        Self {
            known: ids.into_iter().collect(),
        }
    }
}

impl CatalogDirectory for StaticCatalog {
    fn exists_by_item_id(&self, item_id: ItemId) -> Result<bool, CatalogError> {
        Ok(self.known.contains(&item_id.0))
    }
}

/// Wraps a catalog client with the circuit breaker so repeated upstream
/// failures stop hammering a downed backend.
#[derive(Debug)]
pub struct GuardedCatalog<C> {
    inner: C,
    breaker: CircuitBreaker,
}

impl<C: CatalogDirectory> GuardedCatalog<C> {
    pub fn new(inner: C, config: BreakerConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new(config),
        }
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    /// Breaker-guarded existence probe.
    ///
    /// # Errors
    /// Returns [`CatalogError::CircuitOpen`] without touching the upstream
    /// while the breaker is open; otherwise forwards the inner result and
    /// records it in the breaker.
    pub fn exists_by_item_id(&mut self, item_id: ItemId) -> Result<bool, CatalogError> {
        let now = now_utc();
        if !self.breaker.allow_request(now) {
            return Err(CatalogError::CircuitOpen);
        }

        match self.inner.exists_by_item_id(item_id) {
            Ok(found) => {
                self.breaker.record_success();
                Ok(found)
            }
            Err(err) => {
                self.breaker.record_failure(now);
                tracing::warn!(item_id = item_id.0, error = %err, "catalog probe failed");
                Err(err)
            }
        }
    }
}
