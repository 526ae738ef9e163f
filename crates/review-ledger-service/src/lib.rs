//! Orchestration layer for the review ledger.
//!
//! [`ReviewService`] sequences every mutating command the same way: validate
//! the payload, consult the catalog guard where required, append or mutate the
//! review log, then apply the matching aggregate delta. Queries never touch
//! the catalog.

pub mod breaker;
pub mod catalog;

use review_ledger_core::{
    ItemId, ItemReviewCount, LedgerError, RatingSummary, Review, ReviewDraft, ReviewEdit,
    ReviewId, ReviewPage, DEFAULT_PAGE_LIMIT,
};
use review_ledger_store_sqlite::{LedgerCheck, LedgerStatus, ReconcileReport, SqliteReviewStore};

use crate::breaker::{BreakerConfig, BreakerState};
use crate::catalog::{CatalogDirectory, GuardedCatalog};

/// Hard ceiling on requested page sizes; larger requests are clamped.
pub const MAX_PAGE_LIMIT: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Domain(#[from] LedgerError),
    #[error("store error: {0}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        Self::Store(err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServiceConfig {
    /// Page size used when a list request names none.
    pub default_page_limit: usize,
    /// Largest page size honored; requests above it are clamped down.
    pub max_page_limit: usize,
    pub breaker: BreakerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_page_limit: DEFAULT_PAGE_LIMIT,
            max_page_limit: MAX_PAGE_LIMIT,
            breaker: BreakerConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when a field is outside bounds.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.default_page_limit == 0 {
            return Err(LedgerError::Validation(
                "default_page_limit MUST be >= 1".to_string(),
            ));
        }
        if self.max_page_limit < self.default_page_limit {
            return Err(LedgerError::Validation(
                "max_page_limit MUST be >= default_page_limit".to_string(),
            ));
        }
        self.breaker.validate()
    }
}

/// List-query parameters as they arrive from the outer surface; the cursor is
/// still the opaque string handed out with the previous page.
#[derive(Debug, Clone)]
pub struct ListReviewsQuery {
    pub item_id: ItemId,
    pub limit: Option<usize>,
    pub from: Option<String>,
}

pub struct ReviewService<C> {
    store: SqliteReviewStore,
    catalog: GuardedCatalog<C>,
    config: ServiceConfig,
}

impl<C: CatalogDirectory> ReviewService<C> {
    /// # Errors
    /// Returns [`LedgerError::Validation`] when the configuration is invalid.
    pub fn new(
        store: SqliteReviewStore,
        catalog: C,
        config: ServiceConfig,
    ) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self {
            store,
            catalog: GuardedCatalog::new(catalog, config.breaker),
            config,
        })
    }

    #[must_use]
    pub fn breaker_state(&self) -> BreakerState {
        self.catalog.breaker_state()
    }

    /// Validates the draft, confirms the item exists in the catalog, appends
    /// the review, and applies the create delta to the item's aggregate.
    ///
    /// # Errors
    /// [`LedgerError::ItemNotFound`] on a definitive catalog miss;
    /// [`LedgerError::UpstreamUnavailable`] when the catalog cannot answer
    /// (including while the breaker is open). An appended review whose delta
    /// failed surfaces the store error; reconciliation repairs the aggregate.
    pub fn create_review(&mut self, draft: &ReviewDraft) -> Result<Review, ServiceError> {
        let rating = draft.validate()?;

        match self.catalog.exists_by_item_id(draft.item_id) {
            Ok(true) => {}
            Ok(false) => return Err(LedgerError::ItemNotFound(draft.item_id).into()),
            Err(err) => {
                return Err(LedgerError::UpstreamUnavailable(err.to_string()).into());
            }
        }

        let review = self.store.append(draft)?;
        if let Err(err) = self.store.apply_create_delta(review.item_id, rating) {
            tracing::error!(
                review_id = review.id.0,
                item_id = review.item_id.0,
                error = %err,
                "create delta failed after append; aggregate stale until reconcile"
            );
            return Err(err.into());
        }
        Ok(review)
    }

    /// Rewrites rating/comment of an existing review and shifts the aggregate
    /// by the rating difference.
    ///
    /// # Errors
    /// [`LedgerError::NotFound`] when no review has the given id.
    pub fn edit_review(&mut self, edit: &ReviewEdit) -> Result<Review, ServiceError> {
        let rating = edit.validate()?;

        let Some((review, prior_rating)) =
            self.store.update(edit.id, rating, edit.comment.as_deref())?
        else {
            return Err(LedgerError::NotFound(edit.id).into());
        };

        if let Err(err) = self
            .store
            .apply_edit_delta(review.item_id, prior_rating, rating)
        {
            tracing::error!(
                review_id = review.id.0,
                item_id = review.item_id.0,
                error = %err,
                "edit delta failed after update; aggregate stale until reconcile"
            );
            return Err(err.into());
        }
        Ok(review)
    }

    /// Deletes a review and subtracts its contribution from the aggregate.
    ///
    /// # Errors
    /// [`LedgerError::NotFound`] when no review has the given id.
    pub fn delete_review(&mut self, id: ReviewId) -> Result<Review, ServiceError> {
        let Some(review) = self.store.remove(id)? else {
            return Err(LedgerError::NotFound(id).into());
        };

        if let Err(err) = self
            .store
            .apply_delete_delta(review.item_id, review.rating)
        {
            tracing::error!(
                review_id = review.id.0,
                item_id = review.item_id.0,
                error = %err,
                "delete delta failed after remove; aggregate stale until reconcile"
            );
            return Err(err.into());
        }
        Ok(review)
    }

    /// Returns one page of reviews for an item, newest first, with the item's
    /// current rating summary at the head. Never consults the catalog: items
    /// absent there still list whatever reviews the log holds.
    ///
    /// # Errors
    /// [`LedgerError::InvalidCursor`] when `from` is not a cursor this
    /// service handed out.
    pub fn list_reviews(&self, query: &ListReviewsQuery) -> Result<ReviewPage, ServiceError> {
        let limit = query
            .limit
            .unwrap_or(self.config.default_page_limit)
            .min(self.config.max_page_limit);
        if limit == 0 {
            return Err(LedgerError::Validation("limit MUST be >= 1".to_string()).into());
        }

        let before = query
            .from
            .as_deref()
            .map(ReviewId::parse_cursor)
            .transpose()?;

        let rows = self.store.page_by_item(query.item_id, limit, before)?;
        // Summary comes from the aggregate row, not the page: a page is a
        // window, the summary describes the whole item.
        let aggregate = self.store.get_aggregate(query.item_id)?;

        Ok(ReviewPage {
            rating: RatingSummary::from(&aggregate),
            reviews: rows.reviews,
            next_cursor: rows.next_cursor.map(ReviewId::as_cursor),
        })
    }

    /// Exact live counts for the requested items, in request order. Items
    /// with no reviews report zero rather than being omitted.
    ///
    /// # Errors
    /// Surfaces store failures only.
    pub fn count_reviews(&self, item_ids: &[ItemId]) -> Result<Vec<ItemReviewCount>, ServiceError> {
        let mut counts = Vec::with_capacity(item_ids.len());
        for &item_id in item_ids {
            counts.push(ItemReviewCount {
                item_id,
                count: self.store.count_by_item(item_id)?,
            });
        }
        Ok(counts)
    }

    /// Recomputes every aggregate from the review log, repairing drift.
    ///
    /// # Errors
    /// Surfaces store failures only.
    pub fn reconcile(&mut self) -> Result<ReconcileReport, ServiceError> {
        Ok(self.store.reconcile()?)
    }

    /// # Errors
    /// Surfaces store failures only.
    pub fn ledger_status(&self) -> Result<LedgerStatus, ServiceError> {
        Ok(self.store.ledger_status()?)
    }

    /// # Errors
    /// Surfaces store failures only.
    pub fn ledger_check(&self) -> Result<LedgerCheck, ServiceError> {
        Ok(self.store.ledger_check()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{CatalogError, PermissiveCatalog, StaticCatalog};

    fn must<T, E: std::fmt::Debug>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("unexpected error: {err:?}"),
        }
    }

    fn must_err<T: std::fmt::Debug, E>(result: Result<T, E>) -> E {
        match result {
            Ok(value) => panic!("expected error, got: {value:?}"),
            Err(err) => err,
        }
    }

    fn open_store(dir: &tempfile::TempDir) -> SqliteReviewStore {
        let store = must(SqliteReviewStore::open(&dir.path().join("ledger.sqlite3")));
        must(store.migrate());
        store
    }

    fn service_with<C: CatalogDirectory>(
        dir: &tempfile::TempDir,
        catalog: C,
    ) -> ReviewService<C> {
        must(ReviewService::new(
            open_store(dir),
            catalog,
            ServiceConfig::default(),
        ))
    }

    fn draft(item_id: i64, rating: i64) -> ReviewDraft {
        ReviewDraft {
            item_id: ItemId(item_id),
            rating,
            comment: None,
        }
    }

    struct DownCatalog;

    impl CatalogDirectory for DownCatalog {
        fn exists_by_item_id(&self, _item_id: ItemId) -> Result<bool, CatalogError> {
            Err(CatalogError::Unavailable("connection refused".to_string()))
        }
    }

    #[test]
    fn create_review_rejects_unknown_items() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, StaticCatalog::from_ids([620, 621]));

        let err = must_err(service.create_review(&draft(999, 5)));
        assert!(matches!(
            err,
            ServiceError::Domain(LedgerError::ItemNotFound(ItemId(999)))
        ));

        // The rejected draft left no trace in the log.
        let counts = must(service.count_reviews(&[ItemId(999)]));
        assert_eq!(counts[0].count, 0);
    }

    #[test]
    fn create_review_surfaces_catalog_outage_as_unavailable() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, DownCatalog);

        let err = must_err(service.create_review(&draft(620, 5)));
        assert!(matches!(
            err,
            ServiceError::Domain(LedgerError::UpstreamUnavailable(_))
        ));
    }

    #[test]
    fn repeated_catalog_failures_trip_the_breaker() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, DownCatalog);

        for _ in 0..3 {
            let _ = must_err(service.create_review(&draft(620, 5)));
        }
        assert_eq!(service.breaker_state(), BreakerState::Open);

        // Open breaker short-circuits before the backend is consulted.
        let err = must_err(service.create_review(&draft(620, 5)));
        let ServiceError::Domain(LedgerError::UpstreamUnavailable(message)) = err else {
            panic!("expected UpstreamUnavailable, got other error");
        };
        assert!(message.contains("circuit open"), "message: {message}");
    }

    #[test]
    fn create_edit_delete_keep_summary_consistent() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, StaticCatalog::from_ids([620]));

        let first = must(service.create_review(&draft(620, 5)));
        let second = must(service.create_review(&draft(620, 3)));

        let page = must(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(620),
            limit: None,
            from: None,
        }));
        assert_eq!(page.rating.review_count, 2);
        assert!((page.rating.average_rating - 4.0).abs() < 1e-9);
        // Newest first.
        assert_eq!(page.reviews[0].id, second.id);
        assert_eq!(page.reviews[1].id, first.id);
        assert_eq!(page.next_cursor, None);

        must(service.edit_review(&ReviewEdit {
            id: second.id,
            rating: 1,
            comment: Some("changed my mind".to_string()),
        }));
        let page = must(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(620),
            limit: None,
            from: None,
        }));
        assert_eq!(page.rating.review_count, 2);
        assert!((page.rating.average_rating - 3.0).abs() < 1e-9);

        must(service.delete_review(second.id));
        let page = must(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(620),
            limit: None,
            from: None,
        }));
        assert_eq!(page.rating.review_count, 1);
        assert!((page.rating.average_rating - 5.0).abs() < 1e-9);
    }

    #[test]
    fn delta_failure_after_append_is_surfaced_and_reconcile_repairs_it() {
        let dir = must(tempfile::tempdir());
        let db_path = dir.path().join("ledger.sqlite3");
        let store = must(SqliteReviewStore::open(&db_path));
        must(store.migrate());
        let mut service = must(ReviewService::new(
            store,
            PermissiveCatalog,
            ServiceConfig::default(),
        ));

        // Sever the aggregate table out from under the service so the delta
        // step fails while the log write still succeeds.
        let raw = match rusqlite::Connection::open(&db_path) {
            Ok(conn) => conn,
            Err(err) => panic!("failed to open raw connection: {err}"),
        };
        must(raw.execute("DROP TABLE item_ratings", []));

        let err = must_err(service.create_review(&draft(620, 5)));
        assert!(matches!(err, ServiceError::Store(_)));

        // The appended review stayed durable despite the failed delta.
        let counts = must(service.count_reviews(&[ItemId(620)]));
        assert_eq!(counts[0].count, 1);

        // A fresh handle restores the schema; reconcile repairs the drift.
        drop(service);
        drop(raw);
        let store = must(SqliteReviewStore::open(&db_path));
        must(store.migrate());
        let mut service = must(ReviewService::new(
            store,
            PermissiveCatalog,
            ServiceConfig::default(),
        ));
        let report = must(service.reconcile());
        assert_eq!(report.drifted_items, 1);
        let check = must(service.ledger_check());
        assert!(check.healthy, "issues: {:?}", check.issues);
    }

    #[test]
    fn edit_and_delete_report_missing_reviews() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, PermissiveCatalog);

        let err = must_err(service.edit_review(&ReviewEdit {
            id: ReviewId(42),
            rating: 4,
            comment: None,
        }));
        assert!(matches!(
            err,
            ServiceError::Domain(LedgerError::NotFound(ReviewId(42)))
        ));

        let err = must_err(service.delete_review(ReviewId(42)));
        assert!(matches!(
            err,
            ServiceError::Domain(LedgerError::NotFound(ReviewId(42)))
        ));
    }

    #[test]
    fn list_reviews_pages_through_with_handed_out_cursors() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, PermissiveCatalog);

        for rating in [5, 4, 3, 2, 1] {
            must(service.create_review(&draft(620, rating)));
        }

        let mut seen = Vec::new();
        let mut from = None;
        loop {
            let page = must(service.list_reviews(&ListReviewsQuery {
                item_id: ItemId(620),
                limit: Some(2),
                from,
            }));
            assert!(page.reviews.len() <= 2);
            seen.extend(page.reviews.iter().map(|review| review.id));
            match page.next_cursor {
                Some(cursor) => from = Some(cursor),
                None => break,
            }
        }

        assert_eq!(seen.len(), 5, "every review seen exactly once");
        assert!(seen.windows(2).all(|pair| pair[0] > pair[1]));
    }

    #[test]
    fn list_reviews_rejects_foreign_cursors() {
        let dir = must(tempfile::tempdir());
        let service = service_with(&dir, PermissiveCatalog);

        let err = must_err(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(620),
            limit: None,
            from: Some("not-a-cursor".to_string()),
        }));
        assert!(matches!(
            err,
            ServiceError::Domain(LedgerError::InvalidCursor(_))
        ));
    }

    #[test]
    fn list_reviews_clamps_oversized_limits() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, PermissiveCatalog);

        must(service.create_review(&draft(620, 5)));
        let page = must(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(620),
            limit: Some(10_000),
            from: None,
        }));
        assert_eq!(page.reviews.len(), 1);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn listing_an_unreviewed_item_yields_the_empty_page() {
        let dir = must(tempfile::tempdir());
        let service = service_with(&dir, PermissiveCatalog);

        let page = must(service.list_reviews(&ListReviewsQuery {
            item_id: ItemId(644),
            limit: None,
            from: None,
        }));
        assert!(page.reviews.is_empty());
        assert_eq!(page.rating.review_count, 0);
        assert!((page.rating.average_rating - 0.0).abs() < f64::EPSILON);
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn count_reviews_preserves_request_order_and_zero_fills() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, PermissiveCatalog);

        must(service.create_review(&draft(620, 5)));
        must(service.create_review(&draft(620, 4)));
        must(service.create_review(&draft(646, 2)));

        let counts = must(service.count_reviews(&[
            ItemId(646),
            ItemId(999),
            ItemId(620),
        ]));
        assert_eq!(
            counts,
            vec![
                ItemReviewCount {
                    item_id: ItemId(646),
                    count: 1
                },
                ItemReviewCount {
                    item_id: ItemId(999),
                    count: 0
                },
                ItemReviewCount {
                    item_id: ItemId(620),
                    count: 2
                },
            ]
        );
    }

    #[test]
    fn ledger_check_stays_healthy_through_command_sequences() {
        let dir = must(tempfile::tempdir());
        let mut service = service_with(&dir, PermissiveCatalog);

        let kept = must(service.create_review(&draft(620, 5)));
        let dropped = must(service.create_review(&draft(620, 2)));
        must(service.edit_review(&ReviewEdit {
            id: kept.id,
            rating: 4,
            comment: None,
        }));
        must(service.delete_review(dropped.id));

        let check = must(service.ledger_check());
        assert!(check.healthy, "issues: {:?}", check.issues);

        let report = must(service.reconcile());
        assert_eq!(report.drifted_items, 0);
    }

    #[test]
    fn config_validation_rejects_inverted_limits() {
        let config = ServiceConfig {
            default_page_limit: 50,
            max_page_limit: 10,
            breaker: BreakerConfig::default(),
        };
        assert!(matches!(
            config.validate(),
            Err(LedgerError::Validation(_))
        ));
    }
}
