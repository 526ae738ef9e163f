#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

//! SQLite system of record for the review ledger.
//!
//! Two collections: `reviews` (the append-mostly review log, rowid-keyed so
//! identifiers are strictly increasing in creation order) and `item_ratings`
//! (one denormalized aggregate row per item). Aggregate deltas are expressed
//! as in-database arithmetic inside single `UPDATE` statements so concurrent
//! writers cannot lose counter updates; the derived average is recomputed
//! from the just-updated counters in a separate second statement.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use review_ledger_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, ItemId, Rating, RatingAggregate,
    RatingDistribution, Review, ReviewDraft, ReviewId,
};
use rusqlite::{params, Connection, OptionalExtension};

const LEDGER_MIGRATION_VERSION: i64 = 1;

const SCHEMA_LEDGER_V1: &str = r"
CREATE TABLE IF NOT EXISTS reviews (
  review_id INTEGER PRIMARY KEY AUTOINCREMENT,
  item_id INTEGER NOT NULL,
  rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
  comment TEXT CHECK (comment IS NULL OR length(comment) <= 1000),
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_reviews_item_page
  ON reviews(item_id, review_id DESC);

CREATE TABLE IF NOT EXISTS item_ratings (
  item_id INTEGER PRIMARY KEY,
  review_count INTEGER NOT NULL DEFAULT 0 CHECK (review_count >= 0),
  rating_sum INTEGER NOT NULL DEFAULT 0 CHECK (rating_sum >= 0),
  average_rating REAL NOT NULL DEFAULT 0.0,
  stars_5 INTEGER NOT NULL DEFAULT 0 CHECK (stars_5 >= 0),
  stars_4 INTEGER NOT NULL DEFAULT 0 CHECK (stars_4 >= 0),
  stars_3 INTEGER NOT NULL DEFAULT 0 CHECK (stars_3 >= 0),
  stars_2 INTEGER NOT NULL DEFAULT 0 CHECK (stars_2 >= 0),
  stars_1 INTEGER NOT NULL DEFAULT 0 CHECK (stars_1 >= 0),
  updated_at TEXT NOT NULL
);
";

const REVIEW_COLUMNS: &str =
    "review_id, item_id, rating, comment, created_at, updated_at";

const AGGREGATE_COLUMNS: &str = "item_id, review_count, rating_sum, average_rating, \
     stars_5, stars_4, stars_3, stars_2, stars_1, updated_at";

pub struct SqliteReviewStore {
    conn: Connection,
}

/// One page worth of rows plus the boundary cursor, before summary attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewPageRows {
    pub reviews: Vec<Review>,
    pub next_cursor: Option<ReviewId>,
}

/// Outcome of a ground-truth aggregate rebuild from the review log.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub reviews_scanned: usize,
    pub items_recomputed: usize,
    pub drifted_items: usize,
    pub aggregates_zeroed: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerStatus {
    pub review_rows: usize,
    pub aggregate_rows: usize,
    pub distinct_review_items: usize,
    pub drifted_items: usize,
    pub orphaned_aggregates: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerIssueSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct LedgerIssue {
    pub code: String,
    pub severity: LedgerIssueSeverity,
    pub message: String,
}

/// Per-item divergence between the stored aggregate and the log-derived one.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ItemDrift {
    pub item_id: ItemId,
    pub stored: Option<RatingAggregate>,
    pub recomputed: RatingAggregate,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct LedgerCheck {
    pub healthy: bool,
    pub status: LedgerStatus,
    pub issues: Vec<LedgerIssue>,
    pub drift_sample: Vec<ItemDrift>,
}

const DRIFT_SAMPLE_LIMIT: usize = 20;

impl SqliteReviewStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_LEDGER_V1)
            .context("failed to apply ledger schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![LEDGER_MIGRATION_VERSION, now],
            )
            .context("failed to register ledger schema migration")?;

        Ok(())
    }

    /// Appends a new review row, assigning the next monotonic identifier.
    ///
    /// Validation here is defense in depth; the orchestration layer is
    /// expected to have rejected malformed drafts already.
    pub fn append(&mut self, draft: &ReviewDraft) -> Result<Review> {
        let rating = draft
            .validate()
            .map_err(|err| anyhow!("review validation failed: {err}"))?;

        let created_at = now_utc();
        let created_at_text =
            format_rfc3339(created_at).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start append transaction")?;

        tx.execute(
            "INSERT INTO reviews(item_id, rating, comment, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![
                draft.item_id.0,
                rating.as_i64(),
                draft.comment,
                created_at_text,
            ],
        )
        .context("failed to append review")?;

        let review_id = tx.last_insert_rowid();
        tx.commit().context("failed to commit append transaction")?;

        Ok(Review {
            id: ReviewId(review_id),
            item_id: draft.item_id,
            rating,
            comment: draft.comment.clone(),
            created_at,
            updated_at: created_at,
        })
    }

    /// Mutates rating/comment of an existing review, refreshing `updated_at`.
    ///
    /// Returns the updated row together with the prior rating so the caller
    /// can derive the aggregate edit delta; `None` when the id is absent.
    pub fn update(
        &mut self,
        id: ReviewId,
        rating: Rating,
        comment: Option<&str>,
    ) -> Result<Option<(Review, Rating)>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start update transaction")?;

        let Some(existing) = load_review(&tx, id)? else {
            return Ok(None);
        };
        let prior_rating = existing.rating;

        let updated_at = now_utc();
        let updated_at_text =
            format_rfc3339(updated_at).map_err(|err| anyhow!(err.to_string()))?;

        tx.execute(
            "UPDATE reviews SET rating = ?2, comment = ?3, updated_at = ?4
             WHERE review_id = ?1",
            params![id.0, rating.as_i64(), comment, updated_at_text],
        )
        .context("failed to update review")?;

        tx.commit().context("failed to commit update transaction")?;

        Ok(Some((
            Review {
                id,
                item_id: existing.item_id,
                rating,
                comment: comment.map(ToOwned::to_owned),
                created_at: existing.created_at,
                updated_at,
            },
            prior_rating,
        )))
    }

    /// Deletes a review row, returning the removed record (pre-image) so the
    /// caller can derive the aggregate delete delta; `None` when absent.
    pub fn remove(&mut self, id: ReviewId) -> Result<Option<Review>> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start remove transaction")?;

        let Some(existing) = load_review(&tx, id)? else {
            return Ok(None);
        };

        tx.execute("DELETE FROM reviews WHERE review_id = ?1", params![id.0])
            .context("failed to delete review")?;

        tx.commit().context("failed to commit remove transaction")?;
        Ok(Some(existing))
    }

    pub fn get(&self, id: ReviewId) -> Result<Option<Review>> {
        load_review(&self.conn, id)
    }

    /// Returns up to `limit` reviews for `item_id`, newest first, optionally
    /// continuing at `before` (inclusive, so the cursor names the first row
    /// of the page being requested).
    ///
    /// Over-fetches one row; the trimmed excess row's id becomes the next
    /// cursor, keeping repeated traversal exactly-once without re-scans.
    pub fn page_by_item(
        &self,
        item_id: ItemId,
        limit: usize,
        before: Option<ReviewId>,
    ) -> Result<ReviewPageRows> {
        if limit == 0 {
            return Err(anyhow!("page limit MUST be >= 1"));
        }

        let fetch = i64::try_from(limit.saturating_add(1))
            .with_context(|| format!("invalid page limit: {limit}"))?;

        let mut stmt = self.conn.prepare(&format!(
            "SELECT {REVIEW_COLUMNS}
             FROM reviews
             WHERE item_id = ?1 AND (?2 IS NULL OR review_id <= ?2)
             ORDER BY review_id DESC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![item_id.0, before.map(|id| id.0), fetch],
            parse_review_row,
        )?;
        let mut reviews = collect_rows(rows)?;

        let next_cursor = if reviews.len() > limit {
            let boundary = reviews.split_off(limit);
            boundary.first().map(|review| review.id)
        } else {
            None
        };

        Ok(ReviewPageRows {
            reviews,
            next_cursor,
        })
    }

    /// Exact live review count, independent of the aggregate row. Used both
    /// for the count command and as the consistency cross-check.
    pub fn count_by_item(&self, item_id: ItemId) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM reviews WHERE item_id = ?1",
                params![item_id.0],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count reviews")?;
        u64::try_from(count).with_context(|| format!("invalid review count: {count}"))
    }

    /// Applies the create delta: upserts the aggregate row (the only creation
    /// path for one) and bumps count, sum, and the matching star bucket in a
    /// single atomic statement, then recomputes the derived average.
    pub fn apply_create_delta(&mut self, item_id: ItemId, rating: Rating) -> Result<()> {
        let column = star_column(rating);
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                &format!(
                    "INSERT INTO item_ratings(item_id, review_count, rating_sum, {column}, updated_at)
                     VALUES (?1, 1, ?2, 1, ?3)
                     ON CONFLICT(item_id) DO UPDATE SET
                       review_count = review_count + 1,
                       rating_sum = rating_sum + ?2,
                       {column} = {column} + 1,
                       updated_at = ?3"
                ),
                params![item_id.0, rating.as_i64(), now],
            )
            .context("failed to apply create delta")?;

        self.recompute_average(item_id)
    }

    /// Applies the edit delta: sum shifted by `new - old`, old bucket down,
    /// new bucket up, count untouched.
    pub fn apply_edit_delta(&mut self, item_id: ItemId, old: Rating, new: Rating) -> Result<()> {
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        if old == new {
            self.conn
                .execute(
                    "UPDATE item_ratings SET updated_at = ?2 WHERE item_id = ?1",
                    params![item_id.0, now],
                )
                .context("failed to touch aggregate on no-op edit")?;
            return self.recompute_average(item_id);
        }

        let old_column = star_column(old);
        let new_column = star_column(new);
        let sum_delta = new.as_i64() - old.as_i64();

        self.conn
            .execute(
                &format!(
                    "UPDATE item_ratings SET
                       rating_sum = MAX(rating_sum + ?2, 0),
                       {old_column} = MAX({old_column} - 1, 0),
                       {new_column} = {new_column} + 1,
                       updated_at = ?3
                     WHERE item_id = ?1"
                ),
                params![item_id.0, sum_delta, now],
            )
            .context("failed to apply edit delta")?;

        self.recompute_average(item_id)
    }

    /// Applies the delete delta with every counter floored at zero.
    pub fn apply_delete_delta(&mut self, item_id: ItemId, rating: Rating) -> Result<()> {
        let column = star_column(rating);
        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                &format!(
                    "UPDATE item_ratings SET
                       review_count = MAX(review_count - 1, 0),
                       rating_sum = MAX(rating_sum - ?2, 0),
                       {column} = MAX({column} - 1, 0),
                       updated_at = ?3
                     WHERE item_id = ?1"
                ),
                params![item_id.0, rating.as_i64(), now],
            )
            .context("failed to apply delete delta")?;

        self.recompute_average(item_id)
    }

    /// Current aggregate snapshot; zero-valued when no row exists.
    /// Read-side absence is not an error.
    pub fn get_aggregate(&self, item_id: ItemId) -> Result<RatingAggregate> {
        Ok(self
            .stored_aggregate(item_id)?
            .unwrap_or_else(|| RatingAggregate::empty(item_id)))
    }

    /// Rebuilds every aggregate from the review log by full scan. Idempotent;
    /// the out-of-band recovery path for the accepted log/aggregate
    /// consistency window.
    pub fn reconcile(&mut self) -> Result<ReconcileReport> {
        let item_ids = self.items_with_reviews()?;

        let mut reviews_scanned = 0_usize;
        let mut drifted_items = 0_usize;

        for item_id in &item_ids {
            let ratings = self.ratings_for_item(*item_id)?;
            reviews_scanned += ratings.len();

            let recomputed =
                review_ledger_core::recompute_aggregate(*item_id, &ratings, now_utc());
            let stored = self.stored_aggregate(*item_id)?;

            if !stored
                .as_ref()
                .is_some_and(|existing| aggregates_equivalent(existing, &recomputed))
            {
                drifted_items += 1;
                tracing::warn!(item_id = item_id.0, "aggregate drift repaired during reconcile");
            }

            self.upsert_aggregate(&recomputed)?;
        }

        let orphans = self.orphaned_aggregate_items()?;
        let aggregates_zeroed = orphans.len();
        for item_id in orphans {
            let zeroed = RatingAggregate {
                updated_at: Some(now_utc()),
                ..RatingAggregate::empty(item_id)
            };
            self.upsert_aggregate(&zeroed)?;
        }

        Ok(ReconcileReport {
            reviews_scanned,
            items_recomputed: item_ids.len(),
            drifted_items,
            aggregates_zeroed,
        })
    }

    pub fn ledger_status(&self) -> Result<LedgerStatus> {
        let review_rows = self.count_table_rows("reviews")?;
        let aggregate_rows = self.count_table_rows("item_ratings")?;
        let distinct_review_items = self.items_with_reviews()?.len();
        let drifted_items = self.collect_drift(None)?.len();
        let orphaned_aggregates = self.orphaned_aggregate_items()?.len();

        Ok(LedgerStatus {
            review_rows,
            aggregate_rows,
            distinct_review_items,
            drifted_items,
            orphaned_aggregates,
        })
    }

    /// Cross-checks every stored aggregate against the log-derived ground
    /// truth and reports issues with stable codes.
    pub fn ledger_check(&self) -> Result<LedgerCheck> {
        let status = self.ledger_status()?;
        let drift_sample = self.collect_drift(Some(DRIFT_SAMPLE_LIMIT))?;

        let mut issues = Vec::new();
        for drift in &drift_sample {
            match &drift.stored {
                None => issues.push(LedgerIssue {
                    code: "drift.missing_aggregate".to_string(),
                    severity: LedgerIssueSeverity::Error,
                    message: format!(
                        "item {} has {} live reviews but no aggregate row",
                        drift.item_id, drift.recomputed.review_count
                    ),
                }),
                Some(stored) => {
                    if stored.review_count != drift.recomputed.review_count {
                        issues.push(LedgerIssue {
                            code: "drift.count_mismatch".to_string(),
                            severity: LedgerIssueSeverity::Error,
                            message: format!(
                                "item {}: stored count {} != log count {}",
                                drift.item_id,
                                stored.review_count,
                                drift.recomputed.review_count
                            ),
                        });
                    }
                    if stored.rating_sum != drift.recomputed.rating_sum {
                        issues.push(LedgerIssue {
                            code: "drift.sum_mismatch".to_string(),
                            severity: LedgerIssueSeverity::Error,
                            message: format!(
                                "item {}: stored sum {} != log sum {}",
                                drift.item_id, stored.rating_sum, drift.recomputed.rating_sum
                            ),
                        });
                    }
                    if stored.rating_distribution != drift.recomputed.rating_distribution {
                        let mismatched: Vec<String> = Rating::all()
                            .into_iter()
                            .filter(|star| {
                                stored.rating_distribution.bucket(*star)
                                    != drift.recomputed.rating_distribution.bucket(*star)
                            })
                            .map(|star| {
                                format!(
                                    "{star}-star {} != {}",
                                    stored.rating_distribution.bucket(star),
                                    drift.recomputed.rating_distribution.bucket(star)
                                )
                            })
                            .collect();
                        issues.push(LedgerIssue {
                            code: "drift.distribution_mismatch".to_string(),
                            severity: LedgerIssueSeverity::Error,
                            message: format!(
                                "item {}: stored distribution diverges from log ({})",
                                drift.item_id,
                                mismatched.join(", ")
                            ),
                        });
                    }
                }
            }
        }

        if status.orphaned_aggregates > 0 {
            issues.push(LedgerIssue {
                code: "aggregate.orphaned".to_string(),
                severity: LedgerIssueSeverity::Warning,
                message: format!(
                    "{} aggregate row(s) have no backing reviews",
                    status.orphaned_aggregates
                ),
            });
        }

        let healthy = issues
            .iter()
            .all(|issue| issue.severity != LedgerIssueSeverity::Error);

        Ok(LedgerCheck {
            healthy,
            status,
            issues,
            drift_sample,
        })
    }

    fn recompute_average(&mut self, item_id: ItemId) -> Result<()> {
        // Separate second statement: counters are already current, the
        // derived average may trail them for a moment.
        self.conn
            .execute(
                "UPDATE item_ratings SET average_rating =
                   CASE WHEN review_count > 0
                        THEN CAST(rating_sum AS REAL) / review_count
                        ELSE 0.0 END
                 WHERE item_id = ?1",
                params![item_id.0],
            )
            .context("failed to recompute average rating")?;
        Ok(())
    }

    fn stored_aggregate(&self, item_id: ItemId) -> Result<Option<RatingAggregate>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM item_ratings WHERE item_id = ?1"
        ))?;

        let row = stmt
            .query_row(params![item_id.0], parse_aggregate_row)
            .optional()?;
        Ok(row)
    }

    fn upsert_aggregate(&mut self, aggregate: &RatingAggregate) -> Result<()> {
        let updated_at = aggregate
            .updated_at
            .map(format_rfc3339)
            .transpose()
            .map_err(|err| anyhow!(err.to_string()))?
            .unwrap_or_else(String::new);

        self.conn
            .execute(
                "INSERT INTO item_ratings(
                    item_id, review_count, rating_sum, average_rating,
                    stars_5, stars_4, stars_3, stars_2, stars_1, updated_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(item_id) DO UPDATE SET
                    review_count = excluded.review_count,
                    rating_sum = excluded.rating_sum,
                    average_rating = excluded.average_rating,
                    stars_5 = excluded.stars_5,
                    stars_4 = excluded.stars_4,
                    stars_3 = excluded.stars_3,
                    stars_2 = excluded.stars_2,
                    stars_1 = excluded.stars_1,
                    updated_at = excluded.updated_at",
                params![
                    aggregate.item_id.0,
                    to_sql_count(aggregate.review_count)?,
                    to_sql_count(aggregate.rating_sum)?,
                    aggregate.average_rating,
                    to_sql_count(aggregate.rating_distribution.five)?,
                    to_sql_count(aggregate.rating_distribution.four)?,
                    to_sql_count(aggregate.rating_distribution.three)?,
                    to_sql_count(aggregate.rating_distribution.two)?,
                    to_sql_count(aggregate.rating_distribution.one)?,
                    updated_at,
                ],
            )
            .context("failed to upsert aggregate row")?;
        Ok(())
    }

    fn items_with_reviews(&self) -> Result<Vec<ItemId>> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT item_id FROM reviews ORDER BY item_id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(ItemId))?;
        collect_rows(rows)
    }

    fn ratings_for_item(&self, item_id: ItemId) -> Result<Vec<Rating>> {
        let mut stmt = self.conn.prepare(
            "SELECT rating FROM reviews WHERE item_id = ?1 ORDER BY review_id ASC",
        )?;
        let rows = stmt.query_map(params![item_id.0], |row| {
            let raw: i64 = row.get(0)?;
            Rating::new(raw).map_err(|err| to_sql_error(0, &err.to_string()))
        })?;
        collect_rows(rows)
    }

    fn orphaned_aggregate_items(&self) -> Result<Vec<ItemId>> {
        let mut stmt = self.conn.prepare(
            "SELECT aggregates.item_id
             FROM item_ratings aggregates
             LEFT JOIN (SELECT DISTINCT item_id FROM reviews) live
               ON live.item_id = aggregates.item_id
             WHERE live.item_id IS NULL AND aggregates.review_count > 0",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0).map(ItemId))?;
        collect_rows(rows)
    }

    fn collect_drift(&self, limit: Option<usize>) -> Result<Vec<ItemDrift>> {
        let mut drift = Vec::new();
        for item_id in self.items_with_reviews()? {
            if limit.is_some_and(|cap| drift.len() >= cap) {
                break;
            }

            let ratings = self.ratings_for_item(item_id)?;
            let recomputed =
                review_ledger_core::recompute_aggregate(item_id, &ratings, now_utc());
            let stored = self.stored_aggregate(item_id)?;

            if !stored
                .as_ref()
                .is_some_and(|existing| aggregates_equivalent(existing, &recomputed))
            {
                drift.push(ItemDrift {
                    item_id,
                    stored,
                    recomputed,
                });
            }
        }
        Ok(drift)
    }

    fn count_table_rows(&self, table: &str) -> Result<usize> {
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                row.get::<_, i64>(0)
            })
            .with_context(|| format!("failed to count {table} rows"))?;
        usize::try_from(count).with_context(|| format!("invalid {table} row count: {count}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Compares everything but `updated_at`, with float tolerance on the average.
fn aggregates_equivalent(stored: &RatingAggregate, recomputed: &RatingAggregate) -> bool {
    stored.review_count == recomputed.review_count
        && stored.rating_sum == recomputed.rating_sum
        && stored.rating_distribution == recomputed.rating_distribution
        && (stored.average_rating - recomputed.average_rating).abs()
            <= review_ledger_core::AVERAGE_TOLERANCE
}

fn star_column(rating: Rating) -> &'static str {
    match rating.value() {
        1 => "stars_1",
        2 => "stars_2",
        3 => "stars_3",
        4 => "stars_4",
        _ => "stars_5",
    }
}

fn load_review(conn: &Connection, id: ReviewId) -> Result<Option<Review>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {REVIEW_COLUMNS} FROM reviews WHERE review_id = ?1"
    ))?;
    let row = stmt
        .query_row(params![id.0], parse_review_row)
        .optional()?;
    Ok(row)
}

fn parse_review_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Review> {
    let review_id: i64 = row.get(0)?;
    let item_id: i64 = row.get(1)?;
    let rating_raw: i64 = row.get(2)?;
    let comment: Option<String> = row.get(3)?;
    let created_at_raw: String = row.get(4)?;
    let updated_at_raw: String = row.get(5)?;

    let rating = Rating::new(rating_raw).map_err(|err| to_sql_error(2, &err.to_string()))?;
    let created_at =
        parse_rfc3339_utc(&created_at_raw).map_err(|err| to_sql_error(4, &err.to_string()))?;
    let updated_at =
        parse_rfc3339_utc(&updated_at_raw).map_err(|err| to_sql_error(5, &err.to_string()))?;

    Ok(Review {
        id: ReviewId(review_id),
        item_id: ItemId(item_id),
        rating,
        comment,
        created_at,
        updated_at,
    })
}

fn parse_aggregate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RatingAggregate> {
    let item_id: i64 = row.get(0)?;
    let review_count: i64 = row.get(1)?;
    let rating_sum: i64 = row.get(2)?;
    let average_rating: f64 = row.get(3)?;
    let stars_5: i64 = row.get(4)?;
    let stars_4: i64 = row.get(5)?;
    let stars_3: i64 = row.get(6)?;
    let stars_2: i64 = row.get(7)?;
    let stars_1: i64 = row.get(8)?;
    let updated_at_raw: String = row.get(9)?;

    let updated_at = if updated_at_raw.is_empty() {
        None
    } else {
        Some(
            parse_rfc3339_utc(&updated_at_raw)
                .map_err(|err| to_sql_error(9, &err.to_string()))?,
        )
    };

    Ok(RatingAggregate {
        item_id: ItemId(item_id),
        review_count: from_sql_count(1, review_count)?,
        rating_sum: from_sql_count(2, rating_sum)?,
        average_rating,
        rating_distribution: RatingDistribution {
            five: from_sql_count(4, stars_5)?,
            four: from_sql_count(5, stars_4)?,
            three: from_sql_count(6, stars_3)?,
            two: from_sql_count(7, stars_2)?,
            one: from_sql_count(8, stars_1)?,
        },
        updated_at,
    })
}

fn from_sql_count(column: usize, value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value)
        .map_err(|_| to_sql_error(column, &format!("negative counter value: {value}")))
}

fn to_sql_count(value: u64) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("counter overflows sqlite integer: {value}"))
}

fn to_sql_error(column: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Integer,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in rows {
        out.push(row?);
    }
    Ok(out)
}
