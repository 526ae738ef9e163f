//! Domain model for the review ledger and its rating aggregation engine.
//!
//! The types here are storage-agnostic: the SQLite store crate persists them,
//! and the service crate orchestrates commands over them. Aggregate deltas are
//! also expressed as pure functions so that tests and the reconciliation path
//! can compare incremental maintenance against the recompute-from-log ground
//! truth.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

/// Upper bound on review comments, counted in Unicode code points.
pub const COMMENT_MAX_CHARS: usize = 1000;

/// Page size applied when a list command omits `limit`.
pub const DEFAULT_PAGE_LIMIT: usize = 20;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("invalid rating {0}: rating MUST be an integer in [1, 5]")]
    InvalidRating(i64),
    #[error("comment too long: {chars} code points exceeds the {max} limit")]
    CommentTooLong { chars: usize, max: usize },
    #[error("invalid pagination cursor: {0}")]
    InvalidCursor(String),
    #[error("review {0} not found")]
    NotFound(ReviewId),
    #[error("catalog item {0} not found")]
    ItemNotFound(ItemId),
    #[error("catalog lookup unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("aggregate invariant violated: {0}")]
    InvariantViolation(String),
}

/// Monotonic review identifier, assigned by the store at creation time.
///
/// Strictly increasing in creation order, immutable, and doubles as the
/// pagination cursor in its opaque string form.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ReviewId(pub i64);

impl Display for ReviewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ReviewId {
    /// Opaque cursor form handed to callers; pass back unmodified to continue.
    #[must_use]
    pub fn as_cursor(self) -> String {
        self.0.to_string()
    }

    /// Decodes a cursor previously produced by [`ReviewId::as_cursor`].
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidCursor`] when the token is not a
    /// positive integer identifier.
    pub fn parse_cursor(raw: &str) -> Result<Self, LedgerError> {
        let value = raw
            .trim()
            .parse::<i64>()
            .map_err(|_| LedgerError::InvalidCursor(raw.to_string()))?;
        if value <= 0 {
            return Err(LedgerError::InvalidCursor(raw.to_string()));
        }
        Ok(Self(value))
    }
}

/// Identifier of an externally-owned catalog item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl Display for ItemId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Star rating in [1, 5].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(try_from = "i64", into = "i64")]
pub struct Rating(u8);

impl Rating {
    /// # Errors
    /// Returns [`LedgerError::InvalidRating`] when `value` falls outside [1, 5].
    pub fn new(value: i64) -> Result<Self, LedgerError> {
        if !(1..=5).contains(&value) {
            return Err(LedgerError::InvalidRating(value));
        }
        let star = u8::try_from(value).map_err(|_| LedgerError::InvalidRating(value))?;
        Ok(Self(star))
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }

    #[must_use]
    pub fn as_i64(self) -> i64 {
        i64::from(self.0)
    }

    /// All star values, ascending.
    #[must_use]
    pub fn all() -> [Self; 5] {
        [Self(1), Self(2), Self(3), Self(4), Self(5)]
    }
}

impl TryFrom<i64> for Rating {
    type Error = LedgerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Rating> for i64 {
    fn from(value: Rating) -> Self {
        value.as_i64()
    }
}

impl Display for Rating {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Five-bucket histogram of live review ratings for one item.
///
/// Serialized with the star value as the key, highest star first, matching
/// the persisted aggregate document shape.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RatingDistribution {
    #[serde(rename = "5", default)]
    pub five: u64,
    #[serde(rename = "4", default)]
    pub four: u64,
    #[serde(rename = "3", default)]
    pub three: u64,
    #[serde(rename = "2", default)]
    pub two: u64,
    #[serde(rename = "1", default)]
    pub one: u64,
}

impl RatingDistribution {
    #[must_use]
    pub fn bucket(&self, rating: Rating) -> u64 {
        match rating.value() {
            1 => self.one,
            2 => self.two,
            3 => self.three,
            4 => self.four,
            _ => self.five,
        }
    }

    pub fn bucket_mut(&mut self, rating: Rating) -> &mut u64 {
        match rating.value() {
            1 => &mut self.one,
            2 => &mut self.two,
            3 => &mut self.three,
            4 => &mut self.four,
            _ => &mut self.five,
        }
    }

    pub fn increment(&mut self, rating: Rating) {
        let bucket = self.bucket_mut(rating);
        *bucket = bucket.saturating_add(1);
    }

    /// Decrements the matching bucket, floored at zero.
    pub fn decrement_floored(&mut self, rating: Rating) {
        let bucket = self.bucket_mut(rating);
        *bucket = bucket.saturating_sub(1);
    }

    /// Sum over all buckets; must equal the aggregate review count.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.one + self.two + self.three + self.four + self.five
    }

    /// `sum(star * count)` over all buckets; must equal the rating sum.
    #[must_use]
    pub fn weighted_sum(&self) -> u64 {
        self.one + 2 * self.two + 3 * self.three + 4 * self.four + 5 * self.five
    }
}

/// A single submitted review, one row in the review log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Review {
    pub id: ReviewId,
    pub item_id: ItemId,
    pub rating: Rating,
    pub comment: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Create-command payload, validated before it reaches the log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewDraft {
    pub item_id: ItemId,
    pub rating: i64,
    pub comment: Option<String>,
}

impl ReviewDraft {
    /// Validates the rating range and comment length.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvalidRating`] or [`LedgerError::CommentTooLong`].
    pub fn validate(&self) -> Result<Rating, LedgerError> {
        let rating = Rating::new(self.rating)?;
        validate_comment(self.comment.as_deref())?;
        Ok(rating)
    }
}

/// Edit-command payload; only rating and comment are mutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReviewEdit {
    pub id: ReviewId,
    pub rating: i64,
    pub comment: Option<String>,
}

impl ReviewEdit {
    /// # Errors
    /// Returns [`LedgerError::InvalidRating`] or [`LedgerError::CommentTooLong`].
    pub fn validate(&self) -> Result<Rating, LedgerError> {
        let rating = Rating::new(self.rating)?;
        validate_comment(self.comment.as_deref())?;
        Ok(rating)
    }
}

/// # Errors
/// Returns [`LedgerError::CommentTooLong`] past [`COMMENT_MAX_CHARS`] code points.
pub fn validate_comment(comment: Option<&str>) -> Result<(), LedgerError> {
    if let Some(text) = comment {
        let chars = text.chars().count();
        if chars > COMMENT_MAX_CHARS {
            return Err(LedgerError::CommentTooLong {
                chars,
                max: COMMENT_MAX_CHARS,
            });
        }
    }
    Ok(())
}

/// Denormalized per-item rating summary, derived from the review log.
///
/// The log is the sole source of truth; this row is a materialized view kept
/// consistent by every mutating command and repairable by full recompute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RatingAggregate {
    pub item_id: ItemId,
    pub review_count: u64,
    pub rating_sum: u64,
    pub average_rating: f64,
    pub rating_distribution: RatingDistribution,
    #[serde(with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
}

impl RatingAggregate {
    /// Zero-valued aggregate returned when no row exists for an item.
    #[must_use]
    pub fn empty(item_id: ItemId) -> Self {
        Self {
            item_id,
            review_count: 0,
            rating_sum: 0,
            average_rating: 0.0,
            rating_distribution: RatingDistribution::default(),
            updated_at: None,
        }
    }

    /// `rating_sum / review_count`, 0 when there are no live reviews.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn derived_average(&self) -> f64 {
        if self.review_count == 0 {
            0.0
        } else {
            self.rating_sum as f64 / self.review_count as f64
        }
    }

    /// Checks the counter identities this snapshot must satisfy: bucket
    /// totals match the count, the weighted bucket sum matches the rating
    /// sum, and the stored average matches the derived one.
    ///
    /// # Errors
    /// Returns [`LedgerError::InvariantViolation`] naming the first violated
    /// invariant.
    pub fn check_invariants(&self) -> Result<(), LedgerError> {
        if self.review_count != self.rating_distribution.total() {
            return Err(LedgerError::InvariantViolation(format!(
                "item {}: review_count {} != distribution total {}",
                self.item_id,
                self.review_count,
                self.rating_distribution.total()
            )));
        }
        if self.rating_sum != self.rating_distribution.weighted_sum() {
            return Err(LedgerError::InvariantViolation(format!(
                "item {}: rating_sum {} != distribution weighted sum {}",
                self.item_id,
                self.rating_sum,
                self.rating_distribution.weighted_sum()
            )));
        }
        if (self.average_rating - self.derived_average()).abs() > AVERAGE_TOLERANCE {
            return Err(LedgerError::InvariantViolation(format!(
                "item {}: average_rating {} != {} derived from counters",
                self.item_id,
                self.average_rating,
                self.derived_average()
            )));
        }
        Ok(())
    }
}

/// Floating-point tolerance when comparing stored against derived averages.
pub const AVERAGE_TOLERANCE: f64 = 1e-9;

/// Head-of-page rating summary attached to a listed page.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RatingSummary {
    pub review_count: u64,
    pub average_rating: f64,
}

impl From<&RatingAggregate> for RatingSummary {
    fn from(aggregate: &RatingAggregate) -> Self {
        Self {
            review_count: aggregate.review_count,
            average_rating: aggregate.average_rating,
        }
    }
}

/// One page of reviews for an item, newest first.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewPage {
    pub rating: RatingSummary,
    pub reviews: Vec<Review>,
    pub next_cursor: Option<String>,
}

/// Exact live review count for one requested item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemReviewCount {
    pub item_id: ItemId,
    pub count: u64,
}

/// Applies a create delta: count +1, sum +rating, matching bucket +1.
#[must_use]
pub fn create_delta(aggregate: &RatingAggregate, rating: Rating, at: OffsetDateTime) -> RatingAggregate {
    let mut next = aggregate.clone();
    next.review_count = next.review_count.saturating_add(1);
    next.rating_sum = next.rating_sum.saturating_add(rating.value().into());
    next.rating_distribution.increment(rating);
    next.average_rating = next.derived_average();
    next.updated_at = Some(at);
    next
}

/// Applies an edit delta: sum adjusted by `new - old`, bucket moved,
/// count unchanged.
#[must_use]
pub fn edit_delta(
    aggregate: &RatingAggregate,
    old: Rating,
    new: Rating,
    at: OffsetDateTime,
) -> RatingAggregate {
    let mut next = aggregate.clone();
    if old != new {
        let old_value = u64::from(old.value());
        let new_value = u64::from(new.value());
        next.rating_sum = next.rating_sum.saturating_add(new_value).saturating_sub(old_value);
        next.rating_distribution.decrement_floored(old);
        next.rating_distribution.increment(new);
    }
    next.average_rating = next.derived_average();
    next.updated_at = Some(at);
    next
}

/// Applies a delete delta: count -1, sum -rating, bucket -1, all floored at
/// zero; average drops to 0 when the count reaches 0.
#[must_use]
pub fn delete_delta(aggregate: &RatingAggregate, rating: Rating, at: OffsetDateTime) -> RatingAggregate {
    let mut next = aggregate.clone();
    next.review_count = next.review_count.saturating_sub(1);
    next.rating_sum = next.rating_sum.saturating_sub(rating.value().into());
    next.rating_distribution.decrement_floored(rating);
    next.average_rating = next.derived_average();
    next.updated_at = Some(at);
    next
}

/// Ground-truth recompute from the review log, used by reconciliation and as
/// the reference model in tests.
#[must_use]
pub fn recompute_aggregate(
    item_id: ItemId,
    ratings: &[Rating],
    at: OffsetDateTime,
) -> RatingAggregate {
    let mut aggregate = RatingAggregate::empty(item_id);
    for rating in ratings {
        aggregate.review_count += 1;
        aggregate.rating_sum += u64::from(rating.value());
        aggregate.rating_distribution.increment(*rating);
    }
    aggregate.average_rating = aggregate.derived_average();
    aggregate.updated_at = Some(at);
    aggregate
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when parsing fails or the input
/// timestamp is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, LedgerError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(LedgerError::Validation(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`LedgerError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, LedgerError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| LedgerError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_utc(value: &str) -> OffsetDateTime {
        must_ok(parse_rfc3339_utc(value))
    }

    fn star(value: i64) -> Rating {
        must_ok(Rating::new(value))
    }

    #[test]
    fn rating_rejects_out_of_range_values() {
        for value in [-1, 0, 6, 42] {
            assert_eq!(Rating::new(value), Err(LedgerError::InvalidRating(value)));
        }
        for value in 1..=5 {
            assert_eq!(must_ok(Rating::new(value)).as_i64(), value);
        }
    }

    #[test]
    fn draft_validation_bounds_comment_length() {
        let draft = ReviewDraft {
            item_id: ItemId(620),
            rating: 4,
            comment: Some("a".repeat(COMMENT_MAX_CHARS)),
        };
        assert_eq!(must_ok(draft.validate()).as_i64(), 4);

        let long = ReviewDraft {
            item_id: ItemId(620),
            rating: 4,
            comment: Some("a".repeat(COMMENT_MAX_CHARS + 1)),
        };
        assert_eq!(
            long.validate(),
            Err(LedgerError::CommentTooLong {
                chars: COMMENT_MAX_CHARS + 1,
                max: COMMENT_MAX_CHARS,
            })
        );
    }

    #[test]
    fn comment_limit_counts_code_points_not_bytes() {
        // 1000 multi-byte code points is still within the limit.
        let comment = "\u{00e9}".repeat(COMMENT_MAX_CHARS);
        assert!(comment.len() > COMMENT_MAX_CHARS);
        assert_eq!(validate_comment(Some(&comment)), Ok(()));
    }

    #[test]
    fn cursor_round_trips_and_rejects_garbage() {
        let id = ReviewId(42);
        assert_eq!(must_ok(ReviewId::parse_cursor(&id.as_cursor())), id);

        for raw in ["", "abc", "-3", "0", "1.5"] {
            assert_eq!(
                ReviewId::parse_cursor(raw),
                Err(LedgerError::InvalidCursor(raw.to_string()))
            );
        }
    }

    #[test]
    fn create_delta_seeds_a_fresh_aggregate() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let aggregate = create_delta(&RatingAggregate::empty(ItemId(620)), star(5), at);

        assert_eq!(aggregate.review_count, 1);
        assert_eq!(aggregate.rating_sum, 5);
        assert!((aggregate.average_rating - 5.0).abs() < AVERAGE_TOLERANCE);
        assert_eq!(aggregate.rating_distribution.five, 1);
        must_ok(aggregate.check_invariants());
    }

    #[test]
    fn create_then_create_then_delete_keeps_all_counters_in_step() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let first = create_delta(&RatingAggregate::empty(ItemId(620)), star(5), at);
        let second = create_delta(&first, star(3), at);

        assert_eq!(second.review_count, 2);
        assert_eq!(second.rating_sum, 8);
        assert!((second.average_rating - 4.0).abs() < AVERAGE_TOLERANCE);

        let third = delete_delta(&second, star(5), at);
        assert_eq!(third.review_count, 1);
        assert_eq!(third.rating_sum, 3);
        assert!((third.average_rating - 3.0).abs() < AVERAGE_TOLERANCE);
        must_ok(third.check_invariants());
    }

    #[test]
    fn edit_delta_shifts_sum_by_difference_and_keeps_count() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let base = create_delta(&RatingAggregate::empty(ItemId(7)), star(2), at);
        let edited = edit_delta(&base, star(2), star(5), at);

        assert_eq!(edited.review_count, base.review_count);
        assert_eq!(edited.rating_sum, base.rating_sum + 3);
        assert_eq!(edited.rating_distribution.two, 0);
        assert_eq!(edited.rating_distribution.five, 1);
        must_ok(edited.check_invariants());
    }

    #[test]
    fn edit_delta_with_equal_ratings_is_a_counter_no_op() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let base = create_delta(&RatingAggregate::empty(ItemId(7)), star(4), at);
        let edited = edit_delta(&base, star(4), star(4), at);

        assert_eq!(edited.rating_sum, base.rating_sum);
        assert_eq!(edited.rating_distribution, base.rating_distribution);
    }

    #[test]
    fn delete_delta_floors_at_zero() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let drained = delete_delta(&RatingAggregate::empty(ItemId(9)), star(3), at);

        assert_eq!(drained.review_count, 0);
        assert_eq!(drained.rating_sum, 0);
        assert!((drained.average_rating).abs() < AVERAGE_TOLERANCE);
        assert_eq!(drained.rating_distribution.three, 0);
    }

    #[test]
    fn incremental_deltas_match_recompute_ground_truth() {
        let at = must_utc("2026-03-01T12:00:00Z");
        let mut incremental = RatingAggregate::empty(ItemId(621));
        let ratings = [star(4), star(3), star(5), star(3), star(1)];
        for rating in ratings {
            incremental = create_delta(&incremental, rating, at);
        }
        incremental = edit_delta(&incremental, star(1), star(2), at);
        incremental = delete_delta(&incremental, star(5), at);

        let recomputed = recompute_aggregate(ItemId(621), &[star(4), star(3), star(3), star(2)], at);
        assert_eq!(incremental, recomputed);
        must_ok(incremental.check_invariants());
    }

    #[test]
    fn invariant_checker_flags_drift() {
        let mut aggregate = RatingAggregate::empty(ItemId(5));
        aggregate.review_count = 2;
        aggregate.rating_sum = 6;
        aggregate.rating_distribution.three = 2;
        aggregate.average_rating = 3.0;
        must_ok(aggregate.check_invariants());

        aggregate.rating_sum = 7;
        assert!(matches!(
            aggregate.check_invariants(),
            Err(LedgerError::InvariantViolation(_))
        ));
    }

    #[test]
    fn distribution_serializes_with_star_keys() {
        let mut distribution = RatingDistribution::default();
        distribution.increment(star(5));
        distribution.increment(star(1));

        let value = must_ok(serde_json::to_value(distribution));
        assert_eq!(value["5"], 1);
        assert_eq!(value["1"], 1);
        assert_eq!(value["3"], 0);
    }

    #[test]
    fn empty_aggregate_reports_zero_average_never_negative_one() {
        let aggregate = RatingAggregate::empty(ItemId(999));
        let summary = RatingSummary::from(&aggregate);
        assert_eq!(summary.review_count, 0);
        assert!((summary.average_rating).abs() < AVERAGE_TOLERANCE);
    }
}
