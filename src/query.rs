//! Multi-criteria directory queries
//!
//! Criteria combine tag-subset matching (AND semantics), an importance
//! floor, a time-range filter on either timestamp, and a layer restriction.
//! Matching is a linear scan over the directory; the working set is small by
//! construction, so no external index is kept.

use crate::directory::{ContextKey, KeyId, Layer};
use chrono::{DateTime, Duration, Utc};

/// Which timestamp a time range applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeField {
    CreatedAt,
    LastAccessed,
}

/// Inclusive time range on one of the entry timestamps.
#[derive(Debug, Clone, Copy)]
pub struct TimeRange {
    pub field: TimeField,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

/// Search criteria. Every populated field must hold for an entry to match.
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    /// Tags the entry's canonical set must contain (exact, case-sensitive)
    pub tags: Vec<String>,
    /// Minimum importance score
    pub min_importance: Option<u32>,
    /// Optional time-range filter
    pub time_range: Option<TimeRange>,
    /// Restrict to one layer
    pub layer: Option<Layer>,
    /// Cap on the number of results after ranking
    pub max_results: Option<usize>,
}

impl QueryCriteria {
    /// Criteria matching entries that carry all of `tags`.
    pub fn with_tags<S: Into<String>>(tags: impl IntoIterator<Item = S>) -> Self {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// One ranked query result.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub key_id: KeyId,
    pub tags: Vec<String>,
    pub value: String,
    pub importance: u32,
    pub layer: Layer,
    pub score: u32,
}

/// Whether an entry satisfies every criterion. `criteria.tags` must already
/// be canonical (sorted) so the subset check can binary-search.
pub(crate) fn matches(entry: &ContextKey, criteria: &QueryCriteria) -> bool {
    for tag in &criteria.tags {
        if entry.tags.binary_search(tag).is_err() {
            return false;
        }
    }

    if let Some(floor) = criteria.min_importance {
        if entry.importance < floor {
            return false;
        }
    }

    if let Some(layer) = criteria.layer {
        if entry.layer != layer {
            return false;
        }
    }

    if let Some(range) = &criteria.time_range {
        let stamp = match range.field {
            TimeField::CreatedAt => entry.created_at,
            TimeField::LastAccessed => entry.last_accessed,
        };
        if let Some(start) = range.start {
            if stamp < start {
                return false;
            }
        }
        if let Some(end) = range.end {
            if stamp > end {
                return false;
            }
        }
    }

    true
}

/// Relevance score: exact tag-count match weighted highest, then importance,
/// then a recency bucket. Ties are broken by insertion order at sort time.
pub(crate) fn relevance(entry: &ContextKey, criteria: &QueryCriteria, now: DateTime<Utc>) -> u32 {
    let matched = criteria
        .tags
        .iter()
        .filter(|t| entry.tags.binary_search(t).is_ok())
        .count() as u32;

    matched * 1000 + entry.importance + recency_bucket(now - entry.last_accessed)
}

fn recency_bucket(age: Duration) -> u32 {
    if age < Duration::hours(1) {
        30
    } else if age < Duration::days(1) {
        25
    } else if age < Duration::weeks(1) {
        20
    } else if age < Duration::days(30) {
        15
    } else {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ValueRef;

    fn entry(id: u64, tags: &[&str], importance: u32, layer: Layer) -> ContextKey {
        let now = Utc::now();
        ContextKey {
            id: KeyId(id),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            layer,
            importance,
            created_at: now,
            last_accessed: now,
            access_count: 0,
            value: ValueRef::Spilled,
        }
    }

    #[test]
    fn test_tag_subset_semantics() {
        let e = entry(1, &["goal", "task"], 50, Layer::Working);

        assert!(matches(&e, &QueryCriteria::with_tags(["task"])));
        assert!(matches(&e, &QueryCriteria::with_tags(["goal", "task"])));
        assert!(!matches(&e, &QueryCriteria::with_tags(["goal", "plan"])));
        // Case-sensitive
        assert!(!matches(&e, &QueryCriteria::with_tags(["Task"])));
        // No tags matches everything
        assert!(matches(&e, &QueryCriteria::default()));
    }

    #[test]
    fn test_importance_floor_and_layer() {
        let e = entry(1, &["t"], 40, Layer::Disk);

        let mut c = QueryCriteria::default();
        c.min_importance = Some(40);
        assert!(matches(&e, &c));
        c.min_importance = Some(41);
        assert!(!matches(&e, &c));

        let mut c = QueryCriteria::default();
        c.layer = Some(Layer::Disk);
        assert!(matches(&e, &c));
        c.layer = Some(Layer::Working);
        assert!(!matches(&e, &c));
    }

    #[test]
    fn test_time_range_filter() {
        let mut e = entry(1, &["t"], 50, Layer::Working);
        e.created_at = Utc::now() - Duration::days(10);

        let mut c = QueryCriteria::default();
        c.time_range = Some(TimeRange {
            field: TimeField::CreatedAt,
            start: Some(Utc::now() - Duration::days(30)),
            end: Some(Utc::now() - Duration::days(5)),
        });
        assert!(matches(&e, &c));

        c.time_range = Some(TimeRange {
            field: TimeField::CreatedAt,
            start: Some(Utc::now() - Duration::days(5)),
            end: None,
        });
        assert!(!matches(&e, &c));

        // Same range against last_accessed (fresh) behaves independently
        c.time_range = Some(TimeRange {
            field: TimeField::LastAccessed,
            start: Some(Utc::now() - Duration::days(5)),
            end: None,
        });
        assert!(matches(&e, &c));
    }

    #[test]
    fn test_relevance_orders_tag_match_first() {
        let now = Utc::now();
        let c = QueryCriteria::with_tags(["a", "b"]);

        let both = entry(1, &["a", "b"], 10, Layer::Working);
        let one = entry(2, &["a"], 100, Layer::Working);

        // Two matched tags beat any importance advantage
        assert!(relevance(&both, &c, now) > relevance(&one, &c, now));
    }

    #[test]
    fn test_relevance_recency_buckets() {
        let now = Utc::now();
        let c = QueryCriteria::default();

        let mut fresh = entry(1, &["t"], 50, Layer::Working);
        fresh.last_accessed = now;
        let mut stale = entry(2, &["t"], 50, Layer::Working);
        stale.last_accessed = now - Duration::days(60);

        assert_eq!(relevance(&fresh, &c, now) - relevance(&stale, &c, now), 20);
    }
}
