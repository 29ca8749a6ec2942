//! Read queries over a collection.

use crate::key::IndexValue;
use crate::store::Document;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    /// Smallest first.
    #[default]
    Ascending,
    /// Largest first.
    Descending,
}

type Predicate = Arc<dyn Fn(&Document) -> bool + Send + Sync>;

/// Options for [`LocalStore::get_all`](crate::LocalStore::get_all).
///
/// Stages run in this order: index lookup (or full scan in key order),
/// predicate filter, sort, offset, limit.
#[derive(Clone, Default)]
pub struct Query {
    pub(crate) index: Option<(String, IndexValue)>,
    pub(crate) filter: Option<Predicate>,
    pub(crate) sort: Option<(String, SortDirection)>,
    pub(crate) offset: usize,
    pub(crate) limit: Option<usize>,
}

impl Query {
    /// A query returning every record in primary-key order.
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts results to records whose indexed field equals `value`.
    #[must_use]
    pub fn by_index(mut self, index: impl Into<String>, value: Value) -> Self {
        self.index = Some((index.into(), IndexValue::from_value(&value)));
        self
    }

    /// Keeps only records matching the predicate.
    #[must_use]
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(predicate));
        self
    }

    /// Sorts by a top-level field. Records missing the field sort first.
    #[must_use]
    pub fn sort_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.sort = Some((field.into(), direction));
        self
    }

    /// Skips the first `offset` results.
    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Returns at most `limit` results.
    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Applies filter, sort and pagination to candidate records.
    pub(crate) fn finish(&self, mut records: Vec<Document>) -> Vec<Document> {
        if let Some(predicate) = &self.filter {
            records.retain(|r| predicate(r));
        }

        if let Some((field, direction)) = &self.sort {
            // Stable, so ties keep primary-key order.
            records.sort_by(|a, b| {
                let ordering = IndexValue::from_field(a.get(field))
                    .cmp(&IndexValue::from_field(b.get(field)));
                match direction {
                    SortDirection::Ascending => ordering,
                    SortDirection::Descending => ordering.reverse(),
                }
            });
        }

        let iter = records.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("index", &self.index)
            .field("filter", &self.filter.is_some())
            .field("sort", &self.sort)
            .field("offset", &self.offset)
            .field("limit", &self.limit)
            .finish()
    }
}
