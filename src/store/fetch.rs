//! Lazy, restartable fetch results

use std::ops::Bound;
use std::sync::Arc;

use super::memory::Table;
use super::Rows;
use crate::query::Predicate;
use crate::schema::{Entity, PrimaryKey, Row};

/// Records of one entity matching a restriction.
///
/// Nothing is read until iteration starts. Every call to
/// [`iter`](Self::iter) snapshots the table as it is at that moment, so a
/// `Fetch` can be iterated again to observe later writes, while a running
/// iteration never does. Rows come out in primary-key order.
///
/// A snapshot covers one table. A cascading delete publishes its changes
/// to every affected table at once, so a table read after another never
/// shows the older state.
pub struct Fetch {
    table: Arc<Table>,
    predicate: Predicate,
}

impl std::fmt::Debug for Fetch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetch")
            .field("entity", &self.table.entity().qualified_name())
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl Fetch {
    pub(crate) const fn new(table: Arc<Table>, predicate: Predicate) -> Self {
        Self { table, predicate }
    }

    /// Entity being fetched.
    #[must_use]
    pub fn entity(&self) -> &Arc<Entity> {
        self.table.entity()
    }

    /// Start a new pass over the current table state.
    #[must_use]
    pub fn iter(&self) -> FetchIter<'_> {
        FetchIter {
            rows: self.table.snapshot(),
            predicate: &self.predicate,
            cursor: None,
        }
    }

    /// Collect the matching rows.
    #[must_use]
    pub fn to_vec(&self) -> Vec<Row> {
        self.iter().collect()
    }

    /// Primary keys of the matching rows.
    #[must_use]
    pub fn keys(&self) -> Vec<PrimaryKey> {
        let entity = self.entity();
        self.iter()
            .filter_map(|row| entity.key_of(&row).ok())
            .collect()
    }

    /// Number of matching rows right now.
    #[must_use]
    pub fn count(&self) -> usize {
        self.iter().count()
    }

    /// Whether no row matches right now.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// First matching row in key order.
    #[must_use]
    pub fn first(&self) -> Option<Row> {
        self.iter().next()
    }
}

impl<'a> IntoIterator for &'a Fetch {
    type Item = Row;
    type IntoIter = FetchIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// One pass over a table snapshot.
pub struct FetchIter<'a> {
    rows: Arc<Rows>,
    predicate: &'a Predicate,
    cursor: Option<PrimaryKey>,
}

impl Iterator for FetchIter<'_> {
    type Item = Row;

    fn next(&mut self) -> Option<Row> {
        let lower = self
            .cursor
            .clone()
            .map_or(Bound::Unbounded, Bound::Excluded);
        let mut found = None;
        for (key, row) in self.rows.range((lower, Bound::Unbounded)) {
            if self.predicate.matches(row) {
                found = Some((key.clone(), row.clone()));
                break;
            }
            // Skipped rows still advance the cursor.
            self.cursor = Some(key.clone());
        }
        match found {
            Some((key, row)) => {
                self.cursor = Some(key);
                Some(row)
            }
            None => {
                self.cursor = self.rows.keys().next_back().cloned();
                None
            }
        }
    }
}
