//! Shared `find` execution.
//!
//! Backends expose a [`NativeScan`]: compile a filter, then read a window
//! of natively filtered rows in a deterministic order. [`execute_find`]
//! turns that into pages, applying the residual filter in memory and
//! encoding the next native offset as the continuation token.

use std::cmp::Ordering;

use async_trait::async_trait;

use crate::error::StorageResult;
use crate::expr::eval::sort_order;
use crate::expr::Expression;
use crate::query::{CompiledQuery, ContinuationToken, FindResult, OrderBy, Query, SortDirection};

use super::config::StoreConfig;
use super::object::StoredObject;

/// Native filtered reads, in the order required for stable pagination.
#[async_trait]
pub trait NativeScan: Send + Sync {
    /// Backend-native filter type.
    type Filter: Send + Sync;

    /// Compiles a filter for this backend.
    fn compile_filter(&self, filter: &Expression) -> StorageResult<CompiledQuery<Self::Filter>>;

    /// Returns up to `limit` visible rows matching `filter`, skipping the
    /// first `offset`, ordered by `order` and then by id ascending.
    async fn scan(
        &self,
        filter: &Self::Filter,
        order: &[OrderBy],
        offset: u64,
        limit: u64,
    ) -> StorageResult<Vec<StoredObject>>;
}

/// Runs a query page over a [`NativeScan`].
pub async fn execute_find<S>(
    scanner: &S,
    config: &StoreConfig,
    query: &Query,
) -> StorageResult<FindResult>
where
    S: NativeScan + ?Sized,
{
    let compiled = scanner.compile_filter(&query.filter)?;
    let limit = u64::from(config.page_size(query.limit));
    let mut offset = match &query.continuation_token {
        Some(token) => ContinuationToken::decode(token)?.offset(),
        None => 0,
    };

    if !compiled.residual_applied() {
        let mut rows = scanner
            .scan(&compiled.native, &query.order_by, offset, limit + 1)
            .await?;
        let more = rows.len() as u64 > limit;
        rows.truncate(limit as usize);
        return Ok(FindResult {
            results: rows,
            continuation_token: more.then(|| ContinuationToken::new(offset + limit).encode()),
            residual_applied: false,
        });
    }

    let batch = u64::from(config.scan_batch_size).max(limit);
    let mut results = Vec::new();
    loop {
        let rows = scanner
            .scan(&compiled.native, &query.order_by, offset, batch)
            .await?;
        let fetched = rows.len() as u64;
        for row in rows {
            offset += 1;
            if !compiled.accepts(row.content()) {
                continue;
            }
            results.push(row);
            if results.len() as u64 == limit {
                return Ok(FindResult {
                    results,
                    continuation_token: Some(ContinuationToken::new(offset).encode()),
                    residual_applied: true,
                });
            }
        }
        if fetched < batch {
            return Ok(FindResult {
                results,
                continuation_token: None,
                residual_applied: true,
            });
        }
    }
}

/// Compares two objects by `order`, then by id.
pub fn compare_objects(a: &StoredObject, b: &StoredObject, order: &[OrderBy]) -> Ordering {
    for clause in order {
        let ordering = sort_order(a.resolve(&clause.path), b.resolve(&clause.path));
        let ordering = match clause.direction {
            SortDirection::Ascending => ordering,
            SortDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    a.id().cmp(b.id())
}

/// Sorts, skips and truncates rows that were filtered in memory.
pub(crate) fn window(
    mut rows: Vec<StoredObject>,
    order: &[OrderBy],
    offset: u64,
    limit: u64,
) -> Vec<StoredObject> {
    rows.sort_by(|a, b| compare_objects(a, b, order));
    rows.into_iter()
        .skip(usize::try_from(offset).unwrap_or(usize::MAX))
        .take(usize::try_from(limit).unwrap_or(usize::MAX))
        .collect()
}
