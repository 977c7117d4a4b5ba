use anyhow::Result;
use dl_common::{DomainRecord, RowRange};
use dl_store::{GroupQuery, LogStore};
use tracing::warn;

/// Persistent log as seen by the coordinator and its views.
///
/// Query failures are soft: they are logged and reported as "no data".
/// Only `prune` and `reclaim` surface their errors, so that retention can
/// retry them.
pub trait LogArchive: Send + Sync + 'static {
    /// Drain the write buffer into the archive.
    fn persist(&self) -> Option<RowRange>;

    /// Rows with `from <= ts < to`.
    fn row_range_between(&self, from: Option<i64>, to: Option<i64>) -> Option<RowRange>;

    fn grouped_by_domain(&self, query: &GroupQuery) -> Vec<DomainRecord>;

    /// Number of rows deleted.
    fn delete_matching(&self, domain: &str, strict: bool, since: Option<i64>) -> usize;

    fn vacuum(&self);

    /// Delete archive rows older than `cutoff`.
    fn prune(&self, cutoff: i64) -> Result<usize>;

    /// Reclaim space after `prune`. Unlike `vacuum`, failures are returned.
    fn reclaim(&self) -> Result<()>;
}

fn soft<T: Default>(what: &str, result: Result<T>) -> T {
    result.unwrap_or_else(|e| {
        warn!("Query log {} failed: {:#}", what, e);
        T::default()
    })
}

impl LogArchive for LogStore {
    fn persist(&self) -> Option<RowRange> {
        soft("persist", LogStore::persist(self))
    }

    fn row_range_between(&self, from: Option<i64>, to: Option<i64>) -> Option<RowRange> {
        soft("range lookup", LogStore::row_range_between(self, from, to))
    }

    fn grouped_by_domain(&self, query: &GroupQuery) -> Vec<DomainRecord> {
        soft("grouping", LogStore::grouped_by_domain(self, query))
    }

    fn delete_matching(&self, domain: &str, strict: bool, since: Option<i64>) -> usize {
        soft("delete", LogStore::delete_matching(self, domain, strict, since))
    }

    fn vacuum(&self) {
        soft("vacuum", LogStore::vacuum(self))
    }

    fn prune(&self, cutoff: i64) -> Result<usize> {
        self.delete_older_than(cutoff)
    }

    fn reclaim(&self) -> Result<()> {
        LogStore::vacuum(self)
    }
}
