use anyhow::Result;
use dl_common::{DomainRecord, FilterOptions, RowRange};
use rusqlite::types::Value;

use crate::domain::normalize;
use crate::store::LogStore;

/// Parameters for a grouped archive query. Every field narrows the result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupQuery {
    /// Only rows inside this archive range.
    pub range: Option<RowRange>,
    /// Only rows with `from <= ts < to`; `None` is unbounded on that side.
    pub window: Option<(Option<i64>, Option<i64>)>,
    /// Only the group with exactly this key.
    pub matching: Option<String>,
    /// Group by fqdn below this grouping key instead of by grouping key.
    pub parent: Option<String>,
}

impl GroupQuery {
    pub fn in_range(range: RowRange) -> Self {
        Self {
            range: Some(range),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: Option<String>) -> Self {
        self.parent = parent;
        self
    }

    pub fn with_matching(mut self, key: impl Into<String>) -> Self {
        self.matching = Some(key.into());
        self
    }
}

impl LogStore {
    /// Archive rows with `from <= ts < to`, as a row id range.
    pub fn row_range_between(&self, from: Option<i64>, to: Option<i64>) -> Result<Option<RowRange>> {
        self.with_conn(|conn| {
            let (start, end): (Option<i64>, Option<i64>) = conn.query_row(
                "SELECT MIN(id), MAX(id) FROM query_log WHERE ts >= ?1 AND ts < ?2",
                rusqlite::params![from.unwrap_or(i64::MIN), to.unwrap_or(i64::MAX)],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(start.zip(end).and_then(|(s, e)| RowRange::new(s, e)))
        })
    }

    /// Count, blocked count and latest timestamp per group.
    pub fn grouped_by_domain(&self, query: &GroupQuery) -> Result<Vec<DomainRecord>> {
        let key = if query.parent.is_some() { "l.fqdn" } else { "l.domain" };

        let mut conditions: Vec<String> = Vec::new();
        let mut params: Vec<Value> = Vec::new();

        if let Some(range) = query.range {
            params.push(Value::Integer(range.start));
            params.push(Value::Integer(range.end));
            conditions.push(format!("l.id BETWEEN ?{} AND ?{}", params.len() - 1, params.len()));
        }
        if let Some((from, to)) = query.window {
            if let Some(from) = from {
                params.push(Value::Integer(from));
                conditions.push(format!("l.ts >= ?{}", params.len()));
            }
            if let Some(to) = to {
                params.push(Value::Integer(to));
                conditions.push(format!("l.ts < ?{}", params.len()));
            }
        }
        if let Some(parent) = &query.parent {
            params.push(Value::Text(normalize(parent)));
            conditions.push(format!("l.domain = ?{}", params.len()));
        }
        if let Some(matching) = &query.matching {
            params.push(Value::Text(normalize(matching)));
            conditions.push(format!("{} = ?{}", key, params.len()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let sql = format!(
            "SELECT
                 {key} AS k,
                 COUNT(*) AS total,
                 COALESCE(SUM(l.blocked), 0) AS blocked,
                 MAX(l.ts) AS last_ts,
                 f.options
             FROM query_log l
             LEFT JOIN domain_filter f ON f.domain = {key}
             {where_clause}
             GROUP BY k
             ORDER BY k"
        );

        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(params), |row| {
                Ok(DomainRecord {
                    domain: row.get(0)?,
                    total: row.get(1)?,
                    blocked: row.get(2)?,
                    last_modified: row.get(3)?,
                    options: row.get::<_, Option<i64>>(4)?.map(FilterOptions::from_bits),
                })
            })?;

            let mut records = Vec::new();
            for row in rows {
                records.push(row?);
            }
            Ok(records)
        })
    }

    /// Delete logged queries for `domain` from buffer and archive.
    ///
    /// With `strict` only the exact name matches, otherwise dot-delimited
    /// subdomains match too. `since` keeps rows older than that timestamp.
    pub fn delete_matching(&self, domain: &str, strict: bool, since: Option<i64>) -> Result<usize> {
        let domain = normalize(domain);
        let suffix = format!(".{}", domain);
        let since = since.unwrap_or(i64::MIN);

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut deleted = 0;
            for table in ["query_log", "query_buffer"] {
                deleted += tx.execute(
                    &format!(
                        "DELETE FROM {table}
                         WHERE (fqdn = ?1 OR (?2 = 0 AND substr(fqdn, -length(?3)) = ?3))
                           AND ts >= ?4"
                    ),
                    rusqlite::params![domain, strict as i32, suffix, since],
                )?;
            }
            tx.commit()?;
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(rows: &[(&str, bool, i64)]) -> LogStore {
        let store = LogStore::open_in_memory().unwrap();
        for (fqdn, blocked, ts) in rows {
            store.append_at(fqdn, *blocked, *ts).unwrap();
        }
        store.persist().unwrap();
        store
    }

    #[test]
    fn test_row_range_between() {
        let store = store_with(&[
            ("a.com", false, 10),
            ("b.com", false, 20),
            ("c.com", false, 30),
            ("d.com", false, 40),
        ]);
        assert_eq!(store.row_range_between(Some(15), Some(25)).unwrap(), RowRange::new(2, 2));
        assert_eq!(store.row_range_between(Some(20), Some(40)).unwrap(), RowRange::new(2, 3));
        assert_eq!(store.row_range_between(None, Some(25)).unwrap(), RowRange::new(1, 2));
        assert_eq!(store.row_range_between(Some(25), None).unwrap(), RowRange::new(3, 4));
        assert_eq!(store.row_range_between(None, None).unwrap(), RowRange::new(1, 4));
        assert_eq!(store.row_range_between(Some(41), None).unwrap(), None);
    }

    #[test]
    fn test_grouped_by_domain() {
        let store = store_with(&[
            ("a.com", false, 1),
            ("a.com", false, 2),
            ("www.a.com", false, 3),
            ("b.com", true, 4),
        ]);

        let groups = store.grouped_by_domain(&GroupQuery::default()).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].domain, "a.com");
        assert_eq!((groups[0].total, groups[0].blocked, groups[0].last_modified), (3, 0, 3));
        assert_eq!(groups[1].domain, "b.com");
        assert_eq!((groups[1].total, groups[1].blocked), (1, 1));

        let sub = store
            .grouped_by_domain(&GroupQuery::default().with_parent(Some("a.com".into())))
            .unwrap();
        let names: Vec<&str> = sub.iter().map(|r| r.domain.as_str()).collect();
        assert_eq!(names, vec!["a.com", "www.a.com"]);
        assert_eq!(sub[0].total, 2);
    }

    #[test]
    fn test_grouped_restrictions() {
        let store = store_with(&[
            ("a.com", false, 10),
            ("b.com", false, 20),
            ("a.com", true, 30),
        ]);

        let in_range = store
            .grouped_by_domain(&GroupQuery::in_range(RowRange::new(2, 3).unwrap()))
            .unwrap();
        assert_eq!(in_range.len(), 2);
        assert_eq!((in_range[0].total, in_range[0].blocked), (1, 1));

        let windowed = store
            .grouped_by_domain(&GroupQuery {
                window: Some((Some(15), None)),
                ..GroupQuery::default()
            })
            .unwrap();
        assert_eq!(windowed.iter().map(|r| r.total).sum::<i32>(), 2);

        let matching = store
            .grouped_by_domain(&GroupQuery::default().with_matching("A.com"))
            .unwrap();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].total, 2);
    }

    #[test]
    fn test_grouped_joins_filter_options() {
        let store = store_with(&[("a.com", false, 1), ("b.com", false, 2)]);
        store.set_filter("b.com", Some(FilterOptions::IGNORED)).unwrap();

        let groups = store.grouped_by_domain(&GroupQuery::default()).unwrap();
        assert_eq!(groups[0].options, None);
        assert_eq!(groups[1].options, Some(FilterOptions::IGNORED));
    }

    #[test]
    fn test_delete_matching() {
        let store = store_with(&[
            ("a.com", false, 10),
            ("x.a.com", false, 20),
            ("xa.com", false, 30),
            ("a.com", false, 40),
        ]);
        store.append_at("y.a.com", false, 50).unwrap();

        assert_eq!(store.delete_matching("a.com", true, Some(35)).unwrap(), 1);
        assert_eq!(store.delete_matching("a.com", false, None).unwrap(), 3);
        assert_eq!(store.archive_len().unwrap(), 1);
        assert_eq!(store.buffer_len().unwrap(), 0);
        assert_eq!(store.delete_matching("a.com", false, None).unwrap(), 0);
    }
}
