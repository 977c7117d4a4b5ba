use std::collections::HashMap;

use anyhow::Result;
use dl_common::FilterOptions;
use tracing::info;

use crate::domain::normalize;
use crate::store::LogStore;

impl LogStore {
    /// Every domain with filter options.
    pub fn load_filters(&self) -> Result<HashMap<String, FilterOptions>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT domain, options FROM domain_filter")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, FilterOptions::from_bits(row.get(1)?)))
            })?;

            let mut filters = HashMap::new();
            for row in rows {
                let (domain, options) = row?;
                filters.insert(domain, options);
            }
            Ok(filters)
        })
    }

    /// Set the options of one domain. `None` or empty options remove the row.
    pub fn set_filter(&self, domain: &str, options: Option<FilterOptions>) -> Result<()> {
        let domain = normalize(domain);
        self.with_conn(|conn| {
            match options.filter(|o| !o.is_empty()) {
                Some(options) => conn.execute(
                    "INSERT OR REPLACE INTO domain_filter (domain, options) VALUES (?1, ?2)",
                    rusqlite::params![domain, options.bits()],
                )?,
                None => conn.execute(
                    "DELETE FROM domain_filter WHERE domain = ?1",
                    rusqlite::params![domain],
                )?,
            };
            Ok(())
        })
    }

    /// Add `options` to many domains in one transaction, keeping the flags
    /// they already carry.
    pub fn add_filters_bulk<'a, I>(&self, domains: I, options: FilterOptions) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut count = 0;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO domain_filter (domain, options) VALUES (?1, ?2)
                     ON CONFLICT(domain) DO UPDATE SET options = options | excluded.options",
                )?;
                for domain in domains {
                    count += stmt.execute(rusqlite::params![normalize(domain), options.bits()])?;
                }
            }
            tx.commit()?;
            info!("Applied {} to {} filter entries", options, count);
            Ok(count)
        })
    }
}
