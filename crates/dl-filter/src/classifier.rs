use std::sync::Arc;

use anyhow::Result;
use arc_swap::ArcSwap;
use dl_common::FilterOptions;
use dl_store::{LogStore, QueryLogger};
use tracing::{debug, info};

use crate::matcher::DomainMatcher;

/// Real-time entry point for the DNS hook.
///
/// Holds the only live `DomainMatcher`. Filter changes rebuild a fresh
/// snapshot and swap it in whole, so a lookup racing a rebuild sees either
/// the old or the new list.
pub struct QueryClassifier {
    store: Arc<LogStore>,
    matcher: ArcSwap<DomainMatcher>,
    logger: Option<QueryLogger>,
}

impl QueryClassifier {
    /// Build the first snapshot from the filter table.
    pub fn new(store: Arc<LogStore>, logger: Option<QueryLogger>) -> Result<Self> {
        let classifier = Self {
            store,
            matcher: ArcSwap::from_pointee(DomainMatcher::new()),
            logger,
        };
        classifier.reload()?;
        Ok(classifier)
    }

    /// Decide whether `domain` is blocked and queue it for the query log.
    /// Domains whose filter entry is marked ignored are never logged.
    pub fn process_query(&self, domain: &str) -> bool {
        let options = self.matcher.load().lookup(domain).unwrap_or_default();
        let blocked = options.contains(FilterOptions::BLOCKED);

        if let Some(logger) = &self.logger {
            if !options.contains(FilterOptions::IGNORED) {
                logger.log(domain, blocked);
            }
        }
        blocked
    }

    /// Options applying to `domain` without logging anything.
    pub fn lookup(&self, domain: &str) -> Option<FilterOptions> {
        self.matcher.load().lookup(domain)
    }

    /// Current snapshot; stays valid even if the list changes afterwards.
    pub fn snapshot(&self) -> Arc<DomainMatcher> {
        self.matcher.load_full()
    }

    /// Persist options for `domain` (`None` removes it) and swap in a
    /// rebuilt matcher.
    pub fn set_filter(&self, domain: &str, options: Option<FilterOptions>) -> Result<()> {
        self.store.set_filter(domain, options)?;
        self.reload()
    }

    /// Mark many domains blocked in one go, e.g. after a list import.
    pub fn block_all<'a, I>(&self, domains: I) -> Result<usize>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let count = self.store.add_filters_bulk(domains, FilterOptions::BLOCKED)?;
        self.reload()?;
        Ok(count)
    }

    /// Rebuild the matcher from the filter table.
    pub fn reload(&self) -> Result<()> {
        let filters = self.store.load_filters()?;
        let matcher = DomainMatcher::build(filters);
        info!("Domain matcher rebuilt with {} entries", matcher.len());
        self.matcher.store(Arc::new(matcher));
        debug!("Domain matcher swapped");
        Ok(())
    }
}
