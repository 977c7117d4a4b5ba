use dl_common::FilterOptions;

/// Immutable snapshot of the domain filter list.
///
/// Domains are stored character-reversed and sorted, so "is a subdomain of"
/// turns into "has a dotted prefix" and a lookup is a binary search instead
/// of a walk over every parent label in a hash set.
#[derive(Debug, Clone, Default)]
pub struct DomainMatcher {
    keys: Vec<String>,
    options: Vec<FilterOptions>,
}

fn reversed(domain: &str) -> String {
    domain
        .trim()
        .trim_end_matches('.')
        .chars()
        .rev()
        .flat_map(char::to_lowercase)
        .collect()
}

impl DomainMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from `(domain, options)` pairs. Duplicate domains
    /// have their options combined.
    pub fn build<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, FilterOptions)>,
        S: AsRef<str>,
    {
        let mut pairs: Vec<(String, FilterOptions)> = entries
            .into_iter()
            .map(|(domain, opts)| (reversed(domain.as_ref()), opts))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut keys: Vec<String> = Vec::with_capacity(pairs.len());
        let mut options: Vec<FilterOptions> = Vec::with_capacity(pairs.len());
        for (key, opts) in pairs {
            if keys.last() == Some(&key) {
                if let Some(last) = options.last_mut() {
                    *last |= opts;
                }
            } else {
                keys.push(key);
                options.push(opts);
            }
        }

        debug_assert!(keys.is_sorted());
        Self { keys, options }
    }

    /// Index of the entry matching `domain` exactly or as a parent domain.
    /// The most specific entry wins.
    pub fn match_index(&self, domain: &str) -> Option<usize> {
        let rev = reversed(domain);
        if rev.is_empty() {
            return None;
        }

        let lo = match self.keys.binary_search_by(|k| k.as_str().cmp(&rev)) {
            Ok(i) => return Some(i),
            Err(lo) => lo,
        };

        // The closest smaller key is the deepest parent when it is one at all.
        if lo > 0 && is_dotted_prefix(&self.keys[lo - 1], &rev) {
            return Some(lo - 1);
        }

        // A more specific sibling entry (b.ads.example.com when asking for
        // x.ads.example.com) can sit between the query and its parent.
        // Probe each parent label explicitly in that case.
        if lo > 0 && shares_label(&self.keys[lo - 1], &rev) {
            let mut parent = rev.as_str();
            while let Some(cut) = parent.rfind('.') {
                parent = &parent[..cut];
                if let Ok(i) = self.keys.binary_search_by(|k| k.as_str().cmp(parent)) {
                    return Some(i);
                }
            }
        }

        None
    }

    /// Filter options applying to `domain`, if any entry matches.
    pub fn lookup(&self, domain: &str) -> Option<FilterOptions> {
        self.match_index(domain).map(|i| self.options[i])
    }

    /// The (un-reversed) domain stored at `index`.
    pub fn domain_at(&self, index: usize) -> Option<String> {
        self.keys.get(index).map(|k| k.chars().rev().collect())
    }

    pub fn options_at(&self, index: usize) -> Option<FilterOptions> {
        self.options.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// `key` followed by a dot is a prefix of `rev`.
fn is_dotted_prefix(key: &str, rev: &str) -> bool {
    rev.len() > key.len() && rev.starts_with(key) && rev.as_bytes()[key.len()] == b'.'
}

/// `key` starts with the first label of `rev` (the TLD). Every key sorting
/// between a parent of `rev` and `rev` itself does, including ones that
/// continue the label (my-zip after zip).
fn shares_label(key: &str, rev: &str) -> bool {
    match rev.find('.') {
        Some(dot) => key.starts_with(&rev[..dot]),
        None => false,
    }
}
